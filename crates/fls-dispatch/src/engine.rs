//! Outbox dispatch engine: sweep expired leases, claim a batch, shape each
//! payload (mapping rules or default enrichment), POST, settle.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use uuid::Uuid;

use fls_api::{ApiClient, ApiResponse, MappingRule};
use fls_db::{DriverOutbox, LeaveOutbox};
use fls_schemas::{ClaimedDriverEvent, ClaimedLeaveEvent, DispatchCycleReport, Settlement};

use crate::mapper;

const RESPONSE_TEXT_LIMIT: usize = 1000;

/// Retry/lease knobs shared by both queues.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub lock_timeout_minutes: i64,
    pub retry_base_seconds: i64,
    pub retry_max_seconds: i64,
}

impl RetryPolicy {
    /// Exponential backoff for the n-th failed attempt (1-based):
    /// `min(retry_max, retry_base * 2^(n-1))`.
    pub fn delay_seconds(&self, attempt: i32) -> i64 {
        let factor = attempt.max(1) - 1;
        let base = self.retry_base_seconds.max(1);
        let delay = match factor {
            f if f >= 63 => i64::MAX,
            f => base.saturating_mul(1i64 << f),
        };
        delay.min(self.retry_max_seconds.max(base))
    }

    /// When the row becomes dispatchable again, or None once attempts are
    /// exhausted (permanent failure).
    pub fn next_retry_at(&self, attempts_after_error: i32) -> Option<DateTime<Utc>> {
        if attempts_after_error >= self.max_attempts {
            return None;
        }
        let delay = self.delay_seconds(attempts_after_error);
        Some(Utc::now() + chrono::Duration::seconds(delay))
    }
}

/// Placeholder values applied when no mapping rules are configured.
#[derive(Debug, Clone)]
pub struct EnrichmentDefaults {
    pub default_city: String,
    pub default_state: String,
    /// Default union block attached to driver payloads missing one; built
    /// only when all four union settings are present.
    pub union: Option<Value>,
}

impl EnrichmentDefaults {
    pub fn from_settings(settings: &fls_config::Settings) -> Self {
        let union = {
            let name = settings.union_name.trim();
            let cnpj = settings.union_cnpj.trim();
            let city = settings.union_city.trim();
            let state = settings.union_state.trim().to_uppercase();
            if !name.is_empty() && !cnpj.is_empty() && !city.is_empty() && !state.is_empty() {
                Some(serde_json::json!({
                    "nome": name,
                    "cnpj": cnpj,
                    "endereco": { "cidade": city, "uf": state }
                }))
            } else {
                None
            }
        };
        EnrichmentDefaults {
            default_city: settings.api_default_city.clone(),
            default_state: settings.api_default_state.clone(),
            union,
        }
    }
}

/// Per-queue configuration: where to POST, how much to claim, and the
/// mapping rules (empty = default enrichment path).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub endpoint: String,
    pub batch_size: i64,
    pub rules: Vec<MappingRule>,
}

struct DriverQueue {
    outbox: DriverOutbox,
    config: QueueConfig,
    source_columns: Vec<String>,
}

struct LeaveQueue {
    outbox: LeaveOutbox,
    config: QueueConfig,
    source_columns: Vec<String>,
}

pub struct DispatchEngine {
    client: ApiClient,
    policy: RetryPolicy,
    defaults: EnrichmentDefaults,
    drivers: Option<DriverQueue>,
    leaves: Option<LeaveQueue>,
}

impl DispatchEngine {
    pub fn new(
        client: ApiClient,
        policy: RetryPolicy,
        defaults: EnrichmentDefaults,
        drivers: Option<(DriverOutbox, QueueConfig)>,
        leaves: Option<(LeaveOutbox, QueueConfig)>,
    ) -> Result<Self> {
        if drivers.is_none() && leaves.is_none() {
            bail!("dispatch engine precisa processar pelo menos uma fila");
        }

        let drivers = match drivers {
            Some((outbox, config)) => {
                outbox.validate_dispatch_columns()?;
                let source_columns = mapper::source_columns(&config.rules);
                Some(DriverQueue {
                    outbox,
                    config,
                    source_columns,
                })
            }
            None => None,
        };
        let leaves = match leaves {
            Some((outbox, config)) => {
                outbox.validate_dispatch_columns()?;
                let source_columns = mapper::source_columns(&config.rules);
                Some(LeaveQueue {
                    outbox,
                    config,
                    source_columns,
                })
            }
            None => None,
        };

        Ok(DispatchEngine {
            client,
            policy,
            defaults,
            drivers,
            leaves,
        })
    }

    pub async fn run_cycle(&self) -> Result<DispatchCycleReport> {
        let mut report = DispatchCycleReport::default();

        if let Some(q) = &self.drivers {
            report.driver_leases_swept = q
                .outbox
                .sweep_expired_leases(self.policy.lock_timeout_minutes)
                .await?;

            let lock_id = Uuid::new_v4().to_string();
            let events = q
                .outbox
                .claim_batch(
                    &lock_id,
                    q.config.batch_size,
                    self.policy.max_attempts,
                    self.policy.lock_timeout_minutes,
                )
                .await?;
            report.drivers_claimed = events.len();

            for ev in &events {
                if self.process_driver(q, ev, &lock_id).await? {
                    report.drivers_succeeded += 1;
                } else {
                    report.drivers_failed += 1;
                }
            }
        }

        if let Some(q) = &self.leaves {
            report.leave_leases_swept = q
                .outbox
                .sweep_expired_leases(self.policy.lock_timeout_minutes)
                .await?;

            let lock_id = Uuid::new_v4().to_string();
            let events = q
                .outbox
                .claim_batch(
                    &lock_id,
                    q.config.batch_size,
                    self.policy.max_attempts,
                    self.policy.lock_timeout_minutes,
                )
                .await?;
            report.leaves_claimed = events.len();

            for ev in &events {
                if self.process_leave(q, ev, &lock_id).await? {
                    report.leaves_succeeded += 1;
                } else {
                    report.leaves_failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Returns Ok(true) when the row settled as DONE. Delivery and shaping
    /// failures settle as ERROR and return Ok(false); only database errors
    /// propagate.
    async fn process_driver(
        &self,
        q: &DriverQueue,
        ev: &ClaimedDriverEvent,
        lock_id: &str,
    ) -> Result<bool> {
        let response = self.shape_and_post_driver(q, ev).await;
        self.settle_driver(q, ev, lock_id, response).await
    }

    async fn shape_and_post_driver(
        &self,
        q: &DriverQueue,
        ev: &ClaimedDriverEvent,
    ) -> Result<ApiResponse> {
        let payload = parse_payload(&ev.payload_json)?;

        let body = if q.config.rules.is_empty() {
            let enriched = self.enrich_driver_payload(payload);
            validate_driver_payload(&enriched)?;
            Value::Object(enriched)
        } else {
            let columns = q
                .outbox
                .fetch_mirror_columns(ev, &q.source_columns)
                .await?;
            let envelope = mapper::build_envelope(&payload, &driver_event_map(ev), &columns);
            mapper::apply_rules(&q.config.rules, &envelope, "motoristas")?
        };

        self.client.post_json(&q.config.endpoint, &body).await
    }

    async fn settle_driver(
        &self,
        q: &DriverQueue,
        ev: &ClaimedDriverEvent,
        lock_id: &str,
        response: Result<ApiResponse>,
    ) -> Result<bool> {
        let (success, outcome) = self.settlement_for(ev.attempts, response);
        let settled = q.outbox.settle(ev, lock_id, success, &outcome).await?;
        if !settled {
            // Another worker took the lease; it owns the row now.
            tracing::debug!(source_id = ev.source_id, "driver lease stolen, skipping settle");
            return Ok(false);
        }
        if !success {
            tracing::warn!(
                source_id = ev.source_id,
                http_status = outcome.http_status,
                error = outcome.last_error.as_deref().unwrap_or(""),
                "driver event failed"
            );
        }
        Ok(success && settled)
    }

    async fn process_leave(
        &self,
        q: &LeaveQueue,
        ev: &ClaimedLeaveEvent,
        lock_id: &str,
    ) -> Result<bool> {
        let response = self.shape_and_post_leave(q, ev).await;
        let (success, outcome) = self.settlement_for(ev.attempts, response);
        let settled = q.outbox.settle(ev, lock_id, success, &outcome).await?;
        if !settled {
            tracing::debug!(
                employee_id = ev.key.employee_id,
                "leave lease stolen, skipping settle"
            );
            return Ok(false);
        }
        if !success {
            tracing::warn!(
                employee_id = ev.key.employee_id,
                leave_date = %ev.key.leave_date,
                http_status = outcome.http_status,
                error = outcome.last_error.as_deref().unwrap_or(""),
                "leave event failed"
            );
        }
        Ok(success && settled)
    }

    async fn shape_and_post_leave(
        &self,
        q: &LeaveQueue,
        ev: &ClaimedLeaveEvent,
    ) -> Result<ApiResponse> {
        let payload = parse_payload(&ev.payload_json)?;

        let body = if q.config.rules.is_empty() {
            validate_leave_payload(&payload)?;
            Value::Object(payload)
        } else {
            let columns = q
                .outbox
                .fetch_mirror_columns(ev, &q.source_columns)
                .await?;
            let envelope = mapper::build_envelope(&payload, &leave_event_map(ev), &columns);
            mapper::apply_rules(&q.config.rules, &envelope, "afastamentos")?
        };

        self.client.post_json(&q.config.endpoint, &body).await
    }

    /// Maps the shaping/POST outcome to a settlement record. Attempts are
    /// the count before this delivery; the backoff uses attempts + 1.
    fn settlement_for(
        &self,
        prior_attempts: i32,
        response: Result<ApiResponse>,
    ) -> (bool, Settlement) {
        match response {
            Ok(resp) if response_indicates_success(&resp) => (
                true,
                Settlement {
                    http_status: Some(i32::from(resp.status)),
                    response_summary: response_summary(&resp),
                    last_error: None,
                    next_retry_at: None,
                },
            ),
            Ok(resp) => (
                false,
                Settlement {
                    http_status: Some(i32::from(resp.status)),
                    response_summary: response_summary(&resp),
                    last_error: limit_text(&response_error_message(&resp)),
                    next_retry_at: self.policy.next_retry_at(prior_attempts + 1),
                },
            ),
            Err(e) => (
                false,
                Settlement {
                    http_status: None,
                    response_summary: None,
                    last_error: limit_text(&format!("{e:#}")),
                    next_retry_at: self.policy.next_retry_at(prior_attempts + 1),
                },
            ),
        }
    }

    /// Address and union placeholders for payloads dispatched without a
    /// mapping profile.
    fn enrich_driver_payload(&self, payload: Map<String, Value>) -> Map<String, Value> {
        let mut driver = payload;

        let mut endereco = match driver.get("endereco") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        self.fill_address_defaults(&mut endereco);
        driver.insert("endereco".to_string(), Value::Object(endereco));

        let has_union = driver
            .get("sindicato")
            .map(|v| !mapper::is_empty_value(v))
            .unwrap_or(false);
        if !has_union {
            if let Some(union) = &self.defaults.union {
                driver.insert("sindicato".to_string(), union.clone());
            }
        }

        if let Some(Value::Object(union)) = driver.get("sindicato").cloned().as_ref() {
            let mut union = union.clone();
            let mut endereco = match union.get("endereco") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            self.fill_address_defaults(&mut endereco);
            union.insert("endereco".to_string(), Value::Object(endereco));
            driver.insert("sindicato".to_string(), Value::Object(union));
        }

        driver
    }

    fn fill_address_defaults(&self, endereco: &mut Map<String, Value>) {
        let cidade = text_field(endereco, "cidade");
        let cidade = if cidade.is_empty() {
            self.defaults.default_city.trim().to_string()
        } else {
            cidade
        };
        endereco.insert("cidade".to_string(), Value::String(cidade));

        let uf = text_field(endereco, "uf");
        let uf = if uf.is_empty() {
            self.defaults.default_state.trim().to_uppercase()
        } else {
            uf.to_uppercase()
        };
        endereco.insert("uf".to_string(), Value::String(uf));
    }

    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = std::time::Instant::now();
            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    swept_m = report.driver_leases_swept,
                    swept_a = report.leave_leases_swept,
                    cap_m = report.drivers_claimed,
                    ok_m = report.drivers_succeeded,
                    err_m = report.drivers_failed,
                    cap_a = report.leaves_claimed,
                    ok_a = report.leaves_succeeded,
                    err_a = report.leaves_failed,
                    "dispatch cycle"
                ),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "dispatch cycle failed"),
            }

            let sleep_for = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("dispatch loop stopped");
    }
}

fn parse_payload(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("PayloadJson invalido")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("PayloadJson precisa representar um objeto JSON"),
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn validate_driver_payload(payload: &Map<String, Value>) -> Result<()> {
    if text_field(payload, "nome").is_empty() {
        bail!("payload de motorista sem nome");
    }
    if text_field(payload, "cpf").is_empty() {
        bail!("payload de motorista sem CPF");
    }
    if text_field(payload, "dataadmissao").is_empty() {
        bail!("payload de motorista sem dataadmissao");
    }
    let Some(Value::Object(endereco)) = payload.get("endereco") else {
        bail!("payload de motorista sem endereco");
    };
    if text_field(endereco, "cidade").is_empty() || text_field(endereco, "uf").is_empty() {
        bail!("endereco do motorista sem cidade/UF");
    }
    Ok(())
}

fn validate_leave_payload(payload: &Map<String, Value>) -> Result<()> {
    if text_field(payload, "cpf").is_empty() {
        bail!("payload de afastamento sem CPF");
    }
    if text_field(payload, "descricao").is_empty() {
        bail!("payload de afastamento sem descricao");
    }
    if text_field(payload, "datainicio").is_empty() {
        bail!("payload de afastamento sem datainicio");
    }
    Ok(())
}

fn driver_event_map(ev: &ClaimedDriverEvent) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("id_de_origem".into(), Value::from(ev.source_id));
    map.insert(
        "numemp".into(),
        ev.company_id.map(Value::from).unwrap_or(Value::Null),
    );
    map.insert("evento_tipo".into(), Value::from(ev.event_type.clone()));
    map.insert(
        "versao_payload".into(),
        Value::from(ev.payload_version.clone()),
    );
    map.insert(
        "hash_payload".into(),
        Value::from(hex::encode(&ev.payload_hash)),
    );
    map.insert("tentativas".into(), Value::from(ev.attempts));
    map
}

fn leave_event_map(ev: &ClaimedLeaveEvent) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("numempresa".into(), Value::from(ev.key.company_id));
    map.insert("tipocolaborador".into(), Value::from(ev.key.employee_type));
    map.insert("numorigem".into(), Value::from(ev.key.employee_id));
    map.insert(
        "dataafastamento".into(),
        Value::from(ev.key.leave_date.format("%Y-%m-%d").to_string()),
    );
    map.insert("situacao".into(), Value::from(ev.key.situation));
    map.insert("evento_tipo".into(), Value::from(ev.event_type.clone()));
    map.insert(
        "versao_payload".into(),
        Value::from(ev.payload_version.clone()),
    );
    map.insert(
        "hash_payload".into(),
        Value::from(hex::encode(&ev.payload_hash)),
    );
    map.insert("tentativas".into(), Value::from(ev.attempts));
    map
}

/// Success contract of the target API: a 2xx whose body is either not a
/// JSON object, has no `id`, or has `id == 0`. A non-zero `id` is a
/// business-level rejection even under HTTP 200.
pub fn response_indicates_success(response: &ApiResponse) -> bool {
    if response.status < 200 || response.status >= 300 {
        return false;
    }
    let Some(Value::Object(data)) = &response.json else {
        return true;
    };
    match data.get("id") {
        None | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.trim() == "0",
        Some(_) => false,
    }
}

pub fn response_error_message(response: &ApiResponse) -> String {
    if let Some(Value::Object(data)) = &response.json {
        let mensagem = data
            .get("mensagem")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if !mensagem.is_empty() {
            return mensagem.to_string();
        }
        if let Some(id) = data.get("id") {
            if !id.is_null() {
                return format!("Retorno API id={id} sem mensagem.");
            }
        }
    }
    if !response.text.is_empty() {
        return response.text.clone();
    }
    format!("HTTP {} sem corpo de resposta.", response.status)
}

fn response_summary(response: &ApiResponse) -> Option<String> {
    if let Some(Value::Object(data)) = &response.json {
        if let Some(mensagem) = data.get("mensagem").and_then(Value::as_str) {
            if !mensagem.trim().is_empty() {
                return limit_text(mensagem);
            }
        }
    }
    if response.text.is_empty() {
        None
    } else {
        limit_text(&response.text)
    }
}

fn limit_text(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(RESPONSE_TEXT_LIMIT).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            lock_timeout_minutes: 15,
            retry_base_seconds: 60,
            retry_max_seconds: 3600,
        }
    }

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status,
            json: serde_json::from_str(body).ok(),
            text: body.trim().to_string(),
        }
    }

    #[test]
    fn backoff_is_geometric_and_capped() {
        let p = policy();
        let delays: Vec<i64> = (1..=8).map(|n| p.delay_seconds(n)).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
        // non-decreasing
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn next_retry_is_null_once_attempts_exhaust() {
        let p = RetryPolicy {
            max_attempts: 3,
            ..policy()
        };
        assert!(p.next_retry_at(1).is_some());
        assert!(p.next_retry_at(2).is_some());
        assert!(p.next_retry_at(3).is_none());
        assert!(p.next_retry_at(4).is_none());
    }

    #[test]
    fn success_predicate_matches_api_contract() {
        // DONE cases
        assert!(response_indicates_success(&response(200, "")));
        assert!(response_indicates_success(&response(
            201,
            r#"{"id":0,"mensagem":"ok"}"#
        )));
        assert!(response_indicates_success(&response(200, r#"{"foo":1}"#)));
        assert!(response_indicates_success(&response(200, r#"{"id":"0"}"#)));
        assert!(response_indicates_success(&response(200, r#"[1,2]"#)));

        // ERROR cases
        assert!(!response_indicates_success(&response(
            200,
            r#"{"id":17,"mensagem":"invalid cpf"}"#
        )));
        assert!(!response_indicates_success(&response(500, "oops")));
        assert!(!response_indicates_success(&response(401, "")));
        assert!(!response_indicates_success(&response(301, "")));
    }

    #[test]
    fn error_message_prefers_mensagem_then_id_then_body() {
        assert_eq!(
            response_error_message(&response(200, r#"{"id":17,"mensagem":"invalid cpf"}"#)),
            "invalid cpf"
        );
        assert_eq!(
            response_error_message(&response(200, r#"{"id":17}"#)),
            "Retorno API id=17 sem mensagem."
        );
        assert_eq!(response_error_message(&response(500, "oops")), "oops");
        assert_eq!(
            response_error_message(&response(502, "")),
            "HTTP 502 sem corpo de resposta."
        );
    }

    #[test]
    fn driver_validation_requires_the_minimum_contract() {
        let ok = json!({
            "nome": "X", "cpf": "1", "dataadmissao": "2024-01-01",
            "endereco": {"cidade": "C", "uf": "SC"}
        });
        assert!(validate_driver_payload(ok.as_object().unwrap()).is_ok());

        let missing_city = json!({
            "nome": "X", "cpf": "1", "dataadmissao": "2024-01-01",
            "endereco": {"cidade": "", "uf": "SC"}
        });
        assert!(validate_driver_payload(missing_city.as_object().unwrap()).is_err());

        let no_address = json!({"nome": "X", "cpf": "1", "dataadmissao": "2024-01-01"});
        assert!(validate_driver_payload(no_address.as_object().unwrap()).is_err());
    }

    #[test]
    fn leave_validation_requires_cpf_description_start() {
        let ok = json!({"cpf": "1", "descricao": "d", "datainicio": "2024-05-10"});
        assert!(validate_leave_payload(ok.as_object().unwrap()).is_ok());

        for missing in ["cpf", "descricao", "datainicio"] {
            let mut bad = ok.clone();
            bad.as_object_mut().unwrap().remove(missing);
            assert!(
                validate_leave_payload(bad.as_object().unwrap()).is_err(),
                "{missing} must be mandatory"
            );
        }
    }

    #[test]
    fn truncation_caps_stored_text() {
        let long = "x".repeat(2000);
        assert_eq!(limit_text(&long).unwrap().len(), RESPONSE_TEXT_LIMIT);
        assert_eq!(limit_text("   "), None);
    }
}
