//! Login-URL probing.
//!
//! Installations configure the auth endpoint inconsistently: sometimes the
//! exact login URL, sometimes just the API base, and two known sites swap
//! the service between ports 8087 and 8088. Authentication therefore walks
//! an ordered candidate list until one URL yields a token.

use anyhow::{bail, Result};
use reqwest::Url;
use serde_json::Value;

const LOGIN_PATHS: &[&str] = &[
    "/login",
    "/v1/login",
    "/api/login",
    "/api/v1/login",
    "/auth/login",
    "/v1/auth/login",
];

/// Ports the target product is known to run on; when one is configured the
/// sibling is probed as well. Site-specific, harmless elsewhere.
const ALTERNATE_PORTS: (u16, u16) = (8087, 8088);

fn push_candidate(candidates: &mut Vec<String>, seen: &mut Vec<String>, value: Option<String>) {
    let Some(url) = value else { return };
    let url = url.trim().to_string();
    if url.is_empty() {
        return;
    }
    let key = url.to_lowercase();
    if seen.contains(&key) {
        return;
    }
    seen.push(key);
    candidates.push(url);
}

fn with_path(raw: &str, path: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !url.has_host() {
        return None;
    }
    url.set_path(&format!("/{}", path.trim_start_matches('/')));
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

fn with_port(raw: &str, port: u16, path: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !url.has_host() {
        return None;
    }
    url.set_port(Some(port)).ok()?;
    url.set_path(&format!("/{}", path.trim_start_matches('/')));
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

fn alternate_port(url: &Url) -> Option<u16> {
    match url.port() {
        Some(p) if p == ALTERNATE_PORTS.0 => Some(ALTERNATE_PORTS.1),
        Some(p) if p == ALTERNATE_PORTS.1 => Some(ALTERNATE_PORTS.0),
        _ => None,
    }
}

/// Ordered, de-duplicated login URL candidates for the configured pair.
pub fn build_login_candidates(login_url: &str, base_url: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut seen = Vec::new();

    let login_url = login_url.trim();
    let base_url = base_url.trim();

    if !login_url.is_empty() {
        push_candidate(&mut candidates, &mut seen, Some(login_url.to_string()));
    }

    if !base_url.is_empty() {
        for path in LOGIN_PATHS {
            push_candidate(&mut candidates, &mut seen, with_path(base_url, path));
        }
    }

    if let Ok(parsed) = Url::parse(login_url) {
        let path = match parsed.path() {
            "" | "/" => "/login".to_string(),
            p => p.to_string(),
        };
        if !path.to_lowercase().ends_with("/login") {
            push_candidate(&mut candidates, &mut seen, with_path(login_url, "/login"));
        }
        for alt_path in LOGIN_PATHS {
            if path.eq_ignore_ascii_case(alt_path) {
                continue;
            }
            push_candidate(&mut candidates, &mut seen, with_path(login_url, alt_path));
        }

        if let Some(alt) = alternate_port(&parsed) {
            for alt_path in LOGIN_PATHS {
                push_candidate(&mut candidates, &mut seen, with_port(login_url, alt, alt_path));
            }
        }
    }

    if let Ok(parsed) = Url::parse(base_url) {
        if let Some(alt) = alternate_port(&parsed) {
            for alt_path in LOGIN_PATHS {
                push_candidate(&mut candidates, &mut seen, with_port(base_url, alt, alt_path));
            }
        }
    }

    candidates
}

/// First non-empty token among the key names different vendors use.
pub fn extract_token(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    for key in ["token", "access_token", "jwt", "id_token"] {
        if let Some(v) = obj.get(key) {
            let text = match v {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Probes the candidate list and returns the first token obtained.
pub async fn login(
    http: &reqwest::Client,
    login_url: &str,
    base_url: &str,
    user: &str,
    password: &str,
) -> Result<String> {
    if login_url.trim().is_empty() && base_url.trim().is_empty() {
        bail!("API_LOGIN_URL ou API_BASE_URL precisa estar configurada");
    }
    if user.trim().is_empty() || password.trim().is_empty() {
        bail!("API_USER/API_PASS nao configurados");
    }

    let candidates = build_login_candidates(login_url, base_url);
    if candidates.is_empty() {
        bail!("nao foi possivel montar URL de login para autenticacao");
    }

    let body = serde_json::json!({ "user": user, "pass": password });
    let mut failures: Vec<String> = Vec::new();

    for candidate in &candidates {
        let response = match http.post(candidate).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                failures.push(format!("{candidate} -> erro de conexao: {e}"));
                continue;
            }
        };

        let status = response.status().as_u16();
        match status {
            404 | 405 => {
                failures.push(format!("{candidate} -> HTTP {status}"));
                continue;
            }
            401 | 403 => {
                failures.push(format!("{candidate} -> HTTP {status} (credenciais rejeitadas)"));
                continue;
            }
            s if s >= 400 => {
                failures.push(format!("{candidate} -> HTTP {s}"));
                continue;
            }
            _ => {}
        }

        let payload: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => {
                failures.push(format!("{candidate} -> resposta nao-JSON (HTTP {status})"));
                continue;
            }
        };

        match extract_token(&payload) {
            Some(token) => {
                tracing::debug!(url = %candidate, "autenticado na API");
                return Ok(token);
            }
            None => failures.push(format!("{candidate} -> resposta sem token")),
        }
    }

    let summary = if failures.is_empty() {
        "sem detalhes".to_string()
    } else {
        failures[..failures.len().min(5)].join(" | ")
    };
    bail!("nao foi possivel autenticar. Tentativas: {summary}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn configured_login_url_comes_first() {
        let c = build_login_candidates("http://api.example:8080/v1/login", "");
        assert_eq!(c[0], "http://api.example:8080/v1/login");
        // variants of the same host follow, never duplicating the original
        assert!(c.iter().any(|u| u.ends_with("/auth/login")));
        assert_eq!(
            c.iter().filter(|u| u.as_str() == c[0].as_str()).count(),
            1
        );
    }

    #[test]
    fn base_url_expands_over_known_paths() {
        let c = build_login_candidates("", "http://api.example");
        assert!(c.contains(&"http://api.example/login".to_string()));
        assert!(c.contains(&"http://api.example/api/v1/login".to_string()));
    }

    #[test]
    fn alternate_port_is_probed_both_ways() {
        let c = build_login_candidates("http://api.example:8087/login", "");
        assert!(c.iter().any(|u| u.contains(":8088/")));

        let c = build_login_candidates("http://api.example:8088/login", "");
        assert!(c.iter().any(|u| u.contains(":8087/")));

        let c = build_login_candidates("http://api.example:9000/login", "");
        assert!(!c.iter().any(|u| u.contains(":8087") || u.contains(":8088")));
    }

    #[test]
    fn token_extraction_tolerates_vendor_key_names() {
        assert_eq!(extract_token(&json!({"token": "abc"})).as_deref(), Some("abc"));
        assert_eq!(
            extract_token(&json!({"access_token": " t "})).as_deref(),
            Some("t")
        );
        assert_eq!(extract_token(&json!({"jwt": "j"})).as_deref(), Some("j"));
        assert_eq!(extract_token(&json!({"id_token": "i"})).as_deref(), Some("i"));
        assert_eq!(extract_token(&json!({"token": ""})), None);
        assert_eq!(extract_token(&json!("texto")), None);
    }
}
