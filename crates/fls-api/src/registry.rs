//! Client/endpoint registry.
//!
//! A single JSON document on disk (`clientes_api.json`) holds every client
//! profile plus which one is active. The dispatch engine reads the active
//! profile for endpoints, credentials and mapping rules. Files written by
//! earlier releases (flat `endpoint_motorista`/`endpoint_afastamento`
//! fields) are migrated on read.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::client::ApiCredentials;

pub const REGISTRY_FILE: &str = "clientes_api.json";

pub const ENDPOINT_KIND_DRIVERS: &str = "motoristas";
pub const ENDPOINT_KIND_LEAVES: &str = "afastamentos";

fn default_true() -> bool {
    true
}

fn default_vendor() -> String {
    "ATS_Log".to_string()
}

fn default_timeout() -> f64 {
    30.0
}

/// One de-para rule. Field names are the wire format of existing registry
/// files; the English aliases accepted on read come from hand-edited files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingRule {
    #[serde(default, rename = "nome", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "origem", alias = "source", alias = "from")]
    pub source: String,
    #[serde(default, rename = "destino", alias = "target", alias = "to")]
    pub target: String,
    #[serde(default, rename = "obrigatorio", alias = "required")]
    pub required: bool,
    #[serde(default = "default_true", rename = "ativo", alias = "enabled")]
    pub active: bool,
    #[serde(
        default,
        rename = "padrao",
        alias = "default",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Value>,
    #[serde(
        default,
        rename = "transformacao",
        alias = "transform",
        skip_serializing_if = "String::is_empty"
    )]
    pub transform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "tipo")]
    pub kind: String,
    #[serde(default, rename = "endpoint")]
    pub path: String,
    #[serde(default, rename = "tabela_destino")]
    pub target_table: String,
    #[serde(default = "default_true", rename = "ativo")]
    pub active: bool,
    #[serde(default, rename = "de_para")]
    pub rules: Vec<MappingRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "nome")]
    pub name: String,
    #[serde(default = "default_vendor", rename = "fornecedor")]
    pub vendor: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub login_url: String,
    #[serde(default, rename = "usuario")]
    pub user: String,
    #[serde(default, rename = "senha")]
    pub password: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ClientProfile {
    pub fn credentials(&self) -> ApiCredentials {
        ApiCredentials {
            login_url: self.login_url.clone(),
            base_url: self.base_url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            timeout_seconds: self.timeout_seconds,
        }
    }

    /// First active endpoint of the given kind.
    pub fn endpoint(&self, kind: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.active && e.kind.eq_ignore_ascii_case(kind))
    }
}

/// Connection/endpoint defaults used when building the fallback profile and
/// when migrating legacy documents.
#[derive(Debug, Clone)]
pub struct RegistryDefaults {
    pub base_url: String,
    pub login_url: String,
    pub user: String,
    pub password: String,
    pub timeout_seconds: f64,
    pub driver_endpoint: String,
    pub leave_endpoint: String,
    pub driver_table: String,
    pub leave_table: String,
}

impl RegistryDefaults {
    pub fn from_settings(settings: &fls_config::Settings) -> Self {
        RegistryDefaults {
            base_url: settings.api_base_url.clone(),
            login_url: settings.api_login_url.clone(),
            user: settings.api_user.clone(),
            password: settings.api_pass.clone(),
            timeout_seconds: settings.api_timeout_seconds,
            driver_endpoint: settings.api_driver_endpoint.clone(),
            leave_endpoint: settings.api_leave_endpoint.clone(),
            driver_table: settings.target_driver_table.clone(),
            leave_table: settings.target_leave_table.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    active_id: String,
    #[serde(default)]
    items: Vec<Value>,
}

pub struct ClientRegistry {
    path: PathBuf,
    defaults: RegistryDefaults,
    write_lock: Mutex<()>,
}

impl ClientRegistry {
    pub fn new(path: impl AsRef<Path>, defaults: RegistryDefaults) -> Self {
        ClientRegistry {
            path: path.as_ref().to_path_buf(),
            defaults,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list_profiles(&self) -> Vec<ClientProfile> {
        self.read_document()
            .items
            .iter()
            .filter_map(|raw| self.profile_from_value(raw))
            .collect()
    }

    pub fn active_id(&self) -> Option<String> {
        let id = self.read_document().active_id.trim().to_string();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    pub fn active_profile(&self) -> Option<ClientProfile> {
        let id = self.active_id()?;
        self.list_profiles().into_iter().find(|p| p.id == id)
    }

    /// Inserts or replaces a profile. A blank id gets a fresh uuid; the
    /// first profile ever stored becomes active.
    pub fn upsert(&self, mut profile: ClientProfile) -> Result<ClientProfile> {
        let _guard = self.write_lock.lock().expect("registry lock poisoned");
        let mut doc = self.read_document();

        if profile.id.trim().is_empty() {
            profile.id = Uuid::new_v4().to_string();
        }
        if profile.timeout_seconds <= 0.0 {
            profile.timeout_seconds = self.defaults.timeout_seconds;
        }
        profile.endpoints.retain(|e| {
            !e.path.trim().is_empty() && !e.kind.trim().is_empty()
        });
        for endpoint in &mut profile.endpoints {
            if endpoint.id.trim().is_empty() {
                endpoint.id = Uuid::new_v4().to_string();
            }
        }

        let raw = serde_json::to_value(&profile).context("serialize profile")?;
        let mut replaced = false;
        for slot in doc.items.iter_mut() {
            if slot.get("id").and_then(Value::as_str) == Some(profile.id.as_str()) {
                *slot = raw.clone();
                replaced = true;
                break;
            }
        }
        if !replaced {
            doc.items.push(raw);
        }
        if doc.active_id.trim().is_empty() {
            doc.active_id = profile.id.clone();
        }

        self.write_document(&doc)?;
        Ok(profile)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let key = id.trim();
        if key.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().expect("registry lock poisoned");
        let mut doc = self.read_document();
        doc.items
            .retain(|item| item.get("id").and_then(Value::as_str) != Some(key));
        if doc.active_id == key {
            doc.active_id = doc
                .items
                .first()
                .and_then(|item| item.get("id").and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
        }
        self.write_document(&doc)
    }

    pub fn set_active(&self, id: &str) -> Result<()> {
        let key = id.trim();
        if key.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().expect("registry lock poisoned");
        let mut doc = self.read_document();
        let known = doc
            .items
            .iter()
            .any(|item| item.get("id").and_then(Value::as_str) == Some(key));
        if !known {
            bail!("cliente/API nao encontrado para ativacao: {key:?}");
        }
        doc.active_id = key.to_string();
        self.write_document(&doc)
    }

    /// Profile built from the environment defaults, used when the registry
    /// file has no active entry.
    pub fn default_profile(&self) -> ClientProfile {
        let d = &self.defaults;
        ClientProfile {
            id: String::new(),
            name: "ATS (Padrao .env)".to_string(),
            vendor: default_vendor(),
            base_url: d.base_url.clone(),
            login_url: d.login_url.clone(),
            user: d.user.clone(),
            password: d.password.clone(),
            timeout_seconds: d.timeout_seconds,
            endpoints: vec![
                Endpoint {
                    id: Uuid::new_v4().to_string(),
                    kind: ENDPOINT_KIND_DRIVERS.to_string(),
                    path: d.driver_endpoint.clone(),
                    target_table: d.driver_table.clone(),
                    active: true,
                    rules: default_driver_rules(),
                },
                Endpoint {
                    id: Uuid::new_v4().to_string(),
                    kind: ENDPOINT_KIND_LEAVES.to_string(),
                    path: d.leave_endpoint.clone(),
                    target_table: d.leave_table.clone(),
                    active: true,
                    rules: default_leave_rules(),
                },
            ],
        }
    }

    fn profile_from_value(&self, raw: &Value) -> Option<ClientProfile> {
        let mut profile: ClientProfile = serde_json::from_value(raw.clone()).ok()?;
        if profile.id.trim().is_empty() {
            profile.id = Uuid::new_v4().to_string();
        }

        profile.endpoints.retain(|e| {
            !e.path.trim().is_empty() && !e.kind.trim().is_empty()
        });
        for endpoint in &mut profile.endpoints {
            // Rules without a destination can never assign anything.
            endpoint.rules.retain(|r| !r.target.trim().is_empty());
        }

        // Legacy shape: flat endpoint fields instead of the endpoints list.
        if profile.endpoints.is_empty() {
            let legacy_driver = raw
                .get("endpoint_motorista")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            let legacy_leave = raw
                .get("endpoint_afastamento")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();

            if !legacy_driver.is_empty() {
                profile.endpoints.push(Endpoint {
                    id: Uuid::new_v4().to_string(),
                    kind: ENDPOINT_KIND_DRIVERS.to_string(),
                    path: legacy_driver.to_string(),
                    target_table: self.defaults.driver_table.clone(),
                    active: true,
                    rules: default_driver_rules(),
                });
            }
            if !legacy_leave.is_empty() {
                profile.endpoints.push(Endpoint {
                    id: Uuid::new_v4().to_string(),
                    kind: ENDPOINT_KIND_LEAVES.to_string(),
                    path: legacy_leave.to_string(),
                    target_table: self.defaults.leave_table.clone(),
                    active: true,
                    rules: default_leave_rules(),
                });
            }
        }

        Some(profile)
    }

    fn read_document(&self) -> Document {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Document::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn write_document(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {:?}", parent))?;
        }
        let body = serde_json::to_string_pretty(doc).context("serialize registry")?;
        fs::write(&self.path, body).with_context(|| format!("write {:?}", self.path))?;
        Ok(())
    }
}

fn rule(source: &str, target: &str, required: bool) -> MappingRule {
    MappingRule {
        name: None,
        source: source.to_string(),
        target: target.to_string(),
        required,
        active: true,
        default: None,
        transform: String::new(),
    }
}

fn rule_with_default(source: &str, target: &str, required: bool, default: Value) -> MappingRule {
    MappingRule {
        default: Some(default),
        ..rule(source, target, required)
    }
}

pub fn default_driver_rules() -> Vec<MappingRule> {
    vec![
        rule("payload.nome", "nome", true),
        rule("payload.cpf", "cpf", true),
        rule("payload.datanascimento", "datanascimento", false),
        rule("payload.genero", "genero", false),
        rule_with_default(
            "payload.endereco.rua",
            "endereco.rua",
            false,
            Value::from("NAO INFORMADO"),
        ),
        rule_with_default(
            "payload.endereco.numero",
            "endereco.numero",
            false,
            Value::from("SN"),
        ),
        rule("payload.endereco.complemento", "endereco.complemento", false),
        rule_with_default(
            "payload.endereco.bairro",
            "endereco.bairro",
            false,
            Value::from("NAO INFORMADO"),
        ),
        rule_with_default(
            "payload.endereco.cidade",
            "endereco.cidade",
            true,
            Value::from("NAO INFORMADO"),
        ),
        MappingRule {
            transform: "upper".to_string(),
            ..rule_with_default("payload.endereco.uf", "endereco.uf", true, Value::from("SC"))
        },
        rule_with_default(
            "payload.endereco.cep",
            "endereco.cep",
            false,
            Value::from("00000000"),
        ),
        rule_with_default(
            "payload.endereco.latitude",
            "endereco.latitude",
            false,
            Value::from(0),
        ),
        rule_with_default(
            "payload.endereco.longitude",
            "endereco.longitude",
            false,
            Value::from(0),
        ),
        rule("payload.dataadmissao", "dataadmissao", true),
        MappingRule {
            transform: "str".to_string(),
            ..rule("payload.matricula", "matricula", true)
        },
    ]
}

pub fn default_leave_rules() -> Vec<MappingRule> {
    vec![
        rule("payload.numerodaempresa", "numerodaempresa", false),
        rule("payload.tipodecolaborador", "tipodecolaborador", false),
        rule(
            "payload.numerodeorigemdocolaborador",
            "numerodeorigemdocolaborador",
            false,
        ),
        rule("payload.cpf", "cpf", true),
        rule("payload.descricao", "descricao", true),
        rule("payload.descricaodasituacao", "descricaodasituacao", false),
        rule("payload.datainicio", "datainicio", true),
        rule("payload.dataafastamento", "dataafastamento", false),
        rule("payload.horadoafastamento", "horadoafastamento", false),
        rule("payload.datatermino", "datatermino", false),
        rule("payload.horadotermino", "horadotermino", false),
        rule("payload.situacao", "situacao", false),
        rule("payload.rescisao", "rescisao", false),
    ]
}
