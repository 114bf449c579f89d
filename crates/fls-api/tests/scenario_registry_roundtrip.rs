//! Scenario: registry persistence, activation and legacy migration.
//!
//! The registry is a single JSON document; these tests exercise the full
//! lifecycle against a temp directory, including documents written by the
//! previous release (flat endpoint fields, no `endpoints` list).

use fls_api::{
    ClientProfile, ClientRegistry, Endpoint, MappingRule, RegistryDefaults,
    ENDPOINT_KIND_DRIVERS, ENDPOINT_KIND_LEAVES,
};

fn defaults() -> RegistryDefaults {
    RegistryDefaults {
        base_url: "http://api.example".into(),
        login_url: "http://api.example/login".into(),
        user: "user".into(),
        password: "pass".into(),
        timeout_seconds: 30.0,
        driver_endpoint: "/v1/motorista".into(),
        leave_endpoint: "/v1/afastamento".into(),
        driver_table: "MotoristaCadastro".into(),
        leave_table: "Afastamento".into(),
    }
}

fn registry_in(dir: &tempfile::TempDir) -> ClientRegistry {
    ClientRegistry::new(dir.path().join("clientes_api.json"), defaults())
}

#[test]
fn upsert_assigns_ids_and_first_profile_becomes_active() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);

    assert!(registry.active_profile().is_none());

    let mut profile = registry.default_profile();
    profile.name = "Cliente A".into();
    let stored = registry.upsert(profile).unwrap();

    assert!(!stored.id.is_empty());
    assert_eq!(registry.active_id().as_deref(), Some(stored.id.as_str()));

    let active = registry.active_profile().expect("active profile");
    assert_eq!(active.name, "Cliente A");
    assert_eq!(active.endpoints.len(), 2);
    assert!(active.endpoint(ENDPOINT_KIND_DRIVERS).is_some());
    assert!(active.endpoint(ENDPOINT_KIND_LEAVES).is_some());
}

#[test]
fn set_active_rejects_unknown_ids_and_delete_repoints() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);

    let a = registry.upsert(registry.default_profile()).unwrap();
    let b = registry.upsert(registry.default_profile()).unwrap();

    assert!(registry.set_active("nao-existe").is_err());
    registry.set_active(&b.id).unwrap();
    assert_eq!(registry.active_id().as_deref(), Some(b.id.as_str()));

    registry.delete(&b.id).unwrap();
    assert_eq!(registry.active_id().as_deref(), Some(a.id.as_str()));
}

#[test]
fn legacy_flat_endpoints_are_migrated_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes_api.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "active_id": "legacy-1",
            "items": [{
                "id": "legacy-1",
                "nome": "Cliente Antigo",
                "usuario": "u",
                "senha": "p",
                "endpoint_motorista": "/v1/motorista",
                "endpoint_afastamento": "/v1/afastamento"
            }]
        })
        .to_string(),
    )
    .unwrap();

    let registry = ClientRegistry::new(&path, defaults());
    let profile = registry.active_profile().expect("migrated profile");

    assert_eq!(profile.endpoints.len(), 2);
    let drivers = profile.endpoint(ENDPOINT_KIND_DRIVERS).unwrap();
    assert_eq!(drivers.path, "/v1/motorista");
    assert_eq!(drivers.target_table, "MotoristaCadastro");
    assert!(!drivers.rules.is_empty(), "migration attaches default rules");

    let leaves = profile.endpoint(ENDPOINT_KIND_LEAVES).unwrap();
    assert!(leaves
        .rules
        .iter()
        .any(|r| r.source == "payload.datainicio" && r.required));
}

#[test]
fn rule_aliases_from_hand_edited_files_are_accepted() {
    let raw = serde_json::json!({
        "source": "payload.cpf",
        "target": "documento.cpf",
        "required": true,
        "transform": "cpf_digits"
    });
    let rule: MappingRule = serde_json::from_value(raw).unwrap();
    assert_eq!(rule.source, "payload.cpf");
    assert_eq!(rule.target, "documento.cpf");
    assert!(rule.required);
    assert!(rule.active);
    assert_eq!(rule.transform, "cpf_digits");
}

#[test]
fn unreadable_documents_degrade_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clientes_api.json");
    std::fs::write(&path, "{nao e json").unwrap();

    let registry = ClientRegistry::new(&path, defaults());
    assert!(registry.list_profiles().is_empty());
    assert!(registry.active_id().is_none());
}

#[test]
fn upsert_drops_endpoints_without_path_or_kind() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);

    let profile = ClientProfile {
        id: String::new(),
        name: "X".into(),
        vendor: "ATS_Log".into(),
        base_url: String::new(),
        login_url: String::new(),
        user: String::new(),
        password: String::new(),
        timeout_seconds: 0.0,
        endpoints: vec![Endpoint {
            id: String::new(),
            kind: ENDPOINT_KIND_DRIVERS.into(),
            path: "   ".into(),
            target_table: String::new(),
            active: true,
            rules: Vec::new(),
        }],
    };
    let stored = registry.upsert(profile).unwrap();
    assert!(stored.endpoints.is_empty());
    assert_eq!(stored.timeout_seconds, 30.0);
}
