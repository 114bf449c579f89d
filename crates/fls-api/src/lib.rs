//! Target-API access: the authenticated HTTP client and the JSON-backed
//! registry of client profiles and endpoint mappings.

pub mod client;
pub mod login;
pub mod registry;

pub use client::{ApiClient, ApiCredentials, ApiResponse};
pub use login::{build_login_candidates, extract_token};
pub use registry::{
    default_driver_rules, default_leave_rules, ClientProfile, ClientRegistry, Endpoint,
    MappingRule, RegistryDefaults, ENDPOINT_KIND_DRIVERS, ENDPOINT_KIND_LEAVES, REGISTRY_FILE,
};
