//! Payload construction for the fleetsync pipeline: field normalization,
//! row → payload mapping, and the canonical-JSON fingerprint that drives
//! change detection.

pub mod builder;
pub mod canonical;
pub mod normalize;

pub use builder::{
    build_driver_payload, build_leave_payload, leave_event_description, DriverPayload, Endereco,
    LeavePayload, DEFAULT_STATE, NOT_INFORMED,
};
pub use canonical::{canonical_json, fingerprint, fingerprint_hex};

use anyhow::Result;
use serde::Serialize;

/// Canonical serialization + fingerprint of any serializable payload.
pub fn canonical_with_fingerprint<T: Serialize>(payload: &T) -> Result<(String, Vec<u8>)> {
    let value = serde_json::to_value(payload)?;
    let canonical = canonical_json(&value);
    let hash = fingerprint(&canonical);
    Ok((canonical, hash))
}
