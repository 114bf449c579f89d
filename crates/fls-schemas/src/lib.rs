//! Shared types for the fleetsync pipeline: outbox event statuses, natural
//! keys, cursors and per-cycle reports. No I/O lives here.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload schema version stamped on every outbox event.
pub const PAYLOAD_VERSION: &str = "v1";

/// Provenance tag for events read from the upstream HR database.
pub const SOURCE_SYSTEM: &str = "Vetorh";

/// Outbox row lifecycle. PENDING/ERROR rows are dispatchable (ERROR only
/// while attempts remain); PROCESSING rows are leased; DONE is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Done => "DONE",
            EventStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "PROCESSING" => Some(EventStatus::Processing),
            "DONE" => Some(EventStatus::Done),
            "ERROR" => Some(EventStatus::Error),
            _ => None,
        }
    }
}

/// Change kind detected by the sync engines: I on first sight of a natural
/// key, U when a previously-hashed key re-emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "I",
            Operation::Update => "U",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    DriverUpsert,
    LeaveUpsert,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DriverUpsert => "DRIVER_UPSERT",
            EventType::LeaveUpsert => "LEAVE_UPSERT",
        }
    }
}

// ---------------------------------------------------------------------------
// Natural keys and cursors
// ---------------------------------------------------------------------------

/// Natural key of a leave event: one leave spell of one employee under one
/// situation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaveKey {
    pub company_id: i32,
    pub employee_type: i16,
    pub employee_id: i32,
    pub leave_date: NaiveDate,
    pub situation: i32,
}

/// Resumable position in the leave stream, ordered lexicographically as
/// (company, type, employee, date, time, seq). The sentinel value marks
/// "before the first row"; an empty non-initial read resets back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveCursor {
    pub company_id: i32,
    pub employee_type: i16,
    pub employee_id: i32,
    pub leave_date: NaiveDateTime,
    pub leave_time: i32,
    pub seq: i64,
}

impl LeaveCursor {
    pub fn initial() -> Self {
        LeaveCursor {
            company_id: 0,
            employee_type: 0,
            employee_id: 0,
            leave_date: NaiveDate::from_ymd_opt(1900, 1, 1)
                .expect("static date")
                .and_hms_opt(0, 0, 0)
                .expect("static time"),
            leave_time: -1,
            seq: -1,
        }
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::initial()
    }
}

/// Driver-side checkpoint: last consumed (change timestamp, id) pair of one
/// source table. Two sibling tables advance independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCheckpoint {
    pub last_change: NaiveDateTime,
    pub last_id: i32,
}

impl DriverCheckpoint {
    pub fn initial() -> Self {
        DriverCheckpoint {
            last_change: NaiveDate::from_ymd_opt(1900, 1, 1)
                .expect("static date")
                .and_hms_opt(0, 0, 0)
                .expect("static time"),
            last_id: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Source rows
// ---------------------------------------------------------------------------

/// One driver read from the upstream HR schema: the primary registration row
/// joined with its best complement row and the address lookups.
#[derive(Debug, Clone, Default)]
pub struct DriverSourceRow {
    pub company_id: i32,
    pub employee_type: i16,
    pub employee_id: i32,
    pub name: Option<String>,
    pub cpf: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender_code: Option<String>,
    pub admission_date: Option<NaiveDate>,
    pub situation: Option<i32>,
    pub cost_center: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub birthplace: Option<i32>,
    pub street: Option<String>,
    pub district: Option<String>,
    pub house_number: Option<String>,
    pub postal_code: Option<String>,
    pub rg_number: Option<String>,
    pub rg_issuer: Option<String>,
    pub cnh_number: Option<String>,
    pub cnh_category: Option<String>,
    pub cnh_issue_date: Option<NaiveDate>,
    pub cnh_expiry_date: Option<NaiveDate>,
    pub cnh_first_license: Option<NaiveDate>,
    pub phone_area: Option<String>,
    pub phone_number: Option<String>,
    pub marital_status: Option<String>,
    pub mother_name: Option<String>,
}

/// One leave row read from the upstream HR schema.
#[derive(Debug, Clone)]
pub struct LeaveSourceRow {
    pub company_id: i32,
    pub employee_type: i16,
    pub employee_id: i32,
    pub cpf: Option<String>,
    pub situation_description: Option<String>,
    pub leave_date: NaiveDateTime,
    pub leave_time: Option<i32>,
    pub end_date: Option<NaiveDate>,
    pub end_time: Option<i32>,
    pub situation: i32,
    pub termination: Option<i32>,
    pub notes: Option<String>,
    pub seq: Option<i64>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A driver event as produced by the sync engine, before insertion. Mirror
/// fields are written only when the destination table carries the matching
/// optional column.
#[derive(Debug, Clone)]
pub struct NewDriverEvent {
    pub source_id: i32,
    pub company_id: Option<i32>,
    pub operation: Operation,
    pub payload_hash: Vec<u8>,
    pub payload_json: String,
    pub source_table: String,
    pub mirror: DriverMirror,
}

/// Denormalized columns mirrored next to the driver payload so operators can
/// read the queue without parsing JSON. All optional; skipped when the
/// installation's table lacks the column.
#[derive(Debug, Clone, Default)]
pub struct DriverMirror {
    pub cpf: Option<String>,
    pub registration: Option<String>,
    pub name: Option<String>,
    pub cost_center: Option<String>,
    pub employee_type: Option<i16>,
    pub situation: Option<i32>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub residence_state: Option<String>,
    pub country: Option<String>,
    pub birthplace: Option<i32>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub district: Option<String>,
    pub house_number: Option<String>,
    pub phone_area: Option<String>,
    pub phone_number: Option<String>,
    pub rg_number: Option<String>,
    pub rg_issuer: Option<String>,
    pub cnh_number: Option<String>,
    pub cnh_category: Option<String>,
    pub cnh_issue_date: Option<NaiveDate>,
    pub cnh_expiry_date: Option<NaiveDate>,
    pub cnh_first_license: Option<NaiveDate>,
    pub marital_status: Option<String>,
    pub mother_name: Option<String>,
}

/// A leave event as produced by the sync engine, before insertion.
#[derive(Debug, Clone)]
pub struct NewLeaveEvent {
    pub key: LeaveKey,
    pub leave_time: Option<i32>,
    pub end_date: Option<NaiveDate>,
    pub end_time: Option<i32>,
    pub description: String,
    pub situation_description: Option<String>,
    pub operation: Operation,
    pub payload_hash: Vec<u8>,
    pub payload_json: String,
    pub source_table: String,
}

/// A leased driver row handed to the dispatch engine. Carries exactly what
/// settlement needs: the identity columns, the payload and the attempt
/// counter prior to this delivery.
#[derive(Debug, Clone)]
pub struct ClaimedDriverEvent {
    pub source_id: i32,
    pub company_id: Option<i32>,
    pub event_type: String,
    pub payload_version: String,
    pub payload_hash: Vec<u8>,
    pub payload_json: String,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct ClaimedLeaveEvent {
    pub key: LeaveKey,
    pub event_type: String,
    pub payload_version: String,
    pub payload_hash: Vec<u8>,
    pub payload_json: String,
    pub attempts: i32,
}

/// Outcome of one settlement attempt against the target API.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub http_status: Option<i32>,
    pub response_summary: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Cycle reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DriverCycleReport {
    pub changed_primary: usize,
    pub changed_complement: usize,
    pub ids_processed: usize,
    pub source_rows: usize,
    pub valid_payloads: usize,
    pub events_generated: usize,
    pub events_inserted: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LeaveCycleReport {
    pub source_rows: usize,
    pub valid_payloads: usize,
    pub events_generated: usize,
    pub events_inserted: u64,
    pub cursor_reset: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchCycleReport {
    pub driver_leases_swept: u64,
    pub leave_leases_swept: u64,
    pub drivers_claimed: usize,
    pub drivers_succeeded: usize,
    pub drivers_failed: usize,
    pub leaves_claimed: usize,
    pub leaves_succeeded: usize,
    pub leaves_failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for st in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Done,
            EventStatus::Error,
        ] {
            assert_eq!(EventStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(EventStatus::parse("PENDENTE"), None);
    }

    #[test]
    fn leave_cursor_initial_is_sentinel() {
        let c = LeaveCursor::initial();
        assert!(c.is_initial());
        assert_eq!(c.leave_time, -1);
        assert_eq!(c.seq, -1);
        assert_eq!(c.leave_date.date().to_string(), "1900-01-01");

        let advanced = LeaveCursor {
            employee_id: 42,
            ..LeaveCursor::initial()
        };
        assert!(!advanced.is_initial());
    }
}
