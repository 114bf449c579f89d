//! Source rows → canonical API payloads.
//!
//! Building is pure and total: a row that cannot yield a valid payload is
//! skipped, never an error. Validation here mirrors the target API's minimum
//! contract (driver: cpf + nome + dataadmissao; leave: cpf + datainicio).

use serde::Serialize;

use fls_schemas::{DriverSourceRow, LeaveSourceRow};

use crate::normalize::{
    date_to_yyyy_mm_dd, datetime_to_yyyy_mm_dd, format_cpf, int_to_bool, map_gender,
    text_or_default,
};

pub const NOT_INFORMED: &str = "NAO INFORMADO";
pub const DEFAULT_STATE: &str = "SC";

/// Address block with the API's stable placeholders for missing pieces.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Endereco {
    pub rua: String,
    pub numero: String,
    pub complemento: String,
    pub bairro: String,
    pub cidade: String,
    pub uf: String,
    pub cep: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DriverPayload {
    pub nome: String,
    pub cpf: String,
    pub datanascimento: Option<String>,
    pub genero: String,
    pub endereco: Endereco,
    pub dataadmissao: String,
    pub matricula: String,
}

/// Leave payload. Carries the natural-key fields alongside the business
/// ones so mapping rules can reference any of them (`payload.situacao`,
/// `payload.numerodaempresa`, …).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LeavePayload {
    pub numerodaempresa: i32,
    pub tipodecolaborador: i16,
    pub numerodeorigemdocolaborador: i32,
    pub cpf: String,
    pub descricao: String,
    pub descricaodasituacao: Option<String>,
    pub datainicio: String,
    pub dataafastamento: String,
    pub horadoafastamento: Option<i32>,
    pub datatermino: Option<String>,
    pub horadotermino: Option<i32>,
    pub situacao: i32,
    pub rescisao: bool,
}

fn endereco_from_row(row: &DriverSourceRow) -> Endereco {
    Endereco {
        rua: text_or_default(row.street.as_deref(), NOT_INFORMED),
        numero: text_or_default(row.house_number.as_deref(), "SN"),
        complemento: String::new(),
        bairro: text_or_default(row.district.as_deref(), NOT_INFORMED),
        cidade: text_or_default(row.city.as_deref(), NOT_INFORMED),
        uf: text_or_default(row.state.as_deref(), DEFAULT_STATE),
        cep: text_or_default(row.postal_code.as_deref(), "00000000"),
        latitude: 0.0,
        longitude: 0.0,
    }
}

/// Driver payload, or None when the row lacks cpf, name or admission date.
pub fn build_driver_payload(row: &DriverSourceRow) -> Option<DriverPayload> {
    let cpf = format_cpf(row.cpf.as_deref())?;
    let nome = row.name.as_deref().map(str::trim).unwrap_or_default();
    if nome.is_empty() {
        return None;
    }
    let dataadmissao = date_to_yyyy_mm_dd(row.admission_date)?;

    Some(DriverPayload {
        nome: nome.to_string(),
        cpf,
        datanascimento: date_to_yyyy_mm_dd(row.birth_date),
        genero: map_gender(row.gender_code.as_deref()).to_string(),
        endereco: endereco_from_row(row),
        dataadmissao,
        matricula: row.employee_id.to_string(),
    })
}

/// Leave payload, or None when the row lacks cpf or a start date.
pub fn build_leave_payload(row: &LeaveSourceRow) -> Option<LeavePayload> {
    let cpf = format_cpf(row.cpf.as_deref())?;
    let datainicio = datetime_to_yyyy_mm_dd(Some(row.leave_date))?;

    let descricaodasituacao = row
        .situation_description
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(LeavePayload {
        numerodaempresa: row.company_id,
        tipodecolaborador: row.employee_type,
        numerodeorigemdocolaborador: row.employee_id,
        cpf,
        descricao: leave_event_description(row),
        descricaodasituacao,
        dataafastamento: datainicio.clone(),
        datainicio,
        horadoafastamento: row.leave_time,
        datatermino: date_to_yyyy_mm_dd(row.end_date),
        horadotermino: row.end_time,
        situacao: row.situation,
        rescisao: int_to_bool(row.termination),
    })
}

/// Human description stored on the leave event row itself: free-form note,
/// then situation description, then the raw situation code.
pub fn leave_event_description(row: &LeaveSourceRow) -> String {
    if let Some(n) = row.notes.as_deref().map(str::trim) {
        if !n.is_empty() {
            return n.to_string();
        }
    }
    if let Some(d) = row.situation_description.as_deref().map(str::trim) {
        if !d.is_empty() {
            return d.to_string();
        }
    }
    row.situation.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn driver_row() -> DriverSourceRow {
        DriverSourceRow {
            company_id: 1,
            employee_type: 1,
            employee_id: 42,
            name: Some("JOAO DA SILVA".into()),
            cpf: Some("12345678909".into()),
            birth_date: NaiveDate::from_ymd_opt(1990, 2, 3),
            gender_code: Some("M".into()),
            admission_date: NaiveDate::from_ymd_opt(2020, 1, 15),
            city: Some("Joinville".into()),
            ..Default::default()
        }
    }

    fn leave_row() -> LeaveSourceRow {
        LeaveSourceRow {
            company_id: 1,
            employee_type: 1,
            employee_id: 42,
            cpf: Some("12345678909".into()),
            situation_description: Some("Auxilio doenca".into()),
            leave_date: NaiveDate::from_ymd_opt(2024, 5, 10)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            leave_time: Some(800),
            end_date: None,
            end_time: None,
            situation: 3,
            termination: Some(0),
            notes: None,
            seq: Some(0),
        }
    }

    #[test]
    fn driver_payload_is_built_with_address_defaults() {
        let p = build_driver_payload(&driver_row()).expect("payload");
        assert_eq!(p.cpf, "123.456.789-09");
        assert_eq!(p.dataadmissao, "2020-01-15");
        assert_eq!(p.matricula, "42");
        assert_eq!(p.endereco.cidade, "Joinville");
        assert_eq!(p.endereco.uf, DEFAULT_STATE);
        assert_eq!(p.endereco.cep, "00000000");
        assert_eq!(p.endereco.numero, "SN");
    }

    #[test]
    fn driver_rows_missing_mandatory_fields_are_dropped() {
        let mut row = driver_row();
        row.cpf = None;
        assert!(build_driver_payload(&row).is_none());

        let mut row = driver_row();
        row.name = Some("   ".into());
        assert!(build_driver_payload(&row).is_none());

        let mut row = driver_row();
        row.admission_date = None;
        assert!(build_driver_payload(&row).is_none());
    }

    #[test]
    fn leave_payload_carries_key_fields_and_description() {
        let p = build_leave_payload(&leave_row()).expect("payload");
        assert_eq!(p.cpf, "123.456.789-09");
        assert_eq!(p.datainicio, "2024-05-10");
        assert_eq!(p.dataafastamento, "2024-05-10");
        assert_eq!(p.descricao, "Auxilio doenca");
        assert_eq!(
            (p.numerodaempresa, p.tipodecolaborador, p.numerodeorigemdocolaborador),
            (1, 1, 42)
        );
        assert_eq!(p.situacao, 3);
        assert_eq!(p.horadoafastamento, Some(800));
        assert!(!p.rescisao);
        assert_eq!(p.datatermino, None);

        let mut bare = leave_row();
        bare.situation_description = None;
        let p = build_leave_payload(&bare).expect("payload");
        assert_eq!(p.descricao, "3", "falls back to the raw situation code");
        assert_eq!(p.descricaodasituacao, None);
    }

    #[test]
    fn leave_event_description_prefers_notes_then_situation_text() {
        let mut row = leave_row();
        assert_eq!(leave_event_description(&row), "Auxilio doenca");
        row.notes = Some("Observacao manual".into());
        assert_eq!(leave_event_description(&row), "Observacao manual");
        row.notes = None;
        row.situation_description = None;
        assert_eq!(leave_event_description(&row), "3");
    }

    #[test]
    fn leave_rows_without_cpf_are_dropped() {
        let mut row = leave_row();
        row.cpf = Some("---".into());
        assert!(build_leave_payload(&row).is_none());
    }
}
