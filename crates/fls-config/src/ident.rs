//! SQL identifier guard.
//!
//! Table and schema names come from configuration and from reflective column
//! discovery, and end up interpolated into SQL text. Every such name must
//! pass this validation first; values never take this path (they are always
//! bound parameters).

use anyhow::{bail, Result};

/// Accepts `[A-Za-z_][A-Za-z0-9_]*` only.
pub fn is_safe_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates and returns the trimmed identifier, or fails naming the field.
pub fn safe_identifier(value: &str, label: &str) -> Result<String> {
    let normalized = value.trim();
    if !is_safe_identifier(normalized) {
        bail!("{label} invalido: {value:?}");
    }
    Ok(normalized.to_string())
}

/// Double-quoted form for interpolation into Postgres SQL. Only call with a
/// value that already passed `safe_identifier`.
pub fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

/// Lookup key for reflective column matching: lowercase alphanumerics only,
/// so `NumeroDaEmpresa`, `numerodaempresa` and `numero_da_empresa` all meet.
pub fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        for ok in ["MotoristaCadastro", "_tmp", "R034FUN", "a1_b2"] {
            assert!(is_safe_identifier(ok), "{ok}");
        }
    }

    #[test]
    fn rejects_injection_shapes() {
        for bad in ["", "1abc", "a-b", "a b", "a;drop", "\"x\"", "a.b", "é"] {
            assert!(!is_safe_identifier(bad), "{bad}");
        }
        assert!(safe_identifier("bad name", "Tabela").is_err());
    }

    #[test]
    fn normalize_key_folds_case_and_separators() {
        assert_eq!(normalize_key("NumeroDaEmpresa"), "numerodaempresa");
        assert_eq!(normalize_key("numero_da_empresa"), "numerodaempresa");
        assert_eq!(normalize_key("Hash Payload"), "hashpayload");
    }
}
