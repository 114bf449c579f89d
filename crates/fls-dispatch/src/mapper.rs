//! Declarative de-para mapping.
//!
//! When an endpoint carries mapping rules, the outgoing body is built rule
//! by rule from an envelope exposing three namespaces: `payload.*` (the
//! parsed event JSON, also merged at the top level), `evento.*` (outbox key
//! fields) and `colunas.*` (mirror columns fetched from the outbox row).

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use fls_api::MappingRule;
use fls_config::normalize_key;

/// Mirror columns referenced by the rule set (`colunas.X` / `coluna:X`
/// sources), deduplicated by normalized name.
pub fn source_columns(rules: &[MappingRule]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();

    for rule in rules {
        let source = rule.source.trim();
        let column = if starts_with_ignore_case(source, "colunas.") {
            source["colunas.".len()..].trim()
        } else if starts_with_ignore_case(source, "coluna:") {
            source["coluna:".len()..].trim()
        } else {
            continue;
        };
        if column.is_empty() {
            continue;
        }
        let key = normalize_key(column);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(column.to_string());
    }
    out
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

/// Assembles the rule-evaluation envelope. Payload keys are also available
/// unprefixed for older rule sets written before the namespaces existed.
pub fn build_envelope(
    payload: &Map<String, Value>,
    event: &Map<String, Value>,
    columns: &Map<String, Value>,
) -> Value {
    let mut envelope = payload.clone();
    envelope.insert("payload".to_string(), Value::Object(payload.clone()));
    envelope.insert("evento".to_string(), Value::Object(event.clone()));
    envelope.insert("colunas".to_string(), Value::Object(columns.clone()));
    Value::Object(envelope)
}

/// Applies the rule set to the envelope. Fails when a required field stays
/// empty or when no rule assigned anything at all.
pub fn apply_rules(
    rules: &[MappingRule],
    envelope: &Value,
    context: &str,
) -> Result<Value> {
    let mut destination = Map::new();

    for rule in rules {
        if !rule.active {
            continue;
        }
        let source = rule.source.trim();
        let target = rule.target.trim();
        let label = rule
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(if target.is_empty() { source } else { target });

        let mut value = if source.is_empty() {
            Value::Null
        } else {
            get_path(envelope, source)
        };
        if is_empty_value(&value) {
            if let Some(default) = &rule.default {
                value = default.clone();
            }
        }

        if is_empty_value(&value) {
            if rule.required {
                bail!(
                    "campo obrigatorio ausente no de-para ({context}): {label:?} \
                     (origem={source:?}, destino={target:?})"
                );
            }
            continue;
        }

        let value = apply_transform(value, &rule.transform)?;
        set_path(&mut destination, target, value);
    }

    if destination.is_empty() {
        bail!("de-para de {context} gerou payload vazio");
    }
    Ok(Value::Object(destination))
}

/// Walks a dotted path; numeric segments index into arrays. Anything that
/// does not resolve yields null.
pub fn get_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for token in path.split('.') {
        let part = token.trim();
        if part.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => match map.get(part) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Assigns into a dotted path, creating intermediate objects as needed.
/// Non-object intermediates are replaced.
pub fn set_path(destination: &mut Map<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path
        .split('.')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return;
    }

    let mut current = destination;
    for part in &parts[..parts.len() - 1] {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("just ensured object");
    }
    current.insert(parts[parts.len() - 1].to_string(), value);
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Closed transform set. Portuguese aliases are the wire names used by
/// older registry files.
pub fn apply_transform(value: Value, transform: &str) -> Result<Value> {
    let name = transform.trim().to_lowercase();
    if name.is_empty() {
        return Ok(value);
    }

    let out = match name.as_str() {
        "str" | "string" | "texto" => Value::String(value_text(&value)),
        "upper" | "maiusculo" => Value::String(value_text(&value).to_uppercase()),
        "lower" | "minusculo" => Value::String(value_text(&value).to_lowercase()),
        "int" | "inteiro" => {
            let text = value_text(&value).trim().replace(',', ".");
            let parsed: f64 = text
                .parse()
                .map_err(|_| anyhow::anyhow!("transformacao int: valor invalido {text:?}"))?;
            Value::from(parsed as i64)
        }
        "float" | "decimal" | "numero" => {
            let text = value_text(&value).trim().replace(',', ".");
            let parsed: f64 = text
                .parse()
                .map_err(|_| anyhow::anyhow!("transformacao float: valor invalido {text:?}"))?;
            Value::from(parsed)
        }
        "bool" | "booleano" => Value::Bool(coerce_bool(&value)),
        "cpf_digits" | "cpf_digitos" | "digits" => Value::String(
            value_text(&value)
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect(),
        ),
        "date_yyyy_mm_dd" | "data_yyyy_mm_dd" | "yyyy_mm_dd" => {
            Value::String(coerce_iso_date(&value_text(&value)))
        }
        _ => value,
    };
    Ok(out)
}

fn coerce_bool(value: &Value) -> bool {
    let text = value_text(value).trim().to_lowercase();
    match text.as_str() {
        "1" | "true" | "sim" | "s" | "y" | "yes" => return true,
        "0" | "false" | "nao" | "n" | "no" => return false,
        _ => {}
    }
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// `YYYY-MM-DD…` is sliced; `DD/MM/YYYY…` is reordered; anything else
/// passes through untouched.
fn coerce_iso_date(text: &str) -> String {
    let t = text.trim();
    let bytes = t.as_bytes();
    if t.len() >= 10 && t.is_char_boundary(10) {
        if bytes[4] == b'-' && bytes[7] == b'-' {
            return t[..10].to_string();
        }
        if bytes[2] == b'/' && bytes[5] == b'/' {
            let (dd, mm, yyyy) = (&t[..2], &t[3..5], &t[6..10]);
            return format!("{yyyy}-{mm}-{dd}");
        }
    }
    t.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(source: &str, target: &str) -> MappingRule {
        MappingRule {
            name: None,
            source: source.to_string(),
            target: target.to_string(),
            required: false,
            active: true,
            default: None,
            transform: String::new(),
        }
    }

    #[test]
    fn cpf_rule_projects_into_nested_destination() {
        let rules = vec![MappingRule {
            required: true,
            transform: "cpf_digits".to_string(),
            ..rule("payload.cpf", "documento.cpf")
        }];
        let payload = json!({"cpf": "123.456.789-09"});
        let envelope = build_envelope(
            payload.as_object().unwrap(),
            &Map::new(),
            &Map::new(),
        );

        let body = apply_rules(&rules, &envelope, "motoristas").unwrap();
        assert_eq!(body, json!({"documento": {"cpf": "12345678909"}}));
    }

    #[test]
    fn required_rule_without_value_fails_without_posting() {
        let rules = vec![MappingRule {
            required: true,
            ..rule("payload.cpf", "documento.cpf")
        }];
        let envelope = build_envelope(&Map::new(), &Map::new(), &Map::new());
        let err = apply_rules(&rules, &envelope, "motoristas").unwrap_err();
        assert!(err.to_string().contains("campo obrigatorio"));
        assert!(err.to_string().contains("documento.cpf"));
    }

    #[test]
    fn defaults_fill_empty_sources_and_inactive_rules_skip() {
        let rules = vec![
            MappingRule {
                default: Some(json!("SC")),
                transform: "upper".into(),
                ..rule("payload.endereco.uf", "endereco.uf")
            },
            MappingRule {
                active: false,
                ..rule("payload.nome", "nome")
            },
        ];
        let payload = json!({"endereco": {"uf": "  "}, "nome": "X"});
        let envelope = build_envelope(payload.as_object().unwrap(), &Map::new(), &Map::new());
        let body = apply_rules(&rules, &envelope, "motoristas").unwrap();
        assert_eq!(body, json!({"endereco": {"uf": "SC"}}));
    }

    #[test]
    fn all_namespaces_resolve() {
        let payload = json!({"cpf": "1"});
        let mut event = Map::new();
        event.insert("tentativas".into(), json!(2));
        let mut cols = Map::new();
        cols.insert("NumEmp".into(), json!(4));

        let envelope = build_envelope(payload.as_object().unwrap(), &event, &cols);
        assert_eq!(get_path(&envelope, "payload.cpf"), json!("1"));
        assert_eq!(get_path(&envelope, "cpf"), json!("1"));
        assert_eq!(get_path(&envelope, "evento.tentativas"), json!(2));
        assert_eq!(get_path(&envelope, "colunas.NumEmp"), json!(4));
        assert_eq!(get_path(&envelope, "colunas.Nada"), Value::Null);
    }

    #[test]
    fn paths_walk_arrays_by_index() {
        let v = json!({"lista": [{"x": 1}, {"x": 2}]});
        assert_eq!(get_path(&v, "lista.1.x"), json!(2));
        assert_eq!(get_path(&v, "lista.5.x"), Value::Null);
        assert_eq!(get_path(&v, "lista.x"), Value::Null);
    }

    #[test]
    fn transforms_cover_the_closed_set() {
        assert_eq!(apply_transform(json!(7), "str").unwrap(), json!("7"));
        assert_eq!(apply_transform(json!("abc"), "upper").unwrap(), json!("ABC"));
        assert_eq!(apply_transform(json!("AbC"), "lower").unwrap(), json!("abc"));
        assert_eq!(apply_transform(json!("12,5"), "int").unwrap(), json!(12));
        assert_eq!(apply_transform(json!("12,5"), "float").unwrap(), json!(12.5));
        assert_eq!(apply_transform(json!("sim"), "bool").unwrap(), json!(true));
        assert_eq!(apply_transform(json!("nao"), "bool").unwrap(), json!(false));
        assert_eq!(apply_transform(json!(3), "bool").unwrap(), json!(true));
        assert_eq!(
            apply_transform(json!("123.456.789-09"), "cpf_digits").unwrap(),
            json!("12345678909")
        );
        assert_eq!(
            apply_transform(json!("2024-05-10T08:00:00"), "date_yyyy_mm_dd").unwrap(),
            json!("2024-05-10")
        );
        assert_eq!(
            apply_transform(json!("10/05/2024"), "date_yyyy_mm_dd").unwrap(),
            json!("2024-05-10")
        );
        assert!(apply_transform(json!("abc"), "int").is_err());
        // unknown transforms pass the value through
        assert_eq!(apply_transform(json!("x"), "desconhecida").unwrap(), json!("x"));
    }

    #[test]
    fn source_columns_extracts_and_dedupes() {
        let rules = vec![
            rule("colunas.NumEmp", "numemp"),
            rule("coluna:NumEmp", "numemp2"),
            rule("colunas.Cpf", "cpf"),
            rule("payload.nome", "nome"),
            rule("colunas.", "vazio"),
        ];
        assert_eq!(source_columns(&rules), vec!["NumEmp".to_string(), "Cpf".to_string()]);
    }
}
