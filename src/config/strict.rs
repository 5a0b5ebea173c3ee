use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::Value;

/// Parses YAML into `T`. In strict mode, keys the model does not know are
/// reported as an error listing their paths.
///
/// Unknown keys are detected by serializing the parsed value back and
/// looking for input keys that did not survive.
pub fn from_yaml<T>(text: &str, strict: bool) -> Result<T>
where
    T: DeserializeOwned + Serialize,
{
    let raw: Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let raw = if raw.is_null() {
        Value::Mapping(Default::default())
    } else {
        raw
    };
    let typed: T = serde_yaml::from_value(raw.clone()).context("decoding YAML")?;

    if strict {
        let known = serde_yaml::to_value(&typed).context("re-encoding YAML")?;
        let unknown = unknown_keys(&raw, &known);
        if !unknown.is_empty() {
            return Err(super::ConfigError::UnknownFields { keys: unknown }.into());
        }
    }

    Ok(typed)
}

/// Returns dotted paths of keys present in `raw` but absent from `known`.
pub fn unknown_keys(raw: &Value, known: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(raw, known, String::new(), &mut out);
    out
}

fn walk(raw: &Value, known: &Value, path: String, out: &mut Vec<String>) {
    match (raw, known) {
        (Value::Mapping(r), Value::Mapping(k)) => {
            for (key, rv) in r {
                let name = match key {
                    Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                let child = if path.is_empty() {
                    name
                } else {
                    format!("{path}.{name}")
                };
                match k.get(key) {
                    Some(kv) => walk(rv, kv, child, out),
                    None => out.push(child),
                }
            }
        }
        (Value::Sequence(r), Value::Sequence(k)) => {
            for (i, (rv, kv)) in r.iter().zip(k.iter()).enumerate() {
                walk(rv, kv, format!("{path}[{i}]"), out);
            }
        }
        (Value::Tagged(r), _) => walk(&r.value, known, path, out),
        _ => {}
    }
}
