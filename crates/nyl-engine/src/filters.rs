//! Template filters
//!
//! Filters that transform a value cannot see through an unforced random
//! value marker, so the content-transforming ones reject them instead of
//! silently hashing or encoding the marker text. Lookup markers pass through
//! unchanged so the document they land in is still withheld.

use base64::Engine as _;
use minijinja::{Error, ErrorKind, Value};
use nyl_core::random::contains_thunk;
use sha2::{Digest, Sha256};

use crate::functions::contains_lookup_marker;

fn reject_thunk(filter: &str, value: &str) -> Result<(), Error> {
    if contains_thunk(value) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!(
                "`{filter}` cannot be applied to a random value before it is generated; \
                 use the value directly (e.g. in stringData)"
            ),
        ));
    }
    Ok(())
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// `{{ values.config | toyaml }}`
pub fn toyaml(value: Value) -> Result<String, Error> {
    let yaml = serde_yaml::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;

    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

/// `{{ values.config | tojson }}`
pub fn tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

pub fn b64encode(value: String) -> Result<String, Error> {
    if contains_lookup_marker(&value) {
        return Ok(value);
    }
    reject_thunk("b64encode", &value)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(value.as_bytes()))
}

pub fn b64decode(value: String) -> Result<String, Error> {
    if contains_lookup_marker(&value) {
        return Ok(value);
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.trim().as_bytes())
        .map_err(|e| {
            Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {}", e))
        })?;

    String::from_utf8(decoded).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("UTF-8 decode error: {}", e))
    })
}

/// Double-quote a value for YAML
pub fn quote(value: Value) -> String {
    let s = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Indent every non-empty line after the first
pub fn indent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    value
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 || line.is_empty() {
                line.to_string()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Newline, then every non-empty line indented
pub fn nindent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    let body = value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n{body}")
}

pub fn sha256sum(value: String) -> Result<String, Error> {
    if contains_lookup_marker(&value) {
        return Ok(value);
    }
    reject_thunk("sha256", &value)?;
    let digest = Sha256::digest(value.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyl_core::RandomThunk;

    #[test]
    fn test_toyaml() {
        let value = Value::from_serialize(serde_json::json!({"a": 1}));
        assert_eq!(toyaml(value).unwrap(), "a: 1");
    }

    #[test]
    fn test_b64_roundtrip_rejects_thunk() {
        assert_eq!(b64encode("hello".into()).unwrap(), "aGVsbG8=");
        assert_eq!(b64decode("aGVsbG8=".into()).unwrap(), "hello");

        let marker = RandomThunk::hex("t", 4).marker();
        assert!(b64encode(marker.clone()).is_err());
        assert!(sha256sum(marker).is_err());
    }

    #[test]
    fn test_lookup_markers_pass_through() {
        let marker = "((nyl:deferred:2))".to_string();
        assert_eq!(b64encode(marker.clone()).unwrap(), marker);
        assert_eq!(b64decode(marker.clone()).unwrap(), marker);
        assert_eq!(sha256sum("((nyl:failed:0))".into()).unwrap(), "((nyl:failed:0))");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(Value::from("say \"hi\"")), r#""say \"hi\"""#);
        assert_eq!(quote(Value::from(8080)), "\"8080\"");
    }

    #[test]
    fn test_indent_and_nindent() {
        assert_eq!(indent("a\nb".into(), 2), "a\n  b");
        assert_eq!(nindent("a\n\nb".into(), 4), "\n    a\n\n    b");
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256sum("abc".into()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
