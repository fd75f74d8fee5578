//! Lazy random values
//!
//! `randhex()` and `random_password()` do not draw from the RNG when a
//! template is evaluated. They return a [`RandomThunk`] that is rendered into
//! the expanded text as an opaque marker:
//!
//! ```text
//! ((nyl:random:0.1.3:hex:32))
//! ```
//!
//! The marker is only replaced by a concrete value when the resource that
//! carries it is emitted (see [`ThunkForcer`]). A resource that is deferred
//! never consumes a draw.

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Character sets for random values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretCharset {
    /// 0-9a-f
    #[default]
    Hex,
    /// a-zA-Z0-9-_
    UrlSafe,
}

impl SecretCharset {
    pub const fn chars(&self) -> &'static [u8] {
        match self {
            Self::Hex => b"0123456789abcdef",
            Self::UrlSafe => b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_",
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::UrlSafe => "urlsafe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hex" => Some(Self::Hex),
            "urlsafe" => Some(Self::UrlSafe),
            _ => None,
        }
    }
}

static THUNK_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(\(nyl:random:([A-Za-z0-9_.\-]+):([a-z]+):(\d+)\)\)")
        .expect("valid regex")
});

/// A not-yet-drawn random value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RandomThunk {
    /// Identity within one render; equal ids always force to the same value
    pub id: String,
    pub charset: SecretCharset,
    pub length: usize,
}

impl RandomThunk {
    /// `randhex(bytes)`: `2 * bytes` hex characters
    pub fn hex(id: impl Into<String>, bytes: usize) -> Self {
        Self {
            id: id.into(),
            charset: SecretCharset::Hex,
            length: bytes * 2,
        }
    }

    /// `random_password(length)`: URL-safe characters
    pub fn password(id: impl Into<String>, length: usize) -> Self {
        Self {
            id: id.into(),
            charset: SecretCharset::UrlSafe,
            length,
        }
    }

    pub fn marker(&self) -> String {
        format!(
            "((nyl:random:{}:{}:{}))",
            self.id,
            self.charset.name(),
            self.length
        )
    }
}

/// Whether `text` still carries an unforced random value
pub fn contains_thunk(text: &str) -> bool {
    THUNK_MARKER.is_match(text)
}

/// Whether any string inside `value` carries an unforced random value
pub fn value_contains_thunk(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => contains_thunk(s),
        JsonValue::Array(items) => items.iter().any(value_contains_thunk),
        JsonValue::Object(map) => map.values().any(value_contains_thunk),
        _ => false,
    }
}

/// All thunks referenced in `text`, in order of appearance
pub fn scan(text: &str) -> Vec<RandomThunk> {
    THUNK_MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            Some(RandomThunk {
                id: caps[1].to_string(),
                charset: SecretCharset::parse(&caps[2])?,
                length: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// Forces thunks into concrete values, memoized by thunk id for one render
#[derive(Debug)]
pub struct ThunkForcer {
    rng: StdRng,
    memo: HashMap<String, String>,
}

impl ThunkForcer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_rng(&mut rand::rng()),
            memo: HashMap::new(),
        }
    }

    /// Deterministic draws, for tests and reproducible renders
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            memo: HashMap::new(),
        }
    }

    pub fn force(&mut self, thunk: &RandomThunk) -> String {
        if let Some(value) = self.memo.get(&thunk.id) {
            return value.clone();
        }

        let chars = thunk.charset.chars();
        let value: String = (0..thunk.length)
            .map(|_| chars[self.rng.random_range(0..chars.len())] as char)
            .collect();

        tracing::debug!(thunk = %thunk.id, length = thunk.length, "forced random value");
        self.memo.insert(thunk.id.clone(), value.clone());
        value
    }

    /// Replace every marker in `text`
    pub fn force_str(&mut self, text: &str) -> String {
        if !contains_thunk(text) {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in THUNK_MARKER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);

            let parsed = SecretCharset::parse(&caps[2])
                .zip(caps[3].parse::<usize>().ok())
                .map(|(charset, length)| RandomThunk {
                    id: caps[1].to_string(),
                    charset,
                    length,
                });
            match parsed {
                Some(thunk) => out.push_str(&self.force(&thunk)),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);
        out
    }

    /// Replace every marker in every string of `value`
    pub fn force_value(&mut self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(self.force_str(s)),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.force_value(v)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.force_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Number of distinct thunks forced so far
    pub fn forced(&self) -> usize {
        self.memo.len()
    }
}

impl Default for ThunkForcer {
    fn default() -> Self {
        Self::new()
    }
}
