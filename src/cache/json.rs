//! JSON serialization options and best-effort repair of damaged cache files

use crate::error::Result;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialization options shared by every store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonOptions {
    /// Write indented JSON to cache files and snapshots
    pub pretty: bool,
}

/// Rewrites applied, in order, to the whole text
const TEXT_RULES: &[(&str, &str)] = &[
    // Byte-order mark left behind by some editors
    ("^\u{feff}", ""),
    // Normalize CRLF and lone CR
    ("\r\n?", "\n"),
];

/// Rewrites applied, in order, to the text between string literals
const STRUCTURE_RULES: &[(&str, &str)] = &[
    // Trailing comma before a closing brace or bracket
    (r",(\s*[}\]])", "$1"),
    // Property name and colon split across lines
    (r"[ \t]*\n\s*:", ":"),
    // Colon and value split across lines
    (r":[ \t]*\n\s*", ": "),
];

/// A complete JSON string literal, escapes included
const STRING_LITERAL: &str = r#""(?:[^"\\]|\\.)*""#;

/// Explicitly constructed serializer handed to each store.
///
/// Build one per process and share it as `Arc<JsonCodec>`.
#[derive(Debug)]
pub struct JsonCodec {
    options: JsonOptions,
    text_repairs: Vec<(Regex, &'static str)>,
    structure_repairs: Vec<(Regex, &'static str)>,
    string_literal: Option<Regex>,
}

fn compile(rules: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    rules
        .iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, *replacement)))
        .collect()
}

fn apply(rules: &[(Regex, &'static str)], text: &str) -> String {
    let mut current = text.to_string();
    for (re, replacement) in rules {
        current = re.replace_all(&current, *replacement).into_owned();
    }
    current
}

impl JsonCodec {
    pub fn new(options: JsonOptions) -> Self {
        Self {
            options,
            text_repairs: compile(TEXT_RULES),
            structure_repairs: compile(STRUCTURE_RULES),
            string_literal: Regex::new(STRING_LITERAL).ok(),
        }
    }

    pub fn options(&self) -> &JsonOptions {
        &self.options
    }

    /// Serialize a value using the configured layout
    pub fn to_string<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let text = if self.options.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(text)
    }

    /// Serialize a value to bytes using the configured layout
    pub fn to_vec<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = if self.options.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    /// Strict deserialization
    pub fn from_str<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        Ok(serde_json::from_str(text)?)
    }

    /// Strict deserialization, then one retry after the sanitization pass
    pub fn from_str_lenient<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        match serde_json::from_str(text) {
            Ok(value) => Ok(value),
            Err(first) => {
                let repaired = self.sanitize(text);
                if repaired == text {
                    return Err(first.into());
                }
                tracing::debug!("Strict JSON parse failed ({}), retrying after repair", first);
                Ok(serde_json::from_str(&repaired)?)
            }
        }
    }

    /// Best-effort repair of common formatting corruption.
    ///
    /// String literal contents are never rewritten by the structural rules.
    pub fn sanitize(&self, text: &str) -> String {
        let normalized = apply(&self.text_repairs, text);
        let Some(literal) = &self.string_literal else {
            return apply(&self.structure_repairs, &normalized).trim().to_string();
        };

        let mut repaired = String::with_capacity(normalized.len());
        let mut last = 0;
        for m in literal.find_iter(&normalized) {
            repaired.push_str(&apply(&self.structure_repairs, &normalized[last..m.start()]));
            repaired.push_str(m.as_str());
            last = m.end();
        }
        repaired.push_str(&apply(&self.structure_repairs, &normalized[last..]));
        repaired.trim().to_string()
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(JsonOptions::default())
    }
}
