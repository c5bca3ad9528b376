//! Bounded-cost structural fingerprints for streamed JSON values.
//!
//! Two values with the same signature are treated as unchanged. Object keys
//! are visited in sorted order, so key order never affects the result. Large
//! strings, arrays and objects are summarized rather than walked in full,
//! which keeps the cost per update flat while arguments stream in.

use serde_json::{Number, Value};

const MAX_DEPTH: usize = 12;
const STRING_FULL_LIMIT: usize = 256;
const STRING_EDGE: usize = 64;
const ARRAY_FULL_LIMIT: usize = 64;
const ARRAY_EDGE: usize = 16;
const OBJECT_FULL_LIMIT: usize = 128;
const OBJECT_HEAD: usize = 64;

pub(crate) fn structural_signature(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, 0, &mut out);
    out
}

fn write_value(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        out.push_str("~depth");
        return;
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => {
            out.push_str(if *flag { "b:1" } else { "b:0" });
        }
        Value::Number(number) => write_number(number, out),
        Value::String(text) => write_string(text, out),
        Value::Array(items) => {
            out.push_str(&format!("a{}[", items.len()));
            if items.len() <= ARRAY_FULL_LIMIT {
                write_items(items.iter(), depth, out);
            } else {
                write_items(items[..ARRAY_EDGE].iter(), depth, out);
                out.push_str("~,");
                write_items(items[items.len() - ARRAY_EDGE..].iter(), depth, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push_str(&format!("o{}{{", keys.len()));
            let shown = if keys.len() <= OBJECT_FULL_LIMIT {
                keys.len()
            } else {
                OBJECT_HEAD
            };
            for key in &keys[..shown] {
                write_string(key, out);
                out.push(':');
                if let Some(entry) = map.get(*key) {
                    write_value(entry, depth + 1, out);
                }
                out.push(',');
            }
            if shown < keys.len() {
                out.push_str(&format!("~+{}", keys.len() - shown));
            }
            out.push('}');
        }
    }
}

fn write_items<'a>(items: impl Iterator<Item = &'a Value>, depth: usize, out: &mut String) {
    for item in items {
        write_value(item, depth + 1, out);
        out.push(',');
    }
}

fn write_number(number: &Number, out: &mut String) {
    if let Some(value) = number.as_u64() {
        out.push_str(&format!("u:{value}"));
    } else if let Some(value) = number.as_i64() {
        out.push_str(&format!("i:{value}"));
    } else if let Some(value) = number.as_f64() {
        if value == 0.0 && value.is_sign_negative() {
            out.push_str("f:-0");
        } else if value.is_nan() {
            out.push_str("f:nan");
        } else if value.is_infinite() {
            out.push_str(if value > 0.0 { "f:+inf" } else { "f:-inf" });
        } else {
            out.push_str(&format!("f:{value:?}"));
        }
    }
}

fn write_string(text: &str, out: &mut String) {
    let length = text.chars().count();
    out.push_str(&format!("s{length}:"));
    if length <= STRING_FULL_LIMIT {
        out.push_str(&quote(text));
        return;
    }

    let head = text.chars().take(STRING_EDGE).collect::<String>();
    let mut tail = text.chars().rev().take(STRING_EDGE).collect::<Vec<_>>();
    tail.reverse();
    out.push_str(&quote(&head));
    out.push('~');
    out.push_str(&quote(&tail.into_iter().collect::<String>()));
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_default()
}

/// Wraps a value so that equality means "structurally unchanged".
#[derive(Debug, Clone)]
pub(crate) struct Stable {
    value: Value,
    signature: String,
}

impl Stable {
    pub(crate) fn new(value: Value) -> Self {
        let signature = structural_signature(&value);
        Self { value, signature }
    }

    pub(crate) fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn signature(&self) -> &str {
        &self.signature
    }
}

impl PartialEq for Stable {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl Eq for Stable {}
