//! The C3 JSON Safety Layer: bounded-size, bounded-depth parsing plus
//! per-verb schema validation, run before any signature or database work.
//!
//! An open inbox is an attractive target for billion-laughs and depth-bomb
//! style attacks; every dimension of the input (byte size, nesting depth,
//! key count, string length) is bounded before `serde_json` ever builds a
//! tree, and the tree itself is walked once more to re-check depth/keys
//! against the configured limits (`serde_json` has no native bound on
//! either).

use crate::error::Error;
use serde_json::Value;
use std::collections::HashMap;

/// Bounds enforced while parsing and walking an inbound JSON body.
#[derive(Clone, Copy, Debug)]
pub struct JsonLimits {
    /// Maximum accepted body size, in bytes. Default 1 MiB.
    pub max_size: usize,
    /// Maximum object/array nesting depth. Default 50.
    pub max_depth: usize,
    /// Maximum total number of object keys across the document. Default 1000.
    pub max_keys: usize,
    /// Maximum length of any single string value. Default 500 KiB.
    pub max_string_length: usize,
}

impl Default for JsonLimits {
    fn default() -> Self {
        JsonLimits {
            max_size: 1024 * 1024,
            max_depth: 50,
            max_keys: 1000,
            max_string_length: 500 * 1024,
        }
    }
}

/// Parse `bytes` into a [Value], enforcing [JsonLimits] at every dimension.
///
/// Rejects oversized bodies before decoding at all; once decoded, walks the
/// resulting tree and fails if depth, key count, or any string exceeds its
/// bound.
pub fn parse(bytes: &[u8], limits: JsonLimits) -> Result<Value, Error> {
    if bytes.len() > limits.max_size {
        return Err(Error::LimitExceeded("request body exceeds max_size"));
    }

    let value: Value = serde_json::from_slice(bytes)?;
    let mut keys_seen = 0usize;
    check_node(&value, 0, limits, &mut keys_seen)?;
    Ok(value)
}

fn check_node(
    value: &Value,
    depth: usize,
    limits: JsonLimits,
    keys_seen: &mut usize,
) -> Result<(), Error> {
    if depth > limits.max_depth {
        return Err(Error::LimitExceeded("document exceeds max_depth"));
    }
    match value {
        Value::String(s) => {
            if s.len() > limits.max_string_length {
                return Err(Error::LimitExceeded("string exceeds max_string_length"));
            }
        }
        Value::Array(items) => {
            for item in items {
                check_node(item, depth + 1, limits, keys_seen)?;
            }
        }
        Value::Object(map) => {
            *keys_seen += map.len();
            if *keys_seen > limits.max_keys {
                return Err(Error::LimitExceeded("document exceeds max_keys"));
            }
            for (key, item) in map {
                if key.len() > limits.max_string_length {
                    return Err(Error::LimitExceeded("key exceeds max_string_length"));
                }
                check_node(item, depth + 1, limits, keys_seen)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// A single required field and the type it must deserialize as, per the
/// per-verb schema table described in spec.md §4.C3.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    /// Dot-free key within the top-level activity object.
    pub name: &'static str,
    /// Expected JSON type, for the error path reported on mismatch.
    pub kind: FieldKind,
}

/// The JSON type a [FieldSpec] requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Any JSON string.
    String,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
    /// A string or array of strings (ActivityPub's common "one-or-many" shape).
    StringOrArray,
}

/// The schema for one verb: required top-level fields plus an object-nesting
/// limit for the `object` field specifically (nested `Create` objects are a
/// common vector for depth abuse).
#[derive(Clone, Debug)]
pub struct VerbSchema {
    /// Fields the envelope must carry, and their expected shape.
    pub required: Vec<FieldSpec>,
    /// Extra nesting allowed inside `object`, beyond the envelope itself.
    pub max_object_nesting: usize,
}

/// Registry of verb -> schema, covering every verb in spec.md §1.
pub struct SchemaRegistry {
    schemas: HashMap<&'static str, VerbSchema>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut schemas = HashMap::new();
        let base = |max_object_nesting| VerbSchema {
            required: vec![
                FieldSpec { name: "id", kind: FieldKind::String },
                FieldSpec { name: "type", kind: FieldKind::String },
                FieldSpec { name: "actor", kind: FieldKind::String },
            ],
            max_object_nesting,
        };
        for verb in [
            "Update", "Delete", "Follow", "Accept", "Reject", "Like", "Dislike", "Undo", "Flag",
            "Add", "Remove", "Block",
        ] {
            schemas.insert(verb, base(4));
        }
        schemas.insert("Create", base(8));
        schemas.insert(
            "Announce",
            VerbSchema {
                required: vec![
                    FieldSpec { name: "id", kind: FieldKind::String },
                    FieldSpec { name: "type", kind: FieldKind::String },
                    FieldSpec { name: "actor", kind: FieldKind::String },
                    FieldSpec { name: "object", kind: FieldKind::StringOrArray },
                ],
                max_object_nesting: 8,
            },
        );
        SchemaRegistry { schemas }
    }
}

impl SchemaRegistry {
    /// Validate `doc` against the schema registered for `verb`. Verbs with no
    /// registered schema fall back to the base envelope fields only.
    pub fn validate(&self, verb: &str, doc: &Value) -> Result<(), Error> {
        let default_schema;
        let schema = match self.schemas.get(verb) {
            Some(s) => s,
            None => {
                default_schema = VerbSchema {
                    required: vec![
                        FieldSpec { name: "id", kind: FieldKind::String },
                        FieldSpec { name: "type", kind: FieldKind::String },
                        FieldSpec { name: "actor", kind: FieldKind::String },
                    ],
                    max_object_nesting: 4,
                };
                &default_schema
            }
        };

        let obj = doc.as_object().ok_or_else(|| Error::SchemaInvalid {
            path: "$".to_string(),
            reason: "activity must be a JSON object".to_string(),
        })?;

        for field in &schema.required {
            let value = obj.get(field.name).ok_or_else(|| Error::SchemaInvalid {
                path: field.name.to_string(),
                reason: "required field missing".to_string(),
            })?;
            let matches = match field.kind {
                FieldKind::String => value.is_string(),
                FieldKind::Object => value.is_object(),
                FieldKind::Array => value.is_array(),
                FieldKind::StringOrArray => value.is_string() || value.is_array(),
            };
            if !matches {
                return Err(Error::SchemaInvalid {
                    path: field.name.to_string(),
                    reason: format!("expected {:?}", field.kind),
                });
            }
        }

        if let Some(object) = obj.get("object") {
            let depth = object_nesting_depth(object);
            if depth > schema.max_object_nesting {
                return Err(Error::SchemaInvalid {
                    path: "object".to_string(),
                    reason: "nested object exceeds the verb's allowed nesting".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn object_nesting_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(object_nesting_depth).max().unwrap_or(0),
        Value::Array(items) => items.iter().map(object_nesting_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_body() {
        let limits = JsonLimits { max_size: 8, ..Default::default() };
        let err = parse(b"{\"a\":\"too long for sure\"}", limits).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn rejects_depth_bomb() {
        let mut body = String::from("1");
        for _ in 0..60 {
            body = format!("[{body}]");
        }
        let limits = JsonLimits::default();
        let err = parse(body.as_bytes(), limits).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn rejects_long_string() {
        let limits = JsonLimits { max_string_length: 4, ..Default::default() };
        let body = serde_json::json!({"a": "12345"});
        let err = parse(body.to_string().as_bytes(), limits).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn accepts_well_formed_follow() {
        let body = serde_json::json!({
            "id": "https://a.example/act/1",
            "type": "Follow",
            "actor": "https://a.example/u/alice",
            "object": "https://b.example/u/bob",
        });
        let value = parse(body.to_string().as_bytes(), JsonLimits::default()).unwrap();
        SchemaRegistry::default().validate("Follow", &value).unwrap();
    }

    #[test]
    fn rejects_missing_actor() {
        let body = serde_json::json!({
            "id": "https://a.example/act/1",
            "type": "Follow",
        });
        let registry = SchemaRegistry::default();
        let err = registry.validate("Follow", &body).unwrap_err();
        assert!(matches!(err, Error::SchemaInvalid { .. }));
    }

    #[test]
    fn rejects_over_nested_create_object() {
        let mut object = serde_json::json!({"type": "Note"});
        for _ in 0..10 {
            object = serde_json::json!({"type": "Note", "inReplyTo": object});
        }
        let body = serde_json::json!({
            "id": "https://a.example/act/1",
            "type": "Create",
            "actor": "https://a.example/u/alice",
            "object": object,
        });
        let err = SchemaRegistry::default().validate("Create", &body).unwrap_err();
        assert!(matches!(err, Error::SchemaInvalid { .. }));
    }
}
