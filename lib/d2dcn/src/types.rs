//! Canonical value types, the ASCII wire codec and field-schema validation.
//!
//! Every payload crossing the network is either a JSON object (command plane)
//! or a single ASCII-encoded value (info plane). Both planes share the same
//! closed set of value types.

use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use serde_json;

/// Closed enum of the wire-level value types. The bare `Array` type is
/// internal: it is only ever detected for an empty JSON list, whose element
/// type cannot be known, and it matches any declared `*_array` type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    BoolArray,
    IntArray,
    FloatArray,
    StringArray,
    Array,
}

impl ValueType {
    #[inline]
    pub fn is_array(self) -> bool {
        match self {
            ValueType::BoolArray
            | ValueType::IntArray
            | ValueType::FloatArray
            | ValueType::StringArray
            | ValueType::Array => true,
            _ => false,
        }
    }
}

/// A concrete, typed value held by an info writer or reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl Value {
    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::String,
            Value::BoolArray(_) => ValueType::BoolArray,
            Value::IntArray(_) => ValueType::IntArray,
            Value::FloatArray(_) => ValueType::FloatArray,
            Value::StrArray(_) => ValueType::StringArray,
        }
    }

    /// The zero of a value type: `0`, `0.0`, `""`, `false`, or the empty list.
    /// The bare `Array` type has no zero; writers are never created with it.
    pub fn zero(value_type: ValueType) -> Option<Value> {
        match value_type {
            ValueType::Bool => Some(Value::Bool(false)),
            ValueType::Int => Some(Value::Int(0)),
            ValueType::Float => Some(Value::Float(0.0)),
            ValueType::String => Some(Value::Str(String::new())),
            ValueType::BoolArray => Some(Value::BoolArray(Vec::new())),
            ValueType::IntArray => Some(Value::IntArray(Vec::new())),
            ValueType::FloatArray => Some(Value::FloatArray(Vec::new())),
            ValueType::StringArray => Some(Value::StrArray(Vec::new())),
            ValueType::Array => None,
        }
    }
}

/// Encode a value to its ASCII wire form: scalars in their obvious string
/// form with `bool` as `1`/`0`, arrays as JSON.
pub fn encode_ascii(value: &Value) -> String {
    match value {
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Str(v) => v.clone(),
        Value::BoolArray(v) => serde_json::to_string(v).expect("Error encoding array"),
        Value::IntArray(v) => serde_json::to_string(v).expect("Error encoding array"),
        Value::FloatArray(v) => serde_json::to_string(v).expect("Error encoding array"),
        Value::StrArray(v) => serde_json::to_string(v).expect("Error encoding array"),
    }
}

/// Decode the ASCII wire form of a value with a known declared type. Returns
/// `None` on any parse failure.
pub fn decode_ascii(text: &str, value_type: ValueType) -> Option<Value> {
    match value_type {
        ValueType::Bool => match text {
            "1" => Some(Value::Bool(true)),
            "0" => Some(Value::Bool(false)),
            _ => None,
        },
        ValueType::Int => text.parse::<i64>().ok().map(Value::Int),
        ValueType::Float => text.parse::<f64>().ok().map(Value::Float),
        ValueType::String => Some(Value::Str(text.to_string())),
        ValueType::BoolArray => serde_json::from_str(text).ok().map(Value::BoolArray),
        ValueType::IntArray => serde_json::from_str(text).ok().map(Value::IntArray),
        ValueType::FloatArray => serde_json::from_str(text).ok().map(Value::FloatArray),
        ValueType::StringArray => serde_json::from_str(text).ok().map(Value::StrArray),
        ValueType::Array => None,
    }
}

/// Detect the value type of a JSON value. Empty lists detect as the bare
/// `Array` type; mixed or nested lists, objects and null have no type.
pub fn get_type(value: &serde_json::Value) -> Option<ValueType> {
    match value {
        serde_json::Value::Bool(_) => Some(ValueType::Bool),
        serde_json::Value::Number(num) => {
            if num.is_i64() || num.is_u64() {
                Some(ValueType::Int)
            } else {
                Some(ValueType::Float)
            }
        }
        serde_json::Value::String(_) => Some(ValueType::String),
        serde_json::Value::Array(items) => {
            let mut detected = None;
            for item in items {
                let element = match get_type(item) {
                    Some(t) if !t.is_array() => t,
                    _ => return None,
                };

                match detected {
                    None => detected = Some(element),
                    Some(prev) if prev != element => return None,
                    _ => (),
                }
            }

            match detected {
                None => Some(ValueType::Array),
                Some(ValueType::Bool) => Some(ValueType::BoolArray),
                Some(ValueType::Int) => Some(ValueType::IntArray),
                Some(ValueType::Float) => Some(ValueType::FloatArray),
                Some(ValueType::String) => Some(ValueType::StringArray),
                _ => None,
            }
        }
        _ => None,
    }
}

/// True when the detected type of `value` equals the declared type. The empty
/// list matches any declared `*_array` type.
pub fn check_field_type(value: &serde_json::Value, declared: ValueType) -> bool {
    match get_type(value) {
        Some(detected) if detected == declared => true,
        Some(ValueType::Array) => declared.is_array(),
        _ => false,
    }
}

/// Declared shape of one command argument or response field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub optional: bool,
}

impl FieldDef {
    #[inline]
    pub fn mandatory(value_type: ValueType) -> FieldDef {
        FieldDef {
            value_type,
            optional: false,
        }
    }

    #[inline]
    pub fn optional(value_type: ValueType) -> FieldDef {
        FieldDef {
            value_type,
            optional: true,
        }
    }
}

/// Argument-name to field-shape mapping for one side of a command.
pub type FieldSchema = HashMap<String, FieldDef>;

/// Validate actual fields against a schema: every actual field must exist in
/// the schema and typecheck, every non-optional schema field must be present.
/// Extra actual fields fail, missing optional fields pass.
pub fn check_fields(actual: &serde_json::Map<String, serde_json::Value>, schema: &FieldSchema) -> bool {
    for (name, value) in actual {
        let def = match schema.get(name) {
            Some(def) => def,
            None => return false,
        };

        if !check_field_type(value, def.value_type) {
            return false;
        }
    }

    for (name, def) in schema {
        if !def.optional && !actual.contains_key(name.as_str()) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar_values() -> Vec<Value> {
        vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Float(1.5),
            Value::Str("hello world".to_string()),
        ]
    }

    fn array_values() -> Vec<Value> {
        vec![
            Value::BoolArray(vec![true, false, true]),
            Value::IntArray(vec![1, -2, 3]),
            Value::FloatArray(vec![1.5, 2.5]),
            Value::StrArray(vec!["a".to_string(), "b".to_string()]),
        ]
    }

    #[test]
    fn test_encode_scalar_forms() {
        assert_eq!(encode_ascii(&Value::Bool(true)), "1");
        assert_eq!(encode_ascii(&Value::Bool(false)), "0");
        assert_eq!(encode_ascii(&Value::Int(10)), "10");
        assert_eq!(encode_ascii(&Value::Float(2.5)), "2.5");
        assert_eq!(encode_ascii(&Value::Str("raw".to_string())), "raw");
    }

    #[test]
    fn test_roundtrip_scalars_and_arrays() {
        for value in scalar_values().into_iter().chain(array_values()) {
            let encoded = encode_ascii(&value);
            let decoded = decode_ascii(&encoded, value.value_type());
            assert_eq!(decoded, Some(value));
        }
    }

    #[test]
    fn test_roundtrip_empty_arrays() {
        let value = Value::IntArray(Vec::new());
        let encoded = encode_ascii(&value);
        assert_eq!(encoded, "[]");
        assert_eq!(decode_ascii(&encoded, ValueType::IntArray), Some(value));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(decode_ascii("yes", ValueType::Bool), None);
        assert_eq!(decode_ascii("1.5", ValueType::Int), None);
        assert_eq!(decode_ascii("abc", ValueType::Float), None);
        assert_eq!(decode_ascii("[1, \"x\"]", ValueType::IntArray), None);
        assert_eq!(decode_ascii("{}", ValueType::StringArray), None);
    }

    #[test]
    fn test_get_type_scalars() {
        assert_eq!(get_type(&json!(true)), Some(ValueType::Bool));
        assert_eq!(get_type(&json!(5)), Some(ValueType::Int));
        assert_eq!(get_type(&json!(5.5)), Some(ValueType::Float));
        assert_eq!(get_type(&json!("x")), Some(ValueType::String));
        assert_eq!(get_type(&json!(null)), None);
        assert_eq!(get_type(&json!({"a": 1})), None);
    }

    #[test]
    fn test_get_type_arrays() {
        assert_eq!(get_type(&json!([])), Some(ValueType::Array));
        assert_eq!(get_type(&json!([true])), Some(ValueType::BoolArray));
        assert_eq!(get_type(&json!([1, 2])), Some(ValueType::IntArray));
        assert_eq!(get_type(&json!([1.5])), Some(ValueType::FloatArray));
        assert_eq!(get_type(&json!(["a"])), Some(ValueType::StringArray));
        assert_eq!(get_type(&json!([1, "a"])), None);
        assert_eq!(get_type(&json!([[1]])), None);
    }

    #[test]
    fn test_empty_array_matches_any_array_type() {
        for declared in [
            ValueType::BoolArray,
            ValueType::IntArray,
            ValueType::FloatArray,
            ValueType::StringArray,
        ]
        .iter()
        {
            assert!(check_field_type(&json!([]), *declared));
        }

        assert!(!check_field_type(&json!([]), ValueType::Int));
    }

    fn schema() -> FieldSchema {
        let mut schema = FieldSchema::new();
        schema.insert("arg1".to_string(), FieldDef::mandatory(ValueType::Int));
        schema.insert("arg2".to_string(), FieldDef::optional(ValueType::String));
        schema
    }

    fn as_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_check_fields_ok() {
        let schema = schema();
        assert!(check_fields(&as_map(json!({"arg1": 1})), &schema));
        assert!(check_fields(&as_map(json!({"arg1": 1, "arg2": "x"})), &schema));
    }

    #[test]
    fn test_check_fields_missing_mandatory() {
        assert!(!check_fields(&as_map(json!({"arg2": "x"})), &schema()));
    }

    #[test]
    fn test_check_fields_extra_field() {
        assert!(!check_fields(&as_map(json!({"arg1": 1, "other": 2})), &schema()));
    }

    #[test]
    fn test_check_fields_type_mismatch() {
        assert!(!check_fields(&as_map(json!({"arg1": "not int"})), &schema()));
    }

    #[test]
    fn test_field_def_deserialize_defaults() {
        let def: FieldDef = serde_json::from_str(r#"{"type": "int_array"}"#).unwrap();
        assert_eq!(def.value_type, ValueType::IntArray);
        assert!(!def.optional);

        assert!(serde_json::from_str::<FieldDef>(r#"{"type": "unknown"}"#).is_err());
        assert!(serde_json::from_str::<FieldDef>(r#"{"type": "int", "optional": 1}"#).is_err());
    }
}
