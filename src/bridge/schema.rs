//! JSON-Schema → host parameter model.
//!
//! | JSON Schema                | [`ParamType`]            |
//! |----------------------------|--------------------------|
//! | `string`                   | `String`                 |
//! | `string` + `enum`          | `Choice(values)`         |
//! | `number` / `integer`       | `Number`                 |
//! | `boolean`                  | `Boolean`                |
//! | `array`                    | `Array(items)` (`Any` without `items`) |
//! | `object`                   | `Object`                 |
//! | anything else / absent     | `Any`                    |

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Host-side type of one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum ParamType {
    String,
    /// A closed set of string values.
    Choice(Vec<String>),
    Number,
    Boolean,
    Array(Box<ParamType>),
    /// Unconstrained key-value mapping.
    Object,
    /// Unconstrained value.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: Option<String>,
    pub required: bool,
}

/// Parameters of one bridged tool, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolParameters {
    pub params: Vec<Parameter>,
}

/// The schema's `type`, taking the first non-null entry of a type array.
fn schema_type(schema: &Value) -> Option<&str> {
    match schema.get("type")? {
        Value::String(t) => Some(t.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    }
}

impl ParamType {
    /// Convert one property schema.
    pub fn from_schema(schema: &Value) -> Self {
        match schema_type(schema) {
            Some("string") => match schema.get("enum").and_then(Value::as_array) {
                Some(values) => {
                    let choices: Vec<String> = values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                    if choices.is_empty() {
                        ParamType::String
                    } else {
                        ParamType::Choice(choices)
                    }
                }
                None => ParamType::String,
            },
            Some("number") | Some("integer") => ParamType::Number,
            Some("boolean") => ParamType::Boolean,
            Some("array") => {
                let items = schema
                    .get("items")
                    .map(ParamType::from_schema)
                    .unwrap_or(ParamType::Any);
                ParamType::Array(Box::new(items))
            }
            Some("object") => ParamType::Object,
            _ => ParamType::Any,
        }
    }

    /// Render back to JSON Schema for the host's function definitions.
    pub fn to_json_schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Choice(values) => json!({"type": "string", "enum": values}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Array(items) => json!({"type": "array", "items": items.to_json_schema()}),
            ParamType::Object => json!({"type": "object"}),
            ParamType::Any => json!({}),
        }
    }
}

impl ToolParameters {
    /// Convert a tool's `inputSchema`. Non-object schemas yield no parameters.
    pub fn from_input_schema(schema: &Value) -> Self {
        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return Self::default();
        };

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut params: Vec<Parameter> = properties
            .iter()
            .map(|(name, prop)| Parameter {
                name: name.clone(),
                param_type: ParamType::from_schema(prop),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                required: required.contains(&name.as_str()),
            })
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));

        Self { params }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn required(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.required)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Render as an object JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut schema = param.param_type.to_json_schema();
            if let (Some(desc), Some(obj)) = (&param.description, schema.as_object_mut()) {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(param.name.clone(), schema);
        }
        let required: Vec<&str> = self.required().map(|p| p.name.as_str()).collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
