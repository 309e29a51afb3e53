//! Tool parameter schemas.
//!
//! A tool describes its arguments as a flat list of named, typed
//! parameters. The same description is rendered to JSON Schema for the
//! model and used to validate the model's arguments before invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON type of a single tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            // Models often send `30.0` for an integer field.
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// One named parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    pub required: bool,
    /// Allowed values for string parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            allowed: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    /// Restrict a string parameter to a fixed set of values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }
}

/// Render a parameter list as a JSON Schema object.
pub fn to_json_schema(params: &[ParameterSpec]) -> Value {
    let mut properties = Map::new();
    for p in params {
        let mut prop = json!({
            "type": p.kind.as_str(),
            "description": p.description,
        });
        if !p.allowed.is_empty() {
            prop["enum"] = json!(p.allowed);
        }
        properties.insert(p.name.clone(), prop);
    }
    let required: Vec<&str> = params
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Check `args` against `params`.
///
/// Arguments must be a JSON object (`null` is treated as `{}`); every
/// required parameter must be present and non-null; every present
/// parameter must have the declared type. Unknown keys are rejected so a
/// misspelt optional argument is reported instead of silently ignored.
pub fn validate(params: &[ParameterSpec], args: &Value) -> Result<(), String> {
    let empty = Map::new();
    let object = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(format!("arguments must be an object, got {}", type_name(other))),
    };

    for p in params {
        match object.get(&p.name) {
            None | Some(Value::Null) if p.required => {
                return Err(format!("missing required parameter '{}'", p.name));
            }
            None | Some(Value::Null) => {}
            Some(value) => {
                if !p.kind.matches(value) {
                    return Err(format!(
                        "parameter '{}' must be of type {}, got {}",
                        p.name,
                        p.kind.as_str(),
                        type_name(value)
                    ));
                }
                if !p.allowed.is_empty()
                    && let Some(s) = value.as_str()
                    && !p.allowed.iter().any(|a| a == s)
                {
                    return Err(format!(
                        "parameter '{}' must be one of [{}], got '{}'",
                        p.name,
                        p.allowed.join(", "),
                        s
                    ));
                }
            }
        }
    }

    if let Some(unknown) = object.keys().find(|k| !params.iter().any(|p| &p.name == *k)) {
        return Err(format!("unknown parameter '{unknown}'"));
    }

    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
