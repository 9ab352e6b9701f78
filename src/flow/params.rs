//! Declared flow parameters and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{ParameterIssue, ValidationError};

/// Parameters passed to a flow, keyed by name.
pub type Parameters = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Any,
    Int,
    Float,
    Str,
    Bool,
    List,
    Object,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Any => "any",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::Bool => "bool",
            ParamKind::List => "list",
            ParamKind::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    /// `None` marks the parameter as required.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Ordered declaration of the parameters a flow accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    params: Vec<ParameterSpec>,
    #[serde(default)]
    allow_extra: bool,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParameterSpec {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        self.params.push(ParameterSpec {
            name: name.into(),
            kind,
            default: Some(default),
        });
        self
    }

    /// Accept parameters that are not declared, passing them through untouched.
    pub fn allow_extra(mut self, allow: bool) -> Self {
        self.allow_extra = allow;
        self
    }

    pub fn params(&self) -> &[ParameterSpec] {
        &self.params
    }

    /// Check `parameters` against the schema.
    ///
    /// Returns the parameters with defaults filled in and values coerced to their
    /// declared kind. Every issue found is reported, not only the first.
    pub fn validate(&self, parameters: &Parameters) -> Result<Parameters, ValidationError> {
        let mut issues = Vec::new();
        let mut validated = Parameters::new();

        for spec in &self.params {
            match parameters.get(&spec.name) {
                Some(value) => match coerce(spec, value) {
                    Some(coerced) => {
                        validated.insert(spec.name.clone(), coerced);
                    }
                    None => issues.push(ParameterIssue::WrongType {
                        name: spec.name.clone(),
                        expected: spec.kind.to_string(),
                        found: describe(value),
                    }),
                },
                None => match &spec.default {
                    Some(default) => {
                        validated.insert(spec.name.clone(), default.clone());
                    }
                    None => issues.push(ParameterIssue::Missing(spec.name.clone())),
                },
            }
        }

        for (name, value) in parameters {
            if self.params.iter().any(|spec| &spec.name == name) {
                continue;
            }
            if self.allow_extra {
                validated.insert(name.clone(), value.clone());
            } else {
                issues.push(ParameterIssue::Unexpected(name.clone()));
            }
        }

        if issues.is_empty() {
            Ok(validated)
        } else {
            Err(ValidationError { issues })
        }
    }
}

fn coerce(spec: &ParameterSpec, value: &Value) -> Option<Value> {
    if value.is_null() {
        let nullable = spec.kind == ParamKind::Any || !spec.is_required();
        return nullable.then_some(Value::Null);
    }
    match (spec.kind, value) {
        (ParamKind::Any, v) => Some(v.clone()),
        (ParamKind::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
        (ParamKind::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (ParamKind::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (ParamKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (ParamKind::Str, Value::String(_)) => Some(value.clone()),
        (ParamKind::Bool, Value::Bool(_)) => Some(value.clone()),
        (ParamKind::Bool, Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (ParamKind::List, Value::Array(_)) => Some(value.clone()),
        (ParamKind::Object, Value::Object(_)) => Some(value.clone()),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("bool {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}
