//! Values flowing through a plan: plain data, result sets and single results

use crate::error::{Result, TetherError};
use crate::result::{ResultSet, TargetResult};
use serde_json::{json, Value};
use std::fmt;

/// A value bound in plan scope or produced by an expression
#[derive(Debug, Clone, PartialEq)]
pub enum PlanValue {
    Data(Value),
    ResultSet(ResultSet),
    Result(TargetResult),
}

impl PlanValue {
    pub fn null() -> Self {
        PlanValue::Data(Value::Null)
    }

    /// JSON view, used for output, comparisons and interpolation
    pub fn to_json(&self) -> Value {
        match self {
            PlanValue::Data(value) => value.clone(),
            PlanValue::ResultSet(set) => serde_json::to_value(set).unwrap_or(Value::Null),
            PlanValue::Result(result) => serde_json::to_value(result).unwrap_or(Value::Null),
        }
    }

    /// `undef`, `false`, and failed result sets are false; everything else is true
    pub fn truthy(&self) -> bool {
        match self {
            PlanValue::Data(Value::Null) | PlanValue::Data(Value::Bool(false)) => false,
            PlanValue::Data(_) => true,
            PlanValue::ResultSet(set) => set.ok(),
            PlanValue::Result(result) => result.ok(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PlanValue::Data(Value::Null) => "Undef",
            PlanValue::Data(Value::Bool(_)) => "Boolean",
            PlanValue::Data(Value::Number(n)) if n.is_f64() => "Float",
            PlanValue::Data(Value::Number(_)) => "Integer",
            PlanValue::Data(Value::String(_)) => "String",
            PlanValue::Data(Value::Array(_)) => "Array",
            PlanValue::Data(Value::Object(_)) => "Hash",
            PlanValue::ResultSet(_) => "ResultSet",
            PlanValue::Result(_) => "Result",
        }
    }

    /// Member access: result-set and result attributes, or a hash key
    pub fn member(&self, name: &str) -> Option<PlanValue> {
        match self {
            PlanValue::ResultSet(set) => match name {
                "ok" => Some(json!(set.ok()).into()),
                "count" => Some(json!(set.len()).into()),
                "names" | "targets" => Some(json!(set.names()).into()),
                "ok_set" => Some(PlanValue::ResultSet(set.ok_set())),
                "error_set" => Some(PlanValue::ResultSet(set.error_set())),
                "first" => Some(
                    set.first()
                        .cloned()
                        .map(PlanValue::Result)
                        .unwrap_or_else(PlanValue::null),
                ),
                _ => None,
            },
            PlanValue::Result(result) => match name {
                "ok" => Some(json!(result.ok()).into()),
                "target" => Some(json!(result.target.name).into()),
                "value" => Some(result.value().into()),
                "message" => Some(json!(result.message()).into()),
                "action" => Some(json!(result.action.to_string()).into()),
                other => result.value().get(other).cloned().map(PlanValue::Data),
            },
            PlanValue::Data(Value::Object(map)) => map.get(name).cloned().map(PlanValue::Data),
            PlanValue::Data(_) => None,
        }
    }

    /// Integer index into arrays and result sets (negative counts from the
    /// end), or a string key into hashes
    pub fn index(&self, key: &PlanValue) -> Result<PlanValue> {
        match (self, key.to_json()) {
            (PlanValue::ResultSet(set), Value::Number(n)) => {
                let results: Vec<&TargetResult> = set.iter().collect();
                Ok(position(n.as_i64(), results.len())
                    .map(|i| PlanValue::Result(results[i].clone()))
                    .unwrap_or_else(PlanValue::null))
            }
            (PlanValue::ResultSet(set), Value::String(name)) => Ok(set
                .get(&name)
                .cloned()
                .map(PlanValue::Result)
                .unwrap_or_else(PlanValue::null)),
            (PlanValue::Data(Value::Array(items)), Value::Number(n)) => {
                Ok(position(n.as_i64(), items.len())
                    .map(|i| PlanValue::Data(items[i].clone()))
                    .unwrap_or_else(PlanValue::null))
            }
            (PlanValue::Data(Value::String(s)), Value::Number(n)) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(position(n.as_i64(), chars.len())
                    .map(|i| PlanValue::Data(Value::from(chars[i].to_string())))
                    .unwrap_or_else(PlanValue::null))
            }
            (PlanValue::Data(Value::Object(map)), Value::String(k)) => {
                Ok(map.get(&k).cloned().map(PlanValue::Data).unwrap_or_else(PlanValue::null))
            }
            (PlanValue::Result(_), Value::String(k)) => {
                Ok(self.member(&k).unwrap_or_else(PlanValue::null))
            }
            (_, key) => Err(TetherError::Expression(format!(
                "cannot index {} with {}",
                self.type_name(),
                key
            ))),
        }
    }
}

fn position(index: Option<i64>, len: usize) -> Option<usize> {
    let index = index?;
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

impl From<Value> for PlanValue {
    fn from(value: Value) -> Self {
        PlanValue::Data(value)
    }
}

impl fmt::Display for PlanValue {
    /// Strings render bare; everything else renders as JSON
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Value::String(s) => f.write_str(&s),
            Value::Null => Ok(()),
            other => write!(f, "{}", other),
        }
    }
}

/// Declared type of a plan parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Numeric,
    Boolean,
    Array(Option<Box<ParamType>>),
    Hash,
    TargetSpec,
    Any,
    Optional(Box<ParamType>),
}

impl ParamType {
    /// Parse a type expression such as `Optional[Array[String]]`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (head, inner) = match text.find('[') {
            Some(open) if text.ends_with(']') => {
                (&text[..open], Some(&text[open + 1..text.len() - 1]))
            }
            Some(_) => {
                return Err(TetherError::Validation(format!(
                    "malformed type '{}'",
                    text
                )))
            }
            None => (text, None),
        };

        let ty = match (head, inner) {
            ("String", None) => ParamType::String,
            ("Integer", None) => ParamType::Integer,
            ("Float", None) => ParamType::Float,
            ("Numeric", None) => ParamType::Numeric,
            ("Boolean", None) => ParamType::Boolean,
            ("Hash", None) => ParamType::Hash,
            ("TargetSpec", None) => ParamType::TargetSpec,
            ("Any", None) => ParamType::Any,
            ("Array", None) => ParamType::Array(None),
            ("Array", Some(inner)) => ParamType::Array(Some(Box::new(ParamType::parse(inner)?))),
            ("Optional", Some(inner)) => ParamType::Optional(Box::new(ParamType::parse(inner)?)),
            _ => {
                return Err(TetherError::Validation(format!(
                    "unknown type '{}'",
                    text
                )))
            }
        };
        Ok(ty)
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ParamType::Optional(_) | ParamType::Any)
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::Optional(inner) => value.is_null() || inner.matches(value),
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_f64(),
            ParamType::Numeric => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Hash => value.is_object(),
            ParamType::Array(None) => value.is_array(),
            ParamType::Array(Some(inner)) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.matches(item))),
            ParamType::TargetSpec => match value {
                Value::String(_) => true,
                Value::Array(items) => items.iter().all(|item| ParamType::TargetSpec.matches(item)),
                Value::Object(map) => map.get("name").is_some_and(Value::is_string),
                _ => false,
            },
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => f.write_str("String"),
            ParamType::Integer => f.write_str("Integer"),
            ParamType::Float => f.write_str("Float"),
            ParamType::Numeric => f.write_str("Numeric"),
            ParamType::Boolean => f.write_str("Boolean"),
            ParamType::Array(None) => f.write_str("Array"),
            ParamType::Array(Some(inner)) => write!(f, "Array[{}]", inner),
            ParamType::Hash => f.write_str("Hash"),
            ParamType::TargetSpec => f.write_str("TargetSpec"),
            ParamType::Any => f.write_str("Any"),
            ParamType::Optional(inner) => write!(f, "Optional[{}]", inner),
        }
    }
}
