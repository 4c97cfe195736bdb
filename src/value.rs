//! Runtime value types
//!
//! Every value the VM touches is one of these variants. All of them are
//! JSON-safe: a value round-trips losslessly through serde and through the
//! executable wire format, and no variant ever holds a native reference.
//! Pointers (functions, foreign functions, futures) are plain identifiers
//! resolved through the executable or the controller.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::errors::StoreError;

/// Identifier of one logical thread of execution
pub type Vmid = u32;

/// Opaque pointer into the activation record arena
pub type ArecPtr = u64;

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    // Atomic
    True,
    False,
    Null,

    // Literal
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),

    // Compound
    List(Vec<Value>),
    Hash(BTreeMap<String, Value>),
    Quote(Box<Value>),

    // Pointer
    FunctionPtr {
        name: String,
        closure: Option<ArecPtr>,
    },
    ForeignPtr {
        name: String,
        module: String,
    },
    FuturePtr {
        vmid: Vmid,
    },
}

impl Value {
    /// Check if value is truthy (for conditionals)
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::False | Value::Null)
    }

    /// Wrap a host boolean
    pub fn from_bool(b: bool) -> Self {
        if b {
            Value::True
        } else {
            Value::False
        }
    }

    /// Build a function pointer with no closure environment
    pub fn function(name: impl Into<String>) -> Self {
        Value::FunctionPtr {
            name: name.into(),
            closure: None,
        }
    }

    /// Build a foreign pointer
    pub fn foreign(module: impl Into<String>, name: impl Into<String>) -> Self {
        Value::ForeignPtr {
            name: name.into(),
            module: module.into(),
        }
    }

    /// The tag used in diagnostics and the wire format
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::True => "True",
            Value::False => "False",
            Value::Null => "Null",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Symbol(_) => "Symbol",
            Value::List(_) => "List",
            Value::Hash(_) => "Hash",
            Value::Quote(_) => "Quote",
            Value::FunctionPtr { .. } => "FunctionPtr",
            Value::ForeignPtr { .. } => "ForeignPtr",
            Value::FuturePtr { .. } => "FuturePtr",
        }
    }

    /// Whether a future pointer occurs anywhere inside this value.
    ///
    /// `Wait` only accepts a bare future on top of the stack. The language
    /// requires per-element waiting, so a compound value with a buried future
    /// is a reportable error rather than an implicit deep wait.
    pub fn contains_future_ptr(&self) -> bool {
        match self {
            Value::FuturePtr { .. } => true,
            Value::List(items) => items.iter().any(Value::contains_future_ptr),
            Value::Hash(map) => map.values().any(Value::contains_future_ptr),
            Value::Quote(inner) => inner.contains_future_ptr(),
            _ => false,
        }
    }

    /* ===================== Plain JSON ===================== */

    /// Convert plain JSON (program inputs, host data) into a value
    pub fn from_json(json: &JsonValue) -> Result<Value, StoreError> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::from_bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(StoreError::Wire(format!("unrepresentable number {n}")))
                }
            }
            JsonValue::String(s) => Ok(Value::Str(s.clone())),
            JsonValue::Array(items) => {
                let decoded: Result<Vec<Value>, StoreError> =
                    items.iter().map(Value::from_json).collect();
                Ok(Value::List(decoded?))
            }
            JsonValue::Object(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    map.insert(k.clone(), Value::from_json(v)?);
                }
                Ok(Value::Hash(map))
            }
        }
    }

    /// Convert back to plain JSON. Pointer values have no plain JSON
    /// equivalent and come out as rendered strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::True => JsonValue::Bool(true),
            Value::False => JsonValue::Bool(false),
            Value::Null => JsonValue::Null,
            Value::Int(n) => json!(n),
            Value::Float(f) => json!(f),
            Value::Str(s) | Value::Symbol(s) => json!(s),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Hash(map) => {
                let entries: serde_json::Map<String, JsonValue> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                JsonValue::Object(entries)
            }
            Value::Quote(inner) => inner.to_json(),
            other => json!(other.to_string()),
        }
    }

    /* ===================== Wire format ===================== */

    /// Encode as the `[TypeTag, data]` wire pair
    pub fn to_wire(&self) -> JsonValue {
        match self {
            Value::True => json!(["True", JsonValue::Null]),
            Value::False => json!(["False", JsonValue::Null]),
            Value::Null => json!(["Null", JsonValue::Null]),
            Value::Int(n) => json!(["Int", n]),
            Value::Float(f) => json!(["Float", f]),
            Value::Str(s) => json!(["Str", s]),
            Value::Symbol(s) => json!(["Symbol", s]),
            Value::List(items) => {
                let encoded: Vec<JsonValue> = items.iter().map(Value::to_wire).collect();
                json!(["List", encoded])
            }
            Value::Hash(map) => {
                let encoded: serde_json::Map<String, JsonValue> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_wire()))
                    .collect();
                json!(["Hash", encoded])
            }
            Value::Quote(inner) => json!(["Quote", inner.to_wire()]),
            Value::FunctionPtr { name, closure } => {
                json!(["FunctionPtr", { "name": name, "closure": closure }])
            }
            Value::ForeignPtr { name, module } => {
                json!(["ForeignPtr", { "name": name, "module": module }])
            }
            Value::FuturePtr { vmid } => json!(["FuturePtr", vmid]),
        }
    }

    /// Decode from the `[TypeTag, data]` wire pair
    pub fn from_wire(wire: &JsonValue) -> Result<Value, StoreError> {
        let pair = wire
            .as_array()
            .ok_or_else(|| malformed("value is not a [tag, data] pair", wire))?;
        let tag = pair
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| malformed("value tag is not a string", wire))?;
        let data = pair.get(1).unwrap_or(&JsonValue::Null);

        match tag {
            "True" => Ok(Value::True),
            "False" => Ok(Value::False),
            "Null" => Ok(Value::Null),
            "Int" => data
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| malformed("Int data", data)),
            "Float" => data
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| malformed("Float data", data)),
            "Str" => data
                .as_str()
                .map(|s| Value::Str(s.to_string()))
                .ok_or_else(|| malformed("Str data", data)),
            "Symbol" => data
                .as_str()
                .map(|s| Value::Symbol(s.to_string()))
                .ok_or_else(|| malformed("Symbol data", data)),
            "List" => {
                let items = data
                    .as_array()
                    .ok_or_else(|| malformed("List data", data))?;
                let decoded: Result<Vec<Value>, StoreError> =
                    items.iter().map(Value::from_wire).collect();
                Ok(Value::List(decoded?))
            }
            "Hash" => {
                let entries = data
                    .as_object()
                    .ok_or_else(|| malformed("Hash data", data))?;
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    map.insert(k.clone(), Value::from_wire(v)?);
                }
                Ok(Value::Hash(map))
            }
            "Quote" => Ok(Value::Quote(Box::new(Value::from_wire(data)?))),
            "FunctionPtr" => {
                let name = data
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| malformed("FunctionPtr name", data))?;
                let closure = match data.get("closure") {
                    None | Some(JsonValue::Null) => None,
                    Some(v) => Some(
                        v.as_u64()
                            .ok_or_else(|| malformed("FunctionPtr closure", data))?,
                    ),
                };
                Ok(Value::FunctionPtr {
                    name: name.to_string(),
                    closure,
                })
            }
            "ForeignPtr" => {
                let name = data
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| malformed("ForeignPtr name", data))?;
                let module = data
                    .get("module")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| malformed("ForeignPtr module", data))?;
                Ok(Value::ForeignPtr {
                    name: name.to_string(),
                    module: module.to_string(),
                })
            }
            "FuturePtr" => data
                .as_u64()
                .map(|n| Value::FuturePtr { vmid: n as Vmid })
                .ok_or_else(|| malformed("FuturePtr data", data)),
            other => Err(StoreError::Wire(format!("unknown value tag '{other}'"))),
        }
    }
}

fn malformed(what: &str, got: &JsonValue) -> StoreError {
    StoreError::Wire(format!("malformed {what}: {got}"))
}

impl fmt::Display for Value {
    /// Human rendering, used by `Print` and for session stdout
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::True => write!(f, "true"),
            Value::False => write!(f, "false"),
            Value::Null => write!(f, "null"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Hash(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Quote(inner) => write!(f, "'{inner}"),
            Value::FunctionPtr { name, .. } => write!(f, "#<fn {name}>"),
            Value::ForeignPtr { module, name } => write!(f, "#<foreign {module}.{name}>"),
            Value::FuturePtr { vmid } => write!(f, "#<future {vmid}>"),
        }
    }
}
