//! Compiled program format
//!
//! An `Executable` is the unit the compiler hands to the core: global
//! bindings, a function-name to code-offset map, and one flat instruction
//! array. It is immutable once built and shared read-only by every thread in
//! a session, and it persists as a single JSON document next to the session
//! metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::errors::StoreError;
use crate::instruction::{Instruction, Opcode};
use crate::value::Value;

/// A compiled program
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Executable {
    /// Global name bindings (function pointers, foreign pointers, constants)
    pub bindings: BTreeMap<String, Value>,

    /// Code offset of each function's entry point
    pub locations: BTreeMap<String, usize>,

    /// The flat instruction array all offsets index into
    pub code: Vec<Instruction>,
}

impl Executable {
    /// Instruction at `ip`, if in bounds
    pub fn fetch(&self, ip: usize) -> Option<&Instruction> {
        self.code.get(ip)
    }

    /// Entry offset of a named function
    pub fn location_of(&self, name: &str) -> Option<usize> {
        self.locations.get(name).copied()
    }

    /// Global binding lookup (second tier of name resolution)
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /* ===================== Wire format ===================== */

    /// Encode as the interchange document:
    /// `{bindings: {name: [tag, data]}, locations: {name: offset}, code: [...]}`
    pub fn to_wire(&self) -> JsonValue {
        let bindings: serde_json::Map<String, JsonValue> = self
            .bindings
            .iter()
            .map(|(name, value)| (name.clone(), value.to_wire()))
            .collect();
        let locations: serde_json::Map<String, JsonValue> = self
            .locations
            .iter()
            .map(|(name, offset)| (name.clone(), json!(offset)))
            .collect();
        let code: Vec<JsonValue> = self.code.iter().map(Instruction::to_wire).collect();
        json!({
            "bindings": bindings,
            "locations": locations,
            "code": code,
        })
    }

    /// Decode the interchange document, re-validating every instruction
    pub fn from_wire(wire: &JsonValue) -> Result<Executable, StoreError> {
        let doc = wire
            .as_object()
            .ok_or_else(|| StoreError::Wire("executable is not an object".into()))?;

        let mut bindings = BTreeMap::new();
        let raw_bindings = doc
            .get("bindings")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::Wire("executable bindings".into()))?;
        for (name, value) in raw_bindings {
            bindings.insert(name.clone(), Value::from_wire(value)?);
        }

        let mut locations = BTreeMap::new();
        let raw_locations = doc
            .get("locations")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::Wire("executable locations".into()))?;
        for (name, offset) in raw_locations {
            let offset = offset
                .as_u64()
                .ok_or_else(|| StoreError::Wire(format!("location offset for '{name}'")))?;
            locations.insert(name.clone(), offset as usize);
        }

        let raw_code = doc
            .get("code")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Wire("executable code".into()))?;
        let code: Result<Vec<Instruction>, StoreError> =
            raw_code.iter().map(Instruction::from_wire).collect();
        let code = code?;

        for (name, offset) in &locations {
            if *offset > code.len() {
                return Err(StoreError::Wire(format!(
                    "function '{name}' points past end of code ({offset})"
                )));
            }
        }

        Ok(Executable {
            bindings,
            locations,
            code,
        })
    }
}

/* ===================== Builder ===================== */

/// Assembles an executable function by function.
///
/// Each `function` call records the entry offset, emits the parameter-binding
/// prologue, then the body. A `FunctionPtr` global binding is registered under
/// the same name so `Call` can resolve it by symbol.
#[derive(Debug, Default)]
pub struct ExecutableBuilder {
    bindings: BTreeMap<String, Value>,
    locations: BTreeMap<String, usize>,
    code: Vec<Instruction>,
}

impl ExecutableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global binding
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Add a function: records its entry offset, binds parameters from the
    /// stack (last argument is on top, so parameters bind in reverse), then
    /// appends the body. The body is responsible for its own `Return`.
    pub fn function(
        mut self,
        name: impl Into<String>,
        params: &[&str],
        body: Vec<Instruction>,
    ) -> Self {
        let name = name.into();
        self.locations.insert(name.clone(), self.code.len());
        self.bindings
            .insert(name.clone(), Value::function(name.clone()));

        for param in params.iter().rev() {
            self.code.push(Instruction {
                op: Opcode::Bind,
                operands: vec![Value::Symbol((*param).to_string())],
                loc: None,
            });
        }
        self.code.extend(body);
        self
    }

    pub fn build(self) -> Executable {
        Executable {
            bindings: self.bindings,
            locations: self.locations,
            code: self.code,
        }
    }
}
