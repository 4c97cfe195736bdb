//! Bytecode instruction definitions
//!
//! Instructions operate on a per-thread value stack. Every operand is a
//! `Value`, so instructions (and whole executables) serialize without
//! reference to any live object. Operand arity and types are checked once,
//! at construction, never during dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::errors::{StoreError, VmError, VmResult};
use crate::value::Value;

/// Opcodes of the VM instruction set
///
/// A closed sum type: the machine dispatches with an exhaustive match, so a
/// new opcode fails to compile until every dispatch site handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    // Control flow
    /// Unconditional jump. Operand: absolute code offset.
    Jump,
    /// Pop the condition; jump to the operand offset when truthy.
    JumpIf,

    // Calls
    /// Synchronous call, resolved eagerly. Operands: callee, argc.
    Call,
    /// Fork a thread for the callee and push its future. Operands: callee, argc.
    ACall,
    /// Return top of stack to the caller frame, or finish the thread.
    Return,

    // Data stack
    /// Push the literal operand.
    PushV,
    /// Push the value bound to the operand symbol (three-tier lookup).
    PushB,
    /// Pop into a local binding named by the operand symbol.
    Bind,
    /// Pop and discard.
    Pop,

    // Structural
    /// Pop n values (operand), push them as a list in source order.
    MakeList,
    /// Pop n key/value pairs (operand), push a hash.
    MakeHash,
    /// Pop a list, push its first element.
    First,
    /// Pop a list, push the list without its first element.
    Rest,
    /// Pop an index, then a list; push the element at that index.
    Nth,
    /// Pop a list or string, push its length.
    Len,

    // Arithmetic / comparison
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Lt,
    Gt,

    // Foreign-effect primitives
    /// Pop a value, append its rendering to session stdout.
    Print,
    /// Pop a millisecond count, pause this thread in place.
    Sleep,

    /// Suspend on the future at the top of the stack until it resolves.
    Wait,
    /// Pop a value and raise it as a user-level condition.
    Signal,
}

impl Opcode {
    /// Wire name of this opcode
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Jump => "Jump",
            Opcode::JumpIf => "JumpIf",
            Opcode::Call => "Call",
            Opcode::ACall => "ACall",
            Opcode::Return => "Return",
            Opcode::PushV => "PushV",
            Opcode::PushB => "PushB",
            Opcode::Bind => "Bind",
            Opcode::Pop => "Pop",
            Opcode::MakeList => "MakeList",
            Opcode::MakeHash => "MakeHash",
            Opcode::First => "First",
            Opcode::Rest => "Rest",
            Opcode::Nth => "Nth",
            Opcode::Len => "Len",
            Opcode::Add => "Add",
            Opcode::Sub => "Sub",
            Opcode::Mul => "Mul",
            Opcode::Div => "Div",
            Opcode::Eq => "Eq",
            Opcode::Lt => "Lt",
            Opcode::Gt => "Gt",
            Opcode::Print => "Print",
            Opcode::Sleep => "Sleep",
            Opcode::Wait => "Wait",
            Opcode::Signal => "Signal",
        }
    }

    /// Parse a wire name back into an opcode
    pub fn from_name(name: &str) -> Option<Opcode> {
        let op = match name {
            "Jump" => Opcode::Jump,
            "JumpIf" => Opcode::JumpIf,
            "Call" => Opcode::Call,
            "ACall" => Opcode::ACall,
            "Return" => Opcode::Return,
            "PushV" => Opcode::PushV,
            "PushB" => Opcode::PushB,
            "Bind" => Opcode::Bind,
            "Pop" => Opcode::Pop,
            "MakeList" => Opcode::MakeList,
            "MakeHash" => Opcode::MakeHash,
            "First" => Opcode::First,
            "Rest" => Opcode::Rest,
            "Nth" => Opcode::Nth,
            "Len" => Opcode::Len,
            "Add" => Opcode::Add,
            "Sub" => Opcode::Sub,
            "Mul" => Opcode::Mul,
            "Div" => Opcode::Div,
            "Eq" => Opcode::Eq,
            "Lt" => Opcode::Lt,
            "Gt" => Opcode::Gt,
            "Print" => Opcode::Print,
            "Sleep" => Opcode::Sleep,
            "Wait" => Opcode::Wait,
            "Signal" => Opcode::Signal,
            _ => return None,
        };
        Some(op)
    }
}

/// Source position carried for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    /// The source text of the originating expression
    pub text: String,
    pub column: u32,
}

impl SourceLoc {
    fn to_wire(&self) -> JsonValue {
        json!([self.file, self.line, self.text, self.column])
    }

    fn from_wire(wire: &JsonValue) -> Result<SourceLoc, StoreError> {
        let parts = wire
            .as_array()
            .filter(|a| a.len() == 4)
            .ok_or_else(|| StoreError::Wire(format!("malformed source location: {wire}")))?;
        Ok(SourceLoc {
            file: parts[0]
                .as_str()
                .ok_or_else(|| StoreError::Wire("location file".into()))?
                .to_string(),
            line: parts[1]
                .as_u64()
                .ok_or_else(|| StoreError::Wire("location line".into()))? as u32,
            text: parts[2]
                .as_str()
                .ok_or_else(|| StoreError::Wire("location text".into()))?
                .to_string(),
            column: parts[3]
                .as_u64()
                .ok_or_else(|| StoreError::Wire("location column".into()))? as u32,
        })
    }
}

/// One decoded instruction: opcode, checked operands, optional source position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: Vec<Value>,
    pub loc: Option<SourceLoc>,
}

impl Instruction {
    /// Construct an instruction, validating operand arity and types for the
    /// opcode. Malformed instructions are rejected here so dispatch never
    /// re-checks shapes.
    pub fn new(op: Opcode, operands: Vec<Value>, loc: Option<SourceLoc>) -> VmResult<Instruction> {
        validate_operands(op, &operands)?;
        Ok(Instruction { op, operands, loc })
    }

    /// Shorthand for an operand-free instruction
    pub fn bare(op: Opcode) -> Instruction {
        Instruction {
            op,
            operands: vec![],
            loc: None,
        }
    }

    /* ===================== Wire format ===================== */

    /// Encode as `[OpcodeName, [operand...], loc]`
    pub fn to_wire(&self) -> JsonValue {
        let operands: Vec<JsonValue> = self.operands.iter().map(Value::to_wire).collect();
        let loc = match &self.loc {
            Some(loc) => loc.to_wire(),
            None => JsonValue::Null,
        };
        json!([self.op.name(), operands, loc])
    }

    /// Decode from `[OpcodeName, [operand...], loc]`, re-validating operands
    pub fn from_wire(wire: &JsonValue) -> Result<Instruction, StoreError> {
        let row = wire
            .as_array()
            .ok_or_else(|| StoreError::Wire(format!("instruction is not an array: {wire}")))?;
        let name = row
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Wire(format!("instruction opcode: {wire}")))?;
        let op = Opcode::from_name(name)
            .ok_or_else(|| StoreError::Wire(format!("unknown opcode '{name}'")))?;

        let raw_operands = row
            .get(1)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Wire(format!("instruction operands: {wire}")))?;
        let operands: Result<Vec<Value>, StoreError> =
            raw_operands.iter().map(Value::from_wire).collect();
        let operands = operands?;

        let loc = match row.get(2) {
            None | Some(JsonValue::Null) => None,
            Some(v) => Some(SourceLoc::from_wire(v)?),
        };

        Instruction::new(op, operands, loc)
            .map_err(|e| StoreError::Wire(format!("invalid instruction {name}: {e}")))
    }
}

/// Per-opcode operand contract
fn validate_operands(op: Opcode, operands: &[Value]) -> VmResult<()> {
    let fail = |expected: &str| {
        Err(VmError::unexpected(format!(
            "opcode {} expects {expected}, got {:?}",
            op.name(),
            operands
        )))
    };

    match op {
        Opcode::Jump | Opcode::JumpIf => match operands {
            [Value::Int(target)] if *target >= 0 => Ok(()),
            _ => fail("one non-negative Int code offset"),
        },

        Opcode::Call | Opcode::ACall => match operands {
            [callee, Value::Int(argc)] if *argc >= 0 => match callee {
                Value::Symbol(_) | Value::FunctionPtr { .. } | Value::ForeignPtr { .. } => Ok(()),
                _ => fail("a Symbol, FunctionPtr or ForeignPtr callee"),
            },
            _ => fail("a callee and a non-negative Int arg count"),
        },

        Opcode::PushV => match operands {
            [_] => Ok(()),
            _ => fail("exactly one operand"),
        },

        Opcode::PushB | Opcode::Bind => match operands {
            [Value::Symbol(_)] => Ok(()),
            _ => fail("one Symbol operand"),
        },

        Opcode::MakeList => match operands {
            [Value::Int(n)] if *n >= 0 => Ok(()),
            _ => fail("one non-negative Int element count"),
        },

        Opcode::MakeHash => match operands {
            [Value::Int(n)] if *n >= 0 => Ok(()),
            _ => fail("one non-negative Int pair count"),
        },

        Opcode::Return
        | Opcode::Pop
        | Opcode::First
        | Opcode::Rest
        | Opcode::Nth
        | Opcode::Len
        | Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Eq
        | Opcode::Lt
        | Opcode::Gt
        | Opcode::Print
        | Opcode::Sleep
        | Opcode::Wait
        | Opcode::Signal => {
            if operands.is_empty() {
                Ok(())
            } else {
                fail("no operands")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_validation_accepts_well_formed() {
        assert!(Instruction::new(Opcode::Jump, vec![Value::Int(3)], None).is_ok());
        assert!(Instruction::new(
            Opcode::Call,
            vec![Value::Symbol("f".into()), Value::Int(2)],
            None
        )
        .is_ok());
        assert!(Instruction::new(
            Opcode::ACall,
            vec![Value::function("g"), Value::Int(0)],
            None
        )
        .is_ok());
        assert!(Instruction::new(Opcode::PushV, vec![Value::Null], None).is_ok());
        assert!(Instruction::new(Opcode::Bind, vec![Value::Symbol("x".into())], None).is_ok());
        assert!(Instruction::new(Opcode::MakeList, vec![Value::Int(0)], None).is_ok());
        assert!(Instruction::new(Opcode::Return, vec![], None).is_ok());
    }

    #[test]
    fn test_operand_validation_rejects_malformed() {
        // Wrong arity
        assert!(Instruction::new(Opcode::Jump, vec![], None).is_err());
        assert!(Instruction::new(Opcode::Return, vec![Value::Int(1)], None).is_err());
        // Wrong types
        assert!(Instruction::new(Opcode::Jump, vec![Value::Str("x".into())], None).is_err());
        assert!(Instruction::new(
            Opcode::Call,
            vec![Value::Int(1), Value::Int(1)],
            None
        )
        .is_err());
        assert!(Instruction::new(Opcode::Bind, vec![Value::Str("x".into())], None).is_err());
        // Negative counts
        assert!(Instruction::new(Opcode::MakeList, vec![Value::Int(-1)], None).is_err());
        assert!(Instruction::new(Opcode::Jump, vec![Value::Int(-2)], None).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let cases = vec![
            Instruction::new(
                Opcode::Call,
                vec![Value::Symbol("f".into()), Value::Int(1)],
                Some(SourceLoc {
                    file: "main.st".into(),
                    line: 4,
                    text: "(f x)".into(),
                    column: 2,
                }),
            )
            .unwrap(),
            Instruction::new(Opcode::PushV, vec![Value::List(vec![Value::Int(1)])], None).unwrap(),
            Instruction::bare(Opcode::Wait),
        ];

        for instr in cases {
            let wire = instr.to_wire();
            let text = serde_json::to_string(&wire).unwrap();
            let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            let decoded = Instruction::from_wire(&reparsed).unwrap();
            assert_eq!(decoded, instr);
        }
    }

    #[test]
    fn test_wire_rejects_unknown_opcode() {
        let wire = serde_json::json!(["Explode", [], null]);
        assert!(Instruction::from_wire(&wire).is_err());
    }

    #[test]
    fn test_wire_revalidates_operands() {
        // Well-formed JSON, but Jump cannot take a Str operand
        let wire = serde_json::json!(["Jump", [["Str", "nope"]], null]);
        assert!(Instruction::from_wire(&wire).is_err());
    }

    #[test]
    fn test_opcode_names_invert() {
        let all = [
            Opcode::Jump,
            Opcode::JumpIf,
            Opcode::Call,
            Opcode::ACall,
            Opcode::Return,
            Opcode::PushV,
            Opcode::PushB,
            Opcode::Bind,
            Opcode::Pop,
            Opcode::MakeList,
            Opcode::MakeHash,
            Opcode::First,
            Opcode::Rest,
            Opcode::Nth,
            Opcode::Len,
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::Div,
            Opcode::Eq,
            Opcode::Lt,
            Opcode::Gt,
            Opcode::Print,
            Opcode::Sleep,
            Opcode::Wait,
            Opcode::Signal,
        ];
        for op in all {
            assert_eq!(Opcode::from_name(op.name()), Some(op));
        }
    }
}
