//! Per-thread execution state
//!
//! A `State` is owned by exactly one thread and never shared, so it needs no
//! locking. It contains everything the machine needs to pick a thread back up
//! on a different worker: instruction pointer, data stack, the live bindings
//! of the current frame, and the pointer to the current activation record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{VmError, VmResult};
use crate::value::{ArecPtr, Value};

/// Execution state of one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Next instruction to execute
    pub ip: usize,

    /// Operand stack
    pub data_stack: Vec<Value>,

    /// Live bindings of the current frame. Saved into the activation record
    /// on a synchronous call, restored from the caller's record on return.
    pub bindings: BTreeMap<String, Value>,

    /// The frame this thread is executing in
    pub current_arec: Option<ArecPtr>,

    /// Set once the thread has finished, successfully or not
    pub stopped: bool,

    /// Why the thread stopped, when it stopped on an error
    pub error: Option<String>,
}

impl State {
    /// Fresh state starting at `ip` with the given arguments on the stack
    pub fn new(ip: usize, args: Vec<Value>, current_arec: ArecPtr) -> Self {
        State {
            ip,
            data_stack: args,
            bindings: BTreeMap::new(),
            current_arec: Some(current_arec),
            stopped: false,
            error: None,
        }
    }

    /// Placeholder state for a freshly allocated thread, before its root
    /// frame exists
    pub fn empty() -> Self {
        State {
            ip: 0,
            data_stack: vec![],
            bindings: BTreeMap::new(),
            current_arec: None,
            stopped: false,
            error: None,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.data_stack.push(value);
    }

    /// Pop the top of the data stack; underflow is a VM invariant violation
    pub fn pop(&mut self) -> VmResult<Value> {
        self.data_stack
            .pop()
            .ok_or_else(|| VmError::unexpected(format!("data stack underflow at ip {}", self.ip)))
    }

    /// Pop the top `n` values, restoring their push order
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if self.data_stack.len() < n {
            return Err(VmError::unexpected(format!(
                "data stack underflow at ip {}: need {n}, have {}",
                self.ip,
                self.data_stack.len()
            )));
        }
        Ok(self.data_stack.split_off(self.data_stack.len() - n))
    }

    pub fn peek(&self) -> VmResult<&Value> {
        self.data_stack
            .last()
            .ok_or_else(|| VmError::unexpected(format!("data stack empty at ip {}", self.ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_underflow_is_an_error() {
        let mut state = State::new(0, vec![], 0);
        assert!(state.pop().is_err());
        assert!(state.pop_n(1).is_err());
    }

    #[test]
    fn test_pop_n_preserves_push_order() {
        let mut state = State::new(0, vec![], 0);
        state.push(Value::Int(1));
        state.push(Value::Int(2));
        state.push(Value::Int(3));
        let args = state.pop_n(2).unwrap();
        assert_eq!(args, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(state.data_stack, vec![Value::Int(1)]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = State::new(4, vec![Value::Int(9)], 2);
        state.bindings.insert("x".into(), Value::Str("hi".into()));
        let text = serde_json::to_string(&state).unwrap();
        let decoded: State = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, state);
    }
}
