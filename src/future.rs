//! Per-thread futures
//!
//! Every thread gets exactly one future at creation: the placeholder for its
//! eventual return value. Other threads wait on it by registering themselves
//! as continuations; a thread that returns another thread's pending future
//! chains instead of resolving. The resolution protocol itself lives with the
//! controller, where the locking happens.

use serde::{Deserialize, Serialize};

use crate::value::{Value, Vmid};

/// Resolvable placeholder for one thread's return value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FutureState {
    pub resolved: bool,

    /// Set exactly once, at resolution, and never changed after
    pub value: Option<Value>,

    /// Threads to wake when this future resolves, in registration order
    pub continuations: Vec<Vmid>,

    /// A downstream future to resolve with the same value: set when some
    /// thread returned this future as its own result
    pub chain: Option<Vmid>,
}

impl FutureState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark resolved and drain the continuation list.
    ///
    /// Returns the threads to wake, in FIFO registration order, or `None`
    /// when the future was already resolved (resolution is single-shot; a
    /// second attempt is a no-op for the caller to report).
    pub fn resolve(&mut self, value: Value) -> Option<Vec<Vmid>> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        self.value = Some(value);
        Some(std::mem::take(&mut self.continuations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_single_shot() {
        let mut future = FutureState::new();
        future.continuations = vec![2, 5];

        let woken = future.resolve(Value::Int(1)).unwrap();
        assert_eq!(woken, vec![2, 5]);
        assert!(future.continuations.is_empty());
        assert_eq!(future.value, Some(Value::Int(1)));

        // Second resolution is refused and the value is untouched
        assert!(future.resolve(Value::Int(9)).is_none());
        assert_eq!(future.value, Some(Value::Int(1)));
    }

    #[test]
    fn test_continuations_drain_in_registration_order() {
        let mut future = FutureState::new();
        for vmid in [7, 3, 11] {
            future.continuations.push(vmid);
        }
        let woken = future.resolve(Value::Null).unwrap();
        assert_eq!(woken, vec![7, 3, 11]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut future = FutureState::new();
        future.resolve(Value::Str("done".into()));
        let text = serde_json::to_string(&future).unwrap();
        let decoded: FutureState = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, future);
    }
}
