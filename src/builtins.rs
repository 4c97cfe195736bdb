//! VM builtin table
//!
//! The third tier of name resolution: when a called symbol is bound neither
//! thread-locally nor in the executable's globals, it may name one of these
//! native helpers over values. The structural opcodes share the same list
//! primitives so opcode and builtin behavior cannot drift apart.

use crate::errors::{VmError, VmResult};
use crate::foreign::{ForeignIo, ForeignRegistry};
use crate::value::Value;

/* ===================== List primitives ===================== */

pub fn list_first(value: &Value) -> VmResult<Value> {
    match value {
        Value::List(items) => items
            .first()
            .cloned()
            .ok_or_else(|| VmError::unexpected("first of empty list")),
        other => Err(VmError::unexpected(format!(
            "first expects a List, got {}",
            other.type_tag()
        ))),
    }
}

pub fn list_rest(value: &Value) -> VmResult<Value> {
    match value {
        Value::List(items) => {
            if items.is_empty() {
                Err(VmError::unexpected("rest of empty list"))
            } else {
                Ok(Value::List(items[1..].to_vec()))
            }
        }
        other => Err(VmError::unexpected(format!(
            "rest expects a List, got {}",
            other.type_tag()
        ))),
    }
}

pub fn list_nth(value: &Value, index: &Value) -> VmResult<Value> {
    let n = match index {
        Value::Int(n) if *n >= 0 => *n as usize,
        other => {
            return Err(VmError::unexpected(format!(
                "nth expects a non-negative Int index, got {}",
                other.type_tag()
            )))
        }
    };
    match value {
        Value::List(items) => items.get(n).cloned().ok_or_else(|| {
            VmError::unexpected(format!("nth index {n} out of bounds for list of {}", items.len()))
        }),
        other => Err(VmError::unexpected(format!(
            "nth expects a List, got {}",
            other.type_tag()
        ))),
    }
}

pub fn length(value: &Value) -> VmResult<Value> {
    match value {
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::Hash(map) => Ok(Value::Int(map.len() as i64)),
        other => Err(VmError::unexpected(format!(
            "len expects a List, Str or Hash, got {}",
            other.type_tag()
        ))),
    }
}

/* ===================== Builtin dispatch ===================== */

/// Names resolvable in the builtin tier
pub fn is_builtin(name: &str) -> bool {
    matches!(name, "first" | "rest" | "nth" | "len" | "map_resolve")
}

/// Invoke a builtin by name.
///
/// `map_resolve` applies a foreign function over a list element-wise, so the
/// registry and an I/O capture come along for the ride; the plain list
/// helpers ignore them.
pub fn call_builtin(
    name: &str,
    args: &[Value],
    registry: &ForeignRegistry,
    io: &mut ForeignIo,
) -> VmResult<Value> {
    match (name, args) {
        ("first", [list]) => list_first(list),
        ("rest", [list]) => list_rest(list),
        ("nth", [list, index]) => list_nth(list, index),
        ("len", [value]) => length(value),
        ("map_resolve", [f, Value::List(items)]) => map_resolve(f, items, registry, io),
        _ => Err(VmError::unexpected(format!(
            "builtin '{name}' called with {} argument(s)",
            args.len()
        ))),
    }
}

/// Map a foreign function over a list, element by element.
///
/// Language functions map through compiled loops; only `ForeignPtr` callees
/// are accepted here.
fn map_resolve(
    f: &Value,
    items: &[Value],
    registry: &ForeignRegistry,
    io: &mut ForeignIo,
) -> VmResult<Value> {
    let (module, name) = match f {
        Value::ForeignPtr { module, name } => (module, name),
        other => {
            return Err(VmError::unexpected(format!(
                "map_resolve expects a ForeignPtr, got {}",
                other.type_tag()
            )))
        }
    };

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let (value, output) = registry.call(module, name, std::slice::from_ref(item))?;
        if !output.is_empty() {
            io.print(output.trim_end_matches('\n'));
        }
        results.push(value);
    }
    Ok(Value::List(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> VmResult<Value> {
        let registry = ForeignRegistry::with_host_module();
        let mut io = ForeignIo::default();
        call_builtin(name, args, &registry, &mut io)
    }

    #[test]
    fn test_list_builtins() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(call("first", &[list.clone()]).unwrap(), Value::Int(1));
        assert_eq!(
            call("rest", &[list.clone()]).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            call("nth", &[list.clone(), Value::Int(2)]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(call("len", &[list]).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_list_builtins_report_misuse() {
        assert!(call("first", &[Value::List(vec![])]).is_err());
        assert!(call("nth", &[Value::List(vec![]), Value::Int(0)]).is_err());
        assert!(call("first", &[Value::Int(1)]).is_err());
        assert!(call("unknown", &[]).is_err());
    }

    #[test]
    fn test_map_resolve_applies_foreign_fn() {
        let f = Value::foreign("host", "double");
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            call("map_resolve", &[f, list]).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(4)])
        );
    }

    #[test]
    fn test_map_resolve_rejects_language_functions() {
        let f = Value::function("inc");
        let list = Value::List(vec![Value::Int(1)]);
        assert!(call("map_resolve", &[f, list]).is_err());
    }
}
