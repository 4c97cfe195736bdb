//! Foreign function boundary
//!
//! Host code is reached through a narrow, explicit adapter: functions are
//! registered up front under `(module, name)`, receive plain `Value` slices,
//! and hand back a `Value`. Anything the host prints goes through `ForeignIo`
//! so the machine can route it into the session's stdout log, and anything
//! the host raises (including panics) is wrapped as a foreign error instead
//! of tearing down the worker.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::errors::{VmError, VmResult};
use crate::value::Value;

/// Side-channel I/O captured during a foreign call
#[derive(Debug, Default)]
pub struct ForeignIo {
    output: String,
}

impl ForeignIo {
    /// Append a line of host output, later flushed to session stdout
    pub fn print(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

/// An error raised inside a foreign call
#[derive(Debug, Clone)]
pub struct ForeignCallError {
    pub message: String,
    /// Host-side detail, e.g. a captured backtrace
    pub detail: Option<String>,
}

impl ForeignCallError {
    pub fn new(message: impl Into<String>) -> Self {
        ForeignCallError {
            message: message.into(),
            detail: None,
        }
    }
}

/// A registered host function
pub type ForeignFn =
    Arc<dyn Fn(&[Value], &mut ForeignIo) -> Result<Value, ForeignCallError> + Send + Sync>;

/// Explicitly registered host functions, keyed by module and name.
///
/// Resolution happens against this table only; there is no dynamic name
/// lookup into host code at call time.
#[derive(Clone, Default)]
pub struct ForeignRegistry {
    fns: HashMap<String, ForeignFn>,
}

impl ForeignRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the standard `host` module installed
    pub fn with_host_module() -> Self {
        let mut registry = Self::new();
        registry.register("host", "print", |args, io| {
            let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
            io.print(&rendered.join(" "));
            Ok(Value::Null)
        });
        registry.register("host", "sleep_ms", |args, _io| {
            let ms = match args {
                [Value::Int(ms)] if *ms >= 0 => *ms as u64,
                _ => return Err(ForeignCallError::new("sleep_ms expects one non-negative int")),
            };
            // A deliberately blocking host call
            std::thread::sleep(std::time::Duration::from_millis(ms));
            Ok(Value::Null)
        });
        registry.register("host", "identity", |args, _io| match args {
            [v] => Ok(v.clone()),
            _ => Err(ForeignCallError::new("identity expects one argument")),
        });
        registry.register("host", "double", |args, _io| match args {
            [Value::Int(n)] => Ok(Value::Int(n * 2)),
            [Value::Float(x)] => Ok(Value::Float(x * 2.0)),
            _ => Err(ForeignCallError::new("double expects one number")),
        });
        registry
    }

    /// Register a host function under `(module, name)`
    pub fn register(
        &mut self,
        module: &str,
        name: &str,
        f: impl Fn(&[Value], &mut ForeignIo) -> Result<Value, ForeignCallError> + Send + Sync + 'static,
    ) {
        self.fns.insert(key(module, name), Arc::new(f));
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.fns.contains_key(&key(module, name))
    }

    /// Invoke a registered function, capturing output and containing panics.
    ///
    /// Returns the result value and whatever the host printed. A missing
    /// registration is a VM invariant violation (registration is explicit);
    /// a raised or panicking host call becomes a `ForeignError`.
    pub fn call(&self, module: &str, name: &str, args: &[Value]) -> VmResult<(Value, String)> {
        let f = self.fns.get(&key(module, name)).ok_or_else(|| {
            VmError::unexpected(format!("foreign function '{module}.{name}' is not registered"))
        })?;

        let mut io = ForeignIo::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| f(args, &mut io)));
        let output = io.take_output();

        match outcome {
            Ok(Ok(value)) => Ok((value, output)),
            Ok(Err(err)) => Err(VmError::Foreign {
                name: format!("{module}.{name}"),
                message: err.message,
                detail: err.detail,
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "host panic".to_string());
                Err(VmError::Foreign {
                    name: format!("{module}.{name}"),
                    message,
                    detail: None,
                })
            }
        }
    }
}

fn key(module: &str, name: &str) -> String {
    format!("{module}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_module_functions() {
        let registry = ForeignRegistry::with_host_module();
        let (value, _) = registry.call("host", "double", &[Value::Int(21)]).unwrap();
        assert_eq!(value, Value::Int(42));

        let (value, _) = registry
            .call("host", "identity", &[Value::Str("x".into())])
            .unwrap();
        assert_eq!(value, Value::Str("x".into()));
    }

    #[test]
    fn test_print_output_is_captured() {
        let registry = ForeignRegistry::with_host_module();
        let (value, output) = registry
            .call("host", "print", &[Value::Int(1), Value::Str("two".into())])
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(output, "1 two\n");
    }

    #[test]
    fn test_missing_registration_is_unexpected() {
        let registry = ForeignRegistry::new();
        let err = registry.call("host", "nope", &[]).unwrap_err();
        assert!(!err.is_user_resolvable());
    }

    #[test]
    fn test_host_error_becomes_foreign_error() {
        let registry = ForeignRegistry::with_host_module();
        let err = registry
            .call("host", "double", &[Value::Str("not a number".into())])
            .unwrap_err();
        assert!(err.is_user_resolvable());
        assert!(err.to_string().contains("host.double"));
    }

    #[test]
    fn test_host_panic_is_contained() {
        let mut registry = ForeignRegistry::new();
        registry.register("test", "explode", |_args, _io| panic!("kaboom"));
        let err = registry.call("test", "explode", &[]).unwrap_err();
        assert!(err.is_user_resolvable());
        assert!(err.to_string().contains("kaboom"));
    }
}
