pub mod arec;
pub mod builtins;
pub mod cli;
pub mod config;
pub mod controller;
pub mod errors;
pub mod executable;
pub mod foreign;
pub mod future;
pub mod instruction;
pub mod invoker;
pub mod machine;
pub mod session;
pub mod state;
pub mod value;

// Re-export the types embedders touch most
pub use controller::{Controller, DatabaseController, MemoryController};
pub use errors::{StoreError, VmError, VmResult};
pub use executable::{Executable, ExecutableBuilder};
pub use foreign::ForeignRegistry;
pub use invoker::{InlineInvoker, Invoker, TaskInvoker};
pub use machine::{Machine, MachineStatus};
pub use session::{RunReport, RunRequest, Session};
pub use value::{ArecPtr, Value, Vmid};

#[cfg(test)]
#[path = "scenario_tests.rs"]
mod scenario_tests;
