//! Controller - persistence and coordination facade
//!
//! Everything shared between threads (states, futures, activation records,
//! stdout, session meta) passes through this interface. The machine only ever
//! touches its own `State`; all cross-thread coordination is the controller's
//! job. Two backends implement it: an in-process store for embedded and test
//! use, and a Postgres-backed store for distributed execution.

mod database;
mod memory;
pub mod protocol;

pub use database::DatabaseController;
pub use memory::MemoryController;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::arec::ActivationRecord;
use crate::errors::VmResult;
use crate::executable::Executable;
use crate::future::FutureState;
use crate::state::State;
use crate::value::{ArecPtr, Value, Vmid};

/* ===================== Item keys ===================== */

/// Logical storage key for a thread's state
pub fn state_key(vmid: Vmid) -> String {
    format!("state:{vmid}")
}

/// Logical storage key for a thread's future
pub fn future_key(vmid: Vmid) -> String {
    format!("future:{vmid}")
}

/// Logical storage key for an activation record
pub fn arec_key(ptr: ArecPtr) -> String {
    format!("arec:{ptr}")
}

/// One diagnostic event in the session log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub vmid: Vmid,
    pub kind: String,
    pub data: JsonValue,
}

/* ===================== The contract ===================== */

/// Persistence and coordination for one session.
///
/// Contract notes shared by all backends:
/// - `lock`/`unlock` are re-entrant per acting thread: the same owner may
///   re-acquire a held key, tracked by an explicit depth counter. Acquisition
///   waits with a fixed backoff and raises `LockTimeout` past the configured
///   bound. Keys come from `state_key`/`future_key`/`arec_key`.
/// - `increment_ref`/`decrement_ref` are atomic and return the new count.
/// - `write_stdout` is append-only; `set_broken` is sticky (write-once-true).
/// - The executable is set once, before any thread runs, and is immutable.
#[async_trait]
pub trait Controller: Send + Sync {
    /* ----- Executable ----- */

    async fn set_executable(&self, exe: &Executable) -> VmResult<()>;
    async fn executable(&self) -> VmResult<Arc<Executable>>;

    /* ----- Threads ----- */

    /// Allocate the next thread id together with its empty state and
    /// unresolved future, atomically.
    async fn new_thread(&self) -> VmResult<Vmid>;
    async fn thread_count(&self) -> VmResult<u32>;

    async fn get_state(&self, vmid: Vmid) -> VmResult<State>;
    async fn set_state(&self, vmid: Vmid, state: &State) -> VmResult<()>;

    async fn get_future(&self, vmid: Vmid) -> VmResult<FutureState>;
    async fn set_future(&self, vmid: Vmid, future: &FutureState) -> VmResult<()>;

    /// Append a waiter to a future's continuation list. Callers hold the
    /// future's lock (see `protocol::get_or_wait`).
    async fn add_continuation(&self, target: Vmid, waiter: Vmid) -> VmResult<()>;

    /* ----- Activation records ----- */

    async fn new_arec(&self, rec: &ActivationRecord) -> VmResult<ArecPtr>;
    async fn get_arec(&self, ptr: ArecPtr) -> VmResult<ActivationRecord>;
    async fn set_arec(&self, ptr: ArecPtr, rec: &ActivationRecord) -> VmResult<()>;
    async fn delete_arec(&self, ptr: ArecPtr) -> VmResult<()>;
    async fn increment_ref(&self, ptr: ArecPtr) -> VmResult<i64>;
    async fn decrement_ref(&self, ptr: ArecPtr) -> VmResult<i64>;

    /* ----- Item locks ----- */

    async fn lock(&self, key: &str, owner: Vmid) -> VmResult<()>;
    async fn unlock(&self, key: &str, owner: Vmid) -> VmResult<()>;

    /* ----- Session ----- */

    async fn write_stdout(&self, text: &str) -> VmResult<()>;
    async fn read_stdout(&self) -> VmResult<String>;

    async fn set_broken(&self) -> VmResult<()>;
    async fn is_broken(&self) -> VmResult<bool>;

    /// Record the session's top-level result (thread 0 only)
    async fn set_result(&self, value: &Value) -> VmResult<()>;
    async fn result(&self) -> VmResult<Option<Value>>;

    /// True when at least one thread exists and every thread has stopped
    async fn all_stopped(&self) -> VmResult<bool>;

    /// Append a diagnostic event to the session log
    async fn log_event(&self, vmid: Vmid, kind: &str, data: JsonValue) -> VmResult<()>;

    /// Read back the diagnostic event log
    async fn events(&self) -> VmResult<Vec<Event>>;
}
