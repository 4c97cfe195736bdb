//! In-process controller backend
//!
//! The whole session lives in one mutex-guarded store. Item locks still go
//! through the same acquire/backoff/timeout path as the database backend so
//! the protocol behaves identically in both; only the storage medium differs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::arec::ActivationRecord;
use crate::config::LockConfig;
use crate::controller::{Controller, Event};
use crate::errors::{StoreError, VmError, VmResult};
use crate::executable::Executable;
use crate::future::FutureState;
use crate::state::State;
use crate::value::{ArecPtr, Value, Vmid};

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    owner: Vmid,
    depth: u32,
}

#[derive(Default)]
struct Store {
    executable: Option<Arc<Executable>>,
    states: HashMap<Vmid, State>,
    futures: HashMap<Vmid, FutureState>,
    arecs: HashMap<ArecPtr, ActivationRecord>,
    next_vmid: Vmid,
    next_arec: ArecPtr,
    stdout: String,
    events: Vec<Event>,
    broken: bool,
    result: Option<Value>,
    locks: HashMap<String, LockEntry>,
}

/// Controller keeping all session state in process memory
pub struct MemoryController {
    lock_cfg: LockConfig,
    store: Mutex<Store>,
}

impl MemoryController {
    pub fn new(lock_cfg: LockConfig) -> Self {
        MemoryController {
            lock_cfg,
            store: Mutex::new(Store::default()),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        // A poisoned store means a panic mid-mutation; propagating the panic
        // is the only sound option.
        self.store.lock().expect("session store poisoned")
    }

    fn missing(key: String) -> VmError {
        VmError::Store(StoreError::MissingItem { key })
    }
}

#[async_trait]
impl Controller for MemoryController {
    /* ----- Executable ----- */

    async fn set_executable(&self, exe: &Executable) -> VmResult<()> {
        let mut store = self.store();
        if store.executable.is_some() {
            return Err(StoreError::Session("executable already set".into()).into());
        }
        store.executable = Some(Arc::new(exe.clone()));
        Ok(())
    }

    async fn executable(&self) -> VmResult<Arc<Executable>> {
        self.store()
            .executable
            .clone()
            .ok_or_else(|| StoreError::Session("executable not set".into()).into())
    }

    /* ----- Threads ----- */

    async fn new_thread(&self) -> VmResult<Vmid> {
        let mut store = self.store();
        let vmid = store.next_vmid;
        store.next_vmid += 1;
        store.states.insert(vmid, State::empty());
        store.futures.insert(vmid, FutureState::new());
        Ok(vmid)
    }

    async fn thread_count(&self) -> VmResult<u32> {
        Ok(self.store().next_vmid)
    }

    async fn get_state(&self, vmid: Vmid) -> VmResult<State> {
        self.store()
            .states
            .get(&vmid)
            .cloned()
            .ok_or_else(|| Self::missing(super::state_key(vmid)))
    }

    async fn set_state(&self, vmid: Vmid, state: &State) -> VmResult<()> {
        self.store().states.insert(vmid, state.clone());
        Ok(())
    }

    async fn get_future(&self, vmid: Vmid) -> VmResult<FutureState> {
        self.store()
            .futures
            .get(&vmid)
            .cloned()
            .ok_or_else(|| Self::missing(super::future_key(vmid)))
    }

    async fn set_future(&self, vmid: Vmid, future: &FutureState) -> VmResult<()> {
        self.store().futures.insert(vmid, future.clone());
        Ok(())
    }

    async fn add_continuation(&self, target: Vmid, waiter: Vmid) -> VmResult<()> {
        let mut store = self.store();
        let future = store
            .futures
            .get_mut(&target)
            .ok_or_else(|| Self::missing(super::future_key(target)))?;
        future.continuations.push(waiter);
        Ok(())
    }

    /* ----- Activation records ----- */

    async fn new_arec(&self, rec: &ActivationRecord) -> VmResult<ArecPtr> {
        let mut store = self.store();
        let ptr = store.next_arec;
        store.next_arec += 1;
        store.arecs.insert(ptr, rec.clone());
        Ok(ptr)
    }

    async fn get_arec(&self, ptr: ArecPtr) -> VmResult<ActivationRecord> {
        self.store()
            .arecs
            .get(&ptr)
            .cloned()
            .ok_or_else(|| Self::missing(super::arec_key(ptr)))
    }

    async fn set_arec(&self, ptr: ArecPtr, rec: &ActivationRecord) -> VmResult<()> {
        let mut store = self.store();
        if !store.arecs.contains_key(&ptr) {
            return Err(Self::missing(super::arec_key(ptr)));
        }
        store.arecs.insert(ptr, rec.clone());
        Ok(())
    }

    async fn delete_arec(&self, ptr: ArecPtr) -> VmResult<()> {
        self.store()
            .arecs
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| Self::missing(super::arec_key(ptr)))
    }

    async fn increment_ref(&self, ptr: ArecPtr) -> VmResult<i64> {
        let mut store = self.store();
        let rec = store
            .arecs
            .get_mut(&ptr)
            .ok_or_else(|| Self::missing(super::arec_key(ptr)))?;
        rec.ref_count += 1;
        Ok(rec.ref_count)
    }

    async fn decrement_ref(&self, ptr: ArecPtr) -> VmResult<i64> {
        let mut store = self.store();
        let rec = store
            .arecs
            .get_mut(&ptr)
            .ok_or_else(|| Self::missing(super::arec_key(ptr)))?;
        rec.ref_count -= 1;
        if rec.ref_count < 0 {
            return Err(VmError::unexpected(format!(
                "activation record {ptr} ref count went negative"
            )));
        }
        Ok(rec.ref_count)
    }

    /* ----- Item locks ----- */

    async fn lock(&self, key: &str, owner: Vmid) -> VmResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.lock_cfg.timeout_ms);
        loop {
            {
                let mut store = self.store();
                match store.locks.get_mut(key) {
                    None => {
                        store
                            .locks
                            .insert(key.to_string(), LockEntry { owner, depth: 1 });
                        return Ok(());
                    }
                    Some(entry) if entry.owner == owner => {
                        entry.depth += 1;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                }
                .into());
            }
            tokio::time::sleep(Duration::from_millis(self.lock_cfg.retry_ms)).await;
        }
    }

    async fn unlock(&self, key: &str, owner: Vmid) -> VmResult<()> {
        let mut store = self.store();
        match store.locks.get_mut(key) {
            Some(entry) if entry.owner == owner => {
                entry.depth -= 1;
                if entry.depth == 0 {
                    store.locks.remove(key);
                }
                Ok(())
            }
            _ => Err(VmError::unexpected(format!(
                "thread {owner} released lock '{key}' it does not hold"
            ))),
        }
    }

    /* ----- Session ----- */

    async fn write_stdout(&self, text: &str) -> VmResult<()> {
        self.store().stdout.push_str(text);
        Ok(())
    }

    async fn read_stdout(&self) -> VmResult<String> {
        Ok(self.store().stdout.clone())
    }

    async fn set_broken(&self) -> VmResult<()> {
        self.store().broken = true;
        Ok(())
    }

    async fn is_broken(&self) -> VmResult<bool> {
        Ok(self.store().broken)
    }

    async fn set_result(&self, value: &Value) -> VmResult<()> {
        self.store().result = Some(value.clone());
        Ok(())
    }

    async fn result(&self) -> VmResult<Option<Value>> {
        Ok(self.store().result.clone())
    }

    async fn all_stopped(&self) -> VmResult<bool> {
        let store = self.store();
        Ok(!store.states.is_empty() && store.states.values().all(|s| s.stopped))
    }

    async fn log_event(&self, vmid: Vmid, kind: &str, data: JsonValue) -> VmResult<()> {
        self.store().events.push(Event {
            at: Utc::now(),
            vmid,
            kind: kind.to_string(),
            data,
        });
        Ok(())
    }

    async fn events(&self) -> VmResult<Vec<Event>> {
        Ok(self.store().events.clone())
    }
}
