//! Cross-thread protocols over the controller primitives
//!
//! These operations are shared by both backends: thread creation, the
//! reference-counted activation record arena, the future resolution protocol,
//! and stack trace reconstruction. Every future mutation happens under that
//! future's item lock; the lock is re-entrant for the acting thread because
//! chained resolution can re-enter (a thread finishing with an
//! already-resolved upstream future resolves itself while still inside its
//! own `finish`).

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::arec::{ActivationRecord, TraceFrame};
use crate::controller::{future_key, Controller};
use crate::errors::{VmError, VmResult};
use crate::executable::Executable;
use crate::state::State;
use crate::value::{ArecPtr, Value, Vmid};

/* ===================== Thread creation ===================== */

/// Create thread 0: the session's top-level machine.
///
/// Atomically allocates the thread's state, future and root activation
/// record, with the entry point of `function` and `args` on the data stack.
pub async fn toplevel_machine(
    ctrl: &dyn Controller,
    function: &str,
    args: Vec<Value>,
) -> VmResult<Vmid> {
    let exe = ctrl.executable().await?;
    let entry = exe
        .location_of(function)
        .ok_or_else(|| VmError::unexpected(format!("no such function '{function}'")))?;

    let vmid = ctrl.new_thread().await?;
    let root = ActivationRecord::root(Value::function(function), vmid, None);
    let ptr = push_arec(ctrl, &root).await?;
    ctrl.set_state(vmid, &State::new(entry, args, ptr)).await?;
    Ok(vmid)
}

/// Create a thread forked by `caller` for an async call.
///
/// The new thread's root record chains back into the caller's current frame,
/// so the caller's frame outlives its own thread if the fork is still
/// running when the caller returns.
pub async fn thread_machine(
    ctrl: &dyn Controller,
    caller: Vmid,
    caller_arec: Option<ArecPtr>,
    function: &str,
    args: Vec<Value>,
) -> VmResult<Vmid> {
    let exe = ctrl.executable().await?;
    let entry = exe
        .location_of(function)
        .ok_or_else(|| VmError::unexpected(format!("no such function '{function}'")))?;

    let vmid = ctrl.new_thread().await?;
    let root = ActivationRecord::root(Value::function(function), vmid, caller_arec);
    let ptr = push_arec(ctrl, &root).await?;
    ctrl.set_state(vmid, &State::new(entry, args, ptr)).await?;
    tracing::debug!(caller, vmid, function, "forked thread");
    Ok(vmid)
}

/* ===================== Activation record arena ===================== */

/// Store a new record and take a reference on its caller frame
pub async fn push_arec(ctrl: &dyn Controller, rec: &ActivationRecord) -> VmResult<ArecPtr> {
    let ptr = ctrl.new_arec(rec).await?;
    if let Some(parent) = rec.dynamic_chain {
        ctrl.increment_ref(parent).await?;
    }
    Ok(ptr)
}

/// Release one reference on a record, reclaiming it (and cascading up the
/// dynamic chain) when the count reaches zero.
///
/// The cascade stops at the first parent whose count stays positive: that
/// frame is still referenced by another live call path, typically a
/// concurrently forked sibling thread.
pub async fn pop_arec(ctrl: &dyn Controller, ptr: ArecPtr) -> VmResult<()> {
    let mut current = ptr;
    loop {
        let remaining = ctrl.decrement_ref(current).await?;
        if remaining > 0 {
            return Ok(());
        }
        let rec = ctrl.get_arec(current).await?;
        ctrl.delete_arec(current).await?;
        match rec.dynamic_chain {
            Some(parent) => current = parent,
            None => return Ok(()),
        }
    }
}

/* ===================== Future resolution ===================== */

/// Outcome of asking for a future's value
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Resolved(Value),
    /// Not resolved; the caller has been registered as a continuation and
    /// must suspend.
    Pending,
}

/// Resolve a thread's future and collect every thread to wake.
///
/// Single-shot: a second resolution is a reported no-op. Resolving thread 0
/// also publishes the session result. If the future carries a chain (some
/// thread returned this future as its own result), the chained future
/// resolves with the same value, recursively.
pub fn resolve_future<'a>(
    ctrl: &'a dyn Controller,
    acting: Vmid,
    target: Vmid,
    value: Value,
) -> Pin<Box<dyn Future<Output = VmResult<Vec<Vmid>>> + Send + 'a>> {
    // Box::pin for async recursion through the chain
    Box::pin(async move {
        let key = future_key(target);
        ctrl.lock(&key, acting).await?;
        let outcome = resolve_under_lock(ctrl, target, &value).await;
        ctrl.unlock(&key, acting).await?;

        let (mut woken, chain) = match outcome? {
            Some(parts) => parts,
            None => {
                warn!(target_vmid = target, "future already resolved; ignoring");
                return Ok(vec![]);
            }
        };

        if let Some(chained) = chain {
            let downstream = resolve_future(ctrl, acting, chained, value).await?;
            woken.extend(downstream);
        }
        Ok(woken)
    })
}

async fn resolve_under_lock(
    ctrl: &dyn Controller,
    target: Vmid,
    value: &Value,
) -> VmResult<Option<(Vec<Vmid>, Option<Vmid>)>> {
    let mut future = ctrl.get_future(target).await?;
    let woken = match future.resolve(value.clone()) {
        Some(woken) => woken,
        None => return Ok(None),
    };
    ctrl.set_future(target, &future).await?;
    if target == 0 {
        ctrl.set_result(value).await?;
    }
    Ok(Some((woken, future.chain)))
}

/// Read a future's value, or register `waiter` as a continuation.
///
/// Atomic under the target future's lock: either the value is already there,
/// or the waiter is queued before anyone can resolve, never both and never
/// neither.
pub async fn get_or_wait(
    ctrl: &dyn Controller,
    waiter: Vmid,
    target: Vmid,
) -> VmResult<WaitOutcome> {
    let key = future_key(target);
    ctrl.lock(&key, waiter).await?;
    let outcome = get_or_wait_under_lock(ctrl, waiter, target).await;
    ctrl.unlock(&key, waiter).await?;
    outcome
}

async fn get_or_wait_under_lock(
    ctrl: &dyn Controller,
    waiter: Vmid,
    target: Vmid,
) -> VmResult<WaitOutcome> {
    let future = ctrl.get_future(target).await?;
    if future.resolved {
        let value = future
            .value
            .ok_or_else(|| VmError::unexpected(format!("future {target} resolved without value")))?;
        return Ok(WaitOutcome::Resolved(value));
    }
    ctrl.add_continuation(target, waiter).await?;
    Ok(WaitOutcome::Pending)
}

/// Settle a finishing thread's future with its return value.
///
/// When a thread returns another thread's still-pending future, the two are
/// chained instead of resolved: the upstream future remembers to resolve this
/// one when it settles. Returns every thread to wake now.
pub async fn finish(ctrl: &dyn Controller, vmid: Vmid, value: Value) -> VmResult<Vec<Vmid>> {
    let upstream = match value {
        Value::FuturePtr { vmid: upstream } => upstream,
        other => return resolve_future(ctrl, vmid, vmid, other).await,
    };

    let key = future_key(upstream);
    ctrl.lock(&key, vmid).await?;
    let outcome = chain_under_lock(ctrl, vmid, upstream).await;
    ctrl.unlock(&key, vmid).await?;

    match outcome? {
        // Upstream already settled: resolve ourselves with its value. The
        // future lock is re-entrant, so this is safe even if upstream == vmid
        // ever became possible.
        Some(settled) => resolve_future(ctrl, vmid, vmid, settled).await,
        None => Ok(vec![]),
    }
}

async fn chain_under_lock(
    ctrl: &dyn Controller,
    vmid: Vmid,
    upstream: Vmid,
) -> VmResult<Option<Value>> {
    let mut future = ctrl.get_future(upstream).await?;
    if future.resolved {
        let value = future.value.ok_or_else(|| {
            VmError::unexpected(format!("future {upstream} resolved without value"))
        })?;
        return Ok(Some(value));
    }
    if let Some(existing) = future.chain {
        return Err(VmError::unexpected(format!(
            "future {upstream} is already chained to thread {existing}"
        )));
    }
    future.chain = Some(vmid);
    ctrl.set_future(upstream, &future).await?;
    Ok(None)
}

/* ===================== Stack traces ===================== */

/// Walk the dynamic chain from a thread's current frame to the root,
/// producing a caller-first trace with source locations taken from the call
/// sites.
pub async fn stack_trace(
    ctrl: &dyn Controller,
    exe: &Executable,
    vmid: Vmid,
) -> VmResult<Vec<TraceFrame>> {
    let state = ctrl.get_state(vmid).await?;
    let mut frames = Vec::new();
    let mut cursor = state.current_arec;

    while let Some(ptr) = cursor {
        let rec = ctrl.get_arec(ptr).await?;
        // call_site is the return address; the call instruction sits just
        // before it
        let loc = rec
            .call_site
            .and_then(|site| site.checked_sub(1))
            .and_then(|call_ip| exe.fetch(call_ip))
            .and_then(|instr| instr.loc.clone());
        frames.push(TraceFrame {
            thread: rec.owner,
            function: rec.function_name().to_string(),
            call_site: rec.call_site,
            loc,
        });
        cursor = rec.dynamic_chain;
    }

    frames.reverse();
    Ok(frames)
}
