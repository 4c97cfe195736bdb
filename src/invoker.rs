//! Invoker - how threads actually get executed
//!
//! The invoker is the only component aware of the execution topology. Given a
//! thread id, it runs that thread's machine: on the current task (inline), on
//! a spawned tokio task, or - behind a deployment boundary this crate does
//! not own - as a remote invocation with a `{session_id, thread_id}` resume
//! request. It never touches machine internals beyond constructing one and
//! calling `run()`, and it reports failures back into the session so waiting
//! threads are not silently stranded.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use crate::controller::Controller;
use crate::errors::VmResult;
use crate::foreign::ForeignRegistry;
use crate::machine::Machine;
use crate::value::Vmid;

/// Runs or resumes threads by id
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, vmid: Vmid) -> VmResult<()>;
}

/* ===================== Inline ===================== */

/// Runs each thread to completion on the current task.
///
/// Forked threads execute at their fork point, before the forking thread
/// continues. Deterministic, which makes it the invoker of choice for tests
/// and the CLI's single-process mode.
pub struct InlineInvoker {
    ctrl: Arc<dyn Controller>,
    registry: Arc<ForeignRegistry>,
}

impl InlineInvoker {
    pub fn new(ctrl: Arc<dyn Controller>, registry: Arc<ForeignRegistry>) -> Self {
        InlineInvoker { ctrl, registry }
    }
}

#[async_trait]
impl Invoker for InlineInvoker {
    async fn invoke(&self, vmid: Vmid) -> VmResult<()> {
        let mut machine = Machine::load(self.ctrl.as_ref(), self.registry.clone(), vmid).await?;
        machine.run(self).await?;
        Ok(())
    }
}

/* ===================== Spawned tasks ===================== */

/// Runs each thread on its own tokio task.
///
/// `invoke` returns as soon as the task is spawned; the caller never blocks
/// on the new thread. A watchdog task joins the runner and reports anything
/// that escaped the machine's own error handling (controller failures, or an
/// outright panic) back into the session.
#[derive(Clone)]
pub struct TaskInvoker {
    ctrl: Arc<dyn Controller>,
    registry: Arc<ForeignRegistry>,
}

impl TaskInvoker {
    pub fn new(ctrl: Arc<dyn Controller>, registry: Arc<ForeignRegistry>) -> Self {
        TaskInvoker { ctrl, registry }
    }
}

#[async_trait]
impl Invoker for TaskInvoker {
    async fn invoke(&self, vmid: Vmid) -> VmResult<()> {
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let mut machine =
                Machine::load(runner.ctrl.as_ref(), runner.registry.clone(), vmid).await?;
            machine.run(&runner).await?;
            VmResult::Ok(())
        });

        let ctrl = self.ctrl.clone();
        tokio::spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("thread runner failed: {err}")),
                Err(join_err) => Some(format!("thread runner panicked: {join_err}")),
            };
            if let Some(message) = failure {
                report_stranded(ctrl.as_ref(), vmid, &message).await;
            }
        });

        Ok(())
    }
}

/// Last-resort failure path: the machine could not record its own death, so
/// the invoker does it. Best effort - the session may be unreachable too.
async fn report_stranded(ctrl: &dyn Controller, vmid: Vmid, message: &str) {
    error!(vmid, message, "reporting stranded thread");

    match ctrl.get_state(vmid).await {
        Ok(mut state) => {
            state.stopped = true;
            state.error = Some(message.to_string());
            if let Err(err) = ctrl.set_state(vmid, &state).await {
                warn!(vmid, error = %err, "could not persist stranded thread state");
            }
        }
        Err(err) => warn!(vmid, error = %err, "could not load stranded thread state"),
    }
    if let Err(err) = ctrl.set_broken().await {
        warn!(vmid, error = %err, "could not mark session broken");
    }
    if let Err(err) = ctrl
        .log_event(vmid, "stranded", json!({ "message": message }))
        .await
    {
        warn!(vmid, error = %err, "could not log stranded event");
    }
}
