//! Session orchestration
//!
//! A session is the unit of persistence: one executable, every thread's
//! state and future, the activation record arena, stdout, diagnostics, the
//! sticky broken flag, and the top-level result. This module launches the
//! top-level machine, waits (with a deadline) for the whole session to stop,
//! and assembles the user-facing report. It also carries the resume entry
//! point used by remote invocation harnesses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::arec::render_trace;
use crate::controller::{protocol, Controller};
use crate::errors::VmResult;
use crate::executable::Executable;
use crate::invoker::Invoker;
use crate::value::{Value, Vmid};

/// A request to run a program
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub function: String,
    pub args: Vec<Value>,
    /// Deadline for `wait_for_finish`; expiry leaves the session incomplete
    /// but not broken
    pub timeout: Duration,
    pub wait_for_finish: bool,
}

/// One failed thread in a report
#[derive(Debug, Clone)]
pub struct ThreadError {
    pub vmid: Vmid,
    pub message: String,
    /// Caller-first stack trace, when it could be reconstructed
    pub trace: String,
}

/// What came out of a session
#[derive(Debug, Clone)]
pub struct RunReport {
    /// False when the deadline expired with threads still running
    pub finished: bool,
    pub broken: bool,
    pub result: Option<Value>,
    pub stdout: String,
    pub errors: Vec<ThreadError>,
}

/// Orchestrates one session over a controller and an invoker
pub struct Session {
    ctrl: Arc<dyn Controller>,
    invoker: Arc<dyn Invoker>,
    poll_interval: Duration,
}

impl Session {
    pub fn new(
        ctrl: Arc<dyn Controller>,
        invoker: Arc<dyn Invoker>,
        poll_interval: Duration,
    ) -> Self {
        Session {
            ctrl,
            invoker,
            poll_interval,
        }
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.ctrl
    }

    /// Install the executable and launch the top-level machine.
    ///
    /// With `wait_for_finish` the call polls until every thread has stopped
    /// or the timeout passes; otherwise it returns a snapshot immediately
    /// after launch.
    pub async fn start(&self, exe: &Executable, request: RunRequest) -> VmResult<RunReport> {
        self.ctrl.set_executable(exe).await?;
        let vmid =
            protocol::toplevel_machine(self.ctrl.as_ref(), &request.function, request.args).await?;
        info!(function = %request.function, vmid, "session started");
        self.invoker.invoke(vmid).await?;

        if request.wait_for_finish {
            self.wait_until_stopped(request.timeout).await
        } else {
            self.report(false).await
        }
    }

    /// Resume a suspended thread. This is the entry point a remote
    /// invocation harness calls with `{session_id, thread_id}` after
    /// attaching a controller to the session.
    pub async fn resume(&self, vmid: Vmid) -> VmResult<()> {
        self.invoker.invoke(vmid).await
    }

    /// Poll until every thread has stopped or the deadline passes.
    ///
    /// Expiry is an orchestration timeout, not a failure: threads already
    /// launched keep running independently and the session stays unbroken.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> VmResult<RunReport> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ctrl.all_stopped().await? {
                return self.report(true).await;
            }
            if Instant::now() >= deadline {
                info!("session deadline expired with threads still running");
                return self.report(false).await;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Assemble the user-facing view of the session
    pub async fn report(&self, finished: bool) -> VmResult<RunReport> {
        let broken = self.ctrl.is_broken().await?;
        let result = self.ctrl.result().await?;
        let stdout = self.ctrl.read_stdout().await?;

        let mut errors = Vec::new();
        if broken {
            let exe = self.ctrl.executable().await?;
            let count = self.ctrl.thread_count().await?;
            for vmid in 0..count {
                let state = self.ctrl.get_state(vmid).await?;
                if let Some(message) = state.error {
                    let trace = protocol::stack_trace(self.ctrl.as_ref(), &exe, vmid)
                        .await
                        .map(|frames| render_trace(&frames))
                        .unwrap_or_default();
                    errors.push(ThreadError {
                        vmid,
                        message,
                        trace,
                    });
                }
            }
        }

        Ok(RunReport {
            finished,
            broken,
            result,
            stdout,
            errors,
        })
    }
}
