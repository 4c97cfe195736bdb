//! The interpreter
//!
//! One `Machine` executes one thread's instructions against a controller
//! until the thread finishes, suspends on a future, or fails. The machine
//! only ever mutates its own `State`; everything shared (futures, activation
//! records, stdout) goes through the controller. `run()` is the single catch
//! point: an error stops this thread and marks the session broken, and never
//! aborts sibling threads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::arec::{render_trace, ActivationRecord};
use crate::builtins::{self, call_builtin, is_builtin};
use crate::controller::{protocol, Controller};
use crate::errors::{VmError, VmResult};
use crate::executable::Executable;
use crate::foreign::{ForeignIo, ForeignRegistry};
use crate::instruction::{Instruction, Opcode};
use crate::invoker::Invoker;
use crate::state::State;
use crate::value::{Value, Vmid};

/// Where a machine ended up after `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Suspended on an unresolved future; will be re-invoked on resolution
    Waiting,
    /// Finished and resolved its future
    StoppedOk,
    /// Stopped on an error; the session is broken
    StoppedBroken,
}

/// Result of a single instruction step
enum StepOutcome {
    Continue,
    /// Registered as a continuation and persisted; do not touch state again
    Waiting,
    /// Thread's root frame returned this value
    Finished(Value),
}

/// Interpreter for one thread
pub struct Machine<'a> {
    vmid: Vmid,
    state: State,
    exe: Arc<Executable>,
    ctrl: &'a dyn Controller,
    registry: Arc<ForeignRegistry>,
}

impl<'a> Machine<'a> {
    /// Load a thread's persisted state and executable
    pub async fn load(
        ctrl: &'a dyn Controller,
        registry: Arc<ForeignRegistry>,
        vmid: Vmid,
    ) -> VmResult<Machine<'a>> {
        let exe = ctrl.executable().await?;
        let state = ctrl.get_state(vmid).await?;
        Ok(Machine {
            vmid,
            state,
            exe,
            ctrl,
            registry,
        })
    }

    pub fn vmid(&self) -> Vmid {
        self.vmid
    }

    /* ===================== Run loop ===================== */

    /// Execute until this thread stops or suspends.
    ///
    /// Errors from instruction dispatch are caught here: the thread's state
    /// records the message, the session is marked broken, and a diagnostic
    /// event with a caller-first stack trace is logged. Only controller
    /// failures during that error handling propagate out.
    pub async fn run(&mut self, invoker: &dyn Invoker) -> VmResult<MachineStatus> {
        if self.state.stopped {
            // A stale wake-up for a thread that already finished
            return Ok(MachineStatus::StoppedOk);
        }
        debug!(vmid = self.vmid, ip = self.state.ip, "machine running");

        loop {
            match self.step(invoker).await {
                Ok(StepOutcome::Continue) => continue,

                Ok(StepOutcome::Waiting) => {
                    debug!(vmid = self.vmid, ip = self.state.ip, "machine waiting");
                    return Ok(MachineStatus::Waiting);
                }

                Ok(StepOutcome::Finished(value)) => {
                    let woken = match protocol::finish(self.ctrl, self.vmid, value).await {
                        Ok(woken) => woken,
                        Err(err) => {
                            self.stop_broken(err).await?;
                            return Ok(MachineStatus::StoppedBroken);
                        }
                    };
                    self.state.stopped = true;
                    self.state.current_arec = None;
                    self.ctrl.set_state(self.vmid, &self.state).await?;
                    self.ctrl
                        .log_event(self.vmid, "finished", json!({ "woken": woken }))
                        .await?;
                    for waiter in woken {
                        invoker.invoke(waiter).await?;
                    }
                    return Ok(MachineStatus::StoppedOk);
                }

                Err(err) => {
                    self.stop_broken(err).await?;
                    return Ok(MachineStatus::StoppedBroken);
                }
            }
        }
    }

    /// Record a thread failure: stop the thread, mark the session broken,
    /// log the trace. Sibling threads are unaffected.
    async fn stop_broken(&mut self, err: VmError) -> VmResult<()> {
        warn!(vmid = self.vmid, error = %err, "thread stopped on error");
        self.state.stopped = true;
        self.state.error = Some(err.to_string());
        self.ctrl.set_state(self.vmid, &self.state).await?;
        self.ctrl.set_broken().await?;

        let trace = protocol::stack_trace(self.ctrl, &self.exe, self.vmid)
            .await
            .map(|frames| render_trace(&frames))
            .unwrap_or_default();
        self.ctrl
            .log_event(
                self.vmid,
                "error",
                json!({
                    "message": err.to_string(),
                    "user_resolvable": err.is_user_resolvable(),
                    "trace": trace,
                }),
            )
            .await?;
        Ok(())
    }

    /* ===================== Dispatch ===================== */

    /// Fetch, advance, dispatch. Branch instructions overwrite the advanced
    /// ip; `Wait` rewinds it so the instruction repeats after resumption.
    async fn step(&mut self, invoker: &dyn Invoker) -> VmResult<StepOutcome> {
        let instr = self
            .exe
            .fetch(self.state.ip)
            .ok_or_else(|| {
                VmError::unexpected(format!("instruction pointer {} out of bounds", self.state.ip))
            })?
            .clone();
        self.state.ip += 1;

        match instr.op {
            Opcode::Jump => {
                self.state.ip = jump_target(&instr);
                Ok(StepOutcome::Continue)
            }

            Opcode::JumpIf => {
                let cond = self.state.pop()?;
                if cond.is_truthy() {
                    self.state.ip = jump_target(&instr);
                }
                Ok(StepOutcome::Continue)
            }

            Opcode::Call => self.exec_call(&instr).await,
            Opcode::ACall => self.exec_acall(&instr, invoker).await,
            Opcode::Return => self.exec_return().await,

            Opcode::PushV => {
                self.state.push(instr.operands[0].clone());
                Ok(StepOutcome::Continue)
            }

            Opcode::PushB => {
                let name = symbol_operand(&instr);
                let value = self.lookup_binding(name)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Bind => {
                let name = symbol_operand(&instr);
                let value = self.state.pop()?;
                self.state.bindings.insert(name.to_string(), value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Pop => {
                self.state.pop()?;
                Ok(StepOutcome::Continue)
            }

            Opcode::MakeList => {
                let n = count_operand(&instr);
                let items = self.state.pop_n(n)?;
                self.state.push(Value::List(items));
                Ok(StepOutcome::Continue)
            }

            Opcode::MakeHash => {
                let n = count_operand(&instr);
                let mut flat = self.state.pop_n(n * 2)?;
                let mut map = BTreeMap::new();
                while !flat.is_empty() {
                    let value = flat.pop().expect("pair count checked");
                    let key = match flat.pop().expect("pair count checked") {
                        Value::Str(s) | Value::Symbol(s) => s,
                        other => {
                            return Err(VmError::unexpected(format!(
                                "hash key must be Str or Symbol, got {}",
                                other.type_tag()
                            )))
                        }
                    };
                    map.insert(key, value);
                }
                self.state.push(Value::Hash(map));
                Ok(StepOutcome::Continue)
            }

            Opcode::First => {
                let list = self.state.pop()?;
                let value = builtins::list_first(&list)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Rest => {
                let list = self.state.pop()?;
                let value = builtins::list_rest(&list)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Nth => {
                let index = self.state.pop()?;
                let list = self.state.pop()?;
                let value = builtins::list_nth(&list, &index)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Len => {
                let value = self.state.pop()?;
                let len = builtins::length(&value)?;
                self.state.push(len);
                Ok(StepOutcome::Continue)
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let rhs = self.state.pop()?;
                let lhs = self.state.pop()?;
                let value = arithmetic(instr.op, lhs, rhs)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Eq => {
                let rhs = self.state.pop()?;
                let lhs = self.state.pop()?;
                self.state.push(Value::from_bool(lhs == rhs));
                Ok(StepOutcome::Continue)
            }

            Opcode::Lt | Opcode::Gt => {
                let rhs = self.state.pop()?;
                let lhs = self.state.pop()?;
                let value = compare(instr.op, lhs, rhs)?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::Print => {
                let value = self.state.pop()?;
                self.ctrl.write_stdout(&format!("{value}\n")).await?;
                Ok(StepOutcome::Continue)
            }

            Opcode::Sleep => {
                let ms = match self.state.pop()? {
                    Value::Int(ms) if ms >= 0 => ms as u64,
                    other => {
                        return Err(VmError::unexpected(format!(
                            "Sleep expects a non-negative Int, got {}",
                            other.type_tag()
                        )))
                    }
                };
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(StepOutcome::Continue)
            }

            Opcode::Wait => self.exec_wait().await,

            Opcode::Signal => {
                let value = self.state.pop()?;
                Err(VmError::Unhandled(value.to_string()))
            }
        }
    }

    /* ===================== Calls ===================== */

    /// Three-tier callee resolution: thread-local binding, executable global,
    /// VM builtin table.
    fn resolve_callee(&self, callee: &Value) -> VmResult<Callee> {
        let resolved = match callee {
            Value::Symbol(name) => {
                if let Some(bound) = self.state.bindings.get(name) {
                    bound.clone()
                } else if let Some(global) = self.exe.global(name) {
                    global.clone()
                } else if is_builtin(name) {
                    return Ok(Callee::Builtin(name.clone()));
                } else {
                    return Err(VmError::unexpected(format!("no binding for '{name}'")));
                }
            }
            other => other.clone(),
        };

        match resolved {
            Value::FunctionPtr { name, closure } => Ok(Callee::Function { name, closure }),
            Value::ForeignPtr { name, module } => Ok(Callee::Foreign { name, module }),
            other => Err(VmError::unexpected(format!(
                "value of type {} is not callable",
                other.type_tag()
            ))),
        }
    }

    async fn exec_call(&mut self, instr: &Instruction) -> VmResult<StepOutcome> {
        let argc = call_argc(instr);

        match self.resolve_callee(&instr.operands[0])? {
            Callee::Function { name, closure } => {
                let entry = self
                    .exe
                    .location_of(&name)
                    .ok_or_else(|| VmError::unexpected(format!("no such function '{name}'")))?;
                let current = self.current_arec()?;

                // Save the live bindings into the caller frame before the
                // callee takes over the state
                let mut rec = self.ctrl.get_arec(current).await?;
                rec.bindings = self.state.bindings.clone();
                self.ctrl.set_arec(current, &rec).await?;

                let frame = ActivationRecord::call(
                    Value::FunctionPtr {
                        name: name.clone(),
                        closure,
                    },
                    self.vmid,
                    current,
                    self.state.ip,
                );
                let ptr = protocol::push_arec(self.ctrl, &frame).await?;

                self.state.current_arec = Some(ptr);
                self.state.bindings = match closure {
                    Some(closure_ptr) => self.ctrl.get_arec(closure_ptr).await?.bindings,
                    None => BTreeMap::new(),
                };
                // Arguments stay on the data stack; the callee prologue
                // binds them
                self.state.ip = entry;
                Ok(StepOutcome::Continue)
            }

            Callee::Foreign { module, name } => {
                let args = self.state.pop_n(argc)?;
                let (value, output) = self.registry.call(&module, &name, &args)?;
                if !output.is_empty() {
                    self.ctrl.write_stdout(&output).await?;
                }
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }

            Callee::Builtin(name) => {
                let args = self.state.pop_n(argc)?;
                let mut io = ForeignIo::default();
                let value = call_builtin(&name, &args, &self.registry, &mut io)?;
                let output = io.take_output();
                if !output.is_empty() {
                    self.ctrl.write_stdout(&output).await?;
                }
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }
        }
    }

    async fn exec_acall(
        &mut self,
        instr: &Instruction,
        invoker: &dyn Invoker,
    ) -> VmResult<StepOutcome> {
        let argc = call_argc(instr);

        let name = match self.resolve_callee(&instr.operands[0])? {
            Callee::Function { name, .. } => name,
            other => {
                return Err(VmError::unexpected(format!(
                    "async call target must be a language function, got {other:?}"
                )))
            }
        };

        let args = self.state.pop_n(argc)?;
        let child = protocol::thread_machine(
            self.ctrl,
            self.vmid,
            self.state.current_arec,
            &name,
            args,
        )
        .await?;

        // The caller does not block: it gets the future and moves on
        self.state.push(Value::FuturePtr { vmid: child });
        invoker.invoke(child).await?;
        Ok(StepOutcome::Continue)
    }

    async fn exec_return(&mut self) -> VmResult<StepOutcome> {
        let value = self.state.pop()?;
        let current = self.current_arec()?;
        let rec = self.ctrl.get_arec(current).await?;
        protocol::pop_arec(self.ctrl, current).await?;

        match (rec.call_site, rec.dynamic_chain) {
            // Synchronous return: the dynamic chain continues in this thread
            (Some(return_ip), Some(parent)) => {
                let caller = self.ctrl.get_arec(parent).await?;
                self.state.ip = return_ip;
                self.state.bindings = caller.bindings;
                self.state.current_arec = Some(parent);
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }
            // Root frame: this thread is done
            _ => Ok(StepOutcome::Finished(value)),
        }
    }

    /* ===================== Wait ===================== */

    async fn exec_wait(&mut self) -> VmResult<StepOutcome> {
        let top = self.state.peek()?.clone();

        let target = match top {
            Value::FuturePtr { vmid } => vmid,
            other if other.contains_future_ptr() => {
                return Err(VmError::unexpected(
                    "cannot wait on a compound value containing futures; wait on each element",
                ));
            }
            // Waiting on an ordinary value is the identity
            _ => return Ok(StepOutcome::Continue),
        };

        // Rewind so the instruction repeats deterministically after
        // resumption, and persist BEFORE registering as a continuation:
        // once registered, a resolver may re-invoke this thread at any
        // moment, and it must see the suspended state.
        let wait_ip = self.state.ip - 1;
        self.state.ip = wait_ip;
        self.ctrl.set_state(self.vmid, &self.state).await?;

        match protocol::get_or_wait(self.ctrl, self.vmid, target).await? {
            protocol::WaitOutcome::Resolved(value) => {
                self.state.ip = wait_ip + 1;
                self.state.pop()?;
                self.state.push(value);
                Ok(StepOutcome::Continue)
            }
            protocol::WaitOutcome::Pending => Ok(StepOutcome::Waiting),
        }
    }

    fn current_arec(&self) -> VmResult<crate::value::ArecPtr> {
        self.state
            .current_arec
            .ok_or_else(|| VmError::unexpected("thread has no current activation record"))
    }

    fn lookup_binding(&self, name: &str) -> VmResult<Value> {
        if let Some(local) = self.state.bindings.get(name) {
            return Ok(local.clone());
        }
        if let Some(global) = self.exe.global(name) {
            return Ok(global.clone());
        }
        Err(VmError::unexpected(format!("no binding for '{name}'")))
    }
}

#[derive(Debug)]
enum Callee {
    Function {
        name: String,
        closure: Option<crate::value::ArecPtr>,
    },
    Foreign {
        module: String,
        name: String,
    },
    Builtin(String),
}

/* ===================== Operand accessors ===================== */

// Operand shapes were validated at instruction construction, so these
// accessors are infallible.

fn symbol_operand(instr: &Instruction) -> &str {
    match &instr.operands[0] {
        Value::Symbol(name) => name,
        _ => unreachable!("symbol operand validated at construction"),
    }
}

fn jump_target(instr: &Instruction) -> usize {
    match &instr.operands[0] {
        Value::Int(target) => *target as usize,
        _ => unreachable!("jump operand validated at construction"),
    }
}

fn call_argc(instr: &Instruction) -> usize {
    match &instr.operands[1] {
        Value::Int(argc) => *argc as usize,
        _ => unreachable!("call argc validated at construction"),
    }
}

fn count_operand(instr: &Instruction) -> usize {
    match &instr.operands[0] {
        Value::Int(n) => *n as usize,
        _ => unreachable!("count operand validated at construction"),
    }
}

/* ===================== Arithmetic ===================== */

fn arithmetic(op: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
    use Value::{Float, Int, Str};

    match (op, lhs, rhs) {
        (Opcode::Add, Int(a), Int(b)) => Ok(Int(a + b)),
        (Opcode::Sub, Int(a), Int(b)) => Ok(Int(a - b)),
        (Opcode::Mul, Int(a), Int(b)) => Ok(Int(a * b)),
        (Opcode::Div, Int(_), Int(0)) => Err(VmError::unexpected("division by zero")),
        (Opcode::Div, Int(a), Int(b)) => Ok(Int(a / b)),

        (op, lhs, rhs) => match (op, as_float(&lhs), as_float(&rhs)) {
            (Opcode::Add, Some(a), Some(b)) => Ok(Float(a + b)),
            (Opcode::Sub, Some(a), Some(b)) => Ok(Float(a - b)),
            (Opcode::Mul, Some(a), Some(b)) => Ok(Float(a * b)),
            (Opcode::Div, Some(_), Some(b)) if b == 0.0 => {
                Err(VmError::unexpected("division by zero"))
            }
            (Opcode::Div, Some(a), Some(b)) => Ok(Float(a / b)),
            _ => match (op, lhs, rhs) {
                (Opcode::Add, Str(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
                (op, lhs, rhs) => Err(VmError::unexpected(format!(
                    "{} not defined for {} and {}",
                    op.name(),
                    lhs.type_tag(),
                    rhs.type_tag()
                ))),
            },
        },
    }
}

fn compare(op: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
    let ordering = match (&lhs, &rhs) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (lhs, rhs) => match (as_float(lhs), as_float(rhs)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };

    let ordering = ordering.ok_or_else(|| {
        VmError::unexpected(format!(
            "{} not defined for {} and {}",
            op.name(),
            lhs.type_tag(),
            rhs.type_tag()
        ))
    })?;

    let result = match op {
        Opcode::Lt => ordering == std::cmp::Ordering::Less,
        Opcode::Gt => ordering == std::cmp::Ordering::Greater,
        _ => unreachable!("compare handles Lt and Gt only"),
    };
    Ok(Value::from_bool(result))
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}
