//! End-to-end scenarios over hand-assembled executables
//!
//! These run whole programs through a session: builder-assembled bytecode,
//! an in-memory controller, and either the inline invoker (deterministic) or
//! the task invoker (threads genuinely run in parallel).

use std::sync::Arc;
use std::time::Duration;

use crate::config::LockConfig;
use crate::controller::{protocol, Controller, MemoryController};
use crate::executable::{Executable, ExecutableBuilder};
use crate::foreign::{ForeignCallError, ForeignRegistry};
use crate::instruction::{Instruction, Opcode};
use crate::invoker::{InlineInvoker, Invoker, TaskInvoker};
use crate::machine::{Machine, MachineStatus};
use crate::session::{RunRequest, RunReport, Session};
use crate::value::Value;

/* ===================== Assembly helpers ===================== */

fn push_v(value: Value) -> Instruction {
    Instruction::new(Opcode::PushV, vec![value], None).unwrap()
}

fn push_b(name: &str) -> Instruction {
    Instruction::new(Opcode::PushB, vec![Value::Symbol(name.into())], None).unwrap()
}

fn call(name: &str, argc: i64) -> Instruction {
    Instruction::new(
        Opcode::Call,
        vec![Value::Symbol(name.into()), Value::Int(argc)],
        None,
    )
    .unwrap()
}

fn acall(name: &str, argc: i64) -> Instruction {
    Instruction::new(
        Opcode::ACall,
        vec![Value::Symbol(name.into()), Value::Int(argc)],
        None,
    )
    .unwrap()
}

fn bind(name: &str) -> Instruction {
    Instruction::new(Opcode::Bind, vec![Value::Symbol(name.into())], None).unwrap()
}

fn make_list(n: i64) -> Instruction {
    Instruction::new(Opcode::MakeList, vec![Value::Int(n)], None).unwrap()
}

fn op(opcode: Opcode) -> Instruction {
    Instruction::bare(opcode)
}

/* ===================== Session helpers ===================== */

fn quick_locks() -> LockConfig {
    LockConfig {
        retry_ms: 2,
        timeout_ms: 500,
    }
}

fn request(function: &str, args: Vec<Value>) -> RunRequest {
    RunRequest {
        function: function.to_string(),
        args,
        timeout: Duration::from_secs(5),
        wait_for_finish: true,
    }
}

/// Run with the inline invoker: forks execute at their fork point
async fn run_inline(
    exe: &Executable,
    registry: ForeignRegistry,
    req: RunRequest,
) -> (RunReport, Arc<MemoryController>) {
    let ctrl = Arc::new(MemoryController::new(quick_locks()));
    let registry = Arc::new(registry);
    let invoker = Arc::new(InlineInvoker::new(ctrl.clone(), registry));
    let session = Session::new(ctrl.clone(), invoker, Duration::from_millis(5));
    let report = session.start(exe, req).await.unwrap();
    (report, ctrl)
}

/// Run with the task invoker: forks race on the tokio runtime
async fn run_tasks(
    exe: &Executable,
    registry: ForeignRegistry,
    req: RunRequest,
) -> (RunReport, Arc<MemoryController>) {
    let ctrl = Arc::new(MemoryController::new(quick_locks()));
    let registry = Arc::new(registry);
    let invoker = Arc::new(TaskInvoker::new(ctrl.clone(), registry));
    let session = Session::new(ctrl.clone(), invoker, Duration::from_millis(5));
    let report = session.start(exe, req).await.unwrap();
    (report, ctrl)
}

fn test_registry() -> ForeignRegistry {
    let mut registry = ForeignRegistry::with_host_module();
    registry.register("test", "affine", |args, _io| match args {
        [Value::Int(x)] => Ok(Value::Int(2 * x + 3)),
        _ => Err(ForeignCallError::new("affine expects one int")),
    });
    registry.register("test", "plus2", |args, _io| match args {
        [Value::Int(x)] => Ok(Value::Int(x + 2)),
        _ => Err(ForeignCallError::new("plus2 expects one int")),
    });
    registry.register("test", "slow_identity", |args, _io| {
        std::thread::sleep(Duration::from_millis(20));
        match args {
            [v] => Ok(v.clone()),
            _ => Err(ForeignCallError::new("slow_identity expects one argument")),
        }
    });
    registry
}

/* ===================== Shared programs ===================== */

/// a(x)=x+1, b(y)=1000y, c(x)=x-1, d(y)=10y, h(p,q)=p-q
fn arithmetic_functions(builder: ExecutableBuilder) -> ExecutableBuilder {
    builder
        .function(
            "a",
            &["x"],
            vec![push_b("x"), push_v(Value::Int(1)), op(Opcode::Add), op(Opcode::Return)],
        )
        .function(
            "b",
            &["y"],
            vec![push_v(Value::Int(1000)), push_b("y"), op(Opcode::Mul), op(Opcode::Return)],
        )
        .function(
            "c",
            &["x"],
            vec![push_b("x"), push_v(Value::Int(1)), op(Opcode::Sub), op(Opcode::Return)],
        )
        .function(
            "d",
            &["y"],
            vec![push_v(Value::Int(10)), push_b("y"), op(Opcode::Mul), op(Opcode::Return)],
        )
        .function(
            "h",
            &["p", "q"],
            vec![push_b("p"), push_b("q"), op(Opcode::Sub), op(Opcode::Return)],
        )
}

/* ===================== Scenario A ===================== */

#[tokio::test]
async fn test_scenario_a_synchronous_composition() {
    // h(b(a(x)), d(c(x))) with h(p,q) = p - q computes 1000*(x+1) - 10*(x-1)
    let exe = arithmetic_functions(ExecutableBuilder::new())
        .function(
            "main",
            &["x"],
            vec![
                push_b("x"),
                call("a", 1),
                call("b", 1),
                push_b("x"),
                call("c", 1),
                call("d", 1),
                call("h", 2),
                op(Opcode::Return),
            ],
        )
        .build();

    let (report, _) = run_inline(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
    assert!(report.finished);
    assert!(!report.broken);
    assert_eq!(report.result, Some(Value::Int(5960)));
}

fn forked_branches_executable() -> Executable {
    arithmetic_functions(ExecutableBuilder::new())
        .function(
            "branch1",
            &["x"],
            vec![push_b("x"), call("a", 1), call("b", 1), op(Opcode::Return)],
        )
        .function(
            "branch2",
            &["x"],
            vec![push_b("x"), call("c", 1), call("d", 1), op(Opcode::Return)],
        )
        .function(
            "main",
            &["x"],
            vec![
                push_b("x"),
                acall("branch1", 1),
                push_b("x"),
                acall("branch2", 1),
                // Stack: F1 F2. Wait on each, innermost first.
                op(Opcode::Wait),
                bind("q"),
                op(Opcode::Wait),
                bind("p"),
                push_b("p"),
                push_b("q"),
                op(Opcode::Sub),
                op(Opcode::Return),
            ],
        )
        .build()
}

#[tokio::test]
async fn test_scenario_a_forked_inline() {
    let exe = forked_branches_executable();
    let (report, _) = run_inline(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
    assert_eq!(report.result, Some(Value::Int(5960)));
    assert!(!report.broken);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scenario_a_forked_parallel() {
    // Same program, branches raced on real tasks: the result must not depend
    // on completion order
    let exe = forked_branches_executable();
    for _ in 0..5 {
        let (report, _) =
            run_tasks(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
        assert!(report.finished);
        assert_eq!(report.result, Some(Value::Int(5960)));
    }
}

/* ===================== Scenario B ===================== */

#[tokio::test]
async fn test_scenario_b_map_over_foreign() {
    // main(list) = map_resolve(affine, list) with affine(x) = 2x + 3
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &["list"],
            vec![
                push_v(Value::foreign("test", "affine")),
                push_b("list"),
                call("map_resolve", 2),
                op(Opcode::Return),
            ],
        )
        .build();

    let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
    let (report, _) = run_inline(&exe, test_registry(), request("main", vec![list])).await;
    assert_eq!(
        report.result,
        Some(Value::List(vec![Value::Int(5), Value::Int(7)]))
    );
}

/* ===================== Scenario C ===================== */

fn nested_await_executable() -> Executable {
    ExecutableBuilder::new()
        .function(
            "relay",
            &["x"],
            vec![
                push_b("x"),
                call("slow", 1),
                op(Opcode::Return),
            ],
        )
        .function(
            "main",
            &["x"],
            vec![
                push_b("x"),
                acall("relay", 1),
                op(Opcode::Wait),
                op(Opcode::Return),
            ],
        )
        .bind("slow", Value::foreign("test", "slow_identity"))
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scenario_c_forked_call_with_blocking_foreign() {
    // main forks relay, which performs a blocking foreign call; the value
    // passes through unchanged
    let exe = nested_await_executable();
    let (report, _) = run_tasks(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
    assert!(report.finished);
    assert!(!report.broken);
    assert_eq!(report.result, Some(Value::Int(5)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scenario_c_returning_future_chains() {
    // main returns the forked thread's future instead of waiting on it; the
    // session result settles through the chain when relay resolves
    let exe = ExecutableBuilder::new()
        .function(
            "relay",
            &["x"],
            vec![push_b("x"), call("slow", 1), op(Opcode::Return)],
        )
        .function(
            "main",
            &["x"],
            vec![push_b("x"), acall("relay", 1), op(Opcode::Return)],
        )
        .bind("slow", Value::foreign("test", "slow_identity"))
        .build();

    let (report, _) = run_tasks(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
    assert!(report.finished);
    assert_eq!(report.result, Some(Value::Int(5)));
}

/* ===================== Scenario D ===================== */

#[tokio::test]
async fn test_scenario_d_mixed_list_construction() {
    // main(x) = [1, f2(x), f3(x), f4(x)] with f2(x)=x, f3(x)=x+1 (language)
    // and f4(x)=x+2 (foreign)
    let exe = ExecutableBuilder::new()
        .function("f2", &["x"], vec![push_b("x"), op(Opcode::Return)])
        .function(
            "f3",
            &["x"],
            vec![push_b("x"), push_v(Value::Int(1)), op(Opcode::Add), op(Opcode::Return)],
        )
        .function(
            "main",
            &["x"],
            vec![
                push_v(Value::Int(1)),
                push_b("x"),
                call("f2", 1),
                push_b("x"),
                call("f3", 1),
                push_b("x"),
                call("f4", 1),
                make_list(4),
                op(Opcode::Return),
            ],
        )
        .bind("f4", Value::foreign("test", "plus2"))
        .build();

    let (report, _) = run_inline(&exe, test_registry(), request("main", vec![Value::Int(2)])).await;
    assert_eq!(
        report.result,
        Some(Value::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
        ]))
    );
}

/* ===================== Wait determinism ===================== */

#[tokio::test]
async fn test_wait_leaves_ip_on_the_wait_instruction() {
    // main's body is just Wait/Return over a future argument
    let exe = ExecutableBuilder::new()
        .function("main", &[], vec![op(Opcode::Wait), op(Opcode::Return)])
        .build();

    let ctrl = Arc::new(MemoryController::new(quick_locks()));
    ctrl.set_executable(&exe).await.unwrap();

    // Thread 1 exists only as a future to wait on
    let main_vmid = protocol::toplevel_machine(
        ctrl.as_ref(),
        "main",
        vec![Value::FuturePtr { vmid: 1 }],
    )
    .await
    .unwrap();
    let waitee = ctrl.new_thread().await.unwrap();
    assert_eq!((main_vmid, waitee), (0, 1));

    let registry = Arc::new(ForeignRegistry::new());
    let invoker = InlineInvoker::new(ctrl.clone(), registry.clone());

    let mut machine = Machine::load(ctrl.as_ref(), registry.clone(), main_vmid)
        .await
        .unwrap();
    let status = machine.run(&invoker).await.unwrap();
    assert_eq!(status, MachineStatus::Waiting);

    // Suspended exactly on the Wait instruction, stack intact, registered
    // as a continuation
    let wait_ip = exe.location_of("main").unwrap();
    let state = ctrl.get_state(main_vmid).await.unwrap();
    assert_eq!(state.ip, wait_ip);
    assert_eq!(state.data_stack, vec![Value::FuturePtr { vmid: 1 }]);
    assert!(!state.stopped);
    assert_eq!(
        ctrl.get_future(waitee).await.unwrap().continuations,
        vec![main_vmid]
    );

    // Resolving wakes the thread exactly once; re-executing the same Wait
    // yields the value and the program completes
    let woken = protocol::resolve_future(ctrl.as_ref(), waitee, waitee, Value::Int(42))
        .await
        .unwrap();
    assert_eq!(woken, vec![main_vmid]);
    invoker.invoke(main_vmid).await.unwrap();

    assert_eq!(ctrl.result().await.unwrap(), Some(Value::Int(42)));
    assert!(ctrl.get_state(main_vmid).await.unwrap().stopped);
}

#[tokio::test]
async fn test_wait_on_compound_with_future_is_an_error() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &[],
            vec![
                push_v(Value::FuturePtr { vmid: 9 }),
                make_list(1),
                op(Opcode::Wait),
                op(Opcode::Return),
            ],
        )
        .build();

    let (report, _) = run_inline(&exe, ForeignRegistry::new(), request("main", vec![])).await;
    assert!(report.broken);
    assert!(report.errors[0].message.contains("each element"));
}

#[tokio::test]
async fn test_wait_on_plain_value_is_identity() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &["x"],
            vec![push_b("x"), op(Opcode::Wait), op(Opcode::Return)],
        )
        .build();

    let (report, _) =
        run_inline(&exe, ForeignRegistry::new(), request("main", vec![Value::Int(3)])).await;
    assert_eq!(report.result, Some(Value::Int(3)));
}

/* ===================== Errors & diagnostics ===================== */

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_breaks_session_but_not_siblings() {
    // main forks a healthy worker, then signals. The session breaks, but the
    // worker still completes and resolves its own future.
    let exe = ExecutableBuilder::new()
        .function(
            "worker",
            &["x"],
            vec![push_b("x"), op(Opcode::Return)],
        )
        .function(
            "main",
            &["x"],
            vec![
                push_b("x"),
                acall("worker", 1),
                op(Opcode::Pop),
                push_v(Value::Str("boom".into())),
                op(Opcode::Signal),
            ],
        )
        .build();

    let (report, ctrl) =
        run_tasks(&exe, ForeignRegistry::new(), request("main", vec![Value::Int(7)])).await;
    assert!(report.finished);
    assert!(report.broken);
    assert_eq!(report.result, None);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].message.contains("boom"));

    // The sibling's future resolved regardless
    let worker_future = ctrl.get_future(1).await.unwrap();
    assert!(worker_future.resolved);
    assert_eq!(worker_future.value, Some(Value::Int(7)));
}

#[tokio::test]
async fn test_stack_trace_is_caller_first() {
    // main -> middle -> inner, inner signals
    let exe = ExecutableBuilder::new()
        .function(
            "inner",
            &[],
            vec![push_v(Value::Str("deep failure".into())), op(Opcode::Signal)],
        )
        .function("middle", &[], vec![call("inner", 0), op(Opcode::Return)])
        .function("main", &[], vec![call("middle", 0), op(Opcode::Return)])
        .build();

    let (report, _) = run_inline(&exe, ForeignRegistry::new(), request("main", vec![])).await;
    assert!(report.broken);

    let trace = &report.errors[0].trace;
    let main_at = trace.find("main").expect("main in trace");
    let middle_at = trace.find("middle").expect("middle in trace");
    let inner_at = trace.find("inner").expect("inner in trace");
    assert!(main_at < middle_at && middle_at < inner_at, "trace: {trace}");
}

#[tokio::test]
async fn test_foreign_error_is_user_resolvable_and_breaks() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &[],
            vec![
                push_v(Value::Str("not a number".into())),
                call("dbl", 1),
                op(Opcode::Return),
            ],
        )
        .bind("dbl", Value::foreign("host", "double"))
        .build();

    let (report, _) = run_inline(&exe, test_registry(), request("main", vec![])).await;
    assert!(report.broken);
    assert!(report.errors[0].message.contains("host.double"));
}

/* ===================== Effects ===================== */

#[tokio::test]
async fn test_print_appends_to_session_stdout() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &["x"],
            vec![
                push_v(Value::Str("starting".into())),
                op(Opcode::Print),
                push_b("x"),
                call("say", 1),
                op(Opcode::Pop),
                push_v(Value::Null),
                op(Opcode::Return),
            ],
        )
        .bind("say", Value::foreign("host", "print"))
        .build();

    let (report, _) =
        run_inline(&exe, test_registry(), request("main", vec![Value::Int(12)])).await;
    assert!(!report.broken);
    assert_eq!(report.stdout, "starting\n12\n");
}

#[tokio::test]
async fn test_sleep_pauses_in_place() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &[],
            vec![
                push_v(Value::Int(5)),
                op(Opcode::Sleep),
                push_v(Value::Int(1)),
                op(Opcode::Return),
            ],
        )
        .build();

    let (report, _) = run_inline(&exe, ForeignRegistry::new(), request("main", vec![])).await;
    assert_eq!(report.result, Some(Value::Int(1)));
}

/* ===================== Resource reclamation ===================== */

#[tokio::test(flavor = "multi_thread")]
async fn test_arena_is_empty_after_forked_run() {
    // Every frame, including cross-thread chains, is reclaimed by the time
    // the session stops
    let exe = forked_branches_executable();
    let (report, ctrl) =
        run_tasks(&exe, test_registry(), request("main", vec![Value::Int(5)])).await;
    assert!(report.finished);

    for ptr in 0..16 {
        assert!(
            ctrl.get_arec(ptr).await.is_err(),
            "activation record {ptr} leaked"
        );
    }
}

/* ===================== Orchestration deadline ===================== */

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_expiry_is_not_broken() {
    let exe = ExecutableBuilder::new()
        .function(
            "main",
            &[],
            vec![
                push_v(Value::Int(200)),
                op(Opcode::Sleep),
                push_v(Value::Int(1)),
                op(Opcode::Return),
            ],
        )
        .build();

    let ctrl = Arc::new(MemoryController::new(quick_locks()));
    let registry = Arc::new(ForeignRegistry::new());
    let invoker = Arc::new(TaskInvoker::new(ctrl.clone(), registry));
    let session = Session::new(ctrl.clone(), invoker, Duration::from_millis(5));

    // The deadline expires while main is still sleeping
    let report = session
        .start(
            &exe,
            RunRequest {
                function: "main".into(),
                args: vec![],
                timeout: Duration::from_millis(40),
                wait_for_finish: true,
            },
        )
        .await
        .unwrap();
    assert!(!report.finished);
    assert!(!report.broken);
    assert_eq!(report.result, None);

    // The launched thread keeps running independently and completes
    let report = session
        .wait_until_stopped(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(report.finished);
    assert_eq!(report.result, Some(Value::Int(1)));
}
