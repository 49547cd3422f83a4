use std::time::{Duration, Instant};

use bastion::{rewrite, GuardError, ResourceLimits, RewriteSettings, RewrittenProgram};
use bastion_il::{
    BodyBuilder, HandlerKind, MemberRef, MethodBody, Op, ProgramBuilder, TypeKind, TypeRef,
    TypeSig,
};
use bastion_vm::{ExecError, HostObject, LoadError, Value, Vm};

fn sandbox(source: &[u8]) -> (RewrittenProgram, Vm) {
    let rewritten = rewrite(source, &RewriteSettings::default()).expect("rewrite");
    let vm = Vm::load(&rewritten.bytes).expect("load rewritten");
    (rewritten, vm)
}

fn limits(time_ms: u64, allocations: u64) -> ResourceLimits {
    ResourceLimits {
        time: Duration::from_millis(time_ms),
        allocations,
        ..ResourceLimits::default()
    }
}

fn single(name: &str, params: Vec<TypeSig>, ret: TypeSig, body: MethodBody) -> Vec<u8> {
    let mut b = ProgramBuilder::new(name);
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, params, ret);
    b.set_body(main, body);
    b.set_entry(main);
    b.encode()
}

/// `for (i = 0; i < n; i++) sum += i; return sum;`
fn counting_loop(name: &str) -> Vec<u8> {
    let mut body = BodyBuilder::new(vec![TypeSig::I32, TypeSig::I32]);
    let (head, exit) = (body.label(), body.label());
    body.ops([Op::LdcI4(0), Op::Stloc(0), Op::LdcI4(0), Op::Stloc(1)]);
    body.mark(head).ops([Op::Ldloc(0), Op::Ldarg(0)]).branch(Op::Bge, exit);
    body.ops([Op::Ldloc(1), Op::Ldloc(0), Op::Add, Op::Stloc(1)]);
    body.ops([Op::Ldloc(0), Op::LdcI4(1), Op::Add, Op::Stloc(0)]);
    body.branch(Op::Br, head);
    body.mark(exit).ops([Op::Ldloc(1), Op::Ret]);
    single(name, vec![TypeSig::I32], TypeSig::I32, body.finish().expect("body"))
}

fn int_result(result: Result<Option<Value>, ExecError>) -> i64 {
    match result {
        Ok(Some(value)) => value.as_i64().expect("integer result"),
        other => panic!("expected an integer result, got {other:?}"),
    }
}

fn list_of_int() -> TypeSig {
    TypeSig::Inst(
        Box::new(TypeSig::named("System.Collections.Generic", "List`1")),
        vec![TypeSig::I32],
    )
}

fn enumerable_of_int() -> TypeSig {
    TypeSig::Inst(
        Box::new(TypeSig::named("System.Collections.Generic", "IEnumerable`1")),
        vec![TypeSig::I32],
    )
}

#[test]
fn rewritten_loop_computes_the_same_result() {
    let source = counting_loop("same-result");
    let original = Vm::load(&source).expect("load original");
    let expected = int_result(original.run(vec![Value::I32(10)]));
    assert_eq!(expected, 45);

    let (rewritten, vm) = sandbox(&source);
    let _scope = rewritten.token.open_scope(ResourceLimits::default());
    assert_eq!(int_result(vm.run(vec![Value::I32(10)])), expected);
}

#[test]
fn infinite_loop_stops_at_the_time_limit() {
    let mut body = BodyBuilder::new(Vec::new());
    let head = body.label();
    body.mark(head).branch(Op::Br, head);
    let source = single("spin", Vec::new(), TypeSig::Void, body.finish().expect("body"));

    let (rewritten, vm) = sandbox(&source);
    let _scope = rewritten.token.open_scope(limits(100, 1_000));
    let started = Instant::now();
    let err = vm.run(Vec::new()).expect_err("must not finish");
    assert!(
        matches!(err, ExecError::Guard(GuardError::TimeLimit { limit, .. }) if limit == Duration::from_millis(100)),
        "{err}"
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
}

#[test]
fn handlers_cannot_swallow_guard_failures() {
    // try { throw null; } catch { leave try_start; }
    let mut body = BodyBuilder::new(Vec::new());
    let (ts, hs, end) = (body.label(), body.label(), body.label());
    body.mark(ts).ops([Op::LdNull, Op::Throw]);
    body.mark(hs).op(Op::Pop).branch(Op::Leave, ts);
    body.mark(end).op(Op::Ret);
    body.handler(HandlerKind::Catch(None), ts, hs, hs, end);
    let source = single("swallow", Vec::new(), TypeSig::Void, body.finish().expect("body"));

    let (rewritten, vm) = sandbox(&source);
    let _scope = rewritten.token.open_scope(limits(100, 1_000));
    let err = vm.run(Vec::new()).expect_err("must not finish");
    assert!(matches!(err, ExecError::Guard(GuardError::TimeLimit { .. })), "{err}");
}

#[test]
fn unbounded_recursion_stops_at_the_stack_limit() {
    let mut b = ProgramBuilder::new("recursion");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let recurse = b.declare_method(ty, "Recurse", true, vec![TypeSig::I32], TypeSig::I32);
    b.set_body(
        recurse,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::Ldarg(0),
                Op::LdcI4(1),
                Op::Add,
                Op::Call(bastion_il::MethodTarget::Def(recurse)),
                Op::Ret,
            ],
        ),
    );
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::I32);
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::LdcI4(0),
                Op::Call(bastion_il::MethodTarget::Def(recurse)),
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    assert_stops_at_stack_limit(&b.encode());
}

#[test]
fn mutual_recursion_stops_at_the_stack_limit() {
    let mut b = ProgramBuilder::new("mutual-recursion");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let ping = b.declare_method(ty, "Ping", true, vec![TypeSig::I32], TypeSig::I32);
    let pong = b.declare_method(ty, "Pong", true, vec![TypeSig::I32], TypeSig::I32);
    for (from, to) in [(ping, pong), (pong, ping)] {
        b.set_body(
            from,
            MethodBody::new(
                Vec::new(),
                vec![
                    Op::Ldarg(0),
                    Op::LdcI4(1),
                    Op::Add,
                    Op::Call(bastion_il::MethodTarget::Def(to)),
                    Op::Ret,
                ],
            ),
        );
    }
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::I32);
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::LdcI4(0),
                Op::Call(bastion_il::MethodTarget::Def(ping)),
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    assert_stops_at_stack_limit(&b.encode());
}

/// Runs on a thread whose native stack is far larger than the budget, so the guard trips
/// long before a real overflow.
fn assert_stops_at_stack_limit(source: &[u8]) {
    let (rewritten, vm) = sandbox(source);
    let outcome = std::thread::Builder::new()
        .stack_size(64 << 20)
        .spawn(move || {
            let _scope = rewritten.token.open_scope(ResourceLimits {
                stack_bytes: 256 * 1024,
                time: Duration::from_secs(30),
                ..ResourceLimits::default()
            });
            vm.run(Vec::new())
        })
        .expect("spawn")
        .join()
        .expect("join");
    assert!(
        matches!(outcome, Err(ExecError::Guard(GuardError::StackLimit { limit: 262_144, .. }))),
        "{outcome:?}"
    );
}

#[test]
fn array_allocations_accumulate_within_a_scope() {
    let body = MethodBody::new(
        Vec::new(),
        vec![Op::Ldarg(0), Op::Newarr(TypeSig::I32), Op::Pop, Op::Ret],
    );
    let source = single("arrays", vec![TypeSig::I32], TypeSig::Void, body);
    let (rewritten, vm) = sandbox(&source);

    let _scope = rewritten.token.open_scope(limits(5_000, 50));
    vm.run(vec![Value::I32(10)]).expect("within budget");
    let err = vm.run(vec![Value::I32(50)]).expect_err("over budget");
    assert_eq!(err, ExecError::Guard(GuardError::MemoryLimit { total: 60, limit: 50 }));
}

#[test]
fn list_growth_is_charged_per_add() {
    let mut b = ProgramBuilder::new("list-growth");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::I32);
    let ctor = b.member(MemberRef::method(list_of_int(), ".ctor", false, Vec::new(), TypeSig::Void));
    let add = b.member(MemberRef::method(
        list_of_int(),
        "Add",
        false,
        vec![TypeSig::GenericParam(0)],
        TypeSig::Void,
    ));
    let count = b.member(MemberRef::method(list_of_int(), "get_Count", false, Vec::new(), TypeSig::I32));

    let mut body = BodyBuilder::new(vec![list_of_int(), TypeSig::I32]);
    let (head, exit) = (body.label(), body.label());
    body.ops([Op::Newobj(ctor), Op::Stloc(0), Op::LdcI4(0), Op::Stloc(1)]);
    body.mark(head).ops([Op::Ldloc(1), Op::LdcI4(100_000)]).branch(Op::Bge, exit);
    body.ops([Op::Ldloc(0), Op::Ldloc(1), Op::Callvirt(add)]);
    body.ops([Op::Ldloc(1), Op::LdcI4(1), Op::Add, Op::Stloc(1)]);
    body.branch(Op::Br, head);
    body.mark(exit).ops([Op::Ldloc(0), Op::Callvirt(count), Op::Ret]);
    b.set_body(main, body.finish().expect("body"));
    b.set_entry(main);
    let source = b.encode();

    let original = Vm::load(&source).expect("load original");
    assert_eq!(int_result(original.run(Vec::new())), 100_000);

    let (rewritten, vm) = sandbox(&source);
    let _scope = rewritten.token.open_scope(limits(60_000, 50_000));
    let err = vm.run(Vec::new()).expect_err("over budget");
    assert_eq!(
        err,
        ExecError::Guard(GuardError::MemoryLimit {
            total: 50_001,
            limit: 50_000
        })
    );
}

#[test]
fn lazy_sequences_are_charged_as_they_are_pulled() {
    let mut b = ProgramBuilder::new("lazy-range");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::Void);
    let enumerable = TypeSig::named("System.Linq", "Enumerable");
    let range = b.member(MemberRef::method(
        enumerable.clone(),
        "Range",
        true,
        vec![TypeSig::I32, TypeSig::I32],
        enumerable_of_int(),
    ));
    let to_list = b.member(MemberRef::method(
        enumerable,
        "ToList",
        true,
        vec![enumerable_of_int()],
        list_of_int(),
    ));
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::LdcI4(0),
                Op::LdcI4(1_000_000),
                Op::Call(range),
                Op::Call(to_list),
                Op::Pop,
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    let (rewritten, vm) = sandbox(&b.encode());

    let _scope = rewritten.token.open_scope(limits(30_000, 1_000));
    let err = vm.run(Vec::new()).expect_err("over budget");
    assert_eq!(
        err,
        ExecError::Guard(GuardError::MemoryLimit {
            total: 1_001,
            limit: 1_000
        })
    );
}

#[test]
fn catastrophic_pattern_is_bounded_by_the_remaining_time() {
    let mut b = ProgramBuilder::new("redos");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::Bool);
    let is_match = b.member(MemberRef::method(
        TypeSig::named("System.Text.RegularExpressions", "Regex"),
        "IsMatch",
        true,
        vec![TypeSig::String, TypeSig::String],
        TypeSig::Bool,
    ));
    let input = format!("{}!", "a".repeat(40));
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::LdStr(input),
                Op::LdStr("^(a+)+$".into()),
                Op::Call(is_match),
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    let (rewritten, vm) = sandbox(&b.encode());

    let _scope = rewritten.token.open_scope(limits(100, 1_000));
    let started = Instant::now();
    let err = vm.run(Vec::new()).expect_err("must time out");
    assert!(matches!(err, ExecError::Guard(GuardError::TimeLimit { .. })), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn scope_is_reusable_after_a_failure() {
    let (rewritten, vm) = sandbox(&counting_loop("reuse"));
    {
        let _scope = rewritten.token.open_scope(limits(50, 1_000));
        let err = vm.run(vec![Value::I32(i32::MAX)]).expect_err("too slow");
        assert!(matches!(err, ExecError::Guard(GuardError::TimeLimit { .. })));
    }
    let _scope = rewritten.token.open_scope(limits(5_000, 1_000));
    assert_eq!(int_result(vm.run(vec![Value::I32(10)])), 45);
}

#[test]
fn rewritten_program_requires_an_open_scope() {
    let (_, vm) = sandbox(&counting_loop("no-scope"));
    assert!(matches!(
        vm.run(vec![Value::I32(3)]),
        Err(ExecError::Guard(GuardError::NoActiveScope))
    ));
}

#[test]
fn tracked_writers_are_disposed_when_the_scope_closes() {
    let mut b = ProgramBuilder::new("writer");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::Object);
    let writer = TypeSig::named("System.IO", "StringWriter");
    let ctor = b.member(MemberRef::method(writer.clone(), ".ctor", false, Vec::new(), TypeSig::Void));
    let write = b.member(MemberRef::method(writer, "Write", false, vec![TypeSig::String], TypeSig::Void));
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::Newobj(ctor),
                Op::Dup,
                Op::LdStr("logged".into()),
                Op::Callvirt(write),
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    let (rewritten, vm) = sandbox(&b.encode());

    let scope = rewritten.token.open_scope(ResourceLimits::default());
    let Ok(Some(Value::Host(object))) = vm.run(Vec::new()) else {
        panic!("expected the writer back");
    };
    let HostObject::StringWriter(state) = object.as_ref() else {
        panic!("expected a StringWriter");
    };
    assert!(!state.is_disposed());
    drop(scope);
    assert!(state.is_disposed());
    assert_eq!(state.text(), "logged");
}

#[test]
fn finally_runs_before_the_outer_catch() {
    // try { try { r = 1; throw null; } finally { r *= 10; } } catch { r += 5; } return r;
    let mut body = BodyBuilder::new(vec![TypeSig::I32]);
    let (ts, fs, hs, end) = (body.label(), body.label(), body.label(), body.label());
    body.mark(ts).ops([Op::LdcI4(1), Op::Stloc(0), Op::LdNull, Op::Throw]);
    body.mark(fs).ops([Op::Ldloc(0), Op::LdcI4(10), Op::Mul, Op::Stloc(0), Op::Endfinally]);
    body.mark(hs).ops([Op::Pop, Op::Ldloc(0), Op::LdcI4(5), Op::Add, Op::Stloc(0)]);
    body.branch(Op::Leave, end);
    body.mark(end).ops([Op::Ldloc(0), Op::Ret]);
    body.handler(HandlerKind::Finally, ts, fs, fs, hs);
    body.handler(HandlerKind::Catch(None), ts, hs, hs, end);
    let source = single("finally", Vec::new(), TypeSig::I32, body.finish().expect("body"));

    let original = Vm::load(&source).expect("load original");
    assert_eq!(int_result(original.run(Vec::new())), 15);

    let (rewritten, vm) = sandbox(&source);
    let _scope = rewritten.token.open_scope(ResourceLimits::default());
    assert_eq!(int_result(vm.run(Vec::new())), 15);
}

fn custom_exception_program(name: &str, catch_it: bool) -> Vec<u8> {
    let mut b = ProgramBuilder::new(name);
    let error = b.add_type("Demo", "BoomError", TypeKind::Class);
    b.type_mut(error).base = Some(TypeSig::named("System", "Exception"));
    let base_ctor = b.member(MemberRef::method(
        TypeSig::named("System", "Exception"),
        ".ctor",
        false,
        vec![TypeSig::String],
        TypeSig::Void,
    ));
    let message = b.member(MemberRef::method(
        TypeSig::named("System", "Exception"),
        "get_Message",
        false,
        Vec::new(),
        TypeSig::String,
    ));
    let ctor = b.declare_method(error, ".ctor", false, vec![TypeSig::String], TypeSig::Void);
    b.set_body(
        ctor,
        MethodBody::new(
            Vec::new(),
            vec![Op::Ldarg(0), Op::Ldarg(1), Op::Call(base_ctor), Op::Ret],
        ),
    );

    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::String);
    let mut body = BodyBuilder::new(vec![TypeSig::String]);
    let (ts, hs, end) = (body.label(), body.label(), body.label());
    body.mark(ts).ops([
        Op::LdStr("boom".into()),
        Op::Newobj(bastion_il::MethodTarget::Def(ctor)),
        Op::Throw,
    ]);
    body.mark(hs).ops([Op::Callvirt(message), Op::Stloc(0)]);
    body.branch(Op::Leave, end);
    body.mark(end).ops([Op::Ldloc(0), Op::Ret]);
    if catch_it {
        body.handler(HandlerKind::Catch(Some(TypeSig::Def(error))), ts, hs, hs, end);
    }
    b.set_body(main, body.finish().expect("body"));
    b.set_entry(main);
    b.encode()
}

#[test]
fn program_exceptions_match_by_type_and_carry_messages() {
    let (rewritten, vm) = sandbox(&custom_exception_program("caught", true));
    let _scope = rewritten.token.open_scope(ResourceLimits::default());
    let result = vm.run(Vec::new()).expect("caught");
    assert!(matches!(result, Some(Value::Str(s)) if &*s == "boom"));

    let (rewritten, vm) = sandbox(&custom_exception_program("escaped", false));
    let _scope = rewritten.token.open_scope(ResourceLimits::default());
    assert!(matches!(
        vm.run(Vec::new()),
        Err(ExecError::Thrown { type_name, message })
            if type_name == "Demo.BoomError" && message == "boom"
    ));
}

#[test]
fn delegates_call_back_into_the_program() {
    let mut b = ProgramBuilder::new("delegates");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let double = b.declare_method(ty, "Double", true, vec![TypeSig::I32], TypeSig::I32);
    b.set_body(
        double,
        MethodBody::new(Vec::new(), vec![Op::Ldarg(0), Op::LdcI4(2), Op::Mul, Op::Ret]),
    );
    let func = TypeSig::Inst(
        Box::new(TypeSig::Named(TypeRef::delegate("System", "Func`2"))),
        vec![TypeSig::I32, TypeSig::I32],
    );
    let ctor = b.member(MemberRef::method(
        func.clone(),
        ".ctor",
        false,
        vec![TypeSig::Object, TypeSig::IntPtr],
        TypeSig::Void,
    ));
    let invoke = b.member(MemberRef::method(
        func,
        "Invoke",
        false,
        vec![TypeSig::GenericParam(0)],
        TypeSig::GenericParam(1),
    ));
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::I32);
    b.set_body(
        main,
        MethodBody::new(
            Vec::new(),
            vec![
                Op::LdNull,
                Op::Ldftn(bastion_il::MethodTarget::Def(double)),
                Op::Newobj(ctor),
                Op::LdcI4(21),
                Op::Callvirt(invoke),
                Op::Ret,
            ],
        ),
    );
    b.set_entry(main);
    let (rewritten, vm) = sandbox(&b.encode());
    let _scope = rewritten.token.open_scope(ResourceLimits::default());
    assert_eq!(int_result(vm.run(Vec::new())), 42);
}

#[test]
fn members_without_host_implementation_fail_to_load() {
    let mut b = ProgramBuilder::new("unbound");
    let ty = b.add_type("Demo", "Program", TypeKind::Class);
    let main = b.declare_method(ty, "Main", true, Vec::new(), TypeSig::Void);
    let write = b.member(MemberRef::method(
        TypeSig::named("System", "Console"),
        "WriteLine",
        true,
        vec![TypeSig::String],
        TypeSig::Void,
    ));
    b.set_body(
        main,
        MethodBody::new(Vec::new(), vec![Op::LdStr("hi".into()), Op::Call(write), Op::Ret]),
    );
    b.set_entry(main);
    assert!(matches!(
        Vm::load(&b.encode()),
        Err(LoadError::UnknownHostMember(sig)) if sig.contains("System.Console::WriteLine")
    ));
}
