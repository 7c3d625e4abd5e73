//! Async execution: await chains, deterministic gather ordering, per-task
//! exception handling, and the sandbox's sleep policy.

mod common;

use basilisk::{
    CollectStringPrint, ExcKind, HandlerKind, NoLimitTracker, Object, Opcode, ParamSpec, RunProgress,
};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// Scenario: `await raises_error()` surfaces the failure with the async
/// call chain in the traceback.
#[test]
fn await_preserves_the_async_call_chain() {
    let mut asm = ModuleAssembler::new("test.py");
    let raises_name = asm.program.intern("raises_error");

    let mut body = asm.function_code("raises_error");
    body.set_line(2);
    let value_error = body.const_builtin("ValueError").unwrap();
    let message = asm.program.intern("async error");
    let message_const = body.const_str(message);
    let none = body.const_none();
    body.emit_arg(Opcode::LoadConst, value_error);
    body.emit_arg(Opcode::LoadConst, message_const);
    body.emit_arg(Opcode::Call, 1);
    body.emit_arg(Opcode::Raise, 1);
    body.emit_arg(Opcode::LoadConst, none);
    body.emit(Opcode::Return);
    let raises_id = asm.add_async("raises_error", body.build().unwrap(), ParamSpec::default());

    let mut module = asm.module_code();
    let raises_slot = module.add_global(raises_name);
    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, raises_id.raw());
    module.emit_arg(Opcode::StoreGlobal, raises_slot);
    module.set_line(4);
    module.emit_arg(Opcode::LoadGlobal, raises_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Await);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::ValueError);
    assert_eq!(error.message.as_deref(), Some("async error"));
    let functions: Vec<&str> = error.frames.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(functions, vec!["raises_error", "<module>"]);
}

/// An async function body that computes (or locally catches) delivers its
/// return value to the awaiter.
fn child_returning(asm: &mut ModuleAssembler, name: &str, value: i64, fail_and_catch: bool) -> basilisk::FunctionId {
    let mut body = asm.function_code(name);
    body.set_line(1);
    if fail_and_catch {
        // try: raise ValueError("x") except ValueError: return value
        let value_error = body.const_builtin("ValueError").unwrap();
        let result = body.const_int(value);
        let try_start = body.here();
        body.emit_arg(Opcode::LoadConst, value_error);
        body.emit_arg(Opcode::Raise, 1);
        let try_end = body.here();
        let handler = body.new_label();
        let no_match = body.new_label();
        body.bind(handler);
        let value_error_again = body.const_builtin("ValueError").unwrap();
        body.emit_arg(Opcode::LoadConst, value_error_again);
        body.emit(Opcode::CheckExcMatch);
        body.emit_jump(Opcode::JumpIfFalse, no_match);
        body.emit(Opcode::Pop);
        body.emit(Opcode::ClearExc);
        body.emit_arg(Opcode::LoadConst, result);
        body.emit(Opcode::Return);
        body.bind(no_match);
        body.emit(Opcode::Reraise);
        body.add_handler(try_start, try_end, handler, 0, HandlerKind::Except);
    } else {
        let result = body.const_int(value);
        body.emit_arg(Opcode::LoadConst, result);
        body.emit(Opcode::Return);
    }
    asm.add_async(name, body.build().unwrap(), ParamSpec::default())
}

/// Four gather children, two failing and catching locally: results arrive
/// in declaration order.
#[test]
fn gather_collects_in_declaration_order() {
    let mut asm = ModuleAssembler::new("test.py");
    let names: Vec<_> = (0..4).map(|i| asm.program.intern(&format!("c{i}"))).collect();
    let ids = [
        child_returning(&mut asm, "c0", 0, false),
        child_returning(&mut asm, "c1", 101, true),
        child_returning(&mut asm, "c2", 2, false),
        child_returning(&mut asm, "c3", 103, true),
    ];

    let mut module = asm.module_code();
    let slots: Vec<_> = names.iter().map(|&n| module.add_global(n)).collect();
    let gather_builtin = module.const_builtin("gather").unwrap();

    module.set_line(1);
    for (id, &slot) in ids.iter().zip(&slots) {
        module.emit_arg(Opcode::MakeFunction, id.raw());
        module.emit_arg(Opcode::StoreGlobal, slot);
    }
    module.set_line(6);
    module.emit_arg(Opcode::LoadConst, gather_builtin);
    for &slot in &slots {
        module.emit_arg(Opcode::LoadGlobal, slot);
        module.emit_arg(Opcode::Call, 0);
    }
    module.emit_arg(Opcode::Call, 4);
    module.emit(Opcode::Await);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    assert_eq!(
        run_ok(&runner, vec![]),
        Object::List(vec![
            Object::Int(0),
            Object::Int(101),
            Object::Int(2),
            Object::Int(103),
        ])
    );
}

/// Two children blocked on external calls accept results out of order, yet
/// the gather result keeps declaration order.
#[test]
fn gather_accepts_out_of_order_resolution() {
    let mut asm = ModuleAssembler::new("test.py");
    let ext_a_name = asm.program.intern("ext_a");
    let ext_b_name = asm.program.intern("ext_b");
    let a_name = asm.program.intern("a");
    let b_name = asm.program.intern("b");

    let mut module = asm.module_code();
    let ext_a_slot = module.add_global(ext_a_name);
    let ext_b_slot = module.add_global(ext_b_name);
    let a_slot = module.add_global(a_name);
    let b_slot = module.add_global(b_name);

    let make_child = |asm: &mut ModuleAssembler, name: &str, ext_slot: u32| {
        let mut body = asm.function_code(name);
        body.set_line(1);
        body.emit_arg(Opcode::LoadGlobal, ext_slot);
        body.emit_arg(Opcode::Call, 0);
        body.emit(Opcode::Await);
        body.emit(Opcode::Return);
        asm.add_async(name, body.build().unwrap(), ParamSpec::default())
    };
    let a_id = make_child(&mut asm, "a", ext_a_slot);
    let b_id = make_child(&mut asm, "b", ext_b_slot);

    let gather_builtin = module.const_builtin("gather").unwrap();
    module.set_line(3);
    module.emit_arg(Opcode::MakeFunction, a_id.raw());
    module.emit_arg(Opcode::StoreGlobal, a_slot);
    module.emit_arg(Opcode::MakeFunction, b_id.raw());
    module.emit_arg(Opcode::StoreGlobal, b_slot);
    module.emit_arg(Opcode::LoadConst, gather_builtin);
    module.emit_arg(Opcode::LoadGlobal, a_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::LoadGlobal, b_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 2);
    module.emit(Opcode::Await);
    module.emit(Opcode::Return);

    let runner = asm.runner_with(module.build().unwrap(), &[], &["ext_a", "ext_b"]);
    let mut sink = CollectStringPrint::new();

    // Child a suspends on ext_a; defer it.
    let progress = runner.start(vec![], NoLimitTracker, &mut sink).unwrap();
    let RunProgress::FunctionCall { function_name, call_id: id_a, state, .. } = progress else {
        panic!("expected ext_a suspension");
    };
    assert_eq!(function_name, "ext_a");
    // Child b then suspends on ext_b; defer it too.
    let progress = state.run_pending(&mut sink).unwrap();
    let RunProgress::FunctionCall { function_name, call_id: id_b, state, .. } = progress else {
        panic!("expected ext_b suspension");
    };
    assert_eq!(function_name, "ext_b");
    let progress = state.run_pending(&mut sink).unwrap();
    let RunProgress::ResolveFutures { pending, state } = progress else {
        panic!("expected both children blocked");
    };
    assert_eq!(pending, vec![id_a, id_b]);

    // Resolve b first, then a: declaration order still wins in the result.
    let progress = state
        .resume(
            vec![(id_b, Ok(Object::Int(2))), (id_a, Ok(Object::Int(1)))],
            &mut sink,
        )
        .unwrap();
    let RunProgress::Complete(result) = progress else {
        panic!("expected completion");
    };
    assert_eq!(result, Object::List(vec![Object::Int(1), Object::Int(2)]));
}

/// Cooperative zero-delay sleep is legal; wall-clock sleep is refused.
#[test]
fn sleep_policy_distinguishes_cooperative_and_blocking() {
    // await async_sleep(0) -> None
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let async_sleep = code.const_builtin("async_sleep").unwrap();
    let zero = code.const_int(0);
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, async_sleep);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::Await);
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::None);

    // sleep(1) -> refused by the default host policy
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let sleep = code.const_builtin("sleep").unwrap();
    let one = code.const_int(1);
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, sleep);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::RuntimeError);
    assert_eq!(error.message.as_deref(), Some("sleep is not allowed in the sandbox"));
}
