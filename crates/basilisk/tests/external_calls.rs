//! The external-call bridge: suspension, result injection, exception
//! injection, and deferred futures.

mod common;

use basilisk::{
    CollectStringPrint, ExcKind, Exception, HandlerKind, NoLimitTracker, Object, Opcode, RunProgress,
};
use common::ModuleAssembler;
use pretty_assertions::assert_eq;

fn call_double_runner(wrap_await: bool) -> basilisk::Runner {
    let mut asm = ModuleAssembler::new("test.py");
    let double_name = asm.program.intern("double");
    let mut code = asm.module_code();
    let double_slot = code.add_global(double_name);
    let arg = code.const_int(21);
    code.set_line(1);
    code.emit_arg(Opcode::LoadGlobal, double_slot);
    code.emit_arg(Opcode::LoadConst, arg);
    code.emit_arg(Opcode::Call, 1);
    if wrap_await {
        code.emit(Opcode::Await);
    }
    code.emit(Opcode::Return);
    asm.runner_with(code.build().unwrap(), &[], &["double"])
}

/// A declared external call suspends with its arguments and resumes with
/// the host-provided result.
#[test]
fn suspend_and_resume_with_value() {
    let runner = call_double_runner(false);
    let mut sink = CollectStringPrint::new();
    let progress = runner.start(vec![], NoLimitTracker, &mut sink).unwrap();

    let RunProgress::FunctionCall {
        function_name,
        args,
        kwargs,
        state,
        ..
    } = progress
    else {
        panic!("expected an external-call suspension");
    };
    assert_eq!(function_name, "double");
    assert_eq!(args, vec![Object::Int(21)]);
    assert!(kwargs.is_empty());

    let progress = state.run(Object::Int(42), &mut sink).unwrap();
    let RunProgress::Complete(result) = progress else {
        panic!("expected completion");
    };
    assert_eq!(result, Object::Int(42));
}

/// A host-injected exception unwinds through guest handlers like a local
/// raise.
#[test]
fn injected_exception_is_catchable() {
    let mut asm = ModuleAssembler::new("test.py");
    let fetch_name = asm.program.intern("fetch");
    let mut code = asm.module_code();
    let fetch_slot = code.add_global(fetch_name);
    let fallback = asm.program.intern("fallback");
    let fallback_const = code.const_str(fallback);
    let value_error = code.const_builtin("ValueError").unwrap();

    code.set_line(2);
    let try_start = code.here();
    code.emit_arg(Opcode::LoadGlobal, fetch_slot);
    code.emit_arg(Opcode::Call, 0);
    code.emit(Opcode::Return);
    let try_end = code.here();

    let handler = code.new_label();
    let no_match = code.new_label();
    code.bind(handler);
    code.set_line(4);
    code.emit_arg(Opcode::LoadConst, value_error);
    code.emit(Opcode::CheckExcMatch);
    code.emit_jump(Opcode::JumpIfFalse, no_match);
    code.emit(Opcode::Pop);
    code.emit(Opcode::ClearExc);
    code.emit_arg(Opcode::LoadConst, fallback_const);
    code.emit(Opcode::Return);
    code.bind(no_match);
    code.emit(Opcode::Reraise);

    code.add_handler(try_start, try_end, handler, 0, HandlerKind::Except);
    let runner = asm.runner_with(code.build().unwrap(), &[], &["fetch"]);

    let mut sink = CollectStringPrint::new();
    let progress = runner.start(vec![], NoLimitTracker, &mut sink).unwrap();
    let RunProgress::FunctionCall { state, .. } = progress else {
        panic!("expected an external-call suspension");
    };
    let progress = state
        .raise(
            Exception::new(ExcKind::ValueError, Some("host failed".to_owned())),
            &mut sink,
        )
        .unwrap();
    let RunProgress::Complete(result) = progress else {
        panic!("expected completion through the handler");
    };
    assert_eq!(result, Object::string("fallback"));
}

/// Deferring a call produces a future; awaiting it blocks until the host
/// resolves the pending id.
#[test]
fn deferred_future_resolves_on_resume() {
    let runner = call_double_runner(true);
    let mut sink = CollectStringPrint::new();
    let progress = runner.start(vec![], NoLimitTracker, &mut sink).unwrap();

    let RunProgress::FunctionCall { call_id, state, .. } = progress else {
        panic!("expected an external-call suspension");
    };
    let progress = state.run_pending(&mut sink).unwrap();
    let RunProgress::ResolveFutures { pending, state } = progress else {
        panic!("expected a blocked await");
    };
    assert_eq!(pending, vec![call_id]);

    let progress = state.resume(vec![(call_id, Ok(Object::Int(42)))], &mut sink).unwrap();
    let RunProgress::Complete(result) = progress else {
        panic!("expected completion");
    };
    assert_eq!(result, Object::Int(42));
}

/// An error resolved into a deferred future raises at the await site.
#[test]
fn deferred_future_error_raises_at_await() {
    let runner = call_double_runner(true);
    let mut sink = CollectStringPrint::new();
    let progress = runner.start(vec![], NoLimitTracker, &mut sink).unwrap();
    let RunProgress::FunctionCall { call_id, state, .. } = progress else {
        panic!("expected an external-call suspension");
    };
    let progress = state.run_pending(&mut sink).unwrap();
    let RunProgress::ResolveFutures { state, .. } = progress else {
        panic!("expected a blocked await");
    };
    let error = state
        .resume(
            vec![(call_id, Err(Exception::new(ExcKind::ValueError, Some("boom".to_owned()))))],
            &mut sink,
        )
        .unwrap_err();
    assert_eq!(error.kind, ExcKind::ValueError);
    assert_eq!(error.message.as_deref(), Some("boom"));
}
