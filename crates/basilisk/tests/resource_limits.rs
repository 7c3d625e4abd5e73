//! The resource accountant: recursion, memory, wall-clock, and the
//! analytic pre-checks.

mod common;

use basilisk::{
    BinOp, CollectStringPrint, ExcKind, HandlerKind, LimitedTracker, Object, Opcode, ParamSpec, ResourceLimits,
};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// Unbounded recursion trips the default ceiling with a catchable error.
#[test]
fn recursion_error_is_catchable() {
    let mut asm = ModuleAssembler::new("test.py");
    let f_name = asm.program.intern("f");

    let mut module = asm.module_code();
    let f_slot = module.add_global(f_name);

    // def f(): return f()
    let mut f = asm.function_code("f");
    f.set_line(1);
    f.emit_arg(Opcode::LoadGlobal, f_slot);
    f.emit_arg(Opcode::Call, 0);
    f.emit(Opcode::Return);
    let f_id = asm.add_function("f", f.build().unwrap(), ParamSpec::default());

    let recursion_error = module.const_builtin("RecursionError").unwrap();
    let caught = asm.program.intern("caught");
    let caught_const = module.const_str(caught);

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, f_id.raw());
    module.emit_arg(Opcode::StoreGlobal, f_slot);
    module.set_line(2);
    let try_start = module.here();
    module.emit_arg(Opcode::LoadGlobal, f_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Return);
    let try_end = module.here();

    let handler = module.new_label();
    let no_match = module.new_label();
    module.bind(handler);
    module.emit_arg(Opcode::LoadConst, recursion_error);
    module.emit(Opcode::CheckExcMatch);
    module.emit_jump(Opcode::JumpIfFalse, no_match);
    module.emit(Opcode::Pop);
    module.emit(Opcode::ClearExc);
    module.emit_arg(Opcode::LoadConst, caught_const);
    module.emit(Opcode::Return);
    module.bind(no_match);
    module.emit(Opcode::Reraise);

    module.add_handler(try_start, try_end, handler, 0, HandlerKind::Except);
    let runner = asm.runner(module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("caught"));
}

/// A configured recursion ceiling overrides the default.
#[test]
fn configured_recursion_ceiling_applies() {
    let mut asm = ModuleAssembler::new("test.py");
    let f_name = asm.program.intern("f");
    let mut module = asm.module_code();
    let f_slot = module.add_global(f_name);

    let mut f = asm.function_code("f");
    f.emit_arg(Opcode::LoadGlobal, f_slot);
    f.emit_arg(Opcode::Call, 0);
    f.emit(Opcode::Return);
    let f_id = asm.add_function("f", f.build().unwrap(), ParamSpec::default());

    module.emit_arg(Opcode::MakeFunction, f_id.raw());
    module.emit_arg(Opcode::StoreGlobal, f_slot);
    module.emit_arg(Opcode::LoadGlobal, f_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_recursion_depth: Some(16),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::RecursionError);
}

/// Growing the heap past the ceiling raises the memory kind.
#[test]
fn memory_ceiling_stops_allocation() {
    let mut asm = ModuleAssembler::new("test.py");
    let acc_name = asm.program.intern("acc");
    let mut code = asm.module_code();
    let acc_slot = code.add_global(acc_name);
    let x = asm.program.intern("xxxxxxxxxxxxxxxx");
    let x_const = code.const_str(x);

    // acc = "x" * 16; while True: acc = acc + acc
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, x_const);
    code.emit_arg(Opcode::StoreGlobal, acc_slot);
    let loop_top = code.here();
    code.emit_arg(Opcode::LoadGlobal, acc_slot);
    code.emit_arg(Opcode::LoadGlobal, acc_slot);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, acc_slot);
    code.emit_arg(Opcode::Jump, loop_top);

    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_memory_bytes: Some(64 * 1024),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::MemoryError);
}

/// `2 ** 10_000_000` is rejected before any digit is computed.
#[test]
fn pow_precheck_fires_before_the_work() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let two = code.const_int(2);
    let exp = code.const_int(10_000_000);
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, two);
    code.emit_arg(Opcode::LoadConst, exp);
    code.emit_arg(Opcode::Binary, BinOp::Pow.into());
    code.emit(Opcode::Return);

    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_memory_bytes: Some(256 * 1024),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::MemoryError);
}

/// Left shifts with huge counts are pre-checked the same way.
#[test]
fn shift_precheck_fires_before_the_work() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let one = code.const_int(1);
    let count = code.const_int(80_000_000);
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::LoadConst, count);
    code.emit_arg(Opcode::Binary, BinOp::LShift.into());
    code.emit(Opcode::Return);

    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_memory_bytes: Some(256 * 1024),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::MemoryError);
}

/// A busy loop trips the wall-clock ceiling with the timeout kind.
#[test]
fn wall_clock_ceiling_raises_timeout() {
    let mut asm = ModuleAssembler::new("test.py");
    let n_name = asm.program.intern("n");
    let mut code = asm.module_code();
    let n_slot = code.add_global(n_name);
    let zero = code.const_int(0);
    let one = code.const_int(1);

    // n = 0; while True: n = n + 1
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::StoreGlobal, n_slot);
    let loop_top = code.here();
    code.emit_arg(Opcode::LoadGlobal, n_slot);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, n_slot);
    code.emit_arg(Opcode::Jump, loop_top);

    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_duration_seconds: Some(0.05),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::TimeoutError);
}

/// A memory breach cannot be swallowed by a bare `except`.
#[test]
fn memory_breach_is_uncatchable() {
    let mut asm = ModuleAssembler::new("test.py");
    let acc_name = asm.program.intern("acc");
    let mut code = asm.module_code();
    let acc_slot = code.add_global(acc_name);
    let x = asm.program.intern("xxxxxxxxxxxxxxxx");
    let x_const = code.const_str(x);
    let survived = asm.program.intern("survived");
    let survived_const = code.const_str(survived);

    code.set_line(1);
    let try_start = code.here();
    code.emit_arg(Opcode::LoadConst, x_const);
    code.emit_arg(Opcode::StoreGlobal, acc_slot);
    let loop_top = code.here();
    code.emit_arg(Opcode::LoadGlobal, acc_slot);
    code.emit_arg(Opcode::LoadGlobal, acc_slot);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, acc_slot);
    code.emit_arg(Opcode::Jump, loop_top);
    let try_end = code.here();

    let handler = code.new_label();
    code.bind(handler);
    code.emit(Opcode::Pop);
    code.emit(Opcode::ClearExc);
    code.emit_arg(Opcode::LoadConst, survived_const);
    code.emit(Opcode::Return);

    code.add_handler(try_start, try_end, handler, 0, HandlerKind::Except);
    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_memory_bytes: Some(64 * 1024),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::MemoryError);
}

/// A wall-clock breach still runs `finally` bodies on the way out, then
/// surfaces unchanged.
#[test]
fn finally_runs_when_the_clock_breaches() {
    let mut asm = ModuleAssembler::new("test.py");
    let n_name = asm.program.intern("n");
    let mut code = asm.module_code();
    let n_slot = code.add_global(n_name);
    let print_builtin = code.const_builtin("print").unwrap();
    let cleanup = asm.program.intern("cleanup");
    let cleanup_const = code.const_str(cleanup);
    let zero = code.const_int(0);
    let one = code.const_int(1);

    // try: n = 0; while True: n = n + 1
    // finally: print("cleanup")
    code.set_line(1);
    let try_start = code.here();
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::StoreGlobal, n_slot);
    let loop_top = code.here();
    code.emit_arg(Opcode::LoadGlobal, n_slot);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, n_slot);
    code.emit_arg(Opcode::Jump, loop_top);
    let try_end = code.here();

    let finally = code.new_label();
    code.bind(finally);
    code.set_line(4);
    code.emit_arg(Opcode::LoadConst, print_builtin);
    code.emit_arg(Opcode::LoadConst, cleanup_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    code.emit(Opcode::Reraise);

    code.add_handler(try_start, try_end, finally, 0, HandlerKind::Finally);
    let runner = asm.runner(code.build().unwrap());
    let tracker = LimitedTracker::new(ResourceLimits {
        max_duration_seconds: Some(0.05),
        ..ResourceLimits::default()
    });
    let mut sink = CollectStringPrint::new();
    let error = runner.run(vec![], tracker, &mut sink).unwrap_err();
    assert_eq!(error.kind, ExcKind::TimeoutError);
    assert_eq!(sink.output(), "cleanup\n");
}

/// Unknown fields in a limits record are rejected, not ignored.
#[test]
fn limits_reject_unknown_fields() {
    let parsed: Result<ResourceLimits, _> = serde_json::from_str(r#"{"max_disk_bytes": 1}"#);
    assert!(parsed.is_err());
}
