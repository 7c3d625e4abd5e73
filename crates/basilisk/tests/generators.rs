//! Generator semantics: for-loops, `list(...)`, manual `next`, PEP 479,
//! and `yield from` delegation.

mod common;

use basilisk::{BinOp, ExcKind, HandlerKind, Object, Opcode, ParamSpec};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// Builds `def g(): yield 1; yield 2` and returns its id.
fn two_yield_generator(asm: &mut ModuleAssembler) -> basilisk::FunctionId {
    let mut g = asm.function_code("g");
    g.set_line(2);
    let one = g.const_int(1);
    let two = g.const_int(2);
    let none = g.const_none();
    g.emit_arg(Opcode::LoadConst, one);
    g.emit(Opcode::Yield);
    g.emit(Opcode::Pop);
    g.emit_arg(Opcode::LoadConst, two);
    g.emit(Opcode::Yield);
    g.emit(Opcode::Pop);
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::Return);
    asm.add_generator("g", g.build().unwrap(), ParamSpec::default())
}

/// Iterating with `for` observes the yielded sequence.
#[test]
fn for_loop_drives_a_generator() {
    let mut asm = ModuleAssembler::new("test.py");
    let g_name = asm.program.intern("g");
    let total_name = asm.program.intern("total");
    let g_id = two_yield_generator(&mut asm);

    let mut module = asm.module_code();
    let g_slot = module.add_global(g_name);
    let total_slot = module.add_global(total_name);
    let zero = module.const_int(0);

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, g_id.raw());
    module.emit_arg(Opcode::StoreGlobal, g_slot);
    module.emit_arg(Opcode::LoadConst, zero);
    module.emit_arg(Opcode::StoreGlobal, total_slot);
    module.set_line(4);
    module.emit_arg(Opcode::LoadGlobal, g_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::GetIter);
    let loop_top = module.here();
    let loop_end = module.new_label();
    module.emit_jump(Opcode::ForIter, loop_end);
    module.emit_arg(Opcode::LoadGlobal, total_slot);
    module.emit(Opcode::Rot2);
    module.emit_arg(Opcode::Binary, BinOp::Add.into());
    module.emit_arg(Opcode::StoreGlobal, total_slot);
    module.emit_arg(Opcode::Jump, loop_top);
    module.bind(loop_end);
    module.emit_arg(Opcode::LoadGlobal, total_slot);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Int(3));
}

/// `list(g())` materializes exactly the yielded sequence.
#[test]
fn list_materializes_a_generator() {
    let mut asm = ModuleAssembler::new("test.py");
    let g_name = asm.program.intern("g");
    let g_id = two_yield_generator(&mut asm);

    let mut module = asm.module_code();
    let g_slot = module.add_global(g_name);
    let list_builtin = module.const_builtin("list").unwrap();

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, g_id.raw());
    module.emit_arg(Opcode::StoreGlobal, g_slot);
    module.set_line(4);
    module.emit_arg(Opcode::LoadConst, list_builtin);
    module.emit_arg(Opcode::LoadGlobal, g_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    assert_eq!(
        run_ok(&runner, vec![]),
        Object::List(vec![Object::Int(1), Object::Int(2)])
    );
}

/// Manual `next` yields the same sequence, then raises the iteration kind.
#[test]
fn next_drives_and_exhausts() {
    let mut asm = ModuleAssembler::new("test.py");
    let g_name = asm.program.intern("g");
    let it_name = asm.program.intern("it");
    let g_id = two_yield_generator(&mut asm);

    let mut module = asm.module_code();
    let g_slot = module.add_global(g_name);
    let it_slot = module.add_global(it_name);
    let next_builtin = module.const_builtin("next").unwrap();
    let stop_iteration = module.const_builtin("StopIteration").unwrap();
    let exhausted = asm.program.intern("exhausted");
    let exhausted_const = module.const_str(exhausted);

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, g_id.raw());
    module.emit_arg(Opcode::StoreGlobal, g_slot);
    module.emit_arg(Opcode::LoadGlobal, g_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::StoreGlobal, it_slot);

    // next(it) twice, discarding the values; the third raises.
    module.set_line(5);
    for _ in 0..2 {
        module.emit_arg(Opcode::LoadConst, next_builtin);
        module.emit_arg(Opcode::LoadGlobal, it_slot);
        module.emit_arg(Opcode::Call, 1);
        module.emit(Opcode::Pop);
    }
    let try_start = module.here();
    module.emit_arg(Opcode::LoadConst, next_builtin);
    module.emit_arg(Opcode::LoadGlobal, it_slot);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Pop);
    let try_end = module.here();
    let none = module.const_none();
    module.emit_arg(Opcode::LoadConst, none);
    module.emit(Opcode::Return);

    let handler = module.new_label();
    let no_match = module.new_label();
    module.bind(handler);
    module.emit_arg(Opcode::LoadConst, stop_iteration);
    module.emit(Opcode::CheckExcMatch);
    module.emit_jump(Opcode::JumpIfFalse, no_match);
    module.emit(Opcode::Pop);
    module.emit(Opcode::ClearExc);
    module.emit_arg(Opcode::LoadConst, exhausted_const);
    module.emit(Opcode::Return);
    module.bind(no_match);
    module.emit(Opcode::Reraise);

    module.add_handler(try_start, try_end, handler, 0, HandlerKind::Except);
    let runner = asm.runner(module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("exhausted"));
}

/// PEP 479: a StopIteration escaping a generator body converts to the
/// runtime kind.
#[test]
fn stop_iteration_in_generator_becomes_runtime_error() {
    let mut asm = ModuleAssembler::new("test.py");
    let g_name = asm.program.intern("g");

    let mut g = asm.function_code("g");
    g.set_line(2);
    let stop_iteration = g.const_builtin("StopIteration").unwrap();
    let none = g.const_none();
    g.emit_arg(Opcode::LoadConst, stop_iteration);
    g.emit_arg(Opcode::Raise, 1);
    // Unreachable tail keeps the body well-formed.
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::Return);
    let g_id = asm.add_generator("g", g.build().unwrap(), ParamSpec::default());

    let mut module = asm.module_code();
    let g_slot = module.add_global(g_name);
    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, g_id.raw());
    module.emit_arg(Opcode::StoreGlobal, g_slot);
    module.set_line(3);
    module.emit_arg(Opcode::LoadGlobal, g_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::GetIter);
    let loop_top = module.here();
    let loop_end = module.new_label();
    module.emit_jump(Opcode::ForIter, loop_end);
    module.emit(Opcode::Pop);
    module.emit_arg(Opcode::Jump, loop_top);
    module.bind(loop_end);
    let none = module.const_none();
    module.emit_arg(Opcode::LoadConst, none);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::RuntimeError);
    assert_eq!(error.message.as_deref(), Some("generator raised StopIteration"));
}

/// `yield from` surfaces every element of the delegate, in order.
#[test]
fn yield_from_delegates() {
    let mut asm = ModuleAssembler::new("test.py");
    let inner_name = asm.program.intern("inner");
    let outer_name = asm.program.intern("outer");
    let inner_id = two_yield_generator(&mut asm);

    let mut module = asm.module_code();
    let inner_slot = module.add_global(inner_name);
    let outer_slot = module.add_global(outer_name);

    let mut outer = asm.function_code("outer");
    outer.set_line(5);
    let none = outer.const_none();
    outer.emit_arg(Opcode::LoadGlobal, inner_slot);
    outer.emit_arg(Opcode::Call, 0);
    outer.emit(Opcode::GetIter);
    outer.emit(Opcode::YieldFrom);
    outer.emit(Opcode::Pop);
    outer.emit_arg(Opcode::LoadConst, none);
    outer.emit(Opcode::Return);
    let outer_id = asm.add_generator("outer", outer.build().unwrap(), ParamSpec::default());

    let list_builtin = module.const_builtin("list").unwrap();
    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, inner_id.raw());
    module.emit_arg(Opcode::StoreGlobal, inner_slot);
    module.emit_arg(Opcode::MakeFunction, outer_id.raw());
    module.emit_arg(Opcode::StoreGlobal, outer_slot);
    module.set_line(7);
    module.emit_arg(Opcode::LoadConst, list_builtin);
    module.emit_arg(Opcode::LoadGlobal, outer_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    assert_eq!(
        run_ok(&runner, vec![]),
        Object::List(vec![Object::Int(1), Object::Int(2)])
    );
}
