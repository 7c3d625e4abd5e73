//! Control flow: loops, finally ordering, and chained comparisons.

mod common;

use basilisk::{BinOp, CmpOp, CollectStringPrint, ExcKind, HandlerKind, NoLimitTracker, Object, Opcode, ParamSpec};
use common::{ModuleAssembler, run_ok};
use pretty_assertions::assert_eq;

/// A for-loop over `range(5)` accumulates through the iterator protocol.
#[test]
fn for_loop_over_range() {
    let mut asm = ModuleAssembler::new("test.py");
    let total_name = asm.program.intern("total");
    let i_name = asm.program.intern("i");
    let mut code = asm.module_code();
    let total = code.add_global(total_name);
    let i = code.add_global(i_name);
    let range_builtin = code.const_builtin("range").unwrap();
    let zero = code.const_int(0);
    let five = code.const_int(5);

    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::StoreGlobal, total);
    code.emit_arg(Opcode::LoadConst, range_builtin);
    code.emit_arg(Opcode::LoadConst, five);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::GetIter);
    let loop_top = code.here();
    let loop_end = code.new_label();
    code.emit_jump(Opcode::ForIter, loop_end);
    code.emit_arg(Opcode::StoreGlobal, i);
    code.emit_arg(Opcode::LoadGlobal, total);
    code.emit_arg(Opcode::LoadGlobal, i);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, total);
    let back = code.new_label();
    code.bind(back);
    // Jump targets are absolute instruction indices; loop back to ForIter.
    code.emit_arg(Opcode::Jump, loop_top);
    code.bind(loop_end);
    code.emit_arg(Opcode::LoadGlobal, total);
    code.emit(Opcode::Return);

    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Int(10));
}

/// Nested finally blocks run innermost-first while an exception unwinds.
#[test]
fn finally_blocks_run_innermost_first() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let print_builtin = code.const_builtin("print").unwrap();
    let value_error = code.const_builtin("ValueError").unwrap();
    let inner_name = asm.program.intern("inner");
    let outer_name = asm.program.intern("outer");
    let boom = asm.program.intern("boom");
    let inner_const = code.const_str(inner_name);
    let outer_const = code.const_str(outer_name);
    let boom_const = code.const_str(boom);

    // try: try: raise ValueError("boom") finally: print("inner")
    // finally: print("outer")
    code.set_line(2);
    let body_start = code.here();
    code.emit_arg(Opcode::LoadConst, value_error);
    code.emit_arg(Opcode::LoadConst, boom_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::Raise, 1);
    let body_end = code.here();

    let inner_finally = code.new_label();
    code.bind(inner_finally);
    code.set_line(4);
    code.emit_arg(Opcode::LoadConst, print_builtin);
    code.emit_arg(Opcode::LoadConst, inner_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    code.emit(Opcode::Reraise);
    let inner_handler_end = code.here();

    let outer_finally = code.new_label();
    code.bind(outer_finally);
    code.set_line(6);
    code.emit_arg(Opcode::LoadConst, print_builtin);
    code.emit_arg(Opcode::LoadConst, outer_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    code.emit(Opcode::Reraise);

    // Innermost-first table order; the outer range also covers the inner
    // handler so its re-raise lands in the outer finally.
    code.add_handler(body_start, body_end, inner_finally, 0, HandlerKind::Finally);
    code.add_handler(body_start, inner_handler_end, outer_finally, 0, HandlerKind::Finally);

    let runner = asm.runner(code.build().unwrap());
    let mut sink = CollectStringPrint::new();
    let error = runner
        .run(vec![], NoLimitTracker, &mut sink)
        .expect_err("exception should surface after the finally chain");
    assert_eq!(error.kind, ExcKind::ValueError);
    assert_eq!(sink.output(), "inner\nouter\n");
}

/// `a < b() < c` evaluates `b()` exactly once.
#[test]
fn chained_comparison_evaluates_middle_once() {
    let mut asm = ModuleAssembler::new("test.py");
    let count_name = asm.program.intern("count");
    let b_name = asm.program.intern("b");

    let mut module = asm.module_code();
    let count_slot = module.add_global(count_name);
    let b_slot = module.add_global(b_name);

    // def b(): count = count + 1; return 10
    let mut b = asm.function_code("b");
    b.set_line(2);
    let one = b.const_int(1);
    let ten = b.const_int(10);
    b.emit_arg(Opcode::LoadGlobal, count_slot);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::Binary, BinOp::Add.into());
    b.emit_arg(Opcode::StoreGlobal, count_slot);
    b.emit_arg(Opcode::LoadConst, ten);
    b.emit(Opcode::Return);
    let b_id = asm.add_function("b", b.build().unwrap(), ParamSpec::default());

    let zero = module.const_int(0);
    let five = module.const_int(5);
    let twenty = module.const_int(20);

    module.set_line(1);
    module.emit_arg(Opcode::LoadConst, zero);
    module.emit_arg(Opcode::StoreGlobal, count_slot);
    module.emit_arg(Opcode::MakeFunction, b_id.raw());
    module.emit_arg(Opcode::StoreGlobal, b_slot);

    // 5 < b() < 20, compiled with the peek-and-branch short-circuit.
    module.set_line(3);
    module.emit_arg(Opcode::LoadConst, five);
    module.emit_arg(Opcode::LoadGlobal, b_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Dup);
    module.emit(Opcode::Rot3);
    module.emit_arg(Opcode::Compare, CmpOp::Lt.into());
    let short_circuit = module.new_label();
    let done = module.new_label();
    module.emit_jump(Opcode::JumpIfFalseOrPop, short_circuit);
    module.emit_arg(Opcode::LoadConst, twenty);
    module.emit_arg(Opcode::Compare, CmpOp::Lt.into());
    module.emit_jump(Opcode::Jump, done);
    module.bind(short_circuit);
    // The abandoned middle operand sits under the chain result.
    module.emit(Opcode::Rot2);
    module.emit(Opcode::Pop);
    module.bind(done);
    module.emit_arg(Opcode::LoadGlobal, count_slot);
    module.emit_arg(Opcode::BuildTuple, 2);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    assert_eq!(
        run_ok(&runner, vec![]),
        Object::Tuple(vec![Object::Bool(true), Object::Int(1)])
    );
}

/// Short-circuiting `and` keeps the deciding value.
#[test]
fn boolean_short_circuit_keeps_operand() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let zero = code.const_int(0);
    let seven = code.const_int(7);

    // 0 and 7 -> 0
    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, zero);
    let end = code.new_label();
    code.emit_jump(Opcode::JumpIfFalseOrPop, end);
    code.emit_arg(Opcode::LoadConst, seven);
    code.bind(end);
    code.emit(Opcode::Return);

    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Int(0));
}

/// `while` loops drive `JumpIfFalse` over comparison results.
#[test]
fn while_loop_counts_down() {
    let mut asm = ModuleAssembler::new("test.py");
    let n_name = asm.program.intern("n");
    let steps_name = asm.program.intern("steps");
    let mut code = asm.module_code();
    let n = code.add_global(n_name);
    let steps = code.add_global(steps_name);
    let five = code.const_int(5);
    let zero = code.const_int(0);
    let one = code.const_int(1);

    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, five);
    code.emit_arg(Opcode::StoreGlobal, n);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::StoreGlobal, steps);
    let loop_top = code.here();
    let loop_end = code.new_label();
    code.emit_arg(Opcode::LoadGlobal, n);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::Compare, CmpOp::Gt.into());
    code.emit_jump(Opcode::JumpIfFalse, loop_end);
    code.emit_arg(Opcode::LoadGlobal, n);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Binary, BinOp::Sub.into());
    code.emit_arg(Opcode::StoreGlobal, n);
    code.emit_arg(Opcode::LoadGlobal, steps);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit_arg(Opcode::StoreGlobal, steps);
    code.emit_arg(Opcode::Jump, loop_top);
    code.bind(loop_end);
    code.emit_arg(Opcode::LoadGlobal, steps);
    code.emit(Opcode::Return);

    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Int(5));
}
