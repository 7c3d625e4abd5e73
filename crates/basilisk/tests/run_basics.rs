//! End-to-end basics: expressions, inputs, reruns, and uncaught errors.

mod common;

use basilisk::{BinOp, ExcKind, Object, Opcode};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// `1 + 2 * 3` evaluates to `7`.
#[test]
fn arithmetic_precedence() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    code.set_line(1);
    let one = code.const_int(1);
    let two = code.const_int(2);
    let three = code.const_int(3);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::LoadConst, two);
    code.emit_arg(Opcode::LoadConst, three);
    code.emit_arg(Opcode::Binary, BinOp::Mul.into());
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Int(7));
}

/// `x + y` with inputs; the same parsed program reruns independently.
#[test]
fn inputs_and_rerun_independence() {
    let mut asm = ModuleAssembler::new("test.py");
    let x_name = asm.program.intern("x");
    let y_name = asm.program.intern("y");
    let mut code = asm.module_code();
    let x = code.add_global(x_name);
    let y = code.add_global(y_name);
    code.set_line(1);
    code.emit_arg(Opcode::LoadGlobal, x);
    code.emit_arg(Opcode::LoadGlobal, y);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit(Opcode::Return);
    let runner = asm.runner_with(code.build().unwrap(), &["x", "y"], &[]);

    assert_eq!(
        run_ok(&runner, vec![Object::Int(10), Object::Int(20)]),
        Object::Int(30)
    );
    assert_eq!(
        run_ok(&runner, vec![Object::Int(100), Object::Int(200)]),
        Object::Int(300)
    );
}

/// `1 / 0` surfaces the zero-division kind.
#[test]
fn division_by_zero_is_uncaught() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    code.set_line(1);
    let one = code.const_int(1);
    let zero = code.const_int(0);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::LoadConst, zero);
    code.emit_arg(Opcode::Binary, BinOp::Div.into());
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());

    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::ZeroDivisionError);
    assert_eq!(error.message.as_deref(), Some("division by zero"));
}

/// Integer overflow promotes silently to arbitrary precision.
#[test]
fn machine_word_overflow_promotes() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    code.set_line(1);
    let big = code.const_int(i64::MAX);
    let one = code.const_int(1);
    code.emit_arg(Opcode::LoadConst, big);
    code.emit_arg(Opcode::LoadConst, one);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());

    let result = run_ok(&runner, vec![]);
    let expected = num_bigint::BigInt::from(i64::MAX) + 1;
    assert_eq!(result, Object::BigInt(expected));
}

/// String inputs concatenate through the heap path.
#[test]
fn string_concatenation() {
    let mut asm = ModuleAssembler::new("test.py");
    let x_name = asm.program.intern("x");
    let mut code = asm.module_code();
    let x = code.add_global(x_name);
    let suffix = asm.program.intern(" world");
    let suffix_const = code.const_str(suffix);
    code.set_line(1);
    code.emit_arg(Opcode::LoadGlobal, x);
    code.emit_arg(Opcode::LoadConst, suffix_const);
    code.emit_arg(Opcode::Binary, BinOp::Add.into());
    code.emit(Opcode::Return);
    let runner = asm.runner_with(code.build().unwrap(), &["x"], &[]);

    assert_eq!(
        run_ok(&runner, vec![Object::string("hello")]),
        Object::string("hello world")
    );
}

/// Containers round-trip as inputs and outputs.
#[test]
fn container_inputs_round_trip() {
    let mut asm = ModuleAssembler::new("test.py");
    let x_name = asm.program.intern("x");
    let mut code = asm.module_code();
    let x = code.add_global(x_name);
    code.set_line(1);
    code.emit_arg(Opcode::LoadGlobal, x);
    code.emit(Opcode::Return);
    let runner = asm.runner_with(code.build().unwrap(), &["x"], &[]);

    let input = Object::List(vec![
        Object::Int(1),
        Object::Tuple(vec![Object::string("a"), Object::None]),
        Object::Dict(vec![(Object::string("k"), Object::Int(2))]),
    ]);
    assert_eq!(run_ok(&runner, vec![input.clone()]), input);
}

/// `print` routes to the host sink with separators and terminator.
#[test]
fn print_writes_to_the_sink() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    code.set_line(1);
    let print_const = code.const_builtin("print").unwrap();
    let a = code.const_int(1);
    let b = code.const_int(2);
    code.emit_arg(Opcode::LoadConst, print_const);
    code.emit_arg(Opcode::LoadConst, a);
    code.emit_arg(Opcode::LoadConst, b);
    code.emit_arg(Opcode::Call, 2);
    code.emit(Opcode::Pop);
    let none = code.const_none();
    code.emit_arg(Opcode::LoadConst, none);
    code.emit(Opcode::Return);
    let runner = asm.runner(code.build().unwrap());

    let mut sink = basilisk::CollectStringPrint::new();
    let result = runner
        .run(vec![], basilisk::NoLimitTracker, &mut sink)
        .expect("script should succeed");
    assert_eq!(result, Object::None);
    assert_eq!(sink.output(), "1 2\n");
}
