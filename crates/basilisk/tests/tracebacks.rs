//! Traceback composition, exception chaining, and hash-policy errors.

mod common;

use basilisk::{BinOp, ExcKind, Object, Opcode, ParamSpec};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// A three-deep call chain records every frame, innermost first, and the
/// rendering quotes source lines outermost-first.
#[test]
fn nested_call_traceback_lists_every_frame() {
    let source = "def foo(): 1 / 0\ndef bar(): foo()\ndef baz(): bar()\nbaz()";
    let mut asm = ModuleAssembler::new("test.py");
    let foo_name = asm.program.intern("foo");
    let bar_name = asm.program.intern("bar");
    let baz_name = asm.program.intern("baz");

    // Globals live on the module code; function bodies reference them by
    // slot, so build the module shell first to fix the slot layout.
    let mut module = asm.module_code();
    module.attach_source(source);
    let foo_slot = module.add_global(foo_name);
    let bar_slot = module.add_global(bar_name);
    let baz_slot = module.add_global(baz_name);

    let mut foo = asm.function_code("foo");
    foo.set_line(1);
    let one = foo.const_int(1);
    let zero = foo.const_int(0);
    foo.emit_arg(Opcode::LoadConst, one);
    foo.emit_arg(Opcode::LoadConst, zero);
    foo.emit_arg(Opcode::Binary, BinOp::Div.into());
    foo.emit(Opcode::Return);
    let foo_id = asm.add_function("foo", foo.build().unwrap(), ParamSpec::default());

    let mut bar = asm.function_code("bar");
    bar.set_line(2);
    bar.emit_arg(Opcode::LoadGlobal, foo_slot);
    bar.emit_arg(Opcode::Call, 0);
    bar.emit(Opcode::Return);
    let bar_id = asm.add_function("bar", bar.build().unwrap(), ParamSpec::default());

    let mut baz = asm.function_code("baz");
    baz.set_line(3);
    baz.emit_arg(Opcode::LoadGlobal, bar_slot);
    baz.emit_arg(Opcode::Call, 0);
    baz.emit(Opcode::Return);
    let baz_id = asm.add_function("baz", baz.build().unwrap(), ParamSpec::default());

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, foo_id.raw());
    module.emit_arg(Opcode::StoreGlobal, foo_slot);
    module.set_line(2);
    module.emit_arg(Opcode::MakeFunction, bar_id.raw());
    module.emit_arg(Opcode::StoreGlobal, bar_slot);
    module.set_line(3);
    module.emit_arg(Opcode::MakeFunction, baz_id.raw());
    module.emit_arg(Opcode::StoreGlobal, baz_slot);
    module.set_line(4);
    module.emit_arg(Opcode::LoadGlobal, baz_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    let error = run_err(&runner, vec![]);

    assert_eq!(error.kind, ExcKind::ZeroDivisionError);
    let frames: Vec<(String, u32)> = error
        .frames
        .iter()
        .map(|f| (f.function.clone(), f.line))
        .collect();
    assert_eq!(
        frames,
        vec![
            ("foo".to_owned(), 1),
            ("bar".to_owned(), 2),
            ("baz".to_owned(), 3),
            ("<module>".to_owned(), 4),
        ]
    );

    let rendered = error.to_string();
    let module_at = rendered.find("in <module>").expect("module frame rendered");
    let foo_at = rendered.find("in foo").expect("foo frame rendered");
    assert!(module_at < foo_at, "outermost frame renders first:\n{rendered}");
    assert!(rendered.contains("1 / 0"), "source line quoted:\n{rendered}");
    assert!(rendered.trim_end().ends_with("ZeroDivisionError: division by zero"));
}

/// Raising inside a handler chains the handled exception as context.
#[test]
fn implicit_context_chain() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let value_error = code.const_builtin("ValueError").unwrap();
    let type_error = code.const_builtin("TypeError").unwrap();
    let first = asm.program.intern("first");
    let second = asm.program.intern("second");
    let first_const = code.const_str(first);
    let second_const = code.const_str(second);

    code.set_line(2);
    code.emit_arg(Opcode::LoadConst, value_error);
    code.emit_arg(Opcode::LoadConst, first_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::Raise, 1);
    let try_end = code.here();

    let handler = code.new_label();
    code.bind(handler);
    code.set_line(4);
    // Handler receives the exception; discard it and raise a fresh one.
    code.emit(Opcode::Pop);
    code.emit_arg(Opcode::LoadConst, type_error);
    code.emit_arg(Opcode::LoadConst, second_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::Raise, 1);

    code.add_handler(0, try_end, handler, 0, basilisk::HandlerKind::Except);
    let runner = asm.runner(code.build().unwrap());
    let error = run_err(&runner, vec![]);

    assert_eq!(error.kind, ExcKind::TypeError);
    assert_eq!(error.message.as_deref(), Some("second"));
    assert!(!error.suppress_context);
    let context = error.context.as_deref().expect("implicit context chained");
    assert_eq!(context.kind, ExcKind::ValueError);
    assert_eq!(context.message.as_deref(), Some("first"));
    assert!(error.to_string().contains("During handling of the above exception"));
}

/// `raise ... from ...` sets the cause and suppresses the context line.
#[test]
fn explicit_cause_chain() {
    let mut asm = ModuleAssembler::new("test.py");
    let mut code = asm.module_code();
    let type_error = code.const_builtin("TypeError").unwrap();
    let value_error = code.const_builtin("ValueError").unwrap();
    let b = asm.program.intern("b");
    let a = asm.program.intern("a");
    let b_const = code.const_str(b);
    let a_const = code.const_str(a);

    code.set_line(1);
    code.emit_arg(Opcode::LoadConst, type_error);
    code.emit_arg(Opcode::LoadConst, b_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::LoadConst, value_error);
    code.emit_arg(Opcode::LoadConst, a_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::Raise, 2);

    let runner = asm.runner(code.build().unwrap());
    let error = run_err(&runner, vec![]);

    assert_eq!(error.kind, ExcKind::TypeError);
    assert!(error.suppress_context);
    let cause = error.cause.as_deref().expect("explicit cause");
    assert_eq!(cause.kind, ExcKind::ValueError);
    assert_eq!(cause.message.as_deref(), Some("a"));
    let rendered = error.to_string();
    assert!(rendered.contains("direct cause"));
    assert!(!rendered.contains("During handling"));
}

/// `class Base: __hash__ = None` poisons hashing for subclasses too.
#[test]
fn explicit_unhashable_inherits() {
    let mut asm = ModuleAssembler::new("test.py");
    let base_name = asm.program.intern("Base");
    let sub_name = asm.program.intern("Sub");
    let hash_name = asm.program.intern("__hash__");

    // class Base: __hash__ = None
    let mut base_body = asm.function_code("Base.<body>");
    let hash_slot = base_body.add_local(hash_name);
    base_body.set_line(1);
    let none = base_body.const_none();
    base_body.emit_arg(Opcode::LoadConst, none);
    base_body.emit_arg(Opcode::StoreLocal, hash_slot);
    let none2 = base_body.const_none();
    base_body.emit_arg(Opcode::LoadConst, none2);
    base_body.emit(Opcode::Return);
    let base_body_id = asm.add_function("Base.<body>", base_body.build().unwrap(), ParamSpec::default());

    // class Sub(Base): pass
    let mut sub_body = asm.function_code("Sub.<body>");
    sub_body.set_line(2);
    let none3 = sub_body.const_none();
    sub_body.emit_arg(Opcode::LoadConst, none3);
    sub_body.emit(Opcode::Return);
    let sub_body_id = asm.add_function("Sub.<body>", sub_body.build().unwrap(), ParamSpec::default());

    let mut module = asm.module_code();
    let base_slot = module.add_global(base_name);
    let sub_slot = module.add_global(sub_name);
    let base_const = module.const_str(base_name);
    let sub_const = module.const_str(sub_name);
    let hash_builtin = module.const_builtin("hash").unwrap();

    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, base_body_id.raw());
    module.emit_arg(Opcode::LoadConst, base_const);
    module.emit_arg(Opcode::BuildClass, 0);
    module.emit_arg(Opcode::StoreGlobal, base_slot);
    module.set_line(2);
    module.emit_arg(Opcode::MakeFunction, sub_body_id.raw());
    module.emit_arg(Opcode::LoadConst, sub_const);
    module.emit_arg(Opcode::LoadGlobal, base_slot);
    module.emit_arg(Opcode::BuildClass, 1);
    module.emit_arg(Opcode::StoreGlobal, sub_slot);
    module.set_line(3);
    module.emit_arg(Opcode::LoadConst, hash_builtin);
    module.emit_arg(Opcode::LoadGlobal, sub_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Return);

    let runner = asm.runner(module.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::TypeError);
    assert_eq!(error.message.as_deref(), Some("unhashable type: 'Sub'"));
}

/// Guest-defined exception classes match their base kinds in handlers.
#[test]
fn guest_exception_class_is_caught_by_base_kind() {
    let mut asm = ModuleAssembler::new("test.py");
    let my_error_name = asm.program.intern("MyError");

    let mut body = asm.function_code("MyError.<body>");
    let none = body.const_none();
    body.emit_arg(Opcode::LoadConst, none);
    body.emit(Opcode::Return);
    let body_id = asm.add_function("MyError.<body>", body.build().unwrap(), ParamSpec::default());

    let mut module = asm.module_code();
    let my_error_slot = module.add_global(my_error_name);
    let my_error_const = module.const_str(my_error_name);
    let value_error = module.const_builtin("ValueError").unwrap();
    let boom = asm.program.intern("boom");
    let boom_const = module.const_str(boom);
    let caught = asm.program.intern("caught");
    let caught_const = module.const_str(caught);

    // class MyError(ValueError): pass
    module.set_line(1);
    module.emit_arg(Opcode::MakeFunction, body_id.raw());
    module.emit_arg(Opcode::LoadConst, my_error_const);
    module.emit_arg(Opcode::LoadConst, value_error);
    module.emit_arg(Opcode::BuildClass, 1);
    module.emit_arg(Opcode::StoreGlobal, my_error_slot);

    // try: raise MyError("boom")
    // except ValueError: "caught"
    module.set_line(2);
    let try_start = module.here();
    module.emit_arg(Opcode::LoadGlobal, my_error_slot);
    module.emit_arg(Opcode::LoadConst, boom_const);
    module.emit_arg(Opcode::Call, 1);
    module.emit_arg(Opcode::Raise, 1);
    let try_end = module.here();

    let handler = module.new_label();
    let no_match = module.new_label();
    module.bind(handler);
    module.set_line(3);
    let value_error_again = module.const_builtin("ValueError").unwrap();
    module.emit_arg(Opcode::LoadConst, value_error_again);
    module.emit(Opcode::CheckExcMatch);
    module.emit_jump(Opcode::JumpIfFalse, no_match);
    module.emit(Opcode::Pop);
    module.emit(Opcode::ClearExc);
    module.emit_arg(Opcode::LoadConst, caught_const);
    module.emit(Opcode::Return);
    module.bind(no_match);
    module.emit(Opcode::Reraise);

    module.add_handler(try_start, try_end, handler, 0, basilisk::HandlerKind::Except);
    let runner = asm.runner(module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("caught"));
}
