//! Object-model dispatch rules: reflected-operator priority, membership
//! fallbacks, type-level `__call__`, and strict dunder return types.

mod common;

use basilisk::{BinOp, CmpOp, Code, ExcKind, Object, Opcode, ParamSpec, StringId};
use common::{ModuleAssembler, params, run_err, run_ok};
use pretty_assertions::assert_eq;

/// Builds a method body that returns an interned string constant.
fn returning_method(asm: &mut ModuleAssembler, qualname: &str, text: StringId, nparams: &[StringId]) -> basilisk::FunctionId {
    let mut body = asm.function_code(qualname);
    for &name in nparams {
        body.add_local(name);
    }
    body.set_line(1);
    let text_const = body.const_str(text);
    body.emit_arg(Opcode::LoadConst, text_const);
    body.emit(Opcode::Return);
    asm.add_function(qualname, body.build().unwrap(), params(nparams))
}

/// Builds `class <name>` whose body stores the given (attr, function)
/// pairs, leaving the class in a module global.
fn emit_class(
    asm: &mut ModuleAssembler,
    module: &mut basilisk::CodeBuilder,
    name: StringId,
    slot: u32,
    base_slot: Option<u32>,
    methods: &[(StringId, basilisk::FunctionId)],
) {
    let mut body = asm.function_code("<class body>");
    let none = body.const_none();
    for &(attr, fid) in methods {
        let local = body.add_local(attr);
        body.emit_arg(Opcode::MakeFunction, fid.raw());
        body.emit_arg(Opcode::StoreLocal, local);
    }
    body.emit_arg(Opcode::LoadConst, none);
    body.emit(Opcode::Return);
    let body_id = asm.add_function("<class body>", body.build().unwrap(), ParamSpec::default());

    let name_const = module.const_str(name);
    module.emit_arg(Opcode::MakeFunction, body_id.raw());
    module.emit_arg(Opcode::LoadConst, name_const);
    let nbases = match base_slot {
        Some(base) => {
            module.emit_arg(Opcode::LoadGlobal, base);
            1
        }
        None => 0,
    };
    module.emit_arg(Opcode::BuildClass, nbases);
    module.emit_arg(Opcode::StoreGlobal, slot);
}

fn finish(asm: ModuleAssembler, module: Code) -> basilisk::Runner {
    asm.runner(module)
}

/// When the right operand's type is a strict subclass overriding the
/// reflected method, it wins over the left's forward method.
#[test]
fn subclass_reflected_operator_wins() {
    let mut asm = ModuleAssembler::new("test.py");
    let a_name = asm.program.intern("A");
    let b_name = asm.program.intern("B");
    let add_name = asm.program.intern("__add__");
    let radd_name = asm.program.intern("__radd__");
    let self_name = asm.program.intern("self");
    let other_name = asm.program.intern("other");
    let a_add = asm.program.intern("A.add");
    let b_radd = asm.program.intern("B.radd");

    let add_id = returning_method(&mut asm, "A.__add__", a_add, &[self_name, other_name]);
    let radd_id = returning_method(&mut asm, "B.__radd__", b_radd, &[self_name, other_name]);

    let mut module = asm.module_code();
    let a_slot = module.add_global(a_name);
    let b_slot = module.add_global(b_name);

    module.set_line(1);
    emit_class(&mut asm, &mut module, a_name, a_slot, None, &[(add_name, add_id)]);
    emit_class(&mut asm, &mut module, b_name, b_slot, Some(a_slot), &[(radd_name, radd_id)]);

    // A() + B()
    module.set_line(5);
    module.emit_arg(Opcode::LoadGlobal, a_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::LoadGlobal, b_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Binary, BinOp::Add.into());
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("B.radd"));
}

/// A subclass that merely inherits the reflected method does not jump the
/// queue: the left operand's forward method still goes first.
#[test]
fn inherited_reflected_method_does_not_preempt() {
    let mut asm = ModuleAssembler::new("test.py");
    let a_name = asm.program.intern("A");
    let b_name = asm.program.intern("B");
    let add_name = asm.program.intern("__add__");
    let radd_name = asm.program.intern("__radd__");
    let self_name = asm.program.intern("self");
    let other_name = asm.program.intern("other");
    let a_add = asm.program.intern("A.add");
    let a_radd = asm.program.intern("A.radd");

    let add_id = returning_method(&mut asm, "A.__add__", a_add, &[self_name, other_name]);
    let radd_id = returning_method(&mut asm, "A.__radd__", a_radd, &[self_name, other_name]);

    let mut module = asm.module_code();
    let a_slot = module.add_global(a_name);
    let b_slot = module.add_global(b_name);

    // class A defines both sides; class B(A) overrides neither.
    module.set_line(1);
    emit_class(
        &mut asm,
        &mut module,
        a_name,
        a_slot,
        None,
        &[(add_name, add_id), (radd_name, radd_id)],
    );
    emit_class(&mut asm, &mut module, b_name, b_slot, Some(a_slot), &[]);

    // A() + B()
    module.set_line(5);
    module.emit_arg(Opcode::LoadGlobal, a_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::LoadGlobal, b_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Binary, BinOp::Add.into());
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("A.add"));
}

/// Without the subclass relationship, the forward method goes first.
#[test]
fn forward_operator_wins_between_unrelated_types() {
    let mut asm = ModuleAssembler::new("test.py");
    let a_name = asm.program.intern("A");
    let b_name = asm.program.intern("B");
    let add_name = asm.program.intern("__add__");
    let radd_name = asm.program.intern("__radd__");
    let self_name = asm.program.intern("self");
    let other_name = asm.program.intern("other");
    let a_add = asm.program.intern("A.add");
    let b_radd = asm.program.intern("B.radd");

    let add_id = returning_method(&mut asm, "A.__add__", a_add, &[self_name, other_name]);
    let radd_id = returning_method(&mut asm, "B.__radd__", b_radd, &[self_name, other_name]);

    let mut module = asm.module_code();
    let a_slot = module.add_global(a_name);
    let b_slot = module.add_global(b_name);

    module.set_line(1);
    emit_class(&mut asm, &mut module, a_name, a_slot, None, &[(add_name, add_id)]);
    emit_class(&mut asm, &mut module, b_name, b_slot, None, &[(radd_name, radd_id)]);
    module.set_line(5);
    module.emit_arg(Opcode::LoadGlobal, a_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::LoadGlobal, b_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Binary, BinOp::Add.into());
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("A.add"));
}

/// `in` without `__contains__` falls back to `__iter__` and element
/// equality.
#[test]
fn membership_falls_back_to_iteration() {
    let mut asm = ModuleAssembler::new("test.py");
    let c_name = asm.program.intern("C");
    let iter_name = asm.program.intern("__iter__");
    let self_name = asm.program.intern("self");

    // def __iter__(self): return iter([1, 2, 3])
    let mut body = asm.function_code("C.__iter__");
    body.add_local(self_name);
    body.set_line(2);
    let iter_builtin = body.const_builtin("iter").unwrap();
    let one = body.const_int(1);
    let two = body.const_int(2);
    let three = body.const_int(3);
    body.emit_arg(Opcode::LoadConst, iter_builtin);
    body.emit_arg(Opcode::LoadConst, one);
    body.emit_arg(Opcode::LoadConst, two);
    body.emit_arg(Opcode::LoadConst, three);
    body.emit_arg(Opcode::BuildList, 3);
    body.emit_arg(Opcode::Call, 1);
    body.emit(Opcode::Return);
    let iter_id = asm.add_function("C.__iter__", body.build().unwrap(), params(&[self_name]));

    let mut module = asm.module_code();
    let c_slot = module.add_global(c_name);
    module.set_line(1);
    emit_class(&mut asm, &mut module, c_name, c_slot, None, &[(iter_name, iter_id)]);

    // (2 in C(), 5 in C())
    module.set_line(3);
    let two_const = module.const_int(2);
    let five_const = module.const_int(5);
    module.emit_arg(Opcode::LoadConst, two_const);
    module.emit_arg(Opcode::LoadGlobal, c_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Compare, CmpOp::In.into());
    module.emit_arg(Opcode::LoadConst, five_const);
    module.emit_arg(Opcode::LoadGlobal, c_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Compare, CmpOp::In.into());
    module.emit_arg(Opcode::BuildTuple, 2);
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    assert_eq!(
        run_ok(&runner, vec![]),
        Object::Tuple(vec![Object::Bool(true), Object::Bool(false)])
    );
}

/// Calling an instance uses the type-level `__call__`; an instance
/// attribute of the same name is ignored.
#[test]
fn instance_call_attribute_is_ignored() {
    let mut asm = ModuleAssembler::new("test.py");
    let d_name = asm.program.intern("D");
    let d_inst = asm.program.intern("d");
    let call_name = asm.program.intern("__call__");
    let self_name = asm.program.intern("self");
    let from_type = asm.program.intern("type");
    let from_instance = asm.program.intern("instance");

    let call_id = returning_method(&mut asm, "D.__call__", from_type, &[self_name]);
    let shadow_id = returning_method(&mut asm, "shadow", from_instance, &[]);

    let mut module = asm.module_code();
    let d_slot = module.add_global(d_name);
    let d_inst_slot = module.add_global(d_inst);
    module.set_line(1);
    emit_class(&mut asm, &mut module, d_name, d_slot, None, &[(call_name, call_id)]);

    // d = D(); d.__call__ = shadow; d()
    module.set_line(3);
    module.emit_arg(Opcode::LoadGlobal, d_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::StoreGlobal, d_inst_slot);
    module.emit_arg(Opcode::MakeFunction, shadow_id.raw());
    module.emit_arg(Opcode::LoadGlobal, d_inst_slot);
    module.emit_arg(Opcode::StoreAttr, call_name.raw());
    module.emit_arg(Opcode::LoadGlobal, d_inst_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::string("type"));
}

/// `__bool__` must return an actual bool.
#[test]
fn bool_dunder_rejects_non_bool() {
    let mut asm = ModuleAssembler::new("test.py");
    let e_name = asm.program.intern("E");
    let bool_name = asm.program.intern("__bool__");
    let self_name = asm.program.intern("self");

    let mut body = asm.function_code("E.__bool__");
    body.add_local(self_name);
    let one = body.const_int(1);
    body.emit_arg(Opcode::LoadConst, one);
    body.emit(Opcode::Return);
    let bool_id = asm.add_function("E.__bool__", body.build().unwrap(), params(&[self_name]));

    let mut module = asm.module_code();
    let e_slot = module.add_global(e_name);
    module.set_line(1);
    emit_class(&mut asm, &mut module, e_name, e_slot, None, &[(bool_name, bool_id)]);
    let bool_builtin = module.const_builtin("bool").unwrap();
    module.set_line(3);
    module.emit_arg(Opcode::LoadConst, bool_builtin);
    module.emit_arg(Opcode::LoadGlobal, e_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::TypeError);
}

/// `__len__` must return a non-negative integer.
#[test]
fn len_dunder_rejects_negative() {
    let mut asm = ModuleAssembler::new("test.py");
    let f_name = asm.program.intern("F");
    let len_name = asm.program.intern("__len__");
    let self_name = asm.program.intern("self");

    let mut body = asm.function_code("F.__len__");
    body.add_local(self_name);
    let minus_one = body.const_int(-1);
    body.emit_arg(Opcode::LoadConst, minus_one);
    body.emit(Opcode::Return);
    let len_id = asm.add_function("F.__len__", body.build().unwrap(), params(&[self_name]));

    let mut module = asm.module_code();
    let f_slot = module.add_global(f_name);
    module.set_line(1);
    emit_class(&mut asm, &mut module, f_name, f_slot, None, &[(len_name, len_id)]);
    let len_builtin = module.const_builtin("len").unwrap();
    module.set_line(3);
    module.emit_arg(Opcode::LoadConst, len_builtin);
    module.emit_arg(Opcode::LoadGlobal, f_slot);
    module.emit_arg(Opcode::Call, 0);
    module.emit_arg(Opcode::Call, 1);
    module.emit(Opcode::Return);

    let runner = finish(asm, module.build().unwrap());
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::ValueError);
}
