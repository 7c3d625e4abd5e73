//! `except*`: partitioning exception groups into matching and
//! non-matching halves.

mod common;

use basilisk::{CmpOp, ExcKind, HandlerKind, Object, Opcode};
use common::{ModuleAssembler, run_err, run_ok};
use pretty_assertions::assert_eq;

/// Emits `raise ExceptionGroup("grp", [ValueError("a"), TypeError("b")])`
/// wrapped in an except* handler for `ValueError`. The handler stores the
/// matched sub-group under a global, then re-raises whatever remains.
fn build_star_module(asm: &mut ModuleAssembler, members: &[&str]) -> basilisk::Code {
    let caught_name = asm.program.intern("caught");
    let grp = asm.program.intern("grp");
    let a = asm.program.intern("a");
    let b = asm.program.intern("b");

    let mut code = asm.module_code();
    let caught_slot = code.add_global(caught_name);
    let eg = code.const_builtin("ExceptionGroup").unwrap();
    let grp_const = code.const_str(grp);
    let a_const = code.const_str(a);
    let b_const = code.const_str(b);
    let value_error = code.const_builtin("ValueError").unwrap();
    let none = code.const_none();

    code.set_line(1);
    let try_start = code.here();
    code.emit_arg(Opcode::LoadConst, eg);
    code.emit_arg(Opcode::LoadConst, grp_const);
    for &member in members {
        let (kind_const, msg_const) = match member {
            "ValueError" => (value_error, a_const),
            _ => {
                let type_error = code.const_builtin(member).unwrap();
                (type_error, b_const)
            }
        };
        code.emit_arg(Opcode::LoadConst, kind_const);
        code.emit_arg(Opcode::LoadConst, msg_const);
        code.emit_arg(Opcode::Call, 1);
    }
    code.emit_arg(Opcode::BuildList, u32::try_from(members.len()).unwrap());
    code.emit_arg(Opcode::Call, 2);
    code.emit_arg(Opcode::Raise, 1);
    let try_end = code.here();

    // Unreachable fall-through for a well-formed body.
    code.emit_arg(Opcode::LoadConst, none);
    code.emit(Opcode::Return);

    let handler = code.new_label();
    code.bind(handler);
    code.set_line(3);
    // [exc] -> split on ValueError.
    let value_error_again = code.const_builtin("ValueError").unwrap();
    code.emit_arg(Opcode::LoadConst, value_error_again);
    code.emit(Opcode::ExceptStarMatch);
    // [rest, matched]: store the matched half (None when nothing matched).
    code.emit_arg(Opcode::StoreGlobal, caught_slot);
    // [rest]: re-raise the remainder, or continue when none.
    code.emit(Opcode::ReraiseStar);
    code.emit(Opcode::ClearExc);
    code.emit_arg(Opcode::LoadGlobal, caught_slot);
    code.emit(Opcode::Return);

    code.add_handler(try_start, try_end, handler, 0, HandlerKind::ExceptStar);
    code.build().unwrap()
}

/// A fully matching group is swallowed; the matched partition carries every
/// member.
#[test]
fn fully_matching_group_is_caught() {
    let mut asm = ModuleAssembler::new("test.py");
    let module = build_star_module(&mut asm, &["ValueError", "ValueError"]);
    let runner = asm.runner(module);
    let result = run_ok(&runner, vec![]);
    let Object::Exception { type_name, .. } = result else {
        panic!("expected the matched sub-group, got {result:?}");
    };
    assert_eq!(type_name, "ExceptionGroup");
}

/// A mixed group splits: the ValueError half is caught, the rest re-raises
/// as a group.
#[test]
fn partial_match_reraises_the_remainder() {
    let mut asm = ModuleAssembler::new("test.py");
    let module = build_star_module(&mut asm, &["ValueError", "TypeError"]);
    let runner = asm.runner(module);
    let error = run_err(&runner, vec![]);
    assert_eq!(error.kind, ExcKind::ExceptionGroup);
    let member_kinds: Vec<ExcKind> = error.group.iter().map(|m| m.kind).collect();
    assert_eq!(member_kinds, vec![ExcKind::TypeError]);
}

/// A lone non-group exception raised into `except*` behaves as a
/// single-member group.
#[test]
fn single_exception_partitions_like_a_group() {
    let mut asm = ModuleAssembler::new("test.py");
    let caught_name = asm.program.intern("caught");
    let mut code = asm.module_code();
    let caught_slot = code.add_global(caught_name);
    let value_error = code.const_builtin("ValueError").unwrap();
    let lone = asm.program.intern("lone");
    let lone_const = code.const_str(lone);
    let none = code.const_none();

    code.set_line(1);
    let try_start = code.here();
    code.emit_arg(Opcode::LoadConst, value_error);
    code.emit_arg(Opcode::LoadConst, lone_const);
    code.emit_arg(Opcode::Call, 1);
    code.emit_arg(Opcode::Raise, 1);
    let try_end = code.here();
    code.emit_arg(Opcode::LoadConst, none);
    code.emit(Opcode::Return);

    let handler = code.new_label();
    code.bind(handler);
    let value_error_again = code.const_builtin("ValueError").unwrap();
    code.emit_arg(Opcode::LoadConst, value_error_again);
    code.emit(Opcode::ExceptStarMatch);
    code.emit_arg(Opcode::StoreGlobal, caught_slot);
    code.emit(Opcode::ReraiseStar);
    code.emit(Opcode::ClearExc);
    // Return whether anything matched.
    code.emit_arg(Opcode::LoadGlobal, caught_slot);
    code.emit_arg(Opcode::LoadConst, none);
    code.emit_arg(Opcode::Compare, CmpOp::IsNot.into());
    code.emit(Opcode::Return);

    code.add_handler(try_start, try_end, handler, 0, HandlerKind::ExceptStar);
    let runner = asm.runner(code.build().unwrap());
    assert_eq!(run_ok(&runner, vec![]), Object::Bool(true));
}
