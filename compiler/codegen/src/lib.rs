use amd64::{Decl, Func, Program, StaticVar};

pub use crate::instr_compiler::compile_callable;

mod instr_compiler;

/// Translate an RTL program into abstract AMD64 assembly.
pub fn gen_program(rtl_prog: &rtl::Program) -> Program {
    let mut decls = vec![];

    for global in &rtl_prog.globals {
        decls.push(Decl::StaticVar(StaticVar {
            name: global.name.clone(),
            init: global.init,
        }));
    }

    for callable in &rtl_prog.callables {
        decls.push(Decl::Func(Func {
            name: callable.name.clone(),
            lines: compile_callable(callable),
        }));
    }

    Program { decls }
}
