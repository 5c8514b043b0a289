use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};

use crate::ir::*;

type IOResult = std::io::Result<()>;

/// Write the pretty-printed RTL program to `file_name`.
pub fn debug_rtl(program: &Program, file_name: &str) -> IOResult {
    let output = File::create(file_name)?;
    let mut writer = BufWriter::new(output);

    write_rtl(&mut writer, program)?;

    writer.flush()?;

    Ok(())
}

pub fn write_rtl<W: Write>(writer: &mut W, program: &Program) -> IOResult {
    for global in &program.globals {
        writeln!(writer, "GLOBAL {} = {}", global.name, global.init)?;
    }
    if !program.globals.is_empty() {
        writeln!(writer)?;
    }

    for callable in &program.callables {
        print_callable(writer, callable)?;
    }

    Ok(())
}

fn print_callable<W: Write>(writer: &mut W, callable: &Callable) -> IOResult {
    writeln!(writer, "CALLABLE \"{}\":", callable.name)?;

    write!(writer, "input(s): ")?;
    for reg in &callable.input_regs {
        write!(writer, "{} ", reg)?;
    }
    writeln!(writer)?;

    writeln!(writer, "output: {}", callable.output_reg)?;
    writeln!(writer, "enter: {}", callable.enter)?;
    writeln!(writer, "leave: {}", callable.leave)?;
    writeln!(writer, "----")?;

    for label in &callable.schedule {
        writeln!(writer, "{}: {}", label, callable.body[label])?;
    }

    writeln!(writer, "END CALLABLE")?;
    writeln!(writer)?;

    Ok(())
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Addr::Global(symbol) => write!(f, "{}(%rip)", symbol),
            Addr::Frame(offset) => write!(f, "{}(%rbp)", offset),
        }
    }
}

impl Display for MemRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemRef::Global { symbol, offset } => write!(f, "{}+{}", symbol, offset),
            MemRef::Reg { base, offset } => write!(f, "[{}]+{}", base, offset),
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Instr::Move { source, dest, succ } => {
                write!(f, "move {}, {}  --> {}", source, dest, succ)
            }
            Instr::Copy { src, dest, succ } => {
                write!(f, "copy {}, {}  --> {}", src, dest, succ)
            }
            Instr::CopyMp { src, dest, succ } => {
                write!(f, "copy_mp {}, {}  --> {}", src, dest, succ)
            }
            Instr::CopyPm { src, dest, succ } => {
                write!(f, "copy_pm {}, {}  --> {}", src, dest, succ)
            }
            Instr::CopyAp { addr, dest, succ } => {
                write!(f, "copy_ap {}, {}  --> {}", addr, dest, succ)
            }
            Instr::Load { addr, dest, succ } => {
                write!(f, "load {}, {}  --> {}", addr, dest, succ)
            }
            Instr::Store { src, addr, succ } => {
                write!(f, "store {}, {}  --> {}", src, addr, succ)
            }
            Instr::Unop { op, arg, succ } => {
                write!(f, "unop {}, {}  --> {}", unop_name(op), arg, succ)
            }
            Instr::Binop {
                op,
                src,
                dest,
                succ,
            } => {
                write!(f, "binop {}, {}, {}  --> {}", binop_name(op), src, dest, succ)
            }
            Instr::Ubranch {
                op,
                arg,
                succ,
                fail,
            } => {
                write!(
                    f,
                    "ubranch {}, {}  --> {}, {}",
                    ubranch_name(op),
                    arg,
                    succ,
                    fail
                )
            }
            Instr::Bbranch {
                op,
                arg1,
                arg2,
                succ,
                fail,
            } => {
                write!(
                    f,
                    "bbranch {}, {}, {}  --> {}, {}",
                    bbranch_name(op),
                    arg1,
                    arg2,
                    succ,
                    fail
                )
            }
            Instr::Goto { succ } => write!(f, "goto  --> {}", succ),
            Instr::Call { func, nargs, succ } => {
                write!(f, "call {}({})  --> {}", func, nargs, succ)
            }
            Instr::Return => write!(f, "return"),
            Instr::NewFrame { size, succ } => write!(f, "newframe {}  --> {}", size, succ),
            Instr::DelFrame { succ } => write!(f, "delframe  --> {}", succ),
            Instr::LoadParam { slot, dest, succ } => {
                write!(f, "load_param {}, {}  --> {}", slot, dest, succ)
            }
            Instr::Push { src, succ } => write!(f, "push {}  --> {}", src, succ),
            Instr::Pop { dest, succ } => write!(f, "pop {}  --> {}", dest, succ),
        }
    }
}

fn unop_name(op: &UnopCode) -> &'static str {
    match op {
        UnopCode::Neg => "neg",
        UnopCode::Not => "not",
    }
}

fn binop_name(op: &BinopCode) -> &'static str {
    match op {
        BinopCode::Add => "add",
        BinopCode::Sub => "sub",
        BinopCode::Mul => "mul",
        BinopCode::Div => "div",
        BinopCode::Rem => "rem",
        BinopCode::Sal => "sal",
        BinopCode::Sar => "sar",
        BinopCode::And => "and",
        BinopCode::Or => "or",
        BinopCode::Xor => "xor",
    }
}

fn ubranch_name(op: &UbranchCode) -> &'static str {
    match op {
        UbranchCode::Jz => "jz",
        UbranchCode::Jnz => "jnz",
    }
}

fn bbranch_name(op: &BbranchCode) -> &'static str {
    match op {
        BbranchCode::Je => "je",
        BbranchCode::Jne => "jne",
        BbranchCode::Jl => "jl",
        BbranchCode::Jnl => "jnl",
        BbranchCode::Jle => "jle",
        BbranchCode::Jnle => "jnle",
        BbranchCode::Jg => "jg",
        BbranchCode::Jng => "jng",
        BbranchCode::Jge => "jge",
        BbranchCode::Jnge => "jnge",
    }
}
