use std::fs::File;
use std::io::{BufWriter, Write};

use amd64::*;

type IOResult = std::io::Result<()>;

/// Write the fully rendered assembly program to `path`.
pub fn output(path: &str, assm: &Program) -> IOResult {
    let output = File::create(path)?;
    let mut writer = BufWriter::new(output);

    write_program(&mut writer, assm)?;

    writer.flush()?;

    Ok(())
}

pub fn write_program<W: Write>(writer: &mut W, assm: &Program) -> IOResult {
    for decl in &assm.decls {
        match decl {
            Decl::Func(func) => emit_func(writer, func)?,
            Decl::StaticVar(var) => emit_static_var(writer, var)?,
        }
    }

    emit_stack_note(writer)?;

    Ok(())
}

fn emit_static_var<W: Write>(writer: &mut W, var: &StaticVar) -> IOResult {
    writeln!(writer, "\t.globl {}", var.name)?;

    // zero-initialized data can sit in .bss
    let init = if var.init == 0 {
        writeln!(writer, "\t.bss")?;
        "\t.zero 8".to_string()
    } else {
        writeln!(writer, "\t.data")?;
        format!("\t.quad {}", var.init)
    };

    writeln!(writer, "\t.balign 8")?;
    writeln!(writer, "{}:", var.name)?;
    writeln!(writer, "{}", init)?;

    Ok(())
}

fn emit_func<W: Write>(writer: &mut W, func: &Func) -> IOResult {
    for line in &func.lines {
        writeln!(writer, "{}", line.render())?;
    }

    Ok(())
}

fn emit_stack_note<W: Write>(writer: &mut W) -> IOResult {
    writeln!(writer, ".section .note.GNU-stack,\"\",@progbits")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_vars_and_lines_are_written() {
        let prog = Program {
            decls: vec![
                Decl::StaticVar(StaticVar {
                    name: "counter".to_string(),
                    init: 7,
                }),
                Decl::StaticVar(StaticVar {
                    name: "flag".to_string(),
                    init: 0,
                }),
                Decl::Func(Func {
                    name: "main".to_string(),
                    lines: vec![
                        Asm::set_label("main"),
                        Asm::movq_imm(1, Pseudo::Reg(Reg::Rax)),
                        Asm::ret(),
                    ],
                }),
            ],
        };

        let mut out = Vec::new();
        write_program(&mut out, &prog).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("\t.globl counter"));
        assert!(text.contains("\t.quad 7"));
        assert!(text.contains("\t.bss"));
        assert!(text.contains("\t.zero 8"));
        assert!(text.contains("main:"));
        assert!(text.contains("\tmovq $1, %rax"));
        assert!(text.ends_with(".section .note.GNU-stack,\"\",@progbits\n"));
    }
}
