use std::fs::File;
use std::io::{BufWriter, Write};

use crate::ast_def::*;

type IOResult = std::io::Result<()>;

/// Write the pretty-printed (typed) AST to `file_name`.
pub fn debug_ast(program: &Program, file_name: &str) -> IOResult {
    let output = File::create(file_name)?;
    let mut writer = BufWriter::new(output);

    write_program(&mut writer, program)?;

    writer.flush()?;

    Ok(())
}

pub fn write_program<W: Write>(writer: &mut W, program: &Program) -> IOResult {
    for global in &program.globals {
        writeln!(
            writer,
            "var {} = {} : {};",
            global.name,
            format_expr(&global.init),
            global.ty
        )?;
    }

    if !program.globals.is_empty() {
        writeln!(writer)?;
    }

    for callable in &program.callables {
        print_callable(writer, callable)?;
        writeln!(writer)?;
    }

    Ok(())
}

fn print_callable<W: Write>(writer: &mut W, callable: &Callable) -> IOResult {
    let keyword = if callable.return_ty.is_some() {
        "fun"
    } else {
        "proc"
    };

    let params = callable
        .params
        .iter()
        .map(|(name, ty)| format!("{} : {}", name, ty))
        .collect::<Vec<_>>()
        .join(", ");

    match &callable.return_ty {
        Some(ty) => writeln!(writer, "{} {}({}) : {}", keyword, callable.name, params, ty)?,
        None => writeln!(writer, "{} {}({})", keyword, callable.name, params)?,
    }

    print_block(writer, &callable.body, 0)?;

    Ok(())
}

fn print_block<W: Write>(writer: &mut W, block: &Block, depth: usize) -> IOResult {
    writeln!(writer, "{}{{", indent(depth))?;

    for stmt in &block.stmts {
        print_stmt(writer, stmt, depth + 1)?;
    }

    writeln!(writer, "{}}}", indent(depth))?;

    Ok(())
}

fn print_stmt<W: Write>(writer: &mut W, stmt: &Stmt, depth: usize) -> IOResult {
    let pad = indent(depth);

    match stmt {
        Stmt::Declare { name, ty, init } => {
            writeln!(writer, "{}var {} = {} : {};", pad, name, format_expr(init), ty)
        }
        Stmt::Assign { target, value } => {
            writeln!(writer, "{}{} = {};", pad, format_expr(target), format_expr(value))
        }
        Stmt::Eval(expr) => writeln!(writer, "{}{};", pad, format_expr(expr)),
        Stmt::Print(expr) => writeln!(writer, "{}print {};", pad, format_expr(expr)),
        Stmt::Block(block) => print_block(writer, block, depth),
        Stmt::IfElse {
            condition,
            true_branch,
            false_branch,
        } => {
            writeln!(writer, "{}if ({})", pad, format_expr(condition))?;
            print_stmt(writer, true_branch, depth + 1)?;
            if let Some(false_branch) = false_branch {
                writeln!(writer, "{}else", pad)?;
                print_stmt(writer, false_branch, depth + 1)?;
            }
            Ok(())
        }
        Stmt::While { condition, body } => {
            writeln!(writer, "{}while ({})", pad, format_expr(condition))?;
            print_stmt(writer, body, depth + 1)
        }
        Stmt::Return(None) => writeln!(writer, "{}return;", pad),
        Stmt::Return(Some(expr)) => writeln!(writer, "{}return {};", pad, format_expr(expr)),
    }
}

fn format_expr(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::IntConstant(value) => format!("{}", value),
        ExprKind::BoolConstant(value) => format!("{}", value),
        ExprKind::Null => "null".to_string(),
        ExprKind::Var(name) => name.clone(),
        ExprKind::Unary { op, arg } => {
            format!("{}{}", format_unary(op), format_expr(arg))
        }
        ExprKind::Binary { op, left, right } => {
            format!(
                "({} {} {})",
                format_expr(left),
                format_binary(op),
                format_expr(right)
            )
        }
        ExprKind::Call { func, args } => {
            let args = args
                .iter()
                .map(format_expr)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}({})", func, args)
        }
        ExprKind::Alloc { elem_ty, len } => {
            format!("alloc {}[{}]", elem_ty, format_expr(len))
        }
        ExprKind::AddressOf(arg) => format!("&{}", format_expr(arg)),
        ExprKind::Deref(arg) => format!("*{}", format_expr(arg)),
        ExprKind::ListElem { list, index } => {
            format!("{}[{}]", format_expr(list), format_expr(index))
        }
    }
}

fn format_unary(op: &UnaryOp) -> &'static str {
    match op {
        UnaryOp::Negate => "-",
        UnaryOp::BitNot => "~",
        UnaryOp::LogNot => "!",
    }
}

fn format_binary(op: &BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Subtract => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
        BinaryOp::Modulo => "%",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::Lshift => "<<",
        BinaryOp::Rshift => ">>",
        BinaryOp::Less => "<",
        BinaryOp::LessEq => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterEq => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::LogAnd => "&&",
        BinaryOp::LogOr => "||",
    }
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}
