use std::fs::read_to_string;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser as ClapParser};
use thiserror::Error;

use lexer::{Lexer, TokenType};
use parser::Parser;

#[derive(ClapParser, Debug)]
#[command(version, about, long_about = "Runs the bxc BX compiler")]
struct Arguments {
    /// Path to a BX source file
    path: String,

    /// Specifies a point in the pipeline for bxc to stop; only one option
    /// can be given at a time
    #[command(flatten)]
    stage_options: StageOptions,

    /// Path to the C runtime linked into the final executable
    #[arg(long, default_value = "runtime/bxrt.c")]
    runtime: String,
}

#[derive(Args, Debug)]
#[group(required = false, multiple = false)]
struct StageOptions {
    /// Stop after lexing
    #[arg(long)]
    lex: bool,

    /// Stop after parsing
    #[arg(long)]
    parse: bool,

    /// Stop after type checking (writes the .parsed file)
    #[arg(long)]
    typecheck: bool,

    /// Stop after RTL generation (writes the .rtl file)
    #[arg(long)]
    rtl: bool,

    /// Emit the assembly file, but do not assemble or link it
    #[arg(short = 'S')]
    s: bool,
}

/// Which stage the compiler should stop at
enum StopStage {
    Lexer,
    Parser,
    Typecheck,
    Rtl,
    Assembly,
}

impl StopStage {
    fn from_args(options: &StageOptions) -> Option<StopStage> {
        if options.lex {
            Some(StopStage::Lexer)
        } else if options.parse {
            Some(StopStage::Parser)
        } else if options.typecheck {
            Some(StopStage::Typecheck)
        } else if options.rtl {
            Some(StopStage::Rtl)
        } else if options.s {
            Some(StopStage::Assembly)
        } else {
            None
        }
    }
}

#[derive(Error, Debug)]
enum CompileErr {
    #[error("lexer encountered an error(s): {:#?}", .0)]
    Lexer(Vec<String>),
}

pub fn main() -> Result<()> {
    let args = Arguments::parse();

    let stop_stage = StopStage::from_args(&args.stage_options);

    run_driver(&args.path, &stop_stage, &args.runtime)
}

fn run_driver(path: &str, stop_stage: &Option<StopStage>, runtime: &str) -> Result<()> {
    let Some(file_root) = path.strip_suffix(".bx") else {
        bail!("bad file name: {}", path);
    };

    let source =
        read_to_string(path).with_context(|| format!("unable to read source file: {}", path))?;

    let tokens = Lexer::new(&source).tokenize();

    let (tokens, errors): (Vec<_>, Vec<_>) = tokens
        .into_iter()
        .partition(|t| t.kind != TokenType::Unknown);

    if !errors.is_empty() {
        let mut error_msgs = Vec::new();

        for err in errors {
            error_msgs.push(format!(
                "{:?} at {}:{}:{}: '{}'",
                err.value,
                path,
                err.line,
                err.col,
                &source[err.start..err.end]
            ));
        }

        return Err(CompileErr::Lexer(error_msgs).into());
    }

    if let Some(StopStage::Lexer) = stop_stage {
        return Ok(());
    }

    let mut ast = Parser::new(tokens).parse()?;

    if let Some(StopStage::Parser) = stop_stage {
        return Ok(());
    }

    typecheck::check(&mut ast)?;

    let parsed_path = format!("{}.parsed", file_root);
    ast::print_ast::debug_ast(&ast, &parsed_path)?;
    println!("{} written.", parsed_path);

    if let Some(StopStage::Typecheck) = stop_stage {
        return Ok(());
    }

    let rtl_prog = rtl::lower_program(&ast)?;

    let rtl_path = format!("{}.rtl", file_root);
    rtl::debug_rtl(&rtl_prog, &rtl_path)?;
    println!("{} written.", rtl_path);

    if let Some(StopStage::Rtl) = stop_stage {
        return Ok(());
    }

    let assm = codegen::gen_program(&rtl_prog);

    let assembly_path = format!("{}.s", file_root);
    emission::output(&assembly_path, &assm)?;
    println!("{} written.", assembly_path);

    if let Some(StopStage::Assembly) = stop_stage {
        return Ok(());
    }

    // assemble and link against the runtime
    let exe_path = format!("{}.exe", file_root);
    let output = Command::new("gcc")
        .arg("-o")
        .arg(&exe_path)
        .arg(&assembly_path)
        .arg(runtime)
        .output()
        .context("failed to execute gcc")?;

    if !output.status.success() {
        bail!(
            "gcc failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    println!("{} created.", exe_path);

    Ok(())
}
