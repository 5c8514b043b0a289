/// Translates the RTL of one callable into abstract assembly, one
/// instruction at a time.

use std::collections::HashMap;

use amd64::{Asm, Pseudo, Reg};
use rtl::{Addr, BbranchCode, BinopCode, Instr, MemRef, UbranchCode, UnopCode};

/// Compile one callable, following its schedule, and wrap the result in the
/// function prologue and epilogue.
pub fn compile_callable(callable: &rtl::Callable) -> Vec<Asm> {
    let mut compiler = InstrCompiler::new(&callable.name, frame_size(callable));

    for label in &callable.schedule {
        compiler.append_label(*label);
        compiler.compile(&callable.body[label]);
    }

    compiler.finalize()
}

/// The frame bytes reserved by the lowering, read off the NewFrame marker.
/// Needed up front: stack-slot numbering starts past this region.
fn frame_size(callable: &rtl::Callable) -> i64 {
    callable
        .body
        .values()
        .find_map(|instr| match instr {
            Instr::NewFrame { size, .. } => Some(*size),
            _ => None,
        })
        .unwrap_or(0)
}

struct InstrCompiler<'a> {
    funcname: &'a str,
    exit_label: String,
    frame_size: i64,
    /// Lazy one-way mapping from RTL pseudos to slot-bound assembly pseudos
    rmap: HashMap<i32, Pseudo>,
    body: Vec<Asm>,
}

impl<'a> InstrCompiler<'a> {
    fn new(funcname: &'a str, frame_size: i64) -> Self {
        Self {
            funcname,
            exit_label: format!(".L{}.exit", funcname),
            frame_size,
            rmap: HashMap::new(),
            body: vec![],
        }
    }

    fn lookup(&mut self, r: rtl::Pseudo) -> Pseudo {
        let next_slot = (self.frame_size / 8) as i32 + self.rmap.len() as i32 + 1;
        *self.rmap.entry(r.0).or_insert(Pseudo::Slot(next_slot))
    }

    fn label_translate(&self, label: rtl::Label) -> String {
        format!(".L{}.{}", self.funcname, label.0)
    }

    fn append(&mut self, line: Asm) {
        self.body.push(line);
    }

    fn append_jmp(&mut self, label: rtl::Label) {
        let dest = self.label_translate(label);
        self.append(Asm::jmp(dest));
    }

    /// Emit a local label, dropping an immediately preceding `jmp` to it.
    fn append_label(&mut self, label: rtl::Label) {
        let label = self.label_translate(label);

        if let Some(last) = self.body.last() {
            if last.repr_template.starts_with("\tjmp") && last.jump_dests.first() == Some(&label)
            {
                self.body.pop();
            }
        }

        self.append(Asm::set_label(&label));
    }

    fn compile(&mut self, instr: &Instr) {
        match instr {
            Instr::Move { source, dest, succ } => {
                let dest = self.lookup(*dest);
                if *source < i32::MIN as i64 || *source > i32::MAX as i64 {
                    self.append(Asm::movabsq_imm(*source, dest));
                } else {
                    self.append(Asm::movq_imm(*source, dest));
                }
                self.append_jmp(*succ);
            }
            Instr::Copy { src, dest, succ } => {
                let src = self.lookup(*src);
                let dest = self.lookup(*dest);
                // through %rax: both sides are stack slots
                self.append(Asm::movq(src, Pseudo::Reg(Reg::Rax)));
                self.append(Asm::movq(Pseudo::Reg(Reg::Rax), dest));
                self.append_jmp(*succ);
            }
            Instr::CopyMp { src, dest, succ } => {
                let dest = self.lookup(*dest);
                self.append(Asm::movq(Pseudo::Reg(*src), dest));
                self.append_jmp(*succ);
            }
            Instr::CopyPm { src, dest, succ } => {
                let src = self.lookup(*src);
                self.append(Asm::movq(src, Pseudo::Reg(*dest)));
                self.append_jmp(*succ);
            }
            Instr::CopyAp { addr, dest, succ } => {
                let dest = self.lookup(*dest);
                match addr {
                    Addr::Global(symbol) => {
                        self.append(Asm::leaq_rip(symbol, Pseudo::Reg(Reg::Rax)));
                    }
                    Addr::Frame(offset) => {
                        self.append(Asm::leaq_rbp(*offset, Pseudo::Reg(Reg::Rax)));
                    }
                }
                self.append(Asm::movq(Pseudo::Reg(Reg::Rax), dest));
                self.append_jmp(*succ);
            }
            Instr::Load { addr, dest, succ } => {
                let dest = self.lookup(*dest);
                match addr {
                    MemRef::Global { symbol, offset } => {
                        self.append(Asm::movq_load_rip(symbol, *offset, Pseudo::Reg(Reg::Rax)));
                    }
                    MemRef::Reg { base, offset } => {
                        let base = self.lookup(*base);
                        self.append(Asm::movq(base, Pseudo::Reg(Reg::Rax)));
                        self.append(Asm::movq_load(
                            *offset,
                            Pseudo::Reg(Reg::Rax),
                            Pseudo::Reg(Reg::Rax),
                        ));
                    }
                }
                self.append(Asm::movq(Pseudo::Reg(Reg::Rax), dest));
                self.append_jmp(*succ);
            }
            Instr::Store { src, addr, succ } => {
                let src = self.lookup(*src);
                match addr {
                    MemRef::Global { symbol, offset } => {
                        self.append(Asm::movq(src, Pseudo::Reg(Reg::Rax)));
                        self.append(Asm::movq_store_rip(Pseudo::Reg(Reg::Rax), symbol, *offset));
                    }
                    MemRef::Reg { base, offset } => {
                        let base = self.lookup(*base);
                        self.append(Asm::movq(base, Pseudo::Reg(Reg::R11)));
                        self.append(Asm::movq(src, Pseudo::Reg(Reg::Rax)));
                        self.append(Asm::movq_store(
                            Pseudo::Reg(Reg::Rax),
                            *offset,
                            Pseudo::Reg(Reg::R11),
                        ));
                    }
                }
                self.append_jmp(*succ);
            }
            Instr::Unop { op, arg, succ } => {
                let arg = self.lookup(*arg);
                match op {
                    UnopCode::Neg => self.append(Asm::negq(arg)),
                    UnopCode::Not => self.append(Asm::notq(arg)),
                }
                self.append_jmp(*succ);
            }
            Instr::Binop {
                op,
                src,
                dest,
                succ,
            } => {
                self.compile_binop(*op, *src, *dest);
                self.append_jmp(*succ);
            }
            Instr::Ubranch {
                op,
                arg,
                succ,
                fail,
            } => {
                let arg = self.lookup(*arg);
                self.append(Asm::cmpq_imm(0, arg));
                let taken = self.label_translate(*succ);
                match op {
                    UbranchCode::Jz => self.append(Asm::je(taken)),
                    UbranchCode::Jnz => self.append(Asm::jne(taken)),
                }
                self.append_jmp(*fail);
            }
            Instr::Bbranch {
                op,
                arg1,
                arg2,
                succ,
                fail,
            } => {
                let arg1 = self.lookup(*arg1);
                let arg2 = self.lookup(*arg2);
                self.append(Asm::movq(arg1, Pseudo::Reg(Reg::Rcx)));
                self.append(Asm::movq(arg2, Pseudo::Reg(Reg::Rax)));
                self.append(Asm::cmpq(Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rcx)));

                // jump to `fail` on the negated condition, fall through to
                // `succ`
                let fail_label = self.label_translate(*fail);
                let line = match op {
                    BbranchCode::Je => Asm::jne(fail_label),
                    BbranchCode::Jne => Asm::je(fail_label),
                    BbranchCode::Jl | BbranchCode::Jnge => Asm::jge(fail_label),
                    BbranchCode::Jle | BbranchCode::Jng => Asm::jg(fail_label),
                    BbranchCode::Jg | BbranchCode::Jnle => Asm::jle(fail_label),
                    BbranchCode::Jge | BbranchCode::Jnl => Asm::jl(fail_label),
                };
                self.append(line);
                self.append_jmp(*succ);
            }
            Instr::Goto { succ } => {
                self.append_jmp(*succ);
            }
            Instr::Call { func, nargs, succ } => {
                self.append(Asm::call(func));

                // pop the (padded) stack arguments placed by Push
                if *nargs > 6 {
                    let nstack = (*nargs - 6) as i64;
                    let padded = nstack + nstack % 2;
                    self.append(Asm::addq_imm(8 * padded, Pseudo::Reg(Reg::Rsp)));
                }

                self.append_jmp(*succ);
            }
            Instr::Return => {
                self.append(Asm::jmp(self.exit_label.clone()));
            }
            Instr::NewFrame { .. } => {
                // frame allocation is part of the prologue; nothing to emit
            }
            Instr::DelFrame { succ } => {
                // teardown happens at the exit label
                self.append_jmp(*succ);
            }
            Instr::LoadParam { slot, dest, succ } => {
                let dest = self.lookup(*dest);
                // slot 1 sits just above the saved %rbp and return address
                let offset = 8 + 8 * *slot as i64;
                self.append(Asm::movq_load(
                    offset,
                    Pseudo::Reg(Reg::Rbp),
                    Pseudo::Reg(Reg::Rax),
                ));
                self.append(Asm::movq(Pseudo::Reg(Reg::Rax), dest));
                self.append_jmp(*succ);
            }
            Instr::Push { src, succ } => {
                let src = self.lookup(*src);
                self.append(Asm::movq(src, Pseudo::Reg(Reg::Rax)));
                self.append(Asm::pushq(Pseudo::Reg(Reg::Rax)));
                self.append_jmp(*succ);
            }
            Instr::Pop { dest, succ } => {
                let dest = self.lookup(*dest);
                self.append(Asm::popq(Pseudo::Reg(Reg::Rax)));
                self.append(Asm::movq(Pseudo::Reg(Reg::Rax), dest));
                self.append_jmp(*succ);
            }
        }
    }

    fn compile_binop(&mut self, op: BinopCode, src: rtl::Pseudo, dest: rtl::Pseudo) {
        let src = self.lookup(src);
        let dest = self.lookup(dest);
        let rax = Pseudo::Reg(Reg::Rax);

        match op {
            BinopCode::Add | BinopCode::Sub | BinopCode::And | BinopCode::Or | BinopCode::Xor => {
                self.append(Asm::movq(dest, rax));
                let line = match op {
                    BinopCode::Add => Asm::addq(src, rax),
                    BinopCode::Sub => Asm::subq(src, rax),
                    BinopCode::And => Asm::andq(src, rax),
                    BinopCode::Or => Asm::orq(src, rax),
                    _ => Asm::xorq(src, rax),
                };
                self.append(line);
                self.append(Asm::movq(rax, dest));
            }
            BinopCode::Mul => {
                self.append(Asm::movq(dest, rax));
                self.append(Asm::imulq(src));
                self.append(Asm::movq(rax, dest));
            }
            BinopCode::Div => {
                self.append(Asm::movq(dest, rax));
                self.append(Asm::cqo());
                self.append(Asm::idivq(src));
                self.append(Asm::movq(rax, dest));
            }
            BinopCode::Rem => {
                self.append(Asm::movq(dest, rax));
                self.append(Asm::cqo());
                self.append(Asm::idivq(src));
                self.append(Asm::movq(Pseudo::Reg(Reg::Rdx), dest));
            }
            BinopCode::Sal => {
                self.append(Asm::movq(src, Pseudo::Reg(Reg::Rcx)));
                self.append(Asm::salq(dest));
            }
            BinopCode::Sar => {
                self.append(Asm::movq(src, Pseudo::Reg(Reg::Rcx)));
                self.append(Asm::sarq(dest));
            }
        }
    }

    fn finalize(self) -> Vec<Asm> {
        let mut prog = vec![];

        prog.push(Asm::directive(&format!(".globl {}", self.funcname)));
        prog.push(Asm::directive(".section .text"));
        prog.push(Asm::set_label(self.funcname));

        // frame storage plus one 8-byte slot per pseudo, kept 16-byte
        // aligned so calls into libc stay ABI-conformant
        let total = round_up_16(self.frame_size + 8 * self.rmap.len() as i64);
        if total > 0 {
            prog.push(Asm::pushq(Pseudo::Reg(Reg::Rbp)));
            prog.push(Asm::movq(Pseudo::Reg(Reg::Rsp), Pseudo::Reg(Reg::Rbp)));
            prog.push(Asm::subq_imm(total, Pseudo::Reg(Reg::Rsp)));
        }

        let exit_label = self.exit_label.clone();
        prog.extend(self.body);

        prog.push(Asm::set_label(&exit_label));
        if total > 0 {
            prog.push(Asm::movq(Pseudo::Reg(Reg::Rbp), Pseudo::Reg(Reg::Rsp)));
            prog.push(Asm::popq(Pseudo::Reg(Reg::Rbp)));
        }
        prog.push(Asm::ret());

        prog
    }
}

fn round_up_16(bytes: i64) -> i64 {
    (bytes + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtl::{Instr, Names};

    fn single_instr_callable(make: impl FnOnce(&mut Names, rtl::Label) -> Instr) -> rtl::Callable {
        let mut names = Names::default();
        let enter = names.fresh_label();
        let leave = names.fresh_label();
        let mut callable = rtl::Callable::new("f", enter, leave);

        let instr = make(&mut names, leave);
        callable.add_instr(enter, instr).unwrap();
        callable.add_instr(leave, Instr::Return).unwrap();

        callable
    }

    fn rendered(callable: &rtl::Callable) -> Vec<String> {
        compile_callable(callable).iter().map(Asm::render).collect()
    }

    #[test]
    fn int64_min_uses_movabsq() {
        let callable = single_instr_callable(|names, leave| Instr::Move {
            source: i64::MIN,
            dest: names.fresh_pseudo(),
            succ: leave,
        });

        let lines = rendered(&callable);
        assert!(lines
            .iter()
            .any(|l| l.contains("movabsq $-9223372036854775808")));
    }

    #[test]
    fn small_immediates_use_movq() {
        let callable = single_instr_callable(|names, leave| Instr::Move {
            source: 42,
            dest: names.fresh_pseudo(),
            succ: leave,
        });

        let lines = rendered(&callable);
        assert!(lines.iter().any(|l| l.contains("movq $42,")));
        assert!(!lines.iter().any(|l| l.contains("movabsq")));
    }

    #[test]
    fn jmp_to_next_label_is_elided() {
        // enter: goto leave; leave: return  -- the jmp is redundant
        let callable = single_instr_callable(|_, leave| Instr::Goto { succ: leave });

        let lines = rendered(&callable);
        assert!(
            !lines.iter().any(|l| l == "\tjmp .Lf.1"),
            "redundant jmp survived: {:?}",
            lines
        );
    }

    #[test]
    fn jmp_to_a_distant_label_is_kept() {
        let mut names = Names::default();
        let enter = names.fresh_label();
        let leave = names.fresh_label();
        let mut callable = rtl::Callable::new("f", enter, leave);

        let middle = names.fresh_label();
        let dest = names.fresh_pseudo();
        // enter jumps straight to leave, past the middle block
        callable
            .add_instr(enter, Instr::Goto { succ: leave })
            .unwrap();
        callable
            .add_instr(
                middle,
                Instr::Move {
                    source: 1,
                    dest,
                    succ: leave,
                },
            )
            .unwrap();
        callable.add_instr(leave, Instr::Return).unwrap();

        let lines = rendered(&callable);
        assert!(lines.iter().any(|l| l == "\tjmp .Lf.1"));
    }

    #[test]
    fn slot_numbering_starts_past_the_frame_region() {
        let mut names = Names::default();
        let enter = names.fresh_label();
        let leave = names.fresh_label();
        let mut callable = rtl::Callable::new("f", enter, leave);

        let body_entry = names.fresh_label();
        let dest = names.fresh_pseudo();
        callable
            .add_instr(
                enter,
                Instr::NewFrame {
                    size: 16,
                    succ: body_entry,
                },
            )
            .unwrap();
        callable
            .add_instr(
                body_entry,
                Instr::Move {
                    source: 7,
                    dest,
                    succ: leave,
                },
            )
            .unwrap();
        callable.add_instr(leave, Instr::Return).unwrap();

        let lines = rendered(&callable);
        // 16 frame bytes are slots 1..2, so the first pseudo lands in slot 3
        assert!(lines.iter().any(|l| l.contains("movq $7, -24(%rbp)")));
        // 16 + 8 rounded up to 16-byte alignment
        assert!(lines.iter().any(|l| l.contains("subq $32, %rsp")));
    }

    #[test]
    fn no_placeholder_survives_rendering() {
        let src = "fun f(x : int64) : int64 { return x * 2; }
                   proc main() {
                       var a = alloc int64[2] : int64*;
                       a[0] = f(21);
                       print a[0];
                   }";
        let tokens = lexer::Lexer::new(src).tokenize();
        let mut program = parser::Parser::new(tokens).parse().unwrap();
        typecheck::check(&mut program).unwrap();
        let rtl_prog = rtl::lower_program(&program).unwrap();

        for callable in &rtl_prog.callables {
            for line in compile_callable(callable) {
                let text = line.render();
                assert!(!text.contains('`'), "unresolved placeholder in {:?}", text);
            }
        }
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let src = "proc main() { var x = 3 : int64; while (x > 0) { print x; x = x - 1; } }";

        let compile = || {
            let tokens = lexer::Lexer::new(src).tokenize();
            let mut program = parser::Parser::new(tokens).parse().unwrap();
            typecheck::check(&mut program).unwrap();
            let rtl_prog = rtl::lower_program(&program).unwrap();
            rtl_prog
                .callables
                .iter()
                .flat_map(|c| compile_callable(c))
                .map(|l| l.render())
                .collect::<Vec<_>>()
        };

        assert_eq!(compile(), compile());
    }
}
