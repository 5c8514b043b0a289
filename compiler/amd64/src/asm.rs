use crate::{Pseudo, Reg};

pub type Label = String;

/// One abstract assembly line: a representation template plus the pseudos
/// and labels it mentions.
///
/// The template may contain the following placeholders, replaced by
/// [`Asm::render`] from the parallel vectors:
///
///   `` `s0 ``, `` `s1 ``, ...  -- source pseudos (`uses`)
///   `` `d0 ``, `` `d1 ``, ...  -- destination pseudos (`defs`)
///   `` `j0 ``, `` `j1 ``, ...  -- jump labels (`jump_dests`)
///   ``` `` ```                 -- a literal backtick
#[derive(Debug, Clone)]
pub struct Asm {
    /// Pseudos that are read
    pub uses: Vec<Pseudo>,

    /// Pseudos that are written to
    pub defs: Vec<Pseudo>,

    /// Labels that are mentioned as arguments
    pub jump_dests: Vec<Label>,

    pub repr_template: String,
}

impl Asm {
    fn new(uses: Vec<Pseudo>, defs: Vec<Pseudo>, jump_dests: Vec<Label>, repr: String) -> Self {
        Self {
            uses,
            defs,
            jump_dests,
            repr_template: repr,
        }
    }

    pub fn directive(directive: &str) -> Self {
        Self::new(vec![], vec![], vec![], format!("\t{}", directive))
    }

    pub fn set_label(label: &str) -> Self {
        Self::new(vec![], vec![], vec![], format!("{}:", label))
    }

    pub fn movq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\tmovq `s0, `d0".to_string())
    }

    pub fn movq_imm(imm: i64, dest: Pseudo) -> Self {
        Self::new(vec![], vec![dest], vec![], format!("\tmovq ${}, `d0", imm))
    }

    pub fn movabsq_imm(imm: i64, dest: Pseudo) -> Self {
        Self::new(vec![], vec![dest], vec![], format!("\tmovabsq ${}, `d0", imm))
    }

    pub fn addq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\taddq `s0, `d0".to_string())
    }

    pub fn addq_imm(imm: i64, dest: Pseudo) -> Self {
        Self::new(vec![], vec![dest], vec![], format!("\taddq ${}, `d0", imm))
    }

    pub fn subq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\tsubq `s0, `d0".to_string())
    }

    pub fn subq_imm(imm: i64, dest: Pseudo) -> Self {
        Self::new(vec![], vec![dest], vec![], format!("\tsubq ${}, `d0", imm))
    }

    pub fn andq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\tandq `s0, `d0".to_string())
    }

    pub fn orq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\torq `s0, `d0".to_string())
    }

    pub fn xorq(src: Pseudo, dest: Pseudo) -> Self {
        Self::new(vec![src], vec![dest], vec![], "\txorq `s0, `d0".to_string())
    }

    pub fn cqo() -> Self {
        Self::new(
            vec![Pseudo::Reg(Reg::Rax)],
            vec![Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rdx)],
            vec![],
            "\tcqo".to_string(),
        )
    }

    pub fn imulq(factor: Pseudo) -> Self {
        Self::new(
            vec![factor, Pseudo::Reg(Reg::Rax)],
            vec![Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rdx)],
            vec![],
            "\timulq `s0".to_string(),
        )
    }

    pub fn idivq(divisor: Pseudo) -> Self {
        Self::new(
            vec![divisor, Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rdx)],
            vec![Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rdx)],
            vec![],
            "\tidivq `s0".to_string(),
        )
    }

    pub fn cmpq(arg1: Pseudo, arg2: Pseudo) -> Self {
        Self::new(
            vec![arg1, arg2],
            vec![],
            vec![],
            "\tcmpq `s0, `s1".to_string(),
        )
    }

    pub fn cmpq_imm(imm: i32, arg: Pseudo) -> Self {
        Self::new(vec![arg], vec![], vec![], format!("\tcmpq ${}, `s0", imm))
    }

    pub fn negq(arg: Pseudo) -> Self {
        Self::new(vec![arg], vec![arg], vec![], "\tnegq `s0".to_string())
    }

    pub fn notq(arg: Pseudo) -> Self {
        Self::new(vec![arg], vec![arg], vec![], "\tnotq `s0".to_string())
    }

    /// Shift `dest` left by `%cl`
    pub fn salq(dest: Pseudo) -> Self {
        Self::new(
            vec![Pseudo::Reg(Reg::Rcx)],
            vec![dest],
            vec![],
            "\tsalq %cl, `d0".to_string(),
        )
    }

    /// Arithmetic shift of `dest` right by `%cl`
    pub fn sarq(dest: Pseudo) -> Self {
        Self::new(
            vec![Pseudo::Reg(Reg::Rcx)],
            vec![dest],
            vec![],
            "\tsarq %cl, `d0".to_string(),
        )
    }

    pub fn pushq(arg: Pseudo) -> Self {
        Self::new(vec![arg], vec![], vec![], "\tpushq `s0".to_string())
    }

    pub fn popq(arg: Pseudo) -> Self {
        Self::new(vec![], vec![arg], vec![], "\tpopq `d0".to_string())
    }

    pub fn jmp(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjmp `j0".to_string())
    }

    pub fn je(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tje `j0".to_string())
    }

    pub fn jne(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjne `j0".to_string())
    }

    pub fn jl(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjl `j0".to_string())
    }

    pub fn jle(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjle `j0".to_string())
    }

    pub fn jg(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjg `j0".to_string())
    }

    pub fn jge(destination: Label) -> Self {
        Self::new(vec![], vec![], vec![destination], "\tjge `j0".to_string())
    }

    pub fn call(func: &str) -> Self {
        Self::new(
            vec![],
            vec![Pseudo::Reg(Reg::Rax)],
            vec![],
            format!("\tcall {}", func),
        )
    }

    pub fn ret() -> Self {
        Self::new(vec![], vec![], vec![], "\tret".to_string())
    }

    /// `leaq symbol(%rip), dest`
    pub fn leaq_rip(symbol: &str, dest: Pseudo) -> Self {
        Self::new(
            vec![],
            vec![dest],
            vec![],
            format!("\tleaq {}(%rip), `d0", symbol),
        )
    }

    /// `leaq offset(%rbp), dest`
    pub fn leaq_rbp(offset: i64, dest: Pseudo) -> Self {
        Self::new(
            vec![],
            vec![dest],
            vec![],
            format!("\tleaq {}(%rbp), `d0", offset),
        )
    }

    /// `movq offset(base), dest`; `base` must be register-bound
    pub fn movq_load(offset: i64, base: Pseudo, dest: Pseudo) -> Self {
        Self::new(
            vec![base],
            vec![dest],
            vec![],
            format!("\tmovq {}(`s0), `d0", displacement(offset)),
        )
    }

    /// `movq src, offset(base)`; `base` must be register-bound
    pub fn movq_store(src: Pseudo, offset: i64, base: Pseudo) -> Self {
        Self::new(
            vec![src, base],
            vec![],
            vec![],
            format!("\tmovq `s0, {}(`s1)", displacement(offset)),
        )
    }

    /// `movq symbol+offset(%rip), dest`
    pub fn movq_load_rip(symbol: &str, offset: i64, dest: Pseudo) -> Self {
        Self::new(
            vec![],
            vec![dest],
            vec![],
            format!("\tmovq {}(%rip), `d0", rip_operand(symbol, offset)),
        )
    }

    /// `movq src, symbol+offset(%rip)`
    pub fn movq_store_rip(src: Pseudo, symbol: &str, offset: i64) -> Self {
        Self::new(
            vec![src],
            vec![],
            vec![],
            format!("\tmovq `s0, {}(%rip)", rip_operand(symbol, offset)),
        )
    }

    /// Expand every placeholder in the template into concrete text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.repr_template.len());
        let mut chars = self.repr_template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '`' {
                out.push(c);
                continue;
            }

            match chars.next() {
                Some('`') => out.push('`'),
                Some(selector) if matches!(selector, 's' | 'd' | 'j') => {
                    let mut index = 0usize;
                    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                        index = index * 10 + digit as usize;
                        chars.next();
                    }

                    match selector {
                        's' => out.push_str(&self.uses[index].to_string()),
                        'd' => out.push_str(&self.defs[index].to_string()),
                        'j' => out.push_str(&self.jump_dests[index]),
                        _ => unreachable!(),
                    }
                }
                other => unreachable!("malformed template placeholder: `{:?}", other),
            }
        }

        out
    }
}

fn displacement(offset: i64) -> String {
    if offset == 0 {
        String::new()
    } else {
        offset.to_string()
    }
}

fn rip_operand(symbol: &str, offset: i64) -> String {
    if offset == 0 {
        symbol.to_string()
    } else {
        format!("{}+{}", symbol, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_source_and_dest() {
        let line = Asm::movq(Pseudo::Slot(1), Pseudo::Reg(Reg::Rax));
        assert_eq!(line.render(), "\tmovq -8(%rbp), %rax");
    }

    #[test]
    fn renders_jump_destination() {
        let line = Asm::jne(".Lmain.3".to_string());
        assert_eq!(line.render(), "\tjne .Lmain.3");
    }

    #[test]
    fn renders_literal_backtick() {
        let line = Asm {
            uses: vec![],
            defs: vec![],
            jump_dests: vec![],
            repr_template: "\t# `` not a placeholder".to_string(),
        };
        assert_eq!(line.render(), "\t# ` not a placeholder");
    }

    #[test]
    fn renders_memory_operands() {
        let load = Asm::movq_load(16, Pseudo::Reg(Reg::Rax), Pseudo::Reg(Reg::Rax));
        assert_eq!(load.render(), "\tmovq 16(%rax), %rax");

        let load = Asm::movq_load(0, Pseudo::Reg(Reg::R11), Pseudo::Reg(Reg::Rax));
        assert_eq!(load.render(), "\tmovq (%r11), %rax");

        let store = Asm::movq_store_rip(Pseudo::Reg(Reg::Rax), "counter", 0);
        assert_eq!(store.render(), "\tmovq %rax, counter(%rip)");
    }

    #[test]
    fn unbound_pseudos_render_as_holes() {
        // a later register allocator would bind these before emission
        let line = Asm::movq(Pseudo::Unbound(4), Pseudo::Reg(Reg::Rax));
        assert_eq!(line.render(), "\tmovq ?4, %rax");
    }
}
