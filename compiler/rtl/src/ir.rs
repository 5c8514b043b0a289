/// Defines the RTL intermediate language: a control-flow graph of labeled
/// instructions over pseudo registers.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use thiserror::Error;

use amd64::Reg;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtlError {
    #[error("repeated in-label L{0} in '{1}'")]
    RepeatedLabel(u32, String),

    #[error("global '{0}' has a non-constant initializer")]
    NonConstantInitializer(String),
}

/// An opaque name for a program point in the CFG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A virtual register, unbound to any physical location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pseudo(pub i32);

/// The "no destination" sentinel, used for procedure results
pub const DISCARD: Pseudo = Pseudo(-1);

impl Display for Pseudo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == DISCARD {
            write!(f, "##")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Fresh label and pseudo ids, scoped to one compilation unit so repeated
/// compilations of the same source are deterministic.
#[derive(Debug, Default)]
pub struct Names {
    next_label: u32,
    next_pseudo: i32,
}

impl Names {
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn fresh_pseudo(&mut self) -> Pseudo {
        let pseudo = Pseudo(self.next_pseudo);
        self.next_pseudo += 1;
        pseudo
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnopCode {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinopCode {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Sal,
    Sar,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbranchCode {
    Jz,
    Jnz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbranchCode {
    Je,
    Jl,
    Jle,
    Jg,
    Jge,
    Jne,
    Jnl,
    Jnle,
    Jng,
    Jnge,
}

/// An effective address computed by `CopyAp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// `symbol(%rip)`
    Global(String),
    /// `offset(%rbp)`; negative offsets address locals
    Frame(i64),
}

/// A memory operand for `Load`/`Store`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemRef {
    Global { symbol: String, offset: i64 },
    Reg { base: Pseudo, offset: i64 },
}

/// Every instruction carries its successor label(s); `Return` is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// dest <- imm
    Move {
        source: i64,
        dest: Pseudo,
        succ: Label,
    },
    /// dest <- src
    Copy {
        src: Pseudo,
        dest: Pseudo,
        succ: Label,
    },
    /// dest <- machine register
    CopyMp {
        src: Reg,
        dest: Pseudo,
        succ: Label,
    },
    /// machine register <- src
    CopyPm {
        src: Pseudo,
        dest: Reg,
        succ: Label,
    },
    /// dest <- effective address
    CopyAp {
        addr: Addr,
        dest: Pseudo,
        succ: Label,
    },
    /// dest <- memory
    Load {
        addr: MemRef,
        dest: Pseudo,
        succ: Label,
    },
    /// memory <- src
    Store {
        src: Pseudo,
        addr: MemRef,
        succ: Label,
    },
    /// arg <- op(arg)
    Unop {
        op: UnopCode,
        arg: Pseudo,
        succ: Label,
    },
    /// dest <- dest op src
    Binop {
        op: BinopCode,
        src: Pseudo,
        dest: Pseudo,
        succ: Label,
    },
    /// Compare arg against zero; fall through to `fail` when the test fails
    Ubranch {
        op: UbranchCode,
        arg: Pseudo,
        succ: Label,
        fail: Label,
    },
    /// Compare arg1 with arg2
    Bbranch {
        op: BbranchCode,
        arg1: Pseudo,
        arg2: Pseudo,
        succ: Label,
        fail: Label,
    },
    Goto {
        succ: Label,
    },
    /// Calling-convention call; arguments were placed by earlier
    /// `CopyPm`/`Push` instructions
    Call {
        func: String,
        nargs: usize,
        succ: Label,
    },
    Return,
    /// Prologue marker: `size` bytes of frame storage for memory-backed
    /// variables
    NewFrame {
        size: i64,
        succ: Label,
    },
    /// Epilogue marker
    DelFrame {
        succ: Label,
    },
    /// dest <- stack-passed parameter `slot` (1-based)
    LoadParam {
        slot: usize,
        dest: Pseudo,
        succ: Label,
    },
    Push {
        src: Pseudo,
        succ: Label,
    },
    Pop {
        dest: Pseudo,
        succ: Label,
    },
}

impl Instr {
    pub fn successors(&self) -> Vec<Label> {
        match self {
            Instr::Return => vec![],
            Instr::Move { succ, .. }
            | Instr::Copy { succ, .. }
            | Instr::CopyMp { succ, .. }
            | Instr::CopyPm { succ, .. }
            | Instr::CopyAp { succ, .. }
            | Instr::Load { succ, .. }
            | Instr::Store { succ, .. }
            | Instr::Unop { succ, .. }
            | Instr::Binop { succ, .. }
            | Instr::Goto { succ }
            | Instr::Call { succ, .. }
            | Instr::NewFrame { succ, .. }
            | Instr::DelFrame { succ }
            | Instr::LoadParam { succ, .. }
            | Instr::Push { succ, .. }
            | Instr::Pop { succ, .. } => vec![*succ],
            Instr::Ubranch { succ, fail, .. } | Instr::Bbranch { succ, fail, .. } => {
                vec![*succ, *fail]
            }
        }
    }
}

/// A procedure or function in RTL form
#[derive(Debug)]
pub struct Callable {
    pub name: String,
    pub enter: Label,
    pub leave: Label,
    pub input_regs: Vec<Pseudo>,
    pub output_reg: Pseudo,
    pub body: HashMap<Label, Instr>,
    /// The order in which the labels are scheduled
    pub schedule: Vec<Label>,
}

impl Callable {
    pub fn new(name: &str, enter: Label, leave: Label) -> Self {
        Self {
            name: name.to_string(),
            enter,
            leave,
            input_regs: vec![],
            output_reg: DISCARD,
            body: HashMap::new(),
            schedule: vec![],
        }
    }

    /// Install `instr` at `label`. Two instructions at one label indicate a
    /// bug in the lowerer and are rejected.
    pub fn add_instr(&mut self, label: Label, instr: Instr) -> Result<(), RtlError> {
        if self.body.contains_key(&label) {
            return Err(RtlError::RepeatedLabel(label.0, self.name.clone()));
        }

        self.schedule.push(label);
        self.body.insert(label, instr);

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDef {
    pub name: String,
    pub init: i64,
    pub offset: i64,
    pub size: i64,
}

#[derive(Debug, Default)]
pub struct Program {
    pub globals: Vec<GlobalDef>,
    pub callables: Vec<Callable>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_label_is_rejected() {
        let mut names = Names::default();
        let enter = names.fresh_label();
        let leave = names.fresh_label();
        let mut callable = Callable::new("f", enter, leave);

        let dest = names.fresh_pseudo();
        callable
            .add_instr(
                enter,
                Instr::Move {
                    source: 1,
                    dest,
                    succ: leave,
                },
            )
            .unwrap();

        let result = callable.add_instr(
            enter,
            Instr::Move {
                source: 2,
                dest,
                succ: leave,
            },
        );

        assert_eq!(result, Err(RtlError::RepeatedLabel(0, "f".to_string())));
    }

    #[test]
    fn discard_prints_as_double_hash() {
        assert_eq!(DISCARD.to_string(), "##");
        assert_eq!(Pseudo(4).to_string(), "#4");
        assert_eq!(Label(3).to_string(), "L3");
    }
}
