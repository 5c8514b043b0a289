use std::fmt::{Display, Formatter};

use crate::Reg;

pub type StackSlot = i32;

/// An assembly-level pseudo register. Unbound pseudos are left for a later
/// register allocator; this compiler binds every pseudo it creates to either
/// a machine register or a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pseudo {
    Unbound(i32),
    Reg(Reg),
    /// Stack slot `k` lives at `-8k(%rbp)`
    Slot(StackSlot),
}

impl Display for Pseudo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Pseudo::Unbound(id) => write!(f, "?{}", id),
            Pseudo::Reg(reg) => write!(f, "{}", reg),
            Pseudo::Slot(slot) => write!(f, "-{}(%rbp)", 8 * slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_rendering() {
        assert_eq!(Pseudo::Slot(3).to_string(), "-24(%rbp)");
        assert_eq!(Pseudo::Reg(Reg::Rax).to_string(), "%rax");
        assert_eq!(Pseudo::Unbound(7).to_string(), "?7");
    }
}
