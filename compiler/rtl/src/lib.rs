pub use ir::*;
pub use lower::lower_program;
pub use print::{debug_rtl, write_rtl};

pub mod ir;
pub mod lower;
pub mod print;
