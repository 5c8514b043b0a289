pub use check::{check, TypeChecker};
pub use ty_err::TypeError;

pub mod check;
pub mod ty_err;
