pub use parser::{ParseError, Parser};

pub mod parser;
