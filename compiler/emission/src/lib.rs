pub use emission::{output, write_program};

pub mod emission;
