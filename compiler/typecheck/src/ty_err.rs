use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TypeError {
    #[error("undeclared variable '{0}'")]
    UndeclaredVariable(String),

    #[error("undefined callable '{0}'")]
    UndefinedCallable(String),

    #[error("no 'main' procedure")]
    MissingMain,

    #[error("'main' must be a procedure without parameters")]
    BadMainSignature,

    #[error("expression is not assignable")]
    BadLValue,

    #[error("type mismatch: expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },

    #[error("duplicate definition of '{0}'")]
    Duplicate(String),

    #[error("global '{0}' must have scalar type")]
    NonScalarGlobal(String),

    #[error("parameter '{0}' must have scalar type")]
    NonScalarParam(String),

    #[error("function '{0}' must return a scalar type")]
    NonScalarReturn(String),

    #[error("wrong number of arguments to '{func}': expected {expected}, found {found}")]
    ArityMismatch {
        func: String,
        expected: usize,
        found: usize,
    },

    #[error("cannot infer a pointer type for 'null' here")]
    UntypedNull,

    #[error("procedure '{0}' used as a value")]
    ProcAsValue(String),

    #[error("'return' with a value in procedure '{0}'")]
    ReturnValueInProc(String),

    #[error("'return' without a value in function '{0}'")]
    MissingReturnValue(String),
}
