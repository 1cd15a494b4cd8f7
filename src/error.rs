//! Error kinds shared by the lexer, compiler and VM.
//!
//! This language has no user-facing exception mechanism: a compile
//! error performs a single non-local exit back to the compile driver,
//! and a runtime error terminates the current module without running
//! remaining defers. Both are represented here as plain values rather
//! than panics.

use crate::common::SourcePos;
use thiserror::Error;

/// Every error the core can produce, grouped lexical, parse, semantic,
/// runtime and internal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // -- Lexical --------------------------------------------------------
    #[error("invalid UTF-8 in source")]
    InvalidUtf8,
    #[error("invalid number literal")]
    InvalidNumberLiteral,
    #[error("unclosed string literal")]
    UnterminatedString,
    #[error("invalid escape sequence in string literal")]
    InvalidEscapeSequence,
    #[error("identifier exceeds the maximum length")]
    IdentifierTooLong,

    // -- Parse ------------------------------------------------------------
    #[error("unexpected token")]
    UnexpectedToken,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("missing expected token")]
    MissingToken,
    #[error("expected an assignable expression")]
    ExpectedLvalue,
    #[error("return statement's value count is inconsistent with earlier returns")]
    InconsistentReturnArity,
    #[error("cannot return a value from inside a defer block")]
    ReturnValueInDefer,
    #[error("defer blocks cannot be nested")]
    NestedDefer,
    #[error("export is only allowed at module top level")]
    ExportOutsideTopLevel,
    #[error("struct declarations are not supported")]
    StructUnsupported,
    #[error("import statements are not supported")]
    ImportUnsupported,
    #[error("raise is not supported")]
    RaiseUnsupported,
    #[error("type identifiers are not supported")]
    TypeIdentifierUnsupported,
    #[error("field access is not supported")]
    FieldAccessUnsupported,

    // -- Semantic -----------------------------------------------------
    #[error("use of an uninitialised variable")]
    UninitialisedVariable,
    #[error("variable is already defined in this scope")]
    VariableAlreadyDefined,
    #[error("too many local variables in this function")]
    TooManyLocals,
    #[error("too many upvalues captured by this function")]
    TooManyUpvalues,
    #[error("too many arguments in this call")]
    TooManyArguments,
    #[error("too many constants in this module")]
    TooManyConstants,
    #[error("too many module-level variables")]
    TooManyModuleVars,
    #[error("too many host-registered global variables")]
    TooManyGlobalVars,
    #[error("function body exceeds the maximum instruction count")]
    TooManyInstructions,
    #[error("brackets are nested too deeply")]
    BracketsNestedTooDeeply,
    #[error("cannot assign to a read-only host global")]
    AssignToHostGlobal,

    // -- Runtime --------------------------------------------------------
    #[error("operand has an unexpected type")]
    UnexpectedType,
    #[error("division by zero")]
    DivideByZero,
    #[error("wrong number of arguments for this call")]
    ArgumentCountMismatch,
    #[error("invalid instruction")]
    InvalidInstruction,
    #[error("invalid program counter")]
    InvalidProgramCounter,
    #[error("stack overflow")]
    StackOverflow,
    #[error("function did not return a value it declared")]
    MissingReturnValue,
    #[error("module not found")]
    ModuleNotFound,
    #[error("memory allocation failed")]
    AllocationFailure,
    #[error("garbage collector allocation limit reached")]
    AllocationLimitReached,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("key not found")]
    KeyNotFound,

    // -- Internal -------------------------------------------------------
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

/// A compile or runtime error, with the source location when one is
/// known. Compile errors always have one; runtime errors do not track
/// source positions since the compiler does not currently embed a
/// line table in the chunk.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}{}", .pos.map(|p| format!(" at {p}")).unwrap_or_default())]
pub struct SemiError {
    pub kind: ErrorKind,
    pub pos: Option<SourcePos>,
}

impl SemiError {
    pub fn new(kind: ErrorKind) -> Self {
        SemiError { kind, pos: None }
    }

    pub fn at(kind: ErrorKind, pos: SourcePos) -> Self {
        SemiError {
            kind,
            pos: Some(pos),
        }
    }
}

impl From<ErrorKind> for SemiError {
    fn from(kind: ErrorKind) -> Self {
        SemiError::new(kind)
    }
}

pub type SemiResult<T> = Result<T, SemiError>;
