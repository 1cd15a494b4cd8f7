//! Small shared types used across the lexer, compiler and VM.

/// A monotonically assigned id for an interned identifier. Reserved ids
/// below [`FIRST_USER_SYMBOL_ID`] are set aside for keywords and other
/// built-in bindings so user identifiers never collide with them.
pub type IdentifierId = u32;

/// Highest identifier id reserved for internal use before user
/// identifiers start being interned.
pub const MAX_RESERVED_IDENTIFIER_ID: IdentifierId = 255;
pub const FIRST_USER_SYMBOL_ID: IdentifierId = MAX_RESERVED_IDENTIFIER_ID + 1;

/// Identifies a compiled module within a VM instance.
pub type ModuleId = u32;

/// Index into a module's dict of exports or globals, disambiguated by the
/// `s` flag carried alongside on every instruction operand.
pub type ModuleVariableId = u16;

/// Index into a function prototype's constant table.
pub type ConstantId = u16;

/// A 0-based register index within a frame.
pub type RegisterId = u8;

/// Source location used for compiler diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub const fn start() -> Self {
        SourcePos { line: 1, column: 1 }
    }
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}
