//! Compiler scopes: variable bindings, register allocation, and the
//! per-function bookkeeping the parser threads through every emitter.
//!
//! Two scope levels nest: a [`FunctionScope`] owns the chunk currently
//! being emitted into plus a stack of [`BlockScope`]s for `{ }` bodies,
//! `if`/`for` bodies, and the function body itself. Variables allocated
//! in a block occupy the low end of the register file; temporaries
//! spill into whatever is left above them. Leaving a block just rewinds
//! `next_register` back to what it was on entry, which is also how
//! temporaries get reclaimed without an explicit free.

use crate::bytecode::Chunk;
use crate::common::{IdentifierId, ModuleId, RegisterId};
use crate::value::object::UpvalueDesc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Normal,
    Loop,
    If,
    Fn,
}

/// `(identifierId, registerId)`: a declared local binding, live for as
/// long as the block that declared it.
#[derive(Clone, Copy, Debug)]
pub struct Variable {
    pub identifier_id: IdentifierId,
    pub register: RegisterId,
}

/// A `{ }`-delimited lexical region within one function. `variables_start`
/// and `variables_end` index into the owning [`FunctionScope`]'s flat
/// `variables` list; they describe which declarations are visible while
/// this block is the innermost one.
pub struct BlockScope {
    pub variables_start: usize,
    pub variables_end: usize,
    pub tag: BlockTag,
    pub parent: Option<usize>,
    /// `next_register` as it stood when this block was entered; restored
    /// on exit so the block's locals and any temporaries it spilled are
    /// both reclaimed in one step.
    saved_next_register: RegisterId,
    /// Instruction index of the loop top, used by `continue`. Only set
    /// for `Loop`-tagged blocks.
    pub loop_top: Option<usize>,
    /// Chunk positions of `break`'s placeholder `JUMP`s, patched to the
    /// loop's exit once the loop body is fully compiled.
    pub break_patches: Vec<usize>,
    /// Register holding the loop's iterator/index state, closed by
    /// `ITER_NEXT` and by any `break`/`continue` that leaves the loop.
    pub loop_base_register: Option<RegisterId>,
}

/// One function body's compilation state: its chunk-in-progress, block
/// stack, register allocator, upvalue list, and inferred coarity.
pub struct FunctionScope {
    pub blocks: Vec<BlockScope>,
    pub variables: Vec<Variable>,
    pub chunk: Chunk,
    pub upvalues: Vec<UpvalueDesc>,
    /// Parallel to `upvalues`: the identifier each upvalue resolves to,
    /// used to deduplicate repeated captures of the same name.
    pub upvalue_names: Vec<IdentifierId>,
    pub next_register: RegisterId,
    pub max_used_register: RegisterId,
    pub arity: u8,
    /// `None` until the first `return` is compiled; after that, a fixed
    /// 0 or 1 every subsequent `return` in this function must match.
    pub n_returns: Option<u8>,
    pub in_defer: bool,
    pub module_id: ModuleId,
    /// `true` for the module's own init function, where top-level
    /// declarations become module variables instead of registers.
    pub is_module_level: bool,
}

impl FunctionScope {
    pub fn new(module_id: ModuleId, arity: u8, is_module_level: bool) -> Self {
        let mut scope = FunctionScope {
            blocks: Vec::new(),
            variables: Vec::new(),
            chunk: Chunk::new(),
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            next_register: 0,
            max_used_register: 0,
            arity,
            n_returns: None,
            in_defer: false,
            module_id,
            is_module_level,
        };
        scope.blocks.push(BlockScope {
            variables_start: 0,
            variables_end: 0,
            tag: BlockTag::Fn,
            parent: None,
            saved_next_register: 0,
            loop_top: None,
            break_patches: Vec::new(),
            loop_base_register: None,
        });
        scope
    }

    pub fn current_block(&self) -> &BlockScope {
        self.blocks.last().expect("function scope always has a root block")
    }

    pub fn current_block_mut(&mut self) -> &mut BlockScope {
        self.blocks.last_mut().expect("function scope always has a root block")
    }

    pub fn enter_block(&mut self, tag: BlockTag) {
        let parent_end = self.current_block().variables_end;
        let saved = self.next_register;
        self.blocks.push(BlockScope {
            variables_start: parent_end,
            variables_end: parent_end,
            tag,
            parent: Some(self.blocks.len() - 1),
            saved_next_register: saved,
            loop_top: None,
            break_patches: Vec::new(),
            loop_base_register: None,
        });
    }

    /// Leave the innermost block, restoring the register watermark its
    /// parent had on entry. Returns the finished block so the caller can
    /// patch its `break` list (loops) or inspect its tag.
    pub fn exit_block(&mut self) -> BlockScope {
        let block = self.blocks.pop().expect("exit_block without a matching enter_block");
        self.variables.truncate(block.variables_start);
        self.next_register = block.saved_next_register;
        block
    }

    /// Reserve the next free register, tracking the function's
    /// high-water mark. Returns `None` once the 256-register space is
    /// exhausted.
    pub fn alloc_register(&mut self) -> Option<RegisterId> {
        let reg = self.next_register;
        self.next_register = self.next_register.checked_add(1)?;
        self.max_used_register = self.max_used_register.max(self.next_register);
        Some(reg)
    }

    /// Reserve `count` consecutive registers (used for call argument
    /// lists and range literals), returning the base register.
    pub fn alloc_registers(&mut self, count: u8) -> Option<RegisterId> {
        let base = self.next_register;
        self.next_register = self.next_register.checked_add(count)?;
        self.max_used_register = self.max_used_register.max(self.next_register);
        Some(base)
    }

    /// Release every temporary above `mark`. Used after an expression
    /// whose intermediate registers are no longer needed, without
    /// touching the declared-variable prefix.
    pub fn release_to(&mut self, mark: RegisterId) {
        self.next_register = mark;
    }

    /// Declare a new local variable in the current block, occupying the
    /// next free register. Fails if the identifier is already declared
    /// and visible in this block.
    pub fn declare_local(&mut self, identifier_id: IdentifierId) -> Option<RegisterId> {
        if self.resolve_local(identifier_id).is_some() && self.is_defined_in_current_block(identifier_id) {
            return None;
        }
        let register = self.alloc_register()?;
        self.variables.push(Variable { identifier_id, register });
        self.current_block_mut().variables_end = self.variables.len();
        Some(register)
    }

    fn is_defined_in_current_block(&self, identifier_id: IdentifierId) -> bool {
        let block = self.current_block();
        self.variables[block.variables_start..block.variables_end]
            .iter()
            .any(|v| v.identifier_id == identifier_id)
    }

    /// Search outward from the innermost block for a local with this
    /// identifier, returning its register if found anywhere in the
    /// current function (not crossing into an enclosing function).
    pub fn resolve_local(&self, identifier_id: IdentifierId) -> Option<RegisterId> {
        let mut block_idx = Some(self.blocks.len() - 1);
        while let Some(idx) = block_idx {
            let block = &self.blocks[idx];
            if let Some(v) = self.variables[block.variables_start..block.variables_end]
                .iter()
                .rev()
                .find(|v| v.identifier_id == identifier_id)
            {
                return Some(v.register);
            }
            block_idx = block.parent;
        }
        None
    }

    /// Innermost enclosing `Loop` block, if any, searching outward but
    /// stopping at the function boundary (loops never span functions).
    pub fn innermost_loop(&self) -> Option<usize> {
        let mut block_idx = Some(self.blocks.len() - 1);
        while let Some(idx) = block_idx {
            if self.blocks[idx].tag == BlockTag::Loop {
                return Some(idx);
            }
            block_idx = self.blocks[idx].parent;
        }
        None
    }

    /// Append a new upvalue descriptor, or return the index of an
    /// existing one that already captures the same identifier.
    pub fn add_upvalue(&mut self, identifier_id: IdentifierId, desc: UpvalueDesc) -> Option<u8> {
        if let Some(existing) = self.upvalue_names.iter().position(|&id| id == identifier_id) {
            return Some(existing as u8);
        }
        if self.upvalues.len() >= u8::MAX as usize {
            return None;
        }
        self.upvalues.push(desc);
        self.upvalue_names.push(identifier_id);
        Some((self.upvalues.len() - 1) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_local_allocates_consecutive_registers() {
        let mut scope = FunctionScope::new(0, 0, false);
        let a = scope.declare_local(1).unwrap();
        let b = scope.declare_local(2).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(scope.resolve_local(1), Some(a));
        assert_eq!(scope.resolve_local(2), Some(b));
    }

    #[test]
    fn redeclaring_in_the_same_block_fails() {
        let mut scope = FunctionScope::new(0, 0, false);
        scope.declare_local(1).unwrap();
        assert!(scope.declare_local(1).is_none());
    }

    #[test]
    fn shadowing_an_outer_binding_in_a_nested_block_succeeds() {
        let mut scope = FunctionScope::new(0, 0, false);
        let outer = scope.declare_local(1).unwrap();
        scope.enter_block(BlockTag::Normal);
        let inner = scope.declare_local(1).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(scope.resolve_local(1), Some(inner));
        scope.exit_block();
        assert_eq!(scope.resolve_local(1), Some(outer));
    }

    #[test]
    fn exiting_a_block_reclaims_its_registers() {
        let mut scope = FunctionScope::new(0, 0, false);
        scope.declare_local(1).unwrap();
        let mark = scope.next_register;
        scope.enter_block(BlockTag::Normal);
        scope.declare_local(2).unwrap();
        scope.alloc_register().unwrap();
        assert!(scope.next_register > mark);
        scope.exit_block();
        assert_eq!(scope.next_register, mark);
        assert_eq!(scope.resolve_local(2), None);
    }

    #[test]
    fn release_to_reclaims_temporaries_without_touching_declared_locals() {
        let mut scope = FunctionScope::new(0, 0, false);
        scope.declare_local(1).unwrap();
        let mark = scope.next_register;
        scope.alloc_register().unwrap();
        scope.alloc_register().unwrap();
        scope.release_to(mark);
        assert_eq!(scope.next_register, mark);
        assert_eq!(scope.resolve_local(1), Some(0));
    }

    #[test]
    fn innermost_loop_finds_the_nearest_loop_block_but_not_beyond_it() {
        let mut scope = FunctionScope::new(0, 0, false);
        assert_eq!(scope.innermost_loop(), None);
        scope.enter_block(BlockTag::Loop);
        let loop_idx = scope.blocks.len() - 1;
        scope.enter_block(BlockTag::If);
        assert_eq!(scope.innermost_loop(), Some(loop_idx));
        scope.exit_block();
        scope.exit_block();
        assert_eq!(scope.innermost_loop(), None);
    }

    #[test]
    fn add_upvalue_deduplicates_repeated_captures_of_the_same_identifier() {
        let mut scope = FunctionScope::new(0, 0, false);
        let desc = UpvalueDesc { index: 0, is_local: true };
        let first = scope.add_upvalue(42, desc).unwrap();
        let second = scope.add_upvalue(42, desc).unwrap();
        assert_eq!(first, second);
        let other = scope.add_upvalue(43, desc).unwrap();
        assert_ne!(first, other);
    }
}
