//! The module artifact and its per-module constant table.

use crate::common::ModuleId;
use crate::value::dict::Dict;
use crate::value::object::FunctionProtoObj;
use crate::value::Value;

/// Deduplicates literal values compiled into one module, handing back a
/// stable index for each distinct value so `LOAD_CONSTANT` can address
/// it.
#[derive(Default)]
pub struct ConstantTable {
    values: Vec<Value>,
    index: Dict<Value, u16>,
}

impl ConstantTable {
    pub fn new() -> Self {
        ConstantTable::default()
    }

    /// Intern `value`, returning its stable index. Values that compare
    /// equal under [`Value::values_equal`] share a slot.
    pub fn intern(&mut self, value: Value) -> Option<u16> {
        if let Some(&idx) = self.index.get(&value) {
            return Some(idx);
        }
        if self.values.len() >= u16::MAX as usize {
            return None;
        }
        let idx = self.values.len() as u16;
        self.values.push(value);
        self.index.set(value, idx);
        Some(idx)
    }

    pub fn get(&self, index: u16) -> Option<Value> {
        self.values.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A compiled, self-contained executable unit. Every module-variable
/// reference in bytecode is an index
/// into either `exports` or `globals`, disambiguated by the `s` flag
/// carried on the `GET_MODULE_VAR`/`SET_MODULE_VAR` instruction.
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub exports: Dict<u32, Value>,
    pub globals: Dict<u32, Value>,
    pub constants: ConstantTable,
    pub init: *mut FunctionProtoObj,
}

impl Module {
    pub fn new(id: ModuleId, name: String) -> Self {
        Module {
            id,
            name,
            exports: Dict::new(),
            globals: Dict::new(),
            constants: ConstantTable::new(),
            init: std::ptr::null_mut(),
        }
    }
}
