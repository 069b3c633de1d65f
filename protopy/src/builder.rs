use std::sync::Arc;

use crate::{
    BinaryOp, CodeCreateInfo, CodeError, CodeFlags, CodeObject, CompareOp,
    Instruction, Op, Value,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental construction of a [`CodeObject`]: interns constants and
/// names, resolves forward jumps through labels.
#[derive(Debug)]
pub struct CodeBuilder {
    info: CodeCreateInfo,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            info: CodeCreateInfo {
                name: Arc::from(name),
                filename: Arc::from("<builder>"),
                ..Default::default()
            },
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    #[must_use]
    pub fn filename(mut self, filename: &str) -> Self {
        self.info.filename = Arc::from(filename);
        self
    }

    /// Declares the positional parameters. Must come before any other
    /// local is interned.
    #[must_use]
    pub fn args(mut self, names: &[&str]) -> Self {
        for name in names {
            self.local(name);
        }
        self.info.arg_count = names.len();
        self
    }

    #[must_use]
    pub fn posonly(mut self, count: usize) -> Self {
        self.info.posonly_count = count;
        self
    }

    #[must_use]
    pub fn kwonly(mut self, names: &[&str]) -> Self {
        for name in names {
            self.local(name);
        }
        self.info.kwonly_count = names.len();
        self
    }

    #[must_use]
    pub fn varargs(mut self, name: &str) -> Self {
        self.local(name);
        self.info.flags |= CodeFlags::VARARGS;
        self
    }

    #[must_use]
    pub fn varkeywords(mut self, name: &str) -> Self {
        self.local(name);
        self.info.flags |= CodeFlags::VARKEYWORDS;
        self
    }

    #[must_use]
    pub fn generator(mut self) -> Self {
        self.info.flags |= CodeFlags::GENERATOR;
        self
    }

    #[must_use]
    pub fn coroutine(mut self) -> Self {
        self.info.flags |= CodeFlags::COROUTINE;
        self
    }

    #[must_use]
    pub fn defaults(mut self, defaults: Vec<Value>) -> Self {
        self.info.defaults = defaults;
        self
    }

    #[must_use]
    pub fn kw_default(mut self, name: &str, value: Value) -> Self {
        self.info.kw_defaults.push((Arc::from(name), value));
        self
    }

    #[must_use]
    pub fn cellvars(mut self, names: &[&str]) -> Self {
        self.info.cellvars = names.iter().map(|&name| Arc::from(name)).collect();
        self
    }

    #[must_use]
    pub fn freevars(mut self, names: &[&str]) -> Self {
        self.info.freevars = names.iter().map(|&name| Arc::from(name)).collect();
        self
    }

    pub fn local(&mut self, name: &str) -> u32 {
        intern(&mut self.info.varnames, name)
    }

    pub fn name(&mut self, name: &str) -> u32 {
        intern(&mut self.info.names, name)
    }

    /// Index of cell or free variable `name`.
    pub fn cell(&mut self, name: &str) -> u32 {
        let cells = &self.info.cellvars;
        if let Some(index) = cells.iter().position(|c| &**c == name) {
            return index as u32;
        }
        if let Some(index) =
            self.info.freevars.iter().position(|f| &**f == name)
        {
            return (cells.len() + index) as u32;
        }
        self.info.cellvars.push(Arc::from(name));
        (self.info.cellvars.len() - 1) as u32
    }

    /// Immutable constants are deduplicated; code objects never are.
    pub fn constant(&mut self, value: Value) -> u32 {
        let existing = match &value {
            Value::Code(_) | Value::Object(_) => None,
            _ => self.info.constants.iter().position(|c| {
                std::mem::discriminant(c) == std::mem::discriminant(&value)
                    && c == &value
            }),
        };
        existing.map_or_else(
            || {
                self.info.constants.push(value);
                (self.info.constants.len() - 1) as u32
            },
            |index| index as u32,
        )
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.info.instructions.len() as u32);
    }

    pub fn offset(&self) -> usize {
        self.info.instructions.len()
    }

    pub fn emit(&mut self, op: Op, arg: u32) -> &mut Self {
        self.info.instructions.push(Instruction::new(op, arg));
        self
    }

    pub fn emit_jump(&mut self, op: Op, target: Label) -> &mut Self {
        self.fixups.push((self.info.instructions.len(), target));
        self.emit(op, 0)
    }

    pub fn load_const(&mut self, value: impl Into<Value>) -> &mut Self {
        let index = self.constant(value.into());
        self.emit(Op::LoadConst, index)
    }

    pub fn load_none(&mut self) -> &mut Self {
        self.load_const(Value::None)
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        let index = self.local(name);
        self.emit(Op::LoadFast, index)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        let index = self.local(name);
        self.emit(Op::StoreFast, index)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::LoadGlobal, index)
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::StoreGlobal, index)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::LoadName, index)
    }

    pub fn store_name(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::StoreName, index)
    }

    pub fn load_deref(&mut self, name: &str) -> &mut Self {
        let index = self.cell(name);
        self.emit(Op::LoadDeref, index)
    }

    pub fn store_deref(&mut self, name: &str) -> &mut Self {
        let index = self.cell(name);
        self.emit(Op::StoreDeref, index)
    }

    pub fn load_closure(&mut self, name: &str) -> &mut Self {
        let index = self.cell(name);
        self.emit(Op::LoadClosure, index)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::LoadAttr, index)
    }

    pub fn store_attr(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::StoreAttr, index)
    }

    pub fn import_name(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Op::ImportName, index)
    }

    pub fn binary(&mut self, op: BinaryOp) -> &mut Self {
        self.emit(Op::BinaryOp, op as u32)
    }

    pub fn inplace(&mut self, op: BinaryOp) -> &mut Self {
        self.emit(Op::InplaceOp, op as u32)
    }

    pub fn compare(&mut self, op: CompareOp) -> &mut Self {
        self.emit(Op::CompareOp, op as u32)
    }

    pub fn call(&mut self, argc: u32) -> &mut Self {
        self.emit(Op::CallFunction, argc)
    }

    /// Calls with keyword arguments: the last `names.len()` of the `argc`
    /// pushed values are bound by name.
    pub fn call_kw(&mut self, argc: u32, names: &[&str]) -> &mut Self {
        let names: Vec<Value> =
            names.iter().map(|&name| Value::str(name)).collect();
        let index = self.constant_tuple(names);
        self.emit(Op::LoadConst, index);
        self.emit(Op::CallFunctionKw, argc)
    }

    /// Tuples of immutable constants are folded into a single constant.
    pub fn constant_tuple(&mut self, items: Vec<Value>) -> u32 {
        let tuple = crate::ObjRef::immortal(crate::ObjectData::Tuple(
            items.into_boxed_slice(),
        ));
        self.constant(Value::Object(tuple))
    }

    pub fn make_function(
        &mut self,
        code: Arc<CodeObject>,
        flags: u32,
    ) -> &mut Self {
        self.load_const(Value::Code(code));
        self.emit(Op::MakeFunction, flags)
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.emit_jump(Op::Jump, target)
    }

    pub fn pop_jump_if_false(&mut self, target: Label) -> &mut Self {
        self.emit_jump(Op::PopJumpIfFalse, target)
    }

    pub fn pop_jump_if_true(&mut self, target: Label) -> &mut Self {
        self.emit_jump(Op::PopJumpIfTrue, target)
    }

    pub fn for_iter(&mut self, target: Label) -> &mut Self {
        self.emit_jump(Op::ForIter, target)
    }

    pub fn setup_except(&mut self, handler: Label) -> &mut Self {
        self.emit_jump(Op::SetupExcept, handler)
    }

    pub fn jump_if_not_exc_match(&mut self, target: Label) -> &mut Self {
        self.emit_jump(Op::JumpIfNotExcMatch, target)
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.emit(op, 0)
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.emit(Op::ReturnValue, 0)
    }

    pub fn build(self) -> Result<Arc<CodeObject>, CodeError> {
        let Self {
            mut info,
            labels,
            fixups,
        } = self;
        for (offset, label) in fixups {
            let target = labels[label.0].ok_or(CodeError::UnboundLabel(label.0))?;
            info.instructions[offset].arg = target;
        }
        CodeObject::new(info)
    }
}

fn intern(table: &mut Vec<Arc<str>>, name: &str) -> u32 {
    if let Some(index) = table.iter().position(|entry| &**entry == name) {
        return index as u32;
    }
    table.push(Arc::from(name));
    (table.len() - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_forward_jumps() {
        let mut b = CodeBuilder::new("f").args(&["x"]);
        let done = b.label();
        b.load_fast("x").pop_jump_if_false(done);
        b.load_const(1).return_value();
        b.bind(done);
        b.load_const(2).return_value();
        let code = b.build().unwrap();

        assert_eq!(code.instructions[1].op, Op::PopJumpIfFalse);
        assert_eq!(code.instructions[1].arg, 4);
        assert_eq!(code.arg_count, 1);
    }

    #[test]
    fn constants_and_names_are_interned() {
        let mut b = CodeBuilder::new("f");
        let a = b.constant(Value::Int(7));
        let c = b.constant(Value::Int(7));
        let d = b.constant(Value::Float(7.0));
        assert_eq!(a, c);
        assert_ne!(a, d);
        assert_eq!(b.name("x"), b.name("x"));
    }

    #[test]
    fn unbound_label_is_reported() {
        let mut b = CodeBuilder::new("f");
        let never = b.label();
        b.jump(never);
        assert!(matches!(b.build(), Err(CodeError::UnboundLabel(0))));
    }
}
