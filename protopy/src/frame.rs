use std::sync::Arc;

use crate::{CodeObject, ExcType, ObjRef, RunError, RunResult, Value};

/// Entry of a frame's handler block stack.
#[derive(Debug, Clone)]
pub enum Block {
    /// Installed by `SETUP_EXCEPT`: where to jump and how deep the operand
    /// stack was.
    Except { handler: usize, level: usize },
    /// Active while a handler runs; carries the exception being handled.
    Handler { level: usize, exception: Value },
}

/// Activation record of one code object.
///
/// Frames are boxed so a suspended generator frame can move between a
/// thread's frame stack and its generator without copying.
#[derive(Debug)]
pub struct Frame {
    pub code: Arc<CodeObject>,
    pub ip: usize,
    pub stack: Vec<Value>,
    pub locals: Box<[Option<Value>]>,
    /// Cell variables followed by free variables.
    pub cells: Box<[ObjRef]>,
    pub globals: ObjRef,
    pub builtins: ObjRef,
    /// Name-based locals of module and class bodies.
    pub names: Option<ObjRef>,
    pub blocks: Vec<Block>,
    /// Suspended inside `YIELD_FROM`; the sub-iterator is on top of the
    /// operand stack.
    pub delegating: bool,
}

impl Frame {
    #[must_use]
    pub fn new(
        code: Arc<CodeObject>,
        globals: ObjRef,
        builtins: ObjRef,
        cells: Box<[ObjRef]>,
        names: Option<ObjRef>,
    ) -> Box<Self> {
        let locals = vec![None; code.varnames.len()].into_boxed_slice();
        Box::new(Self {
            stack: Vec::with_capacity(8),
            code,
            ip: 0,
            locals,
            cells,
            globals,
            builtins,
            names,
            blocks: Vec::new(),
            delegating: false,
        })
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> RunResult<Value> {
        self.stack.pop().ok_or_else(underflow)
    }

    #[inline]
    pub fn top(&self) -> RunResult<&Value> {
        self.stack.last().ok_or_else(underflow)
    }

    /// Value `depth` slots below the top; `peek(0)` is the top.
    pub fn peek(&self, depth: usize) -> RunResult<&Value> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(underflow)
    }

    /// Pops `count` values, returned in push order.
    pub fn pop_n(&mut self, count: usize) -> RunResult<Vec<Value>> {
        let at = self.stack.len().checked_sub(count).ok_or_else(underflow)?;
        Ok(self.stack.split_off(at))
    }

    /// Offset of the instruction currently executing.
    #[inline]
    pub fn current_offset(&self) -> usize {
        self.ip.saturating_sub(1)
    }

    /// The innermost exception being handled in this frame.
    pub fn handled_exception(&self) -> Option<&Value> {
        self.blocks.iter().rev().find_map(|block| match block {
            Block::Handler { exception, .. } => Some(exception),
            Block::Except { .. } => None,
        })
    }

    /// Removes the innermost handler block, restoring its stack level.
    pub fn pop_handler(&mut self) -> RunResult<()> {
        match self.blocks.pop() {
            Some(Block::Handler { level, .. }) => {
                self.stack.truncate(level);
                Ok(())
            }
            _ => Err(RunError::new(
                ExcType::SystemError,
                "POP_EXCEPT without an active handler",
            )),
        }
    }

    /// Sub-iterator of a frame suspended inside `YIELD_FROM`.
    pub fn delegate(&self) -> Option<&Value> {
        if self.delegating {
            self.stack.last()
        } else {
            None
        }
    }
}

fn underflow() -> RunError {
    RunError::new(ExcType::SystemError, "operand stack underflow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeBuilder, Dict, ObjectData};

    fn frame() -> Box<Frame> {
        let mut b = CodeBuilder::new("f").args(&["a", "b"]);
        b.load_none().return_value();
        let code = b.build().unwrap();
        let dict = || ObjRef::untracked(ObjectData::Dict(Dict::new().into()));
        Frame::new(code, dict(), dict(), Box::new([]), None)
    }

    #[test]
    fn locals_start_unbound() {
        let frame = frame();
        assert_eq!(frame.locals.len(), 2);
        assert!(frame.locals.iter().all(Option::is_none));
    }

    #[test]
    fn stack_operations() {
        let mut frame = frame();
        frame.push(Value::Int(1));
        frame.push(Value::Int(2));
        frame.push(Value::Int(3));
        assert_eq!(frame.peek(2).unwrap(), &Value::Int(1));
        assert_eq!(frame.pop_n(2).unwrap(), vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(frame.pop().unwrap(), Value::Int(1));
        assert!(frame.pop().is_err());
    }

    #[test]
    fn handler_blocks_track_the_handled_exception() {
        let mut frame = frame();
        frame.blocks.push(Block::Except { handler: 0, level: 0 });
        assert!(frame.handled_exception().is_none());
        frame.push(Value::Int(9));
        frame.blocks.push(Block::Handler {
            level: 0,
            exception: Value::str("boom"),
        });
        assert_eq!(frame.handled_exception(), Some(&Value::str("boom")));
        frame.pop_handler().unwrap();
        assert!(frame.stack.is_empty());
        assert!(frame.pop_handler().is_err());
    }
}
