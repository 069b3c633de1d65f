//! The bytecode interpreter.
//!
//! Every OS thread running interpreted code owns one [`Interpreter`]. Calls
//! between interpreted functions never recurse on the native stack: the
//! active frame is swapped for the callee and the caller is parked on
//! `frames`. Native code calling back into interpreted code (builtins,
//! generator resumption, thread entry) starts a nested run on top of the
//! same frame stack, bounded by the same recursion counter.
mod call;
mod iter;
mod ops;

use std::{mem, sync::Arc};

use log::{Level, debug, log_enabled, trace};
use parking_lot::RwLock;

pub(crate) use call::Prepared;
pub(crate) use ops::{is_not_implemented, repr_str, slice_indices, str_dict};
pub use iter::IterStep;

use crate::{
    Args, Block, CodeObject, Dict, ExcType, Frame, Function, Instruction,
    MakeFunctionFlags, Module, ObjRef, ObjectData, Op, RunError, RunResult,
    Value, current_thread_ident, exc_class, is_subclass, types::class_of,
    vm::VMProxy,
};

/// How a frame is (re)entered.
#[derive(Debug)]
pub enum Resume {
    Start,
    /// Pushed as the result of the pending suspension point.
    Send(Value),
    /// Raised at the pending suspension point.
    Throw(RunError),
}

/// How the entry frame of a run left.
#[derive(Debug)]
pub enum FrameExit {
    Return(Value),
    /// A generator frame suspended; it is handed back to its owner.
    Yield(Value, Box<Frame>),
}

enum Flow {
    Next,
    Call(Box<Frame>),
    Return(Value),
    Yield(Value),
}

pub struct Interpreter {
    pub vm: VMProxy,
    /// Callers of the active frame, innermost last.
    frames: Vec<Box<Frame>>,
    /// Frames active on this thread, the running one included.
    depth: usize,
    /// Nesting of runs; the thread is managed while non-zero.
    managed: usize,
    ident: u64,
    globals: ObjRef,
    repr_guard: Vec<usize>,
}

impl Interpreter {
    #[must_use]
    pub fn new(vm: VMProxy) -> Self {
        let globals = vm.heap.new_dict(Dict::new());
        dict_set(&globals, "__name__", Value::str("__main__"));
        Self {
            vm,
            frames: Vec::new(),
            depth: 0,
            managed: 0,
            ident: current_thread_ident(),
            globals,
            repr_guard: Vec::new(),
        }
    }

    /// Identity of the OS thread this interpreter runs on.
    #[inline]
    pub fn ident(&self) -> u64 {
        self.ident
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Default namespace for code run through [`Interpreter::run_code`].
    pub fn globals(&self) -> &ObjRef {
        &self.globals
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        dict_get(&self.globals, name)
    }

    pub fn set_global(&self, name: &str, value: Value) {
        dict_set(&self.globals, name, value);
    }

    pub fn builtins(&self) -> ObjRef {
        self.vm.shared.builtins.clone()
    }

    /// Runs module-level code against the default namespace.
    pub fn run_code(&mut self, code: Arc<CodeObject>) -> RunResult<Value> {
        let frame = self.module_frame(code, self.globals.clone());
        self.run_frame(frame)
    }

    /// Runs `code` as the body of a new module registered under `name`.
    pub fn run_module(
        &mut self,
        name: &str,
        code: Arc<CodeObject>,
    ) -> RunResult<ObjRef> {
        let globals = self.vm.heap.new_dict(Dict::new());
        dict_set(&globals, "__name__", Value::str(name));
        let module = self.vm.heap.allocate(ObjectData::Module(Module {
            name: Arc::from(name),
            globals: globals.clone(),
        }));
        self.vm.shared.register_module(name, module.clone());
        debug!("running module {name}");
        let frame = self.module_frame(code, globals);
        self.run_frame(frame)?;
        Ok(module)
    }

    fn module_frame(
        &self,
        code: Arc<CodeObject>,
        globals: ObjRef,
    ) -> Box<Frame> {
        // nothing encloses module code: its free variables start unbound
        let cells = (0..code.cellvars.len() + code.freevars.len())
            .map(|_| self.vm.heap.new_cell(None))
            .collect();
        Frame::new(code, globals, self.builtins(), cells, None)
    }

    /// Wraps a code object into a function over the default namespace.
    /// Free variables get fresh unbound cells.
    pub fn make_function_from_code(&self, code: Arc<CodeObject>) -> Value {
        let defaults = code.defaults.to_vec();
        let kw_defaults = code.kw_defaults.to_vec();
        let closure = (0..code.freevars.len())
            .map(|_| self.vm.heap.new_cell(None))
            .collect();
        self.new_function(
            code,
            self.globals.clone(),
            defaults,
            kw_defaults,
            closure,
        )
    }

    fn new_function(
        &self,
        code: Arc<CodeObject>,
        globals: ObjRef,
        defaults: Vec<Value>,
        kw_defaults: Vec<(Arc<str>, Value)>,
        closure: Box<[ObjRef]>,
    ) -> Value {
        let function = Function {
            name: code.name.clone(),
            code,
            globals,
            defaults: defaults.into_boxed_slice(),
            kw_defaults: kw_defaults.into_boxed_slice(),
            closure,
            dict: RwLock::new(Dict::new()),
        };
        Value::Object(self.vm.heap.allocate(ObjectData::Function(function)))
    }

    /// Fails with `RecursionError` when one more frame would exceed the
    /// limit. Frames already running are never failed retroactively.
    pub(crate) fn check_depth(&self) -> RunResult<()> {
        if self.depth >= self.vm.shared.recursion_limit() {
            return Err(RunError::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        Ok(())
    }

    /// Counts a frame parked off the frame stack, such as a generator
    /// forwarding `throw` to its delegate, against the recursion limit.
    pub(crate) fn counting_frame<T>(&mut self, run: impl FnOnce(&mut Self) -> T) -> T {
        self.depth += 1;
        let result = run(self);
        self.depth -= 1;
        result
    }

    /// `true` while this thread runs interpreted code.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.managed > 0
    }

    fn enter_managed(&mut self) {
        if self.managed == 0 {
            self.vm.heap.shared().safepoint.enter();
        }
        self.managed += 1;
    }

    fn leave_managed(&mut self) {
        self.managed -= 1;
        if self.managed == 0 {
            self.vm.heap.shared().safepoint.leave();
        }
    }

    /// Runs a native wait outside the managed state so a collection never
    /// waits on a blocked thread.
    pub fn blocking<T>(&mut self, wait: impl FnOnce() -> T) -> T {
        let managed = self.managed > 0;
        let safepoint = &self.vm.heap.shared().safepoint;
        if managed {
            safepoint.leave();
        }
        let result = wait();
        if managed {
            safepoint.enter();
        }
        result
    }

    /// Runs `frame` to completion or suspension. Frames it calls are
    /// pushed on top of the current frame stack and popped again before
    /// this returns.
    pub fn execute(
        &mut self,
        frame: Box<Frame>,
        resume: Resume,
    ) -> RunResult<FrameExit> {
        let base = self.frames.len();
        let depth = self.depth;
        self.depth += 1;
        self.enter_managed();
        let result = self.run(frame, base, resume);
        self.leave_managed();
        self.frames.truncate(base);
        self.depth = depth;
        result
    }

    pub(crate) fn run_frame(&mut self, frame: Box<Frame>) -> RunResult<Value> {
        self.check_depth()?;
        match self.execute(frame, Resume::Start)? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(..) => Err(RunError::new(
                ExcType::SystemError,
                "frame suspended outside a generator",
            )),
        }
    }

    fn run(
        &mut self,
        mut frame: Box<Frame>,
        base: usize,
        resume: Resume,
    ) -> RunResult<FrameExit> {
        let heap = self.vm.heap.shared().clone();
        let mut pending = match resume {
            Resume::Start => None,
            Resume::Send(value) => {
                frame.push(value);
                None
            }
            Resume::Throw(error) => Some(error),
        };

        loop {
            if let Some(error) = pending.take() {
                self.unwind(&mut frame, base, error)?;
            }
            if heap.safepoint.is_requested() {
                heap.safepoint.park();
            }
            if heap.collection_due() {
                heap.collect(true);
            }

            match self.step(&mut frame) {
                Ok(Flow::Next) => (),
                Ok(Flow::Call(callee)) => {
                    if let Err(error) = self.check_depth() {
                        pending = Some(error);
                        continue;
                    }
                    self.depth += 1;
                    let caller = mem::replace(&mut frame, callee);
                    self.frames.push(caller);
                }
                Ok(Flow::Return(value)) => {
                    if self.frames.len() == base {
                        return Ok(FrameExit::Return(value));
                    }
                    let Some(caller) = self.frames.pop() else {
                        return Ok(FrameExit::Return(value));
                    };
                    frame = caller;
                    self.depth -= 1;
                    frame.push(value);
                }
                Ok(Flow::Yield(value)) => {
                    if self.frames.len() != base {
                        pending = Some(RunError::new(
                            ExcType::SystemError,
                            "yield from a frame that is not a generator",
                        ));
                        continue;
                    }
                    return Ok(FrameExit::Yield(value, frame));
                }
                Err(error) => pending = Some(error),
            }
        }
    }

    /// Looks for a handler for `error`, popping frames down to `base`.
    /// Returns the error when no frame of this run handles it.
    fn unwind(
        &mut self,
        frame: &mut Box<Frame>,
        base: usize,
        error: RunError,
    ) -> RunResult<()> {
        let exception = self.materialize(error);
        self.set_context(frame, &exception);

        loop {
            if let Some(exc) = exception.as_exception() {
                exc.push_traceback(frame.code.clone(), frame.current_offset());
            }
            while let Some(block) = frame.blocks.pop() {
                if let Block::Except { handler, level } = block {
                    frame.stack.truncate(level);
                    frame.blocks.push(Block::Handler {
                        level,
                        exception: Value::Object(exception.clone()),
                    });
                    frame.push(Value::Object(exception));
                    frame.ip = handler;
                    frame.delegating = false;
                    return Ok(());
                }
            }
            if self.frames.len() == base {
                return Err(RunError::Raised(exception));
            }
            let Some(caller) = self.frames.pop() else {
                return Err(RunError::Raised(exception));
            };
            *frame = caller;
            self.depth -= 1;
        }
    }

    /// Links `exception` to the exception currently being handled, if any.
    fn set_context(&self, frame: &Frame, exception: &ObjRef) {
        let Some(exc) = exception.as_exception() else {
            return;
        };
        let handled = frame.handled_exception().or_else(|| {
            self.frames.iter().rev().find_map(|f| f.handled_exception())
        });
        let Some(Value::Object(handled)) = handled else {
            return;
        };
        if handled.ptr_eq(exception) || chain_contains(handled, exception) {
            return;
        }
        let mut context = exc.context.write();
        if context.is_none() {
            *context = Some(Value::Object(handled.clone()));
        }
    }

    fn handled_exception(&self, frame: &Frame) -> Option<Value> {
        frame
            .handled_exception()
            .or_else(|| {
                self.frames.iter().rev().find_map(|f| f.handled_exception())
            })
            .cloned()
    }

    /// Turns a pending error into a heap exception object.
    pub fn materialize(&self, error: RunError) -> ObjRef {
        match error {
            RunError::Raised(exception) => exception,
            RunError::Pending { kind, message } => {
                let args = if message.is_empty() {
                    Vec::new()
                } else {
                    vec![Value::from(message)]
                };
                self.new_exception(kind, args)
            }
        }
    }

    pub fn new_exception(&self, kind: ExcType, args: Vec<Value>) -> ObjRef {
        self.vm.heap.new_exception(exc_class(kind).clone(), args)
    }

    pub fn exception_value(&self, error: RunError) -> Value {
        Value::Object(self.materialize(error))
    }

    /// A new exception of `kind` whose `__cause__` is `cause`.
    pub(crate) fn chained(
        &self,
        kind: ExcType,
        message: impl Into<String>,
        cause: RunError,
    ) -> RunError {
        let exception =
            self.new_exception(kind, vec![Value::from(message.into())]);
        if let Some(exc) = exception.as_exception() {
            *exc.cause.write() = Some(self.exception_value(cause));
            exc.suppress_context
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        RunError::Raised(exception)
    }

    /// Exception object for the operand of `raise`: instances are used as
    /// they are, classes are instantiated without arguments.
    pub(crate) fn make_exception(&mut self, value: &Value) -> RunResult<ObjRef> {
        if let Value::Object(object) = value {
            if object.as_exception().is_some() {
                return Ok(object.clone());
            }
            if object.as_class().is_some()
                && is_subclass(object, exc_class(ExcType::BaseException))
            {
                let instance = self.call_value(value, Args::default())?;
                if let Value::Object(instance) = instance {
                    if instance.as_exception().is_some() {
                        return Ok(instance);
                    }
                }
                return Err(RunError::type_error(
                    "calling an exception class did not produce an exception",
                ));
            }
        }
        Err(RunError::type_error("exceptions must derive from BaseException"))
    }

    fn exception_matches(
        &self,
        exception: &Value,
        spec: &Value,
    ) -> RunResult<bool> {
        if let Some(items) = spec.as_object().and_then(|o| o.as_tuple()) {
            for item in items {
                if self.exception_matches(exception, item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        let base = exc_class(ExcType::BaseException);
        match spec.as_object() {
            Some(class) if class.as_class().is_some() && is_subclass(class, base) => {
                Ok(is_subclass(&class_of(exception), class))
            }
            _ => Err(RunError::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    fn step(&mut self, frame: &mut Frame) -> RunResult<Flow> {
        let Some(&Instruction { op, arg }) = frame.code.instructions.get(frame.ip)
        else {
            return Err(RunError::new(
                ExcType::SystemError,
                "instruction pointer past the end of the code",
            ));
        };
        if log_enabled!(Level::Trace) {
            trace!("{} {:>4} {} {}", frame.code.name, frame.ip, op.name(), arg);
        }
        frame.ip += 1;
        let index = arg as usize;

        match op {
            Op::Nop => (),
            Op::PopTop => {
                frame.pop()?;
            }
            Op::RotTwo => {
                let top = frame.pop()?;
                let second = frame.pop()?;
                frame.push(top);
                frame.push(second);
            }
            Op::RotThree => {
                let top = frame.pop()?;
                let at = frame.stack.len().checked_sub(2).ok_or_else(underflow)?;
                frame.stack.insert(at, top);
            }
            Op::DupTop => {
                let top = frame.top()?.clone();
                frame.push(top);
            }
            Op::DupTopTwo => {
                let second = frame.peek(1)?.clone();
                let top = frame.peek(0)?.clone();
                frame.push(second);
                frame.push(top);
            }

            Op::LoadConst => {
                let value = frame.code.constants[index].clone();
                frame.push(value);
            }
            Op::LoadFast => match &frame.locals[index] {
                Some(value) => {
                    let value = value.clone();
                    frame.push(value);
                }
                None => return Err(unbound_local(&frame.code.varnames[index])),
            },
            Op::StoreFast => {
                let value = frame.pop()?;
                frame.locals[index] = Some(value);
            }
            Op::DeleteFast => {
                if frame.locals[index].take().is_none() {
                    return Err(unbound_local(&frame.code.varnames[index]));
                }
            }
            Op::LoadName => {
                let name = &frame.code.names[index];
                let value = frame
                    .names
                    .as_ref()
                    .and_then(|names| dict_get(names, name))
                    .or_else(|| dict_get(&frame.globals, name))
                    .or_else(|| dict_get(&frame.builtins, name))
                    .ok_or_else(|| name_error(name))?;
                frame.push(value);
            }
            Op::StoreName => {
                let value = frame.pop()?;
                let target = frame.names.as_ref().unwrap_or(&frame.globals);
                dict_set(target, &frame.code.names[index], value);
            }
            Op::DeleteName => {
                let target = frame.names.as_ref().unwrap_or(&frame.globals);
                let name = &frame.code.names[index];
                if !dict_del(target, name) {
                    return Err(name_error(name));
                }
            }
            Op::LoadGlobal => {
                let name = &frame.code.names[index];
                let value = dict_get(&frame.globals, name)
                    .or_else(|| dict_get(&frame.builtins, name))
                    .ok_or_else(|| name_error(name))?;
                frame.push(value);
            }
            Op::StoreGlobal => {
                let value = frame.pop()?;
                dict_set(&frame.globals, &frame.code.names[index], value);
            }
            Op::DeleteGlobal => {
                let name = &frame.code.names[index];
                if !dict_del(&frame.globals, name) {
                    return Err(name_error(name));
                }
            }
            Op::LoadDeref => {
                let cell = frame
                    .cells
                    .get(index)
                    .ok_or_else(|| missing_cell(&frame.code, index))?;
                let value = cell.as_cell().and_then(|cell| cell.read().clone());
                match value {
                    Some(value) => frame.push(value),
                    None => return Err(unbound_cell(&frame.code, index)),
                }
            }
            Op::StoreDeref => {
                let value = frame.pop()?;
                let cell = frame
                    .cells
                    .get(index)
                    .ok_or_else(|| missing_cell(&frame.code, index))?;
                if let Some(cell) = cell.as_cell() {
                    *cell.write() = Some(value);
                }
            }
            Op::LoadClosure => {
                let cell = frame
                    .cells
                    .get(index)
                    .ok_or_else(|| missing_cell(&frame.code, index))?;
                let cell = cell.clone();
                frame.push(Value::Object(cell));
            }

            Op::LoadAttr => {
                let target = frame.pop()?;
                let value = self.getattr(&target, &frame.code.names[index])?;
                frame.push(value);
            }
            Op::StoreAttr => {
                let target = frame.pop()?;
                let value = frame.pop()?;
                self.setattr(&target, &frame.code.names[index], value)?;
            }
            Op::DeleteAttr => {
                let target = frame.pop()?;
                self.delattr(&target, &frame.code.names[index])?;
            }
            Op::BinarySubscr => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                let value = self.getitem(&target, &key)?;
                frame.push(value);
            }
            Op::StoreSubscr => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                let value = frame.pop()?;
                self.setitem(&target, &key, value)?;
            }
            Op::DeleteSubscr => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                self.delitem(&target, &key)?;
            }

            Op::BinaryOp | Op::InplaceOp => {
                let Some(kind) = crate::BinaryOp::from_arg(arg) else {
                    return Err(bad_operand(op));
                };
                let right = frame.pop()?;
                let left = frame.pop()?;
                let value = if op == Op::InplaceOp {
                    self.inplace_op(kind, &left, &right)?
                } else {
                    self.binary_op(kind, &left, &right)?
                };
                frame.push(value);
            }
            Op::UnaryPositive | Op::UnaryNegative | Op::UnaryInvert => {
                let operand = frame.pop()?;
                let value = self.unary_op(op, &operand)?;
                frame.push(value);
            }
            Op::UnaryNot => {
                let operand = frame.pop()?;
                let value = !self.truthy(&operand)?;
                frame.push(Value::Bool(value));
            }

            Op::CompareOp => {
                let Some(kind) = crate::CompareOp::from_arg(arg) else {
                    return Err(bad_operand(op));
                };
                let right = frame.pop()?;
                let left = frame.pop()?;
                let value = self.compare(kind, &left, &right)?;
                frame.push(value);
            }
            Op::IsOp => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(Value::Bool(left.is(&right) != (arg == 1)));
            }
            Op::ContainsOp => {
                let container = frame.pop()?;
                let item = frame.pop()?;
                let found = self.contains(&container, &item)?;
                frame.push(Value::Bool(found != (arg == 1)));
            }

            Op::Jump => frame.ip = index,
            Op::PopJumpIfFalse => {
                let value = frame.pop()?;
                if !self.truthy(&value)? {
                    frame.ip = index;
                }
            }
            Op::PopJumpIfTrue => {
                let value = frame.pop()?;
                if self.truthy(&value)? {
                    frame.ip = index;
                }
            }
            Op::JumpIfFalseOrPop => {
                let value = frame.top()?.clone();
                if self.truthy(&value)? {
                    frame.pop()?;
                } else {
                    frame.ip = index;
                }
            }
            Op::JumpIfTrueOrPop => {
                let value = frame.top()?.clone();
                if self.truthy(&value)? {
                    frame.ip = index;
                } else {
                    frame.pop()?;
                }
            }

            Op::CallFunction => {
                let args = frame.pop_n(index)?;
                let callable = frame.pop()?;
                return self.call_from_frame(frame, &callable, Args::new(args));
            }
            Op::CallFunctionKw => {
                let names = frame.pop()?;
                let mut positional = frame.pop_n(index)?;
                let callable = frame.pop()?;
                let names = keyword_names(&names)?;
                let split = positional.len().checked_sub(names.len()).ok_or_else(
                    || RunError::new(ExcType::SystemError, "more keyword names than arguments"),
                )?;
                let values = positional.split_off(split);
                let keywords = names.into_iter().zip(values).collect();
                let args = Args::with_keywords(positional, keywords);
                return self.call_from_frame(frame, &callable, args);
            }
            Op::CallFunctionEx => {
                let keywords = if arg & 1 == 1 {
                    self.keyword_arguments(&frame.pop()?)?
                } else {
                    Vec::new()
                };
                let iterable = frame.pop()?;
                let positional = self.collect_values(&iterable)?;
                let callable = frame.pop()?;
                let args = Args::with_keywords(positional, keywords);
                return self.call_from_frame(frame, &callable, args);
            }
            Op::MakeFunction => {
                let function = self.make_function(frame, arg)?;
                frame.push(function);
            }
            Op::LoadBuildClass => {
                let build = dict_get(&frame.builtins, "__build_class__")
                    .ok_or_else(|| name_error("__build_class__"))?;
                frame.push(build);
            }
            Op::ReturnValue => return Ok(Flow::Return(frame.pop()?)),

            Op::BuildTuple => {
                let items = frame.pop_n(index)?;
                frame.push(self.vm.heap.new_tuple(items));
            }
            Op::BuildList => {
                let items = frame.pop_n(index)?;
                frame.push(self.vm.heap.new_list(items));
            }
            Op::BuildSet => {
                let items = frame.pop_n(index)?;
                let set = self.new_set(items)?;
                frame.push(set);
            }
            Op::BuildMap => {
                let items = frame.pop_n(index * 2)?;
                let mut dict = Dict::new();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict.insert(key.hash_key()?, key, value);
                }
                frame.push(Value::Object(self.vm.heap.new_dict(dict)));
            }
            Op::BuildSlice => {
                let step = if index == 3 { frame.pop()? } else { Value::None };
                let stop = frame.pop()?;
                let start = frame.pop()?;
                let slice = crate::Slice { start, stop, step };
                frame.push(Value::Object(
                    self.vm.heap.allocate(ObjectData::Slice(slice)),
                ));
            }
            Op::ListAppend => {
                let value = frame.pop()?;
                let target = frame.peek(index.saturating_sub(1))?;
                let Some(list) = target.as_object().and_then(|o| o.as_list()) else {
                    return Err(bad_operand(op));
                };
                list.write().push(value);
            }
            Op::SetAdd => {
                let value = frame.pop()?;
                let key = value.hash_key()?;
                let target = frame.peek(index.saturating_sub(1))?;
                let Some(set) = target.as_object().and_then(|o| o.as_set()) else {
                    return Err(bad_operand(op));
                };
                set.write().insert(key, value);
            }
            Op::MapAdd => {
                let value = frame.pop()?;
                let key = frame.pop()?;
                let hash = key.hash_key()?;
                let target = frame.peek(index.saturating_sub(1))?;
                let Some(dict) = target.as_object().and_then(|o| o.as_dict()) else {
                    return Err(bad_operand(op));
                };
                dict.write().insert(hash, key, value);
            }
            Op::UnpackSequence => {
                let sequence = frame.pop()?;
                let items = self.collect_values(&sequence)?;
                if items.len() < index {
                    return Err(RunError::value_error(format!(
                        "not enough values to unpack (expected {index}, got {})",
                        items.len()
                    )));
                }
                if items.len() > index {
                    return Err(RunError::value_error(format!(
                        "too many values to unpack (expected {index})"
                    )));
                }
                frame.stack.extend(items.into_iter().rev());
            }

            Op::GetIter => {
                let iterable = frame.pop()?;
                let iterator = self.get_iter(&iterable)?;
                frame.push(iterator);
            }
            Op::ForIter => {
                let iterator = frame.top()?.clone();
                match self.advance(&iterator)? {
                    IterStep::Yielded(value) => frame.push(value),
                    IterStep::Exhausted(_) => {
                        frame.pop()?;
                        frame.ip = index;
                    }
                }
            }

            Op::SetupExcept => frame.blocks.push(Block::Except {
                handler: index,
                level: frame.stack.len(),
            }),
            Op::PopBlock => match frame.blocks.pop() {
                Some(Block::Except { .. }) => (),
                _ => {
                    return Err(RunError::new(
                        ExcType::SystemError,
                        "POP_BLOCK without a handler block",
                    ));
                }
            },
            Op::PopExcept => frame.pop_handler()?,
            Op::JumpIfNotExcMatch => {
                let spec = frame.pop()?;
                let exception = frame.pop()?;
                if !self.exception_matches(&exception, &spec)? {
                    frame.ip = index;
                }
            }
            Op::RaiseVarargs => return Err(self.raise(frame, index)?),
            Op::Reraise => {
                let exception = frame.pop()?;
                return Err(RunError::Raised(self.make_exception(&exception)?));
            }

            Op::YieldValue => return Ok(Flow::Yield(frame.pop()?)),
            Op::YieldFrom => {
                let value = frame.pop()?;
                let inner = frame.top()?.clone();
                frame.delegating = false;
                match self.send_to(&inner, value)? {
                    IterStep::Yielded(value) => {
                        // resume re-executes this instruction
                        frame.ip -= 1;
                        frame.delegating = true;
                        return Ok(Flow::Yield(value));
                    }
                    IterStep::Exhausted(result) => {
                        frame.pop()?;
                        frame.push(result);
                    }
                }
            }
            Op::GetYieldFromIter => {
                let kind = frame
                    .top()?
                    .as_object()
                    .and_then(|o| o.as_generator())
                    .map(|g| g.kind);
                match kind {
                    Some(crate::GeneratorKind::Coroutine)
                        if !frame.code.is_coroutine() =>
                    {
                        return Err(RunError::type_error(
                            "cannot 'yield from' a coroutine object in a non-coroutine generator",
                        ));
                    }
                    Some(_) => (),
                    None => {
                        let iterable = frame.pop()?;
                        let iterator = self.get_iter(&iterable)?;
                        frame.push(iterator);
                    }
                }
            }
            Op::GetAwaitable => {
                let value = frame.pop()?;
                let awaitable = self.get_awaitable(&value)?;
                frame.push(awaitable);
            }
            Op::GetAIter => {
                let value = frame.pop()?;
                let Some(method) = self.lookup_method(&value, "__aiter__")? else {
                    return Err(RunError::type_error(format!(
                        "'async for' requires an object with __aiter__ method, got {}",
                        value.type_name()
                    )));
                };
                let iterator = self.call_value(&method, Args::default())?;
                frame.push(iterator);
            }
            Op::GetANext => {
                let iterator = frame.top()?.clone();
                let Some(method) = self.lookup_method(&iterator, "__anext__")? else {
                    return Err(RunError::type_error(format!(
                        "'async for' requires an iterator with __anext__ method, got {}",
                        iterator.type_name()
                    )));
                };
                let next = self.call_value(&method, Args::default())?;
                let awaitable = self.get_awaitable(&next)?;
                frame.push(awaitable);
            }
            Op::EndAsyncFor => {
                let exception = frame.pop()?;
                let exception = self.make_exception(&exception)?;
                let error = RunError::Raised(exception);
                if !error.is_instance(ExcType::StopAsyncIteration) {
                    return Err(error);
                }
                frame.pop_handler()?;
                frame.pop()?;
            }

            Op::ImportName => {
                let module = self.import(&frame.code.names[index])?;
                frame.push(Value::Object(module));
            }
        }
        Ok(Flow::Next)
    }

    fn call_from_frame(
        &mut self,
        frame: &mut Frame,
        callable: &Value,
        args: Args,
    ) -> RunResult<Flow> {
        match self.prepare_call(callable, args)? {
            Prepared::Done(value) => {
                frame.push(value);
                Ok(Flow::Next)
            }
            Prepared::Frame(callee) => Ok(Flow::Call(callee)),
        }
    }

    fn raise(&mut self, frame: &mut Frame, argc: usize) -> RunResult<RunError> {
        match argc {
            0 => match self.handled_exception(frame) {
                Some(Value::Object(exception)) => Ok(RunError::Raised(exception)),
                _ => Ok(RunError::runtime_error("No active exception to reraise")),
            },
            1 => {
                let value = frame.pop()?;
                Ok(RunError::Raised(self.make_exception(&value)?))
            }
            2 => {
                let cause = frame.pop()?;
                let value = frame.pop()?;
                let exception = self.make_exception(&value)?;
                let cause = match cause {
                    Value::None => None,
                    other => Some(Value::Object(self.make_exception(&other)?)),
                };
                if let Some(exc) = exception.as_exception() {
                    *exc.cause.write() = cause;
                    exc.suppress_context
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                }
                Ok(RunError::Raised(exception))
            }
            _ => Err(bad_operand(Op::RaiseVarargs)),
        }
    }

    fn make_function(&mut self, frame: &mut Frame, arg: u32) -> RunResult<Value> {
        let code = match frame.pop()? {
            Value::Code(code) => code,
            other => {
                return Err(RunError::type_error(format!(
                    "MAKE_FUNCTION expects a code object, got '{}'",
                    other.type_name()
                )));
            }
        };
        let flags = MakeFunctionFlags::from_bits_truncate(arg);

        let closure: Box<[ObjRef]> = if flags.contains(MakeFunctionFlags::CLOSURE) {
            let cells = frame.pop()?;
            let Some(items) = cells.as_object().and_then(|o| o.as_tuple()) else {
                return Err(bad_operand(Op::MakeFunction));
            };
            items
                .iter()
                .map(|item| match item {
                    Value::Object(cell) if cell.as_cell().is_some() => Ok(cell.clone()),
                    _ => Err(bad_operand(Op::MakeFunction)),
                })
                .collect::<RunResult<_>>()?
        } else {
            Box::new([])
        };
        if closure.len() != code.freevars.len() {
            return Err(RunError::new(
                ExcType::SystemError,
                format!(
                    "{} expects {} closure cells, got {}",
                    code.name,
                    code.freevars.len(),
                    closure.len()
                ),
            ));
        }

        let kw_defaults = if flags.contains(MakeFunctionFlags::KW_DEFAULTS) {
            self.keyword_arguments(&frame.pop()?)?
        } else {
            code.kw_defaults.to_vec()
        };
        let defaults = if flags.contains(MakeFunctionFlags::DEFAULTS) {
            self.collect_values(&frame.pop()?)?
        } else {
            code.defaults.to_vec()
        };
        if defaults.len() > code.arg_count {
            return Err(RunError::new(
                ExcType::SystemError,
                format!(
                    "{} takes {} positional parameters but got {} defaults",
                    code.name,
                    code.arg_count,
                    defaults.len()
                ),
            ));
        }
        Ok(self.new_function(
            code,
            frame.globals.clone(),
            defaults,
            kw_defaults,
            closure,
        ))
    }

    /// Keyword pairs out of a dict with string keys.
    fn keyword_arguments(
        &self,
        mapping: &Value,
    ) -> RunResult<Vec<(Arc<str>, Value)>> {
        let Some(dict) = mapping.as_object().and_then(|o| o.as_dict()) else {
            return Err(RunError::type_error(format!(
                "argument after ** must be a mapping, not {}",
                mapping.type_name()
            )));
        };
        dict.read()
            .iter()
            .map(|(key, value)| match key {
                Value::Str(name) => Ok((name.clone(), value.clone())),
                _ => Err(RunError::type_error("keywords must be strings")),
            })
            .collect()
    }

    pub(crate) fn new_set(&self, items: Vec<Value>) -> RunResult<Value> {
        let mut set = crate::Set::new();
        for item in items {
            set.insert(item.hash_key()?, item);
        }
        Ok(self.vm.heap.new_set(set))
    }

    /// Imports a module: already loaded ones come from the registry,
    /// native ones are created on first import.
    pub fn import(&mut self, name: &str) -> RunResult<ObjRef> {
        if let Some(module) = self.vm.shared.module(name) {
            return Ok(module);
        }
        let Some(module) = crate::modules::create_native_module(self, name)
        else {
            return Err(RunError::new(
                ExcType::ModuleNotFoundError,
                format!("No module named '{name}'"),
            ));
        };
        debug!("loaded native module {name}");
        Ok(self.vm.shared.register_module(name, module))
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        debug_assert_eq!(self.managed, 0, "interpreter dropped while running");
    }
}

/// `true` when `target` appears in the context chain of `start`.
fn chain_contains(start: &ObjRef, target: &ObjRef) -> bool {
    let mut current = start.clone();
    for _ in 0..100 {
        let next = current
            .as_exception()
            .and_then(|exc| exc.context.read().clone());
        match next {
            Some(Value::Object(next)) if next.ptr_eq(target) => return true,
            Some(Value::Object(next)) => current = next,
            _ => return false,
        }
    }
    false
}

fn keyword_names(names: &Value) -> RunResult<Vec<Arc<str>>> {
    let Some(items) = names.as_object().and_then(|o| o.as_tuple()) else {
        return Err(bad_operand(Op::CallFunctionKw));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Str(name) => Ok(name.clone()),
            _ => Err(RunError::type_error("keywords must be strings")),
        })
        .collect()
}

pub(crate) fn dict_get(dict: &ObjRef, name: &str) -> Option<Value> {
    dict.as_dict()
        .and_then(|dict| dict.read().get_str(name).cloned())
}

pub(crate) fn dict_set(dict: &ObjRef, name: &str, value: Value) {
    if let Some(dict) = dict.as_dict() {
        dict.write().set_str(name, value);
    }
}

fn dict_del(dict: &ObjRef, name: &str) -> bool {
    dict.as_dict().is_some_and(|dict| {
        dict.write()
            .remove(&crate::HashKey::Str(Arc::from(name)))
            .is_some()
    })
}

fn name_error(name: &str) -> RunError {
    RunError::new(ExcType::NameError, format!("name '{name}' is not defined"))
}

fn unbound_local(name: &str) -> RunError {
    RunError::new(
        ExcType::UnboundLocalError,
        format!("local variable '{name}' referenced before assignment"),
    )
}

fn missing_cell(code: &CodeObject, index: usize) -> RunError {
    RunError::new(
        ExcType::SystemError,
        format!("{}: no cell for slot {index}", code.name),
    )
}

fn unbound_cell(code: &CodeObject, index: usize) -> RunError {
    let name = code.cell_name(index).map_or("?", |name| &**name);
    if index < code.cellvars.len() {
        unbound_local(name)
    } else {
        RunError::new(
            ExcType::NameError,
            format!(
                "free variable '{name}' referenced before assignment in enclosing scope"
            ),
        )
    }
}

fn bad_operand(op: Op) -> RunError {
    RunError::new(ExcType::SystemError, format!("bad operand for {}", op.name()))
}

fn underflow() -> RunError {
    RunError::new(ExcType::SystemError, "operand stack underflow")
}
