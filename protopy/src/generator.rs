//! Generator and coroutine controller.
//!
//! A generator owns its frame while suspended. Resuming takes the frame out
//! of the slot, runs it on the resuming thread's interpreter and parks it
//! again on the next yield, so any thread may drive a generator but only
//! one at a time.
use std::{fmt, sync::Arc};

use log::trace;
use parking_lot::Mutex;

use crate::{
    ExcType, Frame, FrameExit, Interpreter, IterStep, ObjRef, Resume,
    RunError, RunResult, Value, Visitable, Visitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Generator,
    Coroutine,
}

impl GeneratorKind {
    pub fn name(self) -> &'static str {
        match self {
            GeneratorKind::Generator => "generator",
            GeneratorKind::Coroutine => "coroutine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, body not started.
    Fresh,
    Running,
    Suspended,
    /// Body returned.
    Completed,
    /// Body raised.
    Raised,
    Closed,
}

impl GeneratorState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            GeneratorState::Completed
                | GeneratorState::Raised
                | GeneratorState::Closed
        )
    }
}

impl fmt::Display for GeneratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GeneratorState::Fresh => "fresh",
            GeneratorState::Running => "running",
            GeneratorState::Suspended => "suspended",
            GeneratorState::Completed => "completed",
            GeneratorState::Raised => "raised",
            GeneratorState::Closed => "closed",
        })
    }
}

/// Result of driving a generator one step.
#[derive(Debug, Clone, PartialEq)]
pub enum GenResult {
    Yield(Value),
    Return(Value),
}

#[derive(Debug)]
struct Slot {
    state: GeneratorState,
    frame: Option<Box<Frame>>,
}

#[derive(Debug)]
pub struct Generator {
    pub kind: GeneratorKind,
    pub name: Arc<str>,
    slot: Mutex<Slot>,
}

impl Generator {
    #[must_use]
    pub fn new(kind: GeneratorKind, name: Arc<str>, frame: Box<Frame>) -> Self {
        Self {
            kind,
            name,
            slot: Mutex::new(Slot {
                state: GeneratorState::Fresh,
                frame: Some(frame),
            }),
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.slot.lock().state
    }

    /// Takes the frame out for resumption. Returns whether the body has
    /// not started yet.
    fn begin(&self) -> RunResult<(Box<Frame>, bool)> {
        let mut slot = self.slot.lock();
        match slot.state {
            GeneratorState::Fresh | GeneratorState::Suspended => (),
            GeneratorState::Running => {
                return Err(RunError::value_error(format!(
                    "{} already executing",
                    self.kind.name()
                )));
            }
            state => return Err(self.finished_error(state)),
        }
        let Some(frame) = slot.frame.take() else {
            return Err(RunError::new(
                ExcType::SystemError,
                "suspended generator without a frame",
            ));
        };
        let fresh = slot.state == GeneratorState::Fresh;
        slot.state = GeneratorState::Running;
        Ok((frame, fresh))
    }

    fn finished_error(&self, state: GeneratorState) -> RunError {
        let message = match (self.kind, state) {
            (GeneratorKind::Coroutine, _) => {
                "cannot reuse already awaited coroutine"
            }
            (_, GeneratorState::Closed) => "cannot resume closed generator",
            _ => "cannot resume finished generator",
        };
        RunError::runtime_error(message)
    }

    fn park(&self, frame: Box<Frame>, state: GeneratorState) {
        let mut slot = self.slot.lock();
        slot.frame = Some(frame);
        slot.state = state;
    }

    fn finish(&self, state: GeneratorState) {
        self.discard(state);
    }

    /// Drops the parked frame and moves to a terminal state.
    pub(crate) fn discard(&self, state: GeneratorState) -> Option<Box<Frame>> {
        let mut slot = self.slot.lock();
        slot.state = state;
        slot.frame.take()
    }
}

impl Visitable for Generator {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        // a running frame lives on some thread's stack and is a root there
        if let Some(frame) = &self.slot.lock().frame {
            frame.visit_edges(visitor);
        }
    }
}

fn expect_generator(object: &ObjRef) -> RunResult<&Generator> {
    object.as_generator().ok_or_else(|| {
        RunError::type_error(format!(
            "expected a generator, got '{}'",
            object.type_name()
        ))
    })
}

impl From<GenResult> for IterStep {
    fn from(result: GenResult) -> Self {
        match result {
            GenResult::Yield(value) => IterStep::Yielded(value),
            GenResult::Return(value) => IterStep::Exhausted(value),
        }
    }
}

impl Interpreter {
    /// Advances a generator, sending `value` as the result of the pending
    /// yield. A fresh generator only accepts `None`.
    pub fn gen_send(
        &mut self,
        object: &ObjRef,
        value: Value,
    ) -> RunResult<GenResult> {
        let generator = expect_generator(object)?;
        self.check_depth()?;
        let (frame, fresh) = generator.begin()?;
        if fresh && !value.is_none() {
            generator.park(frame, GeneratorState::Fresh);
            return Err(RunError::type_error(format!(
                "can't send non-None value to a just-started {}",
                generator.kind.name()
            )));
        }
        let resume = if fresh {
            Resume::Start
        } else {
            Resume::Send(value)
        };
        self.run_generator(generator, frame, resume)
    }

    /// Raises `error` at the generator's suspension point.
    pub fn gen_throw(
        &mut self,
        object: &ObjRef,
        error: RunError,
    ) -> RunResult<GenResult> {
        let generator = expect_generator(object)?;
        self.check_depth()?;
        let (mut frame, fresh) = generator.begin()?;
        if fresh {
            generator.finish(GeneratorState::Raised);
            return Err(error);
        }

        let Some(inner) = frame.delegate().cloned() else {
            return self.run_generator(generator, frame, Resume::Throw(error));
        };
        let forwarded = self.counting_frame(|interp| {
            if error.is_instance(ExcType::GeneratorExit) {
                interp.close_iterator(&inner).and(Err(error))
            } else {
                interp.throw_into(&inner, error)
            }
        });
        let resume = match forwarded {
            Ok(IterStep::Yielded(value)) => {
                generator.park(frame, GeneratorState::Suspended);
                return Ok(GenResult::Yield(value));
            }
            Ok(IterStep::Exhausted(value)) => Resume::Send(value),
            Err(err) => Resume::Throw(err),
        };
        // delegation is over; continue after the YIELD_FROM
        frame.stack.pop();
        frame.delegating = false;
        frame.ip += 1;
        self.run_generator(generator, frame, resume)
    }

    /// Closes a generator. Fresh and finished generators close without
    /// running code; a suspended one gets `GeneratorExit` at its
    /// suspension point.
    pub fn gen_close(&mut self, object: &ObjRef) -> RunResult<()> {
        let generator = expect_generator(object)?;
        match generator.state() {
            GeneratorState::Fresh => {
                generator.discard(GeneratorState::Closed);
                return Ok(());
            }
            GeneratorState::Suspended | GeneratorState::Running => (),
            GeneratorState::Completed
            | GeneratorState::Raised
            | GeneratorState::Closed => return Ok(()),
        }

        let exit = self.new_exception(ExcType::GeneratorExit, Vec::new());
        match self.gen_throw(object, RunError::Raised(exit)) {
            Ok(GenResult::Yield(_)) => Err(RunError::runtime_error(format!(
                "{} ignored GeneratorExit",
                generator.kind.name()
            ))),
            Ok(GenResult::Return(_)) => {
                generator.finish(GeneratorState::Closed);
                Ok(())
            }
            Err(err)
                if err.is_instance(ExcType::GeneratorExit)
                    || escaped_stop_iteration(&err) =>
            {
                generator.finish(GeneratorState::Closed);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn run_generator(
        &mut self,
        generator: &Generator,
        frame: Box<Frame>,
        resume: Resume,
    ) -> RunResult<GenResult> {
        trace!("resume {} {}", generator.kind.name(), generator.name);
        match self.execute(frame, resume) {
            Ok(FrameExit::Yield(value, frame)) => {
                generator.park(frame, GeneratorState::Suspended);
                Ok(GenResult::Yield(value))
            }
            Ok(FrameExit::Return(value)) => {
                generator.finish(GeneratorState::Completed);
                Ok(GenResult::Return(value))
            }
            Err(err) => {
                generator.finish(GeneratorState::Raised);
                if err.is_instance(ExcType::StopIteration) {
                    let message =
                        format!("{} raised StopIteration", generator.kind.name());
                    return Err(self.chained(
                        ExcType::RuntimeError,
                        message,
                        err,
                    ));
                }
                Err(err)
            }
        }
    }

    /// Forwards `error` into a delegated-to iterator. `Err` carries what
    /// the delegating frame should raise.
    fn throw_into(
        &mut self,
        inner: &Value,
        error: RunError,
    ) -> RunResult<IterStep> {
        if let Some(object) = inner.as_object().filter(|o| o.as_generator().is_some())
        {
            return self.gen_throw(object, error).map(IterStep::from);
        }
        let Some(throw) = self.lookup_method(inner, "throw")? else {
            return Err(error);
        };
        let exception = self.exception_value(error);
        match self.call_value(&throw, crate::Args::new(vec![exception])) {
            Ok(value) => Ok(IterStep::Yielded(value)),
            Err(err) if err.is_instance(ExcType::StopIteration) => {
                Ok(IterStep::Exhausted(stop_value(&err)))
            }
            Err(err) => Err(err),
        }
    }

    fn close_iterator(&mut self, inner: &Value) -> RunResult<()> {
        if let Some(object) = inner.as_object().filter(|o| o.as_generator().is_some())
        {
            return self.gen_close(object);
        }
        if let Some(close) = self.lookup_method(inner, "close")? {
            self.call_value(&close, crate::Args::default())?;
        }
        Ok(())
    }
}

/// A `StopIteration` that left a generator body, already wrapped into a
/// `RuntimeError`.
fn escaped_stop_iteration(error: &RunError) -> bool {
    let RunError::Raised(exception) = error else {
        return false;
    };
    let Some(exception) = exception.as_exception() else {
        return false;
    };
    let cause = exception.cause.read();
    error.is_instance(ExcType::RuntimeError)
        && cause.as_ref().and_then(Value::as_object).is_some_and(|cause| {
            RunError::Raised(cause.clone()).is_instance(ExcType::StopIteration)
        })
}

/// Payload of a `StopIteration`.
pub fn stop_value(error: &RunError) -> Value {
    match error {
        RunError::Raised(exception) => exception
            .as_exception()
            .map_or(Value::None, |e| e.first_arg()),
        RunError::Pending { .. } => Value::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Args, BinaryOp, CodeBuilder, Op, VM, VMCreateInfo};

    fn interpreter() -> Interpreter {
        let vm = VM::new(VMCreateInfo::default());
        Interpreter::new(vm.new_proxy())
    }

    /// def g(): yield 1; yield 2; return 3
    fn one_two_three(interp: &mut Interpreter) -> ObjRef {
        let mut b = CodeBuilder::new("g").generator();
        b.load_const(1).op(Op::YieldValue).op(Op::PopTop);
        b.load_const(2).op(Op::YieldValue).op(Op::PopTop);
        b.load_const(3).return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let value = interp.call_value(&function, Args::default()).unwrap();
        value.as_object().unwrap().clone()
    }

    #[test]
    fn yields_then_returns_exactly_once() {
        let mut interp = interpreter();
        let g = one_two_three(&mut interp);
        let generator = g.as_generator().unwrap();
        assert_eq!(generator.state(), GeneratorState::Fresh);

        assert_eq!(interp.gen_send(&g, Value::None), Ok(GenResult::Yield(Value::Int(1))));
        assert_eq!(generator.state(), GeneratorState::Suspended);
        assert_eq!(interp.gen_send(&g, Value::None), Ok(GenResult::Yield(Value::Int(2))));
        assert_eq!(interp.gen_send(&g, Value::None), Ok(GenResult::Return(Value::Int(3))));
        assert_eq!(generator.state(), GeneratorState::Completed);

        let err = interp.gen_send(&g, Value::None).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
    }

    #[test]
    fn fresh_generators_reject_values_and_close_quietly() {
        let mut interp = interpreter();
        let g = one_two_three(&mut interp);
        let err = interp.gen_send(&g, Value::Int(5)).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
        assert_eq!(g.as_generator().unwrap().state(), GeneratorState::Fresh);

        interp.gen_close(&g).unwrap();
        interp.gen_close(&g).unwrap();
        assert_eq!(g.as_generator().unwrap().state(), GeneratorState::Closed);
    }

    #[test]
    fn throw_into_a_fresh_generator_raises_immediately() {
        let mut interp = interpreter();
        let g = one_two_three(&mut interp);
        let err = interp
            .gen_throw(&g, RunError::value_error("early"))
            .unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
        assert_eq!(g.as_generator().unwrap().state(), GeneratorState::Raised);
    }

    /// def g():
    ///     try: yield 1
    ///     except GeneratorExit: hits.append(1); raise
    fn guarded(interp: &mut Interpreter, hits: &Value) -> ObjRef {
        let mut b = CodeBuilder::new("guarded").generator();
        let handler = b.label();
        let other = b.label();
        b.setup_except(handler);
        b.load_const(1).op(Op::YieldValue).op(Op::PopTop);
        b.op(Op::PopBlock).load_none().return_value();
        b.bind(handler);
        b.op(Op::DupTop).load_global("GeneratorExit");
        b.jump_if_not_exc_match(other);
        b.load_global("hits").load_attr("append").load_const(1).call(1);
        b.op(Op::PopTop).op(Op::Reraise);
        b.bind(other);
        b.op(Op::Reraise);
        let code = b.build().unwrap();
        let function = interp.make_function_from_code(code);
        interp.set_global("hits", hits.clone());
        let value = interp.call_value(&function, Args::default()).unwrap();
        value.as_object().unwrap().clone()
    }

    #[test]
    fn close_runs_the_pending_handler_once() {
        let mut interp = interpreter();
        let hits = interp.vm.heap.new_list(vec![]);
        let g = guarded(&mut interp, &hits);
        assert_eq!(interp.gen_send(&g, Value::None), Ok(GenResult::Yield(Value::Int(1))));

        interp.gen_close(&g).unwrap();
        interp.gen_close(&g).unwrap();
        let hits = hits.as_object().unwrap().as_list().unwrap().read().len();
        assert_eq!(hits, 1);
        assert_eq!(g.as_generator().unwrap().state(), GeneratorState::Closed);

        let err = interp.gen_send(&g, Value::None).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
    }

    #[test]
    fn ignoring_generator_exit_is_an_error() {
        // def g():
        //     while True:
        //         try: yield 1
        //         except GeneratorExit: pass
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("stubborn").generator();
        let top = b.label();
        let handler = b.label();
        b.bind(top);
        b.setup_except(handler);
        b.load_const(1).op(Op::YieldValue).op(Op::PopTop);
        b.op(Op::PopBlock).jump(top);
        b.bind(handler);
        b.op(Op::PopTop).op(Op::PopExcept).jump(top);
        let function = interp.make_function_from_code(b.build().unwrap());
        let g = interp.call_value(&function, Args::default()).unwrap();
        let g = g.as_object().unwrap();

        interp.gen_send(g, Value::None).unwrap();
        let err = interp.gen_close(g).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
        assert!(err.message().contains("ignored GeneratorExit"));
        assert_eq!(g.as_generator().unwrap().state(), GeneratorState::Suspended);
    }

    #[test]
    fn stop_iteration_escaping_the_body_becomes_runtime_error() {
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("leaky").generator();
        b.load_global("StopIteration").emit(Op::RaiseVarargs, 1);
        b.load_none().op(Op::YieldValue).return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let g = interp.call_value(&function, Args::default()).unwrap();
        let err = interp
            .gen_send(g.as_object().unwrap(), Value::None)
            .unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
        let RunError::Raised(exception) = err else {
            panic!("expected a raised exception");
        };
        let cause = exception.as_exception().unwrap().cause.read().clone();
        assert!(matches!(cause, Some(Value::Object(_))));
    }

    #[test]
    fn yield_from_returns_the_inner_payload() {
        // def outer(): r = yield from inner(); return r * 10
        let mut interp = interpreter();
        let g = one_two_three(&mut interp);
        interp.set_global("inner_gen", Value::Object(g));

        let mut b = CodeBuilder::new("outer").generator();
        b.load_global("inner_gen").op(Op::GetYieldFromIter);
        b.load_none().op(Op::YieldFrom);
        b.load_const(10).binary(BinaryOp::Mul).return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let outer = interp.call_value(&function, Args::default()).unwrap();
        let outer = outer.as_object().unwrap();

        assert_eq!(interp.gen_send(outer, Value::None), Ok(GenResult::Yield(Value::Int(1))));
        assert_eq!(interp.gen_send(outer, Value::None), Ok(GenResult::Yield(Value::Int(2))));
        assert_eq!(interp.gen_send(outer, Value::None), Ok(GenResult::Return(Value::Int(30))));
    }

    #[test]
    fn throw_down_a_delegation_chain_counts_every_level() {
        // def relay(inner): return (yield from inner)
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("relay").args(&["inner"]).generator();
        b.load_fast("inner").op(Op::GetYieldFromIter);
        b.load_none().op(Op::YieldFrom).return_value();
        let relay = interp.make_function_from_code(b.build().unwrap());

        let mut chain = Value::Object(one_two_three(&mut interp));
        for _ in 0..5 {
            chain = interp.call_value(&relay, Args::new(vec![chain])).unwrap();
        }
        let outer = chain.as_object().unwrap();
        assert_eq!(interp.gen_send(outer, Value::None), Ok(GenResult::Yield(Value::Int(1))));

        interp.vm.shared.set_recursion_limit(3);
        let err = interp.gen_throw(outer, RunError::value_error("x")).unwrap_err();
        assert!(err.is_instance(ExcType::RecursionError), "{err}");
        assert_eq!(interp.depth(), 0);
        assert_eq!(outer.as_generator().unwrap().state(), GeneratorState::Raised);
    }

    #[test]
    fn throw_reaches_a_handler_in_the_generator() {
        // def g():
        //     try: yield 1
        //     except ValueError: yield 99
        //     return 0
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("catcher").generator();
        let handler = b.label();
        let done = b.label();
        b.setup_except(handler);
        b.load_const(1).op(Op::YieldValue).op(Op::PopTop);
        b.op(Op::PopBlock).jump(done);
        b.bind(handler);
        b.op(Op::PopTop);
        b.load_const(99).op(Op::YieldValue).op(Op::PopTop);
        b.op(Op::PopExcept);
        b.bind(done);
        b.load_const(0).return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let g = interp.call_value(&function, Args::default()).unwrap();
        let g = g.as_object().unwrap();

        interp.gen_send(g, Value::None).unwrap();
        let result = interp.gen_throw(g, RunError::value_error("x"));
        assert_eq!(result, Ok(GenResult::Yield(Value::Int(99))));
        let result = interp.gen_send(g, Value::None);
        assert_eq!(result, Ok(GenResult::Return(Value::Int(0))));
    }
}
