//! Iteration protocol and the await/delegation helpers built on it.
use parking_lot::Mutex;

use super::Interpreter;
use crate::{
    Advance, Args, ExcType, GeneratorKind, IterState, ObjectData, RunError,
    RunResult, Value, generator::stop_value,
};

/// One step of an iterator.
#[derive(Debug, Clone, PartialEq)]
pub enum IterStep {
    Yielded(Value),
    /// The iterator is done; carries the `StopIteration` value.
    Exhausted(Value),
}

enum Nested {
    Enumerate(Value, i64),
    Zip(Vec<Value>),
}

impl Interpreter {
    /// `iter(value)`.
    pub fn get_iter(&mut self, iterable: &Value) -> RunResult<Value> {
        let state = match iterable {
            Value::Str(text) => IterState::Str {
                text: text.clone(),
                offset: 0,
            },
            Value::Bytes(bytes) => IterState::Bytes {
                bytes: bytes.clone(),
                index: 0,
            },
            Value::Object(object) => match &object.data {
                ObjectData::List(_) | ObjectData::Tuple(_) => IterState::Seq {
                    seq: object.clone(),
                    index: 0,
                },
                ObjectData::Dict(dict) => IterState::Items {
                    items: dict.read().keys().cloned().collect(),
                    index: 0,
                },
                ObjectData::Set(set) => IterState::Items {
                    items: set.read().values().cloned().collect(),
                    index: 0,
                },
                ObjectData::Range(range) => IterState::Range {
                    range: *range,
                    index: 0,
                },
                ObjectData::Iterator(_) => return Ok(iterable.clone()),
                ObjectData::Generator(generator) => {
                    if generator.kind == GeneratorKind::Coroutine {
                        return Err(not_iterable(iterable));
                    }
                    return Ok(iterable.clone());
                }
                _ => {
                    let Some(method) = self.user_method(iterable, "__iter__") else {
                        return Err(not_iterable(iterable));
                    };
                    let iterator = self.call_value(&method, Args::default())?;
                    if !self.is_iterator(&iterator) {
                        return Err(RunError::type_error(format!(
                            "iter() returned non-iterator of type '{}'",
                            iterator.type_name()
                        )));
                    }
                    return Ok(iterator);
                }
            },
            _ => return Err(not_iterable(iterable)),
        };
        Ok(self.new_iterator(state))
    }

    pub(crate) fn new_iterator(&self, state: IterState) -> Value {
        let object = self.vm.heap.allocate(ObjectData::Iterator(Mutex::new(state)));
        Value::Object(object)
    }

    pub(crate) fn is_iterator(&mut self, value: &Value) -> bool {
        match value.as_object().map(|o| &o.data) {
            Some(ObjectData::Iterator(_)) => true,
            Some(ObjectData::Generator(generator)) => {
                generator.kind == GeneratorKind::Generator
            }
            _ => self.user_method(value, "__next__").is_some(),
        }
    }

    /// `next(iterator)`, with exhaustion reported as a value instead of a
    /// `StopIteration` error.
    pub fn advance(&mut self, iterator: &Value) -> RunResult<IterStep> {
        if let Some(object) = iterator.as_object() {
            match &object.data {
                ObjectData::Iterator(state) => {
                    let step = state.lock().advance();
                    return match step {
                        Advance::Item(value) => Ok(IterStep::Yielded(value)),
                        Advance::Exhausted => Ok(IterStep::Exhausted(Value::None)),
                        Advance::Nested => self.advance_nested(state),
                    };
                }
                ObjectData::Generator(generator) => {
                    if generator.state().is_finished() {
                        return Ok(IterStep::Exhausted(Value::None));
                    }
                    return self.gen_send(object, Value::None).map(IterStep::from);
                }
                _ => (),
            }
        }
        let Some(method) = self.lookup_method(iterator, "__next__")? else {
            return Err(RunError::type_error(format!(
                "'{}' object is not an iterator",
                iterator.type_name()
            )));
        };
        match self.call_value(&method, Args::default()) {
            Ok(value) => Ok(IterStep::Yielded(value)),
            Err(err) if err.is_instance(ExcType::StopIteration) => {
                Ok(IterStep::Exhausted(stop_value(&err)))
            }
            Err(err) => Err(err),
        }
    }

    /// Advances iterators wrapping other iterators. The state lock is
    /// released while the inner iterators run.
    fn advance_nested(&mut self, state: &Mutex<IterState>) -> RunResult<IterStep> {
        let nested = match &*state.lock() {
            IterState::Enumerate { inner, count } => Nested::Enumerate(inner.clone(), *count),
            IterState::Zip { iters } => Nested::Zip(iters.clone()),
            _ => return Ok(IterStep::Exhausted(Value::None)),
        };
        let exhaust = || {
            *state.lock() = IterState::Exhausted;
            Ok(IterStep::Exhausted(Value::None))
        };
        match nested {
            Nested::Enumerate(inner, count) => match self.advance(&inner)? {
                IterStep::Yielded(value) => {
                    if let IterState::Enumerate { count, .. } = &mut *state.lock() {
                        *count += 1;
                    }
                    let pair = self.vm.heap.new_tuple(vec![Value::Int(count), value]);
                    Ok(IterStep::Yielded(pair))
                }
                IterStep::Exhausted(_) => exhaust(),
            },
            Nested::Zip(iters) => {
                if iters.is_empty() {
                    return exhaust();
                }
                let mut items = Vec::with_capacity(iters.len());
                for iterator in &iters {
                    match self.advance(iterator)? {
                        IterStep::Yielded(value) => items.push(value),
                        IterStep::Exhausted(_) => return exhaust(),
                    }
                }
                Ok(IterStep::Yielded(self.vm.heap.new_tuple(items)))
            }
        }
    }

    /// Sends `value` into a sub-iterator for `yield from`/`await`.
    pub(crate) fn send_to(&mut self, sub: &Value, value: Value) -> RunResult<IterStep> {
        if let Some(object) = sub.as_object().filter(|o| o.as_generator().is_some()) {
            return self.gen_send(object, value).map(IterStep::from);
        }
        if value.is_none() {
            return self.advance(sub);
        }
        let Some(send) = self.lookup_method(sub, "send")? else {
            return Err(RunError::new(
                ExcType::AttributeError,
                format!("'{}' object has no attribute 'send'", sub.type_name()),
            ));
        };
        match self.call_value(&send, Args::new(vec![value])) {
            Ok(value) => Ok(IterStep::Yielded(value)),
            Err(err) if err.is_instance(ExcType::StopIteration) => {
                Ok(IterStep::Exhausted(stop_value(&err)))
            }
            Err(err) => Err(err),
        }
    }

    /// Iterator driven by `await value`.
    pub(crate) fn get_awaitable(&mut self, value: &Value) -> RunResult<Value> {
        if let Some(generator) = value.as_object().and_then(|o| o.as_generator())
            && generator.kind == GeneratorKind::Coroutine
        {
            return Ok(value.clone());
        }
        let Some(method) = self.lookup_method(value, "__await__")? else {
            return Err(RunError::type_error(format!(
                "object {} can't be used in 'await' expression",
                value.type_name()
            )));
        };
        let iterator = self.call_value(&method, Args::default())?;
        let coroutine = iterator
            .as_object()
            .and_then(|o| o.as_generator())
            .is_some_and(|g| g.kind == GeneratorKind::Coroutine);
        if coroutine {
            return Err(RunError::type_error("__await__() returned a coroutine"));
        }
        if !self.is_iterator(&iterator) {
            return Err(RunError::type_error(format!(
                "__await__() returned non-iterator of type '{}'",
                iterator.type_name()
            )));
        }
        Ok(iterator)
    }

    /// Drains an iterable into a vector.
    pub fn collect_values(&mut self, iterable: &Value) -> RunResult<Vec<Value>> {
        if let Some(object) = iterable.as_object() {
            match &object.data {
                ObjectData::List(items) => return Ok(items.read().clone()),
                ObjectData::Tuple(items) => return Ok(items.to_vec()),
                _ => (),
            }
        }
        let iterator = self.get_iter(iterable)?;
        let mut items = Vec::new();
        while let IterStep::Yielded(value) = self.advance(&iterator)? {
            items.push(value);
        }
        Ok(items)
    }
}

fn not_iterable(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not iterable", value.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, CodeBuilder, GenResult, Op, VM, VMCreateInfo};

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    #[test]
    fn enumerate_and_zip_wrap_other_iterators() {
        let mut interp = interpreter();
        let list = interp.vm.heap.new_list(vec![Value::str("a"), Value::str("b")]);
        let inner = interp.get_iter(&list).unwrap();
        let enumerate = interp.new_iterator(IterState::Enumerate { inner, count: 0 });
        let pairs = interp.collect_values(&enumerate).unwrap();
        assert_eq!(interp.repr(&interp.vm.heap.new_list(pairs)).unwrap(), "[(0, 'a'), (1, 'b')]");

        let left = interp.get_iter(&Value::str("xyz")).unwrap();
        let right = interp.get_iter(&list).unwrap();
        let zip = interp.new_iterator(IterState::Zip { iters: vec![left, right] });
        assert_eq!(interp.collect_values(&zip).unwrap().len(), 2);
        let empty = interp.new_iterator(IterState::Zip { iters: vec![] });
        assert_eq!(interp.advance(&empty), Ok(IterStep::Exhausted(Value::None)));
    }

    #[test]
    fn dicts_iterate_over_a_key_snapshot() {
        let mut interp = interpreter();
        let mut dict = crate::Dict::new();
        dict.set_str("a", Value::Int(1));
        let dict = Value::Object(interp.vm.heap.new_dict(dict));
        let iterator = interp.get_iter(&dict).unwrap();
        interp.setitem(&dict, &Value::str("b"), Value::Int(2)).unwrap();
        assert_eq!(interp.collect_values(&iterator).unwrap(), vec![Value::str("a")]);
    }

    #[test]
    fn non_iterables_are_rejected() {
        let mut interp = interpreter();
        let err = interp.get_iter(&Value::Int(3)).unwrap_err();
        assert_eq!(err.message(), "'int' object is not iterable");
        let err = interp.advance(&Value::Int(3)).unwrap_err();
        assert_eq!(err.message(), "'int' object is not an iterator");
    }

    #[test]
    fn await_drives_a_nested_coroutine() {
        // async def inner(): return 5
        // async def outer(): return (await inner()) + 1
        let mut interp = interpreter();
        let mut inner = CodeBuilder::new("inner").coroutine();
        inner.load_const(5).return_value();
        let inner = interp.make_function_from_code(inner.build().unwrap());
        interp.set_global("inner", inner);

        let mut outer = CodeBuilder::new("outer").coroutine();
        outer.load_global("inner").call(0).op(Op::GetAwaitable);
        outer.load_none().op(Op::YieldFrom);
        outer.load_const(1).binary(BinaryOp::Add).return_value();
        let outer = interp.make_function_from_code(outer.build().unwrap());

        let coroutine = interp.call_value(&outer, Args::default()).unwrap();
        let coroutine = coroutine.as_object().unwrap();
        assert_eq!(interp.gen_send(coroutine, Value::None), Ok(GenResult::Return(Value::Int(6))));
        let err = interp.gen_send(coroutine, Value::None).unwrap_err();
        assert_eq!(err.message(), "cannot reuse already awaited coroutine");
    }

    #[test]
    fn await_on_a_custom_awaitable_suspends_the_caller() {
        // def ticks(): x = yield "tick"; return x * 2
        // class A:
        //     def __await__(self): return ticks()
        // async def outer(): return await A()
        let mut interp = interpreter();
        let mut ticks = CodeBuilder::new("ticks").generator();
        ticks.load_const("tick").op(Op::YieldValue).store_fast("x");
        ticks.load_fast("x").load_const(2).binary(BinaryOp::Mul).return_value();
        let ticks = interp.make_function_from_code(ticks.build().unwrap());
        interp.set_global("ticks", ticks);

        let mut await_ = CodeBuilder::new("__await__").args(&["self"]);
        await_.load_global("ticks").call(0).return_value();
        let mut body = CodeBuilder::new("A");
        body.make_function(await_.build().unwrap(), 0).store_name("__await__");
        body.load_none().return_value();
        let mut module = CodeBuilder::new("<module>");
        module.op(Op::LoadBuildClass);
        module.make_function(body.build().unwrap(), 0).load_const("A").call(2);
        module.store_global("A").load_none().return_value();
        interp.run_code(module.build().unwrap()).unwrap();

        let mut outer = CodeBuilder::new("outer").coroutine();
        outer.load_global("A").call(0).op(Op::GetAwaitable);
        outer.load_none().op(Op::YieldFrom).return_value();
        let outer = interp.make_function_from_code(outer.build().unwrap());
        let coroutine = interp.call_value(&outer, Args::default()).unwrap();
        let coroutine = coroutine.as_object().unwrap();

        assert_eq!(
            interp.gen_send(coroutine, Value::None),
            Ok(GenResult::Yield(Value::str("tick")))
        );
        assert_eq!(
            interp.gen_send(coroutine, Value::Int(21)),
            Ok(GenResult::Return(Value::Int(42)))
        );
    }

    #[test]
    fn awaiting_a_plain_value_fails() {
        let mut interp = interpreter();
        let err = interp.get_awaitable(&Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), "object int can't be used in 'await' expression");
    }
}
