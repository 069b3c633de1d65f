//! Object protocol: attributes, operators, comparisons, subscripts, truth
//! and text conversion. Container locks are only held while copying data
//! out, never across a call back into interpreted code.
use std::{cmp::Ordering, fmt::Write, sync::Arc};

use num_traits::Zero;

use super::{Interpreter, dict_get, dict_set};
use crate::{
    Args, BinaryOp, BoundMethod, CompareOp, Dict, ExcType, HashKey, ObjRef,
    ObjectData, Op, Range, RunError, RunResult, Set, Slice, Value,
    format_float, numeric,
    types::{builtin_types, class_of},
};

impl Interpreter {
    pub fn getattr(&mut self, target: &Value, name: &str) -> RunResult<Value> {
        match self.lookup_attr(target, name)? {
            Some(value) => Ok(value),
            None => Err(attribute_error(target, name)),
        }
    }

    /// Attribute lookup; `None` when the attribute does not exist.
    pub fn lookup_attr(
        &mut self,
        target: &Value,
        name: &str,
    ) -> RunResult<Option<Value>> {
        if name == "__class__" {
            return Ok(Some(Value::Object(class_of(target))));
        }
        let Value::Object(object) = target else {
            return self.lookup_method(target, name);
        };
        match &object.data {
            ObjectData::Instance(instance) => {
                let own = instance.dict.read().get_str(name).cloned();
                if own.is_some() {
                    return Ok(own);
                }
                let class = instance.class.as_class();
                if let Some(attr) = class.and_then(|c| c.lookup(name)) {
                    return Ok(Some(self.bind(target, attr)));
                }
                let hook = class.and_then(|c| c.lookup("__getattr__"));
                if let Some(hook) = hook {
                    let args = Args::new(vec![target.clone(), Value::str(name)]);
                    return self.call_value(&hook, args).map(Some);
                }
                Ok(None)
            }
            ObjectData::Class(class) => Ok(match name {
                "__name__" => Some(Value::Str(class.name.clone())),
                "__bases__" => {
                    let bases = class.bases.iter().cloned().map(Value::Object).collect();
                    Some(self.vm.heap.new_tuple(bases))
                }
                "__mro__" => {
                    let mro = std::iter::once(object.clone())
                        .chain(class.mro.iter().cloned())
                        .map(Value::Object)
                        .collect();
                    Some(self.vm.heap.new_tuple(mro))
                }
                _ => class.lookup(name),
            }),
            ObjectData::Module(module) => Ok(match name {
                "__name__" => Some(Value::Str(module.name.clone())),
                _ => dict_get(&module.globals, name),
            }),
            ObjectData::Exception(exception) => {
                let value = match name {
                    "args" => {
                        let args = exception.args.read().clone();
                        Some(self.vm.heap.new_tuple(args))
                    }
                    "__cause__" => Some(exception.cause.read().clone().unwrap_or(Value::None)),
                    "__context__" => {
                        Some(exception.context.read().clone().unwrap_or(Value::None))
                    }
                    "__suppress_context__" => Some(Value::Bool(
                        exception
                            .suppress_context
                            .load(std::sync::atomic::Ordering::Relaxed),
                    )),
                    "value"
                        if RunError::Raised(object.clone())
                            .is_instance(ExcType::StopIteration) =>
                    {
                        Some(exception.first_arg())
                    }
                    _ => exception.dict.read().get_str(name).cloned(),
                };
                if value.is_some() {
                    return Ok(value);
                }
                self.lookup_method(target, name)
            }
            ObjectData::Function(function) => Ok(match name {
                "__name__" => Some(Value::Str(function.name.clone())),
                "__code__" => Some(Value::Code(function.code.clone())),
                "__defaults__" => {
                    Some(self.vm.heap.new_tuple(function.defaults.to_vec()))
                }
                _ => function.dict.read().get_str(name).cloned(),
            }),
            ObjectData::NativeFunction(native) if name == "__name__" => {
                Ok(Some(Value::str(native.name)))
            }
            ObjectData::Generator(generator) if name == "__name__" => {
                Ok(Some(Value::Str(generator.name.clone())))
            }
            ObjectData::Thread(thread) => match name {
                "name" => Ok(Some(Value::Str(thread.name.clone()))),
                "ident" => Ok(Some(thread.ident().map_or(Value::None, |id| {
                    Value::Int(i64::try_from(id).unwrap_or(i64::MAX))
                }))),
                _ => self.lookup_method(target, name),
            },
            ObjectData::Slice(slice) => Ok(match name {
                "start" => Some(slice.start.clone()),
                "stop" => Some(slice.stop.clone()),
                "step" => Some(slice.step.clone()),
                _ => None,
            }),
            ObjectData::Range(range) => Ok(match name {
                "start" => Some(Value::Int(range.start)),
                "stop" => Some(Value::Int(range.stop)),
                "step" => Some(Value::Int(range.step)),
                _ => self.lookup_method(target, name)?,
            }),
            _ => self.lookup_method(target, name),
        }
    }

    /// Looks `name` up on the class of `value` only, binding functions to
    /// `value`. Special methods are resolved this way.
    pub fn lookup_method(
        &mut self,
        value: &Value,
        name: &str,
    ) -> RunResult<Option<Value>> {
        let class = class_of(value);
        let attr = class.as_class().and_then(|c| c.lookup(name));
        Ok(attr.map(|attr| self.bind(value, attr)))
    }

    fn bind(&self, receiver: &Value, attr: Value) -> Value {
        let is_function = attr.as_object().is_some_and(|o| {
            matches!(o.data, ObjectData::Function(_) | ObjectData::NativeFunction(_))
        });
        if !is_function {
            return attr;
        }
        let method = BoundMethod {
            receiver: receiver.clone(),
            function: attr,
        };
        Value::Object(self.vm.heap.allocate(ObjectData::BoundMethod(method)))
    }

    pub fn setattr(
        &mut self,
        target: &Value,
        name: &str,
        value: Value,
    ) -> RunResult<()> {
        let Value::Object(object) = target else {
            return Err(attribute_error(target, name));
        };
        match &object.data {
            ObjectData::Instance(instance) => {
                instance.dict.write().set_str(name, value);
            }
            ObjectData::Class(class) => {
                if class.builtin {
                    return Err(RunError::type_error(format!(
                        "cannot set '{name}' attribute of immutable type '{}'",
                        class.name
                    )));
                }
                class.dict.write().set_str(name, value);
            }
            ObjectData::Module(module) => dict_set(&module.globals, name, value),
            ObjectData::Function(function) => {
                function.dict.write().set_str(name, value);
            }
            ObjectData::Exception(exception) => match name {
                "__cause__" => {
                    let cause = self.exception_or_none(value, "cause")?;
                    *exception.cause.write() = cause;
                    exception
                        .suppress_context
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                }
                "__context__" => {
                    *exception.context.write() = self.exception_or_none(value, "context")?;
                }
                "__suppress_context__" => {
                    let flag = self.truthy(&value)?;
                    exception
                        .suppress_context
                        .store(flag, std::sync::atomic::Ordering::Relaxed);
                }
                "args" => *exception.args.write() = self.collect_values(&value)?,
                _ => {
                    exception.dict.write().set_str(name, value);
                }
            },
            _ => return Err(attribute_error(target, name)),
        }
        Ok(())
    }

    fn exception_or_none(&self, value: Value, what: &str) -> RunResult<Option<Value>> {
        match &value {
            Value::None => Ok(None),
            Value::Object(object) if object.as_exception().is_some() => Ok(Some(value)),
            _ => Err(RunError::type_error(format!(
                "exception {what} must be None or derive from BaseException"
            ))),
        }
    }

    pub fn delattr(&mut self, target: &Value, name: &str) -> RunResult<()> {
        let key = HashKey::Str(Arc::from(name));
        let removed = match target.as_object().map(|o| &o.data) {
            Some(ObjectData::Instance(instance)) => instance.dict.write().remove(&key),
            Some(ObjectData::Class(class)) if !class.builtin => {
                class.dict.write().remove(&key)
            }
            Some(ObjectData::Module(module)) => module
                .globals
                .as_dict()
                .and_then(|dict| dict.write().remove(&key)),
            Some(ObjectData::Function(function)) => function.dict.write().remove(&key),
            Some(ObjectData::Exception(exception)) => exception.dict.write().remove(&key),
            _ => None,
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(attribute_error(target, name)),
        }
    }

    /// Special method defined by a user class, bound to `value`.
    pub(crate) fn user_method(&self, value: &Value, name: &str) -> Option<Value> {
        let object = value.as_object()?;
        let class = match &object.data {
            ObjectData::Instance(instance) => &instance.class,
            ObjectData::Exception(exception) => &exception.class,
            _ => return None,
        };
        let info = class.as_class()?;
        if info.builtin {
            return None;
        }
        info.lookup(name).map(|attr| self.bind(value, attr))
    }

    /// Calls a user special method with one argument, mapping
    /// `NotImplemented` to `None`.
    fn call_special(
        &mut self,
        target: &Value,
        name: &str,
        other: &Value,
    ) -> RunResult<Option<Value>> {
        let Some(method) = self.user_method(target, name) else {
            return Ok(None);
        };
        let result = self.call_value(&method, Args::new(vec![other.clone()]))?;
        Ok((!is_not_implemented(&result)).then_some(result))
    }

    pub fn binary_op(
        &mut self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
    ) -> RunResult<Value> {
        if let Some(result) = numeric::binary(op, left, right) {
            return result;
        }
        if let Some(result) = self.sequence_op(op, left, right)? {
            return Ok(result);
        }
        if let Some(result) = self.call_special(left, op.dunder(), right)? {
            return Ok(result);
        }
        if let Some(result) = self.call_special(right, op.reflected_dunder(), left)? {
            return Ok(result);
        }
        Err(RunError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )))
    }

    fn sequence_op(
        &mut self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
    ) -> RunResult<Option<Value>> {
        let heap = &self.vm.heap;
        Ok(match (op, left, right) {
            (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
                Some(Value::from(format!("{a}{b}")))
            }
            (BinaryOp::Add, Value::Bytes(a), Value::Bytes(b)) => {
                Some(Value::Bytes([&a[..], &b[..]].concat().into()))
            }
            (BinaryOp::Mul, Value::Str(s), count) | (BinaryOp::Mul, count, Value::Str(s))
                if count.is_int() =>
            {
                Some(Value::from(s.repeat(repeat_count(count)?)))
            }
            (BinaryOp::Mul, Value::Bytes(b), count) | (BinaryOp::Mul, count, Value::Bytes(b))
                if count.is_int() =>
            {
                Some(Value::Bytes(b.repeat(repeat_count(count)?).into()))
            }
            (_, Value::Object(a), Value::Object(b)) => match (op, &a.data, &b.data) {
                (BinaryOp::Add, ObjectData::List(x), ObjectData::List(y)) => {
                    let mut items = x.read().clone();
                    items.extend(y.read().iter().cloned());
                    Some(heap.new_list(items))
                }
                (BinaryOp::Add, ObjectData::Tuple(x), ObjectData::Tuple(y)) => {
                    Some(heap.new_tuple([&x[..], &y[..]].concat()))
                }
                (
                    BinaryOp::Or | BinaryOp::And | BinaryOp::Sub | BinaryOp::Xor,
                    ObjectData::Set(x),
                    ObjectData::Set(y),
                ) => {
                    // one guard at a time: `s | s` reads the same lock twice
                    let x = x.read().clone();
                    let y = y.read().clone();
                    Some(heap.new_set(set_op(op, &x, &y)))
                }
                (BinaryOp::Or, ObjectData::Dict(x), ObjectData::Dict(y)) => {
                    let mut merged = x.read().clone();
                    for (key, value) in y.read().iter() {
                        merged.insert(key.hash_key()?, key.clone(), value.clone());
                    }
                    Some(Value::Object(heap.new_dict(merged)))
                }
                _ => None,
            },
            (BinaryOp::Mul, Value::Object(seq), count)
            | (BinaryOp::Mul, count, Value::Object(seq))
                if count.is_int() =>
            {
                let times = repeat_count(count)?;
                match &seq.data {
                    ObjectData::List(items) => {
                        let items = items.read().clone();
                        Some(heap.new_list(repeat(&items, times)))
                    }
                    ObjectData::Tuple(items) => Some(heap.new_tuple(repeat(items, times))),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Augmented assignment: mutates lists in place, tries the in-place
    /// special method, then falls back to the plain operator.
    pub fn inplace_op(
        &mut self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
    ) -> RunResult<Value> {
        if op == BinaryOp::Add
            && let Some(list) = left.as_object().and_then(|o| o.as_list())
        {
            let items = self.collect_values(right)?;
            list.write().extend(items);
            return Ok(left.clone());
        }
        if let Some(result) = self.call_special(left, op.inplace_dunder(), right)? {
            return Ok(result);
        }
        self.binary_op(op, left, right)
    }

    pub(crate) fn unary_op(&mut self, op: Op, operand: &Value) -> RunResult<Value> {
        let (result, dunder, symbol) = match op {
            Op::UnaryNegative => (numeric::negate(operand), "__neg__", "-"),
            Op::UnaryPositive => (numeric::positive(operand), "__pos__", "+"),
            _ => (numeric::invert(operand), "__invert__", "~"),
        };
        if let Some(result) = result {
            return Ok(result);
        }
        if let Some(method) = self.user_method(operand, dunder) {
            return self.call_value(&method, Args::default());
        }
        Err(RunError::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            operand.type_name()
        )))
    }

    pub fn compare(
        &mut self,
        op: CompareOp,
        left: &Value,
        right: &Value,
    ) -> RunResult<Value> {
        if let Some(result) = self.call_special(left, op.dunder(), right)? {
            return Ok(result);
        }
        if let Some(result) = self.call_special(right, op.swapped().dunder(), left)? {
            return Ok(result);
        }
        let result = match op {
            CompareOp::Eq => self.eq_values(left, right)?,
            CompareOp::Ne => !self.eq_values(left, right)?,
            _ => match self.order(left, right)? {
                Some(ordering) => match op {
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                // NaN is unordered with everything
                None => false,
            },
        };
        Ok(Value::Bool(result))
    }

    /// Value equality (`==`).
    pub fn eq_values(&mut self, left: &Value, right: &Value) -> RunResult<bool> {
        if !matches!(left, Value::Float(_)) && left.is(right) {
            return Ok(true);
        }
        if let Some(ordering) = numeric::compare(left, right) {
            return Ok(ordering == Some(Ordering::Equal));
        }
        let (a, b) = match (left, right) {
            (Value::Str(a), Value::Str(b)) => return Ok(a == b),
            (Value::Bytes(a), Value::Bytes(b)) => return Ok(a == b),
            (Value::Object(a), Value::Object(b)) => (a, b),
            (Value::Object(_), _) | (_, Value::Object(_)) => {
                return self.user_eq(left, right);
            }
            _ => return Ok(false),
        };
        match (&a.data, &b.data) {
            (ObjectData::List(x), ObjectData::List(y)) => {
                let x = x.read().clone();
                let y = y.read().clone();
                self.eq_slices(&x, &y)
            }
            (ObjectData::Tuple(x), ObjectData::Tuple(y)) => self.eq_slices(x, y),
            (ObjectData::Dict(x), ObjectData::Dict(y)) => {
                let entries: Vec<(Value, Value)> = x
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if entries.len() != y.read().len() {
                    return Ok(false);
                }
                for (key, value) in entries {
                    let other = y.read().get(&key.hash_key()?).cloned();
                    match other {
                        Some(other) if self.eq_values(&value, &other)? => (),
                        _ => return Ok(false),
                    }
                }
                Ok(true)
            }
            (ObjectData::Set(x), ObjectData::Set(y)) => {
                let x = x.read().clone();
                let y = y.read();
                Ok(x.len() == y.len() && x.iter().all(|(key, _)| y.contains(key)))
            }
            (ObjectData::Range(x), ObjectData::Range(y)) => {
                let len = x.len();
                Ok(len == y.len()
                    && (len == 0
                        || (x.start == y.start && (len == 1 || x.step == y.step))))
            }
            _ => self.user_eq(left, right),
        }
    }

    fn user_eq(&mut self, left: &Value, right: &Value) -> RunResult<bool> {
        for (target, other) in [(left, right), (right, left)] {
            if let Some(result) = self.call_special(target, "__eq__", other)? {
                return self.truthy(&result);
            }
        }
        Ok(left.is(right))
    }

    fn eq_slices(&mut self, x: &[Value], y: &[Value]) -> RunResult<bool> {
        if x.len() != y.len() {
            return Ok(false);
        }
        for (a, b) in x.iter().zip(y) {
            if !self.eq_values(a, b)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Ordering for `<` and friends. `Ok(None)` is an unordered pair of
    /// floats.
    pub fn order(&mut self, left: &Value, right: &Value) -> RunResult<Option<Ordering>> {
        if let Some(ordering) = numeric::compare(left, right) {
            return Ok(ordering);
        }
        match (left, right) {
            (Value::Str(a), Value::Str(b)) => return Ok(Some(a.cmp(b))),
            (Value::Bytes(a), Value::Bytes(b)) => return Ok(Some(a.cmp(b))),
            (Value::Object(a), Value::Object(b)) => {
                let items = match (&a.data, &b.data) {
                    (ObjectData::List(x), ObjectData::List(y)) => {
                        let x = x.read().clone();
                        let y = y.read().clone();
                        Some((x, y))
                    }
                    (ObjectData::Tuple(x), ObjectData::Tuple(y)) => {
                        Some((x.to_vec(), y.to_vec()))
                    }
                    _ => None,
                };
                if let Some((x, y)) = items {
                    for (a, b) in x.iter().zip(&y) {
                        if !self.eq_values(a, b)? {
                            return self.order(a, b);
                        }
                    }
                    return Ok(Some(x.len().cmp(&y.len())));
                }
            }
            _ => (),
        }
        Err(RunError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        )))
    }

    /// Ordering used by `sorted`, `min` and `max`: honours user `__lt__`.
    pub(crate) fn less_than(&mut self, left: &Value, right: &Value) -> RunResult<bool> {
        let result = self.compare(CompareOp::Lt, left, right)?;
        self.truthy(&result)
    }

    /// Membership test (`in`); `container` is the right operand.
    pub fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        match container {
            Value::Str(text) => {
                let Value::Str(needle) = item else {
                    return Err(RunError::type_error(format!(
                        "'in <string>' requires string as left operand, not {}",
                        item.type_name()
                    )));
                };
                return Ok(text.contains(&**needle));
            }
            Value::Bytes(bytes) => {
                return match item {
                    Value::Bytes(needle) => Ok(needle.is_empty()
                        || bytes.windows(needle.len()).any(|w| w == &needle[..])),
                    _ => match item.as_int() {
                        Some(byte) => Ok(bytes.iter().any(|&b| i64::from(b) == byte)),
                        None => Err(RunError::type_error(
                            "a bytes-like object is required",
                        )),
                    },
                };
            }
            _ => (),
        }
        let Value::Object(object) = container else {
            return Err(not_iterable_argument(container));
        };
        match &object.data {
            ObjectData::List(items) => {
                let items = items.read().clone();
                self.any_equal(&items, item)
            }
            ObjectData::Tuple(items) => self.any_equal(items, item),
            ObjectData::Dict(dict) => Ok(dict.read().contains(&item.hash_key()?)),
            ObjectData::Set(set) => Ok(set.read().contains(&item.hash_key()?)),
            ObjectData::Range(range) => Ok(range_contains(range, item)),
            _ => {
                if let Some(method) = self.user_method(container, "__contains__") {
                    let result = self.call_value(&method, Args::new(vec![item.clone()]))?;
                    return self.truthy(&result);
                }
                let iterator = self.get_iter(container).map_err(|err| {
                    if err.is_instance(ExcType::TypeError) {
                        not_iterable_argument(container)
                    } else {
                        err
                    }
                })?;
                while let super::IterStep::Yielded(value) = self.advance(&iterator)? {
                    if self.eq_values(&value, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn any_equal(&mut self, items: &[Value], item: &Value) -> RunResult<bool> {
        for candidate in items {
            if self.eq_values(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn getitem(&mut self, target: &Value, key: &Value) -> RunResult<Value> {
        let slice = key.as_object().and_then(|o| match &o.data {
            ObjectData::Slice(slice) => Some(slice),
            _ => None,
        });
        match target {
            Value::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                if let Some(slice) = slice {
                    let picked: String = slice_positions(slice, chars.len())?
                        .into_iter()
                        .map(|i| chars[i])
                        .collect();
                    return Ok(Value::from(picked));
                }
                let index = sequence_index(key, chars.len(), "string")?;
                return Ok(Value::from(chars[index].to_string()));
            }
            Value::Bytes(bytes) => {
                if let Some(slice) = slice {
                    let picked: Vec<u8> = slice_positions(slice, bytes.len())?
                        .into_iter()
                        .map(|i| bytes[i])
                        .collect();
                    return Ok(Value::Bytes(picked.into()));
                }
                let index = sequence_index(key, bytes.len(), "index")?;
                return Ok(Value::Int(i64::from(bytes[index])));
            }
            Value::Object(_) => (),
            _ => return Err(not_subscriptable(target)),
        }
        let Value::Object(object) = target else {
            return Err(not_subscriptable(target));
        };
        match &object.data {
            ObjectData::List(items) => {
                let items = items.read();
                if let Some(slice) = slice {
                    let picked = pick(&items, &slice_positions(slice, items.len())?);
                    drop(items);
                    return Ok(self.vm.heap.new_list(picked));
                }
                let index = sequence_index(key, items.len(), "list")?;
                Ok(items[index].clone())
            }
            ObjectData::Tuple(items) => {
                if let Some(slice) = slice {
                    let picked = pick(items, &slice_positions(slice, items.len())?);
                    return Ok(self.vm.heap.new_tuple(picked));
                }
                let index = sequence_index(key, items.len(), "tuple")?;
                Ok(items[index].clone())
            }
            ObjectData::Range(range) => {
                if let Some(slice) = slice {
                    let (start, stop, step) = slice_indices(slice, range.len())?;
                    let sliced = Range {
                        start: range.start + start * range.step,
                        stop: range.start + stop * range.step,
                        step: range.step * step,
                    };
                    return Ok(Value::Object(
                        self.vm.heap.allocate(ObjectData::Range(sliced)),
                    ));
                }
                let index = sequence_index(key, range.len(), "range object")?;
                range.get(index).map(Value::Int).ok_or_else(|| {
                    RunError::new(ExcType::IndexError, "range object index out of range")
                })
            }
            ObjectData::Dict(dict) => {
                let found = dict.read().get(&key.hash_key()?).cloned();
                found.ok_or_else(|| self.key_error(key))
            }
            _ => {
                if let Some(method) = self.user_method(target, "__getitem__") {
                    return self.call_value(&method, Args::new(vec![key.clone()]));
                }
                Err(not_subscriptable(target))
            }
        }
    }

    pub fn setitem(&mut self, target: &Value, key: &Value, value: Value) -> RunResult<()> {
        let Some(object) = target.as_object() else {
            return Err(no_item_assignment(target));
        };
        match &object.data {
            ObjectData::List(items) => {
                if let Some(ObjectData::Slice(slice)) = key.as_object().map(|o| &o.data) {
                    let values = self.collect_values(&value)?;
                    return assign_slice(&mut items.write(), slice, values);
                }
                let mut items = items.write();
                let index = sequence_index(key, items.len(), "list assignment")?;
                items[index] = value;
                Ok(())
            }
            ObjectData::Dict(dict) => {
                let hash = key.hash_key()?;
                dict.write().insert(hash, key.clone(), value);
                Ok(())
            }
            _ => {
                if let Some(method) = self.user_method(target, "__setitem__") {
                    self.call_value(&method, Args::new(vec![key.clone(), value]))?;
                    return Ok(());
                }
                Err(no_item_assignment(target))
            }
        }
    }

    pub fn delitem(&mut self, target: &Value, key: &Value) -> RunResult<()> {
        let Some(object) = target.as_object() else {
            return Err(no_item_deletion(target));
        };
        match &object.data {
            ObjectData::List(items) => {
                let mut items = items.write();
                if let Some(ObjectData::Slice(slice)) = key.as_object().map(|o| &o.data) {
                    let mut positions = slice_positions(slice, items.len())?;
                    positions.sort_unstable();
                    for index in positions.into_iter().rev() {
                        items.remove(index);
                    }
                    return Ok(());
                }
                let index = sequence_index(key, items.len(), "list assignment")?;
                items.remove(index);
                Ok(())
            }
            ObjectData::Dict(dict) => {
                let removed = dict.write().remove(&key.hash_key()?);
                removed.map(|_| ()).ok_or_else(|| self.key_error(key))
            }
            _ => {
                if let Some(method) = self.user_method(target, "__delitem__") {
                    self.call_value(&method, Args::new(vec![key.clone()]))?;
                    return Ok(());
                }
                Err(no_item_deletion(target))
            }
        }
    }

    pub(crate) fn key_error(&self, key: &Value) -> RunError {
        RunError::Raised(self.new_exception(ExcType::KeyError, vec![key.clone()]))
    }

    pub fn len(&mut self, value: &Value) -> RunResult<usize> {
        let len = match value {
            Value::Str(text) => Some(text.chars().count()),
            Value::Bytes(bytes) => Some(bytes.len()),
            Value::Object(object) => match &object.data {
                ObjectData::List(items) => Some(items.read().len()),
                ObjectData::Tuple(items) => Some(items.len()),
                ObjectData::Dict(dict) => Some(dict.read().len()),
                ObjectData::Set(set) => Some(set.read().len()),
                ObjectData::Range(range) => Some(range.len()),
                _ => None,
            },
            _ => None,
        };
        if let Some(len) = len {
            return Ok(len);
        }
        let Some(method) = self.user_method(value, "__len__") else {
            return Err(RunError::type_error(format!(
                "object of type '{}' has no len()",
                value.type_name()
            )));
        };
        let result = self.call_value(&method, Args::default())?;
        match result.as_int() {
            Some(len) if len >= 0 => Ok(len as usize),
            Some(_) => Err(RunError::value_error("__len__() should return >= 0")),
            None => Err(RunError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                result.type_name()
            ))),
        }
    }

    pub fn truthy(&mut self, value: &Value) -> RunResult<bool> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::BigInt(b) => !b.is_zero(),
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Code(_) => true,
            Value::Object(object) => match &object.data {
                ObjectData::List(items) => !items.read().is_empty(),
                ObjectData::Tuple(items) => !items.is_empty(),
                ObjectData::Dict(dict) => !dict.read().is_empty(),
                ObjectData::Set(set) => !set.read().is_empty(),
                ObjectData::Range(range) => !range.is_empty(),
                ObjectData::Instance(_) => {
                    if let Some(method) = self.user_method(value, "__bool__") {
                        return match self.call_value(&method, Args::default())? {
                            Value::Bool(b) => Ok(b),
                            other => Err(RunError::type_error(format!(
                                "__bool__ should return bool, returned {}",
                                other.type_name()
                            ))),
                        };
                    }
                    if self.user_method(value, "__len__").is_some() {
                        return Ok(self.len(value)? > 0);
                    }
                    true
                }
                _ => true,
            },
        })
    }

    /// `repr(value)`.
    pub fn repr(&mut self, value: &Value) -> RunResult<String> {
        let object = match value {
            Value::Str(text) => return Ok(repr_str(text)),
            Value::Bytes(bytes) => return Ok(repr_bytes(bytes)),
            Value::Float(f) => return Ok(format_float(*f)),
            Value::Code(code) => return Ok(format!("<code object {}>", code.name)),
            Value::Object(object) => object,
            other => return Ok(format!("{other:?}")),
        };
        if let Some(method) = self.user_method(value, "__repr__") {
            return self.text_result(&method, "__repr__");
        }
        let addr = object.addr();
        match &object.data {
            ObjectData::List(_) | ObjectData::Dict(_) | ObjectData::Set(_)
                if self.repr_guard.contains(&addr) =>
            {
                return Ok(match &object.data {
                    ObjectData::List(_) => "[...]".into(),
                    _ => "{...}".into(),
                });
            }
            _ => (),
        }
        self.repr_guard.push(addr);
        let text = self.repr_object(object);
        self.repr_guard.pop();
        text
    }

    fn repr_object(&mut self, object: &ObjRef) -> RunResult<String> {
        Ok(match &object.data {
            ObjectData::List(items) => {
                let items = items.read().clone();
                format!("[{}]", self.repr_join(&items)?)
            }
            ObjectData::Tuple(items) => match &items[..] {
                [single] => format!("({},)", self.repr(single)?),
                items => format!("({})", self.repr_join(items)?),
            },
            ObjectData::Dict(dict) => {
                let entries: Vec<(Value, Value)> = dict
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut out = String::from("{");
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}: {}", self.repr(key)?, self.repr(value)?);
                }
                out.push('}');
                out
            }
            ObjectData::Set(set) => {
                let items: Vec<Value> = set.read().values().cloned().collect();
                if items.is_empty() {
                    "set()".into()
                } else {
                    format!("{{{}}}", self.repr_join(&items)?)
                }
            }
            ObjectData::Exception(exception) => {
                let args = exception.args.read().clone();
                let inner = match &args[..] {
                    [single] => self.repr(single)?,
                    args => self.repr_join(args)?,
                };
                format!("{}({inner})", exception.class_name())
            }
            ObjectData::Class(class) => format!("<class '{}'>", class.name),
            ObjectData::Function(function) => {
                format!("<function {} at {:#x}>", function.name, object.addr())
            }
            ObjectData::NativeFunction(native) => {
                format!("<built-in function {}>", native.name)
            }
            ObjectData::BoundMethod(method) => {
                let name = method
                    .function
                    .as_object()
                    .and_then(|f| match &f.data {
                        ObjectData::Function(f) => Some(f.name.to_string()),
                        ObjectData::NativeFunction(f) => Some(f.name.to_string()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "?".into());
                format!("<bound method {name} of {}>", self.repr(&method.receiver)?)
            }
            ObjectData::Module(module) => format!("<module '{}'>", module.name),
            ObjectData::Generator(generator) => format!(
                "<{} object {} at {:#x}>",
                generator.kind.name(),
                generator.name,
                object.addr()
            ),
            ObjectData::Range(range) if range.step == 1 => {
                format!("range({}, {})", range.start, range.stop)
            }
            ObjectData::Range(range) => {
                format!("range({}, {}, {})", range.start, range.stop, range.step)
            }
            ObjectData::Slice(slice) => format!(
                "slice({}, {}, {})",
                self.repr(&slice.start)?,
                self.repr(&slice.stop)?,
                self.repr(&slice.step)?
            ),
            ObjectData::Lock(lock) => format!(
                "<{} lock object at {:#x}>",
                if lock.is_locked() { "locked" } else { "unlocked" },
                object.addr()
            ),
            ObjectData::Thread(thread) => format!("<Thread({})>", thread.name),
            ObjectData::Instance(_) if object.ptr_eq(&builtin_types().not_implemented) => {
                "NotImplemented".into()
            }
            _ => format!("<{} object at {:#x}>", object.type_name(), object.addr()),
        })
    }

    fn repr_join(&mut self, items: &[Value]) -> RunResult<String> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(self.repr(item)?);
        }
        Ok(parts.join(", "))
    }

    fn text_result(&mut self, method: &Value, name: &str) -> RunResult<String> {
        match self.call_value(method, Args::default())? {
            Value::Str(text) => Ok(text.to_string()),
            other => Err(RunError::type_error(format!(
                "{name} returned non-string (type {})",
                other.type_name()
            ))),
        }
    }

    /// `str(value)`.
    pub fn to_str(&mut self, value: &Value) -> RunResult<String> {
        match value {
            Value::Str(text) => return Ok(text.to_string()),
            Value::Object(object) => {
                if let Some(method) = self.user_method(value, "__str__") {
                    return self.text_result(&method, "__str__");
                }
                if let Some(exception) = object.as_exception() {
                    let args = exception.args.read().clone();
                    return match &args[..] {
                        [] => Ok(String::new()),
                        [single] => self.to_str(single),
                        _ => {
                            let tuple = self.vm.heap.new_tuple(args);
                            self.repr(&tuple)
                        }
                    };
                }
            }
            _ => (),
        }
        self.repr(value)
    }
}

pub(crate) fn is_not_implemented(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.ptr_eq(&builtin_types().not_implemented))
}

fn attribute_error(target: &Value, name: &str) -> RunError {
    let message = match target.as_object().map(|o| &o.data) {
        Some(ObjectData::Class(class)) => {
            format!("type object '{}' has no attribute '{name}'", class.name)
        }
        Some(ObjectData::Module(module)) => {
            format!("module '{}' has no attribute '{name}'", module.name)
        }
        _ => format!("'{}' object has no attribute '{name}'", target.type_name()),
    };
    RunError::new(ExcType::AttributeError, message)
}

fn not_subscriptable(target: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not subscriptable", target.type_name()))
}

fn no_item_assignment(target: &Value) -> RunError {
    RunError::type_error(format!(
        "'{}' object does not support item assignment",
        target.type_name()
    ))
}

fn no_item_deletion(target: &Value) -> RunError {
    RunError::type_error(format!(
        "'{}' object doesn't support item deletion",
        target.type_name()
    ))
}

fn not_iterable_argument(container: &Value) -> RunError {
    RunError::type_error(format!(
        "argument of type '{}' is not iterable",
        container.type_name()
    ))
}

fn repeat_count(count: &Value) -> RunResult<usize> {
    match count.as_int() {
        Some(n) => Ok(usize::try_from(n).unwrap_or(0)),
        None => Err(RunError::new(
            ExcType::OverflowError,
            "cannot fit 'int' into an index-sized integer",
        )),
    }
}

fn repeat(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

fn set_op(op: BinaryOp, x: &Set, y: &Set) -> Set {
    let mut out = Set::new();
    let mut add = |key: &HashKey, value: &Value| {
        out.insert(key.clone(), value.clone());
    };
    match op {
        BinaryOp::Or => {
            x.iter().for_each(|(k, v)| add(k, v));
            y.iter().for_each(|(k, v)| add(k, v));
        }
        BinaryOp::And => x
            .iter()
            .filter(|(k, _)| y.contains(k))
            .for_each(|(k, v)| add(k, v)),
        BinaryOp::Sub => x
            .iter()
            .filter(|(k, _)| !y.contains(k))
            .for_each(|(k, v)| add(k, v)),
        _ => {
            x.iter()
                .filter(|(k, _)| !y.contains(k))
                .for_each(|(k, v)| add(k, v));
            y.iter()
                .filter(|(k, _)| !x.contains(k))
                .for_each(|(k, v)| add(k, v));
        }
    }
    out
}

fn range_contains(range: &Range, item: &Value) -> bool {
    let Some(n) = item.as_int() else {
        return false;
    };
    let in_bounds = if range.step > 0 {
        range.start <= n && n < range.stop
    } else {
        range.stop < n && n <= range.start
    };
    in_bounds && (i128::from(n) - i128::from(range.start)) % i128::from(range.step) == 0
}

/// Resolves an integer subscript, counting negative ones from the end.
fn sequence_index(key: &Value, len: usize, what: &str) -> RunResult<usize> {
    let Some(index) = key.as_int() else {
        if key.is_int() {
            return Err(RunError::new(
                ExcType::IndexError,
                "cannot fit 'int' into an index-sized integer",
            ));
        }
        let kind = what.split(' ').next().unwrap_or(what);
        return Err(RunError::type_error(format!(
            "{kind} indices must be integers or slices, not {}",
            key.type_name()
        )));
    };
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    if !(0..len).contains(&resolved) {
        return Err(RunError::new(
            ExcType::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(resolved as usize)
}

fn slice_bound(value: &Value) -> RunResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        other => other.as_int().map(Some).ok_or_else(|| {
            RunError::type_error(
                "slice indices must be integers or None or have an __index__ method",
            )
        }),
    }
}

/// Normalized `(start, stop, step)` of a slice over `len` elements.
pub(crate) fn slice_indices(slice: &Slice, len: usize) -> RunResult<(i64, i64, i64)> {
    let len = len as i64;
    let step = slice_bound(&slice.step)?.unwrap_or(1);
    if step == 0 {
        return Err(RunError::value_error("slice step cannot be zero"));
    }
    let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
    let clamp = |bound: Option<i64>, default: i64| match bound {
        None => default,
        Some(i) if i < 0 => (i + len).max(lower),
        Some(i) => i.min(upper),
    };
    let start = clamp(slice_bound(&slice.start)?, if step < 0 { upper } else { lower });
    let stop = clamp(slice_bound(&slice.stop)?, if step < 0 { lower } else { upper });
    Ok((start, stop, step))
}

fn slice_positions(slice: &Slice, len: usize) -> RunResult<Vec<usize>> {
    let (start, stop, step) = slice_indices(slice, len)?;
    let mut positions = Vec::new();
    let mut index = start;
    while (step > 0 && index < stop) || (step < 0 && index > stop) {
        positions.push(index as usize);
        index += step;
    }
    Ok(positions)
}

fn pick(items: &[Value], positions: &[usize]) -> Vec<Value> {
    positions.iter().map(|&i| items[i].clone()).collect()
}

fn assign_slice(items: &mut Vec<Value>, slice: &Slice, values: Vec<Value>) -> RunResult<()> {
    let (start, stop, step) = slice_indices(slice, items.len())?;
    if step == 1 {
        let start = start as usize;
        let stop = (stop as usize).max(start);
        items.splice(start..stop, values);
        return Ok(());
    }
    let positions = slice_positions(slice, items.len())?;
    if positions.len() != values.len() {
        return Err(RunError::value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            values.len(),
            positions.len()
        )));
    }
    for (index, value) in positions.into_iter().zip(values) {
        items[index] = value;
    }
    Ok(())
}

pub(crate) fn repr_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn repr_bytes(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for &byte in bytes {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push('\'');
    out
}

/// Dict built from string-keyed pairs.
pub(crate) fn str_dict(pairs: impl IntoIterator<Item = (Arc<str>, Value)>) -> Dict {
    let mut dict = Dict::new();
    for (key, value) in pairs {
        dict.insert(HashKey::Str(key.clone()), Value::Str(key), value);
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeBuilder, VM, VMCreateInfo};

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    fn slice(start: Value, stop: Value, step: Value) -> Value {
        Value::Object(ObjRef::untracked(ObjectData::Slice(Slice { start, stop, step })))
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn slicing_follows_sequence_semantics() {
        let mut interp = interpreter();
        let list = interp.vm.heap.new_list(ints(&[0, 1, 2, 3, 4]));
        let reversed = interp
            .getitem(&list, &slice(Value::None, Value::None, Value::Int(-1)))
            .unwrap();
        assert_eq!(interp.repr(&reversed).unwrap(), "[4, 3, 2, 1, 0]");
        let middle = interp
            .getitem(&list, &slice(Value::Int(1), Value::Int(-1), Value::Int(2)))
            .unwrap();
        assert_eq!(interp.repr(&middle).unwrap(), "[1, 3]");
        let text = interp
            .getitem(&Value::str("hello"), &slice(Value::Int(-3), Value::None, Value::None))
            .unwrap();
        assert_eq!(text, Value::str("llo"));

        let err = interp.getitem(&list, &Value::Int(5)).unwrap_err();
        assert_eq!(err.message(), "list index out of range");
        assert_eq!(interp.getitem(&list, &Value::Int(-1)), Ok(Value::Int(4)));
    }

    #[test]
    fn slice_assignment_and_deletion() {
        let mut interp = interpreter();
        let list = interp.vm.heap.new_list(ints(&[0, 1, 2, 3]));
        let values = interp.vm.heap.new_list(ints(&[9, 9, 9]));
        interp
            .setitem(&list, &slice(Value::Int(1), Value::Int(3), Value::None), values)
            .unwrap();
        assert_eq!(interp.repr(&list).unwrap(), "[0, 9, 9, 9, 3]");
        interp
            .delitem(&list, &slice(Value::None, Value::None, Value::Int(2)))
            .unwrap();
        assert_eq!(interp.repr(&list).unwrap(), "[9, 9]");
    }

    #[test]
    fn missing_keys_raise_key_error_with_the_key() {
        let mut interp = interpreter();
        let dict = Value::Object(interp.vm.heap.new_dict(Dict::new()));
        let err = interp.getitem(&dict, &Value::str("k")).unwrap_err();
        assert!(err.is_instance(ExcType::KeyError));
        assert_eq!(err.to_string(), "KeyError: k");
    }

    #[test]
    fn structural_equality_and_ordering() {
        let mut interp = interpreter();
        let a = interp.vm.heap.new_list(ints(&[1, 2]));
        let b = interp.vm.heap.new_list(vec![Value::Int(1), Value::Float(2.0)]);
        assert!(interp.eq_values(&a, &b).unwrap());
        let c = interp.vm.heap.new_tuple(ints(&[1, 3]));
        let d = interp.vm.heap.new_tuple(ints(&[1, 2, 9]));
        assert_eq!(interp.order(&c, &d), Ok(Some(Ordering::Greater)));
        let nan = Value::Float(f64::NAN);
        assert!(!interp.eq_values(&nan, &nan).unwrap());
        assert_eq!(
            interp.compare(CompareOp::Lt, &nan, &Value::Int(1)),
            Ok(Value::Bool(false))
        );
        let err = interp
            .compare(CompareOp::Lt, &Value::str("a"), &Value::Int(1))
            .unwrap_err();
        assert_eq!(
            err.message(),
            "'<' not supported between instances of 'str' and 'int'"
        );
    }

    #[test]
    fn self_operands_never_block_a_writer() {
        use std::{
            sync::{
                Arc,
                atomic::{AtomicBool, Ordering as AtomicOrdering},
                mpsc,
            },
            thread,
            time::Duration,
        };

        let vm = VM::new(VMCreateInfo {
            heap: crate::HeapCreateInfo {
                gc_threshold: Some(usize::MAX),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut interp = Interpreter::new(vm.new_proxy());
        let list = interp.vm.heap.new_list(ints(&[1, 2, 3]));
        let other = interp.vm.heap.new_list(ints(&[1, 2]));
        let set = interp.new_set(ints(&[1, 2, 3])).unwrap();
        drop(interp);
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let (list, set, stop) = (list.clone(), set.clone(), stop.clone());
            thread::spawn(move || {
                let items = list.as_object().unwrap().as_list().unwrap();
                let keys = set.as_object().unwrap().as_set().unwrap();
                while !stop.load(AtomicOrdering::Relaxed) {
                    items.write().push(Value::Int(4));
                    items.write().pop();
                    keys.write().insert(HashKey::Int(9), Value::Int(9));
                    keys.write().remove(&HashKey::Int(9));
                }
            })
        };

        let (done, finished) = mpsc::channel();
        let readers: Vec<_> = [(list.clone(), other.clone()), (other, list.clone())]
            .into_iter()
            .map(|(a, b)| {
                let (shared, set, done) = (vm.shared().clone(), set.clone(), done.clone());
                thread::spawn(move || {
                    let mut interp = Interpreter::new(crate::VMProxy::attach(&shared));
                    for _ in 0..20_000 {
                        interp.order(&a, &a).unwrap();
                        interp.order(&a, &b).unwrap();
                        interp.compare(CompareOp::Eq, &a, &a).unwrap();
                        interp.compare(CompareOp::Lt, &b, &a).unwrap();
                        interp.binary_op(BinaryOp::Or, &set, &set).unwrap();
                        interp.binary_op(BinaryOp::Sub, &set, &set).unwrap();
                        interp.eq_values(&set, &set).unwrap();
                    }
                    done.send(()).unwrap();
                })
            })
            .collect();

        let progressed = (0..readers.len())
            .all(|_| finished.recv_timeout(Duration::from_secs(60)).is_ok());
        stop.store(true, AtomicOrdering::Relaxed);
        assert!(progressed, "readers stalled behind the writer");
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        let len = list.as_object().unwrap().as_list().unwrap().read().len();
        assert_eq!(len, 3);
    }

    #[test]
    fn operators_on_builtin_sequences() {
        let mut interp = interpreter();
        let sum = interp
            .binary_op(BinaryOp::Add, &Value::str("ab"), &Value::str("cd"))
            .unwrap();
        assert_eq!(sum, Value::str("abcd"));
        let list = interp.vm.heap.new_list(ints(&[1]));
        let repeated = interp.binary_op(BinaryOp::Mul, &list, &Value::Int(3)).unwrap();
        assert_eq!(interp.len(&repeated), Ok(3));
        let err = interp
            .binary_op(BinaryOp::Add, &Value::Int(1), &Value::str("x"))
            .unwrap_err();
        assert_eq!(err.message(), "unsupported operand type(s) for +: 'int' and 'str'");
    }

    #[test]
    fn reprs_nest_and_guard_recursion() {
        let mut interp = interpreter();
        let list = interp.vm.heap.new_list(vec![Value::str("it's"), Value::None]);
        list.as_object().unwrap().as_list().unwrap().write().push(list.clone());
        assert_eq!(interp.repr(&list).unwrap(), "[\"it's\", None, [...]]");
        let single = interp.vm.heap.new_tuple(vec![Value::Float(1.0)]);
        assert_eq!(interp.repr(&single).unwrap(), "(1.0,)");
        // break the cycle so the test does not leak
        list.as_object().unwrap().as_list().unwrap().write().clear();
    }

    #[test]
    fn user_dunders_drive_operators() {
        // class V:
        //     def __init__(self, x): self.x = x
        //     def __add__(self, other): return self.x + other
        //     def __eq__(self, other): return True
        let mut interp = interpreter();
        let mut init = CodeBuilder::new("__init__").args(&["self", "x"]);
        init.load_fast("x").load_fast("self").store_attr("x");
        init.load_none().return_value();
        let mut add = CodeBuilder::new("__add__").args(&["self", "other"]);
        add.load_fast("self").load_attr("x").load_fast("other");
        add.binary(BinaryOp::Add).return_value();
        let mut eq = CodeBuilder::new("__eq__").args(&["self", "other"]);
        eq.load_const(true).return_value();

        let mut body = CodeBuilder::new("V");
        body.make_function(init.build().unwrap(), 0).store_name("__init__");
        body.make_function(add.build().unwrap(), 0).store_name("__add__");
        body.make_function(eq.build().unwrap(), 0).store_name("__eq__");
        body.load_none().return_value();
        let mut module = CodeBuilder::new("<module>");
        module.op(Op::LoadBuildClass);
        module.make_function(body.build().unwrap(), 0).load_const("V").call(2);
        module.load_const(40).call(1).return_value();
        let v = interp.run_code(module.build().unwrap()).unwrap();

        assert_eq!(interp.binary_op(BinaryOp::Add, &v, &Value::Int(2)), Ok(Value::Int(42)));
        let err = interp.binary_op(BinaryOp::Sub, &v, &Value::Int(2)).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
        assert!(interp.eq_values(&v, &Value::str("anything")).unwrap());
        assert_eq!(interp.getattr(&v, "x"), Ok(Value::Int(40)));
        let err = interp.getattr(&v, "y").unwrap_err();
        assert_eq!(err.message(), "'V' object has no attribute 'y'");
    }

    #[test]
    fn builtin_classes_are_immutable() {
        let mut interp = interpreter();
        let int = Value::Object(builtin_types().int.clone());
        let err = interp.setattr(&int, "x", Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), "cannot set 'x' attribute of immutable type 'int'");
    }

    #[test]
    fn exception_str_depends_on_arg_count() {
        let mut interp = interpreter();
        let none = Value::Object(interp.new_exception(ExcType::ValueError, vec![]));
        assert_eq!(interp.to_str(&none).unwrap(), "");
        let one = Value::Object(interp.new_exception(ExcType::ValueError, vec![Value::Int(3)]));
        assert_eq!(interp.to_str(&one).unwrap(), "3");
        let two = Value::Object(
            interp.new_exception(ExcType::ValueError, vec![Value::Int(1), Value::str("a")]),
        );
        assert_eq!(interp.to_str(&two).unwrap(), "(1, 'a')");
        assert_eq!(interp.repr(&one).unwrap(), "ValueError(3)");
    }
}
