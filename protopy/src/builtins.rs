//! The builtins namespace and the constructors of the built-in classes.
use std::{
    hash::BuildHasher,
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive};
use parking_lot::RwLock;

use crate::{
    Args, BinaryOp, Class, ConditionObject, Dict, Event, ExcType, HashKey,
    HeapProxy, Instance, Interpreter, IterState, IterStep, Lock, NativeMethod,
    ObjRef, ObjectData, RLock, Range, RunError, RunResult, Semaphore, Set,
    Slice, ThreadHandle, Value, builtin_types, class_of, default_thread_name,
    interpreter::{dict_get, dict_set},
    is_subclass, named_classes,
};

const BUILTIN_FUNCTIONS: &[NativeMethod] = &[
    NativeMethod::new("print", print),
    NativeMethod::new("len", len),
    NativeMethod::new("repr", repr),
    NativeMethod::new("isinstance", isinstance),
    NativeMethod::new("issubclass", issubclass),
    NativeMethod::new("iter", iter),
    NativeMethod::new("next", next),
    NativeMethod::new("hasattr", hasattr),
    NativeMethod::new("getattr", getattr),
    NativeMethod::new("setattr", setattr),
    NativeMethod::new("delattr", delattr),
    NativeMethod::new("id", id),
    NativeMethod::new("hash", hash),
    NativeMethod::new("abs", abs),
    NativeMethod::new("min", min),
    NativeMethod::new("max", max),
    NativeMethod::new("sum", sum),
    NativeMethod::new("sorted", sorted),
    NativeMethod::new("reversed", reversed),
    NativeMethod::new("enumerate", enumerate),
    NativeMethod::new("zip", zip),
    NativeMethod::new("any", any),
    NativeMethod::new("all", all),
    NativeMethod::new("callable", callable),
    NativeMethod::new("chr", chr),
    NativeMethod::new("ord", ord),
    NativeMethod::new("divmod", divmod),
    NativeMethod::new("pow", pow),
    NativeMethod::new("__build_class__", build_class),
];

/// Builds the builtins dict shared by every frame of a VM.
pub(crate) fn create_builtins(heap: &HeapProxy) -> ObjRef {
    let mut dict = Dict::new();
    dict.set_str("__name__", Value::str("builtins"));
    for class in named_classes() {
        if let Some(info) = class.as_class() {
            dict.set_str(&info.name, Value::Object(class.clone()));
        }
    }
    for function in BUILTIN_FUNCTIONS {
        dict.set_str(function.name, Value::Object(function.to_object()));
    }
    dict.set_str(
        "NotImplemented",
        Value::Object(builtin_types().not_implemented.clone()),
    );
    heap.new_dict(dict)
}

// argument helpers shared with the method tables and native modules

pub(crate) fn required<'a>(
    args: &'a Args,
    index: usize,
    name: &str,
    function: &str,
) -> RunResult<&'a Value> {
    args.arg(index, name).ok_or_else(|| {
        RunError::type_error(format!(
            "{function}() missing required argument '{name}' (pos {})",
            index + 1
        ))
    })
}

/// An integer argument. Bools count as ints, floats do not.
pub(crate) fn int_arg(value: &Value) -> RunResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::BigInt(_) => Err(RunError::new(
            ExcType::OverflowError,
            "Python int too large to convert to C ssize_t",
        )),
        _ => Err(RunError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))),
    }
}

pub(crate) fn str_arg<'a>(value: &'a Value, what: &str) -> RunResult<&'a Arc<str>> {
    match value {
        Value::Str(text) => Ok(text),
        _ => Err(RunError::type_error(format!(
            "{what} must be str, not {}",
            value.type_name()
        ))),
    }
}

/// Timeout argument of the blocking primitives. `None` and `-1` wait
/// forever.
pub(crate) fn timeout_arg(value: Option<&Value>) -> RunResult<Option<Duration>> {
    let seconds = match value {
        None | Some(Value::None) => return Ok(None),
        Some(value) => value.to_f64().ok_or_else(|| {
            RunError::type_error(format!(
                "timeout must be a number, not '{}'",
                value.type_name()
            ))
        })?,
    };
    if seconds == -1.0 {
        return Ok(None);
    }
    if seconds.is_nan() || seconds < 0.0 {
        return Err(RunError::value_error(
            "timeout value must be a non-negative number",
        ));
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|_| RunError::new(ExcType::OverflowError, "timeout value is too large"))
}

pub(crate) fn bool_arg(
    interp: &mut Interpreter,
    value: Option<&Value>,
    default: bool,
) -> RunResult<bool> {
    value.map_or(Ok(default), |value| interp.truthy(value))
}

fn class_arg<'a>(value: &'a Value, function: &str) -> RunResult<&'a ObjRef> {
    value
        .as_object()
        .filter(|object| object.as_class().is_some())
        .ok_or_else(|| {
            RunError::type_error(format!(
                "{function}() arg 1 must be a class"
            ))
        })
}

// builtin functions

fn print(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check_with_keywords("print", 0, usize::MAX, &["sep", "end"])?;
    let separator = match args.keyword("sep") {
        None | Some(Value::None) => " ".into(),
        Some(sep) => str_arg(sep, "sep")?.to_string(),
    };
    let end = match args.keyword("end") {
        None | Some(Value::None) => "\n".into(),
        Some(end) => str_arg(end, "end")?.to_string(),
    };
    let mut line = String::new();
    for (i, value) in args.positional.iter().enumerate() {
        if i > 0 {
            line.push_str(&separator);
        }
        line.push_str(&interp.to_str(value)?);
    }
    line.push_str(&end);

    let mut out = io::stdout().lock();
    out.write_all(line.as_bytes())
        .and_then(|()| out.flush())
        .map_err(|err| RunError::new(ExcType::OSError, err.to_string()))?;
    Ok(Value::None)
}

fn len(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("len", 1, 1)?;
    let len = interp.len(&args.positional[0])?;
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn repr(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("repr", 1, 1)?;
    Ok(Value::from(interp.repr(&args.positional[0])?))
}

/// `isinstance`/`issubclass` second argument: a class or a tuple of them.
fn matches_classinfo(class: &ObjRef, info: &Value, function: &str) -> RunResult<bool> {
    let Some(object) = info.as_object() else {
        return Err(classinfo_error(function));
    };
    match &object.data {
        ObjectData::Class(_) => Ok(is_subclass(class, object)),
        ObjectData::Tuple(items) => {
            for item in items.iter() {
                if matches_classinfo(class, item, function)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(classinfo_error(function)),
    }
}

fn classinfo_error(function: &str) -> RunError {
    RunError::type_error(format!(
        "{function}() arg 2 must be a type, a tuple of types, or a union"
    ))
}

fn isinstance(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("isinstance", 2, 2)?;
    let class = class_of(&args.positional[0]);
    matches_classinfo(&class, &args.positional[1], "isinstance").map(Value::Bool)
}

fn issubclass(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("issubclass", 2, 2)?;
    let class = class_arg(&args.positional[0], "issubclass")?;
    matches_classinfo(class, &args.positional[1], "issubclass").map(Value::Bool)
}

fn iter(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("iter", 1, 1)?;
    interp.get_iter(&args.positional[0])
}

fn next(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("next", 1, 2)?;
    match interp.advance(&args.positional[0])? {
        IterStep::Yielded(value) => Ok(value),
        IterStep::Exhausted(value) => match args.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(stop_iteration(interp, value)),
        },
    }
}

/// `StopIteration` carrying `value`, or a bare one for `None`.
pub(crate) fn stop_iteration(interp: &Interpreter, value: Value) -> RunError {
    let args = if value.is_none() { Vec::new() } else { vec![value] };
    RunError::Raised(interp.new_exception(ExcType::StopIteration, args))
}

fn attr_name(args: &Args, function: &str) -> RunResult<Arc<str>> {
    match &args.positional[1] {
        Value::Str(name) => Ok(name.clone()),
        other => Err(RunError::type_error(format!(
            "{function}(): attribute name must be string, not '{}'",
            other.type_name()
        ))),
    }
}

fn hasattr(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("hasattr", 2, 2)?;
    let name = attr_name(&args, "hasattr")?;
    match interp.lookup_attr(&args.positional[0], &name) {
        Ok(found) => Ok(Value::Bool(found.is_some())),
        Err(err) if err.is_instance(ExcType::AttributeError) => Ok(Value::Bool(false)),
        Err(err) => Err(err),
    }
}

fn getattr(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("getattr", 2, 3)?;
    let name = attr_name(&args, "getattr")?;
    match (interp.getattr(&args.positional[0], &name), args.get(2)) {
        (Err(err), Some(default)) if err.is_instance(ExcType::AttributeError) => {
            Ok(default.clone())
        }
        (result, _) => result,
    }
}

fn setattr(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("setattr", 3, 3)?;
    let name = attr_name(&args, "setattr")?;
    interp.setattr(&args.positional[0], &name, args.positional[2].clone())?;
    Ok(Value::None)
}

fn delattr(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("delattr", 2, 2)?;
    let name = attr_name(&args, "delattr")?;
    interp.delattr(&args.positional[0], &name)?;
    Ok(Value::None)
}

/// Identity of a value; stable for as long as the value is alive.
pub(crate) fn identity(value: &Value) -> i64 {
    let addr = match value {
        Value::None => 0x10,
        Value::Bool(b) => 0x20 + usize::from(*b),
        Value::Int(i) => return *i,
        Value::Float(f) => return f.to_bits() as i64,
        Value::BigInt(b) => Arc::as_ptr(b) as usize,
        Value::Str(s) => Arc::as_ptr(s).cast::<u8>() as usize,
        Value::Bytes(b) => Arc::as_ptr(b).cast::<u8>() as usize,
        Value::Code(c) => Arc::as_ptr(c) as usize,
        Value::Object(object) => object.addr(),
    };
    addr as i64
}

fn id(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("id", 1, 1)?;
    Ok(Value::Int(identity(&args.positional[0])))
}

fn hash(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("hash", 1, 1)?;
    let key = args.positional[0].hash_key()?;
    if let HashKey::Int(i) = key {
        return Ok(Value::Int(i));
    }
    let state = ahash::RandomState::with_seeds(0x7072, 0x6f74, 0x6f70, 0x7930);
    Ok(Value::Int(state.hash_one(&key) as i64))
}

fn abs(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("abs", 1, 1)?;
    let value = &args.positional[0];
    match value {
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Int(i) => Ok(i.checked_abs().map_or_else(
            || Value::from_bigint(BigInt::from(*i).abs()),
            Value::Int,
        )),
        Value::BigInt(b) => Ok(Value::from_bigint(b.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => match interp.user_method(value, "__abs__") {
            Some(method) => interp.call_value(&method, Args::default()),
            None => Err(RunError::type_error(format!(
                "bad operand type for abs(): '{}'",
                value.type_name()
            ))),
        },
    }
}

fn extremum(interp: &mut Interpreter, args: Args, name: &str, want_max: bool) -> RunResult<Value> {
    args.check_with_keywords(name, 1, usize::MAX, &["key", "default"])?;
    let key = args.keyword("key").filter(|key| !key.is_none()).cloned();
    let items = if args.len() == 1 {
        interp.collect_values(&args.positional[0])?
    } else {
        if args.keyword("default").is_some() {
            return Err(RunError::type_error(format!(
                "Cannot specify a default for {name}() with multiple positional arguments"
            )));
        }
        args.positional.clone()
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let rank = match &key {
            Some(key) => interp.call_value(key, Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_rank, _)) if want_max => interp.less_than(best_rank, &rank)?,
            Some((best_rank, _)) => interp.less_than(&rank, best_rank)?,
        };
        if replace {
            best = Some((rank, item));
        }
    }
    match (best, args.keyword("default")) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(RunError::value_error(format!(
            "{name}() iterable argument is empty"
        ))),
    }
}

fn min(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    extremum(interp, args, "min", false)
}

fn max(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    extremum(interp, args, "max", true)
}

fn sum(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check_with_keywords("sum", 1, 2, &["start"])?;
    let mut total = args.arg(1, "start").cloned().unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(RunError::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    let iterator = interp.get_iter(&args.positional[0])?;
    while let IterStep::Yielded(item) = interp.advance(&iterator)? {
        total = interp.binary_op(BinaryOp::Add, &total, &item)?;
    }
    Ok(total)
}

/// Stable sort with fallible comparisons. `key` maps items to sort keys.
pub(crate) fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> RunResult<Vec<Value>> {
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let rank = match key {
            Some(key) => interp.call_value(key, Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        entries.push((rank, item));
    }
    let sorted = merge_sort(interp, entries, reverse)?;
    Ok(sorted.into_iter().map(|(_, item)| item).collect())
}

fn merge_sort(
    interp: &mut Interpreter,
    mut left: Vec<(Value, Value)>,
    reverse: bool,
) -> RunResult<Vec<(Value, Value)>> {
    if left.len() <= 1 {
        return Ok(left);
    }
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(interp, left, reverse)?;
    let right = merge_sort(interp, right, reverse)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        // equal keys keep their original order in both directions
        let right_first = if reverse {
            interp.less_than(&l.0, &r.0)?
        } else {
            interp.less_than(&r.0, &l.0)?
        };
        let next = if right_first { right.next() } else { left.next() };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn sorted(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check_with_keywords("sorted", 1, 1, &["key", "reverse"])?;
    let items = interp.collect_values(&args.positional[0])?;
    let key = args.keyword("key").filter(|key| !key.is_none()).cloned();
    let reverse = bool_arg(interp, args.keyword("reverse"), false)?;
    let items = sort_values(interp, items, key.as_ref(), reverse)?;
    Ok(interp.vm.heap.new_list(items))
}

fn reversed(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("reversed", 1, 1)?;
    let value = &args.positional[0];
    let reversible = match value {
        Value::Str(_) | Value::Bytes(_) => true,
        Value::Object(object) => matches!(
            object.data,
            ObjectData::List(_) | ObjectData::Tuple(_) | ObjectData::Range(_)
        ),
        _ => false,
    };
    if !reversible {
        if let Some(method) = interp.user_method(value, "__reversed__") {
            return interp.call_value(&method, Args::default());
        }
        return Err(RunError::type_error(format!(
            "'{}' object is not reversible",
            value.type_name()
        )));
    }
    let mut items = interp.collect_values(value)?;
    items.reverse();
    Ok(interp.new_iterator(IterState::Items { items, index: 0 }))
}

fn enumerate(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check_with_keywords("enumerate", 1, 2, &["start"])?;
    let inner = interp.get_iter(&args.positional[0])?;
    let count = args.arg(1, "start").map_or(Ok(0), int_arg)?;
    Ok(interp.new_iterator(IterState::Enumerate { inner, count }))
}

fn zip(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("zip", 0, usize::MAX)?;
    let iters = args
        .positional
        .iter()
        .map(|iterable| interp.get_iter(iterable))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(interp.new_iterator(IterState::Zip { iters }))
}

fn any(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("any", 1, 1)?;
    let iterator = interp.get_iter(&args.positional[0])?;
    while let IterStep::Yielded(item) = interp.advance(&iterator)? {
        if interp.truthy(&item)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("all", 1, 1)?;
    let iterator = interp.get_iter(&args.positional[0])?;
    while let IterStep::Yielded(item) = interp.advance(&iterator)? {
        if !interp.truthy(&item)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn callable(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("callable", 1, 1)?;
    let value = &args.positional[0];
    let Some(object) = value.as_object() else {
        return Ok(Value::Bool(false));
    };
    let callable = match &object.data {
        ObjectData::Function(_)
        | ObjectData::NativeFunction(_)
        | ObjectData::BoundMethod(_)
        | ObjectData::Class(_) => true,
        ObjectData::Instance(_) => interp.user_method(value, "__call__").is_some(),
        _ => false,
    };
    Ok(Value::Bool(callable))
}

fn chr(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("chr", 1, 1)?;
    let code = int_arg(&args.positional[0])?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|ch| Value::from(ch.to_string()))
        .ok_or_else(|| RunError::value_error("chr() arg not in range(0x110000)"))
}

fn ord(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("ord", 1, 1)?;
    match &args.positional[0] {
        Value::Str(text) => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => Ok(Value::Int(i64::from(u32::from(ch)))),
                _ => Err(RunError::type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    text.chars().count()
                ))),
            }
        }
        Value::Bytes(bytes) if bytes.len() == 1 => Ok(Value::Int(i64::from(bytes[0]))),
        other => Err(RunError::type_error(format!(
            "ord() expected string of length 1, but {} found",
            other.type_name()
        ))),
    }
}

fn divmod(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("divmod", 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    let quotient = interp.binary_op(BinaryOp::FloorDiv, a, b)?;
    let remainder = interp.binary_op(BinaryOp::Mod, a, b)?;
    Ok(interp.vm.heap.new_tuple(vec![quotient, remainder]))
}

fn pow(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("pow", 2, 2)?;
    interp.binary_op(BinaryOp::Pow, &args.positional[0], &args.positional[1])
}

/// Creates a class object. Without bases the class derives from `object`.
pub(crate) fn new_class(
    interp: &Interpreter,
    name: Arc<str>,
    bases: Vec<ObjRef>,
    dict: Dict,
) -> RunResult<ObjRef> {
    for base in &bases {
        let Some(info) = base.as_class() else {
            return Err(RunError::type_error(format!(
                "bases must be types, not '{}'",
                base.type_name()
            )));
        };
        if !info.subclassable {
            return Err(RunError::type_error(format!(
                "type '{}' is not an acceptable base type",
                info.name
            )));
        }
    }
    let bases = if bases.is_empty() {
        vec![builtin_types().object.clone()]
    } else {
        bases
    };
    let class = Class::new(name, bases, dict);
    Ok(interp.vm.heap.allocate(ObjectData::Class(class)))
}

fn class_bases(values: &[Value]) -> RunResult<Vec<ObjRef>> {
    values
        .iter()
        .map(|base| {
            base.as_object().cloned().ok_or_else(|| {
                RunError::type_error(format!(
                    "bases must be types, not '{}'",
                    base.type_name()
                ))
            })
        })
        .collect()
}

/// `__build_class__(body, name, *bases)`: runs the class body against a
/// fresh namespace and turns the namespace into the class dict.
fn build_class(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("__build_class__", 2, usize::MAX)?;
    let body = args.positional[0]
        .as_object()
        .and_then(|object| object.as_function())
        .ok_or_else(|| RunError::type_error("__build_class__: func must be a function"))?;
    let name = str_arg(&args.positional[1], "__build_class__: name")?.clone();
    let bases = class_bases(&args.positional[2..])?;

    let namespace = interp.vm.heap.new_dict(Dict::new());
    dict_set(&namespace, "__qualname__", Value::Str(name.clone()));
    if let Some(module) = dict_get(&body.globals, "__name__") {
        dict_set(&namespace, "__module__", module);
    }
    let frame = interp.function_frame(body, Args::default(), Some(namespace.clone()))?;
    interp.run_frame(frame)?;

    let dict = namespace
        .as_dict()
        .map(|dict| dict.read().clone())
        .unwrap_or_default();
    new_class(interp, name, bases, dict).map(Value::Object)
}

// constructors of the built-in classes

pub(crate) fn object_new(interp: &mut Interpreter, class: &ObjRef, args: Args) -> RunResult<Value> {
    let Some(info) = class.as_class() else {
        return Err(RunError::type_error("object.__new__(X): X is not a type object"));
    };
    if !args.is_empty() && info.lookup("__init__").is_none() {
        return Err(RunError::type_error(format!(
            "{}() takes no arguments",
            info.name
        )));
    }
    let instance = Instance {
        class: class.clone(),
        dict: RwLock::new(Dict::new()),
    };
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Instance(instance))))
}

pub(crate) fn int_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check_with_keywords("int", 0, 2, &["base"])?;
    let Some(value) = args.get(0) else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = args.arg(1, "base") {
        let Value::Str(text) = value else {
            return Err(RunError::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        return parse_int(text, int_arg(base)?);
    }
    match value {
        Value::Int(_) | Value::BigInt(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(*f),
        Value::Str(text) => parse_int(text, 10),
        _ => match interp.user_method(value, "__int__") {
            Some(method) => interp.call_value(&method, Args::default()),
            None => Err(RunError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                value.type_name()
            ))),
        },
    }
}

fn float_to_int(f: f64) -> RunResult<Value> {
    if f.is_nan() {
        return Err(RunError::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(RunError::new(
            ExcType::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = f.trunc();
    if truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        return Ok(Value::Int(truncated as i64));
    }
    BigInt::from_f64(truncated)
        .map(Value::from_bigint)
        .ok_or_else(|| RunError::value_error("cannot convert float to integer"))
}

/// Parses an integer literal the way `int(text, base)` does: surrounding
/// whitespace, a sign, underscores between digits and a prefix matching
/// the base are accepted. Base 0 infers the base from the prefix.
pub(crate) fn parse_int(text: &str, base: i64) -> RunResult<Value> {
    let invalid = || {
        RunError::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            crate::interpreter::repr_str(text)
        ))
    };
    if base != 0 && !(2..=36).contains(&base) {
        return Err(RunError::value_error("int() base must be >= 2 and <= 36, or 0"));
    }
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = digits.to_ascii_lowercase();
    let prefixed = |prefix: &str, radix: i64| {
        lower
            .strip_prefix(prefix)
            .filter(|_| base == radix || base == 0)
            .map(|rest| (rest.trim_start_matches('_').to_owned(), radix))
    };
    let (body, radix) = prefixed("0x", 16)
        .or_else(|| prefixed("0o", 8))
        .or_else(|| prefixed("0b", 2))
        .unwrap_or((lower.clone(), if base == 0 { 10 } else { base }));

    if body.is_empty()
        || body.starts_with('_')
        || body.ends_with('_')
        || body.contains("__")
    {
        return Err(invalid());
    }
    let clean: String = body.chars().filter(|&c| c != '_').collect();
    if base == 0 && radix == 10 && clean.len() > 1 && clean.starts_with('0') {
        if clean.chars().all(|c| c == '0') {
            return Ok(Value::Int(0));
        }
        return Err(invalid());
    }
    let radix = u32::try_from(radix).map_err(|_| invalid())?;
    let magnitude = BigInt::parse_bytes(clean.as_bytes(), radix).ok_or_else(invalid)?;
    let value = if negative { -magnitude } else { magnitude };
    Ok(Value::from_bigint(value))
}

pub(crate) fn bool_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("bool", 0, 1)?;
    bool_arg(interp, args.get(0), false).map(Value::Bool)
}

pub(crate) fn type_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("type", 1, 3)?;
    match args.positional.as_slice() {
        [value] => Ok(Value::Object(class_of(value))),
        [name, bases, namespace] => {
            let name = str_arg(name, "type.__new__() argument 1")?.clone();
            let bases = match bases.as_object().and_then(|o| o.as_tuple()) {
                Some(items) => class_bases(items)?,
                None => {
                    return Err(RunError::type_error(
                        "type.__new__() argument 2 must be tuple",
                    ));
                }
            };
            let Some(dict) = namespace.as_object().and_then(|o| o.as_dict()) else {
                return Err(RunError::type_error(
                    "type.__new__() argument 3 must be dict",
                ));
            };
            let dict = dict.read().clone();
            new_class(interp, name, bases, dict).map(Value::Object)
        }
        _ => Err(RunError::type_error("type() takes 1 or 3 arguments")),
    }
}

pub(crate) fn float_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("float", 0, 1)?;
    let Some(value) = args.get(0) else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Float(_) => Ok(value.clone()),
        Value::Str(text) => {
            let clean: String = text.trim().chars().filter(|&c| c != '_').collect();
            clean.parse::<f64>().map(Value::Float).map_err(|_| {
                RunError::value_error(format!(
                    "could not convert string to float: {}",
                    crate::interpreter::repr_str(text)
                ))
            })
        }
        _ => {
            if let Some(f) = value.to_f64() {
                if f.is_infinite() && !matches!(value, Value::Float(_)) {
                    return Err(RunError::new(
                        ExcType::OverflowError,
                        "int too large to convert to float",
                    ));
                }
                return Ok(Value::Float(f));
            }
            match interp.user_method(value, "__float__") {
                Some(method) => interp.call_value(&method, Args::default()),
                None => Err(RunError::type_error(format!(
                    "float() argument must be a string or a real number, not '{}'",
                    value.type_name()
                ))),
            }
        }
    }
}

pub(crate) fn str_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("str", 0, 1)?;
    match args.get(0) {
        None => Ok(Value::str("")),
        Some(value @ Value::Str(_)) => Ok(value.clone()),
        Some(value) => interp.to_str(value).map(Value::from),
    }
}

pub(crate) fn bytes_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check_with_keywords("bytes", 0, 2, &["encoding"])?;
    let encoding = args.arg(1, "encoding");
    let Some(value) = args.get(0) else {
        return Ok(Value::Bytes(Arc::from(&[][..])));
    };
    let bytes: Vec<u8> = match (value, encoding) {
        (Value::Str(text), Some(encoding)) => {
            let encoding = str_arg(encoding, "bytes() argument 'encoding'")?;
            match encoding.to_ascii_lowercase().replace('-', "_").as_str() {
                "utf_8" | "utf8" => text.as_bytes().to_vec(),
                "ascii" if text.is_ascii() => text.as_bytes().to_vec(),
                "ascii" => {
                    return Err(RunError::value_error(
                        "'ascii' codec can't encode character",
                    ));
                }
                _ => {
                    return Err(RunError::new(
                        ExcType::LookupError,
                        format!("unknown encoding: {encoding}"),
                    ));
                }
            }
        }
        (Value::Str(_), None) => {
            return Err(RunError::type_error("string argument without an encoding"));
        }
        (_, Some(_)) => {
            return Err(RunError::type_error("encoding without a string argument"));
        }
        (Value::Bytes(bytes), None) => return Ok(Value::Bytes(bytes.clone())),
        (Value::Int(_) | Value::Bool(_), None) => {
            let size = int_arg(value)?;
            let size = usize::try_from(size)
                .map_err(|_| RunError::value_error("negative count"))?;
            vec![0; size]
        }
        (_, None) => interp
            .collect_values(value)?
            .iter()
            .map(|item| {
                let byte = int_arg(item)?;
                u8::try_from(byte)
                    .map_err(|_| RunError::value_error("bytes must be in range(0, 256)"))
            })
            .collect::<RunResult<_>>()?,
    };
    Ok(Value::Bytes(Arc::from(bytes)))
}

pub(crate) fn list_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("list", 0, 1)?;
    let items = match args.get(0) {
        Some(iterable) => interp.collect_values(iterable)?,
        None => Vec::new(),
    };
    Ok(interp.vm.heap.new_list(items))
}

pub(crate) fn tuple_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("tuple", 0, 1)?;
    match args.get(0) {
        Some(value) if value.as_object().is_some_and(|o| o.as_tuple().is_some()) => {
            Ok(value.clone())
        }
        Some(iterable) => {
            let items = interp.collect_values(iterable)?;
            Ok(interp.vm.heap.new_tuple(items))
        }
        None => Ok(interp.vm.heap.new_tuple(Vec::new())),
    }
}

/// Adds the entries of a mapping or of an iterable of pairs to `dict`.
pub(crate) fn update_dict(interp: &mut Interpreter, dict: &mut Dict, source: &Value) -> RunResult<()> {
    if let Some(other) = source.as_object().and_then(|o| o.as_dict()) {
        let entries: Vec<(Value, Value)> = other
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            dict.insert(key.hash_key()?, key, value);
        }
        return Ok(());
    }
    for (index, item) in interp.collect_values(source)?.into_iter().enumerate() {
        let pair = interp.collect_values(&item)?;
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            RunError::value_error(format!(
                "dictionary update sequence element #{index} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        dict.insert(key.hash_key()?, key, value);
    }
    Ok(())
}

pub(crate) fn dict_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    if args.len() > 1 {
        return Err(RunError::type_error(format!(
            "dict expected at most 1 argument, got {}",
            args.len()
        )));
    }
    let mut dict = Dict::new();
    if let Some(source) = args.get(0) {
        update_dict(interp, &mut dict, source)?;
    }
    for (name, value) in &args.keywords {
        dict.set_str(name, value.clone());
    }
    Ok(Value::Object(interp.vm.heap.new_dict(dict)))
}

pub(crate) fn set_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("set", 0, 1)?;
    let items = match args.get(0) {
        Some(iterable) => interp.collect_values(iterable)?,
        None => Vec::new(),
    };
    let mut set = Set::new();
    for item in items {
        set.insert(item.hash_key()?, item);
    }
    Ok(interp.vm.heap.new_set(set))
}

pub(crate) fn range_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("range", 1, 3)?;
    let ints = args
        .positional
        .iter()
        .map(int_arg)
        .collect::<RunResult<Vec<i64>>>()?;
    let range = match ints.as_slice() {
        [stop] => Range { start: 0, stop: *stop, step: 1 },
        [start, stop] => Range { start: *start, stop: *stop, step: 1 },
        [start, stop, step] => Range { start: *start, stop: *stop, step: *step },
        _ => unreachable!("arity checked above"),
    };
    if range.step == 0 {
        return Err(RunError::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Range(range))))
}

pub(crate) fn slice_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("slice", 1, 3)?;
    let get = |i: usize| args.get(i).cloned().unwrap_or(Value::None);
    let slice = match args.len() {
        1 => Slice { start: Value::None, stop: get(0), step: Value::None },
        _ => Slice { start: get(0), stop: get(1), step: get(2) },
    };
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Slice(slice))))
}

pub(crate) fn lock_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("lock", 0, 0)?;
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Lock(Lock::new()))))
}

pub(crate) fn rlock_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("RLock", 0, 0)?;
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::RLock(RLock::new()))))
}

pub(crate) fn condition_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check_with_keywords("Condition", 0, 1, &["lock"])?;
    let lock = match args.arg(0, "lock") {
        None | Some(Value::None) => interp.vm.heap.allocate(ObjectData::RLock(RLock::new())),
        Some(Value::Object(lock)) if crate::condition_lock(lock).is_some() => lock.clone(),
        Some(other) => {
            return Err(RunError::type_error(format!(
                "Condition() lock must be a Lock or RLock, not '{}'",
                other.type_name()
            )));
        }
    };
    let condition = ConditionObject {
        lock,
        condition: crate::Condition::new(),
    };
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Condition(condition))))
}

pub(crate) fn event_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check("Event", 0, 0)?;
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Event(Event::new()))))
}

fn semaphore_value(args: &Args, name: &str) -> RunResult<usize> {
    args.check_with_keywords(name, 0, 1, &["value"])?;
    let value = args.arg(0, "value").map_or(Ok(1), int_arg)?;
    usize::try_from(value)
        .map_err(|_| RunError::value_error("semaphore initial value must be >= 0"))
}

pub(crate) fn semaphore_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    let value = semaphore_value(&args, "Semaphore")?;
    let semaphore = Semaphore::new(value);
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Semaphore(semaphore))))
}

pub(crate) fn bounded_semaphore_new(
    interp: &mut Interpreter,
    _class: &ObjRef,
    args: Args,
) -> RunResult<Value> {
    let value = semaphore_value(&args, "BoundedSemaphore")?;
    let semaphore = Semaphore::bounded(value);
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Semaphore(semaphore))))
}

/// `Thread(group=None, target=None, name=None, args=())`.
pub(crate) fn thread_new(interp: &mut Interpreter, _class: &ObjRef, args: Args) -> RunResult<Value> {
    args.check_with_keywords("Thread", 0, 4, &["group", "target", "name", "args", "daemon"])?;
    if args.arg(0, "group").is_some_and(|group| !group.is_none()) {
        return Err(RunError::value_error("group argument must be None for now"));
    }
    let target = args.arg(1, "target").cloned().unwrap_or(Value::None);
    let name = match args.arg(2, "name") {
        None | Some(Value::None) => default_thread_name(),
        Some(name) => str_arg(name, "Thread() name")?.clone(),
    };
    let call_args = match args.arg(3, "args") {
        Some(values) => interp.collect_values(values)?,
        None => Vec::new(),
    };
    let handle = ThreadHandle::new(name, target, call_args);
    Ok(Value::Object(interp.vm.heap.allocate(ObjectData::Thread(handle))))
}

pub(crate) fn exception_new(interp: &mut Interpreter, class: &ObjRef, args: Args) -> RunResult<Value> {
    if let Some((name, _)) = args.keywords.first() {
        let class_name = class.as_class().map_or("BaseException".into(), |c| c.name.to_string());
        return Err(RunError::type_error(format!(
            "{class_name}() got an unexpected keyword argument '{name}'"
        )));
    }
    let exception = interp.vm.heap.new_exception(class.clone(), args.positional);
    Ok(Value::Object(exception))
}

/// Non-negative size of a sequence as an interpreted int.
#[inline]
pub(crate) fn size_value(size: usize) -> Value {
    Value::Int(i64::try_from(size).unwrap_or(i64::MAX))
}

/// Converts an interpreted int to `usize`, failing for negatives.
pub(crate) fn usize_arg(value: &Value, what: &str) -> RunResult<usize> {
    let value = int_arg(value)?;
    value
        .to_usize()
        .ok_or_else(|| RunError::value_error(format!("{what} must be non-negative")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeBuilder, VM, VMCreateInfo};

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    fn call(interp: &mut Interpreter, name: &str, args: Vec<Value>) -> RunResult<Value> {
        let function = dict_get(&interp.builtins(), name).unwrap();
        interp.call_value(&function, Args::new(args))
    }

    fn list(interp: &Interpreter, items: Vec<Value>) -> Value {
        interp.vm.heap.new_list(items)
    }

    fn ints(value: &Value) -> Vec<Value> {
        let object = value.as_object().unwrap();
        object.as_list().unwrap().read().clone()
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int(" 42 ", 10), Ok(Value::Int(42)));
        assert_eq!(parse_int("-1_000", 10), Ok(Value::Int(-1000)));
        assert_eq!(parse_int("0xff", 16), Ok(Value::Int(255)));
        assert_eq!(parse_int("0b101", 0), Ok(Value::Int(5)));
        assert_eq!(parse_int("z", 36), Ok(Value::Int(35)));
        let big = parse_int("123456789012345678901234567890", 10).unwrap();
        assert!(matches!(big, Value::BigInt(_)));

        let err = parse_int("12a", 10).unwrap_err();
        assert_eq!(err.message(), "invalid literal for int() with base 10: '12a'");
        assert!(parse_int("1__0", 10).is_err());
        assert!(parse_int("010", 0).is_err());
        assert!(parse_int("", 10).is_err());
    }

    #[test]
    fn conversions() {
        let mut interp = interpreter();
        let types = builtin_types();
        let int = Value::Object(types.int.clone());
        let float = Value::Object(types.float.clone());
        let str_ = Value::Object(types.str_.clone());

        assert_eq!(interp.call_value(&int, Args::new(vec![Value::Float(-2.7)])), Ok(Value::Int(-2)));
        assert_eq!(interp.call_value(&int, Args::new(vec![Value::str("7")])), Ok(Value::Int(7)));
        let err = interp.call_value(&int, Args::new(vec![Value::Float(f64::NAN)])).unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
        assert_eq!(interp.call_value(&float, Args::new(vec![Value::str(" 1.5 ")])), Ok(Value::Float(1.5)));
        assert_eq!(interp.call_value(&str_, Args::new(vec![Value::Int(12)])), Ok(Value::str("12")));
        assert_eq!(interp.call_value(&str_, Args::default()), Ok(Value::str("")));
    }

    #[test]
    fn sorted_is_stable_and_reversible() {
        let mut interp = interpreter();
        let items = list(&interp, vec![Value::Int(3), Value::Int(1), Value::Int(2), Value::Int(1)]);
        let sorted_items = call(&mut interp, "sorted", vec![items.clone()]).unwrap();
        assert_eq!(ints(&sorted_items), vec![Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(3)]);

        let function = dict_get(&interp.builtins(), "sorted").unwrap();
        let args = Args::with_keywords(vec![items], vec![(Arc::from("reverse"), Value::Bool(true))]);
        let reversed_items = interp.call_value(&function, args).unwrap();
        assert_eq!(ints(&reversed_items), vec![Value::Int(3), Value::Int(2), Value::Int(1), Value::Int(1)]);

        // equal keys keep their input order
        let pairs = vec![Value::Float(1.0), Value::Int(1), Value::Bool(true)];
        let sorted_pairs = sort_values(&mut interp, pairs.clone(), None, false).unwrap();
        assert!(sorted_pairs.iter().zip(&pairs).all(|(a, b)| a.is(b)));

        let mixed = list(&interp, vec![Value::Int(1), Value::str("a")]);
        let err = call(&mut interp, "sorted", vec![mixed]).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
    }

    #[test]
    fn min_max_sum() {
        let mut interp = interpreter();
        let items = list(&interp, vec![Value::Int(4), Value::Int(-2), Value::Int(9)]);
        assert_eq!(call(&mut interp, "min", vec![items.clone()]), Ok(Value::Int(-2)));
        assert_eq!(call(&mut interp, "max", vec![items.clone()]), Ok(Value::Int(9)));
        assert_eq!(call(&mut interp, "max", vec![Value::Int(1), Value::Int(5)]), Ok(Value::Int(5)));
        assert_eq!(call(&mut interp, "sum", vec![items]), Ok(Value::Int(11)));

        let empty = list(&interp, Vec::new());
        let err = call(&mut interp, "min", vec![empty]).unwrap_err();
        assert_eq!(err.message(), "min() iterable argument is empty");
    }

    #[test]
    fn isinstance_accepts_tuples() {
        let mut interp = interpreter();
        let types = builtin_types();
        let classes = interp.vm.heap.new_tuple(vec![
            Value::Object(types.str_.clone()),
            Value::Object(types.int.clone()),
        ]);
        assert_eq!(call(&mut interp, "isinstance", vec![Value::Bool(true), classes]), Ok(Value::Bool(true)));
        let err = call(&mut interp, "isinstance", vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
    }

    #[test]
    fn next_with_default_and_exhaustion() {
        let mut interp = interpreter();
        let items = list(&interp, vec![Value::Int(1)]);
        let iterator = call(&mut interp, "iter", vec![items]).unwrap();
        assert_eq!(call(&mut interp, "next", vec![iterator.clone()]), Ok(Value::Int(1)));
        assert_eq!(call(&mut interp, "next", vec![iterator.clone(), Value::Int(0)]), Ok(Value::Int(0)));
        let err = call(&mut interp, "next", vec![iterator]).unwrap_err();
        assert!(err.is_instance(ExcType::StopIteration));
    }

    #[test]
    fn builtin_classes_reject_subclassing() {
        let mut interp = interpreter();
        let mut body = CodeBuilder::new("Bad");
        body.load_none().return_value();
        let body = interp.make_function_from_code(body.build().unwrap());
        let int = Value::Object(builtin_types().int.clone());
        let err = call(&mut interp, "__build_class__", vec![body, Value::str("Bad"), int]).unwrap_err();
        assert_eq!(err.message(), "type 'int' is not an acceptable base type");
    }

    #[test]
    fn user_exceptions_subclass_builtin_ones() {
        let mut interp = interpreter();
        let mut body = CodeBuilder::new("Oops");
        body.load_none().return_value();
        let body = interp.make_function_from_code(body.build().unwrap());
        let base = Value::Object(crate::exc_class(ExcType::ValueError).clone());
        let class = call(&mut interp, "__build_class__", vec![body, Value::str("Oops"), base]).unwrap();

        let instance = interp.call_value(&class, Args::new(vec![Value::str("bad")])).unwrap();
        let error = RunError::Raised(instance.as_object().unwrap().clone());
        assert!(error.is_instance(ExcType::ValueError));
        assert_eq!(error.to_string(), "Oops: bad");
    }

    #[test]
    fn timeouts() {
        assert_eq!(timeout_arg(None), Ok(None));
        assert_eq!(timeout_arg(Some(&Value::Int(-1))), Ok(None));
        assert_eq!(timeout_arg(Some(&Value::Float(0.5))), Ok(Some(Duration::from_millis(500))));
        assert!(timeout_arg(Some(&Value::Int(-2))).is_err());
    }
}
