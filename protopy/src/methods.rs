//! Native method tables of the built-in classes. Every method receives
//! its receiver as the first positional argument.
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    Args, Dict, Event, ExcType, GenResult, Interpreter, IterStep, Lock,
    NativeMethod, ObjRef, ObjectData, RLock, RunError, RunResult, Semaphore,
    Set, Value,
    builtins::{
        bool_arg, int_arg, size_value, sort_values, stop_iteration, str_arg,
        timeout_arg, update_dict, usize_arg,
    },
    condition_lock,
    threads::{spawn_thread, thread_handle},
};

/// Splits the receiver off `args`.
fn receiver(args: &mut Args, method: &str) -> RunResult<Value> {
    if args.positional.is_empty() {
        return Err(RunError::type_error(format!(
            "descriptor '{method}' needs an argument"
        )));
    }
    Ok(args.positional.remove(0))
}

fn wrong_receiver(method: &str, owner: &str, value: &Value) -> RunError {
    RunError::type_error(format!(
        "descriptor '{method}' for '{owner}' objects doesn't apply to a '{}' object",
        value.type_name()
    ))
}

macro_rules! receiver_data {
    ($fn_name:ident, $variant:ident, $ty:ty, $owner:literal) => {
        fn $fn_name<'a>(this: &'a Value, method: &str) -> RunResult<&'a $ty> {
            match this.as_object().map(|object| &object.data) {
                Some(ObjectData::$variant(data)) => Ok(data),
                _ => Err(wrong_receiver(method, $owner, this)),
            }
        }
    };
}

receiver_data!(list_of, List, RwLock<Vec<Value>>, "list");
receiver_data!(tuple_of, Tuple, Box<[Value]>, "tuple");
receiver_data!(dict_of, Dict, RwLock<Dict>, "dict");
receiver_data!(set_of, Set, RwLock<Set>, "set");
receiver_data!(lock_of, Lock, Lock, "lock");
receiver_data!(rlock_of, RLock, RLock, "RLock");
receiver_data!(event_of, Event, Event, "Event");
receiver_data!(semaphore_of, Semaphore, Semaphore, "Semaphore");

fn text_of<'a>(this: &'a Value, method: &str) -> RunResult<&'a Arc<str>> {
    match this {
        Value::Str(text) => Ok(text),
        _ => Err(wrong_receiver(method, "str", this)),
    }
}

/// Resolves a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then(|| index as usize)
}

/// Position of the first item equal to `needle`, comparing against a
/// snapshot so user `__eq__` never runs under a container lock.
fn position(interp: &mut Interpreter, items: &[Value], needle: &Value) -> RunResult<Option<usize>> {
    for (index, item) in items.iter().enumerate() {
        if interp.eq_values(item, needle)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn count_equal(interp: &mut Interpreter, items: &[Value], needle: &Value) -> RunResult<Value> {
    let mut count = 0;
    for item in items {
        if interp.eq_values(item, needle)? {
            count += 1;
        }
    }
    Ok(size_value(count))
}

// str

pub const STR_METHODS: &[NativeMethod] = &[
    NativeMethod::new("join", str_join),
    NativeMethod::new("split", str_split),
    NativeMethod::new("strip", str_strip),
    NativeMethod::new("lstrip", str_lstrip),
    NativeMethod::new("rstrip", str_rstrip),
    NativeMethod::new("startswith", str_startswith),
    NativeMethod::new("endswith", str_endswith),
    NativeMethod::new("upper", str_upper),
    NativeMethod::new("lower", str_lower),
    NativeMethod::new("replace", str_replace),
    NativeMethod::new("find", str_find),
    NativeMethod::new("count", str_count),
    NativeMethod::new("isdigit", str_isdigit),
    NativeMethod::new("encode", str_encode),
];

fn str_join(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "join")?;
    let separator = text_of(&this, "join")?;
    args.check("join", 1, 1)?;
    let mut joined = String::new();
    for (index, item) in interp.collect_values(&args.positional[0])?.iter().enumerate() {
        let Value::Str(part) = item else {
            return Err(RunError::type_error(format!(
                "sequence item {index}: expected str instance, {} found",
                item.type_name()
            )));
        };
        if index > 0 {
            joined.push_str(separator);
        }
        joined.push_str(part);
    }
    Ok(Value::from(joined))
}

fn str_split(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "split")?;
    let text = text_of(&this, "split")?;
    args.check_with_keywords("split", 0, 2, &["sep", "maxsplit"])?;
    let limit = match args.arg(1, "maxsplit") {
        Some(value) => usize::try_from(int_arg(value)?).ok(),
        None => None,
    };
    let parts: Vec<Value> = match args.arg(0, "sep") {
        None | Some(Value::None) => {
            let mut parts = Vec::new();
            let mut rest = text.trim_start();
            while !rest.is_empty() {
                if limit.is_some_and(|limit| parts.len() >= limit) {
                    parts.push(Value::str(rest));
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(Value::str(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            parts
        }
        Some(separator) => {
            let separator = str_arg(separator, "separator")?;
            if separator.is_empty() {
                return Err(RunError::value_error("empty separator"));
            }
            match limit {
                Some(limit) => text.splitn(limit + 1, &**separator).map(Value::str).collect(),
                None => text.split(&**separator).map(Value::str).collect(),
            }
        }
    };
    Ok(interp.vm.heap.new_list(parts))
}

fn strip_chars(args: &Args, method: &str) -> RunResult<Option<Vec<char>>> {
    args.check(method, 0, 1)?;
    match args.get(0) {
        None | Some(Value::None) => Ok(None),
        Some(chars) => Ok(Some(str_arg(chars, "strip arg")?.chars().collect())),
    }
}

fn strip_with(
    mut args: Args,
    method: &str,
    strip: fn(&str, &dyn Fn(char) -> bool) -> String,
) -> RunResult<Value> {
    let this = receiver(&mut args, method)?;
    let text = text_of(&this, method)?;
    let result = match strip_chars(&args, method)? {
        Some(chars) => strip(text, &|c| chars.contains(&c)),
        None => strip(text, &char::is_whitespace),
    };
    Ok(Value::from(result))
}

fn str_strip(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    strip_with(args, "strip", |text, pred| text.trim_matches(|c| pred(c)).to_owned())
}

fn str_lstrip(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    strip_with(args, "lstrip", |text, pred| text.trim_start_matches(|c| pred(c)).to_owned())
}

fn str_rstrip(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    strip_with(args, "rstrip", |text, pred| text.trim_end_matches(|c| pred(c)).to_owned())
}

/// Prefix or suffix test; `affix` may be a tuple of candidates.
fn affix_test(mut args: Args, method: &str, test: fn(&str, &str) -> bool) -> RunResult<Value> {
    let this = receiver(&mut args, method)?;
    let text = text_of(&this, method)?;
    args.check(method, 1, 1)?;
    let candidates: Vec<Value> = match &args.positional[0] {
        Value::Object(object) if object.as_tuple().is_some() => {
            object.as_tuple().map(|items| items.to_vec()).unwrap_or_default()
        }
        other => vec![other.clone()],
    };
    for candidate in &candidates {
        let candidate = str_arg(candidate, &format!("{method} arg"))?;
        if test(text, candidate) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn str_startswith(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    affix_test(args, "startswith", |text, prefix| text.starts_with(prefix))
}

fn str_endswith(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    affix_test(args, "endswith", |text, suffix| text.ends_with(suffix))
}

fn str_upper(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "upper")?;
    args.check("upper", 0, 0)?;
    Ok(Value::from(text_of(&this, "upper")?.to_uppercase()))
}

fn str_lower(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "lower")?;
    args.check("lower", 0, 0)?;
    Ok(Value::from(text_of(&this, "lower")?.to_lowercase()))
}

fn str_replace(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "replace")?;
    let text = text_of(&this, "replace")?;
    args.check("replace", 2, 3)?;
    let old = str_arg(&args.positional[0], "replace() argument 1")?;
    let new = str_arg(&args.positional[1], "replace() argument 2")?;
    let result = match args.get(2).map(int_arg).transpose()? {
        Some(count) if count >= 0 => {
            text.replacen(&**old, new, usize::try_from(count).unwrap_or(usize::MAX))
        }
        _ => text.replace(&**old, new),
    };
    Ok(Value::from(result))
}

fn str_find(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "find")?;
    let text = text_of(&this, "find")?;
    args.check("find", 1, 1)?;
    let needle = str_arg(&args.positional[0], "find() argument")?;
    // character offsets, not byte offsets
    let found = text
        .find(&**needle)
        .map(|byte| text[..byte].chars().count());
    Ok(found.map_or(Value::Int(-1), size_value))
}

fn str_count(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "count")?;
    let text = text_of(&this, "count")?;
    args.check("count", 1, 1)?;
    let needle = str_arg(&args.positional[0], "count() argument")?;
    let count = if needle.is_empty() {
        text.chars().count() + 1
    } else {
        text.matches(&**needle).count()
    };
    Ok(size_value(count))
}

fn str_isdigit(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "isdigit")?;
    args.check("isdigit", 0, 0)?;
    let text = text_of(&this, "isdigit")?;
    Ok(Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())))
}

fn str_encode(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "encode")?;
    let text = text_of(&this, "encode")?;
    args.check_with_keywords("encode", 0, 1, &["encoding"])?;
    if let Some(encoding) = args.arg(0, "encoding") {
        let encoding = str_arg(encoding, "encode() argument 'encoding'")?;
        if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8" | "utf_8") {
            return Err(RunError::new(
                ExcType::LookupError,
                format!("unknown encoding: {encoding}"),
            ));
        }
    }
    Ok(Value::Bytes(Arc::from(text.as_bytes())))
}

// bytes

pub const BYTES_METHODS: &[NativeMethod] = &[NativeMethod::new("decode", bytes_decode)];

fn bytes_decode(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "decode")?;
    let Value::Bytes(bytes) = &this else {
        return Err(wrong_receiver("decode", "bytes", &this));
    };
    args.check_with_keywords("decode", 0, 1, &["encoding"])?;
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(Value::str(text)),
        Err(err) => Err(RunError::value_error(format!(
            "'utf-8' codec can't decode byte 0x{:02x} in position {}",
            bytes[err.valid_up_to()],
            err.valid_up_to()
        ))),
    }
}

// list

pub const LIST_METHODS: &[NativeMethod] = &[
    NativeMethod::new("append", list_append),
    NativeMethod::new("extend", list_extend),
    NativeMethod::new("insert", list_insert),
    NativeMethod::new("pop", list_pop),
    NativeMethod::new("remove", list_remove),
    NativeMethod::new("index", list_index),
    NativeMethod::new("count", list_count),
    NativeMethod::new("clear", list_clear),
    NativeMethod::new("copy", list_copy),
    NativeMethod::new("reverse", list_reverse),
    NativeMethod::new("sort", list_sort),
];

fn list_append(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "append")?;
    args.check("append", 1, 1)?;
    list_of(&this, "append")?.write().push(args.positional.remove(0));
    Ok(Value::None)
}

fn list_extend(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "extend")?;
    let list = list_of(&this, "extend")?;
    args.check("extend", 1, 1)?;
    // collected first: extending a list with itself must terminate
    let items = interp.collect_values(&args.positional[0])?;
    list.write().extend(items);
    Ok(Value::None)
}

fn list_insert(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "insert")?;
    let list = list_of(&this, "insert")?;
    args.check("insert", 2, 2)?;
    let index = int_arg(&args.positional[0])?;
    let item = args.positional.remove(1);
    let mut items = list.write();
    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
    let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
    items.insert(index as usize, item);
    Ok(Value::None)
}

fn list_pop(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "pop")?;
    let list = list_of(&this, "pop")?;
    args.check("pop", 0, 1)?;
    let index = args.get(0).map_or(Ok(-1), int_arg)?;
    let mut items = list.write();
    if items.is_empty() {
        return Err(RunError::new(ExcType::IndexError, "pop from empty list"));
    }
    let index = normalize_index(index, items.len())
        .ok_or_else(|| RunError::new(ExcType::IndexError, "pop index out of range"))?;
    Ok(items.remove(index))
}

fn list_remove(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "remove")?;
    let list = list_of(&this, "remove")?;
    args.check("remove", 1, 1)?;
    let snapshot = list.read().clone();
    let Some(index) = position(interp, &snapshot, &args.positional[0])? else {
        return Err(RunError::value_error("list.remove(x): x not in list"));
    };
    let mut items = list.write();
    // the list may have changed while comparing
    match items.get(index) {
        Some(item) if item.is(&snapshot[index]) => {
            items.remove(index);
            Ok(Value::None)
        }
        _ => Err(RunError::runtime_error("list changed size during remove")),
    }
}

fn list_index(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "index")?;
    let snapshot = list_of(&this, "index")?.read().clone();
    args.check("index", 1, 1)?;
    position(interp, &snapshot, &args.positional[0])?
        .map(size_value)
        .ok_or_else(|| RunError::value_error("list.index(x): x not in list"))
}

fn list_count(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "count")?;
    let snapshot = list_of(&this, "count")?.read().clone();
    args.check("count", 1, 1)?;
    count_equal(interp, &snapshot, &args.positional[0])
}

fn list_clear(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    // dropped outside the lock
    let old = std::mem::take(&mut *list_of(&this, "clear")?.write());
    drop(old);
    Ok(Value::None)
}

fn list_copy(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    let items = list_of(&this, "copy")?.read().clone();
    Ok(interp.vm.heap.new_list(items))
}

fn list_reverse(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "reverse")?;
    args.check("reverse", 0, 0)?;
    list_of(&this, "reverse")?.write().reverse();
    Ok(Value::None)
}

fn list_sort(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "sort")?;
    let list = list_of(&this, "sort")?;
    args.check_with_keywords("sort", 0, 0, &["key", "reverse"])?;
    let key = args.keyword("key").filter(|key| !key.is_none()).cloned();
    let reverse = bool_arg(interp, args.keyword("reverse"), false)?;
    let items = list.read().clone();
    let sorted = sort_values(interp, items, key.as_ref(), reverse)?;
    *list.write() = sorted;
    Ok(Value::None)
}

// tuple

pub const TUPLE_METHODS: &[NativeMethod] = &[
    NativeMethod::new("index", tuple_index),
    NativeMethod::new("count", tuple_count),
];

fn tuple_index(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "index")?;
    let items = tuple_of(&this, "index")?;
    args.check("index", 1, 1)?;
    position(interp, items, &args.positional[0])?
        .map(size_value)
        .ok_or_else(|| RunError::value_error("tuple.index(x): x not in tuple"))
}

fn tuple_count(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "count")?;
    let items = tuple_of(&this, "count")?;
    args.check("count", 1, 1)?;
    count_equal(interp, items, &args.positional[0])
}

// dict

pub const DICT_METHODS: &[NativeMethod] = &[
    NativeMethod::new("get", dict_get_method),
    NativeMethod::new("keys", dict_keys),
    NativeMethod::new("values", dict_values),
    NativeMethod::new("items", dict_items),
    NativeMethod::new("pop", dict_pop),
    NativeMethod::new("popitem", dict_popitem),
    NativeMethod::new("setdefault", dict_setdefault),
    NativeMethod::new("update", dict_update),
    NativeMethod::new("clear", dict_clear),
    NativeMethod::new("copy", dict_copy),
];

fn dict_get_method(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "get")?;
    let dict = dict_of(&this, "get")?;
    args.check("get", 1, 2)?;
    let key = args.positional[0].hash_key()?;
    let found = dict.read().get(&key).cloned();
    Ok(found.or_else(|| args.get(1).cloned()).unwrap_or(Value::None))
}

fn dict_keys(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "keys")?;
    args.check("keys", 0, 0)?;
    let keys = dict_of(&this, "keys")?.read().keys().cloned().collect();
    Ok(interp.vm.heap.new_list(keys))
}

fn dict_values(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "values")?;
    args.check("values", 0, 0)?;
    let values = dict_of(&this, "values")?.read().values().cloned().collect();
    Ok(interp.vm.heap.new_list(values))
}

fn dict_items(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "items")?;
    args.check("items", 0, 0)?;
    let pairs: Vec<(Value, Value)> = dict_of(&this, "items")?
        .read()
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let items = pairs
        .into_iter()
        .map(|(key, value)| interp.vm.heap.new_tuple(vec![key, value]))
        .collect();
    Ok(interp.vm.heap.new_list(items))
}

fn dict_pop(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "pop")?;
    let dict = dict_of(&this, "pop")?;
    args.check("pop", 1, 2)?;
    let key = args.positional[0].hash_key()?;
    let removed = dict.write().remove(&key);
    match (removed, args.get(1)) {
        (Some((_, value)), _) => Ok(value),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(interp.key_error(&args.positional[0])),
    }
}

fn dict_popitem(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "popitem")?;
    args.check("popitem", 0, 0)?;
    let last = dict_of(&this, "popitem")?.write().pop_last();
    match last {
        Some((key, value)) => Ok(interp.vm.heap.new_tuple(vec![key, value])),
        None => Err(RunError::new(
            ExcType::KeyError,
            "popitem(): dictionary is empty",
        )),
    }
}

fn dict_setdefault(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "setdefault")?;
    let dict = dict_of(&this, "setdefault")?;
    args.check("setdefault", 1, 2)?;
    let key_value = args.positional[0].clone();
    let key = key_value.hash_key()?;
    let mut dict = dict.write();
    if let Some(existing) = dict.get(&key) {
        return Ok(existing.clone());
    }
    let default = args.get(1).cloned().unwrap_or(Value::None);
    dict.insert(key, key_value, default.clone());
    Ok(default)
}

fn dict_update(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "update")?;
    let dict = dict_of(&this, "update")?;
    if args.len() > 1 {
        return Err(RunError::type_error(format!(
            "update expected at most 1 argument, got {}",
            args.len()
        )));
    }
    // built aside so user code never runs under the dict lock
    let mut entries = Dict::new();
    if let Some(source) = args.get(0) {
        update_dict(interp, &mut entries, source)?;
    }
    for (name, value) in &args.keywords {
        entries.set_str(name, value.clone());
    }
    let mut dict = dict.write();
    for (key, value) in entries.iter() {
        dict.insert(key.hash_key()?, key.clone(), value.clone());
    }
    Ok(Value::None)
}

fn dict_clear(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    let old = std::mem::take(&mut *dict_of(&this, "clear")?.write());
    drop(old);
    Ok(Value::None)
}

fn dict_copy(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    let copy = dict_of(&this, "copy")?.read().clone();
    Ok(Value::Object(interp.vm.heap.new_dict(copy)))
}

// set

pub const SET_METHODS: &[NativeMethod] = &[
    NativeMethod::new("add", set_add),
    NativeMethod::new("discard", set_discard),
    NativeMethod::new("remove", set_remove),
    NativeMethod::new("pop", set_pop),
    NativeMethod::new("clear", set_clear),
    NativeMethod::new("copy", set_copy),
    NativeMethod::new("update", set_update),
];

fn set_add(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "add")?;
    let set = set_of(&this, "add")?;
    args.check("add", 1, 1)?;
    let item = args.positional.remove(0);
    set.write().insert(item.hash_key()?, item);
    Ok(Value::None)
}

fn set_discard(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "discard")?;
    let set = set_of(&this, "discard")?;
    args.check("discard", 1, 1)?;
    let key = args.positional[0].hash_key()?;
    set.write().remove(&key);
    Ok(Value::None)
}

fn set_remove(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "remove")?;
    let set = set_of(&this, "remove")?;
    args.check("remove", 1, 1)?;
    let key = args.positional[0].hash_key()?;
    let removed = set.write().remove(&key);
    match removed {
        Some(_) => Ok(Value::None),
        None => Err(interp.key_error(&args.positional[0])),
    }
}

fn set_pop(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "pop")?;
    args.check("pop", 0, 0)?;
    let popped = set_of(&this, "pop")?.write().pop();
    popped.ok_or_else(|| RunError::new(ExcType::KeyError, "pop from an empty set"))
}

fn set_clear(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    let old = std::mem::take(&mut *set_of(&this, "clear")?.write());
    drop(old);
    Ok(Value::None)
}

fn set_copy(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    let copy = set_of(&this, "copy")?.read().clone();
    Ok(interp.vm.heap.new_set(copy))
}

fn set_update(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "update")?;
    let set = set_of(&this, "update")?;
    args.check("update", 0, usize::MAX)?;
    for iterable in &args.positional {
        let items = interp.collect_values(iterable)?;
        let keys = items
            .iter()
            .map(Value::hash_key)
            .collect::<RunResult<Vec<_>>>()?;
        let mut set = set.write();
        for (key, item) in keys.into_iter().zip(items) {
            set.insert(key, item);
        }
    }
    Ok(Value::None)
}

// generators and coroutines

pub const GENERATOR_METHODS: &[NativeMethod] = &[
    NativeMethod::new("send", generator_send),
    NativeMethod::new("throw", generator_throw),
    NativeMethod::new("close", generator_close),
    NativeMethod::new("__next__", generator_next),
    NativeMethod::new("__iter__", return_self),
];

pub const COROUTINE_METHODS: &[NativeMethod] = &[
    NativeMethod::new("send", generator_send),
    NativeMethod::new("throw", generator_throw),
    NativeMethod::new("close", generator_close),
    NativeMethod::new("__await__", return_self),
];

fn generator_object(this: &Value, method: &str) -> RunResult<ObjRef> {
    this.as_object()
        .filter(|object| object.as_generator().is_some())
        .cloned()
        .ok_or_else(|| wrong_receiver(method, "generator", this))
}

/// Maps a controller outcome onto the method protocol: a return becomes
/// `StopIteration(value)`.
fn yielded(interp: &Interpreter, result: GenResult) -> RunResult<Value> {
    match result {
        GenResult::Yield(value) => Ok(value),
        GenResult::Return(value) => Err(stop_iteration(interp, value)),
    }
}

fn generator_send(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "send")?;
    let generator = generator_object(&this, "send")?;
    args.check("send", 1, 1)?;
    let result = interp.gen_send(&generator, args.positional.remove(0))?;
    yielded(interp, result)
}

fn generator_next(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "__next__")?;
    args.check("__next__", 0, 0)?;
    match interp.advance(&this)? {
        IterStep::Yielded(value) => Ok(value),
        IterStep::Exhausted(value) => Err(stop_iteration(interp, value)),
    }
}

/// `throw(exc)` or the legacy `throw(type, value)` form.
fn generator_throw(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "throw")?;
    let generator = generator_object(&this, "throw")?;
    args.check("throw", 1, 3)?;
    let exception = match args.get(1).filter(|value| !value.is_none()) {
        Some(value) if value.as_object().is_some_and(|o| o.as_exception().is_some()) => {
            interp.make_exception(value)?
        }
        Some(value) => {
            let instance = interp.call_value(&args.positional[0], Args::new(vec![value.clone()]))?;
            interp.make_exception(&instance)?
        }
        None => interp.make_exception(&args.positional[0])?,
    };
    let result = interp.gen_throw(&generator, RunError::Raised(exception))?;
    yielded(interp, result)
}

fn generator_close(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "close")?;
    let generator = generator_object(&this, "close")?;
    args.check("close", 0, 0)?;
    interp.gen_close(&generator)?;
    Ok(Value::None)
}

fn return_self(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "__iter__")?;
    args.check("__iter__", 0, 0)?;
    Ok(this)
}

// iterators

pub const ITERATOR_METHODS: &[NativeMethod] = &[
    NativeMethod::new("__next__", generator_next),
    NativeMethod::new("__iter__", return_self),
];

// synchronization primitives

pub const LOCK_METHODS: &[NativeMethod] = &[
    NativeMethod::new("acquire", lock_acquire),
    NativeMethod::new("release", lock_release),
    NativeMethod::new("locked", lock_locked),
    NativeMethod::new("__enter__", lock_acquire),
    NativeMethod::new("__exit__", lock_exit),
];

/// `acquire(blocking=True, timeout=-1)` arguments.
fn acquire_args(interp: &mut Interpreter, args: &Args, method: &str) -> RunResult<Option<Option<std::time::Duration>>> {
    args.check_with_keywords(method, 0, 2, &["blocking", "timeout"])?;
    let blocking = bool_arg(interp, args.arg(0, "blocking"), true)?;
    let timeout = timeout_arg(args.arg(1, "timeout"))?;
    if !blocking {
        if timeout.is_some() {
            return Err(RunError::value_error(
                "can't specify a timeout for a non-blocking call",
            ));
        }
        return Ok(None);
    }
    Ok(Some(timeout))
}

fn lock_acquire(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "acquire")?;
    let lock = lock_of(&this, "acquire")?;
    let acquired = match acquire_args(interp, &args, "acquire")? {
        None => lock.try_acquire(),
        Some(timeout) => lock.try_acquire() || interp.blocking(|| lock.acquire(timeout)),
    };
    Ok(Value::Bool(acquired))
}

fn lock_release(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "release")?;
    args.check("release", 0, 0)?;
    lock_of(&this, "release")?.release()?;
    Ok(Value::None)
}

fn lock_exit(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "__exit__")?;
    lock_of(&this, "__exit__")?.release()?;
    Ok(Value::Bool(false))
}

fn lock_locked(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "locked")?;
    args.check("locked", 0, 0)?;
    Ok(Value::Bool(lock_of(&this, "locked")?.is_locked()))
}

pub const RLOCK_METHODS: &[NativeMethod] = &[
    NativeMethod::new("acquire", rlock_acquire),
    NativeMethod::new("release", rlock_release),
    NativeMethod::new("__enter__", rlock_acquire),
    NativeMethod::new("__exit__", rlock_exit),
];

fn rlock_acquire(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "acquire")?;
    let lock = rlock_of(&this, "acquire")?;
    let ident = interp.ident();
    let acquired = match acquire_args(interp, &args, "acquire")? {
        None => lock.try_acquire(ident),
        Some(timeout) => {
            lock.try_acquire(ident) || interp.blocking(|| lock.acquire(ident, timeout))
        }
    };
    Ok(Value::Bool(acquired))
}

fn rlock_release(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "release")?;
    args.check("release", 0, 0)?;
    rlock_of(&this, "release")?.release(interp.ident())?;
    Ok(Value::None)
}

fn rlock_exit(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "__exit__")?;
    rlock_of(&this, "__exit__")?.release(interp.ident())?;
    Ok(Value::Bool(false))
}

pub const CONDITION_METHODS: &[NativeMethod] = &[
    NativeMethod::new("acquire", condition_acquire),
    NativeMethod::new("release", condition_release),
    NativeMethod::new("__enter__", condition_acquire),
    NativeMethod::new("__exit__", condition_exit),
    NativeMethod::new("wait", condition_wait),
    NativeMethod::new("notify", condition_notify),
    NativeMethod::new("notify_all", condition_notify_all),
];

fn condition_of<'a>(this: &'a Value, method: &str) -> RunResult<&'a crate::ConditionObject> {
    match this.as_object().map(|object| &object.data) {
        Some(ObjectData::Condition(condition)) => Ok(condition),
        _ => Err(wrong_receiver(method, "Condition", this)),
    }
}

/// Forwards a method call to the condition's lock.
fn forward_to_lock(interp: &mut Interpreter, mut args: Args, method: &str) -> RunResult<Value> {
    let this = receiver(&mut args, method)?;
    let lock = Value::Object(condition_of(&this, method)?.lock.clone());
    let target = interp.getattr(&lock, method)?;
    interp.call_value(&target, args)
}

fn condition_acquire(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    forward_to_lock(interp, args, "acquire")
}

fn condition_release(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    forward_to_lock(interp, args, "release")
}

fn condition_exit(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    forward_to_lock(interp, args, "__exit__")
}

fn condition_wait(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "wait")?;
    let condition = condition_of(&this, "wait")?;
    args.check_with_keywords("wait", 0, 1, &["timeout"])?;
    let timeout = timeout_arg(args.arg(0, "timeout"))?;
    let Some(lock) = condition_lock(&condition.lock) else {
        return Err(RunError::type_error("Condition lock is not a lock"));
    };
    let ident = interp.ident();
    let notified = interp.blocking(|| condition.condition.wait(lock, ident, timeout))?;
    Ok(Value::Bool(notified))
}

fn condition_notify(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "notify")?;
    let condition = condition_of(&this, "notify")?;
    args.check_with_keywords("notify", 0, 1, &["n"])?;
    let count = args.arg(0, "n").map_or(Ok(1), |n| usize_arg(n, "n"))?;
    let Some(lock) = condition_lock(&condition.lock) else {
        return Err(RunError::type_error("Condition lock is not a lock"));
    };
    condition.condition.notify(lock, interp.ident(), count)?;
    Ok(Value::None)
}

fn condition_notify_all(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "notify_all")?;
    let condition = condition_of(&this, "notify_all")?;
    args.check("notify_all", 0, 0)?;
    let Some(lock) = condition_lock(&condition.lock) else {
        return Err(RunError::type_error("Condition lock is not a lock"));
    };
    condition.condition.notify_all(lock, interp.ident())?;
    Ok(Value::None)
}

pub const EVENT_METHODS: &[NativeMethod] = &[
    NativeMethod::new("set", event_set),
    NativeMethod::new("clear", event_clear),
    NativeMethod::new("is_set", event_is_set),
    NativeMethod::new("wait", event_wait),
];

fn event_set(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "set")?;
    args.check("set", 0, 0)?;
    event_of(&this, "set")?.set();
    Ok(Value::None)
}

fn event_clear(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    event_of(&this, "clear")?.clear();
    Ok(Value::None)
}

fn event_is_set(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "is_set")?;
    args.check("is_set", 0, 0)?;
    Ok(Value::Bool(event_of(&this, "is_set")?.is_set()))
}

fn event_wait(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "wait")?;
    let event = event_of(&this, "wait")?;
    args.check_with_keywords("wait", 0, 1, &["timeout"])?;
    let timeout = timeout_arg(args.arg(0, "timeout"))?;
    let set = event.is_set() || interp.blocking(|| event.wait(timeout));
    Ok(Value::Bool(set))
}

pub const SEMAPHORE_METHODS: &[NativeMethod] = &[
    NativeMethod::new("acquire", semaphore_acquire),
    NativeMethod::new("release", semaphore_release),
    NativeMethod::new("__enter__", semaphore_acquire),
    NativeMethod::new("__exit__", semaphore_exit),
];

fn semaphore_acquire(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "acquire")?;
    let semaphore = semaphore_of(&this, "acquire")?;
    let acquired = match acquire_args(interp, &args, "acquire")? {
        None => semaphore.try_acquire(),
        Some(timeout) => {
            semaphore.try_acquire() || interp.blocking(|| semaphore.acquire(timeout))
        }
    };
    Ok(Value::Bool(acquired))
}

fn semaphore_release(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "release")?;
    args.check_with_keywords("release", 0, 1, &["n"])?;
    let count = args.arg(0, "n").map_or(Ok(1), |n| usize_arg(n, "n"))?;
    if count == 0 {
        return Err(RunError::value_error("n must be one or more"));
    }
    semaphore_of(&this, "release")?.release(count)?;
    Ok(Value::None)
}

fn semaphore_exit(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "__exit__")?;
    semaphore_of(&this, "__exit__")?.release(1)?;
    Ok(Value::Bool(false))
}

// threads

pub const THREAD_METHODS: &[NativeMethod] = &[
    NativeMethod::new("start", thread_start),
    NativeMethod::new("join", thread_join),
    NativeMethod::new("is_alive", thread_is_alive),
];

fn thread_object(this: &Value, method: &str) -> RunResult<ObjRef> {
    this.as_object()
        .filter(|object| thread_handle(object).is_some())
        .cloned()
        .ok_or_else(|| wrong_receiver(method, "Thread", this))
}

fn thread_start(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "start")?;
    let owner = thread_object(&this, "start")?;
    args.check("start", 0, 0)?;
    spawn_thread(interp, &owner)?;
    Ok(Value::None)
}

fn thread_join(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "join")?;
    let owner = thread_object(&this, "join")?;
    args.check_with_keywords("join", 0, 1, &["timeout"])?;
    let timeout = timeout_arg(args.arg(0, "timeout"))?;
    let Some(handle) = thread_handle(&owner) else {
        return Err(wrong_receiver("join", "Thread", &this));
    };
    let caller = interp.ident();
    interp.blocking(|| handle.join(timeout, caller))?;
    Ok(Value::None)
}

fn thread_is_alive(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "is_alive")?;
    let owner = thread_object(&this, "is_alive")?;
    args.check("is_alive", 0, 0)?;
    Ok(Value::Bool(thread_handle(&owner).is_some_and(|handle| handle.is_alive())))
}

// exceptions

pub const EXCEPTION_METHODS: &[NativeMethod] = &[
    NativeMethod::new("with_traceback", exception_with_traceback),
    NativeMethod::new("add_note", exception_add_note),
];

fn exception_of<'a>(this: &'a Value, method: &str) -> RunResult<&'a crate::ExceptionObject> {
    this.as_object()
        .and_then(|object| object.as_exception())
        .ok_or_else(|| wrong_receiver(method, "BaseException", this))
}

/// Tracebacks are not first-class values; only `None` clears the
/// recorded one.
fn exception_with_traceback(_interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "with_traceback")?;
    let exception = exception_of(&this, "with_traceback")?;
    args.check("with_traceback", 1, 1)?;
    if args.positional[0].is_none() {
        exception.traceback.lock().clear();
    }
    Ok(this)
}

fn exception_add_note(interp: &mut Interpreter, mut args: Args) -> RunResult<Value> {
    let this = receiver(&mut args, "add_note")?;
    let exception = exception_of(&this, "add_note")?;
    args.check("add_note", 1, 1)?;
    let note = args.positional.remove(0);
    if !matches!(note, Value::Str(_)) {
        return Err(RunError::type_error(format!(
            "note must be a str, not '{}'",
            note.type_name()
        )));
    }
    let notes = exception.dict.read().get_str("__notes__").cloned();
    match notes.as_ref().and_then(|notes| notes.as_object()).and_then(|o| o.as_list()) {
        Some(list) => list.write().push(note),
        None => {
            let list = interp.vm.heap.new_list(vec![note]);
            exception.dict.write().set_str("__notes__", list);
        }
    }
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BinaryOp, CodeBuilder, Op, VM, VMCreateInfo, builtin_types,
        interpreter::dict_get,
    };

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    fn method(interp: &mut Interpreter, target: &Value, name: &str, args: Vec<Value>) -> RunResult<Value> {
        let bound = interp.getattr(target, name)?;
        interp.call_value(&bound, Args::new(args))
    }

    fn items(value: &Value) -> Vec<Value> {
        value.as_object().unwrap().as_list().unwrap().read().clone()
    }

    #[test]
    fn list_methods() {
        let mut interp = interpreter();
        let list = interp.vm.heap.new_list(vec![Value::Int(3), Value::Int(1)]);
        method(&mut interp, &list, "append", vec![Value::Int(2)]).unwrap();
        method(&mut interp, &list, "insert", vec![Value::Int(-100), Value::Int(0)]).unwrap();
        assert_eq!(items(&list), vec![Value::Int(0), Value::Int(3), Value::Int(1), Value::Int(2)]);

        method(&mut interp, &list, "sort", vec![]).unwrap();
        assert_eq!(items(&list), vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(method(&mut interp, &list, "pop", vec![]), Ok(Value::Int(3)));
        assert_eq!(method(&mut interp, &list, "index", vec![Value::Float(2.0)]), Ok(Value::Int(2)));
        method(&mut interp, &list, "remove", vec![Value::Int(0)]).unwrap();
        assert_eq!(items(&list), vec![Value::Int(1), Value::Int(2)]);

        method(&mut interp, &list, "extend", vec![list.clone()]).unwrap();
        assert_eq!(method(&mut interp, &list, "count", vec![Value::Int(1)]), Ok(Value::Int(2)));

        let err = method(&mut interp, &list, "remove", vec![Value::Int(9)]).unwrap_err();
        assert_eq!(err.message(), "list.remove(x): x not in list");
        method(&mut interp, &list, "clear", vec![]).unwrap();
        let err = method(&mut interp, &list, "pop", vec![]).unwrap_err();
        assert!(err.is_instance(ExcType::IndexError));
    }

    #[test]
    fn unbound_methods_check_the_receiver() {
        let mut interp = interpreter();
        let list_class = Value::Object(builtin_types().list.clone());
        let append = interp.getattr(&list_class, "append").unwrap();
        let err = interp
            .call_value(&append, Args::new(vec![Value::Int(1), Value::Int(2)]))
            .unwrap_err();
        assert_eq!(
            err.message(),
            "descriptor 'append' for 'list' objects doesn't apply to a 'int' object"
        );
    }

    #[test]
    fn str_methods() {
        let mut interp = interpreter();
        let text = Value::str("  a b  c ");
        let parts = method(&mut interp, &text, "split", vec![]).unwrap();
        assert_eq!(items(&parts), vec![Value::str("a"), Value::str("b"), Value::str("c")]);
        assert_eq!(method(&mut interp, &text, "strip", vec![]), Ok(Value::str("a b  c")));

        let csv = Value::str("x,y,,z");
        let parts = method(&mut interp, &csv, "split", vec![Value::str(","), Value::Int(2)]).unwrap();
        assert_eq!(items(&parts), vec![Value::str("x"), Value::str("y"), Value::str(",z")]);

        let words = interp.vm.heap.new_list(vec![Value::str("p"), Value::str("q")]);
        assert_eq!(method(&mut interp, &Value::str("-"), "join", vec![words]), Ok(Value::str("p-q")));
        assert_eq!(method(&mut interp, &Value::str("héllo"), "find", vec![Value::str("l")]), Ok(Value::Int(2)));
        assert_eq!(method(&mut interp, &Value::str("abc"), "upper", vec![]), Ok(Value::str("ABC")));
        let prefixes = interp.vm.heap.new_tuple(vec![Value::str("x"), Value::str("ab")]);
        assert_eq!(method(&mut interp, &Value::str("abc"), "startswith", vec![prefixes]), Ok(Value::Bool(true)));
    }

    #[test]
    fn dict_methods() {
        let mut interp = interpreter();
        let dict = Value::Object(interp.vm.heap.new_dict(Dict::new()));
        assert_eq!(method(&mut interp, &dict, "setdefault", vec![Value::str("a"), Value::Int(1)]), Ok(Value::Int(1)));
        assert_eq!(method(&mut interp, &dict, "setdefault", vec![Value::str("a"), Value::Int(2)]), Ok(Value::Int(1)));
        assert_eq!(method(&mut interp, &dict, "get", vec![Value::str("b"), Value::Int(0)]), Ok(Value::Int(0)));

        let update = interp.getattr(&dict, "update").unwrap();
        let args = Args::with_keywords(Vec::new(), vec![(Arc::from("b"), Value::Int(2))]);
        interp.call_value(&update, args).unwrap();
        let keys = method(&mut interp, &dict, "keys", vec![]).unwrap();
        assert_eq!(items(&keys), vec![Value::str("a"), Value::str("b")]);

        assert_eq!(method(&mut interp, &dict, "pop", vec![Value::str("a")]), Ok(Value::Int(1)));
        let err = method(&mut interp, &dict, "pop", vec![Value::str("a")]).unwrap_err();
        assert!(err.is_instance(ExcType::KeyError));
        assert_eq!(method(&mut interp, &dict, "pop", vec![Value::str("a"), Value::None]), Ok(Value::None));
    }

    #[test]
    fn generator_methods_follow_the_protocol() {
        // def gen(): x = yield 1; yield x + 1
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("gen").generator();
        b.load_const(1).op(Op::YieldValue).store_fast("x");
        b.load_fast("x").load_const(1).binary(BinaryOp::Add).op(Op::YieldValue).op(Op::PopTop);
        b.load_none().return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let generator = interp.call_value(&function, Args::default()).unwrap();

        let err = method(&mut interp, &generator, "send", vec![Value::Int(5)]).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
        assert_eq!(method(&mut interp, &generator, "__next__", vec![]), Ok(Value::Int(1)));
        assert_eq!(method(&mut interp, &generator, "send", vec![Value::Int(41)]), Ok(Value::Int(42)));
        let err = method(&mut interp, &generator, "__next__", vec![]).unwrap_err();
        assert!(err.is_instance(ExcType::StopIteration));
        method(&mut interp, &generator, "close", vec![]).unwrap();
    }

    #[test]
    fn throw_into_a_suspended_generator() {
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("gen").generator();
        b.load_const(1).op(Op::YieldValue).op(Op::PopTop);
        b.load_none().return_value();
        let function = interp.make_function_from_code(b.build().unwrap());
        let generator = interp.call_value(&function, Args::default()).unwrap();
        method(&mut interp, &generator, "__next__", vec![]).unwrap();

        let value_error = dict_get(&interp.builtins(), "ValueError").unwrap();
        let err = method(&mut interp, &generator, "throw", vec![value_error]).unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
        let err = method(&mut interp, &generator, "send", vec![Value::None]).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
    }

    #[test]
    fn lock_methods() {
        let mut interp = interpreter();
        let lock = Value::Object(interp.vm.heap.allocate(ObjectData::Lock(Lock::new())));
        assert_eq!(method(&mut interp, &lock, "acquire", vec![]), Ok(Value::Bool(true)));
        assert_eq!(method(&mut interp, &lock, "acquire", vec![Value::Bool(false)]), Ok(Value::Bool(false)));
        assert_eq!(method(&mut interp, &lock, "acquire", vec![Value::Bool(true), Value::Float(0.01)]), Ok(Value::Bool(false)));
        assert_eq!(method(&mut interp, &lock, "locked", vec![]), Ok(Value::Bool(true)));
        method(&mut interp, &lock, "release", vec![]).unwrap();
        let err = method(&mut interp, &lock, "release", vec![]).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));
    }

    #[test]
    fn condition_wait_needs_the_lock() {
        let mut interp = interpreter();
        let class = Value::Object(builtin_types().condition.clone());
        let condition = interp.call_value(&class, Args::default()).unwrap();
        let err = method(&mut interp, &condition, "wait", vec![Value::Float(0.01)]).unwrap_err();
        assert!(err.is_instance(ExcType::RuntimeError));

        assert_eq!(method(&mut interp, &condition, "acquire", vec![]), Ok(Value::Bool(true)));
        assert_eq!(method(&mut interp, &condition, "wait", vec![Value::Float(0.01)]), Ok(Value::Bool(false)));
        method(&mut interp, &condition, "notify", vec![]).unwrap();
        method(&mut interp, &condition, "release", vec![]).unwrap();
    }

    #[test]
    fn bounded_semaphore_over_release() {
        let mut interp = interpreter();
        let class = Value::Object(builtin_types().bounded_semaphore.clone());
        let semaphore = interp.call_value(&class, Args::new(vec![Value::Int(1)])).unwrap();
        assert_eq!(method(&mut interp, &semaphore, "acquire", vec![]), Ok(Value::Bool(true)));
        method(&mut interp, &semaphore, "release", vec![]).unwrap();
        let err = method(&mut interp, &semaphore, "release", vec![]).unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
    }

    #[test]
    fn exception_notes() {
        let mut interp = interpreter();
        let exception = Value::Object(interp.new_exception(ExcType::ValueError, vec![]));
        method(&mut interp, &exception, "add_note", vec![Value::str("one")]).unwrap();
        method(&mut interp, &exception, "add_note", vec![Value::str("two")]).unwrap();
        let notes = interp.getattr(&exception, "__notes__").unwrap();
        assert_eq!(items(&notes), vec![Value::str("one"), Value::str("two")]);
        let same = method(&mut interp, &exception, "with_traceback", vec![Value::None]).unwrap();
        assert!(same.is(&exception));
    }
}
