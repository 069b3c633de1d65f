//! Native modules: `_thread`, `sys`, `gc` and `time`.
use std::{
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::debug;

use crate::{
    Args, Dict, ExcType, Interpreter, Module, NativeMethod, ObjRef, ObjectData,
    RunError, RunResult, ThreadHandle, Value, builtin_types,
    builtins::{int_arg, size_value, timeout_arg},
    current_thread_ident, default_thread_name, exc_class,
    threads::spawn_thread,
};

/// Builds the native module `name`, or `None` if there is no such module.
pub(crate) fn create_native_module(interp: &Interpreter, name: &str) -> Option<ObjRef> {
    let mut globals = Dict::new();
    match name {
        "_thread" => thread_module(&mut globals),
        "sys" => sys_module(&mut globals),
        "gc" => add_functions(&mut globals, GC_FUNCTIONS),
        "time" => add_functions(&mut globals, TIME_FUNCTIONS),
        _ => return None,
    }
    debug!("creating native module {name}");
    globals.set_str("__name__", Value::str(name));
    let module = Module {
        name: Arc::from(name),
        globals: interp.vm.heap.new_dict(globals),
    };
    Some(interp.vm.heap.allocate(ObjectData::Module(module)))
}

fn add_functions(globals: &mut Dict, functions: &[NativeMethod]) {
    for function in functions {
        globals.set_str(function.name, Value::Object(function.to_object()));
    }
}

fn class_value(class: &ObjRef) -> Value {
    Value::Object(class.clone())
}

// _thread

const THREAD_FUNCTIONS: &[NativeMethod] = &[
    NativeMethod::new("start_new_thread", start_new_thread),
    NativeMethod::new("get_ident", get_ident),
    NativeMethod::new("allocate_lock", allocate_lock),
];

fn thread_module(globals: &mut Dict) {
    add_functions(globals, THREAD_FUNCTIONS);
    let types = builtin_types();
    globals.set_str("LockType", class_value(&types.lock));
    globals.set_str("Lock", class_value(&types.lock));
    globals.set_str("RLock", class_value(&types.rlock));
    globals.set_str("Condition", class_value(&types.condition));
    globals.set_str("Event", class_value(&types.event));
    globals.set_str("Semaphore", class_value(&types.semaphore));
    globals.set_str("BoundedSemaphore", class_value(&types.bounded_semaphore));
    globals.set_str("Thread", class_value(&types.thread));
    globals.set_str("error", class_value(exc_class(ExcType::RuntimeError)));
    globals.set_str("TIMEOUT_MAX", Value::Float(Duration::MAX.as_secs_f64()));
}

/// `start_new_thread(function, args, kwargs=None)`; returns the new
/// thread's identity.
fn start_new_thread(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("start_new_thread", 2, 3)?;
    let target = args.positional[0].clone();
    let Some(call_args) = args.positional[1]
        .as_object()
        .and_then(|object| object.as_tuple())
    else {
        return Err(RunError::type_error("2nd arg must be a tuple"));
    };
    let has_keywords = match args.get(2) {
        None | Some(Value::None) => false,
        Some(Value::Object(object)) if object.as_dict().is_some() => {
            object.as_dict().is_some_and(|dict| !dict.read().is_empty())
        }
        Some(_) => return Err(RunError::type_error("optional 3rd arg must be a dictionary")),
    };
    if has_keywords {
        return Err(RunError::type_error(
            "start_new_thread() keyword arguments are not supported",
        ));
    }

    let handle = ThreadHandle::new(default_thread_name(), target, call_args.to_vec());
    let owner = interp.vm.heap.allocate(ObjectData::Thread(handle));
    let ident = spawn_thread(interp, &owner)?;
    Ok(ident_value(ident))
}

fn ident_value(ident: u64) -> Value {
    Value::Int(i64::try_from(ident).unwrap_or(i64::MAX))
}

fn get_ident(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("get_ident", 0, 0)?;
    Ok(ident_value(current_thread_ident()))
}

fn allocate_lock(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("allocate_lock", 0, 0)?;
    let lock = class_value(&builtin_types().lock);
    interp.call_value(&lock, Args::default())
}

// sys

const SYS_FUNCTIONS: &[NativeMethod] = &[
    NativeMethod::new("getrecursionlimit", getrecursionlimit),
    NativeMethod::new("setrecursionlimit", setrecursionlimit),
];

fn sys_module(globals: &mut Dict) {
    add_functions(globals, SYS_FUNCTIONS);
    globals.set_str("maxsize", Value::Int(i64::MAX));
    globals.set_str("byteorder", Value::str(if cfg!(target_endian = "big") { "big" } else { "little" }));
    globals.set_str("platform", Value::str(std::env::consts::OS));
}

fn getrecursionlimit(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("getrecursionlimit", 0, 0)?;
    Ok(size_value(interp.vm.shared.recursion_limit()))
}

fn setrecursionlimit(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("setrecursionlimit", 1, 1)?;
    let limit = int_arg(&args.positional[0])?;
    let limit = usize::try_from(limit)
        .ok()
        .filter(|&limit| limit >= 1)
        .ok_or_else(|| RunError::value_error("recursion limit must be greater or equal than 1"))?;
    interp.vm.shared.set_recursion_limit(limit);
    Ok(Value::None)
}

// gc

const GC_FUNCTIONS: &[NativeMethod] = &[
    NativeMethod::new("collect", gc_collect),
    NativeMethod::new("enable", gc_enable),
    NativeMethod::new("disable", gc_disable),
    NativeMethod::new("isenabled", gc_isenabled),
    NativeMethod::new("get_count", gc_get_count),
];

/// Runs a full collection. Returns the number of objects collected, or 0
/// when another thread's collection ran instead.
fn gc_collect(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check_with_keywords("collect", 0, 1, &["generation"])?;
    let managed = interp.is_managed();
    let stats = interp.vm.heap.shared().collect(managed);
    Ok(size_value(stats.map_or(0, |stats| stats.collected)))
}

fn gc_enable(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("enable", 0, 0)?;
    interp.vm.heap.shared().set_enabled(true);
    Ok(Value::None)
}

fn gc_disable(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("disable", 0, 0)?;
    interp.vm.heap.shared().set_enabled(false);
    Ok(Value::None)
}

fn gc_isenabled(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("isenabled", 0, 0)?;
    Ok(Value::Bool(interp.vm.heap.shared().is_enabled()))
}

/// Single generation: `(allocations since the last collection, 0, 0)`.
fn gc_get_count(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("get_count", 0, 0)?;
    let count = interp.vm.heap.shared().allocations_since_collection();
    Ok(interp.vm.heap.new_tuple(vec![size_value(count), Value::Int(0), Value::Int(0)]))
}

// time

const TIME_FUNCTIONS: &[NativeMethod] = &[
    NativeMethod::new("sleep", sleep),
    NativeMethod::new("monotonic", monotonic),
    NativeMethod::new("perf_counter", monotonic),
    NativeMethod::new("time", wall_time),
];

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn sleep(interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("sleep", 1, 1)?;
    let seconds = &args.positional[0];
    if seconds.to_f64().is_some_and(|s| s < 0.0) {
        return Err(RunError::value_error("sleep length must be non-negative"));
    }
    if let Some(duration) = timeout_arg(Some(seconds))? {
        interp.blocking(|| thread::sleep(duration));
    }
    Ok(Value::None)
}

fn monotonic(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("monotonic", 0, 0)?;
    Ok(Value::Float(process_start().elapsed().as_secs_f64()))
}

fn wall_time(_interp: &mut Interpreter, args: Args) -> RunResult<Value> {
    args.check("time", 0, 0)?;
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| RunError::new(ExcType::OSError, err.to_string()))?;
    Ok(Value::Float(since_epoch.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BinaryOp, CodeBuilder, CompareOp, Op, VM, VMCreateInfo,
        interpreter::dict_get,
    };

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    fn call(interp: &mut Interpreter, module: &str, name: &str, args: Vec<Value>) -> RunResult<Value> {
        let module = interp.import(module)?;
        let function = dict_get(&module.as_module().unwrap().globals, name).unwrap();
        interp.call_value(&function, Args::new(args))
    }

    #[test]
    fn modules_are_created_once() {
        let mut interp = interpreter();
        let first = interp.import("gc").unwrap();
        let second = interp.import("gc").unwrap();
        assert!(first.ptr_eq(&second));
        assert!(create_native_module(&interp, "os").is_none());
    }

    #[test]
    fn recursion_limit_round_trips() {
        let mut interp = interpreter();
        call(&mut interp, "sys", "setrecursionlimit", vec![Value::Int(50)]).unwrap();
        assert_eq!(call(&mut interp, "sys", "getrecursionlimit", vec![]), Ok(Value::Int(50)));
        let err = call(&mut interp, "sys", "setrecursionlimit", vec![Value::Int(0)]).unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
    }

    #[test]
    fn gc_switches_and_collects() {
        let mut interp = interpreter();
        call(&mut interp, "gc", "disable", vec![]).unwrap();
        assert_eq!(call(&mut interp, "gc", "isenabled", vec![]), Ok(Value::Bool(false)));
        call(&mut interp, "gc", "enable", vec![]).unwrap();

        // a self-referencing list that nothing else holds
        let list = interp.vm.heap.new_list(Vec::new());
        let object = list.as_object().unwrap().clone();
        object.as_list().unwrap().write().push(list);
        drop(object);

        let collected = call(&mut interp, "gc", "collect", vec![]).unwrap();
        assert!(matches!(collected, Value::Int(n) if n >= 1));
    }

    #[test]
    fn sleep_rejects_negative_lengths() {
        let mut interp = interpreter();
        call(&mut interp, "time", "sleep", vec![Value::Float(0.001)]).unwrap();
        let err = call(&mut interp, "time", "sleep", vec![Value::Int(-1)]).unwrap_err();
        assert_eq!(err.message(), "sleep length must be non-negative");
        let before = call(&mut interp, "time", "monotonic", vec![]).unwrap().to_f64().unwrap();
        let after = call(&mut interp, "time", "monotonic", vec![]).unwrap().to_f64().unwrap();
        assert!(after >= before);
    }

    /// Ten threads each add one a hundred times under a shared lock.
    #[test]
    fn locked_counter_across_threads() {
        let vm = VM::new(VMCreateInfo::default());
        let mut interp = Interpreter::new(vm.new_proxy());

        // def work(lock, box):
        //     for _ in range(100):
        //         lock.acquire(); box[0] = box[0] + 1; lock.release()
        let mut b = CodeBuilder::new("work").args(&["lock", "box"]);
        let (top, done) = (b.label(), b.label());
        b.load_global("range").load_const(100).call(1).op(Op::GetIter);
        b.bind(top);
        b.for_iter(done).op(Op::PopTop);
        b.load_fast("lock").load_attr("acquire").call(0).op(Op::PopTop);
        b.load_fast("box").load_const(0).op(Op::BinarySubscr);
        b.load_const(1).binary(BinaryOp::Add);
        b.load_fast("box").load_const(0).op(Op::StoreSubscr);
        b.load_fast("lock").load_attr("release").call(0).op(Op::PopTop);
        b.jump(top);
        b.bind(done);
        b.load_none().return_value();
        let work = interp.make_function_from_code(b.build().unwrap());

        let lock = call(&mut interp, "_thread", "allocate_lock", vec![]).unwrap();
        let counter = interp.vm.heap.new_list(vec![Value::Int(0)]);
        let call_args = interp.vm.heap.new_tuple(vec![lock, counter.clone()]);
        for _ in 0..10 {
            call(&mut interp, "_thread", "start_new_thread", vec![work.clone(), call_args.clone()]).unwrap();
        }
        drop(interp);
        vm.join_threads().unwrap();

        let list = counter.as_object().unwrap().as_list().unwrap();
        assert_eq!(list.read().clone(), vec![Value::Int(1000)]);
    }

    /// Threads appending to one list without a lock lose no items.
    #[test]
    fn concurrent_appends_keep_every_item() {
        let vm = VM::new(VMCreateInfo::default());
        let mut interp = Interpreter::new(vm.new_proxy());

        // def work(items, n):
        //     i = 0
        //     while i < n: items.append(i); i += 1
        let mut b = CodeBuilder::new("work").args(&["items", "n"]);
        let (top, done) = (b.label(), b.label());
        b.load_const(0).store_fast("i");
        b.bind(top);
        b.load_fast("i").load_fast("n").compare(CompareOp::Lt).pop_jump_if_false(done);
        b.load_fast("items").load_attr("append").load_fast("i").call(1).op(Op::PopTop);
        b.load_fast("i").load_const(1).inplace(BinaryOp::Add).store_fast("i");
        b.jump(top);
        b.bind(done);
        b.load_none().return_value();
        let work = interp.make_function_from_code(b.build().unwrap());

        let items = interp.vm.heap.new_list(Vec::new());
        let thread_class = Value::Object(builtin_types().thread.clone());
        let mut threads = Vec::new();
        for _ in 0..4 {
            let call_args = interp.vm.heap.new_tuple(vec![items.clone(), Value::Int(500)]);
            let args = Args::with_keywords(
                Vec::new(),
                vec![(Arc::from("target"), work.clone()), (Arc::from("args"), call_args)],
            );
            let thread = interp.call_value(&thread_class, args).unwrap();
            let start = interp.getattr(&thread, "start").unwrap();
            interp.call_value(&start, Args::default()).unwrap();
            threads.push(thread);
        }
        for thread in &threads {
            let join = interp.getattr(thread, "join").unwrap();
            interp.call_value(&join, Args::default()).unwrap();
            let alive = interp.getattr(thread, "is_alive").unwrap();
            assert_eq!(interp.call_value(&alive, Args::default()), Ok(Value::Bool(false)));
        }
        drop(interp);
        vm.join_threads().unwrap();

        assert_eq!(items.as_object().unwrap().as_list().unwrap().read().len(), 2000);
    }
}
