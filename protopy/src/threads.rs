//! Interpreter threads.
//!
//! Every thread started from interpreted code is a real OS thread running
//! its own [`Interpreter`] against the shared heap. There is no global
//! interpreter lock; threads only coordinate through per-object locks, the
//! synchronization primitives and collector safepoints.
use std::{
    cell::Cell,
    mem,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::{
    Args, ExcType, Interpreter, ObjRef, ObjectData, RunError, RunResult,
    Value, Visitable, Visitor,
};

static NEXT_IDENT: AtomicU64 = AtomicU64::new(1);
static NEXT_NAME: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static IDENT: Cell<u64> = const { Cell::new(0) };
}

fn next_ident() -> u64 {
    NEXT_IDENT.fetch_add(1, Ordering::Relaxed)
}

/// Identity of the calling OS thread, assigned on first use.
pub fn current_thread_ident() -> u64 {
    IDENT.with(|ident| {
        if ident.get() == 0 {
            ident.set(next_ident());
        }
        ident.get()
    })
}

fn adopt_ident(ident: u64) {
    IDENT.with(|cell| cell.set(ident));
}

/// Default name for threads created without one.
pub fn default_thread_name() -> Arc<str> {
    Arc::from(format!("Thread-{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Initial,
    Started,
    Finished,
}

#[derive(Debug)]
struct ThreadSlot {
    target: Option<Value>,
    args: Vec<Value>,
    status: ThreadStatus,
    joined: bool,
    ident: Option<u64>,
    result: Option<Value>,
    error: Option<RunError>,
}

/// Thread object visible to interpreted code.
#[derive(Debug)]
pub struct ThreadHandle {
    pub name: Arc<str>,
    slot: Mutex<ThreadSlot>,
    finished: Condvar,
}

impl ThreadHandle {
    #[must_use]
    pub fn new(name: Arc<str>, target: Value, args: Vec<Value>) -> Self {
        Self {
            name,
            slot: Mutex::new(ThreadSlot {
                target: Some(target),
                args,
                status: ThreadStatus::Initial,
                joined: false,
                ident: None,
                result: None,
                error: None,
            }),
            finished: Condvar::new(),
        }
    }

    pub fn status(&self) -> ThreadStatus {
        self.slot.lock().status
    }

    pub fn ident(&self) -> Option<u64> {
        self.slot.lock().ident
    }

    /// Read under the same lock the finishing thread takes, so it never
    /// observes a half-finished thread.
    pub fn is_alive(&self) -> bool {
        self.slot.lock().status == ThreadStatus::Started
    }

    /// The uncaught error the thread died with, if any.
    pub fn error(&self) -> Option<RunError> {
        self.slot.lock().error.clone()
    }

    fn begin(&self, ident: u64) -> RunResult<(Value, Vec<Value>)> {
        let mut slot = self.slot.lock();
        if slot.status != ThreadStatus::Initial {
            return Err(RunError::runtime_error("threads can only be started once"));
        }
        let target = slot.target.take().unwrap_or(Value::None);
        slot.status = ThreadStatus::Started;
        slot.ident = Some(ident);
        Ok((target, mem::take(&mut slot.args)))
    }

    fn finish(&self, result: RunResult<Value>) {
        let mut slot = self.slot.lock();
        match result {
            Ok(value) => slot.result = Some(value),
            Err(err) => slot.error = Some(err),
        }
        slot.status = ThreadStatus::Finished;
        self.finished.notify_all();
    }

    /// Waits for the thread to finish. Returns `false` when `timeout`
    /// elapsed first; only a successful join counts as joined.
    pub fn join(&self, timeout: Option<Duration>, caller: u64) -> RunResult<bool> {
        let mut slot = self.slot.lock();
        if slot.status == ThreadStatus::Initial {
            return Err(RunError::runtime_error(
                "cannot join thread before it is started",
            ));
        }
        if slot.joined {
            return Err(RunError::runtime_error("thread already joined"));
        }
        if slot.ident == Some(caller) {
            return Err(RunError::runtime_error("cannot join current thread"));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while slot.status != ThreadStatus::Finished {
            match deadline {
                None => self.finished.wait(&mut slot),
                Some(deadline) => {
                    if self.finished.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        let done = slot.status == ThreadStatus::Finished;
        slot.joined |= done;
        Ok(done)
    }

    pub(crate) fn clear_refs(&self, values: &mut Vec<Value>) {
        let mut slot = self.slot.lock();
        values.extend(slot.target.take());
        values.append(&mut slot.args);
        values.extend(slot.result.take());
    }
}

impl Visitable for ThreadHandle {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        let slot = self.slot.lock();
        if let Some(target) = &slot.target {
            visitor.visit(target);
        }
        slot.args.iter().for_each(|arg| visitor.visit(arg));
        if let Some(result) = &slot.result {
            visitor.visit(result);
        }
    }
}

pub(crate) fn thread_handle(object: &ObjRef) -> Option<&ThreadHandle> {
    match &object.data {
        ObjectData::Thread(handle) => Some(handle),
        _ => None,
    }
}

/// Reports the outcome to the handle even if the thread unwinds.
struct Completion {
    owner: ObjRef,
    result: Option<RunResult<Value>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            Err(RunError::new(ExcType::SystemError, "thread panicked"))
        });
        if let Some(handle) = thread_handle(&self.owner) {
            handle.finish(result);
        }
    }
}

/// Starts the OS thread behind `owner`, a thread object. Returns the new
/// thread's identity.
pub(crate) fn spawn_thread(interp: &Interpreter, owner: &ObjRef) -> RunResult<u64> {
    let Some(handle) = thread_handle(owner) else {
        return Err(RunError::type_error(format!(
            "expected a thread, got '{}'",
            owner.type_name()
        )));
    };
    let ident = next_ident();
    let (target, args) = handle.begin(ident)?;
    let vm = interp.vm.create_proxy();
    let name = handle.name.clone();
    let mut completion = Completion {
        owner: owner.clone(),
        result: None,
    };

    let spawned = thread::Builder::new()
        .name(format!("protopy-{name}"))
        .stack_size(interp.vm.shared.settings.thread_stack_size)
        .spawn(move || {
            adopt_ident(ident);
            debug!("thread {name} ({ident}) started");
            let mut interp = Interpreter::new(vm);
            let result = match target {
                Value::None => Ok(Value::None),
                target => interp.call_value(&target, Args::new(args)),
            };
            if let Err(err) = &result {
                error!("Exception in thread {name}:\n{}", err.report().trim_end());
            }
            drop(interp);
            debug!("thread {name} ({ident}) finished");
            completion.result = Some(result);
        });

    match spawned {
        Ok(join) => {
            interp.vm.shared.track_thread(join);
            Ok(ident)
        }
        Err(err) => {
            let err = RunError::runtime_error(format!("can't start new thread: {err}"));
            handle.finish(Err(err.clone()));
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, CodeBuilder, Op, VM, VMCreateInfo};

    fn thread_object(interp: &Interpreter, target: Value, args: Vec<Value>) -> ObjRef {
        let handle = ThreadHandle::new(default_thread_name(), target, args);
        interp.vm.heap.allocate(ObjectData::Thread(handle))
    }

    #[test]
    fn idents_are_per_thread() {
        let here = current_thread_ident();
        assert_eq!(here, current_thread_ident());
        let there = thread::spawn(current_thread_ident).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn thread_runs_target_and_joins() {
        // def work(items, n): items.append(n * 2)
        let vm = VM::new(VMCreateInfo::default());
        let interp = Interpreter::new(vm.new_proxy());
        let mut b = CodeBuilder::new("work").args(&["items", "n"]);
        b.load_fast("items").load_attr("append");
        b.load_fast("n").load_const(2).binary(BinaryOp::Mul).call(1).op(Op::PopTop);
        b.load_none().return_value();
        let work = interp.make_function_from_code(b.build().unwrap());
        let items = interp.vm.heap.new_list(Vec::new());

        let owner = thread_object(&interp, work, vec![items.clone(), Value::Int(21)]);
        let handle = thread_handle(&owner).unwrap();
        let err = handle.join(None, interp.ident()).unwrap_err();
        assert_eq!(err.message(), "cannot join thread before it is started");

        spawn_thread(&interp, &owner).unwrap();
        assert_eq!(handle.join(None, interp.ident()), Ok(true));
        assert!(!handle.is_alive());
        assert_eq!(handle.status(), ThreadStatus::Finished);
        let list = items.as_object().unwrap().as_list().unwrap();
        assert_eq!(list.read().clone(), vec![Value::Int(42)]);

        let err = handle.join(None, interp.ident()).unwrap_err();
        assert_eq!(err.message(), "thread already joined");
        let err = spawn_thread(&interp, &owner).unwrap_err();
        assert_eq!(err.message(), "threads can only be started once");
        vm.join_threads().unwrap();
    }

    #[test]
    fn uncaught_errors_end_only_their_thread() {
        let vm = VM::new(VMCreateInfo::default());
        let interp = Interpreter::new(vm.new_proxy());
        let mut b = CodeBuilder::new("boom");
        b.load_const(1).load_const(0).binary(BinaryOp::TrueDiv).return_value();
        let boom = interp.make_function_from_code(b.build().unwrap());

        let owner = thread_object(&interp, boom, Vec::new());
        spawn_thread(&interp, &owner).unwrap();
        let handle = thread_handle(&owner).unwrap();
        assert_eq!(handle.join(Some(Duration::from_secs(10)), interp.ident()), Ok(true));
        let err = handle.error().unwrap();
        assert!(err.is_instance(ExcType::ZeroDivisionError));
        vm.join_threads().unwrap();
    }
}
