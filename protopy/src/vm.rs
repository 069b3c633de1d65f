use std::{
    collections::HashMap,
    env, io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{
    CodeObject, GC_TRACE_ENV, Heap, HeapCreateInfo, HeapProxy, Interpreter,
    ObjRef, RunError, builtins,
};

pub const DEFAULT_RECURSION_LIMIT: usize = 1000;
pub const DEFAULT_THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

pub const RECURSION_LIMIT_ENV: &str = "PROTOPY_RECURSION_LIMIT";
pub const GC_THRESHOLD_ENV: &str = "PROTOPY_GC_THRESHOLD";

#[derive(Debug, Error)]
pub enum VmError {
    /// An exception escaped the main module. Holds the formatted report.
    #[error("{0}")]
    Uncaught(String),
    #[error("thread {0} panicked")]
    ThreadPanicked(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<RunError> for VmError {
    fn from(err: RunError) -> Self {
        VmError::Uncaught(err.report())
    }
}

#[derive(Debug, Default, Clone)]
pub struct VMCreateInfo {
    pub heap: HeapCreateInfo,
    pub recursion_limit: Option<usize>,
    pub thread_stack_size: Option<usize>,
}

impl VMCreateInfo {
    /// Defaults overridden by the `PROTOPY_*` environment variables.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut info = Self::default();
        info.recursion_limit = env_number(RECURSION_LIMIT_ENV);
        info.heap.gc_threshold = env_number(GC_THRESHOLD_ENV);
        info.heap.trace_path = env::var_os(GC_TRACE_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        info
    }
}

fn env_number(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    raw.trim()
        .parse()
        .inspect_err(|err| warn!("ignoring {name}={raw}: {err}"))
        .ok()
}

#[derive(Debug, Clone)]
pub struct VMSettings {
    pub thread_stack_size: usize,
}

#[derive(Debug)]
pub struct VMShared {
    pub heap: Heap,
    pub settings: VMSettings,
    pub builtins: ObjRef,
    recursion_limit: AtomicUsize,
    modules: RwLock<HashMap<Arc<str>, ObjRef, ahash::RandomState>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
pub struct VM {
    inner: Arc<VMShared>,
}

/// Per-thread view of the VM: the shared state plus a private heap proxy.
#[derive(Debug)]
pub struct VMProxy {
    pub shared: Arc<VMShared>,
    pub heap: HeapProxy,
}

impl VM {
    pub fn new(info: VMCreateInfo) -> Self {
        let heap = Heap::new(info.heap);
        let builtins = builtins::create_builtins(&heap.create_proxy());
        let recursion_limit = info
            .recursion_limit
            .unwrap_or(DEFAULT_RECURSION_LIMIT)
            .max(1);

        let inner = VMShared {
            heap,
            settings: VMSettings {
                thread_stack_size: info
                    .thread_stack_size
                    .unwrap_or(DEFAULT_THREAD_STACK_SIZE),
            },
            builtins,
            recursion_limit: AtomicUsize::new(recursion_limit),
            modules: RwLock::new(HashMap::default()),
            threads: Mutex::new(Vec::new()),
        };
        debug!("vm created, recursion limit {recursion_limit}");

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn new_proxy(&self) -> VMProxy {
        VMProxy {
            shared: self.inner.clone(),
            heap: self.inner.heap.create_proxy(),
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<VMShared> {
        &self.inner
    }

    /// Runs `code` as `__main__` on the calling thread, then waits for
    /// every thread it started.
    pub fn run_main(&self, code: Arc<CodeObject>) -> Result<ObjRef, VmError> {
        let mut interp = Interpreter::new(self.new_proxy());
        let result = interp.run_module("__main__", code);
        drop(interp);
        self.join_threads()?;
        Ok(result?)
    }

    /// Joins every OS thread started by interpreted code, including
    /// threads started while waiting.
    pub fn join_threads(&self) -> Result<(), VmError> {
        let mut panicked = None;
        loop {
            let Some(handle) = self.inner.threads.lock().pop() else {
                break;
            };
            let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
            if handle.join().is_err() {
                panicked.get_or_insert(name);
            }
        }
        match panicked {
            Some(name) => Err(VmError::ThreadPanicked(name)),
            None => Ok(()),
        }
    }
}

impl VMShared {
    #[inline]
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit.load(Ordering::Relaxed)
    }

    pub fn set_recursion_limit(&self, limit: usize) {
        debug!("recursion limit set to {limit}");
        self.recursion_limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn module(&self, name: &str) -> Option<ObjRef> {
        self.modules.read().get(name).cloned()
    }

    /// Registers `module` unless another thread got there first; returns
    /// whichever module ended up registered.
    pub fn register_module(&self, name: &str, module: ObjRef) -> ObjRef {
        self.modules
            .write()
            .entry(Arc::from(name))
            .or_insert(module)
            .clone()
    }

    pub(crate) fn track_thread(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.retain(|thread| !thread.is_finished());
        threads.push(handle);
    }
}

impl VMProxy {
    /// Proxy for a thread that only holds the shared state.
    pub fn attach(shared: &Arc<VMShared>) -> Self {
        Self {
            shared: shared.clone(),
            heap: shared.heap.create_proxy(),
        }
    }

    pub fn create_proxy(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            heap: self.heap.create_proxy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, CodeBuilder, Value};

    #[test]
    fn create_info_overrides_defaults() {
        let vm = VM::new(VMCreateInfo {
            recursion_limit: Some(77),
            ..Default::default()
        });
        assert_eq!(vm.shared().recursion_limit(), 77);
        assert_eq!(
            vm.shared().settings.thread_stack_size,
            DEFAULT_THREAD_STACK_SIZE
        );

        let vm = VM::new(VMCreateInfo::default());
        assert_eq!(vm.shared().recursion_limit(), DEFAULT_RECURSION_LIMIT);
        vm.shared().set_recursion_limit(0);
        assert_eq!(vm.shared().recursion_limit(), 1);
    }

    #[test]
    fn run_main_registers_the_module() {
        let vm = VM::new(VMCreateInfo::default());
        let mut b = CodeBuilder::new("<module>");
        b.load_const(6).load_const(7).binary(BinaryOp::Mul).store_name("x");
        b.load_none().return_value();
        let module = vm.run_main(b.build().unwrap()).unwrap();

        assert!(vm.shared().module("__main__").unwrap().ptr_eq(&module));
        let globals = &module.as_module().unwrap().globals;
        let x = globals.as_dict().unwrap().read().get_str("x").cloned();
        assert_eq!(x, Some(Value::Int(42)));
    }

    #[test]
    fn uncaught_main_errors_carry_the_report() {
        let vm = VM::new(VMCreateInfo::default());
        let mut b = CodeBuilder::new("<module>");
        b.load_name("missing").return_value();
        let err = vm.run_main(b.build().unwrap()).unwrap_err();
        let VmError::Uncaught(report) = err else {
            panic!("expected an uncaught error, got {err:?}");
        };
        assert!(report.starts_with("Traceback (most recent call last):\n"));
        assert!(report.ends_with("NameError: name 'missing' is not defined\n"));
    }

    #[test]
    fn first_registration_wins() {
        let vm = VM::new(VMCreateInfo::default());
        let proxy = vm.new_proxy();
        let a = proxy.heap.new_dict(crate::Dict::new());
        let b = proxy.heap.new_dict(crate::Dict::new());
        assert!(vm.shared().register_module("m", a.clone()).ptr_eq(&a));
        assert!(vm.shared().register_module("m", b).ptr_eq(&a));
    }
}
