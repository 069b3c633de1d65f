//! Worker pool running interpreted jobs on N OS threads.
//!
//! Each worker owns an [`Interpreter`] for its whole life and pulls jobs
//! from its own queue, stealing from the others when it runs dry. All
//! workers share the VM's heap; there is no global lock around execution.
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    Args, CodeObject, ExcType, Interpreter, RunError, RunResult, VMProxy,
    VMShared, Value, VmError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// A unit of work for the pool.
#[derive(Debug)]
pub enum Job {
    /// Calls `callable` with positional `args`.
    Call { callable: Value, args: Vec<Value> },
    /// Runs `code` as the body of module `name`; yields the module.
    Module { name: Arc<str>, code: Arc<CodeObject> },
}

/// Completion slot of a submitted job.
#[derive(Debug, Default)]
pub struct JobHandle {
    result: Mutex<Option<RunResult<Value>>>,
    done: Condvar,
}

impl JobHandle {
    fn complete(&self, result: RunResult<Value>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.done.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Blocks until the job finished.
    pub fn wait(&self) -> RunResult<Value> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut slot);
        }
    }

    /// Like [`JobHandle::wait`]; `None` if `timeout` elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunResult<Value>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();
        while slot.is_none() {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

struct WorkItem {
    job: Job,
    handle: Arc<JobHandle>,
}

/// Completes the handle even if the job unwinds.
struct Completion {
    handle: Arc<JobHandle>,
    result: Option<RunResult<Value>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            Err(RunError::new(ExcType::SystemError, "worker panicked"))
        });
        self.handle.complete(result);
    }
}

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<WorkItem>>,
    has_work: Condvar,
    should_stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, item: WorkItem) {
        self.local.lock().push_back(item);
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        self.local.lock().pop_front()
    }

    fn steal_back(&self) -> Option<WorkItem> {
        self.local.lock().pop_back()
    }

    fn backlog(&self) -> usize {
        self.local.lock().len()
    }
}

/// Fixed pool of interpreter workers.
pub struct Scheduler {
    vm: Arc<VMShared>,
    workers: Vec<Arc<Worker>>,
    stopped: AtomicBool,
    completed: AtomicUsize,
}

impl Scheduler {
    /// Starts `workers` OS threads (at least one).
    pub fn new(vm: &Arc<VMShared>, workers: usize) -> io::Result<Arc<Self>> {
        let scheduler = Arc::new(Self {
            vm: vm.clone(),
            workers: (0..workers.max(1)).map(|id| Worker::new(WorkerId(id))).collect(),
            stopped: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        });
        for worker in &scheduler.workers {
            let me = Arc::clone(&scheduler);
            let mine = Arc::clone(worker);
            let spawned = thread::Builder::new()
                .name(format!("protopy-worker-{}", worker.id.0))
                .stack_size(vm.settings.thread_stack_size)
                .spawn(move || me.worker_loop(mine));
            match spawned {
                Ok(join) => *worker.handle.lock() = Some(join),
                Err(err) => {
                    // workers already started hold the scheduler alive
                    let _ = scheduler.shutdown();
                    return Err(err);
                }
            }
        }
        debug!("scheduler started with {} workers", scheduler.workers.len());
        Ok(scheduler)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs finished since the pool started.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Queues `job` on the least loaded worker.
    pub fn submit(&self, job: Job) -> Arc<JobHandle> {
        let handle = Arc::new(JobHandle::default());
        if self.stopped.load(Ordering::Acquire) {
            handle.complete(Err(RunError::runtime_error(
                "cannot schedule new jobs after shutdown",
            )));
            return handle;
        }
        let item = WorkItem {
            job,
            handle: handle.clone(),
        };
        self.pick_worker().push(item);
        handle
    }

    fn pick_worker(&self) -> &Arc<Worker> {
        self.workers
            .iter()
            .min_by_key(|worker| worker.backlog())
            .unwrap_or(&self.workers[0])
    }

    /// Stops accepting jobs, lets the workers drain their queues and joins
    /// them.
    pub fn shutdown(&self) -> Result<(), VmError> {
        self.stopped.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.should_stop.store(true, Ordering::Release);
            worker.has_work.notify_all();
        }
        let mut panicked = None;
        for worker in &self.workers {
            let Some(join) = worker.handle.lock().take() else {
                continue;
            };
            if join.join().is_err() {
                panicked.get_or_insert(format!("protopy-worker-{}", worker.id.0));
            }
        }
        debug!("scheduler stopped after {} jobs", self.completed());
        match panicked {
            Some(name) => Err(VmError::ThreadPanicked(name)),
            None => Ok(()),
        }
    }

    fn worker_loop(self: Arc<Self>, me: Arc<Worker>) {
        let mut interp = Interpreter::new(VMProxy::attach(&self.vm));
        loop {
            if let Some(item) = me.pop().or_else(|| self.try_steal(&me)) {
                self.run(&mut interp, item);
                continue;
            }
            // queues are drained before a stop takes effect
            if me.should_stop.load(Ordering::Acquire) {
                break;
            }
            let mut guard = me.local.lock();
            if guard.is_empty() {
                let _ = me.has_work.wait_for(&mut guard, Duration::from_millis(10));
            }
        }
        debug!("worker {} exiting", me.id.0);
    }

    fn try_steal(&self, me: &Worker) -> Option<WorkItem> {
        self.workers
            .iter()
            .filter(|worker| worker.id != me.id)
            .find_map(|worker| worker.steal_back())
    }

    fn run(&self, interp: &mut Interpreter, item: WorkItem) {
        let mut completion = Completion {
            handle: item.handle,
            result: None,
        };
        let result = match item.job {
            Job::Call { callable, args } => interp.call_value(&callable, Args::new(args)),
            Job::Module { name, code } => {
                interp.run_module(&name, code).map(Value::Object)
            }
        };
        if let Err(err) = &result {
            warn!("job failed: {err}");
        }
        completion.result = Some(result);
        drop(completion);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, CodeBuilder, NativeMethod, VM, VMCreateInfo};

    fn thread_name(_interp: &mut Interpreter, _args: Args) -> RunResult<Value> {
        thread::sleep(Duration::from_millis(5));
        Ok(Value::str(thread::current().name().unwrap_or("<unnamed>")))
    }

    fn square(vm: &VM) -> Value {
        let interp = Interpreter::new(vm.new_proxy());
        let mut b = CodeBuilder::new("square").args(&["n"]);
        b.load_fast("n").load_fast("n").binary(BinaryOp::Mul).return_value();
        interp.make_function_from_code(b.build().unwrap())
    }

    #[test]
    fn call_jobs_return_their_results() {
        let vm = VM::new(VMCreateInfo::default());
        let scheduler = Scheduler::new(vm.shared(), 3).unwrap();
        let square = square(&vm);
        let handles: Vec<_> = (0..16)
            .map(|n| {
                scheduler.submit(Job::Call {
                    callable: square.clone(),
                    args: vec![Value::Int(n)],
                })
            })
            .collect();
        for (n, handle) in handles.iter().enumerate() {
            let n = n as i64;
            assert_eq!(handle.wait(), Ok(Value::Int(n * n)));
        }
        scheduler.shutdown().unwrap();
        assert_eq!(scheduler.completed(), 16);
    }

    #[test]
    fn module_jobs_register_the_module() {
        let vm = VM::new(VMCreateInfo::default());
        let scheduler = Scheduler::new(vm.shared(), 1).unwrap();
        let mut b = CodeBuilder::new("<module>");
        b.load_const(7).store_name("answer").load_none().return_value();
        let handle = scheduler.submit(Job::Module {
            name: Arc::from("jobs"),
            code: b.build().unwrap(),
        });
        let module = handle.wait().unwrap();
        assert!(vm.shared().module("jobs").unwrap().ptr_eq(module.as_object().unwrap()));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn failures_reach_the_handle() {
        let vm = VM::new(VMCreateInfo::default());
        let scheduler = Scheduler::new(vm.shared(), 2).unwrap();
        let handle = scheduler.submit(Job::Call {
            callable: square(&vm),
            args: vec![Value::str("x")],
        });
        let err = handle.wait().unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
        scheduler.shutdown().unwrap();

        let late = scheduler.submit(Job::Call {
            callable: Value::None,
            args: Vec::new(),
        });
        assert!(late.is_done());
        assert!(late.wait().is_err());
    }

    #[test]
    fn idle_workers_steal_queued_jobs() {
        let vm = VM::new(VMCreateInfo::default());
        let scheduler = Scheduler::new(vm.shared(), 2).unwrap();
        let probe = Value::Object(NativeMethod::new("thread_name", thread_name).to_object());

        // everything lands on the first worker's queue
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let handle = Arc::new(JobHandle::default());
                scheduler.workers[0].push(WorkItem {
                    job: Job::Call {
                        callable: probe.clone(),
                        args: Vec::new(),
                    },
                    handle: handle.clone(),
                });
                handle
            })
            .collect();

        let mut names: Vec<String> = handles
            .iter()
            .map(|handle| match handle.wait() {
                Ok(Value::Str(name)) => name.to_string(),
                other => panic!("unexpected result {other:?}"),
            })
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names, vec!["protopy-worker-0", "protopy-worker-1"]);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let vm = VM::new(VMCreateInfo::default());
        let scheduler = Scheduler::new(vm.shared(), 2).unwrap();
        let square = square(&vm);
        let handles: Vec<_> = (0..50)
            .map(|n| {
                scheduler.submit(Job::Call {
                    callable: square.clone(),
                    args: vec![Value::Int(n)],
                })
            })
            .collect();
        scheduler.shutdown().unwrap();
        assert!(handles.iter().all(|handle| handle.is_done()));
        assert!(handles[0].wait_timeout(Duration::from_millis(1)).is_some());
    }
}
