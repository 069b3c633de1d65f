use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    Dict, ExceptionObject, GcFlags, GcTrace, ObjRef, ObjectData, Safepoint,
    Set, Value, collector,
};

pub const DEFAULT_GC_THRESHOLD: usize = 10_000;
pub const DEFAULT_NURSERY_FLUSH: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct HeapCreateInfo {
    /// Tracked allocations between automatic collections.
    pub gc_threshold: Option<usize>,
    pub trace_path: Option<PathBuf>,
    /// Per-thread buffer size before new objects are published to the
    /// shared registry.
    pub nursery_flush: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub gc_threshold: usize,
    pub nursery_flush: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            nursery_flush: DEFAULT_NURSERY_FLUSH,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub epoch: usize,
    pub tracked: usize,
    pub collected: usize,
    pub duration: Duration,
}

type Nursery = Mutex<Vec<crate::WeakRef>>;

#[derive(Debug)]
pub(crate) struct Registry {
    pub(crate) objects: Vec<crate::WeakRef>,
    prune_at: usize,
}

impl Registry {
    fn absorb(&mut self, nursery: &mut Vec<crate::WeakRef>) {
        self.objects.append(nursery);
        if self.objects.len() >= self.prune_at {
            self.objects.retain(|object| !object.is_dead());
            self.prune_at = (self.objects.len() * 2).max(1024);
        }
    }
}

#[derive(Debug)]
pub struct Heap {
    inner: Arc<HeapShared>,
}

#[derive(Debug)]
pub struct HeapShared {
    pub settings: HeapSettings,
    pub safepoint: Safepoint,
    pub(crate) registry: Mutex<Registry>,
    nurseries: Mutex<Vec<Weak<Nursery>>>,
    allocated: AtomicUsize,
    enabled: AtomicBool,
    epoch: AtomicUsize,
    last: Mutex<GarbageCollectionStats>,
    trace: Option<GcTrace>,
}

/// Per-thread allocation handle. New container objects go to a private
/// nursery first and are published to the shared registry in batches.
#[derive(Debug)]
pub struct HeapProxy {
    heap: Arc<HeapShared>,
    nursery: Arc<Nursery>,
}

impl Heap {
    #[must_use]
    pub fn new(info: HeapCreateInfo) -> Self {
        let mut settings = HeapSettings::default();
        info.gc_threshold
            .inspect(|&val| settings.gc_threshold = val.max(1));
        info.nursery_flush
            .inspect(|&val| settings.nursery_flush = val.max(1));

        let trace = info.trace_path.and_then(|path| {
            GcTrace::open(&path)
                .inspect_err(|err| {
                    warn!("cannot open gc trace {}: {err}", path.display());
                })
                .ok()
        });

        Self {
            inner: Arc::new(HeapShared {
                settings,
                safepoint: Safepoint::new(),
                registry: Mutex::new(Registry {
                    objects: Vec::new(),
                    prune_at: 1024,
                }),
                nurseries: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                enabled: AtomicBool::new(true),
                epoch: AtomicUsize::new(0),
                last: Mutex::new(GarbageCollectionStats::default()),
                trace,
            }),
        }
    }

    pub fn create_proxy(&self) -> HeapProxy {
        HeapProxy::new(self.inner.clone())
    }

    #[inline]
    pub fn shared(&self) -> &Arc<HeapShared> {
        &self.inner
    }

    /// Collects from a thread that is not running interpreted code.
    pub fn collect(&self) -> Option<GarbageCollectionStats> {
        self.inner.collect(false)
    }
}

impl HeapShared {
    /// Runs a full cycle collection. `caller_managed` tells whether the
    /// calling thread is itself inside the interpreter.
    pub fn collect(
        &self,
        caller_managed: bool,
    ) -> Option<GarbageCollectionStats> {
        let stopped = self.safepoint.stop_the_world(caller_managed)?;
        let epoch = self.epoch.load(Ordering::Relaxed);
        if let Some(trace) = &self.trace {
            trace.collection_started(epoch);
        }

        let outcome = collector::collect_cycles(self, epoch);
        self.allocated.store(0, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = outcome.stats;
        drop(stopped);

        // cleared contents are released after the world resumes
        let stats = outcome.stats;
        drop(outcome);

        info!(
            "gc epoch {}: {} tracked, {} collected in {:?}",
            stats.epoch, stats.tracked, stats.collected, stats.duration
        );
        if let Some(trace) = &self.trace {
            trace.collection_finished(&stats);
        }
        Some(stats)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        debug!("gc {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// True once enough tracked objects were allocated since the last
    /// collection.
    #[inline]
    pub fn collection_due(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) >= self.settings.gc_threshold
            && self.is_enabled()
    }

    pub fn allocations_since_collection(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn collections(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn last_stats(&self) -> GarbageCollectionStats {
        *self.last.lock()
    }

    /// Moves every nursery into the registry. World must be stopped.
    pub(crate) fn drain_nurseries(&self, into: &mut Vec<crate::WeakRef>) {
        let mut nurseries = self.nurseries.lock();
        nurseries.retain(|nursery| {
            let Some(nursery) = nursery.upgrade() else {
                return false;
            };
            into.append(&mut nursery.lock());
            true
        });
    }
}

impl HeapProxy {
    fn new(heap: Arc<HeapShared>) -> Self {
        let nursery = Arc::new(Mutex::new(Vec::new()));
        heap.nurseries.lock().push(Arc::downgrade(&nursery));
        Self { heap, nursery }
    }

    pub fn create_proxy(&self) -> HeapProxy {
        HeapProxy::new(self.heap.clone())
    }

    #[inline]
    pub fn shared(&self) -> &Arc<HeapShared> {
        &self.heap
    }

    pub fn allocate(&self, data: ObjectData) -> ObjRef {
        let tracked = data.is_container();
        let object = ObjRef::untracked(data);
        if tracked {
            object.header.insert_flags(GcFlags::TRACKED);
            let mut nursery = self.nursery.lock();
            nursery.push(object.downgrade());
            if nursery.len() >= self.heap.settings.nursery_flush {
                self.heap.registry.lock().absorb(&mut nursery);
            }
            self.heap.allocated.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(trace) = &self.heap.trace {
            trace.allocation(object.kind(), object.addr());
        }
        object
    }

    pub fn new_list(&self, items: Vec<Value>) -> Value {
        Value::Object(self.allocate(ObjectData::List(RwLock::new(items))))
    }

    pub fn new_tuple(&self, items: Vec<Value>) -> Value {
        Value::Object(
            self.allocate(ObjectData::Tuple(items.into_boxed_slice())),
        )
    }

    pub fn new_dict(&self, dict: Dict) -> ObjRef {
        self.allocate(ObjectData::Dict(RwLock::new(dict)))
    }

    pub fn new_set(&self, set: Set) -> Value {
        Value::Object(self.allocate(ObjectData::Set(RwLock::new(set))))
    }

    pub fn new_cell(&self, value: Option<Value>) -> ObjRef {
        self.allocate(ObjectData::Cell(RwLock::new(value)))
    }

    pub fn new_exception(&self, class: ObjRef, args: Vec<Value>) -> ObjRef {
        self.allocate(ObjectData::Exception(ExceptionObject::new(class, args)))
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        let mut nursery = self.nursery.lock();
        if !nursery.is_empty() {
            self.heap.registry.lock().absorb(&mut nursery);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_are_tracked_leaves_are_not() {
        let heap = Heap::new(HeapCreateInfo::default());
        let proxy = heap.create_proxy();

        let list = proxy.new_list(vec![]);
        let list = list.as_object().unwrap();
        assert!(list.header.flags().contains(GcFlags::TRACKED));

        let lock = proxy.allocate(ObjectData::Lock(crate::Lock::new()));
        assert!(!lock.header.flags().contains(GcFlags::TRACKED));
        assert_eq!(heap.shared().allocations_since_collection(), 1);
    }

    #[test]
    fn threshold_marks_a_collection_due() {
        let heap = Heap::new(HeapCreateInfo {
            gc_threshold: Some(3),
            ..Default::default()
        });
        let proxy = heap.create_proxy();
        let _keep: Vec<Value> = (0..3).map(|_| proxy.new_list(vec![])).collect();
        assert!(heap.shared().collection_due());

        heap.shared().set_enabled(false);
        assert!(!heap.shared().collection_due());
    }

    #[test]
    fn dropped_proxies_publish_their_nursery() {
        let heap = Heap::new(HeapCreateInfo::default());
        let proxy = heap.create_proxy();
        let list = proxy.new_list(vec![]);
        drop(proxy);
        assert_eq!(heap.shared().registry.lock().objects.len(), 1);
        drop(list);
    }
}
