//! Trial-deletion cycle collector.
//!
//! Runs with the world stopped. For every tracked object the collector
//! subtracts the references held by other tracked objects from its
//! reference count; whatever is left over comes from outside the tracked
//! graph (frame stacks, native locals, untracked objects) and makes the
//! object a root. Everything unreachable from the roots is cyclic garbage:
//! its mutable contents are cleared and reference counting frees the rest.
use std::{collections::HashMap, mem, time::Instant};

use log::debug;

use crate::{
    Frame, GarbageCollectionStats, GeneratorState, HeapObject, HeapShared,
    IterState, ObjRef, ObjectData, Value, Visitable, Visitor, WeakRef,
};

type AddrIndex = HashMap<usize, usize, ahash::RandomState>;

/// References detached from garbage objects. Dropped once the world has
/// resumed.
#[derive(Debug, Default)]
pub(crate) struct Cleared {
    pub(crate) values: Vec<Value>,
    pub(crate) frames: Vec<Box<Frame>>,
}

#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) stats: GarbageCollectionStats,
    garbage: Vec<ObjRef>,
    cleared: Cleared,
}

struct Subtract<'a> {
    index: &'a AddrIndex,
    refs: &'a mut [isize],
}

impl Visitor for Subtract<'_> {
    #[inline]
    fn visit_object(&mut self, object: &ObjRef) {
        if let Some(&slot) = self.index.get(&object.addr()) {
            self.refs[slot] -= 1;
        }
    }
}

struct Marker<'a> {
    index: &'a AddrIndex,
    reachable: Vec<bool>,
    pending: Vec<usize>,
}

impl Marker<'_> {
    fn mark(&mut self, slot: usize) {
        if !self.reachable[slot] {
            self.reachable[slot] = true;
            self.pending.push(slot);
        }
    }
}

impl Visitor for Marker<'_> {
    #[inline]
    fn visit_object(&mut self, object: &ObjRef) {
        if let Some(&slot) = self.index.get(&object.addr()) {
            self.mark(slot);
        }
    }
}

pub(crate) fn collect_cycles(heap: &HeapShared, epoch: usize) -> Outcome {
    let start = Instant::now();

    let mut weak = mem::take(&mut heap.registry.lock().objects);
    heap.drain_nurseries(&mut weak);
    let objects: Vec<ObjRef> = weak.iter().filter_map(WeakRef::upgrade).collect();
    drop(weak);

    let index: AddrIndex = objects
        .iter()
        .enumerate()
        .map(|(slot, object)| (object.addr(), slot))
        .collect();

    // `objects` itself holds one reference to each
    let mut refs: Vec<isize> = objects
        .iter()
        .map(|object| object.refcount() as isize - 1)
        .collect();
    let mut subtract = Subtract {
        index: &index,
        refs: &mut refs,
    };
    for object in &objects {
        object.visit_edges(&mut subtract);
    }

    let mut marker = Marker {
        index: &index,
        reachable: vec![false; objects.len()],
        pending: Vec::new(),
    };
    for (slot, &count) in refs.iter().enumerate() {
        if count > 0 {
            marker.mark(slot);
        }
    }
    while let Some(slot) = marker.pending.pop() {
        objects[slot].visit_edges(&mut marker);
    }

    let tracked = objects.len();
    let mut survivors = Vec::with_capacity(tracked);
    let mut garbage = Vec::new();
    for (object, live) in objects.into_iter().zip(marker.reachable) {
        if live {
            survivors.push(object.downgrade());
        } else {
            garbage.push(object);
        }
    }
    heap.registry.lock().objects.extend(survivors);

    let mut cleared = Cleared::default();
    for object in &garbage {
        object.clear_refs(&mut cleared);
    }
    debug!("gc epoch {epoch}: {} unreachable objects", garbage.len());

    Outcome {
        stats: GarbageCollectionStats {
            epoch,
            tracked,
            collected: garbage.len(),
            duration: start.elapsed(),
        },
        garbage,
        cleared,
    }
}

impl HeapObject {
    /// Detaches every mutable reference this object holds. Immutable parts
    /// (tuple items, function globals, class bases) are left alone: any
    /// cycle through them also passes through a clearable container.
    pub(crate) fn clear_refs(&self, cleared: &mut Cleared) {
        let values = &mut cleared.values;
        match &self.data {
            ObjectData::List(items) => values.append(&mut items.write()),
            ObjectData::Dict(dict) => dict.write().drain_into(values),
            ObjectData::Set(set) => set.write().drain_into(values),
            ObjectData::Function(function) => {
                function.dict.write().drain_into(values);
            }
            ObjectData::Cell(cell) => values.extend(cell.write().take()),
            ObjectData::Class(class) => class.dict.write().drain_into(values),
            ObjectData::Instance(instance) => {
                instance.dict.write().drain_into(values);
            }
            ObjectData::Exception(exception) => {
                values.append(&mut exception.args.write());
                values.extend(exception.cause.write().take());
                values.extend(exception.context.write().take());
                exception.dict.write().drain_into(values);
            }
            ObjectData::Generator(generator) => {
                if let Some(frame) = generator.discard(GeneratorState::Closed) {
                    cleared.frames.push(frame);
                }
            }
            ObjectData::Iterator(state) => {
                let old = mem::replace(&mut *state.lock(), IterState::Exhausted);
                old.into_values(values);
            }
            ObjectData::Thread(thread) => thread.clear_refs(values),
            ObjectData::Tuple(_)
            | ObjectData::NativeFunction(_)
            | ObjectData::BoundMethod(_)
            | ObjectData::Module(_)
            | ObjectData::Range(_)
            | ObjectData::Slice(_)
            | ObjectData::Lock(_)
            | ObjectData::RLock(_)
            | ObjectData::Condition(_)
            | ObjectData::Event(_)
            | ObjectData::Semaphore(_) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dict, Heap, HeapCreateInfo};

    fn heap() -> Heap {
        Heap::new(HeapCreateInfo::default())
    }

    #[test]
    fn self_referencing_list_is_collected() {
        let heap = heap();
        let proxy = heap.create_proxy();
        let list = proxy.new_list(vec![]);
        let obj = list.as_object().unwrap().clone();
        obj.as_list().unwrap().write().push(list.clone());
        let weak = obj.downgrade();
        drop(obj);
        drop(list);
        assert!(!weak.is_dead());

        let stats = heap.collect().unwrap();
        assert_eq!(stats.collected, 1);
        assert!(weak.is_dead());
    }

    #[test]
    fn externally_referenced_cycle_survives() {
        let heap = heap();
        let proxy = heap.create_proxy();
        let a = proxy.new_dict(Dict::new());
        let b = proxy.new_dict(Dict::new());
        a.as_dict().unwrap().write().set_str("b", Value::Object(b.clone()));
        b.as_dict().unwrap().write().set_str("a", Value::Object(a.clone()));
        let weak_b = b.downgrade();
        drop(b);

        let stats = heap.collect().unwrap();
        assert_eq!(stats.collected, 0);
        assert!(!weak_b.is_dead());
        assert_eq!(a.as_dict().unwrap().read().len(), 1);

        drop(a);
        let stats = heap.collect().unwrap();
        assert_eq!(stats.collected, 2);
        assert!(weak_b.is_dead());
    }

    #[test]
    fn objects_reachable_from_a_root_survive() {
        let heap = heap();
        let proxy = heap.create_proxy();
        let leaf = proxy.new_list(vec![Value::Int(1)]);
        let root = proxy.new_list(vec![leaf.clone()]);
        let weak_leaf = leaf.as_object().unwrap().downgrade();
        drop(leaf);

        heap.collect().unwrap();
        assert!(!weak_leaf.is_dead());
        let root = root.as_object().unwrap();
        assert_eq!(root.as_list().unwrap().read().len(), 1);
    }

    #[test]
    fn collection_resets_the_allocation_count() {
        let heap = heap();
        let proxy = heap.create_proxy();
        let _list = proxy.new_list(vec![]);
        assert_eq!(heap.shared().allocations_since_collection(), 1);
        heap.collect().unwrap();
        assert_eq!(heap.shared().allocations_since_collection(), 0);
        assert_eq!(heap.shared().collections(), 1);
    }
}
