use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, Ordering},
    },
};

use bitflags::bitflags;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    Args, CodeObject, ConditionObject, Event, ExceptionObject, Generator,
    HashKey, Interpreter, IterState, Lock, RLock, RunResult, Semaphore,
    ThreadHandle, Value,
};

pub type NativeFn = fn(&mut Interpreter, Args) -> RunResult<Value>;
/// Constructor of a built-in class, called with the class being instantiated.
pub type ConstructorFn = fn(&mut Interpreter, &ObjRef, Args) -> RunResult<Value>;

pub type KeyMap<V> = IndexMap<HashKey, V, ahash::RandomState>;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    List,
    Tuple,
    Dict,
    Set,
    Function,
    NativeFunction,
    BoundMethod,
    Cell,
    Class,
    Instance,
    Module,
    Exception,
    Generator,
    Iterator,
    Range,
    Slice,
    Lock,
    RLock,
    Condition,
    Event,
    Semaphore,
    Thread,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::List => "list",
            ObjectKind::Tuple => "tuple",
            ObjectKind::Dict => "dict",
            ObjectKind::Set => "set",
            ObjectKind::Function => "function",
            ObjectKind::NativeFunction => "builtin_function_or_method",
            ObjectKind::BoundMethod => "method",
            ObjectKind::Cell => "cell",
            ObjectKind::Class => "type",
            ObjectKind::Instance => "object",
            ObjectKind::Module => "module",
            ObjectKind::Exception => "BaseException",
            ObjectKind::Generator => "generator",
            ObjectKind::Iterator => "iterator",
            ObjectKind::Range => "range",
            ObjectKind::Slice => "slice",
            ObjectKind::Lock => "lock",
            ObjectKind::RLock => "RLock",
            ObjectKind::Condition => "Condition",
            ObjectKind::Event => "Event",
            ObjectKind::Semaphore => "Semaphore",
            ObjectKind::Thread => "Thread",
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct GcFlags: u8 {
        /// Registered with the cycle collector.
        const TRACKED = 1 << 0;
        /// Lives for the whole process (built-in classes and functions).
        const IMMORTAL = 1 << 1;
    }
}

#[derive(Debug)]
pub struct Header {
    kind: ObjectKind,
    flags: AtomicU8,
}

impl Header {
    #[must_use]
    pub fn new(kind: ObjectKind, flags: GcFlags) -> Self {
        Self {
            kind,
            flags: AtomicU8::new(flags.bits()),
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> GcFlags {
        GcFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn insert_flags(&self, flags: GcFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct HeapObject {
    pub header: Header,
    pub data: ObjectData,
}

#[derive(Debug)]
pub enum ObjectData {
    List(RwLock<Vec<Value>>),
    Tuple(Box<[Value]>),
    Dict(RwLock<Dict>),
    Set(RwLock<Set>),
    Function(Function),
    NativeFunction(NativeFunction),
    BoundMethod(BoundMethod),
    Cell(RwLock<Option<Value>>),
    Class(Class),
    Instance(Instance),
    Module(Module),
    Exception(ExceptionObject),
    Generator(Generator),
    Iterator(Mutex<IterState>),
    Range(Range),
    Slice(Slice),
    Lock(Lock),
    RLock(RLock),
    Condition(ConditionObject),
    Event(Event),
    Semaphore(Semaphore),
    Thread(ThreadHandle),
}

impl ObjectData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectData::List(_) => ObjectKind::List,
            ObjectData::Tuple(_) => ObjectKind::Tuple,
            ObjectData::Dict(_) => ObjectKind::Dict,
            ObjectData::Set(_) => ObjectKind::Set,
            ObjectData::Function(_) => ObjectKind::Function,
            ObjectData::NativeFunction(_) => ObjectKind::NativeFunction,
            ObjectData::BoundMethod(_) => ObjectKind::BoundMethod,
            ObjectData::Cell(_) => ObjectKind::Cell,
            ObjectData::Class(_) => ObjectKind::Class,
            ObjectData::Instance(_) => ObjectKind::Instance,
            ObjectData::Module(_) => ObjectKind::Module,
            ObjectData::Exception(_) => ObjectKind::Exception,
            ObjectData::Generator(_) => ObjectKind::Generator,
            ObjectData::Iterator(_) => ObjectKind::Iterator,
            ObjectData::Range(_) => ObjectKind::Range,
            ObjectData::Slice(_) => ObjectKind::Slice,
            ObjectData::Lock(_) => ObjectKind::Lock,
            ObjectData::RLock(_) => ObjectKind::RLock,
            ObjectData::Condition(_) => ObjectKind::Condition,
            ObjectData::Event(_) => ObjectKind::Event,
            ObjectData::Semaphore(_) => ObjectKind::Semaphore,
            ObjectData::Thread(_) => ObjectKind::Thread,
        }
    }

    /// Objects that can hold references to other heap objects are handed to
    /// the cycle collector. Leaves and sync handles are left to refcounting.
    pub fn is_container(&self) -> bool {
        !matches!(
            self,
            ObjectData::NativeFunction(_)
                | ObjectData::Range(_)
                | ObjectData::Lock(_)
                | ObjectData::RLock(_)
                | ObjectData::Event(_)
                | ObjectData::Semaphore(_)
        )
    }
}

impl HeapObject {
    #[must_use]
    pub fn new(data: ObjectData) -> Self {
        Self {
            header: Header::new(data.kind(), GcFlags::empty()),
            data,
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.header.kind()
    }

    pub fn as_list(&self) -> Option<&RwLock<Vec<Value>>> {
        match &self.data {
            ObjectData::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match &self.data {
            ObjectData::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&RwLock<Dict>> {
        match &self.data {
            ObjectData::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&RwLock<Set>> {
        match &self.data {
            ObjectData::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Class> {
        match &self.data {
            ObjectData::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match &self.data {
            ObjectData::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &self.data {
            ObjectData::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match &self.data {
            ObjectData::Module(module) => Some(module),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&ExceptionObject> {
        match &self.data {
            ObjectData::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    pub fn as_generator(&self) -> Option<&Generator> {
        match &self.data {
            ObjectData::Generator(generator) => Some(generator),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&RwLock<Option<Value>>> {
        match &self.data {
            ObjectData::Cell(cell) => Some(cell),
            _ => None,
        }
    }
}

/// Counted reference to a heap object. The `Arc` strong count is the
/// object's reference count.
#[derive(Clone)]
pub struct ObjRef(Arc<HeapObject>);

#[derive(Clone)]
pub struct WeakRef(Weak<HeapObject>);

impl ObjRef {
    /// Allocates an object the collector does not know about. Only for
    /// objects that cannot form cycles or live for the whole process; the
    /// interpreter allocates through `HeapProxy`.
    #[must_use]
    pub fn untracked(data: ObjectData) -> Self {
        Self(Arc::new(HeapObject::new(data)))
    }

    #[must_use]
    pub fn immortal(data: ObjectData) -> Self {
        let object = HeapObject::new(data);
        object.header.insert_flags(GcFlags::IMMORTAL);
        Self(Arc::new(object))
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> WeakRef {
        WeakRef(Arc::downgrade(&self.0))
    }

    pub fn type_name(&self) -> String {
        match &self.data {
            ObjectData::Instance(instance) => class_name(&instance.class),
            ObjectData::Exception(exception) => class_name(&exception.class),
            ObjectData::Generator(generator) => generator.kind.name().into(),
            _ => self.kind().name().into(),
        }
    }
}

fn class_name(class: &ObjRef) -> String {
    class
        .as_class()
        .map_or_else(|| "object".into(), |class| class.name.to_string())
}

impl Deref for ObjRef {
    type Target = HeapObject;

    #[inline]
    fn deref(&self) -> &HeapObject {
        &self.0
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} at {:#x}>", self.type_name(), self.addr())
    }
}

impl WeakRef {
    pub fn upgrade(&self) -> Option<ObjRef> {
        self.0.upgrade().map(ObjRef)
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakRef({:p})", self.0.as_ptr())
    }
}

/// Insertion ordered mapping. Every entry keeps the original key value
/// next to its hash projection.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: KeyMap<(Value, Value)>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.get(&HashKey::Str(Arc::from(name)))
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces; an existing entry keeps its original key.
    pub fn insert(
        &mut self,
        key: HashKey,
        original: Value,
        value: Value,
    ) -> Option<Value> {
        if let Some(slot) = self.entries.get_mut(&key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.insert(key, (original, value));
        None
    }

    pub fn set_str(&mut self, name: &str, value: Value) -> Option<Value> {
        let name: Arc<str> = Arc::from(name);
        self.insert(HashKey::Str(name.clone()), Value::Str(name), value)
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<(Value, Value)> {
        self.entries.shift_remove(key)
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.entries.pop().map(|(_, entry)| entry)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(key, value)| (key, value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Moves every key and value into `sink`, leaving the dict empty.
    pub fn drain_into(&mut self, sink: &mut Vec<Value>) {
        for (_, (key, value)) in self.entries.drain(..) {
            sink.push(key);
            sink.push(value);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Set {
    entries: KeyMap<Value>,
}

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns false when an equal element was already present.
    pub fn insert(&mut self, key: HashKey, value: Value) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.entries.pop().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HashKey, &Value)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn drain_into(&mut self, sink: &mut Vec<Value>) {
        sink.extend(self.entries.drain(..).map(|(_, value)| value));
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: Arc<str>,
    pub code: Arc<CodeObject>,
    pub globals: ObjRef,
    pub defaults: Box<[Value]>,
    pub kw_defaults: Box<[(Arc<str>, Value)]>,
    /// One cell per free variable of `code`.
    pub closure: Box<[ObjRef]>,
    pub dict: RwLock<Dict>,
}

#[derive(Debug)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Receiver pre-bound to a callable; calling it prepends the receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub function: Value,
}

#[derive(Debug)]
pub struct Class {
    pub name: Arc<str>,
    pub bases: Box<[ObjRef]>,
    /// Method resolution order without the class itself.
    pub mro: Box<[ObjRef]>,
    pub dict: RwLock<Dict>,
    pub constructor: Option<ConstructorFn>,
    /// Built-in classes reject attribute assignment.
    pub builtin: bool,
    pub subclassable: bool,
}

impl Class {
    #[must_use]
    pub fn new(name: Arc<str>, bases: Vec<ObjRef>, dict: Dict) -> Self {
        let mro = linearize(&bases).into_boxed_slice();
        Self {
            name,
            bases: bases.into_boxed_slice(),
            mro,
            dict: RwLock::new(dict),
            constructor: None,
            builtin: false,
            subclassable: true,
        }
    }

    /// Looks `name` up in the class dict, then along the MRO.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let key = HashKey::Str(Arc::from(name));
        if let Some(value) = self.dict.read().get(&key) {
            return Some(value.clone());
        }
        self.mro.iter().find_map(|base| {
            base.as_class()
                .and_then(|class| class.dict.read().get(&key).cloned())
        })
    }

    pub fn find_constructor(&self) -> Option<ConstructorFn> {
        self.constructor.or_else(|| {
            self.mro
                .iter()
                .find_map(|base| base.as_class().and_then(|c| c.constructor))
        })
    }
}

/// `true` when `class` is `other` or derives from it.
pub fn is_subclass(class: &ObjRef, other: &ObjRef) -> bool {
    if class.ptr_eq(other) {
        return true;
    }
    class
        .as_class()
        .is_some_and(|c| c.mro.iter().any(|base| base.ptr_eq(other)))
}

/// Depth first over the bases, keeping the last occurrence of each class.
/// Matches C3 for the diamond shapes interpreted code builds.
fn linearize(bases: &[ObjRef]) -> Vec<ObjRef> {
    let mut seq = Vec::new();
    for base in bases {
        seq.push(base.clone());
        if let Some(class) = base.as_class() {
            seq.extend(class.mro.iter().cloned());
        }
    }
    seq.iter()
        .enumerate()
        .filter(|(i, class)| !seq[i + 1..].iter().any(|o| o.ptr_eq(class)))
        .map(|(_, class)| class.clone())
        .collect()
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub dict: RwLock<Dict>,
}

#[derive(Debug)]
pub struct Module {
    pub name: Arc<str>,
    pub globals: ObjRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let len = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / -step
        } else {
            0
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i64::try_from(index).ok()?.checked_mul(self.step)?;
        self.start.checked_add(offset)
    }
}

#[derive(Debug)]
pub struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}
