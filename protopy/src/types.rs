//! Registry of the built-in classes.
//!
//! Built-in classes are process wide, immortal and never tracked by the
//! collector. Their dicts hold the native methods, so attribute lookup on
//! built-in values goes through the same MRO walk as user classes.
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::{
    Class, ConstructorFn, Dict, ExcType, GeneratorKind, Instance, NativeFn,
    NativeFunction, ObjRef, ObjectData, Value, builtins, methods,
};

/// Entry of a native method table.
#[derive(Debug, Clone, Copy)]
pub struct NativeMethod {
    pub name: &'static str,
    pub func: NativeFn,
}

impl NativeMethod {
    pub const fn new(name: &'static str, func: NativeFn) -> Self {
        Self { name, func }
    }

    pub fn to_object(self) -> ObjRef {
        ObjRef::immortal(ObjectData::NativeFunction(NativeFunction {
            name: self.name,
            func: self.func,
        }))
    }
}

#[derive(Debug)]
pub struct BuiltinTypes {
    pub object: ObjRef,
    pub type_: ObjRef,
    pub none_type: ObjRef,
    pub int: ObjRef,
    pub bool_: ObjRef,
    pub float: ObjRef,
    pub str_: ObjRef,
    pub bytes: ObjRef,
    pub code: ObjRef,
    pub list: ObjRef,
    pub tuple: ObjRef,
    pub dict: ObjRef,
    pub set: ObjRef,
    pub function: ObjRef,
    pub builtin_function: ObjRef,
    pub method: ObjRef,
    pub cell: ObjRef,
    pub module: ObjRef,
    pub generator: ObjRef,
    pub coroutine: ObjRef,
    pub iterator: ObjRef,
    pub range: ObjRef,
    pub slice: ObjRef,
    pub lock: ObjRef,
    pub rlock: ObjRef,
    pub condition: ObjRef,
    pub event: ObjRef,
    pub semaphore: ObjRef,
    pub bounded_semaphore: ObjRef,
    pub thread: ObjRef,
    pub not_implemented: ObjRef,
    exceptions: Box<[ObjRef]>,
}

static BUILTIN_TYPES: OnceLock<BuiltinTypes> = OnceLock::new();

#[inline]
pub fn builtin_types() -> &'static BuiltinTypes {
    BUILTIN_TYPES.get_or_init(BuiltinTypes::new)
}

#[inline]
pub fn exc_class(kind: ExcType) -> &'static ObjRef {
    &builtin_types().exceptions[kind as usize]
}

struct ClassSpec<'a> {
    name: &'static str,
    bases: &'a [&'a ObjRef],
    methods: &'a [NativeMethod],
    constructor: Option<ConstructorFn>,
    subclassable: bool,
}

fn builtin_class(spec: ClassSpec<'_>) -> ObjRef {
    let mut dict = Dict::new();
    for method in spec.methods {
        dict.set_str(method.name, Value::Object(method.to_object()));
    }
    let bases = spec.bases.iter().map(|&base| base.clone()).collect();
    let mut class = Class::new(Arc::from(spec.name), bases, dict);
    class.constructor = spec.constructor;
    class.builtin = true;
    class.subclassable = spec.subclassable;
    ObjRef::immortal(ObjectData::Class(class))
}

fn final_class(
    name: &'static str,
    object: &ObjRef,
    methods: &[NativeMethod],
    constructor: Option<ConstructorFn>,
) -> ObjRef {
    builtin_class(ClassSpec {
        name,
        bases: &[object],
        methods,
        constructor,
        subclassable: false,
    })
}

impl BuiltinTypes {
    fn new() -> Self {
        let object = builtin_class(ClassSpec {
            name: "object",
            bases: &[],
            methods: &[],
            constructor: Some(builtins::object_new),
            subclassable: true,
        });
        let class = |name: &'static str,
                     methods: &[NativeMethod],
                     constructor: Option<ConstructorFn>| {
            final_class(name, &object, methods, constructor)
        };

        let int = class("int", &[], Some(builtins::int_new));
        let bool_ = builtin_class(ClassSpec {
            name: "bool",
            bases: &[&int],
            methods: &[],
            constructor: Some(builtins::bool_new),
            subclassable: false,
        });
        let semaphore = class(
            "Semaphore",
            methods::SEMAPHORE_METHODS,
            Some(builtins::semaphore_new),
        );
        let bounded_semaphore = builtin_class(ClassSpec {
            name: "BoundedSemaphore",
            bases: &[&semaphore],
            methods: &[],
            constructor: Some(builtins::bounded_semaphore_new),
            subclassable: false,
        });

        let mut exceptions: Vec<ObjRef> = Vec::with_capacity(ExcType::ALL.len());
        for kind in ExcType::ALL {
            let parent = kind
                .parent()
                .map_or(&object, |parent| &exceptions[parent as usize]);
            let methods: &[NativeMethod] = if *kind == ExcType::BaseException {
                methods::EXCEPTION_METHODS
            } else {
                &[]
            };
            let constructor = (*kind == ExcType::BaseException)
                .then_some(builtins::exception_new as ConstructorFn);
            let exception = builtin_class(ClassSpec {
                name: kind.name(),
                bases: &[parent],
                methods,
                constructor,
                subclassable: true,
            });
            exceptions.push(exception);
        }

        let not_implemented_type = class("NotImplementedType", &[], None);
        let not_implemented =
            ObjRef::immortal(ObjectData::Instance(Instance {
                class: not_implemented_type,
                dict: RwLock::new(Dict::new()),
            }));

        Self {
            type_: class("type", &[], Some(builtins::type_new)),
            none_type: class("NoneType", &[], None),
            float: class("float", &[], Some(builtins::float_new)),
            str_: class("str", methods::STR_METHODS, Some(builtins::str_new)),
            bytes: class(
                "bytes",
                methods::BYTES_METHODS,
                Some(builtins::bytes_new),
            ),
            code: class("code", &[], None),
            list: class(
                "list",
                methods::LIST_METHODS,
                Some(builtins::list_new),
            ),
            tuple: class(
                "tuple",
                methods::TUPLE_METHODS,
                Some(builtins::tuple_new),
            ),
            dict: class(
                "dict",
                methods::DICT_METHODS,
                Some(builtins::dict_new),
            ),
            set: class("set", methods::SET_METHODS, Some(builtins::set_new)),
            function: class("function", &[], None),
            builtin_function: class("builtin_function_or_method", &[], None),
            method: class("method", &[], None),
            cell: class("cell", &[], None),
            module: class("module", &[], None),
            generator: class("generator", methods::GENERATOR_METHODS, None),
            coroutine: class("coroutine", methods::COROUTINE_METHODS, None),
            iterator: class("iterator", methods::ITERATOR_METHODS, None),
            range: class("range", &[], Some(builtins::range_new)),
            slice: class("slice", &[], Some(builtins::slice_new)),
            lock: class(
                "lock",
                methods::LOCK_METHODS,
                Some(builtins::lock_new),
            ),
            rlock: class(
                "RLock",
                methods::RLOCK_METHODS,
                Some(builtins::rlock_new),
            ),
            condition: class(
                "Condition",
                methods::CONDITION_METHODS,
                Some(builtins::condition_new),
            ),
            event: class(
                "Event",
                methods::EVENT_METHODS,
                Some(builtins::event_new),
            ),
            thread: class(
                "Thread",
                methods::THREAD_METHODS,
                Some(builtins::thread_new),
            ),
            semaphore,
            bounded_semaphore,
            int,
            bool_,
            not_implemented,
            exceptions: exceptions.into_boxed_slice(),
            object,
        }
    }
}

/// The class of any value.
pub fn class_of(value: &Value) -> ObjRef {
    let types = builtin_types();
    match value {
        Value::None => types.none_type.clone(),
        Value::Bool(_) => types.bool_.clone(),
        Value::Int(_) | Value::BigInt(_) => types.int.clone(),
        Value::Float(_) => types.float.clone(),
        Value::Str(_) => types.str_.clone(),
        Value::Bytes(_) => types.bytes.clone(),
        Value::Code(_) => types.code.clone(),
        Value::Object(obj) => match &obj.data {
            ObjectData::List(_) => types.list.clone(),
            ObjectData::Tuple(_) => types.tuple.clone(),
            ObjectData::Dict(_) => types.dict.clone(),
            ObjectData::Set(_) => types.set.clone(),
            ObjectData::Function(_) => types.function.clone(),
            ObjectData::NativeFunction(_) => types.builtin_function.clone(),
            ObjectData::BoundMethod(_) => types.method.clone(),
            ObjectData::Cell(_) => types.cell.clone(),
            ObjectData::Class(_) => types.type_.clone(),
            ObjectData::Instance(instance) => instance.class.clone(),
            ObjectData::Module(_) => types.module.clone(),
            ObjectData::Exception(exception) => exception.class.clone(),
            ObjectData::Generator(generator) => match generator.kind {
                GeneratorKind::Generator => types.generator.clone(),
                GeneratorKind::Coroutine => types.coroutine.clone(),
            },
            ObjectData::Iterator(_) => types.iterator.clone(),
            ObjectData::Range(_) => types.range.clone(),
            ObjectData::Slice(_) => types.slice.clone(),
            ObjectData::Lock(_) => types.lock.clone(),
            ObjectData::RLock(_) => types.rlock.clone(),
            ObjectData::Condition(_) => types.condition.clone(),
            ObjectData::Event(_) => types.event.clone(),
            ObjectData::Semaphore(semaphore) => {
                if semaphore.is_bounded() {
                    types.bounded_semaphore.clone()
                } else {
                    types.semaphore.clone()
                }
            }
            ObjectData::Thread(_) => types.thread.clone(),
        },
    }
}

/// Built-in classes visible by name in the builtins namespace.
pub fn named_classes() -> Vec<&'static ObjRef> {
    let types = builtin_types();
    let mut classes = vec![
        &types.object,
        &types.type_,
        &types.int,
        &types.bool_,
        &types.float,
        &types.str_,
        &types.bytes,
        &types.list,
        &types.tuple,
        &types.dict,
        &types.set,
        &types.range,
        &types.slice,
    ];
    classes.extend(types.exceptions.iter());
    classes
}
