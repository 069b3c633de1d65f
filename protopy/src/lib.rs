pub mod assembler;
mod args;
mod builder;
mod builtins;
mod code;
mod collector;
mod exceptions;
mod frame;
mod generator;
mod heap;
mod interpreter;
mod iterator;
mod methods;
mod modules;
mod numeric;
mod object;
mod safepoint;
mod scheduler;
mod sync;
mod threads;
mod trace;
mod types;
mod value;
mod visitor;
mod vm;

pub use args::Args;
pub use assembler::{AssembleError, assemble, assemble_file};
pub use builder::{CodeBuilder, Label};
pub use code::*;
pub use exceptions::*;
pub use frame::{Block, Frame};
pub use generator::{GenResult, Generator, GeneratorKind, GeneratorState, stop_value};
pub use heap::{
    DEFAULT_GC_THRESHOLD, GarbageCollectionStats, Heap, HeapCreateInfo, HeapProxy,
    HeapSettings, HeapShared,
};
pub use interpreter::{FrameExit, Interpreter, IterStep, Resume};
pub use iterator::{Advance, IterState};
pub use object::*;
pub use safepoint::{Safepoint, WorldStopped};
pub use scheduler::{Job, JobHandle, Scheduler, WorkerId};
pub use sync::*;
pub use threads::{ThreadHandle, ThreadStatus, current_thread_ident, default_thread_name};
pub use trace::{GC_TRACE_ENV, GcTrace};
pub use types::{
    BuiltinTypes, NativeMethod, builtin_types, class_of, exc_class, named_classes,
};
pub use value::{HashKey, Value, format_float};
pub use visitor::{Visitable, Visitor};
pub use vm::*;
