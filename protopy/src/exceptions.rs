use std::{
    fmt,
    fmt::Write,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    CodeObject, Dict, ObjRef, Value, Visitable, Visitor, exc_class,
    is_subclass,
};

/// Built-in exception classes. Declared parents first; `ExcType::ALL`
/// relies on that order when the classes are created.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcType {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    AssertionError,
    AttributeError,
    LookupError,
    IndexError,
    KeyError,
    NameError,
    UnboundLocalError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    StopIteration,
    StopAsyncIteration,
    GeneratorExit,
    KeyboardInterrupt,
    SystemExit,
    TypeError,
    ValueError,
    ImportError,
    ModuleNotFoundError,
    OSError,
    TimeoutError,
    SystemError,
}

impl ExcType {
    pub const ALL: &'static [ExcType] = &[
        ExcType::BaseException,
        ExcType::Exception,
        ExcType::ArithmeticError,
        ExcType::ZeroDivisionError,
        ExcType::OverflowError,
        ExcType::AssertionError,
        ExcType::AttributeError,
        ExcType::LookupError,
        ExcType::IndexError,
        ExcType::KeyError,
        ExcType::NameError,
        ExcType::UnboundLocalError,
        ExcType::RuntimeError,
        ExcType::RecursionError,
        ExcType::NotImplementedError,
        ExcType::StopIteration,
        ExcType::StopAsyncIteration,
        ExcType::GeneratorExit,
        ExcType::KeyboardInterrupt,
        ExcType::SystemExit,
        ExcType::TypeError,
        ExcType::ValueError,
        ExcType::ImportError,
        ExcType::ModuleNotFoundError,
        ExcType::OSError,
        ExcType::TimeoutError,
        ExcType::SystemError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExcType::BaseException => "BaseException",
            ExcType::Exception => "Exception",
            ExcType::ArithmeticError => "ArithmeticError",
            ExcType::ZeroDivisionError => "ZeroDivisionError",
            ExcType::OverflowError => "OverflowError",
            ExcType::AssertionError => "AssertionError",
            ExcType::AttributeError => "AttributeError",
            ExcType::LookupError => "LookupError",
            ExcType::IndexError => "IndexError",
            ExcType::KeyError => "KeyError",
            ExcType::NameError => "NameError",
            ExcType::UnboundLocalError => "UnboundLocalError",
            ExcType::RuntimeError => "RuntimeError",
            ExcType::RecursionError => "RecursionError",
            ExcType::NotImplementedError => "NotImplementedError",
            ExcType::StopIteration => "StopIteration",
            ExcType::StopAsyncIteration => "StopAsyncIteration",
            ExcType::GeneratorExit => "GeneratorExit",
            ExcType::KeyboardInterrupt => "KeyboardInterrupt",
            ExcType::SystemExit => "SystemExit",
            ExcType::TypeError => "TypeError",
            ExcType::ValueError => "ValueError",
            ExcType::ImportError => "ImportError",
            ExcType::ModuleNotFoundError => "ModuleNotFoundError",
            ExcType::OSError => "OSError",
            ExcType::TimeoutError => "TimeoutError",
            ExcType::SystemError => "SystemError",
        }
    }

    pub fn parent(self) -> Option<ExcType> {
        Some(match self {
            ExcType::BaseException => return None,
            ExcType::Exception
            | ExcType::GeneratorExit
            | ExcType::KeyboardInterrupt
            | ExcType::SystemExit => ExcType::BaseException,
            ExcType::ZeroDivisionError | ExcType::OverflowError => {
                ExcType::ArithmeticError
            }
            ExcType::IndexError | ExcType::KeyError => ExcType::LookupError,
            ExcType::UnboundLocalError => ExcType::NameError,
            ExcType::RecursionError | ExcType::NotImplementedError => {
                ExcType::RuntimeError
            }
            ExcType::ModuleNotFoundError => ExcType::ImportError,
            ExcType::TimeoutError => ExcType::OSError,
            _ => ExcType::Exception,
        })
    }

    pub fn is_subclass_of(self, other: ExcType) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One unwound frame: which code object, at which instruction offset.
#[derive(Debug, Clone)]
pub struct TracebackEntry {
    pub code: Arc<CodeObject>,
    pub offset: usize,
}

#[derive(Debug)]
pub struct ExceptionObject {
    pub class: ObjRef,
    pub args: RwLock<Vec<Value>>,
    pub cause: RwLock<Option<Value>>,
    pub context: RwLock<Option<Value>>,
    pub suppress_context: AtomicBool,
    pub traceback: Mutex<Vec<TracebackEntry>>,
    pub dict: RwLock<Dict>,
}

impl ExceptionObject {
    #[must_use]
    pub fn new(class: ObjRef, args: Vec<Value>) -> Self {
        Self {
            class,
            args: RwLock::new(args),
            cause: RwLock::new(None),
            context: RwLock::new(None),
            suppress_context: AtomicBool::new(false),
            traceback: Mutex::new(Vec::new()),
            dict: RwLock::new(Dict::new()),
        }
    }

    pub fn push_traceback(&self, code: Arc<CodeObject>, offset: usize) {
        self.traceback.lock().push(TracebackEntry { code, offset });
    }

    pub fn class_name(&self) -> String {
        self.class
            .as_class()
            .map_or_else(|| "BaseException".into(), |c| c.name.to_string())
    }

    /// Message without calling back into interpreted code.
    pub fn plain_message(&self) -> String {
        let args = self.args.read();
        match args.as_slice() {
            [] => String::new(),
            [Value::Str(s)] => s.to_string(),
            [single] => format!("{single:?}"),
            many => format!("{many:?}"),
        }
    }

    /// First argument, or None. `StopIteration.value` reads this.
    pub fn first_arg(&self) -> Value {
        self.args.read().first().cloned().unwrap_or(Value::None)
    }
}

/// An exception in flight. Native code raises `Pending` errors without
/// touching the heap; the interpreter materializes them into exception
/// objects when they start unwinding interpreted frames.
#[derive(Debug, Clone)]
pub enum RunError {
    Pending { kind: ExcType, message: String },
    Raised(ObjRef),
}

pub type RunResult<T> = Result<T, RunError>;

impl RunError {
    #[must_use]
    pub fn new(kind: ExcType, message: impl Into<String>) -> Self {
        RunError::Pending {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::RuntimeError, message)
    }

    pub fn is_instance(&self, kind: ExcType) -> bool {
        match self {
            RunError::Pending { kind: own, .. } => own.is_subclass_of(kind),
            RunError::Raised(exception) => {
                exception.as_exception().is_some_and(|e| {
                    is_subclass(&e.class, exc_class(kind))
                })
            }
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            RunError::Pending { kind, .. } => kind.name().into(),
            RunError::Raised(exception) => exception.type_name(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            RunError::Pending { message, .. } => message.clone(),
            RunError::Raised(exception) => exception
                .as_exception()
                .map(ExceptionObject::plain_message)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            f.write_str(&self.type_name())
        } else {
            write!(f, "{}: {message}", self.type_name())
        }
    }
}

impl std::error::Error for RunError {}

impl PartialEq for RunError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                RunError::Pending { kind, message },
                RunError::Pending { kind: k, message: m },
            ) => kind == k && message == m,
            (RunError::Raised(a), RunError::Raised(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl RunError {
    /// Report printed for an uncaught error: the traceback when the error
    /// went through interpreted frames, the bare message otherwise.
    pub fn report(&self) -> String {
        match self {
            RunError::Pending { .. } => format!("{self}\n"),
            RunError::Raised(exception) => format_exception(exception),
        }
    }
}

impl Visitable for ExceptionObject {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        visitor.visit_object(&self.class);
        self.args.read().iter().for_each(|v| visitor.visit(v));
        if let Some(cause) = &*self.cause.read() {
            visitor.visit(cause);
        }
        if let Some(context) = &*self.context.read() {
            visitor.visit(context);
        }
        self.dict.read().values().for_each(|v| visitor.visit(v));
    }
}

/// Formats an exception with its traceback, preceded by its cause or
/// context chain.
pub fn format_exception(exception: &ObjRef) -> String {
    let mut out = String::new();
    write_chain(&mut out, exception, &mut Vec::new());
    out
}

fn write_chain(out: &mut String, exception: &ObjRef, seen: &mut Vec<usize>) {
    if seen.contains(&exception.addr()) {
        return;
    }
    seen.push(exception.addr());
    let Some(exc) = exception.as_exception() else {
        return;
    };

    let cause = exc.cause.read().clone();
    let context = exc.context.read().clone();
    if let Some(Value::Object(cause)) = cause {
        write_chain(out, &cause, seen);
        out.push_str(
            "\nThe above exception was the direct cause of the following exception:\n\n",
        );
    } else if let Some(Value::Object(context)) = context
        && !exc.suppress_context.load(Ordering::Relaxed)
    {
        write_chain(out, &context, seen);
        out.push_str(
            "\nDuring handling of the above exception, another exception occurred:\n\n",
        );
    }

    let traceback = exc.traceback.lock().clone();
    if !traceback.is_empty() {
        out.push_str("Traceback (most recent call last):\n");
        for entry in traceback.iter().rev() {
            let _ = writeln!(
                out,
                "  File \"{}\", instruction {}, in {}",
                entry.code.filename, entry.offset, entry.code.name
            );
        }
    }
    let message = exc.plain_message();
    if message.is_empty() {
        let _ = writeln!(out, "{}", exc.class_name());
    } else {
        let _ = writeln!(out, "{}: {message}", exc.class_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy() {
        assert!(ExcType::RecursionError.is_subclass_of(ExcType::RuntimeError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::GeneratorExit.is_subclass_of(ExcType::BaseException));
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
    }

    #[test]
    fn all_lists_parents_first() {
        for (index, kind) in ExcType::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, index);
            if let Some(parent) = kind.parent() {
                assert!((parent as usize) < index, "{kind} before {parent}");
            }
        }
    }

    #[test]
    fn pending_errors_display_like_tracebacks() {
        let err = RunError::new(ExcType::ValueError, "bad value");
        assert_eq!(err.to_string(), "ValueError: bad value");
        assert!(err.is_instance(ExcType::Exception));
        assert!(!err.is_instance(ExcType::TypeError));
    }

    #[test]
    fn raised_errors_check_the_class_hierarchy() {
        let exc = ObjRef::untracked(crate::ObjectData::Exception(
            ExceptionObject::new(
                exc_class(ExcType::KeyError).clone(),
                vec![Value::str("k")],
            ),
        ));
        let err = RunError::Raised(exc);
        assert!(err.is_instance(ExcType::LookupError));
        assert_eq!(err.to_string(), "KeyError: k");
    }
}
