//! Calling convention: argument binding, frame setup and dispatch over the
//! callable kinds.
use log::trace;

use super::Interpreter;
use crate::{
    Args, CodeFlags, CodeObject, Dict, Frame, Function, Generator,
    GeneratorKind, HashKey, ObjRef, ObjectData, RunError, RunResult, Value,
    builtins::object_new,
};

/// What a call turned into: a finished native result, or a frame the
/// interpreter loop should run.
pub(crate) enum Prepared {
    Done(Value),
    Frame(Box<Frame>),
}

impl Interpreter {
    /// Calls any callable value and runs it to completion.
    pub fn call_value(&mut self, callable: &Value, args: Args) -> RunResult<Value> {
        match self.prepare_call(callable, args)? {
            Prepared::Done(value) => Ok(value),
            Prepared::Frame(frame) => self.run_frame(frame),
        }
    }

    pub(crate) fn prepare_call(
        &mut self,
        callable: &Value,
        mut args: Args,
    ) -> RunResult<Prepared> {
        let Value::Object(object) = callable else {
            return Err(not_callable(callable));
        };
        match &object.data {
            ObjectData::Function(function) => {
                let frame = self.function_frame(function, args, None)?;
                if !function.code.is_generator() {
                    return Ok(Prepared::Frame(frame));
                }
                let kind = if function.code.is_coroutine() {
                    GeneratorKind::Coroutine
                } else {
                    GeneratorKind::Generator
                };
                trace!("created {} {}", kind.name(), function.name);
                let generator = Generator::new(kind, function.name.clone(), frame);
                let object = self.vm.heap.allocate(ObjectData::Generator(generator));
                Ok(Prepared::Done(Value::Object(object)))
            }
            ObjectData::NativeFunction(native) => {
                Ok(Prepared::Done((native.func)(self, args)?))
            }
            ObjectData::BoundMethod(method) => {
                args.prepend(method.receiver.clone());
                let function = method.function.clone();
                self.prepare_call(&function, args)
            }
            ObjectData::Class(_) => {
                Ok(Prepared::Done(self.instantiate(object, args)?))
            }
            ObjectData::Instance(_) => match self.lookup_method(callable, "__call__")? {
                Some(method) => self.prepare_call(&method, args),
                None => Err(not_callable(callable)),
            },
            _ => Err(not_callable(callable)),
        }
    }

    /// Creates an instance through the nearest native constructor, then
    /// runs a user-defined `__init__`.
    fn instantiate(&mut self, class: &ObjRef, args: Args) -> RunResult<Value> {
        let Some(info) = class.as_class() else {
            return Err(not_callable(&Value::Object(class.clone())));
        };
        let constructor = info.find_constructor().unwrap_or(object_new);
        let instance = constructor(self, class, args.clone())?;

        let Some(init) = info.lookup("__init__") else {
            return Ok(instance);
        };
        let is_function = init.as_object().is_some_and(|o| o.as_function().is_some());
        if !is_function || !self.is_instance_of(&instance, class) {
            return Ok(instance);
        }
        let mut args = args;
        args.prepend(instance.clone());
        let result = self.call_value(&init, args)?;
        if !result.is_none() {
            return Err(RunError::type_error(format!(
                "__init__() should return None, not '{}'",
                result.type_name()
            )));
        }
        Ok(instance)
    }

    fn is_instance_of(&self, value: &Value, class: &ObjRef) -> bool {
        crate::is_subclass(&crate::types::class_of(value), class)
    }

    /// Frame for a call of `function` with `args` bound to its parameters.
    pub(crate) fn function_frame(
        &self,
        function: &Function,
        args: Args,
        names: Option<ObjRef>,
    ) -> RunResult<Box<Frame>> {
        let mut frame = Frame::new(
            function.code.clone(),
            function.globals.clone(),
            self.builtins(),
            Box::new([]),
            names,
        );
        self.bind_arguments(function, args, &mut frame.locals)?;
        frame.cells = self.make_cells(&function.code, &frame.locals, &function.closure);
        Ok(frame)
    }

    fn make_cells(
        &self,
        code: &CodeObject,
        locals: &[Option<Value>],
        closure: &[ObjRef],
    ) -> Box<[ObjRef]> {
        let parameters = &code.varnames[..code.total_args().min(code.varnames.len())];
        code.cellvars
            .iter()
            .map(|name| {
                // parameters captured by inner functions start out bound
                let initial = parameters
                    .iter()
                    .position(|param| param == name)
                    .and_then(|slot| locals[slot].clone());
                self.vm.heap.new_cell(initial)
            })
            .chain(closure.iter().cloned())
            .collect()
    }

    fn bind_arguments(
        &self,
        function: &Function,
        args: Args,
        locals: &mut [Option<Value>],
    ) -> RunResult<()> {
        let code = &function.code;
        let name = &code.name;
        let Args {
            mut positional,
            keywords,
        } = args;
        let argc = code.arg_count;
        let named = argc + code.kwonly_count;
        let has_varargs = code.flags.contains(CodeFlags::VARARGS);
        let has_varkw = code.flags.contains(CodeFlags::VARKEYWORDS);

        if positional.len() > argc {
            if !has_varargs {
                return Err(too_many_positional(code, function, positional.len()));
            }
            let extra = positional.split_off(argc);
            locals[named] = Some(self.vm.heap.new_tuple(extra));
        } else if has_varargs {
            locals[named] = Some(self.vm.heap.new_tuple(Vec::new()));
        }
        let given = positional.len();
        for (slot, value) in positional.into_iter().enumerate() {
            locals[slot] = Some(value);
        }

        let mut extra = Dict::new();
        let mut positional_only = Vec::new();
        for (key, value) in keywords {
            let slot = code.varnames[..named].iter().position(|param| *param == key);
            match slot {
                Some(slot) if slot < code.posonly_count => {
                    if has_varkw {
                        extra.insert(HashKey::Str(key.clone()), Value::Str(key), value);
                    } else {
                        positional_only.push(key);
                    }
                }
                Some(slot) => {
                    if locals[slot].is_some() {
                        return Err(RunError::type_error(format!(
                            "{name}() got multiple values for argument '{key}'"
                        )));
                    }
                    locals[slot] = Some(value);
                }
                None if has_varkw => {
                    extra.insert(HashKey::Str(key.clone()), Value::Str(key), value);
                }
                None => {
                    return Err(RunError::type_error(format!(
                        "{name}() got an unexpected keyword argument '{key}'"
                    )));
                }
            }
        }
        if !positional_only.is_empty() {
            let names: Vec<String> =
                positional_only.iter().map(|key| format!("'{key}'")).collect();
            return Err(RunError::type_error(format!(
                "{name}() got some positional-only arguments passed as keyword arguments: {}",
                names.join(", ")
            )));
        }
        if has_varkw {
            let slot = named + usize::from(has_varargs);
            locals[slot] = Some(Value::Object(self.vm.heap.new_dict(extra)));
        }

        let defaults = &function.defaults;
        let first_default = argc.saturating_sub(defaults.len());
        let mut missing = Vec::new();
        for slot in given..argc {
            if locals[slot].is_some() {
                continue;
            }
            if slot >= first_default {
                locals[slot] = Some(defaults[slot - first_default].clone());
            } else {
                missing.push(code.varnames[slot].clone());
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(name, "positional", &missing));
        }

        for slot in argc..named {
            if locals[slot].is_some() {
                continue;
            }
            let param = &code.varnames[slot];
            match function.kw_defaults.iter().find(|(key, _)| key == param) {
                Some((_, value)) => locals[slot] = Some(value.clone()),
                None => missing.push(param.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(name, "keyword-only", &missing));
        }
        Ok(())
    }
}

fn not_callable(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not callable", value.type_name()))
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

fn too_many_positional(code: &CodeObject, function: &Function, given: usize) -> RunError {
    let argc = code.arg_count;
    let required = argc.saturating_sub(function.defaults.len());
    let takes = if required == argc {
        format!("{argc} positional argument{}", plural(argc))
    } else {
        format!("from {required} to {argc} positional arguments")
    };
    let were = if given == 1 { "was" } else { "were" };
    RunError::type_error(format!(
        "{}() takes {takes} but {given} {were} given",
        code.name
    ))
}

/// "'a'", "'a' and 'b'", "'a', 'b', and 'c'"
fn format_names(names: &[std::sync::Arc<str>]) -> String {
    let quoted: Vec<String> = names.iter().map(|name| format!("'{name}'")).collect();
    match quoted.as_slice() {
        [] => String::new(),
        [one] => one.clone(),
        [first, second] => format!("{first} and {second}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

fn missing_arguments(name: &str, kind: &str, missing: &[std::sync::Arc<str>]) -> RunError {
    RunError::type_error(format!(
        "{name}() missing {} required {kind} argument{}: {}",
        missing.len(),
        plural(missing.len()),
        format_names(missing)
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{CodeBuilder, ExcType, Op, VM, VMCreateInfo};

    fn interpreter() -> Interpreter {
        Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy())
    }

    fn kw(name: &str, value: i64) -> (Arc<str>, Value) {
        (Arc::from(name), Value::Int(value))
    }

    /// def f(a, b=2, *, c): return a + b + c
    fn f(interp: &Interpreter) -> Value {
        let mut b = CodeBuilder::new("f")
            .args(&["a", "b"])
            .kwonly(&["c"])
            .defaults(vec![Value::Int(2)]);
        b.load_fast("a").load_fast("b").binary(crate::BinaryOp::Add);
        b.load_fast("c").binary(crate::BinaryOp::Add).return_value();
        interp.make_function_from_code(b.build().unwrap())
    }

    fn message(result: RunResult<Value>) -> String {
        let err = result.unwrap_err();
        assert!(err.is_instance(ExcType::TypeError), "{err}");
        err.message()
    }

    #[test]
    fn binds_defaults_and_keywords() {
        let mut interp = interpreter();
        let f = f(&interp);
        let args = Args::with_keywords(vec![Value::Int(1)], vec![kw("c", 10)]);
        assert_eq!(interp.call_value(&f, args), Ok(Value::Int(13)));
        let args = Args::with_keywords(vec![], vec![kw("c", 1), kw("b", 1), kw("a", 1)]);
        assert_eq!(interp.call_value(&f, args), Ok(Value::Int(3)));
    }

    #[test]
    fn binding_errors() {
        let mut interp = interpreter();
        let f = f(&interp);
        let one = || Value::Int(1);

        let args = Args::with_keywords(vec![one(), one(), one()], vec![kw("c", 1)]);
        assert_eq!(
            message(interp.call_value(&f, args)),
            "f() takes from 1 to 2 positional arguments but 3 were given"
        );
        let args = Args::with_keywords(vec![one()], vec![kw("a", 1), kw("c", 1)]);
        assert_eq!(
            message(interp.call_value(&f, args)),
            "f() got multiple values for argument 'a'"
        );
        let args = Args::with_keywords(vec![one()], vec![kw("d", 1)]);
        assert_eq!(
            message(interp.call_value(&f, args)),
            "f() got an unexpected keyword argument 'd'"
        );
        let args = Args::with_keywords(vec![], vec![kw("c", 1)]);
        assert_eq!(
            message(interp.call_value(&f, args)),
            "f() missing 1 required positional argument: 'a'"
        );
        let args = Args::new(vec![one()]);
        assert_eq!(
            message(interp.call_value(&f, args)),
            "f() missing 1 required keyword-only argument: 'c'"
        );
    }

    #[test]
    fn positional_only_parameters() {
        // def g(x, y, /): ...
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("g").args(&["x", "y"]).posonly(2);
        b.load_fast("x").return_value();
        let g = interp.make_function_from_code(b.build().unwrap());
        let args = Args::with_keywords(vec![], vec![kw("x", 1), kw("y", 2)]);
        assert_eq!(
            message(interp.call_value(&g, args)),
            "g() got some positional-only arguments passed as keyword arguments: 'x', 'y'"
        );
        assert_eq!(
            message(interp.call_value(&g, Args::default())),
            "g() missing 2 required positional arguments: 'x' and 'y'"
        );
    }

    #[test]
    fn collectors_gather_the_rest() {
        // def h(a, *args, **kwargs): return (a, args, kwargs)
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("h")
            .args(&["a"])
            .varargs("args")
            .varkeywords("kwargs");
        b.load_fast("a").load_fast("args").load_fast("kwargs");
        b.emit(Op::BuildTuple, 3).return_value();
        let h = interp.make_function_from_code(b.build().unwrap());
        let args = Args::with_keywords(
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            vec![kw("z", 9)],
        );
        let result = interp.call_value(&h, args).unwrap();
        let items = result.as_object().unwrap().as_tuple().unwrap().to_vec();
        assert_eq!(items[0], Value::Int(1));
        assert_eq!(items[1].as_object().unwrap().as_tuple().unwrap().len(), 2);
        let kwargs = items[2].as_object().unwrap().as_dict().unwrap();
        assert_eq!(kwargs.read().get_str("z"), Some(&Value::Int(9)));
    }

    #[test]
    fn calling_a_non_callable() {
        let mut interp = interpreter();
        assert_eq!(
            message(interp.call_value(&Value::Int(3), Args::default())),
            "'int' object is not callable"
        );
    }

    #[test]
    fn coroutine_functions_return_coroutines() {
        let mut interp = interpreter();
        let mut b = CodeBuilder::new("co").coroutine();
        b.load_const(5).return_value();
        let co = interp.make_function_from_code(b.build().unwrap());
        let value = interp.call_value(&co, Args::default()).unwrap();
        assert_eq!(value.type_name(), "coroutine");
        let result = interp.gen_send(value.as_object().unwrap(), Value::None);
        assert_eq!(result, Ok(crate::GenResult::Return(Value::Int(5))));
    }
}
