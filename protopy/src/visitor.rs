use crate::{Block, Frame, HeapObject, ObjRef, ObjectData, Value};

/// Receives the outgoing references of heap objects.
pub trait Visitor {
    fn visit_object(&mut self, object: &ObjRef);

    #[inline]
    fn visit(&mut self, value: &Value) {
        if let Value::Object(object) = value {
            self.visit_object(object);
        }
    }
}

/// Anything that owns strong references to heap objects.
///
/// Implementations must report every owned reference exactly once and
/// nothing they do not own: the collector subtracts one per reported edge.
pub trait Visitable {
    fn visit_edges(&self, visitor: &mut impl Visitor);
}

// visiting an object means visiting only its direct edges;
// the payload types report their own fields.
impl Visitable for HeapObject {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        match &self.data {
            ObjectData::List(items) => {
                items.read().iter().for_each(|v| visitor.visit(v));
            }
            ObjectData::Tuple(items) => {
                items.iter().for_each(|v| visitor.visit(v));
            }
            ObjectData::Dict(dict) => {
                for (key, value) in dict.read().iter() {
                    visitor.visit(key);
                    visitor.visit(value);
                }
            }
            ObjectData::Set(set) => {
                set.read().values().for_each(|v| visitor.visit(v));
            }
            ObjectData::Function(function) => {
                visitor.visit_object(&function.globals);
                function.defaults.iter().for_each(|v| visitor.visit(v));
                for (_, value) in function.kw_defaults.iter() {
                    visitor.visit(value);
                }
                function
                    .closure
                    .iter()
                    .for_each(|cell| visitor.visit_object(cell));
                for (key, value) in function.dict.read().iter() {
                    visitor.visit(key);
                    visitor.visit(value);
                }
            }
            ObjectData::NativeFunction(_) => (),
            ObjectData::BoundMethod(method) => {
                visitor.visit(&method.receiver);
                visitor.visit(&method.function);
            }
            ObjectData::Cell(cell) => {
                if let Some(value) = cell.read().as_ref() {
                    visitor.visit(value);
                }
            }
            ObjectData::Class(class) => {
                class.bases.iter().for_each(|b| visitor.visit_object(b));
                class.mro.iter().for_each(|c| visitor.visit_object(c));
                for (key, value) in class.dict.read().iter() {
                    visitor.visit(key);
                    visitor.visit(value);
                }
            }
            ObjectData::Instance(instance) => {
                visitor.visit_object(&instance.class);
                for (key, value) in instance.dict.read().iter() {
                    visitor.visit(key);
                    visitor.visit(value);
                }
            }
            ObjectData::Module(module) => visitor.visit_object(&module.globals),
            ObjectData::Exception(exception) => exception.visit_edges(visitor),
            ObjectData::Generator(generator) => generator.visit_edges(visitor),
            ObjectData::Iterator(state) => state.lock().visit_edges(visitor),
            ObjectData::Slice(slice) => {
                visitor.visit(&slice.start);
                visitor.visit(&slice.stop);
                visitor.visit(&slice.step);
            }
            ObjectData::Condition(condition) => {
                visitor.visit_object(&condition.lock);
            }
            ObjectData::Thread(thread) => thread.visit_edges(visitor),
            ObjectData::Range(_)
            | ObjectData::Lock(_)
            | ObjectData::RLock(_)
            | ObjectData::Event(_)
            | ObjectData::Semaphore(_) => (),
        }
    }
}

impl Visitable for Frame {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.stack.iter().for_each(|v| visitor.visit(v));
        self.locals.iter().flatten().for_each(|v| visitor.visit(v));
        self.cells.iter().for_each(|cell| visitor.visit_object(cell));
        visitor.visit_object(&self.globals);
        visitor.visit_object(&self.builtins);
        if let Some(names) = &self.names {
            visitor.visit_object(names);
        }
        for block in &self.blocks {
            if let Block::Handler { exception, .. } = block {
                visitor.visit(exception);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dict;
    use parking_lot::RwLock;

    #[derive(Default)]
    struct Collect(Vec<usize>);

    impl Visitor for Collect {
        fn visit_object(&mut self, object: &ObjRef) {
            self.0.push(object.addr());
        }
    }

    #[test]
    fn dict_reports_keys_and_values() {
        let a = ObjRef::untracked(ObjectData::List(RwLock::new(vec![])));
        let b = ObjRef::untracked(ObjectData::Tuple(Box::new([])));
        let mut dict = Dict::new();
        dict.insert(
            Value::Object(b.clone()).hash_key().unwrap(),
            Value::Object(b.clone()),
            Value::Object(a.clone()),
        );
        dict.set_str("n", Value::Int(1));
        let holder = ObjRef::untracked(ObjectData::Dict(RwLock::new(dict)));

        let mut collect = Collect::default();
        holder.visit_edges(&mut collect);
        assert_eq!(collect.0, vec![b.addr(), a.addr()]);
    }

    #[test]
    fn lists_report_every_reference() {
        let inner = ObjRef::untracked(ObjectData::List(RwLock::new(vec![])));
        let outer = ObjRef::untracked(ObjectData::List(RwLock::new(vec![
            Value::Object(inner.clone()),
            Value::Int(3),
            Value::Object(inner.clone()),
        ])));
        let mut collect = Collect::default();
        outer.visit_edges(&mut collect);
        assert_eq!(collect.0, vec![inner.addr(), inner.addr()]);
    }
}
