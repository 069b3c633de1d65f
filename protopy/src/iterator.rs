use std::sync::Arc;

use crate::{ObjRef, Range, Value, Visitable, Visitor};

/// Cursor of a built-in iterator object.
///
/// Lists are walked live by index, so appends during iteration are seen
/// the way interpreted code expects. Dicts and sets are snapshotted when
/// the iterator is created.
#[derive(Debug)]
pub enum IterState {
    Seq { seq: ObjRef, index: usize },
    Str { text: Arc<str>, offset: usize },
    Bytes { bytes: Arc<[u8]>, index: usize },
    Range { range: Range, index: usize },
    Items { items: Vec<Value>, index: usize },
    Enumerate { inner: Value, count: i64 },
    Zip { iters: Vec<Value> },
    Exhausted,
}

/// Outcome of advancing a cursor without running interpreted code.
#[derive(Debug)]
pub enum Advance {
    Item(Value),
    Exhausted,
    /// Wraps other iterators; the interpreter advances them.
    Nested,
}

impl IterState {
    pub fn advance(&mut self) -> Advance {
        let next = match self {
            IterState::Seq { seq, index } => {
                let item = match (seq.as_list(), seq.as_tuple()) {
                    (Some(list), _) => list.read().get(*index).cloned(),
                    (_, Some(tuple)) => tuple.get(*index).cloned(),
                    _ => None,
                };
                *index += 1;
                item
            }
            IterState::Str { text, offset } => {
                let ch = text[*offset..].chars().next();
                ch.map(|ch| {
                    *offset += ch.len_utf8();
                    Value::from(ch.to_string())
                })
            }
            IterState::Bytes { bytes, index } => {
                let byte = bytes.get(*index).copied();
                *index += 1;
                byte.map(|b| Value::Int(i64::from(b)))
            }
            IterState::Range { range, index } => {
                let item = range.get(*index);
                *index += 1;
                item.map(Value::Int)
            }
            IterState::Items { items, index } => {
                let item = items.get(*index).cloned();
                *index += 1;
                item
            }
            IterState::Enumerate { .. } | IterState::Zip { .. } => {
                return Advance::Nested;
            }
            IterState::Exhausted => None,
        };
        match next {
            Some(value) => Advance::Item(value),
            None => {
                *self = IterState::Exhausted;
                Advance::Exhausted
            }
        }
    }

    /// Moves every held reference into `sink`.
    pub fn into_values(self, sink: &mut Vec<Value>) {
        match self {
            IterState::Seq { seq, .. } => sink.push(Value::Object(seq)),
            IterState::Items { items, .. } => sink.extend(items),
            IterState::Enumerate { inner, .. } => sink.push(inner),
            IterState::Zip { iters } => sink.extend(iters),
            IterState::Str { .. }
            | IterState::Bytes { .. }
            | IterState::Range { .. }
            | IterState::Exhausted => (),
        }
    }
}

impl Visitable for IterState {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        match self {
            IterState::Seq { seq, .. } => visitor.visit_object(seq),
            IterState::Items { items, .. } => {
                items.iter().for_each(|v| visitor.visit(v));
            }
            IterState::Enumerate { inner, .. } => visitor.visit(inner),
            IterState::Zip { iters } => iters.iter().for_each(|v| visitor.visit(v)),
            IterState::Str { .. }
            | IterState::Bytes { .. }
            | IterState::Range { .. }
            | IterState::Exhausted => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectData;
    use parking_lot::RwLock;

    fn collect(mut state: IterState) -> Vec<Value> {
        let mut out = Vec::new();
        while let Advance::Item(value) = state.advance() {
            out.push(value);
        }
        out
    }

    #[test]
    fn strings_iterate_by_character() {
        let state = IterState::Str {
            text: Arc::from("hé!"),
            offset: 0,
        };
        assert_eq!(
            collect(state),
            vec![Value::str("h"), Value::str("é"), Value::str("!")]
        );
    }

    #[test]
    fn lists_are_read_live() {
        let list = ObjRef::untracked(ObjectData::List(RwLock::new(vec![
            Value::Int(1),
        ])));
        let mut state = IterState::Seq {
            seq: list.clone(),
            index: 0,
        };
        assert!(matches!(state.advance(), Advance::Item(Value::Int(1))));
        list.as_list().unwrap().write().push(Value::Int(2));
        assert!(matches!(state.advance(), Advance::Item(Value::Int(2))));
        assert!(matches!(state.advance(), Advance::Exhausted));
        assert!(matches!(state, IterState::Exhausted));
    }

    #[test]
    fn ranges_stop_at_their_end() {
        let state = IterState::Range {
            range: Range { start: 3, stop: 0, step: -1 },
            index: 0,
        };
        assert_eq!(
            collect(state),
            vec![Value::Int(3), Value::Int(2), Value::Int(1)]
        );
    }
}
