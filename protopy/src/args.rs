use std::sync::Arc;

use crate::{ExcType, RunError, RunResult, Value};

/// Arguments of a call: positional values plus keyword pairs in call order.
#[derive(Debug, Default, Clone)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: Vec<(Arc<str>, Value)>,
}

impl Args {
    #[must_use]
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keywords(
        positional: Vec<Value>,
        keywords: Vec<(Arc<str>, Value)>,
    ) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    pub fn prepend(&mut self, receiver: Value) {
        self.positional.insert(0, receiver);
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value)
    }

    /// Positional slot `index`, falling back to keyword `name`.
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.get(index).or_else(|| self.keyword(name))
    }

    /// Checks the positional count and rejects any keyword.
    pub fn check(&self, name: &str, min: usize, max: usize) -> RunResult<()> {
        if let Some((key, _)) = self.keywords.first() {
            return Err(RunError::new(
                ExcType::TypeError,
                format!("{name}() got an unexpected keyword argument '{key}'"),
            ));
        }
        self.check_positional(name, min, max)
    }

    /// Like [`Args::check`] but accepts the listed keywords.
    pub fn check_with_keywords(
        &self,
        name: &str,
        min: usize,
        max: usize,
        allowed: &[&str],
    ) -> RunResult<()> {
        if let Some((key, _)) = self
            .keywords
            .iter()
            .find(|(key, _)| !allowed.contains(&&**key))
        {
            return Err(RunError::new(
                ExcType::TypeError,
                format!("{name}() got an unexpected keyword argument '{key}'"),
            ));
        }
        self.check_positional(name, min, max)
    }

    fn check_positional(
        &self,
        name: &str,
        min: usize,
        max: usize,
    ) -> RunResult<()> {
        let given = self.positional.len();
        if (min..=max).contains(&given) {
            return Ok(());
        }
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        let plural = if min == max && min == 1 { "" } else { "s" };
        Err(RunError::new(
            ExcType::TypeError,
            format!(
                "{name}() takes {expected} argument{plural} ({given} given)"
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_errors_are_type_errors() {
        let args = Args::new(vec![Value::Int(1), Value::Int(2)]);
        assert!(args.check("f", 1, 2).is_ok());
        let err = args.check("f", 0, 1).unwrap_err();
        assert!(err.is_instance(ExcType::TypeError));
    }

    #[test]
    fn keywords_are_checked_against_the_allowed_list() {
        let args = Args::with_keywords(
            vec![],
            vec![(Arc::from("timeout"), Value::Float(0.5))],
        );
        assert!(args.check_with_keywords("wait", 0, 1, &["timeout"]).is_ok());
        assert!(args.check("wait", 0, 1).is_err());
        assert_eq!(args.arg(0, "timeout"), Some(&Value::Float(0.5)));
    }
}
