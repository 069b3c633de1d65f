//! Loader for the textual `.pyasm` code format.
//!
//! ```text
//! ; comments start with ';' or '#'
//! .code square          ; nested code object, referenced as @square
//! .args n
//!     LOAD_FAST n
//!     LOAD_FAST n
//!     BINARY_OP *
//!     RETURN_VALUE
//! .end
//!     LOAD_CONST @square
//!     MAKE_FUNCTION 0
//!     STORE_NAME square
//! loop:                 ; labels end with ':'
//!     ...
//! ```
//!
//! Everything outside a `.code`/`.end` pair belongs to the module code.
//! Header directives (`.args`, `.posonly`, `.kwonly`, `.varargs`,
//! `.varkeywords`, `.generator`, `.coroutine`, `.cellvars`, `.freevars`,
//! `.defaults`, `.kwdefault`, `.filename`) must precede the first
//! instruction of their code object.
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::Path,
    sync::Arc,
};

use log::debug;
use thiserror::Error;

use crate::{
    BinaryOp, CodeBuilder, CodeError, CodeObject, CompareOp, ObjRef,
    ObjectData, Op, Operand, Value, builder::Label,
};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: {source}")]
    Invalid {
        line: usize,
        #[source]
        source: CodeError,
    },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, AssembleError>;

fn syntax(line: usize, message: impl Into<String>) -> AssembleError {
    AssembleError::Syntax {
        line,
        message: message.into(),
    }
}

/// Reads and assembles `path`; the file name becomes the code filename.
pub fn assemble_file(path: impl AsRef<Path>) -> Result<Arc<CodeObject>> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| AssembleError::Io {
        path: path.display().to_string(),
        source,
    })?;
    assemble(&source, &path.display().to_string())
}

/// A code object being assembled.
struct Unit {
    name: String,
    builder: CodeBuilder,
    labels: HashMap<String, Label>,
    bound: HashSet<String>,
    first_use: HashMap<String, usize>,
    started: bool,
    line: usize,
}

impl Unit {
    fn new(name: &str, filename: &str, line: usize) -> Self {
        Self {
            name: name.to_owned(),
            builder: CodeBuilder::new(name).filename(filename),
            labels: HashMap::new(),
            bound: HashSet::new(),
            first_use: HashMap::new(),
            started: false,
            line,
        }
    }

    fn label(&mut self, name: &str, line: usize) -> Label {
        self.first_use.entry(name.to_owned()).or_insert(line);
        if let Some(label) = self.labels.get(name) {
            return *label;
        }
        let label = self.builder.label();
        self.labels.insert(name.to_owned(), label);
        label
    }

    /// Applies a header directive. `CodeBuilder` consumes itself for these.
    fn configure(
        &mut self,
        line: usize,
        configure: impl FnOnce(CodeBuilder) -> CodeBuilder,
    ) -> Result<()> {
        if self.started {
            return Err(syntax(line, "header directives must precede instructions"));
        }
        let builder = std::mem::replace(&mut self.builder, CodeBuilder::new(""));
        self.builder = configure(builder);
        Ok(())
    }

    fn finish(self) -> Result<Arc<CodeObject>> {
        let mut undefined: Vec<_> = self
            .labels
            .keys()
            .filter(|name| !self.bound.contains(*name))
            .collect();
        undefined.sort_by_key(|name| self.first_use.get(*name));
        if let Some(name) = undefined.first() {
            let line = self.first_use.get(*name).copied().unwrap_or(self.line);
            return Err(syntax(line, format!("undefined label '{name}'")));
        }
        self.builder
            .build()
            .map_err(|source| AssembleError::Invalid {
                line: self.line,
                source,
            })
    }
}

struct Assembler<'a> {
    filename: &'a str,
    units: Vec<Unit>,
    codes: HashMap<String, Arc<CodeObject>>,
}

/// Assembles `source` into the module code object.
pub fn assemble(source: &str, filename: &str) -> Result<Arc<CodeObject>> {
    let mut assembler = Assembler {
        filename,
        units: vec![Unit::new("<module>", filename, 1)],
        codes: HashMap::new(),
    };
    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let text = strip_comment(raw).trim();
        if !text.is_empty() {
            assembler.line(text, line)?;
        }
    }
    if assembler.units.len() > 1 {
        let unit = assembler.units.pop();
        let (name, line) = unit.map_or((String::new(), 0), |u| (u.name, u.line));
        return Err(syntax(line, format!("unterminated .code {name}")));
    }
    let module = assembler.units.pop().ok_or_else(|| syntax(0, "no module code"))?;
    let code = module.finish()?;
    debug!("assembled {filename}: {} instructions", code.instructions.len());
    Ok(code)
}

/// Cuts a trailing comment, ignoring markers inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if ch == '\\' => escaped = true,
            Some(q) if ch == q => quote = None,
            Some(_) => (),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch == ';' || ch == '#' => return &line[..index],
            None => (),
        }
    }
    line
}

fn split_head(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '<' || c == '.')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '<' | '>' | '.'))
}

impl Assembler<'_> {
    fn unit(&mut self) -> &mut Unit {
        // the module unit is never popped before the end
        let last = self.units.len() - 1;
        &mut self.units[last]
    }

    fn line(&mut self, text: &str, line: usize) -> Result<()> {
        if let Some(directive) = text.strip_prefix('.') {
            return self.directive(directive, line);
        }
        if let Some(label) = text.strip_suffix(':') {
            let label = label.trim();
            if !is_identifier(label) {
                return Err(syntax(line, format!("invalid label '{label}'")));
            }
            let unit = self.unit();
            if !unit.bound.insert(label.to_owned()) {
                return Err(syntax(line, format!("label '{label}' defined twice")));
            }
            let target = unit.label(label, line);
            unit.builder.bind(target);
            return Ok(());
        }
        self.instruction(text, line)
    }

    fn directive(&mut self, text: &str, line: usize) -> Result<()> {
        let (name, rest) = split_head(text);
        let words: Vec<&str> = rest.split_whitespace().collect();
        match name {
            "code" => {
                let [code_name] = words[..] else {
                    return Err(syntax(line, ".code takes one name"));
                };
                if self.codes.contains_key(code_name)
                    || self.units.iter().any(|unit| unit.name == code_name)
                {
                    return Err(syntax(line, format!("code '{code_name}' defined twice")));
                }
                self.units.push(Unit::new(code_name, self.filename, line));
                Ok(())
            }
            "end" => {
                if self.units.len() < 2 {
                    return Err(syntax(line, ".end without .code"));
                }
                let Some(unit) = self.units.pop() else {
                    return Err(syntax(line, ".end without .code"));
                };
                let name = unit.name.clone();
                let code = unit.finish()?;
                self.codes.insert(name, code);
                Ok(())
            }
            "filename" => {
                let value = parse_constant(rest, &self.codes, line)?;
                let Value::Str(filename) = value else {
                    return Err(syntax(line, ".filename takes a string"));
                };
                self.unit().configure(line, |b| b.filename(&filename))
            }
            "args" => self.unit().configure(line, |b| b.args(&words)),
            "kwonly" => self.unit().configure(line, |b| b.kwonly(&words)),
            "cellvars" => self.unit().configure(line, |b| b.cellvars(&words)),
            "freevars" => self.unit().configure(line, |b| b.freevars(&words)),
            "posonly" => {
                let count = parse_count(rest, line)?;
                self.unit().configure(line, |b| b.posonly(count as usize))
            }
            "varargs" | "varkeywords" => {
                let [var] = words[..] else {
                    return Err(syntax(line, format!(".{name} takes one name")));
                };
                if name == "varargs" {
                    self.unit().configure(line, |b| b.varargs(var))
                } else {
                    self.unit().configure(line, |b| b.varkeywords(var))
                }
            }
            "generator" => self.unit().configure(line, CodeBuilder::generator),
            "coroutine" => self.unit().configure(line, CodeBuilder::coroutine),
            "defaults" => {
                let defaults = parse_constant_list(rest, &self.codes, line)?;
                self.unit().configure(line, |b| b.defaults(defaults))
            }
            "kwdefault" => {
                let (param, value) = split_head(rest);
                let value = parse_constant(value, &self.codes, line)?;
                self.unit().configure(line, |b| b.kw_default(param, value))
            }
            other => Err(syntax(line, format!("unknown directive .{other}"))),
        }
    }

    fn instruction(&mut self, text: &str, line: usize) -> Result<()> {
        let (mnemonic, operand) = split_head(text);
        let op = Op::from_name(&mnemonic.to_ascii_uppercase())
            .ok_or_else(|| syntax(line, format!("unknown instruction '{mnemonic}'")))?;
        let kind = op.operand();
        if kind == Operand::None {
            if !operand.is_empty() {
                return Err(syntax(line, format!("{} takes no operand", op.name())));
            }
        } else if operand.is_empty() {
            return Err(syntax(line, format!("{} needs an operand", op.name())));
        }

        let arg = match kind {
            Operand::None => 0,
            Operand::Const => {
                let value = parse_constant(operand, &self.codes, line)?;
                self.unit().builder.constant(value)
            }
            Operand::Name => self.unit().builder.name(identifier(operand, line)?),
            Operand::Local => self.unit().builder.local(identifier(operand, line)?),
            Operand::Cell => self.unit().builder.cell(identifier(operand, line)?),
            Operand::Jump => {
                let unit = self.unit();
                let target = unit.label(identifier(operand, line)?, line);
                unit.started = true;
                unit.builder.emit_jump(op, target);
                return Ok(());
            }
            Operand::Count | Operand::Flags => parse_count(operand, line)?,
            Operand::Binary => BinaryOp::from_symbol(operand)
                .map(|op| op as u32)
                .ok_or_else(|| syntax(line, format!("unknown binary operator '{operand}'")))?,
            Operand::Compare => CompareOp::from_symbol(operand)
                .map(|op| op as u32)
                .ok_or_else(|| syntax(line, format!("unknown comparison '{operand}'")))?,
        };
        let unit = self.unit();
        unit.started = true;
        unit.builder.emit(op, arg);
        Ok(())
    }
}

fn identifier(text: &str, line: usize) -> Result<&str> {
    if is_identifier(text) {
        Ok(text)
    } else {
        Err(syntax(line, format!("expected a name, found '{text}'")))
    }
}

fn parse_count(text: &str, line: usize) -> Result<u32> {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    let parsed = match clean.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => clean.parse(),
    };
    parsed.map_err(|_| syntax(line, format!("expected an unsigned integer, found '{text}'")))
}

fn parse_constant(text: &str, codes: &HashMap<String, Arc<CodeObject>>, line: usize) -> Result<Value> {
    let mut parser = Literal { text, pos: 0, codes, line };
    let value = parser.value()?;
    parser.skip_space();
    if parser.pos < text.len() {
        return Err(syntax(line, format!("unexpected '{}'", &text[parser.pos..])));
    }
    Ok(value)
}

fn parse_constant_list(
    text: &str,
    codes: &HashMap<String, Arc<CodeObject>>,
    line: usize,
) -> Result<Vec<Value>> {
    let mut parser = Literal { text, pos: 0, codes, line };
    let mut values = Vec::new();
    loop {
        parser.skip_space();
        if parser.pos >= text.len() {
            return Ok(values);
        }
        values.push(parser.value()?);
    }
}

/// Recursive descent over one constant literal.
struct Literal<'a> {
    text: &'a str,
    pos: usize,
    codes: &'a HashMap<String, Arc<CodeObject>>,
    line: usize,
}

impl<'a> Literal<'a> {
    fn rest(&self) -> &'a str {
        let text = self.text;
        &text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_space(&mut self) {
        let rest = self.rest();
        let skipped = rest.len() - rest.trim_start().len();
        self.pos += skipped;
    }

    fn error(&self, message: impl Into<String>) -> AssembleError {
        syntax(self.line, message)
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_space();
        match self.peek() {
            None => Err(self.error("expected a constant")),
            Some('"' | '\'') => self.string().map(Value::from),
            Some('b') if self.rest()[1..].starts_with(['"', '\'']) => {
                self.pos += 1;
                let text = self.string()?;
                let bytes = text
                    .chars()
                    .map(|ch| u8::try_from(u32::from(ch)))
                    .collect::<std::result::Result<Vec<u8>, _>>()
                    .map_err(|_| self.error("bytes literal with a non-byte character"))?;
                Ok(Value::Bytes(Arc::from(bytes)))
            }
            Some('(') => self.tuple(),
            Some('@') => {
                self.pos += 1;
                let name = self.word();
                self.codes
                    .get(name)
                    .map(|code| Value::Code(code.clone()))
                    .ok_or_else(|| self.error(format!("unknown code object @{name}")))
            }
            Some(_) => {
                let word = self.word();
                scalar(word).ok_or_else(|| self.error(format!("invalid constant '{word}'")))
            }
        }
    }

    fn word(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ',' || c == ')')
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn tuple(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_space();
            if self.peek() == Some(')') {
                self.pos += 1;
                break;
            }
            items.push(self.value()?);
            self.skip_space();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => (),
                _ => return Err(self.error("expected ',' or ')' in tuple")),
            }
        }
        let tuple = ObjRef::immortal(ObjectData::Tuple(items.into_boxed_slice()));
        Ok(Value::Object(tuple))
    }

    fn string(&mut self) -> Result<String> {
        let mut chars = self.rest().char_indices();
        let start = self.pos;
        let Some((_, quote)) = chars.next() else {
            return Err(self.error("expected a string"));
        };
        let mut text = String::new();
        while let Some((index, ch)) = chars.next() {
            match ch {
                c if c == quote => {
                    self.pos = start + index + c.len_utf8();
                    return Ok(text);
                }
                '\\' => {
                    let Some((_, escape)) = chars.next() else {
                        break;
                    };
                    match escape {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '0' => text.push('\0'),
                        'x' => {
                            let hex: String = chars.by_ref().take(2).map(|(_, c)| c).collect();
                            let code = u8::from_str_radix(&hex, 16)
                                .map_err(|_| self.error(format!("invalid escape \\x{hex}")))?;
                            text.push(char::from(code));
                        }
                        '\\' | '"' | '\'' => text.push(escape),
                        other => {
                            return Err(self.error(format!("unknown escape \\{other}")));
                        }
                    }
                }
                ch => text.push(ch),
            }
        }
        Err(self.error("unterminated string"))
    }
}

/// `None`, booleans, integers of any size, floats.
fn scalar(word: &str) -> Option<Value> {
    match word {
        "None" => return Some(Value::None),
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        "inf" => return Some(Value::Float(f64::INFINITY)),
        "-inf" => return Some(Value::Float(f64::NEG_INFINITY)),
        "nan" => return Some(Value::Float(f64::NAN)),
        _ => (),
    }
    if let Ok(value) = crate::builtins::parse_int(word, 0) {
        return Some(value);
    }
    let looks_float = word.contains(['.', 'e', 'E'])
        && word.chars().next().is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
    if looks_float {
        return word.parse().ok().map(Value::Float);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Interpreter, RunError, VM, VMCreateInfo};

    fn run(source: &str) -> std::result::Result<Value, RunError> {
        let code = assemble(source, "<test>").unwrap();
        let mut interp = Interpreter::new(VM::new(VMCreateInfo::default()).new_proxy());
        interp.run_code(code)
    }

    #[test]
    fn loops_and_labels() {
        let source = "
            ; total = sum of 0..10
                LOAD_CONST 0
                STORE_NAME total
                LOAD_NAME range
                LOAD_CONST 10
                CALL_FUNCTION 1
                GET_ITER
            top:
                FOR_ITER done
                LOAD_NAME total
                BINARY_OP +       # add
                STORE_NAME total
                JUMP top
            done:
                LOAD_NAME total
                RETURN_VALUE
        ";
        assert_eq!(run(source), Ok(Value::Int(45)));
    }

    #[test]
    fn nested_code_and_defaults() {
        let source = r#"
            .code scale
            .args x factor
            .defaults 3
                LOAD_FAST x
                LOAD_FAST factor
                BINARY_OP *
                RETURN_VALUE
            .end
                LOAD_CONST @scale
                MAKE_FUNCTION 0
                LOAD_CONST 14
                CALL_FUNCTION 1
                RETURN_VALUE
        "#;
        assert_eq!(run(source), Ok(Value::Int(42)));
    }

    #[test]
    fn string_literals() {
        let value = parse_constant(r#""a;b\n\"c\"""#, &HashMap::new(), 1).unwrap();
        assert_eq!(value, Value::str("a;b\n\"c\""));
        let bytes = parse_constant(r"b'\x00\xff'", &HashMap::new(), 1).unwrap();
        assert_eq!(bytes, Value::Bytes(Arc::from(&[0u8, 255][..])));
        assert_eq!(strip_comment("LOAD_CONST \"x # y\" # note"), "LOAD_CONST \"x # y\" ");
        assert!(matches!(
            parse_constant("123456789012345678901234567890", &HashMap::new(), 1),
            Ok(Value::BigInt(_))
        ));
        let float = parse_constant("-2.5e1", &HashMap::new(), 1).unwrap();
        assert_eq!(float, Value::Float(-25.0));
        let tuple = parse_constant("(1, (None, 'x'), )", &HashMap::new(), 1).unwrap();
        let items = tuple.as_object().unwrap().as_tuple().unwrap().to_vec();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Value::Int(1));
    }

    #[test]
    fn demo_programs_run() {
        let code = assemble(include_str!("../demos/generators.pyasm"), "generators.pyasm").unwrap();
        let vm = VM::new(VMCreateInfo::default());
        vm.run_main(code).unwrap();

        let code = assemble(include_str!("../demos/counter.pyasm"), "counter.pyasm").unwrap();
        let vm = VM::new(VMCreateInfo::default());
        let module = vm.run_main(code).unwrap();
        let globals = &module.as_module().unwrap().globals;
        let counter = globals.as_dict().unwrap().read().get_str("counter").cloned().unwrap();
        let items = counter.as_object().unwrap().as_list().unwrap().read().clone();
        assert_eq!(items, vec![Value::Int(1000)]);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = assemble("LOAD_CONST 1\nFROB\n", "<test>").unwrap_err();
        assert_eq!(err.to_string(), "line 2: unknown instruction 'FROB'");

        let err = assemble("JUMP nowhere\n", "<test>").unwrap_err();
        assert_eq!(err.to_string(), "line 1: undefined label 'nowhere'");

        let err = assemble("LOAD_CONST 1\nRETURN_VALUE\n.args x\n", "<test>").unwrap_err();
        assert!(matches!(err, AssembleError::Syntax { line: 3, .. }));

        let err = assemble(".code f\nLOAD_CONST 1\n", "<test>").unwrap_err();
        assert_eq!(err.to_string(), "line 1: unterminated .code f");

        let err = assemble("LOAD_CONST 1\n", "<test>").unwrap_err();
        assert!(matches!(err, AssembleError::Invalid { source: CodeError::FallsOffEnd(_), .. }));
    }
}
