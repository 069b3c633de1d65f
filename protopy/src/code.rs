use std::{fmt, sync::Arc};

use bitflags::bitflags;
use thiserror::Error;

use crate::Value;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct CodeFlags: u32 {
        const VARARGS = 1 << 0;
        const VARKEYWORDS = 1 << 1;
        const GENERATOR = 1 << 2;
        const COROUTINE = 1 << 3;
    }
}

bitflags! {
    /// Operand of `MAKE_FUNCTION`: which optional parts sit below the code
    /// object on the operand stack.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MakeFunctionFlags: u32 {
        const DEFAULTS = 0x01;
        const KW_DEFAULTS = 0x02;
        const CLOSURE = 0x08;
    }
}

/// How an instruction interprets its operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    Const,
    Name,
    Local,
    /// Index into cell variables followed by free variables.
    Cell,
    Jump,
    Count,
    Binary,
    Compare,
    Flags,
}

macro_rules! opcodes {
    ($($variant:ident = $name:literal, $operand:ident;)*) => {
        #[repr(u8)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum Op {
            $($variant,)*
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$variant => $name,)*
                }
            }

            pub fn operand(self) -> Operand {
                match self {
                    $(Op::$variant => Operand::$operand,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Op> {
                match name {
                    $($name => Some(Op::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = "NOP", None;
    PopTop = "POP_TOP", None;
    RotTwo = "ROT_TWO", None;
    RotThree = "ROT_THREE", None;
    DupTop = "DUP_TOP", None;
    DupTopTwo = "DUP_TOP_TWO", None;

    LoadConst = "LOAD_CONST", Const;
    LoadFast = "LOAD_FAST", Local;
    StoreFast = "STORE_FAST", Local;
    DeleteFast = "DELETE_FAST", Local;
    LoadName = "LOAD_NAME", Name;
    StoreName = "STORE_NAME", Name;
    DeleteName = "DELETE_NAME", Name;
    LoadGlobal = "LOAD_GLOBAL", Name;
    StoreGlobal = "STORE_GLOBAL", Name;
    DeleteGlobal = "DELETE_GLOBAL", Name;
    LoadDeref = "LOAD_DEREF", Cell;
    StoreDeref = "STORE_DEREF", Cell;
    LoadClosure = "LOAD_CLOSURE", Cell;

    LoadAttr = "LOAD_ATTR", Name;
    StoreAttr = "STORE_ATTR", Name;
    DeleteAttr = "DELETE_ATTR", Name;
    BinarySubscr = "BINARY_SUBSCR", None;
    StoreSubscr = "STORE_SUBSCR", None;
    DeleteSubscr = "DELETE_SUBSCR", None;

    BinaryOp = "BINARY_OP", Binary;
    InplaceOp = "INPLACE_OP", Binary;
    UnaryPositive = "UNARY_POSITIVE", None;
    UnaryNegative = "UNARY_NEGATIVE", None;
    UnaryNot = "UNARY_NOT", None;
    UnaryInvert = "UNARY_INVERT", None;

    CompareOp = "COMPARE_OP", Compare;
    IsOp = "IS_OP", Flags;
    ContainsOp = "CONTAINS_OP", Flags;

    Jump = "JUMP", Jump;
    PopJumpIfFalse = "POP_JUMP_IF_FALSE", Jump;
    PopJumpIfTrue = "POP_JUMP_IF_TRUE", Jump;
    JumpIfFalseOrPop = "JUMP_IF_FALSE_OR_POP", Jump;
    JumpIfTrueOrPop = "JUMP_IF_TRUE_OR_POP", Jump;

    CallFunction = "CALL_FUNCTION", Count;
    CallFunctionKw = "CALL_FUNCTION_KW", Count;
    CallFunctionEx = "CALL_FUNCTION_EX", Flags;
    MakeFunction = "MAKE_FUNCTION", Flags;
    LoadBuildClass = "LOAD_BUILD_CLASS", None;
    ReturnValue = "RETURN_VALUE", None;

    BuildTuple = "BUILD_TUPLE", Count;
    BuildList = "BUILD_LIST", Count;
    BuildMap = "BUILD_MAP", Count;
    BuildSet = "BUILD_SET", Count;
    BuildSlice = "BUILD_SLICE", Count;
    ListAppend = "LIST_APPEND", Count;
    SetAdd = "SET_ADD", Count;
    MapAdd = "MAP_ADD", Count;
    UnpackSequence = "UNPACK_SEQUENCE", Count;

    GetIter = "GET_ITER", None;
    ForIter = "FOR_ITER", Jump;

    SetupExcept = "SETUP_EXCEPT", Jump;
    PopBlock = "POP_BLOCK", None;
    PopExcept = "POP_EXCEPT", None;
    JumpIfNotExcMatch = "JUMP_IF_NOT_EXC_MATCH", Jump;
    RaiseVarargs = "RAISE_VARARGS", Count;
    Reraise = "RERAISE", None;

    YieldValue = "YIELD_VALUE", None;
    YieldFrom = "YIELD_FROM", None;
    GetYieldFromIter = "GET_YIELD_FROM_ITER", None;
    GetAwaitable = "GET_AWAITABLE", None;
    GetAIter = "GET_AITER", None;
    GetANext = "GET_ANEXT", None;
    EndAsyncFor = "END_ASYNC_FOR", None;

    ImportName = "IMPORT_NAME", Name;
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub const ALL: &'static [BinaryOp] = &[
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::TrueDiv,
        BinaryOp::FloorDiv,
        BinaryOp::Mod,
        BinaryOp::Pow,
        BinaryOp::LShift,
        BinaryOp::RShift,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
    ];

    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::ALL.get(arg as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::TrueDiv => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.symbol() == symbol)
    }

    pub fn dunder(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Sub => "__sub__",
            BinaryOp::Mul => "__mul__",
            BinaryOp::TrueDiv => "__truediv__",
            BinaryOp::FloorDiv => "__floordiv__",
            BinaryOp::Mod => "__mod__",
            BinaryOp::Pow => "__pow__",
            BinaryOp::LShift => "__lshift__",
            BinaryOp::RShift => "__rshift__",
            BinaryOp::And => "__and__",
            BinaryOp::Or => "__or__",
            BinaryOp::Xor => "__xor__",
        }
    }

    pub fn reflected_dunder(self) -> &'static str {
        match self {
            BinaryOp::Add => "__radd__",
            BinaryOp::Sub => "__rsub__",
            BinaryOp::Mul => "__rmul__",
            BinaryOp::TrueDiv => "__rtruediv__",
            BinaryOp::FloorDiv => "__rfloordiv__",
            BinaryOp::Mod => "__rmod__",
            BinaryOp::Pow => "__rpow__",
            BinaryOp::LShift => "__rlshift__",
            BinaryOp::RShift => "__rrshift__",
            BinaryOp::And => "__rand__",
            BinaryOp::Or => "__ror__",
            BinaryOp::Xor => "__rxor__",
        }
    }

    pub fn inplace_dunder(self) -> &'static str {
        match self {
            BinaryOp::Add => "__iadd__",
            BinaryOp::Sub => "__isub__",
            BinaryOp::Mul => "__imul__",
            BinaryOp::TrueDiv => "__itruediv__",
            BinaryOp::FloorDiv => "__ifloordiv__",
            BinaryOp::Mod => "__imod__",
            BinaryOp::Pow => "__ipow__",
            BinaryOp::LShift => "__ilshift__",
            BinaryOp::RShift => "__irshift__",
            BinaryOp::And => "__iand__",
            BinaryOp::Or => "__ior__",
            BinaryOp::Xor => "__ixor__",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CompareOp {
    pub const ALL: &'static [CompareOp] = &[
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
    ];

    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::ALL.get(arg as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.symbol() == symbol)
    }

    pub fn dunder(self) -> &'static str {
        match self {
            CompareOp::Lt => "__lt__",
            CompareOp::Le => "__le__",
            CompareOp::Eq => "__eq__",
            CompareOp::Ne => "__ne__",
            CompareOp::Gt => "__gt__",
            CompareOp::Ge => "__ge__",
        }
    }

    /// The operation with swapped operands: `a < b` is `b > a`.
    pub fn swapped(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub arg: u32,
}

impl Instruction {
    #[inline]
    pub const fn new(op: Op, arg: u32) -> Self {
        Self { op, arg }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("{code}: instruction {offset} ({op}) operand {arg} out of range")]
    OperandOutOfRange {
        code: String,
        offset: usize,
        op: &'static str,
        arg: u32,
    },
    #[error("{code}: instruction {offset} jumps to {target}, past the end")]
    JumpOutOfRange {
        code: String,
        offset: usize,
        target: u32,
    },
    #[error("{code}: instruction {offset} ({op}) needs generator code")]
    SuspendOutsideGenerator {
        code: String,
        offset: usize,
        op: &'static str,
    },
    #[error("{0}: empty instruction stream")]
    Empty(String),
    #[error("{0}: last instruction must end the frame")]
    FallsOffEnd(String),
    #[error("{0}: generator and coroutine flags are exclusive")]
    ConflictingFlags(String),
    #[error("{code}: {detail}")]
    Signature { code: String, detail: String },
    #[error("label {0} is never bound")]
    UnboundLabel(usize),
}

/// Everything needed to build a [`CodeObject`].
#[derive(Debug, Default)]
pub struct CodeCreateInfo {
    pub name: Arc<str>,
    pub filename: Arc<str>,
    pub constants: Vec<Value>,
    pub names: Vec<Arc<str>>,
    pub varnames: Vec<Arc<str>>,
    pub cellvars: Vec<Arc<str>>,
    pub freevars: Vec<Arc<str>>,
    pub instructions: Vec<Instruction>,
    pub arg_count: usize,
    pub posonly_count: usize,
    pub kwonly_count: usize,
    pub flags: CodeFlags,
    pub defaults: Vec<Value>,
    pub kw_defaults: Vec<(Arc<str>, Value)>,
}

/// Compiled unit of bytecode. Immutable once built and shared between
/// threads through `Arc`.
///
/// The first `arg_count` varnames are the positional parameters, followed
/// by `kwonly_count` keyword-only parameters, then the `*args` and
/// `**kwargs` collectors when the matching flags are set.
#[derive(Debug)]
pub struct CodeObject {
    pub name: Arc<str>,
    pub filename: Arc<str>,
    pub constants: Box<[Value]>,
    pub names: Box<[Arc<str>]>,
    pub varnames: Box<[Arc<str>]>,
    pub cellvars: Box<[Arc<str>]>,
    pub freevars: Box<[Arc<str>]>,
    pub instructions: Box<[Instruction]>,
    pub arg_count: usize,
    pub posonly_count: usize,
    pub kwonly_count: usize,
    pub flags: CodeFlags,
    pub defaults: Box<[Value]>,
    pub kw_defaults: Box<[(Arc<str>, Value)]>,
}

impl CodeObject {
    /// Validates every operand once so the interpreter can index without
    /// further checks.
    pub fn new(info: CodeCreateInfo) -> Result<Arc<Self>, CodeError> {
        let code = Self {
            name: info.name,
            filename: info.filename,
            constants: info.constants.into_boxed_slice(),
            names: info.names.into_boxed_slice(),
            varnames: info.varnames.into_boxed_slice(),
            cellvars: info.cellvars.into_boxed_slice(),
            freevars: info.freevars.into_boxed_slice(),
            instructions: info.instructions.into_boxed_slice(),
            arg_count: info.arg_count,
            posonly_count: info.posonly_count,
            kwonly_count: info.kwonly_count,
            flags: info.flags,
            defaults: info.defaults.into_boxed_slice(),
            kw_defaults: info.kw_defaults.into_boxed_slice(),
        };
        code.validate()?;
        Ok(Arc::new(code))
    }

    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags
            .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE)
    }

    #[inline]
    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    /// Number of parameters including the `*args`/`**kwargs` collectors.
    pub fn total_args(&self) -> usize {
        self.arg_count
            + self.kwonly_count
            + usize::from(self.flags.contains(CodeFlags::VARARGS))
            + usize::from(self.flags.contains(CodeFlags::VARKEYWORDS))
    }

    /// Name of cell slot `index`: cell variables first, then free ones.
    pub fn cell_name(&self, index: usize) -> Option<&Arc<str>> {
        self.cellvars
            .get(index)
            .or_else(|| self.freevars.get(index - self.cellvars.len()))
    }

    fn validate(&self) -> Result<(), CodeError> {
        let name = || self.name.to_string();
        let signature = |detail: &str| CodeError::Signature {
            code: name(),
            detail: detail.into(),
        };

        if self.flags.contains(CodeFlags::GENERATOR | CodeFlags::COROUTINE) {
            return Err(CodeError::ConflictingFlags(name()));
        }
        if self.total_args() > self.varnames.len() {
            return Err(signature("more parameters than local slots"));
        }
        if self.posonly_count > self.arg_count {
            return Err(signature("positional-only count exceeds arg count"));
        }
        if self.defaults.len() > self.arg_count {
            return Err(signature("more defaults than positional parameters"));
        }
        let kwonly = &self.varnames
            [self.arg_count..self.arg_count + self.kwonly_count];
        if let Some((missing, _)) = self
            .kw_defaults
            .iter()
            .find(|(key, _)| !kwonly.contains(key))
        {
            return Err(signature(&format!(
                "keyword default for unknown parameter '{missing}'"
            )));
        }

        let Some(last) = self.instructions.last() else {
            return Err(CodeError::Empty(name()));
        };
        if !matches!(
            last.op,
            Op::ReturnValue | Op::Jump | Op::RaiseVarargs | Op::Reraise
        ) {
            return Err(CodeError::FallsOffEnd(name()));
        }

        let cells = self.cellvars.len() + self.freevars.len();
        for (offset, instruction) in self.instructions.iter().enumerate() {
            let arg = instruction.arg as usize;
            let in_range = match instruction.op.operand() {
                Operand::None | Operand::Count | Operand::Flags => true,
                Operand::Const => arg < self.constants.len(),
                Operand::Name => arg < self.names.len(),
                Operand::Local => arg < self.varnames.len(),
                Operand::Cell => arg < cells,
                Operand::Binary => BinaryOp::from_arg(instruction.arg).is_some(),
                Operand::Compare => {
                    CompareOp::from_arg(instruction.arg).is_some()
                }
                Operand::Jump => {
                    if arg >= self.instructions.len() {
                        return Err(CodeError::JumpOutOfRange {
                            code: name(),
                            offset,
                            target: instruction.arg,
                        });
                    }
                    true
                }
            };
            if !in_range {
                return Err(CodeError::OperandOutOfRange {
                    code: name(),
                    offset,
                    op: instruction.op.name(),
                    arg: instruction.arg,
                });
            }
            if matches!(instruction.op, Op::YieldValue | Op::YieldFrom)
                && !self.is_generator()
            {
                return Err(CodeError::SuspendOutsideGenerator {
                    code: name(),
                    offset,
                    op: instruction.op.name(),
                });
            }
        }
        Ok(())
    }

    fn describe_operand(&self, instruction: Instruction) -> String {
        let arg = instruction.arg as usize;
        match instruction.op.operand() {
            Operand::None => String::new(),
            Operand::Const => format!("{} ({:?})", arg, self.constants[arg]),
            Operand::Name => format!("{} ({})", arg, self.names[arg]),
            Operand::Local => format!("{} ({})", arg, self.varnames[arg]),
            Operand::Cell => match self.cell_name(arg) {
                Some(name) => format!("{arg} ({name})"),
                None => arg.to_string(),
            },
            Operand::Jump => format!("-> {arg}"),
            Operand::Binary => BinaryOp::from_arg(instruction.arg)
                .map_or_else(|| arg.to_string(), |op| op.symbol().into()),
            Operand::Compare => CompareOp::from_arg(instruction.arg)
                .map_or_else(|| arg.to_string(), |op| op.symbol().into()),
            Operand::Count | Operand::Flags => arg.to_string(),
        }
    }
}

/// Disassembly listing, nested code objects included.
impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "code {} ({})", self.name, self.filename)?;
        writeln!(
            f,
            "  args={} posonly={} kwonly={} flags={:?}",
            self.arg_count, self.posonly_count, self.kwonly_count, self.flags
        )?;
        for (offset, instruction) in self.instructions.iter().enumerate() {
            writeln!(
                f,
                "  {offset:>4} {:<24} {}",
                instruction.op.name(),
                self.describe_operand(*instruction)
            )?;
        }
        for constant in &self.constants {
            if let Value::Code(nested) = constant {
                writeln!(f)?;
                write!(f, "{nested}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(instructions: Vec<Instruction>) -> CodeCreateInfo {
        CodeCreateInfo {
            name: Arc::from("t"),
            filename: Arc::from("<test>"),
            constants: vec![Value::None],
            instructions,
            ..Default::default()
        }
    }

    #[test]
    fn opcode_names_round_trip() {
        for op in Op::ALL {
            assert_eq!(Op::from_name(op.name()), Some(*op));
        }
    }

    #[test]
    fn rejects_out_of_range_constant() {
        let err = CodeObject::new(info(vec![
            Instruction::new(Op::LoadConst, 3),
            Instruction::new(Op::ReturnValue, 0),
        ]))
        .unwrap_err();
        assert!(matches!(err, CodeError::OperandOutOfRange { arg: 3, .. }));
    }

    #[test]
    fn rejects_bad_jump_and_missing_return() {
        let err = CodeObject::new(info(vec![Instruction::new(Op::Jump, 9)]))
            .unwrap_err();
        assert!(matches!(err, CodeError::JumpOutOfRange { .. }));

        let err =
            CodeObject::new(info(vec![Instruction::new(Op::LoadConst, 0)]))
                .unwrap_err();
        assert!(matches!(err, CodeError::FallsOffEnd(_)));
    }

    #[test]
    fn yield_requires_generator_flag() {
        let instructions = vec![
            Instruction::new(Op::LoadConst, 0),
            Instruction::new(Op::YieldValue, 0),
            Instruction::new(Op::ReturnValue, 0),
        ];
        let err = CodeObject::new(info(instructions.clone())).unwrap_err();
        assert!(matches!(err, CodeError::SuspendOutsideGenerator { .. }));

        let mut generator = info(instructions);
        generator.flags = CodeFlags::GENERATOR;
        assert!(CodeObject::new(generator).is_ok());
    }

    #[test]
    fn disassembly_names_operands() {
        let code = CodeObject::new(info(vec![
            Instruction::new(Op::LoadConst, 0),
            Instruction::new(Op::ReturnValue, 0),
        ]))
        .unwrap();
        let listing = code.to_string();
        assert!(listing.contains("LOAD_CONST"));
        assert!(listing.contains("(None)"));
    }
}
