//! Compile-time and run-time error variants.

use std::io;

use thiserror::Error;

/// Result alias used across the compiler pipeline.
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors raised while compiling a program.
///
/// The pipeline is single-pass and non-recovering: the first error stops
/// emission, and the driver wraps it in a [`Diagnostic`] carrying the
/// source position where it was raised.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A token did not form a valid lexeme (malformed number, token
    /// longer than the text buffer, unterminated string).
    #[error("Lex error: {0}")]
    Lex(&'static str),
    /// The parser met a token it cannot accept in this position.
    #[error("Unexpected token {0:?}")]
    UnexpectedToken(String),
    /// A required punctuator is missing.
    #[error("Expected {0:?}")]
    Expected(char),
    /// A keyword or operator appeared where a name is required.
    #[error("Expected variable name")]
    ExpectedName,
    /// `const` declared without `= expr`.
    #[error("Const without initializer")]
    ConstWithoutInit,
    /// A `const` initializer that is not a compile-time value.
    #[error("Const initializer not known in compile-time")]
    ConstInitNotKnown,
    /// A `const` declared twice in the same scope.
    #[error("Const redeclared")]
    ConstRedeclaration,
    /// An array literal element that is not a compile-time value.
    #[error("Invalid array literal value")]
    ArrayElementNotKnown,
    /// Array literal beyond the construction buffer.
    #[error("Array too big")]
    ArrayTooBig,
    /// `function f` declared twice.
    #[error("Function redefinition")]
    FunctionRedefinition,
    /// Symbol handed to the function sweep twice.
    #[error("Symbol already compiled")]
    AlreadyCompiled,
    /// `return` at the global scope.
    #[error("Can't return outside function")]
    ReturnOutsideFunction,
    /// `break` with no enclosing loop.
    #[error("Break outside loop")]
    BreakOutsideLoop,
    /// `continue` with no enclosing loop.
    #[error("Continue outside loop")]
    ContinueOutsideLoop,
    /// More arguments than marshal registers.
    #[error("Too many arguments")]
    TooManyArguments,
    /// Constant-folded `/` or `%` with a zero divisor, or a literal zero
    /// divisor in the lowering path.
    #[error("Division by zero")]
    DivisionByZero,
    /// An intrinsic called with the wrong shape.
    #[error("{0}")]
    Intrinsic(&'static str),
    /// Operator with no lowering for the operand mix.
    #[error("Operator not implemented")]
    OperatorNotImplemented,
    /// A compile-time evaluation (pure call folding, literal-array
    /// allocation) faulted.
    #[error("Compile-time evaluation failed: {0}")]
    ConstEval(#[from] ExecError),
    /// The emitter was handed an immediate outside the encoding range.
    #[error("Immediate {value} does not fit {what}")]
    ImmediateRange {
        /// Offending value.
        value: u32,
        /// Target encoding description.
        what: &'static str,
    },
    /// A forward label survived to `link` unresolved.
    #[error("Unresolved symbol")]
    UnresolvedLabel,
    /// A label was given two positions.
    #[error("Symbol redeclared")]
    LabelRedeclared,
    /// A branch target outside the reach of its encoding.
    #[error("Branch out of range")]
    BranchRange,
    /// The code buffer is full.
    #[error("Writer full")]
    WriterFull,
    /// I/O failure in one of the file-backed stores.
    #[error("Unrecoverable error: {0}")]
    Io(#[from] io::Error),
}

impl CompileError {
    /// True when the error came from the emission layer rather than the
    /// source program.
    pub const fn is_codegen(&self) -> bool {
        matches!(
            self,
            Self::ImmediateRange { .. }
                | Self::UnresolvedLabel
                | Self::LabelRedeclared
                | Self::BranchRange
                | Self::WriterFull
        )
    }
}

/// The first compile error together with where it was raised.
#[derive(Debug, Error)]
#[error("{error} (line {line}, column {column})")]
pub struct Diagnostic {
    /// The underlying error.
    #[source]
    pub error: CompileError,
    /// 1-based source line.
    pub line: u32,
    /// Column within the line.
    pub column: u32,
}

/// Faults raised by the reference executor.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Fetched halfword does not decode to a supported instruction.
    #[error("Undefined instruction {op:#06x} at {pc:#010x}")]
    UndefinedInstruction {
        /// The halfword that failed to decode.
        op: u16,
        /// Address it was fetched from.
        pc: u32,
    },
    /// Load/store outside the mapped regions.
    #[error("Memory fault at {addr:#010x} (pc {pc:#010x})")]
    MemoryFault {
        /// The faulting data address.
        addr: u32,
        /// Address of the faulting instruction.
        pc: u32,
    },
    /// `BLX` into the native window with no binding.
    #[error("Unbound native {slot} (pc {pc:#010x})")]
    UnboundNative {
        /// Native slot index.
        slot: u32,
        /// Address of the call site.
        pc: u32,
    },
    /// The script heap cannot satisfy an allocation.
    #[error("Out of memory allocating {words} words")]
    OutOfMemory {
        /// Requested payload size in words.
        words: u32,
    },
    /// A `BKPT` instruction was reached (the `debugger` statement).
    #[error("Breakpoint at {pc:#010x}")]
    Breakpoint {
        /// Address of the breakpoint.
        pc: u32,
    },
    /// Execution exceeded the step budget (runaway loop guard).
    #[error("Step limit exceeded at {pc:#010x}")]
    StepLimit {
        /// Address execution was stopped at.
        pc: u32,
    },
}

impl ExecError {
    /// The faulting code address, when the fault has one. Feed it to
    /// [`crate::a2l::LineTable::recover`] to map it back to a source
    /// line.
    pub const fn fault_pc(&self) -> Option<u32> {
        match self {
            Self::UndefinedInstruction { pc, .. }
            | Self::MemoryFault { pc, .. }
            | Self::UnboundNative { pc, .. }
            | Self::Breakpoint { pc }
            | Self::StepLimit { pc } => Some(*pc),
            Self::OutOfMemory { .. } => None,
        }
    }
}
