//! Parser / code-generation driver.
//!
//! Recursive descent with operator precedence (logic → compare → sum →
//! mul → unary → postfix → value). The parser is simultaneously the
//! semantic analyzer, symbol allocator, register allocator driver,
//! constant folder and emitter: recognizing a construct immediately
//! drives the assembler. Values stay in one of three states — known
//! compile-time value, live register, or comparison flags — and
//! materialize lazily.

mod call;
mod expr;
mod function;
mod stmt;
mod storage;
mod sympool;

use std::io::{Read, Seek, Write};

use crate::a2l::LineTable;
use crate::asm::Assembler;
use crate::consts::{DATA_BASE, SYM_CACHE_SIZE};
use crate::error::{CompileError, CompileResult, Diagnostic};
use crate::fingerprint::fp;
use crate::machine::Machine;
use crate::regalloc::RegAlloc;
use crate::restable::ResourceTable;
use crate::store::PagedStore;
use crate::sym::{SymId, Symbol, INVALID_SYM};
use crate::token::{TokenClass, Tokenizer};

pub(crate) use storage::Frame;

/* token fingerprints */

pub(crate) const T_VAR: u32 = fp("var");
pub(crate) const T_CONST: u32 = fp("const");
pub(crate) const T_FUNCTION: u32 = fp("function");
pub(crate) const T_RETURN: u32 = fp("return");
pub(crate) const T_IF: u32 = fp("if");
pub(crate) const T_ELSE: u32 = fp("else");
pub(crate) const T_WHILE: u32 = fp("while");
pub(crate) const T_DO: u32 = fp("do");
pub(crate) const T_FOR: u32 = fp("for");
pub(crate) const T_BREAK: u32 = fp("break");
pub(crate) const T_CONTINUE: u32 = fp("continue");
pub(crate) const T_DEBUGGER: u32 = fp("debugger");
pub(crate) const T_NEW: u32 = fp("new");
pub(crate) const T_TRUE: u32 = fp("true");
pub(crate) const T_FALSE: u32 = fp("false");
pub(crate) const T_NULL: u32 = fp("null");
pub(crate) const T_UNDEFINED: u32 = fp("undefined");
pub(crate) const T_OF: u32 = fp("of");
pub(crate) const T_IN: u32 = fp("in");

pub(crate) const T_LPAREN: u32 = fp("(");
pub(crate) const T_RPAREN: u32 = fp(")");
pub(crate) const T_LBRACE: u32 = fp("{");
pub(crate) const T_RBRACE: u32 = fp("}");
pub(crate) const T_LBRACKET: u32 = fp("[");
pub(crate) const T_RBRACKET: u32 = fp("]");
pub(crate) const T_SEMI: u32 = fp(";");
pub(crate) const T_COMMA: u32 = fp(",");

pub(crate) const T_ASSIGN: u32 = fp("=");
pub(crate) const T_PLUS: u32 = fp("+");
pub(crate) const T_MINUS: u32 = fp("-");
pub(crate) const T_STAR: u32 = fp("*");
pub(crate) const T_SLASH: u32 = fp("/");
pub(crate) const T_PERCENT: u32 = fp("%");
pub(crate) const T_SHL: u32 = fp("<<");
pub(crate) const T_SHR: u32 = fp(">>");
pub(crate) const T_USHR: u32 = fp(">>>");
pub(crate) const T_AND: u32 = fp("&");
pub(crate) const T_OR: u32 = fp("|");
pub(crate) const T_XOR: u32 = fp("^");
pub(crate) const T_ANDAND: u32 = fp("&&");
pub(crate) const T_OROR: u32 = fp("||");
pub(crate) const T_NOT: u32 = fp("!");
pub(crate) const T_TILDE: u32 = fp("~");
pub(crate) const T_EQ: u32 = fp("==");
pub(crate) const T_NE: u32 = fp("!=");
pub(crate) const T_SEQ: u32 = fp("===");
pub(crate) const T_SNE: u32 = fp("!==");
pub(crate) const T_LT: u32 = fp("<");
pub(crate) const T_LE: u32 = fp("<=");
pub(crate) const T_GT: u32 = fp(">");
pub(crate) const T_GE: u32 = fp(">=");
pub(crate) const T_INC: u32 = fp("++");
pub(crate) const T_DEC: u32 = fp("--");
pub(crate) const T_PLUS_EQ: u32 = fp("+=");
pub(crate) const T_MINUS_EQ: u32 = fp("-=");
pub(crate) const T_STAR_EQ: u32 = fp("*=");
pub(crate) const T_SLASH_EQ: u32 = fp("/=");
pub(crate) const T_PERCENT_EQ: u32 = fp("%=");
pub(crate) const T_SHL_EQ: u32 = fp("<<=");
pub(crate) const T_SHR_EQ: u32 = fp(">>=");
pub(crate) const T_USHR_EQ: u32 = fp(">>>=");
pub(crate) const T_AND_EQ: u32 = fp("&=");
pub(crate) const T_OR_EQ: u32 = fp("|=");
pub(crate) const T_XOR_EQ: u32 = fp("^=");
pub(crate) const T_ANDAND_EQ: u32 = fp("&&=");
pub(crate) const T_OROR_EQ: u32 = fp("||=");

const KEYWORDS: [u32; 11] = [
    T_VAR, T_FUNCTION, T_RETURN, T_IF, T_ELSE, T_WHILE, T_DO, T_CONST, T_FOR, T_BREAK, T_CONTINUE,
];

/// The fused parser/codegen driver.
///
/// Generic over the source stream `S` and the backing stream `F` the
/// file-backed stores use, the way the interpreter types of this crate's
/// siblings stay generic over their storage.
pub struct Compiler<S, F> {
    pub(crate) tok: Tokenizer<S>,
    pub(crate) asm: Assembler,
    pub(crate) alloc: RegAlloc,
    pub(crate) syms: PagedStore<Symbol, F>,
    pub(crate) res: ResourceTable<F>,
    pub(crate) a2l: LineTable<F>,
    pub(crate) machine: Machine,
    pub(crate) frame: Frame,

    pub(crate) token: u32,
    pub(crate) sym_id: SymId,
    pub(crate) max_scope: u16,
    pub(crate) next_label: u32,
    pub(crate) return_label: u32,
    pub(crate) lbl_break: Option<u32>,
    pub(crate) lbl_continue: Option<u32>,
    pub(crate) is_constexpr: bool,
    /// Absolute base the current chunk links against, for direct calls
    /// into earlier functions.
    pub(crate) chunk_base: u32,
    pub(crate) init_stack: usize,
    pub(crate) hash_cache: [SymId; SYM_CACHE_SIZE],
    /// Staging cursor into the data section for array literals.
    pub(crate) array_stage: u32,
    pub(crate) a2l_pos: u32,
}

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    pub fn new(
        tok: Tokenizer<S>,
        syms: PagedStore<Symbol, F>,
        res: ResourceTable<F>,
        a2l: LineTable<F>,
        mut machine: Machine,
    ) -> Self {
        machine.clear_data();
        Self {
            tok,
            asm: Assembler::new(),
            alloc: RegAlloc::new(),
            syms,
            res,
            a2l,
            machine,
            frame: Frame::default(),
            token: 0,
            sym_id: INVALID_SYM,
            max_scope: 0,
            next_label: 1,
            return_label: 0,
            lbl_break: None,
            lbl_continue: None,
            is_constexpr: true,
            chunk_base: 0,
            init_stack: 0,
            hash_cache: [INVALID_SYM; SYM_CACHE_SIZE],
            array_stage: 0,
            a2l_pos: u32::MAX,
        }
    }

    /// Wrap an error with the position the tokenizer stopped at.
    pub(crate) fn diagnose(&self, error: CompileError) -> Diagnostic {
        Diagnostic { error, line: self.tok.line(), column: self.tok.column() }
    }

    pub(crate) fn symbols(&mut self) -> &mut PagedStore<Symbol, F> {
        &mut self.syms
    }

    pub fn global_scope_size(&self) -> u32 {
        self.frame.global_scope_size
    }

    pub(crate) fn assembler(&mut self) -> &mut Assembler {
        &mut self.asm
    }

    /// Address↔line table, for crash recovery after a run.
    pub fn line_table(&mut self) -> &mut LineTable<F> {
        &mut self.a2l
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn resources(&mut self) -> &mut ResourceTable<F> {
        &mut self.res
    }

    /// Advance to the next token, recording the source line of the
    /// current emit position.
    pub(crate) fn accept_any(&mut self) -> CompileResult<()> {
        self.token = self.tok.get()?;
        let pos = self.asm.tell();
        if pos != self.a2l_pos {
            self.a2l_pos = pos;
            self.a2l.record(pos, self.tok.line() as u16)?;
        }
        Ok(())
    }

    /// Consume the current token if it matches.
    pub(crate) fn accept(&mut self, fingerprint: u32) -> CompileResult<bool> {
        if self.token == fingerprint {
            self.accept_any()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn expect(&mut self, fingerprint: u32, what: char) -> CompileResult<()> {
        if self.accept(fingerprint)? {
            Ok(())
        } else {
            Err(CompileError::Expected(what))
        }
    }

    pub(crate) fn unexpected(&self) -> CompileError {
        CompileError::UnexpectedToken(String::from_utf8_lossy(self.tok.text()).into_owned())
    }

    pub(crate) fn new_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    pub(crate) fn hit_tmp(&mut self, id: SymId) -> CompileResult<()> {
        if id != INVALID_SYM {
            self.syms.get_mut(id)?.hit_temp();
        }
        Ok(())
    }

    /* token classification */

    pub(crate) fn is_keyword(&self) -> bool {
        KEYWORDS.contains(&self.token)
    }

    pub(crate) fn is_name(&self) -> bool {
        !(self.is_keyword()
            || self.tok.is_operator()
            || self.tok.is_special()
            || self.tok.class() == TokenClass::Unknown
            || self.tok.class() == TokenClass::Eof)
    }

    pub(crate) fn is_unary_op(&self, token: u32) -> bool {
        matches!(token, T_PLUS | T_INC | T_MINUS | T_DEC | T_NOT | T_TILDE)
    }

    pub(crate) fn is_postfix_op(&self, token: u32) -> bool {
        matches!(token, T_DEC | T_INC | T_LPAREN | T_LBRACKET)
    }

    pub(crate) fn is_mul_op(token: u32) -> bool {
        matches!(token, T_STAR | T_SLASH | T_PERCENT)
    }

    pub(crate) fn is_sum_op(token: u32) -> bool {
        matches!(token, T_PLUS | T_MINUS | T_XOR | T_OR | T_AND | T_SHR | T_USHR | T_SHL)
    }

    pub(crate) fn is_compare_op(token: u32) -> bool {
        matches!(token, T_SEQ | T_EQ | T_NE | T_SNE | T_LT | T_LE | T_GT | T_GE)
    }

    pub(crate) fn is_logic_op(token: u32) -> bool {
        matches!(token, T_ANDAND | T_OROR)
    }

    pub(crate) fn is_assign_op(&self) -> bool {
        matches!(
            self.token,
            T_ASSIGN
                | T_STAR_EQ
                | T_SLASH_EQ
                | T_PLUS_EQ
                | T_MINUS_EQ
                | T_SHL_EQ
                | T_SHR_EQ
                | T_USHR_EQ
                | T_AND_EQ
                | T_ANDAND_EQ
                | T_OR_EQ
                | T_OROR_EQ
                | T_XOR_EQ
                | T_PERCENT_EQ
        )
    }

    /// Map a compound-assignment (or strict-equality) operator to the
    /// underlying binary operator.
    pub(crate) fn strip_assign(token: u32) -> u32 {
        match token {
            T_SEQ => T_EQ,
            T_SNE => T_NE,
            T_STAR_EQ => T_STAR,
            T_SLASH_EQ => T_SLASH,
            T_PLUS_EQ => T_PLUS,
            T_MINUS_EQ => T_MINUS,
            T_SHL_EQ => T_SHL,
            T_SHR_EQ => T_SHR,
            T_USHR_EQ => T_USHR,
            T_AND_EQ => T_AND,
            T_ANDAND_EQ => T_ANDAND,
            T_OR_EQ => T_OR,
            T_OROR_EQ => T_OROR,
            T_XOR_EQ => T_XOR,
            T_PERCENT_EQ => T_PERCENT,
            other => other,
        }
    }

}

/// Byte address of a global data-section slot, split into a 32-word
/// bank base plus an in-range load/store offset.
pub(crate) fn global_bank(address: u16) -> (u32, u32) {
    let bank = (u32::from(address) >> 5) << 7;
    let offset = (u32::from(address) & 0x1F) << 2;
    (DATA_BASE + bank, offset)
}
