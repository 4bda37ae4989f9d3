//! Two-phase function compilation.
//!
//! The global pass records each `function` declaration as an
//! uncompiled symbol holding its source offset and skips the body as a
//! balanced block. The sweep then rewinds the tokenizer to each
//! recorded offset and lowers the body into a fresh chunk; the final
//! address becomes the symbol's value, and a body free of non-constant
//! operations marks the function pure.

use std::io::{Read, Seek, Write};

use tracing::debug;

use crate::asm::{Label, Reg};
use crate::error::{CompileError, CompileResult};
use crate::sym::{SymId, SymbolKind};
use crate::token::TokenClass;

use super::*;

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    /// Bind declared parameters to R0..R6.
    fn decl_args(&mut self) -> CompileResult<()> {
        self.expect(T_LPAREN, '(')?;
        if self.accept(T_RPAREN)? {
            return Ok(());
        }
        let mut argc = 0u8;
        loop {
            if usize::from(argc) == crate::consts::MAX_ARGS {
                return Err(CompileError::TooManyArguments);
            }
            let id = self.create_named(self.frame.scope)?;
            let sym = self.syms.get_mut(id)?;
            sym.clear_kctv();
            sym.set_dirty();
            sym.reg = argc;
            self.alloc.assign(id, Reg(argc), false);
            argc += 1;
            if !self.accept(T_COMMA)? {
                break;
            }
        }
        self.expect(T_RPAREN, ')')
    }

    /// Reserve the fixed-size prologue; rewritten by `end_function`
    /// once the locals count and callee-saved usage are known.
    fn begin_function(&mut self) {
        self.init_stack = self.asm.writer().tell(false);
        self.asm.push(0x1F0); // r4-r7, lr
        self.asm.nop();
        self.alloc.clear_use_map();
    }

    /// Rewrite the prologue, emit the epilogue, flush the pool and
    /// link. With no locals the prologue shrinks by one halfword and
    /// the entry address shifts past the placeholder.
    fn end_function(&mut self, addr: &mut u32) -> CompileResult<()> {
        let end = self.asm.writer().tell(false);
        let scope_size = self.frame.scope_size;
        let mask = (self.alloc.use_map() & 0xF0) | 0x100 | 0x80;

        self.asm.writer_mut().seek(self.init_stack, false);
        if scope_size == 0 {
            self.asm.nop();
        }
        self.asm.push(mask);
        if scope_size > 0 {
            self.asm.sub_sp_imm(scope_size << 2);
            self.asm.writer_mut().seek(end, false);
            self.asm.add_sp_imm(scope_size << 2);
        } else {
            self.asm.writer_mut().seek(end, false);
            *addr += 2;
        }
        self.asm.pop(mask);
        self.asm.pool();
        self.asm.link()?;
        // Keep the machine's code region current so compile-time calls
        // can execute what was just linked.
        let image = self.asm.writer().to_bytes();
        self.machine.load_code(&image);
        Ok(())
    }

    /// Record a `function name(...)` declaration and skip its body.
    pub(crate) fn decl_function(&mut self) -> CompileResult<()> {
        let location = self.tok.location();
        let line = self.tok.line();
        if !self.accept(T_FUNCTION)? || !self.is_name() {
            return Err(self.unexpected());
        }

        let id = self.find_or_create(0)?;
        {
            let sym = self.syms.get_mut(id)?;
            if sym.kind == SymbolKind::Uncompiled {
                return Err(CompileError::FunctionRedefinition);
            }
            sym.kind = SymbolKind::Uncompiled;
            sym.line = line as u16;
            sym.init = location;
            sym.clear_kctv();
        }

        self.expect(T_LPAREN, '(')?;
        let mut depth = 1usize;
        while depth > 0 && self.tok.class() != TokenClass::Eof {
            if self.accept(T_LPAREN)? {
                depth += 1;
            } else if self.accept(T_RPAREN)? {
                depth -= 1;
            } else {
                self.accept_any()?;
            }
        }
        self.dead_block()
    }

    /// Compile one recorded function body.
    pub fn parse_function(&mut self, base_address: u32, sym_id: SymId) -> CompileResult<()> {
        {
            let sym = self.syms.get(sym_id)?;
            if sym.kind != SymbolKind::Uncompiled {
                return Err(CompileError::AlreadyCompiled);
            }
        }

        self.is_constexpr = true;
        self.max_scope += 1;
        self.frame.scope = self.max_scope;
        self.return_label = self.new_label();
        self.frame.scope_size = 0;
        self.chunk_base = base_address + self.asm.tell();
        let mut address = self.chunk_base | 1;

        let (location, line) = {
            let sym = self.syms.get(sym_id)?;
            (sym.init, u32::from(sym.line))
        };
        debug!(sym = sym_id, address = format_args!("{address:#x}"), line, "compile function");
        self.tok.set_location(location, line)?;
        {
            let sym = self.syms.get_mut(sym_id)?;
            sym.set_mem_init(address);
            sym.kind = SymbolKind::Function;
            sym.kctv = address;
        }
        self.begin_function();
        self.clear_all_kctv()?;

        self.accept_any()?; // function
        self.accept_any()?; // name
        self.decl_args()?;
        self.block()?;

        self.flush()?;
        self.asm.load_imm(Reg(0), 0, false);
        self.asm.label(Label(self.return_label));
        self.end_function(&mut address)?;

        {
            let sym = self.syms.get_mut(sym_id)?;
            sym.set_mem_init(address);
            sym.kctv = address;
        }
        if self.is_constexpr {
            self.syms.get_mut(sym_id)?.set_constexpr();
        }
        self.purge_temps()?;
        self.frame.scope = 0;
        Ok(())
    }

    /// Phase one: top-level statements become the implicit main;
    /// function declarations are recorded for the sweep.
    pub fn parse_global(&mut self, base_address: u32) -> CompileResult<()> {
        self.chunk_base = base_address + self.asm.tell();
        self.frame.scope = 0;
        self.frame.scope_size = 0;
        self.begin_function();
        self.return_label = self.new_label();
        self.accept_any()?;
        while self.tok.class() != TokenClass::Eof {
            if self.token == T_FUNCTION {
                self.decl_function()?;
            } else {
                self.statements()?;
            }
        }
        self.flush()?;
        self.asm.load_imm(Reg(0), 0, false);
        self.asm.label(Label(self.return_label));
        let mut addr = self.chunk_base | 1;
        self.end_function(&mut addr)?;
        Ok(())
    }

    /// Phase two: lower every recorded function, in declaration order.
    pub fn compile_functions(&mut self, base_address: u32) -> CompileResult<()> {
        loop {
            let mut pending = None;
            for id in 0..self.syms.len() {
                if self.syms.get(id)?.kind == SymbolKind::Uncompiled {
                    pending = Some(id);
                    break;
                }
            }
            match pending {
                Some(id) => self.parse_function(base_address, id)?,
                None => return Ok(()),
            }
        }
    }
}
