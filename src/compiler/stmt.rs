//! Statement parsing: declarations and control flow.
//!
//! Loops and branches flush the live symbol state at every join so the
//! emitted blocks agree on where values live: everything that crosses a
//! label goes through memory.

use std::io::{Read, Seek, Write};

use crate::asm::{Cond, Label, Reg, R7};
use crate::consts::{SRAM_BASE, SRAM_SIZE};
use crate::error::{CompileError, CompileResult};
use crate::sym::SymId;
use crate::token::TokenClass;

use super::*;

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    pub(crate) fn statements(&mut self) -> CompileResult<()> {
        match self.token {
            t if t == T_SEMI => {}
            t if t == T_BREAK => self.break_statement()?,
            t if t == T_CONTINUE => self.continue_statement()?,
            t if t == T_DEBUGGER => {
                self.accept_any()?;
                self.asm.bkpt(0);
            }
            t if t == T_VAR => {
                self.accept_any()?;
                self.var_decl()?;
            }
            t if t == T_CONST => {
                self.accept_any()?;
                self.const_decl()?;
            }
            t if t == T_IF => self.if_statement()?,
            t if t == T_DO => self.do_statement()?,
            t if t == T_WHILE => self.while_statement()?,
            t if t == T_FOR => self.for_statement()?,
            t if t == T_RETURN => self.return_statement()?,
            _ => {
                self.expression()?;
                let id = self.sym_id;
                self.hit_tmp(id)?;
            }
        }
        self.accept(T_SEMI)?;
        Ok(())
    }

    pub(crate) fn statement_or_block(&mut self) -> CompileResult<()> {
        if self.token == T_LBRACE {
            self.block()
        } else {
            self.statements()
        }
    }

    pub(crate) fn block(&mut self) -> CompileResult<()> {
        self.expect(T_LBRACE, '{')?;
        while self.token != T_RBRACE {
            if self.tok.class() == TokenClass::Eof {
                return Err(CompileError::Expected('}'));
            }
            self.statements()?;
        }
        self.expect(T_RBRACE, '}')
    }

    /// Skip a balanced `{ … }` without emitting anything.
    pub(crate) fn dead_block(&mut self) -> CompileResult<()> {
        self.expect(T_LBRACE, '{')?;
        let mut depth = 1usize;
        while depth > 0 && self.tok.class() != TokenClass::Eof {
            if self.accept(T_LBRACE)? {
                depth += 1;
            } else if self.accept(T_RBRACE)? {
                depth -= 1;
            } else {
                self.accept_any()?;
            }
        }
        Ok(())
    }

    pub(crate) fn var_decl(&mut self) -> CompileResult<()> {
        loop {
            let id = self.create_named(self.frame.scope)?;
            if self.accept(T_ASSIGN)? {
                self.simple_expression()?;
                self.assign_to(id)?;
                let sym = self.syms.get_mut(id)?;
                if sym.has_kctv() {
                    sym.promote_mem_init();
                }
            } else if self.frame.scope != 0 {
                self.syms.get_mut(id)?.set_dirty();
            }
            if self.frame.scope == 0 {
                // Every global gets a start-up value, default zero.
                let sym = self.syms.get_mut(id)?;
                let init = sym.init;
                sym.set_mem_init(init);
            }
            self.sym_id = id;
            if !self.accept(T_COMMA)? {
                return Ok(());
            }
        }
    }

    pub(crate) fn const_decl(&mut self) -> CompileResult<()> {
        loop {
            let id = self.create_named(self.frame.scope)?;
            if self.syms.get(id)?.is_constant() {
                return Err(CompileError::ConstRedeclaration);
            }
            if !self.accept(T_ASSIGN)? {
                return Err(CompileError::ConstWithoutInit);
            }
            self.simple_expression()?;
            let rval_id = self.sym_id;
            self.syms.get_mut(rval_id)?.hit_temp();
            let rval = self.syms.get(rval_id)?;
            if !rval.has_kctv() {
                return Err(CompileError::ConstInitNotKnown);
            }
            self.syms.get_mut(id)?.set_constant(rval.kctv);
            self.sym_id = id;
            if !self.accept(T_COMMA)? {
                return Ok(());
            }
        }
    }

    pub(crate) fn if_statement(&mut self) -> CompileResult<()> {
        let end_label = self.new_label();
        loop {
            if !self.accept(T_IF)? {
                return Err(self.unexpected());
            }
            self.paren_expression()?;
            let fail_label = self.new_label();

            let cond = self.syms.get(self.sym_id)?;
            if cond.has_kctv() {
                self.syms.get_mut(self.sym_id)?.hit_temp();
                if cond.kctv != 0 {
                    // Live arm; a possible else arm is dead.
                    self.statement_or_block()?;
                    self.flush()?;
                    if self.accept(T_ELSE)? {
                        if self.token == T_LBRACE {
                            self.dead_block()?;
                        } else {
                            // Single-statement dead arm still parses;
                            // jump over its code.
                            self.asm.b(Label(end_label));
                            self.statement_or_block()?;
                            self.flush()?;
                        }
                    }
                    break;
                }
                if self.token == T_LBRACE {
                    // Dead arm skipped entirely.
                    self.dead_block()?;
                    if self.accept(T_ELSE)? {
                        if self.token == T_IF {
                            continue;
                        }
                        self.statement_or_block()?;
                        self.flush()?;
                    }
                    break;
                }
                // Single-statement dead arm falls through to the
                // generic lowering below.
            }

            self.to_branch(fail_label)?;
            self.statement_or_block()?;
            self.flush()?;

            if self.accept(T_ELSE)? {
                self.asm.b(Label(end_label));
                self.asm.label(Label(fail_label));
                if self.token == T_IF {
                    continue;
                }
                self.statement_or_block()?;
                self.flush()?;
            } else {
                self.asm.label(Label(fail_label));
            }
            break;
        }
        self.asm.label(Label(end_label));
        Ok(())
    }

    pub(crate) fn do_statement(&mut self) -> CompileResult<()> {
        let prev_break = self.lbl_break;
        let prev_continue = self.lbl_continue;

        if !self.accept(T_DO)? {
            return Err(self.unexpected());
        }

        let lbl_test = self.new_label();
        let lbl_break = self.new_label();
        let lbl_next = self.new_label();

        self.lbl_break = Some(lbl_break);
        self.lbl_continue = Some(lbl_test);

        self.flush()?;
        self.asm.label(Label(lbl_next));
        self.block()?;

        if !self.accept(T_WHILE)? {
            return Err(self.unexpected());
        }
        self.asm.label(Label(lbl_test));
        self.paren_expression()?;
        self.to_branch(lbl_break)?;
        self.asm.b(Label(lbl_next));
        self.asm.label(Label(lbl_break));

        self.lbl_break = prev_break;
        self.lbl_continue = prev_continue;
        Ok(())
    }

    pub(crate) fn while_statement(&mut self) -> CompileResult<()> {
        let prev_break = self.lbl_break;
        let prev_continue = self.lbl_continue;

        if !self.accept(T_WHILE)? {
            return Err(self.unexpected());
        }
        let lbl_test = self.new_label();
        let lbl_break = self.new_label();
        self.flush()?;

        self.lbl_break = Some(lbl_break);
        self.lbl_continue = Some(lbl_test);

        self.asm.label(Label(lbl_test));
        self.paren_expression()?;

        let cond = self.syms.get(self.sym_id)?;
        if cond.has_kctv() && cond.kctv == 0 {
            // Statically dead loop.
            self.syms.get_mut(self.sym_id)?.hit_temp();
            if self.token == T_LBRACE {
                self.dead_block()?;
            } else {
                self.asm.b(Label(lbl_break));
                self.statement_or_block()?;
                self.flush()?;
                self.asm.label(Label(lbl_break));
            }
            self.lbl_break = prev_break;
            self.lbl_continue = prev_continue;
            return Ok(());
        }

        self.to_branch(lbl_break)?;
        self.statement_or_block()?;
        self.flush()?;
        self.asm.b(Label(lbl_test));
        self.asm.label(Label(lbl_break));

        self.lbl_break = prev_break;
        self.lbl_continue = prev_continue;
        Ok(())
    }

    pub(crate) fn for_statement(&mut self) -> CompileResult<()> {
        let prev_break = self.lbl_break;
        let prev_continue = self.lbl_continue;

        if !self.accept(T_FOR)? {
            return Err(self.unexpected());
        }
        self.expect(T_LPAREN, '(')?;

        match self.token {
            t if t == T_SEMI => {}
            t if t == T_VAR => {
                self.accept_any()?;
                self.var_decl()?;
            }
            _ => {
                self.expression()?;
                let id = self.sym_id;
                self.hit_tmp(id)?;
            }
        }

        if self.accept(T_OF)? {
            let value_id = self.sym_id;
            self.for_of_statement(value_id)?;
        } else if self.accept(T_IN)? {
            let value_id = self.sym_id;
            self.for_in_statement(value_id)?;
        } else if self.accept(T_SEMI)? {
            self.classic_for()?;
        } else {
            return Err(CompileError::Expected(';'));
        }

        self.lbl_break = prev_break;
        self.lbl_continue = prev_continue;
        Ok(())
    }

    /// `for (v of a)`: iterate the elements with an LDM cursor and a
    /// counter loaded from the array header, decremented to zero.
    fn for_of_statement(&mut self, value_id: SymId) -> CompileResult<()> {
        self.value()?;
        self.expect(T_RPAREN, ')')?;

        let lbl_test = self.new_label();
        let lbl_continue = self.new_label();
        let lbl_enter = self.new_label();
        let lbl_break = self.new_label();

        self.lbl_break = Some(lbl_break);
        self.lbl_continue = Some(lbl_continue);

        let arr_id = self.sym_id;
        let it_id = self.create_tmp()?;
        let max_id = self.create_tmp()?;

        // Header load: counter = length, cursor = payload base.
        self.load(arr_id)?;
        self.sym_id = arr_id;
        self.assign_to(it_id)?;
        self.syms.get_mut(max_id)?.set_kctv((-4i32) as u32);
        self.load(max_id)?;
        self.syms.get_mut(max_id)?.unhit_temp();
        self.load(it_id)?;
        self.syms.get_mut(it_id)?.unhit_temp();
        let max_reg = Reg(self.syms.get(max_id)?.reg);
        let it_reg = Reg(self.syms.get(it_id)?.reg);
        self.asm.ldrh_reg(max_reg, it_reg, max_reg);
        self.asm.cmp_imm(max_reg, 0);
        {
            let m = self.syms.get_mut(max_id)?;
            m.set_dirty();
            let i = self.syms.get_mut(it_id)?;
            i.set_dirty();
            i.clear_kctv();
        }
        self.frame.preserve_flags += 1;
        self.flush()?;
        self.frame.preserve_flags -= 1;
        self.asm.b_cond(Cond::Eq, Label(lbl_break));
        self.syms.get_mut(max_id)?.unhit_temp();

        self.asm.label(Label(lbl_test));
        {
            let val_reg = self.acquire(value_id)?;
            self.load(it_id)?;
            let it_reg = Reg(self.syms.get(it_id)?.reg);
            self.syms.get_mut(value_id)?.reg = val_reg.0;
            self.asm.ldm(it_reg, 1 << val_reg.0);
            let v = self.syms.get_mut(value_id)?;
            v.set_dirty();
            v.clear_kctv();
            let i = self.syms.get_mut(it_id)?;
            i.set_dirty();
            i.unhit_temp();
        }

        self.asm.label(Label(lbl_enter));
        self.statement_or_block()?;

        self.flush()?;
        self.asm.label(Label(lbl_continue));
        self.load(max_id)?;
        self.syms.get_mut(max_id)?.unhit_temp();
        let max_reg = Reg(self.syms.get(max_id)?.reg);
        self.asm.subs_imm(max_reg, 1);
        self.syms.get_mut(max_id)?.set_dirty();
        self.commit(max_id)?;
        self.asm.b_cond(Cond::Ne, Label(lbl_test));
        self.asm.label(Label(lbl_break));

        self.syms.get_mut(max_id)?.hit_temp();
        self.syms.get_mut(it_id)?.hit_temp();
        Ok(())
    }

    /// `for (v in a)`: like `of`, but v takes the index. A literal
    /// array's bound folds into an immediate compare.
    fn for_in_statement(&mut self, value_id: SymId) -> CompileResult<()> {
        self.value()?;
        self.expect(T_RPAREN, ')')?;

        let lbl_test = self.new_label();
        let lbl_continue = self.new_label();
        let lbl_enter = self.new_label();
        let lbl_break = self.new_label();

        self.lbl_break = Some(lbl_break);
        self.lbl_continue = Some(lbl_continue);

        let arr_id = self.sym_id;
        let it_id = self.create_tmp()?;
        let max_id = self.create_tmp()?;
        let mut ubound = 0u32;

        let arr = self.syms.get(arr_id)?;
        if arr.is_in_range(SRAM_BASE, SRAM_BASE + SRAM_SIZE) {
            ubound = self.machine.read_u32(arr.kctv.wrapping_sub(4)).unwrap_or(0) & 0xFFFF;
            self.syms.get_mut(it_id)?.set_kctv(0);
            let value = self.syms.get(value_id)?;
            if !value.has_kctv() || value.kctv != 0 {
                let v = self.syms.get_mut(value_id)?;
                v.set_kctv(0);
                v.set_dirty();
            }
            self.flush()?;
        } else {
            self.load(arr_id)?;
            self.sym_id = arr_id;
            self.assign_to(it_id)?;
            self.load(it_id)?;
            self.syms.get_mut(it_id)?.unhit_temp();
            self.syms.get_mut(max_id)?.set_kctv((-4i32) as u32);
            self.load(max_id)?;
            self.syms.get_mut(max_id)?.unhit_temp();
            let max_reg = Reg(self.syms.get(max_id)?.reg);
            let it_reg = Reg(self.syms.get(it_id)?.reg);
            self.asm.ldrh_reg(max_reg, it_reg, max_reg);
            self.asm.load_imm(it_reg, 0, false);
            self.asm.cmp_imm(max_reg, 0);
            {
                let m = self.syms.get_mut(max_id)?;
                m.set_dirty();
                let i = self.syms.get_mut(it_id)?;
                i.set_dirty();
                i.clear_kctv();
            }
            self.frame.preserve_flags += 1;
            self.flush()?;
            self.frame.preserve_flags -= 1;
            self.asm.b_cond(Cond::Eq, Label(lbl_break));
            self.syms.get_mut(max_id)?.unhit_temp();
        }

        self.asm.label(Label(lbl_enter));
        self.statement_or_block()?;

        self.flush()?;
        self.asm.label(Label(lbl_continue));

        {
            self.load(it_id)?;
            self.syms.get_mut(it_id)?.unhit_temp();
            let it_reg = Reg(self.syms.get(it_id)?.reg);
            self.asm.adds_imm(it_reg, 1);
            {
                let i = self.syms.get_mut(it_id)?;
                i.set_dirty();
                i.clear_kctv();
            }
            if ubound != 0 {
                if ubound <= 0xFF {
                    self.asm.cmp_imm(it_reg, ubound);
                } else {
                    self.asm.load_imm(R7, ubound, true);
                    self.asm.cmp(it_reg, R7);
                }
            } else {
                self.load(max_id)?;
                self.syms.get_mut(max_id)?.unhit_temp();
                let max_reg = Reg(self.syms.get(max_id)?.reg);
                let it_reg = Reg(self.syms.get(it_id)?.reg);
                self.asm.cmp(it_reg, max_reg);
                self.frame.preserve_flags += 1;
                self.spill(max_id)?;
                self.frame.preserve_flags -= 1;
            }
            self.frame.preserve_flags += 1;
            self.spill(it_id)?;
            self.frame.preserve_flags -= 1;
        }

        self.asm.label(Label(lbl_test));
        self.asm.b_cond(Cond::Eq, Label(lbl_break));
        {
            self.load(it_id)?;
            self.syms.get_mut(it_id)?.unhit_temp();
            let it_reg = self.syms.get(it_id)?.reg;
            self.syms.get_mut(value_id)?.reg = it_reg;
            self.frame.preserve_flags += 1;
            self.spill(it_id)?;
            self.frame.preserve_flags -= 1;
            self.alloc.assign(value_id, Reg(it_reg), false);
            {
                let v = self.syms.get_mut(value_id)?;
                v.set_dirty();
                v.clear_kctv();
            }
            self.frame.preserve_flags += 1;
            self.spill(value_id)?;
            self.frame.preserve_flags -= 1;
        }

        self.asm.b(Label(lbl_enter));
        self.asm.label(Label(lbl_break));

        self.syms.get_mut(max_id)?.hit_temp();
        self.syms.get_mut(it_id)?.hit_temp();
        Ok(())
    }

    /// Classic `for(init; cond; step)`: the step body sits at the
    /// continue label and falls through to the test.
    fn classic_for(&mut self) -> CompileResult<()> {
        let mut lbl_test = self.new_label();
        let mut lbl_continue = self.new_label();
        let lbl_enter = self.new_label();
        let lbl_break = self.new_label();

        self.lbl_break = Some(lbl_break);

        self.flush()?;
        if self.accept(T_SEMI)? {
            lbl_test = lbl_enter;
        } else {
            self.asm.label(Label(lbl_test));
            self.expression()?;
            self.to_branch(lbl_break)?;
            self.expect(T_SEMI, ';')?;
        }
        self.flush()?;
        self.asm.b(Label(lbl_enter));

        if self.accept(T_RPAREN)? {
            lbl_continue = lbl_test;
        } else {
            self.asm.label(Label(lbl_continue));
            self.statements()?;
            self.expect(T_RPAREN, ')')?;
            self.flush()?;
        }
        self.lbl_continue = Some(lbl_continue);
        self.asm.b(Label(lbl_test));
        self.asm.label(Label(lbl_enter));

        self.statement_or_block()?;

        self.flush()?;
        self.asm.b(Label(lbl_continue));
        self.asm.label(Label(lbl_break));
        Ok(())
    }

    pub(crate) fn return_statement(&mut self) -> CompileResult<()> {
        if self.frame.scope == 0 {
            return Err(CompileError::ReturnOutsideFunction);
        }
        if !self.accept(T_RETURN)? {
            return Err(self.unexpected());
        }
        if self.accept(T_SEMI)? || self.token == T_RBRACE || self.is_keyword() {
            self.flush()?;
            self.asm.load_imm(Reg(0), 0, false);
        } else {
            self.expression()?;
            let id = self.sym_id;
            self.syms.get_mut(id)?.hit_temp();
            self.commit_all()?;
            self.load_to(id, 0)?;
            self.invalidate_registers(true)?;
        }
        self.asm.b(Label(self.return_label));
        Ok(())
    }

    pub(crate) fn break_statement(&mut self) -> CompileResult<()> {
        self.accept_any()?;
        let Some(label) = self.lbl_break else {
            return Err(CompileError::BreakOutsideLoop);
        };
        self.flush()?;
        self.asm.b(Label(label));
        Ok(())
    }

    pub(crate) fn continue_statement(&mut self) -> CompileResult<()> {
        self.accept_any()?;
        let Some(label) = self.lbl_continue else {
            return Err(CompileError::ContinueOutsideLoop);
        };
        self.flush()?;
        self.asm.b(Label(label));
        Ok(())
    }
}
