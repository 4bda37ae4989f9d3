//! Expression parsing and lowering.
//!
//! Every operator first tries to fold: two known compile-time operands
//! produce a new known temporary without emission. Otherwise lowering
//! picks the cheapest viable strategy: an immediate form when one
//! operand is a small constant, a register form, or a helper call for
//! division. Comparisons leave their result in the CPU flags, tagged on
//! the symbol, until a branch or a value use consumes them.

use std::io::{Read, Seek, Write};

use crate::asm::{Assembler, Reg, R1, R2, R7};
use crate::consts::{DATA_BASE, MAX_ARRAY_LITERAL, NATIVE_BASE, NATIVE_IDIV, NATIVE_IDIVMOD};
use crate::error::{CompileError, CompileResult};
use crate::fingerprint::{step, STRING_SEED};
use crate::sym::{SymId, SymbolKind, INVALID_REG, INVALID_SYM};

use super::*;

type RegOp = fn(&mut Assembler, Reg, Reg);
type ImmOp = fn(&mut Assembler, Reg, u32);

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    /// Fold a binary operator over two known values.
    pub(crate) fn fold(&self, l: u32, op: u32, r: u32) -> CompileResult<(u32, SymbolKind)> {
        use SymbolKind::{Bool, S32, U32};
        let signed = |v: bool| (v as u32, Bool);
        let value = match op {
            T_PLUS => (l.wrapping_add(r), S32),
            T_MINUS => (l.wrapping_sub(r), S32),
            T_STAR => ((l as i32).wrapping_mul(r as i32) as u32, S32),
            T_SLASH => {
                if r == 0 {
                    return Err(CompileError::DivisionByZero);
                }
                ((l as i32).wrapping_div(r as i32) as u32, S32)
            }
            T_PERCENT => {
                if r == 0 {
                    return Err(CompileError::DivisionByZero);
                }
                ((l as i32).wrapping_rem(r as i32) as u32, S32)
            }
            T_SHL => (l.wrapping_shl(r & 31), S32),
            T_SHR => (((l as i32) >> (r & 31)) as u32, S32),
            T_USHR => (l >> (r & 31), U32),
            T_AND => (l & r, S32),
            T_OR => (l | r, S32),
            T_XOR => (l ^ r, S32),
            T_ANDAND => ((l != 0 && r != 0) as u32, S32),
            T_OROR => ((l != 0 || r != 0) as u32, S32),
            T_LT => signed((l as i32) < (r as i32)),
            T_GT => signed((l as i32) > (r as i32)),
            T_LE => signed((l as i32) <= (r as i32)),
            T_GE => signed((l as i32) >= (r as i32)),
            T_EQ | T_SEQ => signed(l == r),
            T_NE | T_SNE => signed(l != r),
            _ => return Err(CompileError::OperatorNotImplemented),
        };
        Ok(value)
    }

    /// Lower a binary operator with at least one non-constant operand.
    /// `assign_id` carries the in-place destination for compound
    /// assignments (equal to `lsym_id` unless the target was a deref).
    pub(crate) fn do_non_const_op(
        &mut self,
        lsym_id: SymId,
        op: u32,
        rsym_id: SymId,
        assign_id: Option<SymId>,
    ) -> CompileResult<()> {
        let do_assign = assign_id == Some(lsym_id);
        let tmp_id = if do_assign { INVALID_SYM } else { self.create_tmp()? };
        let mut rename = INVALID_SYM;

        let mut reg_op: Option<RegOp> = None;
        let mut imm_op: Option<ImmOp> = None;
        let mut rkctv = self.syms.get(rsym_id)?.kctv;

        match op {
            T_XOR => reg_op = Some(|a, rd, rm| a.eors(rd, rm)),
            T_OROR | T_OR => reg_op = Some(|a, rd, rm| a.orrs(rd, rm)),
            T_AND => reg_op = Some(|a, rd, rm| a.ands(rd, rm)),
            T_ANDAND | T_STAR => reg_op = Some(|a, rd, rm| a.muls(rd, rm)),

            T_SLASH | T_PERCENT => {
                let rsym = self.syms.get(rsym_id)?;
                if rsym.has_kctv() {
                    rename = lsym_id;
                    if rkctv == 0 {
                        return Err(CompileError::DivisionByZero);
                    }
                    let mut shifts = 0;
                    while shifts < 32 && rkctv > (1u32 << shifts) {
                        shifts += 1;
                    }
                    // 2^31 is a negative divisor in signed terms; it
                    // takes the helper like any other.
                    let is_pot = shifts < 31 && rkctv == 1 << shifts;
                    if op == T_PERCENT {
                        if rkctv == 1 {
                            imm_op = Some(|a, rd, imm| a.movs_imm(rd, imm));
                            rkctv = 0;
                        } else if is_pot {
                            // Signed remainder: bias negative values,
                            // mask, unbias. Truncates toward zero like
                            // the helper.
                            imm_op = Some(|a: &mut Assembler, rd: Reg, bits: u32| {
                                a.asrs_imm(R7, rd, 31);
                                a.lsrs_imm(R7, R7, 32 - bits);
                                a.adds(rd, rd, R7);
                                a.mask_low(rd, bits);
                                a.subs(rd, rd, R7);
                            });
                            rkctv = shifts;
                        }
                    } else if rkctv == 1 {
                        // Division by one: materialize unchanged.
                        imm_op = Some(|a, rd, _| a.lsls_imm(rd, rd, 0));
                        rkctv = 0;
                    } else if is_pot {
                        // Signed quotient: bias before the arithmetic
                        // shift so negative dividends round toward
                        // zero.
                        imm_op = Some(|a: &mut Assembler, rd: Reg, bits: u32| {
                            a.asrs_imm(R7, rd, 31);
                            a.lsrs_imm(R7, R7, 32 - bits);
                            a.adds(rd, rd, R7);
                            a.asrs_imm(rd, rd, bits);
                        });
                        rkctv = shifts;
                    }
                }

                if imm_op.is_none() {
                    return self.div_helper_call(lsym_id, op, rsym_id, do_assign, tmp_id);
                }
            }

            T_PLUS => {
                let lsym = self.syms.get(lsym_id)?;
                let rsym = self.syms.get(rsym_id)?;
                if lsym.is_in_range(0, 0xFF) {
                    // Commutative: add the small left constant into the
                    // right operand's register.
                    self.syms.get_mut(lsym_id)?.hit_temp();
                    self.load(rsym_id)?;
                    self.commit(rsym_id)?;
                    let rreg = Reg(self.syms.get(rsym_id)?.reg);
                    self.asm.adds_imm(rreg, lsym.kctv);
                    rename = rsym_id;
                } else if rsym.is_in_range(0, 0xFF) {
                    imm_op = Some(|a, rd, imm| a.adds_imm(rd, imm));
                } else {
                    reg_op = Some(|a, rd, rm| a.adds(rd, rd, rm));
                }
            }

            T_SHL => {
                if self.syms.get(rsym_id)?.is_in_range(0, 0x1F) {
                    imm_op = Some(|a, rd, imm| a.lsls_imm(rd, rd, imm));
                } else {
                    reg_op = Some(|a, rd, rm| a.lsls(rd, rm));
                }
            }
            T_USHR => {
                // imm5 zero means shift-by-32; zero takes the register
                // form, where a zero count is a no-op.
                if self.syms.get(rsym_id)?.is_in_range(1, 0x1F) {
                    imm_op = Some(|a, rd, imm| a.lsrs_imm(rd, rd, imm));
                } else {
                    reg_op = Some(|a, rd, rm| a.lsrs(rd, rm));
                }
            }
            T_SHR => {
                if self.syms.get(rsym_id)?.is_in_range(1, 0x1F) {
                    imm_op = Some(|a, rd, imm| a.asrs_imm(rd, rd, imm));
                } else {
                    reg_op = Some(|a, rd, rm| a.asrs(rd, rm));
                }
            }
            T_MINUS => {
                if self.syms.get(rsym_id)?.is_in_range(0, 0xFF) {
                    imm_op = Some(|a, rd, imm| a.subs_imm(rd, imm));
                } else {
                    reg_op = Some(|a, rd, rm| a.subs(rd, rd, rm));
                }
            }

            T_GT | T_GE | T_LT | T_LE | T_EQ | T_NE | T_SEQ | T_SNE => {
                return self.compare_op(lsym_id, op, rsym_id, tmp_id);
            }

            _ => return Err(CompileError::OperatorNotImplemented),
        }

        if let Some(f) = imm_op {
            self.syms.get_mut(rsym_id)?.hit_temp();
            self.load(lsym_id)?;
            if do_assign {
                self.syms.get_mut(lsym_id)?.set_dirty();
            } else {
                self.commit(lsym_id)?;
            }
            let lreg = Reg(self.syms.get(lsym_id)?.reg);
            f(&mut self.asm, lreg, rkctv);
            rename = lsym_id;
        }

        if let Some(f) = reg_op {
            self.load(rsym_id)?;
            self.load(lsym_id)?;
            if do_assign {
                self.syms.get_mut(lsym_id)?.set_dirty();
            } else {
                self.commit(lsym_id)?;
            }
            let lreg = Reg(self.syms.get(lsym_id)?.reg);
            let rreg = Reg(self.syms.get(rsym_id)?.reg);
            f(&mut self.asm, lreg, rreg);
            rename = lsym_id;
        }

        self.sym_id = rename;

        match assign_id {
            Some(aid) if aid != lsym_id => {
                // Compound assignment through a deref target.
                let ptr_reg = self.load(aid)?;
                let val_id = self.sym_id;
                self.load(val_id)?;
                self.syms.get_mut(val_id)?.unhit_temp();
                let val_reg = Reg(self.syms.get(val_id)?.reg);
                self.asm.str(val_reg, ptr_reg, 0);
            }
            Some(aid) => self.assign_to(aid)?,
            None => {
                let src_id = self.sym_id;
                let src_reg = self.syms.get(src_id)?.reg;
                self.alloc.assign(tmp_id, Reg(src_reg), false);
                {
                    let t = self.syms.get_mut(tmp_id)?;
                    t.reg = src_reg;
                    t.clear_kctv();
                }
                self.syms.get_mut(src_id)?.reg = INVALID_REG;
                self.sym_id = tmp_id;
            }
        }
        Ok(())
    }

    /// `/` and `%` with a non-constant divisor: marshal into R0/R1 and
    /// call the division helper through R2.
    fn div_helper_call(
        &mut self,
        lsym_id: SymId,
        op: u32,
        rsym_id: SymId,
        do_assign: bool,
        tmp_id: SymId,
    ) -> CompileResult<()> {
        self.commit_scratch()?;
        // Marshaling reassigns R0-R3; stale residency there would copy
        // from the wrong register.
        self.invalidate_registers(false)?;
        self.spill_reg(R2)?;
        let helper = if op == T_PERCENT { NATIVE_IDIVMOD } else { NATIVE_IDIV };
        self.asm.load_imm(R2, NATIVE_BASE + (helper << 2) | 1, false);
        self.alloc.hold(R2);

        self.load_to(rsym_id, 1)?;
        self.alloc.assign(rsym_id, R1, false);
        self.load_to(lsym_id, 0)?;
        self.alloc.assign(lsym_id, Reg(0), false);

        self.asm.blx(R2);
        self.alloc.release(R2);
        self.invalidate_registers(false)?;

        let out_id = if do_assign { lsym_id } else { tmp_id };
        let out_reg = (op == T_PERCENT) as u8;
        {
            let t = self.syms.get_mut(out_id)?;
            t.reg = out_reg;
            t.clear_kctv();
        }
        self.alloc.assign(out_id, Reg(out_reg), false);

        self.syms.get_mut(rsym_id)?.hit_temp();
        self.syms.get_mut(lsym_id)?.hit_temp();
        self.sym_id = out_id;
        Ok(())
    }

    /// Comparison: subtract and tag the result with the condition that
    /// fails it. The flags are consumed by the next branch, or
    /// materialized to 0/1 on a value use.
    fn compare_op(
        &mut self,
        lsym_id: SymId,
        op: u32,
        rsym_id: SymId,
        tmp_id: SymId,
    ) -> CompileResult<()> {
        let lsym = self.syms.get(lsym_id)?;
        let rsym = self.syms.get(rsym_id)?;
        let mut rename = lsym_id;
        // Mirrors when the subtraction direction flips.
        let mut swapped = false;

        if rsym.is_in_range(0, 255) {
            self.load(lsym_id)?;
            self.commit(lsym_id)?;
            self.syms.get_mut(rsym_id)?.hit_temp();
            let lreg = Reg(self.syms.get(lsym_id)?.reg);
            self.asm.subs_imm(lreg, rsym.kctv);
        } else if lsym.is_in_range(0, 255) {
            self.syms.get_mut(lsym_id)?.hit_temp();
            self.load(rsym_id)?;
            self.commit(rsym_id)?;
            let rreg = Reg(self.syms.get(rsym_id)?.reg);
            self.asm.subs_imm(rreg, lsym.kctv);
            rename = rsym_id;
            swapped = true;
        } else {
            self.load(rsym_id)?;
            self.load(lsym_id)?;
            self.commit(lsym_id)?;
            let lreg = Reg(self.syms.get(lsym_id)?.reg);
            let rreg = Reg(self.syms.get(rsym_id)?.reg);
            self.asm.subs(lreg, lreg, rreg);
        }

        self.sym_id = rename;
        self.assign_to(tmp_id)?;
        let kind = match (op, swapped) {
            (T_EQ | T_SEQ, _) => SymbolKind::CastNe,
            (T_NE | T_SNE, _) => SymbolKind::CastEq,
            (T_GE, false) | (T_LE, true) => SymbolKind::CastLt,
            (T_LE, false) | (T_GE, true) => SymbolKind::CastGt,
            (T_GT, false) | (T_LT, true) => SymbolKind::CastLe,
            _ => SymbolKind::CastGe,
        };
        self.syms.get_mut(tmp_id)?.kind = kind;
        Ok(())
    }

    /// Assignment operators, plain and compound. A deref left side is
    /// read through its address into a fresh temporary first.
    pub(crate) fn do_assign_expression(
        &mut self,
        lsym_id: SymId,
        op: u32,
        rsym_id: SymId,
    ) -> CompileResult<()> {
        if op == T_ASSIGN {
            self.sym_id = rsym_id;
            self.assign_to(lsym_id)?;
            return Ok(());
        }

        let mut assign_id = lsym_id;
        let mut lsym_id = lsym_id;
        if self.syms.get(lsym_id)?.is_deref() {
            assign_id = lsym_id;
            let tmp = self.create_tmp()?;
            let reg = self.acquire(tmp)?;
            self.syms.get_mut(assign_id)?.clear_deref();
            self.load(assign_id)?;
            self.syms.get_mut(assign_id)?.unhit_temp();
            {
                let t = self.syms.get_mut(tmp)?;
                t.reg = reg.0;
                t.clear_kctv();
            }
            let addr_reg = Reg(self.syms.get(assign_id)?.reg);
            self.asm.ldr(reg, addr_reg, 0);
            lsym_id = tmp;
        }

        let lsym = self.syms.get(lsym_id)?;
        let rsym = self.syms.get(rsym_id)?;
        if lsym.has_kctv() && rsym.has_kctv() {
            let (value, kind) = self.fold(lsym.kctv, op, rsym.kctv)?;
            let s = self.syms.get_mut(lsym_id)?;
            s.set_kctv(value);
            s.kind = kind;
            self.sym_id = lsym_id;
        } else {
            self.do_non_const_op(lsym_id, op, rsym_id, Some(assign_id))?;
        }
        self.syms.get_mut(rsym_id)?.hit_temp();
        Ok(())
    }

    pub(crate) fn paren_expression(&mut self) -> CompileResult<()> {
        self.expect(T_LPAREN, '(')?;
        loop {
            self.simple_expression()?;
            if !self.accept(T_COMMA)? {
                break;
            }
        }
        self.expect(T_RPAREN, ')')
    }

    pub(crate) fn unary_expression(&mut self) -> CompileResult<()> {
        let op = self.token;
        let is_unary = self.is_unary_op(op);
        if is_unary {
            self.accept_any()?;
        }
        if self.is_unary_op(self.token) {
            self.unary_expression()?;
        } else {
            self.value()?;
        }
        if !is_unary {
            return Ok(());
        }

        let id = self.sym_id;
        let sym = self.syms.get(id)?;
        if sym.has_kctv() {
            let kctv = sym.kctv;
            let tmp = self.create_tmp()?;
            self.syms.get_mut(id)?.hit_temp();
            let folded = match op {
                T_MINUS => kctv.wrapping_neg(),
                T_PLUS => kctv,
                T_NOT => (kctv == 0) as u32,
                T_TILDE => !kctv,
                T_INC | T_DEC => {
                    let next =
                        if op == T_INC { kctv.wrapping_add(1) } else { kctv.wrapping_sub(1) };
                    self.syms.get_mut(id)?.set_kctv(next);
                    next
                }
                _ => return Err(self.unexpected()),
            };
            self.syms.get_mut(tmp)?.set_kctv(folded);
            self.sym_id = tmp;
            return Ok(());
        }

        match op {
            T_MINUS | T_TILDE => {
                let tmp = self.create_tmp()?;
                self.load(id)?;
                let reg = self.acquire(tmp)?;
                {
                    let t = self.syms.get_mut(tmp)?;
                    t.reg = reg.0;
                    t.clear_kctv();
                    if op == T_TILDE {
                        t.set_dirty();
                    }
                }
                let src = Reg(self.syms.get(id)?.reg);
                if op == T_MINUS {
                    self.asm.rsbs(reg, src);
                } else {
                    self.asm.mvns(reg, src);
                }
                self.sym_id = tmp;
            }
            T_PLUS => {}
            T_INC | T_DEC => {
                if self.syms.get(id)?.is_deref() {
                    // Prefix through an address: read, modify, write.
                    let tmp = self.create_tmp()?;
                    let reg = self.acquire(tmp)?;
                    self.syms.get_mut(id)?.clear_deref();
                    self.load_to(id, R7.0)?;
                    self.asm.ldr(reg, R7, 0);
                    if op == T_INC {
                        self.asm.adds_imm(reg, 1);
                    } else {
                        self.asm.subs_imm(reg, 1);
                    }
                    self.asm.str(reg, R7, 0);
                    let t = self.syms.get_mut(tmp)?;
                    t.reg = reg.0;
                    t.clear_kctv();
                    self.sym_id = tmp;
                } else {
                    let reg = self.load(id)?;
                    if op == T_INC {
                        self.asm.adds_imm(reg, 1);
                    } else {
                        self.asm.subs_imm(reg, 1);
                    }
                    self.syms.get_mut(id)?.set_dirty();
                }
            }
            T_NOT => {
                let tmp = self.create_tmp()?;
                let reg = self.acquire(tmp)?;
                self.load(id)?;
                let src = Reg(self.syms.get(id)?.reg);
                self.asm.subs_imm3(reg, src, 0);
                let t = self.syms.get_mut(tmp)?;
                t.reg = reg.0;
                t.clear_kctv();
                t.set_dirty();
                t.kind = SymbolKind::CastNe;
                self.sym_id = tmp;
            }
            _ => return Err(self.unexpected()),
        }
        Ok(())
    }

    pub(crate) fn postfix_operator(&mut self) -> CompileResult<()> {
        if self.sym_id == INVALID_SYM {
            return Err(self.unexpected());
        }
        match self.token {
            T_DEC | T_INC => {
                let op = self.token;
                self.accept_any()?;
                let id = self.sym_id;
                let sym = self.syms.get(id)?;
                if sym.is_deref() {
                    // Postfix through an address: write the modified
                    // value back, keep the original.
                    let tmp = self.create_tmp()?;
                    let reg = self.acquire(tmp)?;
                    self.syms.get_mut(id)?.clear_deref();
                    self.load_to(id, R7.0)?;
                    self.asm.ldr(reg, R7, 0);
                    if op == T_INC {
                        self.asm.adds_imm(reg, 1);
                        self.asm.str(reg, R7, 0);
                        self.asm.subs_imm(reg, 1);
                    } else {
                        self.asm.subs_imm(reg, 1);
                        self.asm.str(reg, R7, 0);
                        self.asm.adds_imm(reg, 1);
                    }
                    let t = self.syms.get_mut(tmp)?;
                    t.reg = reg.0;
                    t.clear_kctv();
                    self.sym_id = tmp;
                } else if sym.has_kctv() {
                    let kctv = sym.kctv;
                    let next =
                        if op == T_INC { kctv.wrapping_add(1) } else { kctv.wrapping_sub(1) };
                    self.syms.get_mut(id)?.set_kctv(next);
                    let tmp = self.create_tmp()?;
                    self.syms.get_mut(tmp)?.set_kctv(kctv);
                    self.sym_id = tmp;
                } else {
                    self.load(id)?;
                    let tmp = self.create_tmp()?;
                    let reg = self.acquire(tmp)?;
                    let old = Reg(self.syms.get(id)?.reg);
                    if op == T_INC {
                        self.asm.adds_imm3(reg, old, 1);
                    } else {
                        self.asm.subs_imm3(reg, old, 1);
                    }
                    // The temporary keeps the old value in the old
                    // register; the symbol moves to the new one.
                    self.alloc.assign(tmp, old, false);
                    self.alloc.assign(id, reg, false);
                    {
                        let t = self.syms.get_mut(tmp)?;
                        t.reg = old.0;
                        t.clear_kctv();
                    }
                    let s = self.syms.get_mut(id)?;
                    s.reg = reg.0;
                    s.set_dirty();
                    self.sym_id = tmp;
                }
            }
            T_LBRACKET => {
                self.accept_any()?;
                let base_id = self.sym_id;
                self.expression()?;
                self.expect(T_RBRACKET, ']')?;
                let index_id = self.sym_id;
                let tmp = self.create_tmp()?;
                self.syms.get_mut(index_id)?.hit_temp();
                self.syms.get_mut(base_id)?.hit_temp();
                let base = self.syms.get(base_id)?;
                let index = self.syms.get(index_id)?;
                if base.has_kctv() && index.has_kctv() {
                    let addr = base.kctv.wrapping_add(index.kctv.wrapping_mul(4));
                    self.syms.get_mut(tmp)?.set_kctv(addr);
                } else {
                    self.load(base_id)?;
                    self.load(index_id)?;
                    let reg = Reg(self.syms.get(index_id)?.reg);
                    self.spill(index_id)?;
                    self.alloc.assign(tmp, reg, false);
                    let base_reg = Reg(self.syms.get(base_id)?.reg);
                    self.asm.lsls_imm(R7, reg, 2);
                    self.asm.adds(reg, base_reg, R7);
                    let t = self.syms.get_mut(tmp)?;
                    t.reg = reg.0;
                    t.clear_kctv();
                }
                self.syms.get_mut(tmp)?.set_deref();
                self.sym_id = tmp;
            }
            T_LPAREN => {
                let fnc = self.sym_id;
                let (argc, argv) = self.call_args()?;
                self.write_call(fnc, argc, &argv)?;
            }
            _ => return Err(self.unexpected()),
        }
        Ok(())
    }

    pub(crate) fn value(&mut self) -> CompileResult<()> {
        let require_call = self.accept(T_NEW)?;
        if self.token == T_LBRACKET {
            self.array_literal()?;
        } else if self.token == T_LPAREN {
            self.paren_expression()?;
        } else if self.accept(T_TRUE)? {
            let tmp = self.create_tmp()?;
            self.syms.get_mut(tmp)?.set_kctv(1);
            self.sym_id = tmp;
        } else if self.accept(T_FALSE)? || self.accept(T_NULL)? || self.accept(T_UNDEFINED)? {
            let tmp = self.create_tmp()?;
            self.syms.get_mut(tmp)?.set_kctv(0);
            self.sym_id = tmp;
        } else if self.tok.is_numeric() {
            let tmp = self.create_tmp()?;
            let value = self.tok.numeric();
            self.syms.get_mut(tmp)?.set_kctv(value);
            self.sym_id = tmp;
            self.accept_any()?;
        } else if self.tok.is_string() {
            self.string_literal()?;
        } else if self.is_name() {
            self.sym_id = self.find_or_create(self.frame.scope)?;
        } else {
            return Err(self.unexpected());
        }
        if require_call && self.token != T_LPAREN {
            let fnc = self.sym_id;
            self.write_call(fnc, 0, &[])?;
        }
        while self.is_postfix_op(self.token) {
            self.postfix_operator()?;
        }
        Ok(())
    }

    /// Array literal: elements must be compile-time constants, staged
    /// through the data section and copied into a pinned heap array.
    pub(crate) fn array_literal(&mut self) -> CompileResult<()> {
        self.expect(T_LBRACKET, '[')?;
        self.machine.gc_lock();
        let result = self.array_literal_body();
        self.machine.gc_unlock();
        result
    }

    fn array_literal_body(&mut self) -> CompileResult<()> {
        let start = self.array_stage;
        while self.tok.class() != crate::token::TokenClass::Eof {
            if self.array_stage as usize >= MAX_ARRAY_LITERAL {
                return Err(CompileError::ArrayTooBig);
            }
            self.simple_expression()?;
            let sym = self.syms.get(self.sym_id)?;
            if !sym.has_kctv() {
                return Err(CompileError::ArrayElementNotKnown);
            }
            self.machine
                .write_u32(DATA_BASE + self.array_stage * 4, sym.kctv)
                .ok_or(CompileError::ArrayTooBig)?;
            self.array_stage += 1;
            self.syms.get_mut(self.sym_id)?.hit_temp();
            if !self.accept(T_COMMA)? {
                break;
            }
        }
        self.expect(T_RBRACKET, ']')?;

        let count = self.array_stage - start;
        let out = self
            .machine
            .alloc_root(count)
            .map_err(CompileError::ConstEval)?;
        for i in 0..count {
            let v = self.machine.read_u32(DATA_BASE + (start + i) * 4).unwrap_or(0);
            let _ = self.machine.write_u32(out + i * 4, v);
        }
        self.array_stage = start;

        let tmp = self.create_tmp()?;
        self.syms.get_mut(tmp)?.set_kctv(out);
        self.sym_id = tmp;
        Ok(())
    }

    /// String literal: fingerprint and intern the body, yielding the
    /// fingerprint as the value.
    pub(crate) fn string_literal(&mut self) -> CompileResult<()> {
        let mut hash = STRING_SEED;
        let mut bytes = Vec::new();
        while self.tok.is_string() {
            let mut ch = self.tok.text().first().copied().unwrap_or(0);
            if ch == b'\\' {
                self.accept_any()?;
                if !self.tok.is_string() {
                    break;
                }
                ch = match self.tok.text().first().copied().unwrap_or(0) {
                    b'n' => b'\n',
                    other => other,
                };
            }
            if ch != 0 {
                hash = step(hash, ch);
                bytes.push(ch);
            }
            self.accept_any()?;
        }
        if let Some(file) = self.res.write(hash)? {
            file.write_all(&bytes)?;
            file.write_all(&[0])?;
        }
        let tmp = self.create_tmp()?;
        self.syms.get_mut(tmp)?.set_kctv(hash);
        self.sym_id = tmp;
        Ok(())
    }

    /* precedence chain */

    pub(crate) fn mul_expression(&mut self) -> CompileResult<()> {
        self.unary_expression()?;
        while Self::is_mul_op(self.token) {
            let lsym = self.sym_id;
            let op = self.token;
            self.accept_any()?;
            self.unary_expression()?;
            self.binary_tail(lsym, op)?;
        }
        Ok(())
    }

    pub(crate) fn sum_expression(&mut self) -> CompileResult<()> {
        self.mul_expression()?;
        while Self::is_sum_op(self.token) {
            let lsym = self.sym_id;
            let op = self.token;
            self.accept_any()?;
            self.mul_expression()?;
            self.binary_tail(lsym, op)?;
        }
        Ok(())
    }

    pub(crate) fn compare_expression(&mut self) -> CompileResult<()> {
        self.sum_expression()?;
        while Self::is_compare_op(self.token) {
            let lsym = self.sym_id;
            let op = self.token;
            self.accept_any()?;
            self.sum_expression()?;
            self.binary_tail(lsym, op)?;
        }
        Ok(())
    }

    pub(crate) fn logic_expression(&mut self) -> CompileResult<()> {
        self.compare_expression()?;
        while Self::is_logic_op(self.token) {
            let lsym = self.sym_id;
            let op = self.token;
            self.accept_any()?;
            self.compare_expression()?;
            self.binary_tail(lsym, op)?;
        }
        Ok(())
    }

    fn binary_tail(&mut self, lsym: SymId, op: u32) -> CompileResult<()> {
        let rsym = self.sym_id;
        let l = self.syms.get(lsym)?;
        let r = self.syms.get(rsym)?;
        if l.has_kctv() && r.has_kctv() {
            let (value, kind) = self.fold(l.kctv, op, r.kctv)?;
            let tmp = self.create_tmp()?;
            let t = self.syms.get_mut(tmp)?;
            t.set_kctv(value);
            t.kind = kind;
            self.sym_id = tmp;
        } else {
            self.do_non_const_op(lsym, op, rsym, None)?;
        }
        self.syms.get_mut(rsym)?.hit_temp();
        self.syms.get_mut(lsym)?.hit_temp();
        Ok(())
    }

    pub(crate) fn simple_expression(&mut self) -> CompileResult<()> {
        self.logic_expression()?;
        while self.is_assign_op() {
            let lsym = self.sym_id;
            if lsym == INVALID_SYM {
                return Err(self.unexpected());
            }
            let op = Self::strip_assign(self.token);
            self.accept_any()?;
            self.logic_expression()?;
            let rsym = self.sym_id;
            self.do_assign_expression(lsym, op, rsym)?;
            let result = self.sym_id;
            self.hit_tmp(result)?;
        }
        Ok(())
    }

    pub(crate) fn expression(&mut self) -> CompileResult<()> {
        loop {
            self.simple_expression()?;
            if !self.accept(T_COMMA)? {
                return Ok(());
            }
        }
    }
}
