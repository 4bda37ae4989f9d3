//! Symbol storage protocol: commit, spill, load.
//!
//! A symbol's value is authoritative in exactly one place at a time. A
//! commit stores a dirty register back to its memory slot without
//! evicting; a spill additionally frees the register. Loads materialize
//! from KCTV, register or memory, resolving deref and flag-carrying
//! states on the way.

use std::io::{Read, Seek, Write};

use tracing::trace;

use crate::asm::{Assembler, Cond, Reg, R7};
use crate::consts::{ALLOC_REGS, SCRATCH_REGS};
use crate::error::{CompileError, CompileResult};
use crate::regalloc::{RegAlloc, Spill};
use crate::store::PagedStore;
use crate::sym::{SymId, Symbol, SymbolKind, INVALID_REG, INVALID_SYM};

use super::Compiler;

/// Per-function emission state shared with the spill context.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub scope: u16,
    pub global_scope_size: u32,
    pub scope_size: u32,
    /// While positive, flag-clobbering materializations are suppressed
    /// because the CPU flags must survive until a pending branch.
    pub preserve_flags: u32,
}

impl Frame {
    pub(crate) fn alloc_slot(&mut self, sym: &mut Symbol) {
        if sym.address != crate::sym::INVALID_ADDRESS {
            return;
        }
        if sym.is_in_stack() {
            sym.address = self.scope_size as u16;
            self.scope_size += 1;
        } else {
            sym.address = self.global_scope_size as u16;
            self.global_scope_size += 1;
        }
    }
}

/// Materialize a flag-carrying comparison into a 0/1 value in the
/// symbol's register. No-op for plain values or register-less symbols.
pub(crate) fn bool_cast(asm: &mut Assembler, sym: &mut Symbol) {
    if !RegAlloc::is_valid(sym.reg) {
        return;
    }
    let reg = Reg(sym.reg);
    match sym.kind {
        SymbolKind::CastEq => {
            asm.subs_imm3(R7, reg, 1);
            asm.sbcs(reg, R7);
        }
        SymbolKind::CastNe => {
            asm.rsbs(R7, reg);
            asm.adcs(reg, R7);
        }
        SymbolKind::CastLe => {
            asm.subs_imm(reg, 1);
            asm.mvns(reg, reg);
            asm.lsrs_imm(reg, reg, 31);
        }
        SymbolKind::CastLt => {
            asm.mvns(reg, reg);
            asm.lsrs_imm(reg, reg, 31);
        }
        SymbolKind::CastGt => {
            asm.subs_imm(reg, 1);
            asm.lsrs_imm(reg, reg, 31);
        }
        SymbolKind::CastGe => {
            asm.lsrs_imm(reg, reg, 31);
        }
        _ => return,
    }
    sym.kind = SymbolKind::Bool;
}

/// The slice of the compiler an eviction callback may touch. Victims
/// always hold a register, so committing one never re-enters the
/// allocator.
pub(crate) struct SpillCtx<'a, F> {
    pub syms: &'a mut PagedStore<Symbol, F>,
    pub asm: &'a mut Assembler,
    pub frame: &'a mut Frame,
    pub failed: Option<CompileError>,
}

impl<F: Read + Write + Seek> SpillCtx<'_, F> {
    /// Commit `id` to its memory slot. KCTV-only symbols record their
    /// value as the memory-init instead of emitting.
    pub(crate) fn commit(&mut self, id: SymId) -> CompileResult<()> {
        let mut sym = self.syms.get(id)?;
        if !sym.is_dirty() || sym.was_hit() {
            return Ok(());
        }
        trace!(sym = id, reg = sym.reg, "commit");
        sym.clear_dirty();
        if sym.has_kctv() && !sym.mem_init() {
            sym.set_mem_init(sym.kctv);
        }
        if !RegAlloc::is_valid(sym.reg) {
            self.syms.put(id, sym)?;
            return Ok(());
        }
        bool_cast(self.asm, &mut sym);
        self.frame.alloc_slot(&mut sym);
        let reg = Reg(sym.reg);
        let preserve = self.frame.preserve_flags > 0;
        if sym.is_in_stack() {
            self.asm.str_sp(reg, u32::from(sym.address) << 2);
        } else {
            let (bank, offset) = super::global_bank(sym.address);
            self.asm.load_imm(R7, bank, preserve);
            self.asm.str(reg, R7, offset);
        }
        self.syms.put(id, sym)?;
        Ok(())
    }
}

impl<F: Read + Write + Seek> Spill for SpillCtx<'_, F> {
    fn spill(&mut self, sym: SymId) {
        let result = (|| {
            self.commit(sym)?;
            let s = self.syms.get_mut(sym)?;
            if RegAlloc::is_valid(s.reg) {
                s.reg = INVALID_REG;
            }
            Ok(())
        })();
        if let Err(e) = result {
            if self.failed.is_none() {
                self.failed = Some(e);
            }
        }
    }
}

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    /// Register for `id`, allocating and spilling a victim if needed.
    pub(crate) fn acquire(&mut self, id: SymId) -> CompileResult<Reg> {
        let Self { alloc, syms, asm, frame, .. } = self;
        let mut ctx = SpillCtx { syms, asm, frame, failed: None };
        let reg = alloc.acquire(id, &mut ctx);
        match ctx.failed {
            Some(e) => Err(e),
            None => Ok(reg),
        }
    }

    pub(crate) fn with_ctx<R>(&mut self, f: impl FnOnce(&mut SpillCtx<'_, F>) -> R) -> R {
        let Self { syms, asm, frame, .. } = self;
        let mut ctx = SpillCtx { syms, asm, frame, failed: None };
        f(&mut ctx)
    }

    /// Commit, materializing a register-less KCTV first.
    pub(crate) fn commit(&mut self, id: SymId) -> CompileResult<()> {
        let sym = self.syms.get(id)?;
        if sym.is_dirty() && !sym.was_hit() && !RegAlloc::is_valid(sym.reg) && sym.has_kctv() {
            let reg = self.acquire(id)?;
            let kctv = {
                let s = self.syms.get_mut(id)?;
                s.reg = reg.0;
                s.kctv
            };
            let preserve = self.frame.preserve_flags > 0;
            self.asm.load_imm(reg, kctv, preserve);
        }
        self.with_ctx(|ctx| ctx.commit(id))
    }

    /// Commit and free the register.
    pub(crate) fn spill(&mut self, id: SymId) -> CompileResult<()> {
        self.commit(id)?;
        let reg = self.syms.get(id)?.reg;
        if RegAlloc::is_valid(reg) {
            self.alloc.invalidate(Reg(reg));
            self.syms.get_mut(id)?.reg = INVALID_REG;
        }
        Ok(())
    }

    pub(crate) fn spill_reg(&mut self, reg: Reg) -> CompileResult<()> {
        let id = self.alloc.sym_at(reg);
        if id != INVALID_SYM {
            self.spill(id)?;
        }
        Ok(())
    }

    /// Forget register residency without emitting. Scratch-only unless
    /// `all`.
    pub(crate) fn invalidate_registers(&mut self, all: bool) -> CompileResult<()> {
        let count = if all { ALLOC_REGS } else { SCRATCH_REGS };
        for i in 0..count {
            let id = self.alloc.sym_at(Reg(i as u8));
            if id != INVALID_SYM {
                self.syms.get_mut(id)?.reg = INVALID_REG;
                self.alloc.invalidate(Reg(i as u8));
            }
        }
        Ok(())
    }

    pub(crate) fn commit_all(&mut self) -> CompileResult<()> {
        for id in 0..self.syms.len() {
            self.commit(id)?;
        }
        Ok(())
    }

    /// Commit everything a call could clobber: scratch-resident
    /// symbols, memory-backed symbols, and globals.
    pub(crate) fn commit_scratch(&mut self) -> CompileResult<()> {
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            let scratch = usize::from(sym.reg) < SCRATCH_REGS;
            if scratch || !RegAlloc::is_valid(sym.reg) || sym.scope == 0 {
                self.commit(id)?;
            }
        }
        Ok(())
    }

    /// Spill every symbol of the current scope (and globals) and drop
    /// their known values: the state barrier at control-flow joins.
    pub(crate) fn flush(&mut self) -> CompileResult<()> {
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            if sym.scope == self.frame.scope || sym.scope == 0 {
                self.spill(id)?;
                self.syms.get_mut(id)?.clear_kctv();
            }
        }
        Ok(())
    }

    pub(crate) fn clear_all_kctv(&mut self) -> CompileResult<()> {
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            if sym.has_kctv() {
                self.syms.get_mut(id)?.clear_kctv();
            }
        }
        Ok(())
    }

    /// Load `id` into its allocated register.
    pub(crate) fn load(&mut self, id: SymId) -> CompileResult<Reg> {
        let reg = self.acquire(id)?;
        self.load_to(id, reg.0)?;
        Ok(reg)
    }

    /// Load `id` into a specific register (7 is the scratch register
    /// and never becomes the symbol's home).
    pub(crate) fn load_to(&mut self, id: SymId, reg: u8) -> CompileResult<()> {
        let mut sym = {
            let s = self.syms.get_mut(id)?;
            s.hit_temp();
            *s
        };
        trace!(sym = id, from = sym.reg, to = reg, "load");

        if reg == sym.reg {
            bool_cast(&mut self.asm, &mut sym);
            if sym.is_deref() {
                self.asm.ldr(Reg(reg), Reg(reg), 0);
                sym.clear_deref();
            }
            self.syms.put(id, sym)?;
            return Ok(());
        }

        if RegAlloc::is_valid(reg) {
            self.alloc.invalidate(Reg(sym.reg));
        }

        let evict = self.alloc.sym_at(Reg(reg));
        if evict != INVALID_SYM && evict != id {
            let mut e = self.syms.get(evict)?;
            bool_cast(&mut self.asm, &mut e);
            self.syms.put(evict, e)?;
            self.commit(evict)?;
            self.syms.get_mut(evict)?.reg = INVALID_REG;
        }

        let mut sym = self.syms.get(id)?;
        let deref = sym.is_deref();
        sym.clear_deref();

        if RegAlloc::is_valid(sym.reg) {
            if deref {
                self.asm.ldr(Reg(reg), Reg(sym.reg), 0);
            } else {
                bool_cast(&mut self.asm, &mut sym);
                self.asm.movs(Reg(reg), Reg(sym.reg));
            }
            if RegAlloc::is_valid(reg) {
                sym.reg = reg;
            }
            self.syms.put(id, sym)?;
            return Ok(());
        }

        if reg != R7.0 {
            sym.reg = reg;
        }
        let preserve = self.frame.preserve_flags > 0;
        if sym.has_kctv() {
            self.asm.load_imm(Reg(reg), sym.kctv, preserve);
        } else {
            self.frame.alloc_slot(&mut sym);
            if sym.is_in_stack() {
                self.asm.ldr_sp(Reg(reg), u32::from(sym.address) << 2);
            } else {
                let (bank, offset) = super::global_bank(sym.address);
                self.asm.load_imm(Reg(reg), bank, preserve);
                self.asm.ldr(Reg(reg), Reg(reg), offset);
            }
        }
        if deref {
            self.asm.ldr(Reg(reg), Reg(reg), 0);
            sym.clear_kctv();
        }
        self.syms.put(id, sym)?;
        Ok(())
    }

    /// Store the current expression result into `id` (the `=`
    /// operator). KCTV transfers without emission; a deref target
    /// stores through its address.
    pub(crate) fn assign_to(&mut self, id: SymId) -> CompileResult<()> {
        if self.sym_id == id {
            return Ok(());
        }
        let src_id = self.sym_id;

        if self.syms.get(id)?.is_deref() {
            self.syms.get_mut(id)?.clear_deref();
            self.load(id)?;
            self.load(src_id)?;
            let src_reg = Reg(self.syms.get(src_id)?.reg);
            let dst_reg = Reg(self.syms.get(id)?.reg);
            self.asm.str(src_reg, dst_reg, 0);
            self.syms.get_mut(id)?.hit_temp();
            return Ok(());
        }

        let src = self.syms.get(src_id)?;
        if src.has_kctv() && !src.is_deref() {
            self.syms.get_mut(src_id)?.hit_temp();
            let kctv = src.kctv;
            self.syms.get_mut(id)?.set_kctv(kctv);
        } else {
            self.syms.get_mut(id)?.clear_kctv();
            self.load(src_id)?;
            let reg = self.syms.get(src_id)?.reg;
            self.spill(src_id)?;
            self.alloc.assign(id, Reg(reg), false);
            let d = self.syms.get_mut(id)?;
            d.reg = reg;
            d.set_dirty();
        }
        let src_kind = self.syms.get(src_id)?.kind;
        self.syms.get_mut(id)?.kind = if src_kind != SymbolKind::Uncompiled {
            src_kind
        } else {
            SymbolKind::Function
        };
        self.sym_id = id;
        Ok(())
    }

    /// Branch to `label` when the current expression result is false.
    /// A flag-carrying comparison branches on its condition directly;
    /// anything else compares against zero.
    pub(crate) fn to_branch(&mut self, label: u32) -> CompileResult<()> {
        let id = self.sym_id;
        self.syms.get_mut(id)?.hit_temp();
        let kind = self.syms.get(id)?.kind;
        if !kind.is_cast() {
            self.commit_all()?;
            let reg = self.load(id)?;
            self.asm.cmp_imm(reg, 0);
            self.asm.b_cond(Cond::Eq, crate::asm::Label(label));
            self.invalidate_registers(true)?;
        } else {
            self.frame.preserve_flags += 1;
            self.commit_all()?;
            self.frame.preserve_flags -= 1;
            let cc = match kind {
                SymbolKind::CastEq => Cond::Eq,
                SymbolKind::CastNe => Cond::Ne,
                SymbolKind::CastLt => Cond::Lt,
                SymbolKind::CastLe => Cond::Le,
                SymbolKind::CastGt => Cond::Gt,
                _ => Cond::Ge,
            };
            self.asm.b_cond(cc, crate::asm::Label(label));
        }
        Ok(())
    }
}
