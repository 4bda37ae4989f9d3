//! Call emission and intrinsics.
//!
//! Arguments marshal into R0..R6 under hold; dirty scratch-range
//! symbols are committed first because calls clobber R0–R3. A call to a
//! pure callable with all-known arguments runs at compile time instead
//! of emitting anything. A handful of built-ins are recognized by
//! fingerprint and inlined.

use std::io::{Read, Seek, Write};

use tracing::debug;

use crate::asm::{Cond, Label, Reg, R7};
use crate::consts::{MAX_ARGS, SRAM_BASE, SRAM_SIZE};
use crate::error::{CompileError, CompileResult};
use crate::fingerprint::fp;
use crate::machine::Machine;
use crate::sym::{SymId, SymbolKind, INVALID_SYM};

use super::*;

const I_ABS: u32 = fp("abs");
const I_MIN: u32 = fp("min");
const I_MAX: u32 = fp("max");
const I_PEEK: u32 = fp("peek");
const I_POKE: u32 = fp("poke");
const I_PRESSED: u32 = fp("pressed");
const I_LENGTH: u32 = fp("length");

/// Input-register byte offsets, keyed by the fingerprint of the button
/// name string.
const BUTTONS: [(u32, u32); 7] = [
    (fp("\"A"), 9),
    (fp("\"B"), 4),
    (fp("\"C"), 10),
    (fp("\"UP"), 13),
    (fp("\"DOWN"), 3),
    (fp("\"LEFT"), 25),
    (fp("\"RIGHT"), 7),
];

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    pub(crate) fn call_args(&mut self) -> CompileResult<(usize, [SymId; MAX_ARGS])> {
        let mut argv = [INVALID_SYM; MAX_ARGS];
        let mut argc = 0;
        self.expect(T_LPAREN, '(')?;
        if self.accept(T_RPAREN)? {
            return Ok((argc, argv));
        }
        loop {
            if argc == MAX_ARGS {
                return Err(CompileError::TooManyArguments);
            }
            self.simple_expression()?;
            argv[argc] = self.sym_id;
            argc += 1;
            if !self.accept(T_COMMA)? {
                break;
            }
        }
        self.expect(T_RPAREN, ')')?;
        Ok((argc, argv))
    }

    pub(crate) fn write_call(
        &mut self,
        fnc_id: SymId,
        argc: usize,
        argv: &[SymId],
    ) -> CompileResult<()> {
        if self.call_intrinsic(fnc_id, argc, argv)? {
            return Ok(());
        }

        let pure_call = {
            let call = self.syms.get_mut(fnc_id)?;
            call.set_called();
            if call.has_kctv() && call.kctv == 0 {
                call.clear_kctv();
            }
            argc <= 4 && call.is_constexpr()
        };

        // Compile-time evaluation of pure calls with known arguments.
        let mut arg_vals = [0u32; MAX_ARGS];
        let mut fold = pure_call;
        for i in 0..argc {
            if !fold {
                break;
            }
            let arg = self.syms.get(argv[i])?;
            fold = arg.has_kctv();
            arg_vals[i] = arg.kctv;
        }
        if fold {
            for &arg in &argv[..argc] {
                self.syms.get_mut(arg)?.hit_temp();
            }
            let target = self.syms.get(fnc_id)?.kctv;
            debug!(target = format_args!("{target:#x}"), argc, "compile-time call");
            let result = if Machine::native_slot(target).is_some() {
                self.machine.invoke_native(target, &arg_vals)
            } else {
                self.machine.call(target, &arg_vals[..argc])
            }
            .map_err(CompileError::ConstEval)?;
            let tmp = self.create_tmp()?;
            self.syms.get_mut(tmp)?.set_kctv(result);
            self.sym_id = tmp;
            return Ok(());
        }
        self.is_constexpr = false;

        // Calls clobber R0-R3: park every dirty scratch-range symbol in
        // memory, then drop scratch residency so marshaling cannot copy
        // a stale register.
        self.commit_scratch()?;
        self.invalidate_registers(false)?;
        for (i, &arg) in argv[..argc].iter().enumerate() {
            self.load_to(arg, i as u8)?;
            self.alloc.assign(arg, Reg(i as u8), true);
        }
        for &arg in &argv[..argc] {
            self.syms.get_mut(arg)?.hit_temp();
        }

        let call = self.syms.get(fnc_id)?;
        if call.kind == SymbolKind::Function && call.kctv != 0 {
            // Direct call into an already-linked function.
            let label = self.new_label();
            let rel = (call.kctv & !1) as i64 - i64::from(self.chunk_base);
            self.asm.bind_at(Label(label), rel as i32);
            self.asm.bl(Label(label));
        } else {
            self.load_to(fnc_id, R7.0)?;
            self.asm.blx(R7);
        }

        for i in 0..argc {
            self.alloc.release(Reg(i as u8));
        }
        self.invalidate_registers(false)?;

        let tmp = self.create_tmp()?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.set_dirty();
            t.clear_kctv();
            t.reg = 0;
        }
        self.alloc.assign(tmp, Reg(0), false);
        self.sym_id = tmp;
        Ok(())
    }

    /// Built-ins recognized by fingerprint at the global scope and
    /// inlined without a real call.
    fn call_intrinsic(&mut self, fnc_id: SymId, argc: usize, argv: &[SymId]) -> CompileResult<bool> {
        let sym = self.syms.get(fnc_id)?;
        if sym.scope != 0 {
            return Ok(false);
        }
        match sym.hash {
            I_ABS => self.call_abs(argc, argv).map(|_| true),
            I_MIN => self.call_min_max(argc, argv, true).map(|_| true),
            I_MAX => self.call_min_max(argc, argv, false).map(|_| true),
            I_PEEK => self.call_peek(argc, argv).map(|_| true),
            I_POKE => self.call_poke(argc, argv).map(|_| true),
            I_PRESSED if argc == 1 && self.syms.get(argv[0])?.has_kctv() => {
                self.call_pressed(argv).map(|_| true)
            }
            I_LENGTH => self.call_length(argc, argv).map(|_| true),
            _ => Ok(false),
        }
    }

    fn call_abs(&mut self, argc: usize, argv: &[SymId]) -> CompileResult<()> {
        if argc != 1 {
            return Err(CompileError::Intrinsic("abs expects one argument"));
        }
        let arg = self.syms.get(argv[0])?;
        let tmp = self.create_tmp()?;
        if arg.has_kctv() {
            let v = arg.kctv as i32;
            self.syms.get_mut(tmp)?.set_kctv(v.unsigned_abs());
            self.sym_id = tmp;
            return Ok(());
        }

        let rx = self.acquire(tmp)?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.reg = rx.0;
            t.clear_kctv();
        }
        self.alloc.hold(rx);
        self.load(argv[0])?;
        let ry = Reg(self.syms.get(argv[0])?.reg);
        self.alloc.hold(ry);

        self.asm.asrs_imm(R7, ry, 31);
        self.asm.lsrs_imm(rx, ry, 31);
        self.asm.eors(R7, ry);
        self.asm.adds(rx, rx, R7);

        self.alloc.release(ry);
        self.alloc.release(rx);
        self.sym_id = tmp;
        Ok(())
    }

    fn call_min_max(&mut self, argc: usize, argv: &[SymId], min_mode: bool) -> CompileResult<()> {
        if argc != 2 {
            return Err(CompileError::Intrinsic("min/max expect two arguments"));
        }
        let left = self.syms.get(argv[0])?;
        let right = self.syms.get(argv[1])?;
        let tmp = self.create_tmp()?;
        self.sym_id = tmp;

        if left.has_kctv() && right.has_kctv() {
            let (l, r) = (left.kctv as i32, right.kctv as i32);
            let v = if min_mode { l.min(r) } else { l.max(r) };
            self.syms.get_mut(tmp)?.set_kctv(v as u32);
            return Ok(());
        }

        let rx = self.acquire(tmp)?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.reg = rx.0;
            t.clear_kctv();
        }
        self.alloc.hold(rx);

        self.load(argv[0])?;
        self.load(argv[1])?;
        let rl = Reg(self.syms.get(argv[0])?.reg);
        let rr = Reg(self.syms.get(argv[1])?.reg);

        let next = self.new_label();
        self.asm.movs(rx, rl);
        if min_mode {
            self.asm.cmp(rl, rr);
        } else {
            self.asm.cmp(rr, rl);
        }
        self.asm.b_cond(Cond::Le, Label(next));
        self.asm.movs(rx, rr);
        self.asm.label(Label(next));

        self.alloc.release(rx);
        Ok(())
    }

    fn call_peek(&mut self, argc: usize, argv: &[SymId]) -> CompileResult<()> {
        if argc == 0 || argc > 2 {
            return Err(CompileError::Intrinsic("peek expects one or two arguments"));
        }
        let tmp = self.create_tmp()?;
        let reg = self.acquire(tmp)?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.reg = reg.0;
            t.clear_kctv();
        }
        self.alloc.hold(reg);
        self.load(argv[0])?;
        let ptr = Reg(self.syms.get(argv[0])?.reg);
        self.alloc.hold(ptr);
        if argc == 1 {
            self.asm.ldrb(reg, ptr, 0);
        } else {
            let off = self.syms.get(argv[1])?;
            if off.is_in_range(0, 31) {
                self.syms.get_mut(argv[1])?.hit_temp();
                self.asm.ldrb(reg, ptr, off.kctv);
            } else {
                self.load(argv[1])?;
                let off_reg = Reg(self.syms.get(argv[1])?.reg);
                self.asm.ldrb_reg(reg, ptr, off_reg);
            }
        }
        self.alloc.release(ptr);
        self.alloc.release(reg);
        self.sym_id = tmp;
        Ok(())
    }

    fn call_poke(&mut self, argc: usize, argv: &[SymId]) -> CompileResult<()> {
        if argc < 2 || argc > 3 {
            return Err(CompileError::Intrinsic("poke expects two or three arguments"));
        }
        self.load(argv[0])?;
        let ptr = Reg(self.syms.get(argv[0])?.reg);
        self.alloc.hold(ptr);
        if argc == 2 {
            self.load(argv[1])?;
            let val = Reg(self.syms.get(argv[1])?.reg);
            self.asm.strb(val, ptr, 0);
        } else {
            let off = self.syms.get(argv[1])?;
            self.load(argv[2])?;
            let val = Reg(self.syms.get(argv[2])?.reg);
            if off.is_in_range(0, 31) {
                self.syms.get_mut(argv[1])?.hit_temp();
                self.asm.strb(val, ptr, off.kctv);
            } else {
                self.load(argv[1])?;
                let off_reg = Reg(self.syms.get(argv[1])?.reg);
                self.asm.strb_reg(val, ptr, off_reg);
            }
        }
        self.alloc.release(ptr);
        Ok(())
    }

    /// `pressed("A")`: read the input-register byte at the offset the
    /// button name maps to.
    fn call_pressed(&mut self, argv: &[SymId]) -> CompileResult<()> {
        let key = self.syms.get(argv[0])?.kctv;
        let offset = BUTTONS
            .iter()
            .find(|&&(hash, _)| hash == key)
            .map(|&(_, off)| off)
            .unwrap_or(0);
        self.syms.get_mut(argv[0])?.hit_temp();
        self.asm.load_imm(R7, crate::consts::INPUT_BASE, false);
        let tmp = self.create_tmp()?;
        let reg = self.acquire(tmp)?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.reg = reg.0;
            t.clear_kctv();
        }
        self.asm.ldrb(reg, R7, offset);
        self.sym_id = tmp;
        Ok(())
    }

    fn call_length(&mut self, argc: usize, argv: &[SymId]) -> CompileResult<()> {
        if argc != 1 {
            return Err(CompileError::Intrinsic("length expects 1 argument"));
        }
        let tmp = self.create_tmp()?;

        let arg = self.syms.get(argv[0])?;
        if arg.is_in_range(SRAM_BASE, SRAM_BASE + SRAM_SIZE) {
            // Literal array with a known header: fold the length.
            let len = self.machine.read_u32(arg.kctv.wrapping_sub(4)).unwrap_or(0) & 0xFFFF;
            self.syms.get_mut(tmp)?.set_kctv(len);
            self.sym_id = tmp;
            return Ok(());
        }

        let reg = self.acquire(tmp)?;
        {
            let t = self.syms.get_mut(tmp)?;
            t.reg = reg.0;
            t.clear_kctv();
        }
        self.load(argv[0])?;
        let arr = Reg(self.syms.get(argv[0])?.reg);
        self.asm.subs_imm3(reg, arr, 4);
        self.asm.ldrh(reg, reg, 0);
        self.sym_id = tmp;
        Ok(())
    }
}
