//! Symbol data model.
//!
//! Every named or temporary value the compiler tracks is a [`Symbol`]
//! record in the paged store. A symbol is, at any moment, in exactly one
//! authoritative state: a known compile-time value (KCTV), live in a
//! register (dirty or committed), or backed by its memory slot. The flag
//! protocol below enforces the transitions.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::store::Record;

/// Index of a symbol in the paged store.
pub type SymId = u32;

/// Sentinel for "no symbol".
pub const INVALID_SYM: SymId = u32::MAX;

/// Sentinel for "no data/stack slot assigned yet".
pub const INVALID_ADDRESS: u16 = 0xFFFF;

/// Sentinel for "not resident in a register".
pub const INVALID_REG: u8 = 0xFF;

bitflags! {
    /// Symbol state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymFlags: u8 {
        /// The symbol has been used as a call target.
        const CALLED = 1 << 0;
        /// Temporary has been consumed; slot and register reusable.
        const HIT = 1 << 1;
        /// Register value not yet committed to the memory slot.
        const DIRTY = 1 << 2;
        /// `kctv` holds the last known compile-time value.
        const KCTV = 1 << 3;
        /// The register holds the address of the value, not the value.
        const DEREF = 1 << 4;
        /// Global carries an initial value for the data section.
        const MEM_INIT = 1 << 5;
        /// Value never changes; KCTV survives clearing.
        const CONSTANT = 1 << 6;
        /// Callable is pure; all-KCTV calls may run at compile time.
        const CONSTEXPR = 1 << 7;
    }
}

/// Value interpretation tag.
///
/// The `Cast*` states mean the symbol's value is a branch condition
/// currently encoded in the CPU flags from a recent comparison; it only
/// materializes as 0/1 if used as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SymbolKind {
    #[default]
    U32 = 0,
    S32 = 1,
    Bool = 2,
    /// Function declared but not yet lowered; `init` holds the source
    /// offset of its argument list.
    Uncompiled = 3,
    Function = 4,
    CastEq = 5,
    CastNe = 6,
    CastLt = 7,
    CastLe = 8,
    CastGt = 9,
    CastGe = 10,
}

impl SymbolKind {
    /// True for the flag-carrying comparison states.
    pub const fn is_cast(self) -> bool {
        matches!(
            self,
            Self::CastEq | Self::CastNe | Self::CastLt | Self::CastLe | Self::CastGt | Self::CastGe
        )
    }
}

/// One symbol-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Identifier fingerprint, or 0 for an anonymous temporary.
    pub hash: u32,
    /// Last known compile-time value, when `KCTV` is set.
    pub kctv: u32,
    /// Initial value written into the data section at program start
    /// (globals), or the source offset of an uncompiled function body.
    pub init: u32,
    /// Slot index in the data section (globals) or stack frame (locals).
    pub address: u16,
    /// 0 for globals, positive for function locals.
    pub scope: u16,
    /// Declaration line, kept for function rewinding.
    pub line: u16,
    /// Register currently holding this symbol.
    pub reg: u8,
    /// State bits.
    pub flags: SymFlags,
    /// Value interpretation.
    pub kind: SymbolKind,
}

impl Default for Symbol {
    fn default() -> Self {
        Self {
            hash: 0,
            kctv: 0,
            init: 0,
            address: INVALID_ADDRESS,
            scope: 0,
            line: 0,
            reg: INVALID_REG,
            flags: SymFlags::empty(),
            kind: SymbolKind::U32,
        }
    }
}

impl Symbol {
    /// Anonymous temporaries have no fingerprint.
    pub fn is_temp(&self) -> bool {
        self.hash == 0
    }

    /// Locals and temporaries live in the stack frame; named globals in
    /// the data section.
    pub fn is_in_stack(&self) -> bool {
        self.scope != 0 || self.is_temp()
    }

    pub fn is_called(&self) -> bool {
        self.flags.contains(SymFlags::CALLED)
    }

    pub fn set_called(&mut self) {
        self.flags.insert(SymFlags::CALLED);
    }

    /// Mark a consumed temporary. Named symbols are unaffected.
    pub fn hit_temp(&mut self) {
        if self.hash == 0 {
            self.flags.insert(SymFlags::HIT);
        }
    }

    /// Revive a temporary for continued use.
    pub fn unhit_temp(&mut self) {
        if self.hash == 0 {
            self.flags.remove(SymFlags::HIT);
        }
    }

    pub fn was_hit(&self) -> bool {
        self.is_temp() && self.flags.contains(SymFlags::HIT)
    }

    /// A consumed temporary is never dirty.
    pub fn is_dirty(&self) -> bool {
        !self.was_hit() && self.flags.contains(SymFlags::DIRTY)
    }

    pub fn set_dirty(&mut self) {
        if !self.is_constant() {
            self.flags.insert(SymFlags::DIRTY);
        }
    }

    pub fn clear_dirty(&mut self) {
        self.flags.remove(SymFlags::DIRTY);
    }

    /// A deref symbol's `kctv` is an address, not a value.
    pub fn has_kctv(&self) -> bool {
        !self.is_deref() && self.flags.contains(SymFlags::KCTV)
    }

    pub fn set_kctv(&mut self, v: u32) {
        self.set_dirty();
        self.reg = INVALID_REG;
        self.kctv = v;
        self.flags.insert(SymFlags::KCTV);
    }

    /// Drops the known value unless the symbol is a constant. Returns
    /// whether anything was dropped.
    pub fn clear_kctv(&mut self) -> bool {
        if self.flags.contains(SymFlags::CONSTANT) {
            return false;
        }
        self.flags.remove(SymFlags::KCTV);
        true
    }

    pub fn equals(&self, v: u32) -> bool {
        self.has_kctv() && self.kctv == v
    }

    /// KCTV within `[min, max]`, the immediate-form eligibility test.
    pub fn is_in_range(&self, min: u32, max: u32) -> bool {
        self.has_kctv() && self.kctv >= min && self.kctv <= max
    }

    pub fn is_deref(&self) -> bool {
        self.flags.contains(SymFlags::DEREF)
    }

    pub fn set_deref(&mut self) {
        self.flags.insert(SymFlags::DEREF);
    }

    pub fn clear_deref(&mut self) {
        self.flags.remove(SymFlags::DEREF);
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(SymFlags::CONSTANT)
    }

    /// Freeze the symbol to an immutable compile-time value.
    pub fn set_constant(&mut self, v: u32) {
        self.clear_dirty();
        self.reg = INVALID_REG;
        self.kctv = v;
        self.flags.insert(SymFlags::KCTV | SymFlags::CONSTANT);
    }

    pub fn is_constexpr(&self) -> bool {
        self.flags.contains(SymFlags::CONSTEXPR)
    }

    pub fn set_constexpr(&mut self) {
        self.flags.insert(SymFlags::CONSTEXPR);
    }

    pub fn mem_init(&self) -> bool {
        self.scope == 0 && self.flags.contains(SymFlags::MEM_INIT)
    }

    /// Record `v` as the value the data section starts with.
    pub fn set_mem_init(&mut self, v: u32) {
        self.flags.insert(SymFlags::MEM_INIT);
        self.init = v;
    }

    /// Promote the current KCTV of a global to its initial value. Slots
    /// start zeroed, so a zero value needs no store either way.
    pub fn promote_mem_init(&mut self) {
        if self.scope != 0 || !self.has_kctv() {
            return;
        }
        if self.kctv == 0 {
            self.clear_dirty();
        }
        self.set_mem_init(self.kctv);
    }
}

impl Record for Symbol {
    const SIZE: usize = 24;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.hash.to_le_bytes());
        out[4..8].copy_from_slice(&self.kctv.to_le_bytes());
        out[8..12].copy_from_slice(&self.init.to_le_bytes());
        out[12..14].copy_from_slice(&self.address.to_le_bytes());
        out[14..16].copy_from_slice(&self.scope.to_le_bytes());
        out[16..18].copy_from_slice(&self.line.to_le_bytes());
        out[18] = self.reg;
        out[19] = self.flags.bits();
        out[20] = self.kind.into();
        out[21..24].copy_from_slice(&[0; 3]);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            hash: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            kctv: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            init: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            address: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            scope: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
            line: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            reg: buf[18],
            flags: SymFlags::from_bits_truncate(buf[19]),
            kind: SymbolKind::try_from(buf[20]).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_exclusivity() {
        let mut s = Symbol::default();
        s.set_kctv(7);
        assert!(s.has_kctv());
        assert_eq!(s.reg, INVALID_REG);

        // Deref reinterprets kctv as an address.
        s.set_deref();
        assert!(!s.has_kctv());
        s.clear_deref();
        assert!(s.has_kctv());
    }

    #[test]
    fn constants_survive_clear() {
        let mut s = Symbol::default();
        s.set_constant(25);
        assert!(!s.clear_kctv());
        assert!(s.has_kctv());
        s.set_dirty();
        assert!(!s.is_dirty());
    }

    #[test]
    fn hit_temps_are_never_dirty() {
        let mut s = Symbol::default();
        s.set_kctv(1);
        assert!(s.is_dirty());
        s.hit_temp();
        assert!(!s.is_dirty());
    }

    #[test]
    fn record_round_trip() {
        let mut s = Symbol {
            hash: 0xDEAD_BEEF,
            kctv: 42,
            init: 7,
            address: 3,
            scope: 2,
            line: 19,
            reg: 4,
            flags: SymFlags::DIRTY | SymFlags::KCTV,
            kind: SymbolKind::CastLe,
        };
        s.set_called();
        let mut buf = [0u8; Symbol::SIZE];
        s.encode(&mut buf);
        assert_eq!(Symbol::decode(&buf), s);
    }
}
