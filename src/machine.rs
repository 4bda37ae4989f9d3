//! Target address space and host-native bindings.
//!
//! The machine owns the regions the emitted program sees: the code
//! buffer, the global data section, the SRAM holding the script heap
//! and the call stack, and the memory-mapped input page. Host natives
//! are bound through a reserved address window; a `BLX` there dispatches
//! to the bound closure instead of fetching instructions.

use std::rc::Rc;

use crate::consts::*;
use crate::error::ExecError;

/// Host callback: receives the machine and the marshalled argument
/// registers, returns the R0 result.
pub type NativeFn = Rc<dyn Fn(&mut Machine, &[u32; MAX_ARGS]) -> Result<u32, ExecError>>;

/// Script-heap bookkeeping. Process-wide in the original design; owned
/// by the machine here and passed to the allocator and collector
/// explicitly.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    /// Compressed offset of the most recent allocation's payload. The
    /// low bit is a flag the unlink path must preserve.
    pub head: u16,
    /// Collection is suppressed while positive.
    pub lock: u32,
    /// Words of the data section the collector treats as roots.
    pub global_count: u32,
    /// Free byte ranges of the heap region, offset-sorted.
    pub free: Vec<(u32, u32)>,
    /// Payload offsets of compiler-managed arrays, retained
    /// unconditionally. The header word has no bit to spare for this:
    /// `length` reads its low 16 bits as the element count.
    pub roots: Vec<u16>,
}

/// The complete address space plus native bindings.
pub struct Machine {
    pub(crate) sram: Vec<u8>,
    pub(crate) code: Vec<u8>,
    pub(crate) data: Vec<u8>,
    input: [u8; INPUT_SIZE as usize],
    natives: Vec<Option<NativeFn>>,
    /// Live stack pointer, consulted by the collector's stack scan.
    pub(crate) sp: u32,
    pub(crate) heap: Heap,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("natives", &self.natives.len())
            .field("sp", &self.sp)
            .field("heap", &self.heap)
            .finish()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        let mut machine = Self {
            sram: vec![0; SRAM_SIZE as usize],
            code: vec![0; CODE_SIZE as usize],
            data: vec![0; DATA_SIZE as usize],
            input: [0; INPUT_SIZE as usize],
            // Slots 0 and 1 are the division helpers, dispatched by the
            // executor itself.
            natives: vec![None, None],
            sp: STACK_TOP,
            heap: Heap::default(),
        };
        machine.heap.free = vec![(0, SRAM_SIZE - STACK_RESERVE)];
        machine
    }

    /// Bind a host native; returns the callable address scripts see.
    pub fn add_native(&mut self, f: NativeFn) -> u32 {
        let slot = self.natives.len() as u32;
        self.natives.push(Some(f));
        NATIVE_BASE + (slot << 2) | 1
    }

    /// Native slot for a callable address inside the native window.
    pub fn native_slot(addr: u32) -> Option<u32> {
        (addr & !1).checked_sub(NATIVE_BASE).map(|off| off >> 2)
    }

    /// Invoke a bound native directly (compile-time folding of pure
    /// host calls).
    pub fn invoke_native(&mut self, addr: u32, args: &[u32; MAX_ARGS]) -> Result<u32, ExecError> {
        let slot = Self::native_slot(addr)
            .ok_or(ExecError::UnboundNative { slot: u32::MAX, pc: 0 })?;
        match slot {
            NATIVE_IDIV => {
                let (q, _) = idivmod(args[0], args[1]);
                Ok(q)
            }
            NATIVE_IDIVMOD => {
                let (_, r) = idivmod(args[0], args[1]);
                Ok(r)
            }
            _ => {
                let f = self
                    .natives
                    .get(slot as usize)
                    .and_then(Option::clone)
                    .ok_or(ExecError::UnboundNative { slot, pc: 0 })?;
                f(self, args)
            }
        }
    }

    pub(crate) fn native(&self, slot: u32) -> Option<NativeFn> {
        self.natives.get(slot as usize).and_then(Option::clone)
    }

    /// Replace the code region with a compiled image.
    pub fn load_code(&mut self, image: &[u8]) {
        let len = image.len().min(self.code.len());
        self.code[..len].copy_from_slice(&image[..len]);
    }

    /// Zero the data section (program-start state).
    pub fn clear_data(&mut self) {
        self.data.fill(0);
    }

    /// Drive the input page the `pressed` intrinsic reads.
    pub fn set_input(&mut self, offset: u32, value: u8) {
        if offset < INPUT_SIZE {
            self.input[offset as usize] = value;
        }
    }

    fn slice(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let (region, base): (&[u8], u32) = if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            (&self.sram, SRAM_BASE)
        } else if (CODE_BASE..CODE_BASE + CODE_SIZE).contains(&addr) {
            (&self.code, CODE_BASE)
        } else if (DATA_BASE..DATA_BASE + DATA_SIZE).contains(&addr) {
            (&self.data, DATA_BASE)
        } else if (INPUT_BASE..INPUT_BASE + INPUT_SIZE).contains(&addr) {
            (&self.input, INPUT_BASE)
        } else {
            return None;
        };
        let off = (addr - base) as usize;
        region.get(off..off + len as usize)
    }

    fn slice_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        let (region, base): (&mut [u8], u32) = if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr)
        {
            (&mut self.sram, SRAM_BASE)
        } else if (CODE_BASE..CODE_BASE + CODE_SIZE).contains(&addr) {
            (&mut self.code, CODE_BASE)
        } else if (DATA_BASE..DATA_BASE + DATA_SIZE).contains(&addr) {
            (&mut self.data, DATA_BASE)
        } else {
            return None;
        };
        let off = (addr - base) as usize;
        region.get_mut(off..off + len as usize)
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        self.slice(addr, 1).map(|s| s[0])
    }

    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        self.slice(addr, 2).map(|s| u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        self.slice(addr, 4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Option<()> {
        self.slice_mut(addr, 1).map(|s| s[0] = value)
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> Option<()> {
        self.slice_mut(addr, 2).map(|s| s.copy_from_slice(&value.to_le_bytes()))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Option<()> {
        self.slice_mut(addr, 4).map(|s| s.copy_from_slice(&value.to_le_bytes()))
    }

    /// Words of the data section retained as GC roots.
    pub fn set_global_count(&mut self, words: u32) {
        self.heap.global_count = words;
    }

    /// Suppress collection; nestable.
    pub fn gc_lock(&mut self) {
        self.heap.lock += 1;
    }

    pub fn gc_unlock(&mut self) {
        debug_assert!(self.heap.lock > 0);
        self.heap.lock = self.heap.lock.saturating_sub(1);
    }
}

/// Truncating signed division, the semantics `/` and `%` fold with.
pub(crate) fn idivmod(n: u32, d: u32) -> (u32, u32) {
    let (n, d) = (n as i32, d as i32);
    if d == 0 {
        return (0, n as u32);
    }
    // i32::MIN / -1 overflows; the hardware helper wraps.
    let q = n.wrapping_div(d);
    let r = n.wrapping_rem(d);
    (q as u32, r as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_routing() {
        let mut m = Machine::new();
        m.write_u32(SRAM_BASE + 8, 0xAABBCCDD).unwrap();
        assert_eq!(m.read_u32(SRAM_BASE + 8), Some(0xAABBCCDD));
        assert_eq!(m.read_u16(SRAM_BASE + 8), Some(0xCCDD));
        assert_eq!(m.read_u8(SRAM_BASE + 11), Some(0xAA));
        m.write_u32(DATA_BASE, 7).unwrap();
        assert_eq!(m.read_u32(DATA_BASE), Some(7));
        assert_eq!(m.read_u32(0x5000_0000), None);
        assert_eq!(m.read_u32(SRAM_BASE + SRAM_SIZE - 2), None);
    }

    #[test]
    fn native_addresses_round_trip() {
        let mut m = Machine::new();
        let addr = m.add_native(Rc::new(|_, args| Ok(args[0] + 1)));
        assert_eq!(addr & 1, 1);
        let slot = Machine::native_slot(addr).unwrap();
        assert_eq!(slot, 2);
        let r = m.invoke_native(addr, &[41, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(r, 42);
    }

    #[test]
    fn division_helpers_truncate_toward_zero() {
        assert_eq!(idivmod(7, 2), (3, 1));
        assert_eq!(idivmod((-7i32) as u32, 2), ((-3i32) as u32, (-1i32) as u32));
        assert_eq!(idivmod(7, (-2i32) as u32), ((-3i32) as u32, 1));
        assert_eq!(idivmod(0, 5), (0, 0));
    }
}
