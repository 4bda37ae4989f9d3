//! Script-array heap and precise mark-sweep collector.
//!
//! Arrays are 32-bit-word blocks in the SRAM heap region. The word
//! before the payload encodes the array's length, flags, and a
//! compressed link to the next allocation, forming a singly-linked list
//! of everything live. Collection marks from pinned roots, the live
//! stack window and the used data-section prefix, closes over
//! array-to-array references, then unlinks and frees the rest.

use itertools::iproduct;
use tracing::{debug, trace};

use crate::consts::{SRAM_BASE, SRAM_SIZE, STACK_RESERVE, STACK_TOP};
use crate::error::ExecError;
use crate::machine::Machine;

/// First byte past the allocatable heap region.
const HEAP_LIMIT: u32 = SRAM_SIZE - STACK_RESERVE;

/// Mask extracting a payload offset from the compressed link; the low
/// bit is reserved for list-head flags.
const NEXT_MASK: u16 = 0x7FFE;

const LEN_MASK: u32 = 0xFFFF;
const PTRS_BIT: u32 = 1 << 16;
const MARK_BIT: u32 = 1 << 31;

/// Decoded array header. The low 16 bits are the length and nothing
/// else: the `length` intrinsic reads them with a bare LDRH. Root
/// pinning therefore lives in the heap state, not the header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArrayHeader {
    /// Payload offset into SRAM; 0 terminates the list.
    pub offset: u16,
    /// Payload length in words.
    pub len: u32,
    /// Compressed offset of the next allocation.
    pub next: u16,
    pub mark: bool,
    pub has_ptrs: bool,
}

impl ArrayHeader {
    fn decode(offset: u16, word: u32) -> Self {
        Self {
            offset,
            len: word & LEN_MASK,
            next: ((word >> 16) as u16) & NEXT_MASK,
            mark: word & MARK_BIT != 0,
            has_ptrs: word & PTRS_BIT != 0,
        }
    }

    fn encode(&self) -> u32 {
        self.len & LEN_MASK
            | if self.has_ptrs { PTRS_BIT } else { 0 }
            | u32::from(self.next & NEXT_MASK) << 16
            | if self.mark { MARK_BIT } else { 0 }
    }

    /// Payload bounds as absolute addresses.
    fn bounds(&self) -> (u32, u32) {
        let begin = SRAM_BASE + u32::from(self.offset);
        (begin, begin + self.len * 4)
    }
}

impl Machine {
    fn sram_word(&self, offset: u32) -> u32 {
        let i = offset as usize;
        u32::from_le_bytes(self.sram[i..i + 4].try_into().unwrap())
    }

    fn set_sram_word(&mut self, offset: u32, value: u32) {
        let i = offset as usize;
        self.sram[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn header(&self, offset: u16) -> ArrayHeader {
        ArrayHeader::decode(offset, self.sram_word(u32::from(offset) - 4))
    }

    fn put_header(&mut self, header: ArrayHeader) {
        self.set_sram_word(u32::from(header.offset) - 4, header.encode());
    }

    fn list(&self) -> Vec<ArrayHeader> {
        let mut out = Vec::new();
        let mut offset = self.heap.head & NEXT_MASK;
        while offset != 0 {
            let header = self.header(offset);
            out.push(header);
            offset = header.next & NEXT_MASK;
        }
        out
    }

    /// Payload addresses of every live array, most recent first.
    pub fn live_arrays(&self) -> Vec<u32> {
        self.list().iter().map(|h| SRAM_BASE + u32::from(h.offset)).collect()
    }

    /// Allocate a zeroed `words`-long array for the running program.
    pub fn alloc(&mut self, words: u32) -> Result<u32, ExecError> {
        self.alloc_array(words, false)
    }

    /// Allocate an array pinned against collection (compiler-managed
    /// storage such as literal arrays).
    pub fn alloc_root(&mut self, words: u32) -> Result<u32, ExecError> {
        self.alloc_array(words, true)
    }

    fn alloc_array(&mut self, words: u32, is_root: bool) -> Result<u32, ExecError> {
        if self.heap.lock == 0 {
            self.collect();
        }

        let bytes = (words + 1) * 4;
        let slot = self
            .heap
            .free
            .iter()
            .position(|&(_, size)| size >= bytes)
            .ok_or(ExecError::OutOfMemory { words })?;
        let (offset, size) = self.heap.free[slot];
        if size == bytes {
            self.heap.free.remove(slot);
        } else {
            self.heap.free[slot] = (offset + bytes, size - bytes);
        }

        let payload = (offset + 4) as u16;
        let header = ArrayHeader {
            offset: payload,
            len: words,
            next: self.heap.head & NEXT_MASK,
            mark: false,
            has_ptrs: false,
        };
        self.put_header(header);
        if is_root {
            self.heap.roots.push(payload);
        }
        self.heap.head = payload | (self.heap.head & 1);
        for w in 0..words {
            self.set_sram_word(u32::from(payload) + w * 4, 0);
        }
        trace!(payload = format_args!("{:#x}", SRAM_BASE + u32::from(payload)), words, is_root, "alloc");
        Ok(SRAM_BASE + u32::from(payload))
    }

    fn release(&mut self, header: &ArrayHeader) {
        let offset = u32::from(header.offset) - 4;
        let bytes = (header.len + 1) * 4;
        let at = self.heap.free.partition_point(|&(o, _)| o < offset);
        self.heap.free.insert(at, (offset, bytes));
        // Coalesce with both neighbours.
        if at + 1 < self.heap.free.len() {
            let (o, s) = self.heap.free[at];
            let (no, ns) = self.heap.free[at + 1];
            if o + s == no {
                self.heap.free[at] = (o, s + ns);
                self.heap.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (po, ps) = self.heap.free[at - 1];
            let (o, s) = self.heap.free[at];
            if po + ps == o {
                self.heap.free[at - 1] = (po, ps + s);
                self.heap.free.remove(at);
            }
        }
    }

    fn word_points_into(word: u32, begin: u32, end: u32) -> bool {
        word >= begin && word < end
    }

    /// One full mark-sweep cycle.
    pub fn collect(&mut self) {
        let mut arrays = self.list();
        if arrays.is_empty() {
            return;
        }

        // Initial roots: pinned arrays, live stack words, used globals.
        for header in &mut arrays {
            header.mark = self.heap.roots.contains(&header.offset);
            let (begin, end) = header.bounds();

            if !header.mark {
                let mut addr = self.sp;
                while addr < STACK_TOP {
                    let word = self.sram_word(addr - SRAM_BASE);
                    if Self::word_points_into(word, begin, end) {
                        header.mark = true;
                        break;
                    }
                    addr += 4;
                }
            }
            if !header.mark {
                for g in 0..self.heap.global_count {
                    let i = (g * 4) as usize;
                    let word = u32::from_le_bytes(self.data[i..i + 4].try_into().unwrap());
                    if Self::word_points_into(word, begin, end) {
                        header.mark = true;
                        break;
                    }
                }
            }

            header.has_ptrs = false;
            for w in 0..header.len {
                let word = self.sram_word(u32::from(header.offset) + w * 4);
                if word >= SRAM_BASE && word < SRAM_BASE + HEAP_LIMIT {
                    header.has_ptrs = true;
                    break;
                }
            }
        }

        // Transitive closure: a marked pointer-bearing array retains
        // everything it references. Iterate to fixpoint.
        loop {
            let mut changed = false;
            for (target, source) in iproduct!(0..arrays.len(), 0..arrays.len()) {
                if arrays[target].mark || !arrays[source].mark || !arrays[source].has_ptrs {
                    continue;
                }
                let (begin, end) = arrays[target].bounds();
                let src = arrays[source];
                for w in 0..src.len {
                    let word = self.sram_word(u32::from(src.offset) + w * 4);
                    if Self::word_points_into(word, begin, end) {
                        arrays[target].mark = true;
                        changed = true;
                        break;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for header in &arrays {
            self.put_header(*header);
        }

        // Sweep: unlink and free the unmarked. The head's low flag bit
        // survives the unlink.
        let mut freed = 0u32;
        let mut kept_prev: Option<u16> = None;
        for header in &arrays {
            if header.mark {
                kept_prev = Some(header.offset);
            } else {
                match kept_prev {
                    Some(prev_offset) => {
                        let mut prev = self.header(prev_offset);
                        prev.next = header.next & NEXT_MASK;
                        self.put_header(prev);
                    }
                    None => {
                        self.heap.head = (header.next & NEXT_MASK) | (self.heap.head & 1);
                    }
                }
                self.release(header);
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, live = arrays.len() as u32 - freed, "gc sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new()
    }

    #[test]
    fn allocations_link_most_recent_first() {
        let mut m = machine();
        let a = m.alloc_root(4).unwrap();
        let b = m.alloc_root(2).unwrap();
        assert_eq!(m.live_arrays(), vec![b, a]);
        assert_eq!(m.read_u32(a - 4).unwrap() & LEN_MASK, 4);
        assert_eq!(m.read_u32(b - 4).unwrap() & LEN_MASK, 2);
    }

    #[test]
    fn unreferenced_arrays_are_swept() {
        let mut m = machine();
        let a = m.alloc(4).unwrap();
        // Root `a` through a global slot before anything can collect.
        m.set_global_count(1);
        m.write_u32(crate::consts::DATA_BASE, a).unwrap();
        let b = m.alloc(4).unwrap();
        m.collect();
        let live = m.live_arrays();
        assert!(live.contains(&a));
        assert!(!live.contains(&b));
        // `a` still holds its contents.
        assert_eq!(m.read_u32(a).unwrap(), 0);
    }

    #[test]
    fn transitive_references_are_retained() {
        let mut m = machine();
        let inner = m.alloc(2).unwrap();
        let outer = m.alloc(2).unwrap();
        m.write_u32(outer, inner).unwrap();
        m.set_global_count(1);
        m.write_u32(crate::consts::DATA_BASE, outer).unwrap();
        m.collect();
        let live = m.live_arrays();
        assert!(live.contains(&outer));
        assert!(live.contains(&inner));
    }

    #[test]
    fn lock_suppresses_collection() {
        let mut m = machine();
        let orphan = m.alloc(4).unwrap();
        m.gc_lock();
        let other = m.alloc(4).unwrap();
        assert!(m.live_arrays().contains(&orphan));
        m.gc_unlock();
        let _trigger = m.alloc(4).unwrap();
        let live = m.live_arrays();
        assert!(!live.contains(&orphan));
        // `other` had no references either; both die once unlocked.
        assert!(!live.contains(&other));
    }

    #[test]
    fn freed_blocks_coalesce_and_get_reused() {
        let mut m = machine();
        let _keep = m.alloc_root(1).unwrap();
        let first = m.alloc(100).unwrap();
        // Nothing references `first`; the next allocation collects it
        // and reuses the coalesced space.
        let again = m.alloc(100).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut m = machine();
        let total_words = (HEAP_LIMIT / 4) as u32;
        let a = m.alloc_root(total_words - 1);
        assert!(a.is_ok());
        let b = m.alloc_root(1);
        assert!(matches!(b, Err(ExecError::OutOfMemory { .. })));
    }
}
