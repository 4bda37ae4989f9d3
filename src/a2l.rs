//! Address-to-line table.
//!
//! One `u16` source line per emitted halfword, indexed by code-buffer
//! byte offset. After a hardware fault the latched PC is rounded down to
//! a halfword and the table is scanned backward to the nearest non-zero
//! entry to recover the offending source line.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::consts::{CODE_BASE, CODE_SIZE};
use crate::error::CompileResult;

/// File-backed address↔line mapping, preallocated to the code-buffer
/// size.
#[derive(Debug)]
pub struct LineTable<F> {
    file: F,
}

impl<F: Read + Write + Seek> LineTable<F> {
    /// Wrap `file` and zero the table.
    pub fn new(file: F) -> CompileResult<Self> {
        let mut table = Self { file };
        table.reset()?;
        Ok(table)
    }

    /// Zero every entry; called at the start of each compilation.
    pub fn reset(&mut self) -> CompileResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&[0u8; CODE_SIZE as usize])?;
        Ok(())
    }

    /// Record that the instruction at code-buffer byte `offset` came
    /// from `line`.
    pub fn record(&mut self, offset: u32, line: u16) -> CompileResult<()> {
        if offset >= CODE_SIZE {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(u64::from(offset & !1)))?;
        self.file.write_all(&line.to_le_bytes())?;
        Ok(())
    }

    /// Map a faulting code address back to the nearest recorded source
    /// line at or before it. Returns `None` when the address is outside
    /// the code buffer or nothing was recorded that early.
    pub fn recover(&mut self, fault_addr: u32) -> CompileResult<Option<u16>> {
        if fault_addr < CODE_BASE || fault_addr >= CODE_BASE + CODE_SIZE {
            return Ok(None);
        }
        let mut offset = (fault_addr - CODE_BASE) & !1;
        loop {
            self.file.seek(SeekFrom::Start(u64::from(offset)))?;
            let mut entry = [0u8; 2];
            self.file.read_exact(&mut entry)?;
            let line = u16::from_le_bytes(entry);
            if line != 0 {
                return Ok(Some(line));
            }
            if offset == 0 {
                return Ok(None);
            }
            offset -= 2;
        }
    }
}

impl LineTable<std::io::Cursor<Vec<u8>>> {
    /// Table backed by memory, for tests and hosted use.
    pub fn in_memory() -> Self {
        Self::new(std::io::Cursor::new(Vec::new())).expect("memory table")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_scans_backward() {
        let mut table = LineTable::in_memory();
        table.record(0x10, 3).unwrap();
        table.record(0x20, 7).unwrap();
        assert_eq!(table.recover(CODE_BASE + 0x20).unwrap(), Some(7));
        assert_eq!(table.recover(CODE_BASE + 0x1E).unwrap(), Some(3));
        // Rounds odd fault addresses down to the halfword.
        assert_eq!(table.recover(CODE_BASE + 0x21).unwrap(), Some(7));
        assert_eq!(table.recover(CODE_BASE + 0x02).unwrap(), None);
        assert_eq!(table.recover(0x1234).unwrap(), None);
    }

    #[test]
    fn reset_clears_entries() {
        let mut table = LineTable::in_memory();
        table.record(0x40, 9).unwrap();
        table.reset().unwrap();
        assert_eq!(table.recover(CODE_BASE + 0x40).unwrap(), None);
    }
}
