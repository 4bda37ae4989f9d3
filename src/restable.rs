//! Interned-resource table.
//!
//! String literals are interned by fingerprint into one random-access
//! backing: a fixed-capacity head region of `(key, payload offset)`
//! pairs followed by the payload bytes themselves. Lookup is a linear
//! scan of the head region, optionally accelerated by a write-through
//! RAM cache holding the newest pairs.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::CompileResult;

const PAIR_SIZE: u32 = 8;

/// Fingerprint-keyed payload table over a seekable backing.
#[derive(Debug)]
pub struct ResourceTable<F> {
    file: F,
    /// Pairs stored in the head region on the backing.
    file_count: u32,
    /// Head-region capacity in pairs.
    capacity: u32,
    /// High-water mark of payload bytes written.
    file_size: u32,
    /// RAM pair cache; `None` until [`ResourceTable::set_cache`].
    cache: Option<PairCache>,
}

#[derive(Debug)]
struct PairCache {
    pairs: Vec<(u32, u32)>,
    capacity: usize,
}

impl<F: Read + Write + Seek> ResourceTable<F> {
    /// Wrap `file` with a head region of `capacity` pairs.
    pub fn new(file: F, capacity: u32) -> Self {
        Self { file, file_count: 0, capacity, file_size: 0, cache: None }
    }

    /// Forget every entry. The payload tail is left to be overwritten.
    pub fn reset(&mut self) -> CompileResult<()> {
        self.file_count = 0;
        self.file_size = 0;
        if let Some(cache) = &mut self.cache {
            cache.pairs.clear();
        }
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Install (or replace) the RAM pair cache. Entries held by a
    /// previous cache are flushed back to the head region first.
    pub fn set_cache(&mut self, capacity: usize) -> CompileResult<()> {
        self.flush_cache()?;
        self.cache = Some(PairCache { pairs: Vec::with_capacity(capacity), capacity });
        Ok(())
    }

    fn flush_cache(&mut self) -> CompileResult<()> {
        let Some(cache) = self.cache.take() else { return Ok(()) };
        for (key, offset) in cache.pairs {
            self.write_pair(key, offset)?;
        }
        Ok(())
    }

    fn write_pair(&mut self, key: u32, offset: u32) -> CompileResult<()> {
        self.file.seek(SeekFrom::Start(u64::from(self.file_count * PAIR_SIZE)))?;
        self.file.write_all(&key.to_le_bytes())?;
        self.file.write_all(&offset.to_le_bytes())?;
        self.file_count += 1;
        Ok(())
    }

    fn sync_size(&mut self) -> CompileResult<()> {
        let pos = self.file.stream_position()? as u32;
        if pos > self.file_size {
            self.file_size = pos;
        }
        Ok(())
    }

    /// Payload offset for `key`, or 0 when absent.
    pub fn find(&mut self, key: u32) -> CompileResult<u32> {
        self.sync_size()?;
        if let Some(cache) = &self.cache {
            if let Some(&(_, offset)) = cache.pairs.iter().find(|&&(k, _)| k == key) {
                return Ok(offset);
            }
        }
        for i in 0..self.file_count {
            self.file.seek(SeekFrom::Start(u64::from(i * PAIR_SIZE)))?;
            let mut pair = [0u8; 8];
            self.file.read_exact(&mut pair)?;
            if u32::from_le_bytes(pair[0..4].try_into().unwrap()) == key {
                return Ok(u32::from_le_bytes(pair[4..8].try_into().unwrap()));
            }
        }
        Ok(0)
    }

    /// Allocate a payload area for `key` and return a cursor positioned
    /// at it, or `None` when the key is already interned.
    pub fn write(&mut self, key: u32) -> CompileResult<Option<&mut F>> {
        self.sync_size()?;
        if self.find(key)? != 0 {
            return Ok(None);
        }
        let offset = (self.capacity * PAIR_SIZE).max(self.file_size);

        let cached = match &mut self.cache {
            Some(cache) if cache.pairs.len() < cache.capacity => {
                cache.pairs.push((key, offset));
                true
            }
            _ => false,
        };
        if !cached {
            self.write_pair(key, offset)?;
        }

        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        // The caller writes the payload; the next operation picks the
        // new high-water mark up through sync_size.
        self.file_size = offset;
        Ok(Some(&mut self.file))
    }

    /// Seek the backing to `offset` for payload reads.
    pub fn at(&mut self, offset: u32) -> CompileResult<&mut F> {
        self.sync_size()?;
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        Ok(&mut self.file)
    }

    /// Seek to the payload of `key` (offset 0 when absent, like the
    /// head region itself).
    pub fn read(&mut self, key: u32) -> CompileResult<&mut F> {
        let offset = self.find(key)?;
        self.at(offset)
    }
}

impl ResourceTable<std::io::Cursor<Vec<u8>>> {
    /// Table backed by growable memory, for tests and hosted use.
    pub fn in_memory(capacity: u32) -> Self {
        Self::new(std::io::Cursor::new(Vec::new()), capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn intern(table: &mut ResourceTable<Cursor<Vec<u8>>>, key: u32, payload: &[u8]) -> bool {
        match table.write(key).unwrap() {
            Some(file) => {
                file.write_all(payload).unwrap();
                file.write_all(&[0]).unwrap();
                true
            }
            None => false,
        }
    }

    fn read_back(table: &mut ResourceTable<Cursor<Vec<u8>>>, key: u32) -> Vec<u8> {
        let offset = table.find(key).unwrap();
        assert_ne!(offset, 0);
        let file = table.at(offset).unwrap();
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            file.read_exact(&mut byte).unwrap();
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
        }
        out
    }

    #[test]
    fn intern_and_find() {
        let mut table = ResourceTable::in_memory(16);
        assert!(intern(&mut table, 111, b"hello"));
        assert!(intern(&mut table, 222, b"world"));
        assert_eq!(read_back(&mut table, 111), b"hello");
        assert_eq!(read_back(&mut table, 222), b"world");
        assert_eq!(table.find(333).unwrap(), 0);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut table = ResourceTable::in_memory(16);
        assert!(intern(&mut table, 42, b"first"));
        assert!(!intern(&mut table, 42, b"second"));
        assert_eq!(read_back(&mut table, 42), b"first");
    }

    #[test]
    fn ram_cache_is_write_through_on_replacement() {
        let mut table = ResourceTable::in_memory(16);
        table.set_cache(4).unwrap();
        assert!(intern(&mut table, 1, b"a"));
        assert!(intern(&mut table, 2, b"b"));
        // Replacing the cache flushes the held pairs to the head region.
        table.set_cache(4).unwrap();
        assert_eq!(read_back(&mut table, 1), b"a");
        assert_eq!(read_back(&mut table, 2), b"b");
        assert!(!intern(&mut table, 1, b"dup"));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut table = ResourceTable::in_memory(16);
        assert!(intern(&mut table, 9, b"gone"));
        table.reset().unwrap();
        assert_eq!(table.find(9).unwrap(), 0);
        assert!(intern(&mut table, 9, b"back"));
    }
}
