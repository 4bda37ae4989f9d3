//! Symbol creation, lookup and recycling.

use std::io::{Read, Seek, Write};

use tracing::trace;

use crate::asm::Reg;
use crate::consts::SYM_CACHE_SIZE;
use crate::error::{CompileError, CompileResult};
use crate::sym::{SymId, Symbol, SymbolKind, INVALID_SYM};

use super::Compiler;

impl<S: Read + Seek, F: Read + Write + Seek> Compiler<S, F> {
    /// Fresh anonymous temporary, recycling the first consumed one.
    pub(crate) fn create_tmp(&mut self) -> CompileResult<SymId> {
        let mut id = self.syms.len();
        for i in 0..self.syms.len() {
            if self.syms.get(i)?.was_hit() {
                id = i;
                break;
            }
        }
        let scope = self.frame.scope;
        let sym = self.syms.get_mut(id)?;
        *sym = Symbol { scope, kind: SymbolKind::S32, ..Symbol::default() };
        sym.set_dirty();
        sym.set_kctv(0);
        // Detach a recycled slot from any register it still names.
        self.alloc.assign(id, Reg(u8::MAX), false);
        Ok(id)
    }

    /// Declare (or rediscover) a named symbol in `scope`.
    pub(crate) fn create_symbol_hashed(&mut self, hash: u32, scope: u16) -> CompileResult<SymId> {
        let mut evict = INVALID_SYM;
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            if sym.hash == hash && sym.scope == scope {
                trace!(id, hash, "redeclared symbol");
                return Ok(id);
            }
            if sym.was_hit() {
                evict = id;
            }
        }

        let id = if evict != INVALID_SYM { evict } else { self.syms.len() };
        self.hash_cache[hash as usize % SYM_CACHE_SIZE] = id;
        let sym = self.syms.get_mut(id)?;
        *sym = Symbol { hash, scope, ..Symbol::default() };
        sym.set_kctv(0);
        sym.clear_dirty();
        self.alloc.assign(id, Reg(u8::MAX), false);
        trace!(id, hash, scope, "declared symbol");
        Ok(id)
    }

    /// Declare a symbol named by the current token and consume it.
    pub(crate) fn create_named(&mut self, scope: u16) -> CompileResult<SymId> {
        if !self.is_name() {
            return Err(CompileError::ExpectedName);
        }
        let hash = self.token;
        let id = self.create_symbol_hashed(hash, scope)?;
        self.accept_any()?;
        Ok(id)
    }

    /// Entry point for host bindings: a global by name.
    pub fn create_global(&mut self, name: &str) -> CompileResult<SymId> {
        self.create_symbol_hashed(crate::fingerprint::fp(name), 0)
    }

    pub(crate) fn clear_hash_cache(&mut self) {
        self.hash_cache = [INVALID_SYM; SYM_CACHE_SIZE];
    }

    /// Resolve `hash` in `scope`, falling back to the global scope.
    /// Resolving to a global with no known value poisons the enclosing
    /// function's constexpr eligibility.
    pub(crate) fn find_symbol(&mut self, hash: u32, scope: u16) -> CompileResult<Option<SymId>> {
        let cached = self.hash_cache[hash as usize % SYM_CACHE_SIZE];
        if cached < self.syms.len() && self.syms.get(cached)?.hash == hash {
            return Ok(Some(cached));
        }

        let mut best = INVALID_SYM;
        let mut exact = INVALID_SYM;
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            if sym.hash != hash {
                continue;
            }
            if sym.scope == 0 {
                best = id;
            }
            if sym.scope == scope {
                exact = id;
                break;
            }
        }
        if exact != INVALID_SYM {
            self.hash_cache[hash as usize % SYM_CACHE_SIZE] = exact;
            return Ok(Some(exact));
        }
        if best != INVALID_SYM {
            self.hash_cache[hash as usize % SYM_CACHE_SIZE] = best;
            if !self.syms.get(best)?.has_kctv() {
                self.is_constexpr = false;
            }
            return Ok(Some(best));
        }
        Ok(None)
    }

    /// Resolve the current token as a name, auto-declaring an unknown
    /// identifier as a value-less global.
    pub(crate) fn find_or_create(&mut self, scope: u16) -> CompileResult<SymId> {
        match self.find_symbol(self.token, scope)? {
            Some(id) => {
                self.accept_any()?;
                Ok(id)
            }
            None => {
                let id = self.create_named(0)?;
                self.syms.get_mut(id)?.clear_kctv();
                Ok(id)
            }
        }
    }

    /// Retire the per-function symbol population: locals lose their
    /// identity so the slots recycle, unconsumed temporaries are
    /// force-hit.
    pub(crate) fn purge_temps(&mut self) -> CompileResult<()> {
        self.clear_hash_cache();
        for id in 0..self.syms.len() {
            let sym = self.syms.get(id)?;
            if !sym.is_temp() && sym.scope != 0 {
                self.syms.get_mut(id)?.hash = 0;
            }
            let sym = self.syms.get(id)?;
            if sym.is_temp() && !sym.was_hit() {
                let s = self.syms.get_mut(id)?;
                s.hit_temp();
                s.clear_dirty();
            }
        }
        Ok(())
    }
}
