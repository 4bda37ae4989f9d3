//! Program facade: wire the pipeline, compile, run.
//!
//! A [`Script`] owns the whole toolchain for one program: tokenizer,
//! stores, assembler, driver and machine. Compilation lays the buffer
//! out as loader → implicit main → functions → memory-init table: the
//! loader walks `(address, value)` pairs appended after the last
//! function, stores each one, and falls through into main. The pair
//! table's offset and count are patched into the loader's constant pool,
//! whose position is fixed by the loader's fixed shape.

use std::io::{Cursor, Read, Seek, Write};
use std::rc::Rc;

use tracing::debug;

use crate::a2l::LineTable;
use crate::asm::{Cond, Label, PC, R0, R1, R2, R3};
use crate::compiler::Compiler;
use crate::consts::{CODE_BASE, MAX_ARGS, RES_CAPACITY};
use crate::error::{CompileResult, Diagnostic, ExecError};
use crate::fingerprint::fp;
use crate::machine::Machine;
use crate::restable::ResourceTable;
use crate::store::PagedStore;
use crate::sym::INVALID_ADDRESS;
use crate::token::Tokenizer;

const BOOT_LOOP: u32 = u32::MAX - 1;
const BOOT_DONE: u32 = u32::MAX - 2;

/// A loadable program: source in, native code and live bindings out.
pub struct Script<S, F> {
    compiler: Compiler<S, F>,
    compiled: bool,
    started: bool,
}

impl<S: Read + Seek, F: Read + Write + Seek> Script<S, F> {
    /// Build the pipeline over a source stream and three backing
    /// streams (symbols, resources, address↔line table).
    pub fn new(source: S, symbols: F, resources: F, lines: F) -> CompileResult<Self> {
        let tok = Tokenizer::new(source)?;
        let syms = PagedStore::new(symbols);
        let res = ResourceTable::new(resources, RES_CAPACITY);
        let a2l = LineTable::new(lines)?;
        let machine = Machine::new();
        let compiler = Compiler::new(tok, syms, res, a2l, machine);
        let mut script = Self { compiler, compiled: false, started: false };
        // The array constructor is an ordinary binding; scripts call it
        // as `Array(n)`.
        script.bind("Array", |machine, args| machine.alloc(args[0]))?;
        Ok(script)
    }

    /// Register a host native under `name` before compilation.
    pub fn bind(
        &mut self,
        name: &str,
        f: impl Fn(&mut Machine, &[u32; MAX_ARGS]) -> Result<u32, ExecError> + 'static,
    ) -> CompileResult<()> {
        let addr = self.compiler.machine_mut().add_native(Rc::new(f));
        self.bind_value(name, addr)
    }

    /// Register a pure host native: call sites with all-known arguments
    /// run at compile time.
    pub fn bind_pure(
        &mut self,
        name: &str,
        f: impl Fn(&mut Machine, &[u32; MAX_ARGS]) -> Result<u32, ExecError> + 'static,
    ) -> CompileResult<()> {
        let addr = self.compiler.machine_mut().add_native(Rc::new(f));
        let id = self.compiler.create_global(name)?;
        let sym = self.compiler.symbols().get_mut(id)?;
        sym.set_constant(addr);
        sym.set_constexpr();
        Ok(())
    }

    /// Register a plain integer constant.
    pub fn bind_value(&mut self, name: &str, value: u32) -> CompileResult<()> {
        let id = self.compiler.create_global(name)?;
        self.compiler.symbols().get_mut(id)?.set_constant(value);
        Ok(())
    }

    /// Compile the whole program. The first error aborts emission and
    /// carries its source position.
    pub fn compile(&mut self) -> Result<(), Diagnostic> {
        match self.compile_inner() {
            Ok(()) => {
                self.compiled = true;
                Ok(())
            }
            Err(e) => Err(self.compiler.diagnose(e)),
        }
    }

    fn compile_inner(&mut self) -> CompileResult<()> {
        self.emit_loader()?;
        self.compiler.parse_global(CODE_BASE)?;
        self.compiler.compile_functions(CODE_BASE)?;
        self.emit_mem_init()?;
        let globals = self.compiler.global_scope_size();
        self.compiler.machine_mut().set_global_count(globals);
        let image = self.compiler.assembler().writer().to_bytes();
        self.compiler.machine_mut().load_code(&image);
        debug!(globals, "compiled");
        Ok(())
    }

    /// The fixed-shape start-up loader. Its pool lands at byte 0x14;
    /// slot 0 becomes the pair-table offset, slot 1 the pair count.
    fn emit_loader(&mut self) -> CompileResult<()> {
        let asm = self.compiler.assembler();
        asm.load_const(R0, 0);
        asm.load_const(R1, 1);
        asm.add(R0, PC);
        asm.label(Label(BOOT_LOOP));
        asm.cmp_imm(R1, 0);
        asm.b_cond(Cond::Eq, Label(BOOT_DONE));
        asm.ldm(R0, 0b0000_1100); // r2 = address, r3 = value
        asm.subs_imm(R1, 1);
        asm.str(R3, R2, 0);
        asm.b(Label(BOOT_LOOP));
        asm.pool();
        asm.label(Label(BOOT_DONE));
        asm.nop();
        asm.link()
    }

    /// Append the `(address, value)` pair table and patch the loader.
    fn emit_mem_init(&mut self) -> CompileResult<()> {
        let mut init = self.compiler.assembler().tell();
        if init & 2 != 0 {
            self.compiler.assembler().nop();
            init -= 6;
        } else {
            init -= 8;
        }

        let mut pairs = 0u32;
        for id in 0..self.compiler.symbols().len() {
            let sym = self.compiler.symbols().get(id)?;
            if sym.mem_init() && sym.address != INVALID_ADDRESS {
                let (value, address) = (sym.init, sym.address);
                let asm = self.compiler.assembler();
                asm.u32_data(crate::consts::DATA_BASE + (u32::from(address) << 2));
                asm.u32_data(value);
                pairs += 1;
            }
        }
        debug!(pairs, table = format_args!("{init:#x}"), "memory-init table");

        let writer = self.compiler.assembler().writer_mut();
        writer.seek(0x14 >> 1, true);
        writer.push(init as u16);
        writer.push((init >> 16) as u16);
        writer.push(pairs as u16);
        writer.push((pairs >> 16) as u16);
        Ok(())
    }

    /// Execute the program entry once: the loader applies the
    /// memory-init table and falls through into the implicit main.
    /// Re-entry (and running an uncompiled script) is a no-op.
    pub fn run(&mut self) -> Result<u32, ExecError> {
        if !self.compiled || self.started {
            return Ok(0);
        }
        self.started = true;
        self.compiler.machine_mut().call(CODE_BASE | 1, &[])
    }

    /// Resolve a compiled global function by name.
    pub fn get_call(&mut self, name: &str) -> Option<u32> {
        let hash = fp(name);
        let len = self.compiler.symbols().len();
        for id in 0..len {
            let sym = self.compiler.symbols().get(id).ok()?;
            if sym.scope == 0 && sym.hash == hash {
                return Some(sym.init);
            }
        }
        None
    }

    /// Call a compiled global function by name.
    pub fn call(&mut self, name: &str, args: &[u32]) -> Result<u32, ExecError> {
        let addr = self
            .get_call(name)
            .ok_or(ExecError::UnboundNative { slot: u32::MAX, pc: 0 })?;
        self.compiler.machine_mut().call(addr, args)
    }

    pub fn machine(&self) -> &Machine {
        self.compiler.machine()
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        self.compiler.machine_mut()
    }

    /// The compiled image as emitted into the code buffer.
    pub fn image(&mut self) -> Vec<u8> {
        self.compiler.assembler().writer().to_bytes()
    }

    /// Map a latched fault address back to its source line.
    pub fn recover_line(&mut self, fault: u32) -> Option<u16> {
        self.compiler.line_table().recover(fault).ok().flatten()
    }

    /// Interned-resource table, e.g. to read a string a script passed
    /// to a native by fingerprint.
    pub fn resources(&mut self) -> &mut ResourceTable<F> {
        self.compiler.resources()
    }
}

impl Script<Cursor<Vec<u8>>, Cursor<Vec<u8>>> {
    /// Fully in-memory pipeline over source text.
    pub fn from_source(source: &str) -> CompileResult<Self> {
        Self::new(
            Cursor::new(source.as_bytes().to_vec()),
            Cursor::new(Vec::new()),
            Cursor::new(Vec::new()),
            Cursor::new(Vec::new()),
        )
    }
}
