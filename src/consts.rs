//! Target memory map and compiler limits.

/* MEMORY MAP */

/// Base address of the code buffer. The emitted program both lives and
/// executes here.
pub const CODE_BASE: u32 = 0x2000_0000;

/// Code buffer capacity in bytes.
pub const CODE_SIZE: u32 = 0x800;

/// Base address of the data section holding global slots.
pub const DATA_BASE: u32 = 0x2000_4000;

/// Data section capacity in bytes (512 word slots).
pub const DATA_SIZE: u32 = 0x800;

/// Base address of the SRAM region shared by the script heap (growing up)
/// and the runtime call stack (growing down).
pub const SRAM_BASE: u32 = 0x1000_0000;

/// SRAM region size in bytes.
pub const SRAM_SIZE: u32 = 0x8000;

/// First address past the SRAM region; initial stack pointer.
pub const STACK_TOP: u32 = SRAM_BASE + SRAM_SIZE;

/// SRAM bytes below the stack top the heap allocator never hands out.
pub const STACK_RESERVE: u32 = 0x1000;

/// Base of the memory-mapped input register page read by `pressed`.
pub const INPUT_BASE: u32 = 0xA000_0020;

/// Input page size in bytes.
pub const INPUT_SIZE: u32 = 0x20;

/// Base of the reserved window host natives are dispatched through. A
/// `BLX` into this window calls the bound native instead of fetching
/// instructions.
pub const NATIVE_BASE: u32 = 0xF000_0000;

/// Native slots reserved by the machine itself: signed division and
/// divmod helpers the emitted code calls for `/` and `%`.
pub const NATIVE_IDIV: u32 = 0;
pub const NATIVE_IDIVMOD: u32 = 1;

/* COMPILER LIMITS */

/// Maximum call/declaration argument count; arguments marshal into
/// R0..R6.
pub const MAX_ARGS: usize = 7;

/// Maximum element count of one array-literal construction buffer.
pub const MAX_ARRAY_LITERAL: usize = 512;

/// Low registers the allocator hands out (R0..R6). R7 is the reserved
/// scratch register.
pub const ALLOC_REGS: usize = 7;

/// Registers clobbered by calls (R0..R3).
pub const SCRATCH_REGS: usize = 4;

/// Head-region capacity of the resource table, in (key, offset) pairs.
pub const RES_CAPACITY: u32 = 64;

/// Capacity of the assembler's forward-symbol table per function.
pub const LABEL_CAPACITY: usize = 256;

/// Capacity of the assembler's constant pool per function.
pub const POOL_CAPACITY: usize = 128;

/// Direct-mapped fingerprint -> symbol id lookup cache size.
pub const SYM_CACHE_SIZE: usize = 128;

/// Word slots in the tokenizer's text buffer.
pub const MAX_TOKEN_TEXT: usize = 32;
