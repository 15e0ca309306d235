//! Dynamic binary translator: basic-block x86-to-x86 rewriting through a
//! chained code cache.
//!
//! Guest control flow never runs native: every entry PC is resolved through
//! [`Dbt::find_next`], which translates the basic block on a miss and hands
//! back its code-cache address. Translated blocks exit either through a
//! direct trampoline (which patches the branch displacement on first use, so
//! hot branches chain block-to-block) or through the indirect resolver entry
//! with the guest target PC on top of the guest stack.
//!
//! The runtime's assembly entry points (`dbt_find_direct_internal`,
//! `dbt_find_indirect_internal`, `syscall_handler`, `tls_slot_to_offset`) are
//! outside this crate; their addresses arrive in [`RuntimeStubs`] and the
//! emitted code targets them directly. Symmetrically, the stubs call back
//! into [`Dbt::find_next`] / [`Dbt::find_direct`].
//!
//! Single-threaded by construction: one translator, one guest thread, no
//! suspension points. A full cache triggers a flush that atomically discards
//! every block, stub and chained displacement.

pub mod cache;
mod translate;

use thiserror::Error;
use tracing::{debug, info};

pub use cache::{BlockPool, CodeCache, BLOCK_MAXSIZE, HASH_BUCKETS, OUT_ALIGN};

use translate::TranslateAbort;

/// Instruction fetch from guest memory.
///
/// `fetch` copies up to `buf.len()` bytes starting at `addr` and returns the
/// number of bytes actually readable. The translator fetches a full decode
/// window per instruction and treats a short read that truncates an
/// instruction as fatal.
pub trait GuestBus {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> usize;
}

impl<T: GuestBus + ?Sized> GuestBus for &T {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> usize {
        (**self).fetch(addr, buf)
    }
}

/// Guest-space addresses of the runtime entry points referenced by emitted
/// code.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStubs {
    /// Assembly stub that pops `patch_addr` and `target_pc` and calls
    /// [`Dbt::find_direct`].
    pub find_direct_entry: u32,
    /// Assembly stub that pops the guest target PC and calls
    /// [`Dbt::find_next`].
    pub find_indirect_entry: u32,
    /// System-call dispatcher entry (`int 0x80` lands here).
    pub syscall_entry: u32,
    /// `tls_slot_to_offset` runtime helper, callable from emitted code.
    pub tls_slot_to_offset_entry: u32,
}

/// Thread-local-storage slot allocation, consumed once at construction.
pub trait TlsSlots {
    /// Reserve a slot; `None` when the table is exhausted.
    fn alloc(&mut self) -> Option<u32>;
    /// `fs:`-relative byte offset of a slot.
    fn slot_offset(&self, slot: u32) -> i32;
}

/// `fs:`-relative offsets of the translator's per-thread slots.
#[derive(Debug, Clone, Copy)]
pub struct TlsOffsets {
    /// Spill slot for the scratch register.
    pub scratch: i32,
    /// The emulated GS selector value.
    pub gs: i32,
    /// Cached thread-base address for the emulated GS segment.
    pub gs_addr: i32,
}

/// Translator construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct DbtConfig {
    pub cache_base: u32,
    pub cache_size: u32,
    pub max_blocks: usize,
    pub stubs: RuntimeStubs,
}

impl DbtConfig {
    /// Canonical placement from the address-space layout.
    pub fn new(stubs: RuntimeStubs) -> Self {
        DbtConfig {
            cache_base: adelie_layout::DBT_CACHE_BASE,
            cache_size: adelie_layout::DBT_CACHE_SIZE,
            max_blocks: adelie_layout::DBT_MAX_BLOCKS,
            stubs,
        }
    }
}

/// Translator-fatal conditions.
///
/// These are implementation limits, not guest errors; the embedding runtime
/// is expected to abort the guest when one surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DbtError {
    #[error("guest code at {pc:#010x} is not fully readable")]
    Truncated { pc: u32 },
    #[error("unsupported prefix {byte:#04x} at {pc:#010x}")]
    UnsupportedPrefix { pc: u32, byte: u8 },
    #[error("invalid opcode {opcode:#04x} (0f={escape_0f}) at {pc:#010x}")]
    InvalidOpcode { pc: u32, opcode: u8, escape_0f: bool },
    #[error("privileged opcode {opcode:#04x} (0f={escape_0f}) at {pc:#010x}")]
    PrivilegedOpcode { pc: u32, opcode: u8, escape_0f: bool },
    #[error("unsupported opcode {opcode:#04x} (0f={escape_0f}) at {pc:#010x}")]
    UnsupportedOpcode { pc: u32, opcode: u8, escape_0f: bool },
    #[error("int {vector:#04x} at {pc:#010x} is not supported")]
    UnsupportedInt { pc: u32, vector: u8 },
    #[error("segment register {seg} at {pc:#010x} is not supported")]
    UnsupportedSegment { pc: u32, seg: u8 },
    #[error("no scratch register available at {pc:#010x}")]
    NoScratchRegister { pc: u32 },
    #[error("translated block at {pc:#010x} exceeds the block size limit")]
    BlockTooLarge { pc: u32 },
    #[error("patch address {addr:#010x} is outside the code cache")]
    BadPatchAddress { addr: u32 },
    #[error("tls slot table exhausted during translator construction")]
    TlsExhausted,
}

/// The translator context: block index, code cache, runtime interface.
pub struct Dbt {
    cache: CodeCache,
    pool: BlockPool,
    stubs: RuntimeStubs,
    tls: TlsOffsets,
}

impl Dbt {
    /// Build the translator, reserving its three TLS slots.
    pub fn new(config: DbtConfig, tls: &mut dyn TlsSlots) -> Result<Self, DbtError> {
        info!("initializing dbt subsystem");
        let scratch_slot = tls.alloc().ok_or(DbtError::TlsExhausted)?;
        let gs_slot = tls.alloc().ok_or(DbtError::TlsExhausted)?;
        let gs_addr_slot = tls.alloc().ok_or(DbtError::TlsExhausted)?;
        let offsets = TlsOffsets {
            scratch: tls.slot_offset(scratch_slot),
            gs: tls.slot_offset(gs_slot),
            gs_addr: tls.slot_offset(gs_addr_slot),
        };
        debug!(
            scratch = offsets.scratch,
            gs = offsets.gs,
            gs_addr = offsets.gs_addr,
            "dbt tls slot offsets"
        );
        Ok(Dbt {
            cache: CodeCache::new(config.cache_base, config.cache_size),
            pool: BlockPool::new(config.max_blocks),
            stubs: config.stubs,
            tls: offsets,
        })
    }

    /// Drop every translated block, stub and chained displacement.
    ///
    /// Also the `execve` reset: no translated code from before the flush may
    /// run afterwards.
    pub fn reset(&mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        debug!(blocks = self.pool.len(), "flushing code cache");
        self.pool.flush();
        self.cache.reset();
    }

    /// Number of live translated blocks.
    pub fn blocks_count(&self) -> usize {
        self.pool.len()
    }

    /// Cache address of an already translated block, without translating.
    pub fn lookup(&self, pc: u32) -> Option<u32> {
        self.pool.find(pc)
    }

    /// The code cache (test and debugger inspection).
    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Resolve guest `pc` to translated code, translating on a miss.
    ///
    /// This is the indirect-dispatch path: the runtime's indirect stub pops
    /// the target PC off the guest stack and calls here.
    pub fn find_next(&mut self, bus: &dyn GuestBus, pc: u32) -> Result<u32, DbtError> {
        if let Some(start) = self.pool.find(pc) {
            return Ok(start);
        }
        let start = self.translate(bus, pc)?;
        self.pool.insert(pc, start);
        Ok(start)
    }

    /// Resolve guest `pc` and patch the 4-byte displacement at `patch_addr`
    /// so the branch that owns it jumps straight to the block from now on.
    pub fn find_direct(&mut self, bus: &dyn GuestBus, pc: u32, patch_addr: u32) -> Result<u32, DbtError> {
        let start = self.find_next(bus, pc)?;
        if !self.cache.write_patch(patch_addr, start) {
            return Err(DbtError::BadPatchAddress { addr: patch_addr });
        }
        Ok(start)
    }

    /// Resolve the entry block for starting (or resuming) guest execution at
    /// `pc` with stack pointer `sp`, returning the cache entry address for
    /// the runtime's context-switch thunk.
    pub fn run(&mut self, bus: &dyn GuestBus, pc: u32, sp: u32) -> Result<u32, DbtError> {
        let entry = self.find_next(bus, pc)?;
        info!(
            "dbt: entering generated code at {entry:#010x} (pc {pc:#010x}, sp {sp:#010x})"
        );
        Ok(entry)
    }

    fn translate(&mut self, bus: &dyn GuestBus, pc: u32) -> Result<u32, DbtError> {
        let mut flushed = false;
        loop {
            if self.pool.is_full() || !self.cache.has_room_for_block() {
                self.flush();
                flushed = true;
            }
            match translate::translate_block(
                &mut self.cache,
                &self.pool,
                &self.stubs,
                &self.tls,
                bus,
                pc,
            ) {
                Ok(start) => return Ok(start),
                Err(TranslateAbort::CacheFull) => {
                    if flushed {
                        // An empty cache still cannot hold the block: the
                        // cache is configured smaller than one block plus its
                        // stubs.
                        return Err(DbtError::BlockTooLarge { pc });
                    }
                    self.flush();
                    flushed = true;
                }
                Err(TranslateAbort::Fatal(e)) => {
                    tracing::error!(pc = format_args!("{pc:#010x}"), "translation failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}
