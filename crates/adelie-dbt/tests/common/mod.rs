#![allow(dead_code)]

use adelie_dbt::{Dbt, DbtConfig, GuestBus, RuntimeStubs, TlsSlots};

pub const CACHE_BASE: u32 = 0x7100_0000;
pub const CACHE_SIZE: u32 = 0x1_0000;

pub const FIND_DIRECT: u32 = 0x7F00_0010;
pub const FIND_INDIRECT: u32 = 0x7F00_0020;
pub const SYSCALL: u32 = 0x7F00_0030;
pub const TLS_HELPER: u32 = 0x7F00_0040;

/// fs-relative offsets handed out by [`FixedTls`]: slot n at 0x700 + 4n.
pub const TLS_SCRATCH: i32 = 0x700;
pub const TLS_GS: i32 = 0x704;
pub const TLS_GS_ADDR: i32 = 0x708;

pub struct VecBus {
    base: u32,
    bytes: Vec<u8>,
}

impl VecBus {
    pub fn new(base: u32, bytes: &[u8]) -> Self {
        VecBus {
            base,
            bytes: bytes.to_vec(),
        }
    }
}

impl GuestBus for VecBus {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> usize {
        let Some(off) = addr.checked_sub(self.base).map(|o| o as usize) else {
            return 0;
        };
        if off >= self.bytes.len() {
            return 0;
        }
        let n = buf.len().min(self.bytes.len() - off);
        buf[..n].copy_from_slice(&self.bytes[off..off + n]);
        n
    }
}

pub struct FixedTls {
    next: u32,
}

impl FixedTls {
    pub fn new() -> Self {
        FixedTls { next: 0 }
    }
}

impl TlsSlots for FixedTls {
    fn alloc(&mut self) -> Option<u32> {
        let slot = self.next;
        self.next += 1;
        (slot < 64).then_some(slot)
    }

    fn slot_offset(&self, slot: u32) -> i32 {
        0x700 + 4 * slot as i32
    }
}

pub fn stubs() -> RuntimeStubs {
    RuntimeStubs {
        find_direct_entry: FIND_DIRECT,
        find_indirect_entry: FIND_INDIRECT,
        syscall_entry: SYSCALL,
        tls_slot_to_offset_entry: TLS_HELPER,
    }
}

pub fn dbt_with(cache_size: u32, max_blocks: usize) -> Dbt {
    let config = DbtConfig {
        cache_base: CACHE_BASE,
        cache_size,
        max_blocks,
        stubs: stubs(),
    };
    Dbt::new(config, &mut FixedTls::new()).unwrap()
}

pub fn dbt() -> Dbt {
    dbt_with(CACHE_SIZE, 1024)
}

/// Decode a trampoline stub: `(patch_addr, target_pc, jmp_dest)`.
pub fn parse_stub(dbt: &Dbt, stub_addr: u32) -> (u32, u32, u32) {
    let b = dbt.cache().bytes_at(stub_addr, 15);
    assert_eq!(b[0], 0x68, "stub must start with push imm32");
    let patch = u32::from_le_bytes(b[1..5].try_into().unwrap());
    assert_eq!(b[5], 0x68);
    let target = u32::from_le_bytes(b[6..10].try_into().unwrap());
    assert_eq!(b[10], 0xE9);
    let rel = u32::from_le_bytes(b[11..15].try_into().unwrap());
    let dest = stub_addr.wrapping_add(15).wrapping_add(rel);
    (patch, target, dest)
}

/// Read the absolute destination of a `jmp rel32` at `addr`.
pub fn jmp_dest(dbt: &Dbt, addr: u32) -> u32 {
    let b = dbt.cache().bytes_at(addr, 5);
    assert_eq!(b[0], 0xE9);
    let rel = u32::from_le_bytes(b[1..5].try_into().unwrap());
    addr.wrapping_add(5).wrapping_add(rel)
}
