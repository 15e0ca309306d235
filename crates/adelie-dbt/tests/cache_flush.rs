mod common;

use adelie_dbt::BLOCK_MAXSIZE;
use common::*;

/// One `ret` basic block per 16-byte page of guest PCs.
fn ret_everywhere() -> VecBus {
    VecBus::new(0x40_0000, &[0xC3; 0x1000])
}

#[test]
fn resolving_the_same_pc_twice_returns_the_same_address() {
    let bus = ret_everywhere();
    let mut dbt = dbt();
    let a = dbt.find_next(&bus, 0x40_0000).unwrap();
    let b = dbt.find_next(&bus, 0x40_0000).unwrap();
    assert_eq!(a, b);
    assert_eq!(dbt.blocks_count(), 1);
}

#[test]
fn cache_exhaustion_flushes_everything_and_retries() {
    let bus = ret_everywhere();
    // Room for five 16-byte block slots in front of the block-size headroom
    // (the fifth slot ends exactly at the headroom floor).
    let mut dbt = dbt_with((BLOCK_MAXSIZE + 4 * 16) as u32, 1024);

    let first = dbt.find_next(&bus, 0x40_0000).unwrap();
    assert_eq!(first, CACHE_BASE);
    for i in 1..5 {
        dbt.find_next(&bus, 0x40_0000 + i).unwrap();
    }
    assert_eq!(dbt.blocks_count(), 5);

    // The sixth block does not fit: everything is dropped, then translation
    // succeeds into the now-empty cache.
    let sixth = dbt.find_next(&bus, 0x40_0005).unwrap();
    assert_eq!(sixth, CACHE_BASE);
    assert_eq!(dbt.blocks_count(), 1);
    assert_eq!(dbt.lookup(0x40_0000), None);
    assert_eq!(dbt.lookup(0x40_0005), Some(CACHE_BASE));
}

#[test]
fn descriptor_exhaustion_also_flushes() {
    let bus = ret_everywhere();
    let mut dbt = dbt_with(CACHE_SIZE, 2);

    let a = dbt.find_next(&bus, 0x40_0000).unwrap();
    dbt.find_next(&bus, 0x40_0001).unwrap();
    assert_eq!(dbt.blocks_count(), 2);

    dbt.find_next(&bus, 0x40_0002).unwrap();
    assert_eq!(dbt.blocks_count(), 1);
    assert_eq!(dbt.lookup(0x40_0000), None);
    // The first PC translates again at a (possibly identical) fresh address.
    let a2 = dbt.find_next(&bus, 0x40_0000).unwrap();
    assert_eq!(a2, dbt.lookup(0x40_0000).unwrap());
    let _ = a;
}

#[test]
fn reset_empties_the_cache() {
    let bus = ret_everywhere();
    let mut dbt = dbt();
    dbt.find_next(&bus, 0x40_0000).unwrap();
    dbt.find_next(&bus, 0x40_0010).unwrap();
    dbt.reset();
    assert_eq!(dbt.blocks_count(), 0);
    assert_eq!(dbt.lookup(0x40_0000), None);
    // Translation restarts at the cache base.
    assert_eq!(dbt.find_next(&bus, 0x40_0020).unwrap(), CACHE_BASE);
}

#[test]
fn stub_pressure_triggers_a_clean_flush_mid_translation() {
    // jmp +0 at each PC: every block needs one trampoline stub.
    let mut code = Vec::new();
    for _ in 0..0x100 {
        code.extend_from_slice(&[0xEB, 0x00]);
    }
    let bus = VecBus::new(0x40_0000, &code);

    // Block slots and stub slots share the area above the fixed headroom;
    // each jmp block consumes one 16-byte slot at each end.
    let mut dbt = dbt_with((BLOCK_MAXSIZE + 6 * 16) as u32, 1024);

    let mut seen_flush = false;
    let mut last_count = 0;
    for i in 0..8 {
        dbt.find_next(&bus, 0x40_0000 + 2 * i).unwrap();
        let count = dbt.blocks_count();
        if count <= last_count {
            seen_flush = true;
        }
        last_count = count;
    }
    assert!(seen_flush, "stub allocation pressure must force a flush");
    // Whatever survived is still resolvable and consistent.
    let pc = 0x40_0000 + 2 * 7;
    let addr = dbt.find_next(&bus, pc).unwrap();
    assert_eq!(dbt.lookup(pc), Some(addr));
}
