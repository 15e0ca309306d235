mod common;

use std::collections::HashSet;

use adelie_layout::{block_of_page, page_of, ADDRESS_ALLOCATION_LOW, PAGE_SIZE};
use adelie_mm::sim::SimPager;
use adelie_mm::{MapFlags, MemoryManager, Prot};
use common::*;
use proptest::prelude::*;

const ANON: MapFlags = MapFlags::ANONYMOUS.union(MapFlags::PRIVATE);

/// Pages the random operations can reach: placements search forward from the
/// allocation window base, so give the checks generous slack.
const WINDOW_PAGES: u32 = 2048;

#[derive(Debug, Clone)]
enum Op {
    Mmap { page: u32, pages: u32, prot: u8, fixed: bool },
    Munmap { page: u32, pages: u32 },
    Mprotect { page: u32, pages: u32, prot: u8 },
}

fn prot_bits() -> impl Strategy<Value = u8> {
    prop_oneof![Just(1u8), Just(3u8), Just(5u8), Just(7u8)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let page = 0u32..256;
    let pages = 1u32..40;
    prop_oneof![
        (page.clone(), pages.clone(), prot_bits(), any::<bool>())
            .prop_map(|(page, pages, prot, fixed)| Op::Mmap { page, pages, prot, fixed }),
        (page.clone(), pages.clone()).prop_map(|(page, pages)| Op::Munmap { page, pages }),
        (page, pages, prot_bits()).prop_map(|(page, pages, prot)| Op::Mprotect { page, pages, prot }),
    ]
}

fn apply(mm: &mut MemoryManager<SimPager>, op: &Op) {
    let base = ADDRESS_ALLOCATION_LOW;
    match *op {
        Op::Mmap { page, pages, prot, fixed } => {
            let flags = if fixed { ANON | MapFlags::FIXED } else { ANON };
            let _ = mm.mmap(
                base + page * PAGE_SIZE,
                pages * PAGE_SIZE,
                Prot::from_bits_truncate(prot),
                flags,
                None,
                0,
            );
        }
        Op::Munmap { page, pages } => {
            let _ = mm.munmap(base + page * PAGE_SIZE, pages * PAGE_SIZE);
        }
        Op::Mprotect { page, pages, prot } => {
            let _ = mm.mprotect(
                base + page * PAGE_SIZE,
                pages * PAGE_SIZE,
                Prot::from_bits_truncate(prot),
            );
        }
    }
}

/// P1/P2/P3: the map list is sorted and disjoint, its union is exactly the
/// set of pages with non-zero protection, and block bookkeeping matches.
fn check_invariants(mm: &MemoryManager<SimPager>) {
    let mut last_end: Option<u32> = None;
    let mut mapped = HashSet::new();
    for e in mm.map_entries() {
        assert!(e.start_page <= e.end_page);
        if let Some(last) = last_end {
            assert!(e.start_page > last, "map entries out of order or overlapping");
        }
        last_end = Some(e.end_page);
        mapped.extend(e.pages());
    }

    let base = page_of(ADDRESS_ALLOCATION_LOW);
    for page in base..base + WINDOW_PAGES {
        assert_eq!(
            mm.page_prot(page) != Prot::empty(),
            mapped.contains(&page),
            "page_prot and map list disagree on page {page:#x}"
        );
    }
    for block in block_of_page(base)..block_of_page(base + WINDOW_PAGES) {
        let pages_in_block = (0..16).filter(|i| mapped.contains(&(block * 16 + i))).count();
        assert_eq!(mm.block_page_count(block) as usize, pages_in_block);
        assert_eq!(mm.block_section(block).is_some(), pages_in_block > 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn mapping_invariants_hold_under_random_ops(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let (_, mut mm) = manager();
        for op in &ops {
            apply(&mut mm, op);
            check_invariants(&mm);
        }
    }

    #[test]
    fn exact_unmap_is_a_perfect_inverse(
        pre in prop::collection::vec(op_strategy(), 0..12),
        page in 0u32..256,
        pages in 1u32..40,
        prot in prot_bits(),
    ) {
        let (_, mut mm) = manager();
        for op in &pre {
            apply(&mut mm, op);
        }
        let base_page = page_of(ADDRESS_ALLOCATION_LOW);
        let before = snapshot(&mm, base_page, base_page + WINDOW_PAGES);

        // A non-fixed mapping lands somewhere free; unmapping exactly that
        // range must restore the bookkeeping bit for bit.
        let addr = mm.mmap(
            ADDRESS_ALLOCATION_LOW + page * PAGE_SIZE,
            pages * PAGE_SIZE,
            Prot::from_bits_truncate(prot),
            ANON,
            None,
            0,
        );
        prop_assume!(addr.is_ok());
        let addr = addr.unwrap();
        mm.munmap(addr, pages * PAGE_SIZE).unwrap();

        prop_assert_eq!(before, snapshot(&mm, base_page, base_page + WINDOW_PAGES));
    }
}
