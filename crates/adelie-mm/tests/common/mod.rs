#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use adelie_mm::sim::{SimHost, SimPager};
use adelie_mm::{Errno, MapFile, MemoryManager, Vfs};

/// An in-memory file for file-backed mapping tests.
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(MemFile { data })
    }

    /// A file of `len` bytes where byte `i` is `(i * 7 + 3) & 0xFF`.
    pub fn patterned(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|i| ((i * 7 + 3) & 0xFF) as u8).collect())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl MapFile for MemFile {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

/// Guest fd table for tests.
#[derive(Default)]
pub struct TestVfs {
    files: HashMap<i32, Arc<dyn MapFile>>,
}

impl TestVfs {
    pub fn new() -> Self {
        TestVfs::default()
    }

    pub fn with(fd: i32, file: Arc<dyn MapFile>) -> Self {
        let mut vfs = TestVfs::new();
        vfs.files.insert(fd, file);
        vfs
    }
}

impl Vfs for TestVfs {
    fn get(&self, fd: i32) -> Option<Arc<dyn MapFile>> {
        self.files.get(&fd).cloned()
    }
}

pub fn manager() -> (SimHost, MemoryManager<SimPager>) {
    let host = SimHost::new();
    let mm = MemoryManager::new(host.process());
    (host, mm)
}

/// Bookkeeping snapshot over a page window: guest protections, block page
/// counts, and the map ranges intersecting the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub prot: Vec<u8>,
    pub counts: Vec<u8>,
    pub ranges: Vec<(u32, u32, Option<u32>)>,
}

pub fn snapshot(mm: &MemoryManager<SimPager>, start_page: u32, end_page: u32) -> Snapshot {
    let prot = (start_page..=end_page)
        .map(|p| mm.page_prot(p).bits())
        .collect();
    let start_block = adelie_layout::block_of_page(start_page);
    let end_block = adelie_layout::block_of_page(end_page);
    let counts = (start_block..=end_block)
        .map(|b| mm.block_page_count(b))
        .collect();
    let ranges = mm
        .map_entries()
        .filter(|e| e.end_page >= start_page && e.start_page <= end_page)
        .map(|e| {
            (
                e.start_page,
                e.end_page,
                e.backing.as_ref().map(|b| b.offset_pages),
            )
        })
        .collect();
    Snapshot {
        prot,
        counts,
        ranges,
    }
}
