//! Paged virtual memory manager.
//!
//! The guest sees 4 KiB pages with Linux `mmap`/`munmap`/`mprotect`/`brk`
//! semantics; the host only allocates 64 KiB blocks. Every mapped page lives
//! inside a block backed by a shareable section object mapped at the block's
//! canonical guest address. Per-page protection is applied on top with host
//! protection calls.
//!
//! Copy-on-write `fork` builds on the section objects: the child maps the
//! parent's sections at the same addresses, write permission is withdrawn in
//! both processes, and the first write on either side faults into
//! [`MemoryManager::handle_page_fault`], which duplicates the section when
//! the handle is still shared.
//!
//! All host interaction goes through the [`HostPager`] capability; the
//! manager itself is host-agnostic. Guest-visible entry points (`sys_*`)
//! return negative Linux errno values and never panic.

pub mod errno;
pub mod maplist;
pub mod pager;
pub mod sim;

use std::sync::Arc;

use tracing::{debug, info, warn};

use adelie_layout::{
    align_to_page, block_address, block_of, block_of_page, first_page_of_block, is_page_aligned,
    page_address, page_of, ADDRESS_ALLOCATION_HIGH, ADDRESS_ALLOCATION_LOW, ADDRESS_SPACE_HIGH,
    BLOCK_COUNT, BLOCK_SIZE, HEAP_BASE, PAGES_PER_BLOCK, PAGE_COUNT, PAGE_SIZE,
};

pub use errno::Errno;
pub use maplist::{FileBacking, MapEntry, MapList, MAX_MAP_ENTRIES};
pub use pager::{prot_to_host, HostPager, HostProt, MapFlags, PagerError, Prot, SectionHandle};

/// File object a mapping can be backed by (the VFS collaboration surface).
///
/// Reference counting is the `Arc` itself: the map entry holds a clone while
/// the mapping lives and drops it when the entry dies.
pub trait MapFile {
    /// Read up to `buf.len()` bytes at byte `offset`, returning the number of
    /// bytes read. Bytes beyond end-of-file are left untouched (fresh
    /// sections are zero-filled).
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Errno>;
}

/// Guest fd resolution (the VFS collaboration surface for `sys_mmap`).
pub trait Vfs {
    fn get(&self, fd: i32) -> Option<Arc<dyn MapFile>>;
}

/// The memory manager of one guest process.
pub struct MemoryManager<P: HostPager> {
    pager: P,
    brk: u32,
    page_prot: Box<[Prot]>,
    sections: Box<[Option<SectionHandle>]>,
    page_counts: Box<[u8]>,
    map: MapList,
}

impl<P: HostPager> MemoryManager<P> {
    pub fn new(pager: P) -> Self {
        info!("initializing memory subsystem");
        MemoryManager {
            pager,
            brk: 0,
            page_prot: vec![Prot::empty(); PAGE_COUNT].into_boxed_slice(),
            sections: vec![None; BLOCK_COUNT].into_boxed_slice(),
            page_counts: vec![0u8; BLOCK_COUNT].into_boxed_slice(),
            map: MapList::new(),
        }
    }

    pub fn pager(&self) -> &P {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut P {
        &mut self.pager
    }

    /// Guest protection of a page; empty means unmapped.
    pub fn page_prot(&self, page: u32) -> Prot {
        self.page_prot[page as usize]
    }

    /// Section handle backing a block, if any page of it is mapped.
    pub fn block_section(&self, block: u32) -> Option<SectionHandle> {
        self.sections[block as usize]
    }

    /// Number of mapped pages inside a block.
    pub fn block_page_count(&self, block: u32) -> u8 {
        self.page_counts[block as usize]
    }

    pub fn map_entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.map.iter()
    }

    /// Current program break.
    pub fn brk(&self) -> u32 {
        self.brk
    }

    /// Raise the program break watermark (loader seeding; never lowers).
    pub fn update_brk(&mut self, addr: u32) {
        self.brk = self.brk.max(addr);
    }

    /// First free run of pages large enough for `len_bytes` in the general
    /// allocation window.
    pub fn find_free_pages(&self, len_bytes: u32) -> Option<u32> {
        let count = (align_to_page(len_bytes as u64) / PAGE_SIZE as u64) as u32;
        self.free_run(count, ADDRESS_ALLOCATION_LOW, ADDRESS_ALLOCATION_HIGH)
    }

    fn free_run(&self, count: u32, low: u32, high: u32) -> Option<u32> {
        let mut last = page_of(low);
        for e in self.map.iter() {
            if e.end_page < last {
                continue;
            }
            if e.start_page >= last + count {
                break;
            }
            last = e.end_page + 1;
        }
        (last + count <= page_of(high)).then_some(last)
    }

    /// Release every user mapping (the `execve` reset). Regions outside the
    /// user allocation window survive.
    pub fn reset(&mut self) {
        debug!("resetting user address space");
        for block in block_of(ADDRESS_ALLOCATION_LOW)..block_of(ADDRESS_ALLOCATION_HIGH) {
            if let Some(section) = self.sections[block as usize].take() {
                let _ = self.pager.unmap_view(block_address(block));
                let _ = self.pager.close_section(section);
                self.page_counts[block as usize] = 0;
            }
        }
        let user_start = page_of(ADDRESS_ALLOCATION_LOW);
        let user_end = page_of(ADDRESS_ALLOCATION_HIGH);
        if let Some(removed) = self.map.carve(user_start, user_end - 1) {
            for (s, e) in removed {
                for p in s..=e {
                    self.page_prot[p as usize] = Prot::empty();
                }
            }
        }
    }

    /// Release everything the manager owns.
    pub fn shutdown(&mut self) {
        for block in 0..BLOCK_COUNT as u32 {
            if let Some(section) = self.sections[block as usize].take() {
                let _ = self.pager.unmap_view(block_address(block));
                let _ = self.pager.close_section(section);
                self.page_counts[block as usize] = 0;
            }
        }
        self.page_prot.fill(Prot::empty());
        self.map = MapList::new();
    }

    /// Apply one host protection across `[start_page, end_page]`, splitting
    /// the calls at block boundaries (a host protect call must not span
    /// views).
    fn apply_host_prot(
        &mut self,
        start_page: u32,
        end_page: u32,
        prot: HostProt,
    ) -> Result<(), PagerError> {
        let mut p = start_page;
        while p <= end_page {
            let block_end = first_page_of_block(block_of_page(p)) + PAGES_PER_BLOCK - 1;
            let run_end = end_page.min(block_end);
            self.pager.protect(
                page_address(p),
                (run_end - p + 1) * PAGE_SIZE,
                prot,
            )?;
            p = run_end + 1;
        }
        Ok(())
    }

    /// Map `length` bytes with Linux `mmap` semantics.
    ///
    /// Without `MAP_FIXED` the given address is ignored and the first free
    /// run in the allocation window is used (`MAP_HEAP` selects the low heap
    /// window instead).
    pub fn mmap(
        &mut self,
        addr: u32,
        length: u32,
        prot: Prot,
        flags: MapFlags,
        file: Option<Arc<dyn MapFile>>,
        offset_pages: u32,
    ) -> Result<u32, Errno> {
        if length == 0 {
            return Err(Errno::EINVAL);
        }
        let length = align_to_page(length as u64);
        if (addr as u64) + length >= ADDRESS_SPACE_HIGH as u64 {
            return Err(Errno::EINVAL);
        }
        if flags.contains(MapFlags::SHARED) {
            debug!("MAP_SHARED is not supported");
            return Err(Errno::EINVAL);
        }
        if flags.contains(MapFlags::ANONYMOUS) && file.is_some() {
            debug!("MAP_ANONYMOUS with a file descriptor");
            return Err(Errno::EINVAL);
        }
        if !flags.contains(MapFlags::ANONYMOUS) && file.is_none() {
            debug!("file mapping without a usable file");
            return Err(Errno::EBADF);
        }

        let addr = if flags.contains(MapFlags::FIXED) {
            if !is_page_aligned(addr) {
                debug!("MAP_FIXED with unaligned address");
                return Err(Errno::EINVAL);
            }
            addr
        } else {
            let count = (length / PAGE_SIZE as u64) as u32;
            let run = if flags.contains(MapFlags::HEAP) {
                self.free_run(count, HEAP_BASE, ADDRESS_ALLOCATION_LOW)
            } else {
                self.free_run(count, ADDRESS_ALLOCATION_LOW, ADDRESS_ALLOCATION_HIGH)
            };
            let Some(page) = run else {
                debug!("no free pages for anonymous placement");
                return Err(Errno::ENOMEM);
            };
            page_address(page)
        };

        let start_page = page_of(addr);
        let end_page = page_of(addr + (length - 1) as u32);
        let start_block = block_of(addr);
        let end_block = block_of_page(end_page);

        // Fixed mappings displace whatever they overlap; searched placements
        // are free by construction.
        if flags.contains(MapFlags::FIXED) {
            self.munmap(addr, length as u32)?;
        }

        if self.map.is_full() {
            return Err(Errno::ENOMEM);
        }

        // Back every touched block with a section, rolling back the sections
        // this call created if the host runs out.
        let mut created = Vec::new();
        let mut backing_error = None;
        for block in start_block..=end_block {
            if self.page_counts[block as usize] != 0 {
                continue;
            }
            match self.pager.create_section() {
                Ok(section) => {
                    if let Err(e) = self.pager.map_section(section, block_address(block)) {
                        let _ = self.pager.close_section(section);
                        backing_error = Some(e);
                        break;
                    }
                    self.sections[block as usize] = Some(section);
                    created.push(block);
                }
                Err(e) => {
                    backing_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = backing_error {
            warn!("backing blocks for the mapping failed: {e}");
            for &b in &created {
                let section = self.sections[b as usize].take();
                let _ = self.pager.unmap_view(block_address(b));
                if let Some(section) = section {
                    let _ = self.pager.close_section(section);
                }
            }
            return Err(Errno::ENOMEM);
        }

        let backing = file.as_ref().map(|f| FileBacking {
            file: Arc::clone(f),
            offset_pages,
        });
        let inserted = self.map.insert(MapEntry {
            start_page,
            end_page,
            backing,
        });
        debug_assert!(inserted);

        for page in start_page..=end_page {
            self.page_prot[page as usize] = prot;
            self.page_counts[block_of_page(page) as usize] += 1;
        }

        // File content is read eagerly (no demand paging). The load runs
        // with write permission forced in the *host* protection only; the
        // recorded guest protection stays the caller's.
        let load_prot = if file.is_some() {
            prot_to_host(prot | Prot::WRITE)
        } else {
            prot_to_host(prot)
        };
        if self.apply_host_prot(start_page, end_page, load_prot).is_err() {
            return Err(Errno::ENOMEM);
        }
        if let Some(f) = &file {
            let f = Arc::clone(f);
            self.load_file(&f, start_page, end_page, offset_pages);
            if !prot.contains(Prot::WRITE)
                && self
                    .apply_host_prot(start_page, end_page, prot_to_host(prot))
                    .is_err()
            {
                return Err(Errno::ENOMEM);
            }
        }

        debug!("mapped {length:#x} bytes at {addr:#010x}");
        Ok(addr)
    }

    fn load_file(&mut self, file: &Arc<dyn MapFile>, start_page: u32, end_page: u32, offset_pages: u32) {
        let mut chunk = vec![0u8; BLOCK_SIZE as usize];
        let mut page = start_page;
        let mut offset = offset_pages as u64 * PAGE_SIZE as u64;
        while page <= end_page {
            let pages = (end_page - page + 1).min(PAGES_PER_BLOCK);
            let len = (pages * PAGE_SIZE) as usize;
            match file.pread(&mut chunk[..len], offset) {
                Ok(n) => {
                    if n > 0 {
                        if let Err(e) = self.pager.write_guest(page_address(page), &chunk[..n]) {
                            warn!("file load into {:#010x} failed: {e}", page_address(page));
                            return;
                        }
                    }
                    if n < len {
                        // End of file: the rest of the mapping stays zero.
                        return;
                    }
                }
                Err(e) => {
                    debug!("pread for file mapping failed: {e}");
                    return;
                }
            }
            page += pages;
            offset += len as u64;
        }
    }

    /// Unmap `[addr, addr + length)` with Linux `munmap` semantics.
    pub fn munmap(&mut self, addr: u32, length: u32) -> Result<(), Errno> {
        if !is_page_aligned(addr) {
            return Err(Errno::EINVAL);
        }
        if length == 0 {
            return Ok(());
        }
        let length = align_to_page(length as u64);
        if (addr as u64) + length >= ADDRESS_SPACE_HIGH as u64 {
            return Err(Errno::EINVAL);
        }

        let start_page = page_of(addr);
        let end_page = page_of(addr + (length - 1) as u32);
        let removed = self.map.carve(start_page, end_page).ok_or(Errno::ENOMEM)?;
        for (run_start, run_end) in removed {
            for page in run_start..=run_end {
                self.page_prot[page as usize] = Prot::empty();
                self.page_counts[block_of_page(page) as usize] -= 1;
            }
            for block in block_of_page(run_start)..=block_of_page(run_end) {
                if self.page_counts[block as usize] == 0 {
                    if let Some(section) = self.sections[block as usize].take() {
                        let _ = self.pager.unmap_view(block_address(block));
                        let _ = self.pager.close_section(section);
                    }
                } else {
                    // The block survives for its other pages; shut the
                    // removed ones off at the host level.
                    let s = run_start.max(first_page_of_block(block));
                    let e = run_end.min(first_page_of_block(block) + PAGES_PER_BLOCK - 1);
                    let _ = self.apply_host_prot(s, e, HostProt::NoAccess);
                }
            }
        }
        Ok(())
    }

    /// Change protection with Linux `mprotect` semantics.
    ///
    /// Every page of the range must be mapped (by a contiguous union of
    /// entries), or the whole call fails with `ENOMEM`. A page whose prior
    /// protection had `PROT_WRITE` withdrawn at the host level keeps it
    /// withdrawn, so copy-on-write tracking survives `mprotect`.
    pub fn mprotect(&mut self, addr: u32, length: u32, prot: Prot) -> Result<(), Errno> {
        if !is_page_aligned(addr) {
            return Err(Errno::EINVAL);
        }
        if length == 0 {
            return Ok(());
        }
        let length = align_to_page(length as u64);
        if (addr as u64) + length >= ADDRESS_SPACE_HIGH as u64 {
            return Err(Errno::EINVAL);
        }
        let start_page = page_of(addr);
        let end_page = page_of(addr + (length - 1) as u32);

        // The union of map entries over the range must have no holes.
        let mut covered_to = start_page; // exclusive
        for e in self.map.iter() {
            if e.start_page > end_page {
                break;
            }
            if e.end_page + 1 <= covered_to {
                continue;
            }
            if e.start_page > covered_to {
                break;
            }
            covered_to = e.end_page + 1;
        }
        if covered_to <= end_page {
            return Err(Errno::ENOMEM);
        }

        // Apply host protection in runs of identical prior guest protection.
        let mut run_start = start_page;
        for page in start_page..=end_page + 1 {
            if page != end_page + 1
                && self.page_prot[page as usize] == self.page_prot[run_start as usize]
            {
                continue;
            }
            let old = self.page_prot[run_start as usize];
            let host = if old.contains(Prot::WRITE) {
                prot_to_host(prot)
            } else {
                prot_to_host(prot - Prot::WRITE)
            };
            if self.apply_host_prot(run_start, page - 1, host).is_err() {
                return Err(Errno::ENOMEM);
            }
            run_start = page;
        }
        for page in start_page..=end_page {
            self.page_prot[page as usize] = prot;
        }
        Ok(())
    }

    /// Handle a host access violation at `addr`.
    ///
    /// Returns `true` when the fault was a copy-on-write or protection
    /// restoration event and the faulting instruction should be resumed.
    /// Returns `false` for anything this manager cannot explain; the host's
    /// default handling then terminates the guest.
    pub fn handle_page_fault(&mut self, addr: u32) -> bool {
        let page = page_of(addr);
        debug!("page fault at {addr:#010x} (page {page:#x})");
        if addr >= ADDRESS_SPACE_HIGH {
            debug!("fault outside the guest address space");
            return false;
        }
        if !self.page_prot[page as usize].contains(Prot::WRITE) {
            debug!("faulting page is not writable in guest terms");
            return false;
        }
        let block = block_of(addr);
        let Some(section) = self.sections[block as usize] else {
            debug!("faulting block has no section");
            return false;
        };

        let owners = match self.pager.section_owner_count(section) {
            Ok(n) => n,
            Err(e) => {
                debug!("querying section owners failed: {e}");
                return false;
            }
        };
        if owners > 1 {
            // Shared after fork: duplicate the section, then retake the
            // block address with the private copy.
            debug!("duplicating shared section for block {block:#x}");
            let Ok(fresh) = self.pager.create_section() else {
                return false;
            };
            let block_addr = block_address(block);
            // The source may be partially unreadable; open it up for the
            // copy (per-page protection is rebuilt below anyway).
            if self
                .pager
                .protect(block_addr, BLOCK_SIZE, HostProt::ExecuteRead)
                .is_err()
                || self.pager.copy_block_into_section(fresh, block_addr).is_err()
                || self.pager.unmap_view(block_addr).is_err()
            {
                let _ = self.pager.close_section(fresh);
                return false;
            }
            let _ = self.pager.close_section(section);
            self.sections[block as usize] = Some(fresh);
            if self.pager.map_section(fresh, block_addr).is_err() {
                return false;
            }
        } else {
            debug!("sole owner of block {block:#x}, restoring protection");
        }

        // Private again: rebuild the per-page host protection of the whole
        // block from the guest view.
        for i in 0..PAGES_PER_BLOCK {
            let page = first_page_of_block(block) + i;
            let host = prot_to_host(self.page_prot[page as usize]);
            if self
                .pager
                .protect(page_address(page), PAGE_SIZE, host)
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Fork: reproduce this address space in a child process (driven by
    /// `child_pager`) and arm copy-on-write on both sides.
    pub fn fork(&mut self, mut child_pager: P) -> Result<MemoryManager<P>, PagerError> {
        // The child maps the very same sections at the same canonical
        // addresses; the section handles are shared between the processes.
        for block in 0..BLOCK_COUNT as u32 {
            if let Some(section) = self.sections[block as usize] {
                child_pager.map_section(section, block_address(block))?;
            }
        }

        let mut child = MemoryManager {
            pager: child_pager,
            brk: self.brk,
            page_prot: self.page_prot.clone(),
            sections: self.sections.clone(),
            page_counts: self.page_counts.clone(),
            map: self.map.clone(),
        };

        // Withdraw write permission everywhere in both processes: the first
        // write on either side faults and duplicates.
        let runs: Vec<(u32, u32)> = self
            .map
            .iter()
            .map(|e| (e.start_page, e.end_page))
            .collect();
        for (start, end) in runs {
            for page in start..=end {
                let host = prot_to_host(self.page_prot[page as usize] - Prot::WRITE);
                child.pager.protect(page_address(page), PAGE_SIZE, host)?;
                self.pager.protect(page_address(page), PAGE_SIZE, host)?;
            }
        }
        Ok(child)
    }

    // Guest-visible entry points. These log like syscalls, flatten errors to
    // negative errnos, and never panic.

    pub fn sys_mmap(
        &mut self,
        vfs: &dyn Vfs,
        addr: u32,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    ) -> i32 {
        debug!("mmap({addr:#x}, {length:#x}, {prot:#x}, {flags:#x}, {fd}, {offset:#x})");
        if offset % PAGE_SIZE != 0 {
            return Errno::EINVAL.to_ret();
        }
        self.mmap_entry(vfs, addr, length, prot, flags, fd, offset / PAGE_SIZE)
    }

    /// `mmap2`: identical to `sys_mmap` except the offset argument is already
    /// in pages.
    pub fn sys_mmap2(
        &mut self,
        vfs: &dyn Vfs,
        addr: u32,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset_pages: u32,
    ) -> i32 {
        debug!("mmap2({addr:#x}, {length:#x}, {prot:#x}, {flags:#x}, {fd}, {offset_pages:#x})");
        self.mmap_entry(vfs, addr, length, prot, flags, fd, offset_pages)
    }

    /// The ancient one-argument `mmap`: six longs read from guest memory.
    pub fn sys_oldmmap(&mut self, vfs: &dyn Vfs, args_addr: u32) -> i32 {
        debug!("oldmmap({args_addr:#x})");
        let mut raw = [0u8; 24];
        if self.pager.read_guest(args_addr, &mut raw).is_err() {
            return Errno::EFAULT.to_ret();
        }
        let arg = |i: usize| u32::from_le_bytes(raw[4 * i..4 * i + 4].try_into().unwrap());
        self.sys_mmap(vfs, arg(0), arg(1), arg(2), arg(3), arg(4) as i32, arg(5))
    }

    fn mmap_entry(
        &mut self,
        vfs: &dyn Vfs,
        addr: u32,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset_pages: u32,
    ) -> i32 {
        let prot = Prot::from_bits_truncate(prot as u8);
        let flags = MapFlags::from_bits_truncate(flags);
        match self.mmap(addr, length, prot, flags, vfs.get(fd), offset_pages) {
            Ok(addr) => addr as i32,
            Err(e) => e.to_ret(),
        }
    }

    pub fn sys_munmap(&mut self, addr: u32, length: u32) -> i32 {
        debug!("munmap({addr:#x}, {length:#x})");
        match self.munmap(addr, length) {
            Ok(()) => 0,
            Err(e) => e.to_ret(),
        }
    }

    pub fn sys_mprotect(&mut self, addr: u32, length: u32, prot: u32) -> i32 {
        debug!("mprotect({addr:#x}, {length:#x}, {prot:#x})");
        match self.mprotect(addr, length, Prot::from_bits_truncate(prot as u8)) {
            Ok(()) => 0,
            Err(e) => e.to_ret(),
        }
    }

    /// `brk(0)` queries; growing maps the gap read/write/execute. Shrinking
    /// is not supported yet.
    pub fn sys_brk(&mut self, addr: u32) -> i32 {
        debug!("brk({addr:#x}), current {:#x}", self.brk);
        let cur = align_to_page(self.brk as u64) as u32;
        let new = align_to_page(addr as u64) as u32;
        if addr > self.brk {
            if new > cur {
                let r = self.mmap(
                    cur,
                    new - cur,
                    Prot::READ | Prot::WRITE | Prot::EXEC,
                    MapFlags::FIXED | MapFlags::ANONYMOUS | MapFlags::PRIVATE,
                    None,
                    0,
                );
                if r.is_err() {
                    debug!("enlarging brk failed");
                    return Errno::ENOMEM.to_ret();
                }
            }
            self.brk = new;
        }
        self.brk as i32
    }

    pub fn sys_msync(&mut self, _addr: u32, _length: u32, _flags: u32) -> i32 {
        0
    }

    pub fn sys_mlock(&mut self, _addr: u32, _length: u32) -> i32 {
        0
    }

    pub fn sys_munlock(&mut self, _addr: u32, _length: u32) -> i32 {
        0
    }
}

impl<P: HostPager> Drop for MemoryManager<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
