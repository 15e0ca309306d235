//! In-process simulated host.
//!
//! A deterministic [`HostPager`] implementation with the semantics the NT
//! backend provides: a shared table of block-sized section objects
//! ([`SimHost`], the "kernel"), and per-process views plus page protection
//! ([`SimPager`]). Fork tests create two pagers on one host; the section
//! handle count observed by the fault handler is the number of processes
//! holding the handle, exactly like `NtQueryObject`.
//!
//! [`MemoryManager`] gains guest-mode accessors here that honor host page
//! protection and route denied writes through the page-fault handler, the
//! way the host exception handler would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use adelie_layout::{block_address, block_of, page_address, page_of, BLOCK_SIZE, PAGE_SIZE};

use crate::pager::{HostPager, HostProt, PagerError, SectionHandle};
use crate::MemoryManager;

struct SectionObject {
    data: Vec<u8>,
    holders: u32,
}

#[derive(Default)]
struct HostState {
    sections: HashMap<u64, SectionObject>,
    next_id: u64,
}

/// The shared section-object table.
#[derive(Clone, Default)]
pub struct SimHost {
    state: Arc<Mutex<HostState>>,
}

impl SimHost {
    pub fn new() -> Self {
        SimHost::default()
    }

    /// A fresh process address space on this host.
    pub fn process(&self) -> SimPager {
        SimPager {
            host: self.clone(),
            held: HashSet::new(),
            views: HashMap::new(),
            prot: HashMap::new(),
            create_budget: None,
        }
    }

    /// Number of live section objects (leak checks).
    pub fn live_sections(&self) -> usize {
        self.state.lock().unwrap().sections.len()
    }
}

/// One process's view of the simulated host.
pub struct SimPager {
    host: SimHost,
    held: HashSet<u64>,
    views: HashMap<u32, u64>,
    prot: HashMap<u32, HostProt>,
    create_budget: Option<u32>,
}

impl SimPager {
    /// Allow `n` further section creations, then fail them (rollback tests).
    pub fn limit_section_creates(&mut self, n: u32) {
        self.create_budget = Some(n);
    }

    /// Host protection currently applied to the page containing `addr`, if
    /// the page is backed by a view.
    pub fn host_prot(&self, addr: u32) -> Option<HostProt> {
        self.prot.get(&page_address(page_of(addr))).copied()
    }

    fn view_of(&self, addr: u32) -> Result<(u64, usize), PagerError> {
        let block_addr = block_address(block_of(addr));
        let id = *self
            .views
            .get(&block_addr)
            .ok_or(PagerError::Access { addr })?;
        Ok((id, (addr - block_addr) as usize))
    }
}

impl HostPager for SimPager {
    fn create_section(&mut self) -> Result<SectionHandle, PagerError> {
        if let Some(budget) = &mut self.create_budget {
            if *budget == 0 {
                return Err(PagerError::CreateSection);
            }
            *budget -= 1;
        }
        let mut host = self.host.state.lock().unwrap();
        host.next_id += 1;
        let id = host.next_id;
        host.sections.insert(
            id,
            SectionObject {
                data: vec![0; BLOCK_SIZE as usize],
                holders: 1,
            },
        );
        self.held.insert(id);
        Ok(SectionHandle::from_raw(id))
    }

    fn map_section(&mut self, section: SectionHandle, addr: u32) -> Result<(), PagerError> {
        if addr % BLOCK_SIZE != 0 || self.views.contains_key(&addr) {
            return Err(PagerError::MapView { addr });
        }
        let id = section.raw();
        let mut host = self.host.state.lock().unwrap();
        let obj = host.sections.get_mut(&id).ok_or(PagerError::BadHandle)?;
        // Mapping into a process that has no handle yet (fork) hands it one.
        if self.held.insert(id) {
            obj.holders += 1;
        }
        self.views.insert(addr, id);
        for i in 0..(BLOCK_SIZE / PAGE_SIZE) {
            self.prot
                .insert(addr + i * PAGE_SIZE, HostProt::ExecuteReadWrite);
        }
        Ok(())
    }

    fn unmap_view(&mut self, addr: u32) -> Result<(), PagerError> {
        if self.views.remove(&addr).is_none() {
            return Err(PagerError::UnmapView { addr });
        }
        for i in 0..(BLOCK_SIZE / PAGE_SIZE) {
            self.prot.remove(&(addr + i * PAGE_SIZE));
        }
        Ok(())
    }

    fn close_section(&mut self, section: SectionHandle) -> Result<(), PagerError> {
        let id = section.raw();
        if !self.held.remove(&id) {
            return Err(PagerError::BadHandle);
        }
        let mut host = self.host.state.lock().unwrap();
        let obj = host.sections.get_mut(&id).ok_or(PagerError::BadHandle)?;
        obj.holders -= 1;
        if obj.holders == 0 {
            host.sections.remove(&id);
        }
        Ok(())
    }

    fn section_owner_count(&self, section: SectionHandle) -> Result<u32, PagerError> {
        let host = self.host.state.lock().unwrap();
        host.sections
            .get(&section.raw())
            .map(|o| o.holders)
            .ok_or(PagerError::BadHandle)
    }

    fn protect(&mut self, addr: u32, len: u32, prot: HostProt) -> Result<(), PagerError> {
        let mut page_addr = page_address(page_of(addr));
        while page_addr < addr + len {
            if !self.views.contains_key(&block_address(block_of(page_addr))) {
                return Err(PagerError::Protect { addr: page_addr });
            }
            self.prot.insert(page_addr, prot);
            page_addr += PAGE_SIZE;
        }
        Ok(())
    }

    fn copy_block_into_section(
        &mut self,
        dst: SectionHandle,
        src_addr: u32,
    ) -> Result<(), PagerError> {
        let (src_id, _) = self.view_of(src_addr)?;
        let mut host = self.host.state.lock().unwrap();
        let src = host
            .sections
            .get(&src_id)
            .ok_or(PagerError::BadHandle)?
            .data
            .clone();
        let dst = host
            .sections
            .get_mut(&dst.raw())
            .ok_or(PagerError::BadHandle)?;
        dst.data = src;
        Ok(())
    }

    fn write_guest(&mut self, addr: u32, data: &[u8]) -> Result<(), PagerError> {
        let mut off = 0usize;
        while off < data.len() {
            let a = addr + off as u32;
            let (id, view_off) = self.view_of(a)?;
            let n = (BLOCK_SIZE as usize - view_off).min(data.len() - off);
            let mut host = self.host.state.lock().unwrap();
            let obj = host.sections.get_mut(&id).ok_or(PagerError::BadHandle)?;
            obj.data[view_off..view_off + n].copy_from_slice(&data[off..off + n]);
            off += n;
        }
        Ok(())
    }

    fn read_guest(&self, addr: u32, buf: &mut [u8]) -> Result<(), PagerError> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = addr + off as u32;
            let (id, view_off) = self.view_of(a)?;
            let n = (BLOCK_SIZE as usize - view_off).min(buf.len() - off);
            let host = self.host.state.lock().unwrap();
            let obj = host.sections.get(&id).ok_or(PagerError::BadHandle)?;
            buf[off..off + n].copy_from_slice(&obj.data[view_off..view_off + n]);
            off += n;
        }
        Ok(())
    }
}

impl MemoryManager<SimPager> {
    /// Write as the guest would: host page protection applies, and a denied
    /// write goes through the page-fault handler (copy-on-write) before one
    /// retry, like the host exception path.
    pub fn guest_write(&mut self, addr: u32, data: &[u8]) -> Result<(), PagerError> {
        let mut off = 0usize;
        while off < data.len() {
            let a = addr + off as u32;
            let page_end = page_address(page_of(a)) + PAGE_SIZE;
            let n = ((page_end - a) as usize).min(data.len() - off);
            let writable = self
                .pager()
                .host_prot(a)
                .is_some_and(|p| p.allows_write());
            if !writable {
                if !self.handle_page_fault(a) {
                    return Err(PagerError::Access { addr: a });
                }
                let fixed = self
                    .pager()
                    .host_prot(a)
                    .is_some_and(|p| p.allows_write());
                if !fixed {
                    return Err(PagerError::Access { addr: a });
                }
            }
            self.pager_mut().write_guest(a, &data[off..off + n])?;
            off += n;
        }
        Ok(())
    }

    /// Read as the guest would; host page protection applies.
    pub fn guest_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), PagerError> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = addr + off as u32;
            let page_end = page_address(page_of(a)) + PAGE_SIZE;
            let n = ((page_end - a) as usize).min(buf.len() - off);
            let readable = self
                .pager()
                .host_prot(a)
                .is_some_and(|p| p.allows_read());
            if !readable {
                return Err(PagerError::Access { addr: a });
            }
            self.pager().read_guest(a, &mut buf[off..off + n])?;
            off += n;
        }
        Ok(())
    }
}
