//! Host paging capability.
//!
//! The memory manager only ever talks to the host through this trait: block
//! sized shareable section objects, view mapping at fixed guest addresses,
//! page-granular protection, and host-privileged bulk copies. On an NT host
//! these map 1:1 onto `NtCreateSection` / `NtMapViewOfSection` /
//! `NtUnmapViewOfSection` / `NtClose` / `NtQueryObject` (handle count) /
//! `VirtualProtect` / `CopyMemory`. The [`crate::sim`] implementation
//! provides the same semantics in-process for tests and non-NT hosts.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Guest page protection (`PROT_*`). Empty means unmapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags! {
    /// Guest mapping flags (`MAP_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
        /// Internal: allocate from the low heap window instead of the general
        /// allocation window. Never set by the guest.
        const HEAP = 0x0200_0000;
    }
}

/// Host page protection constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProt {
    NoAccess,
    ReadOnly,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

/// Guest protection bits to host protection.
pub fn prot_to_host(prot: Prot) -> HostProt {
    if prot.contains(Prot::EXEC | Prot::WRITE) {
        HostProt::ExecuteReadWrite
    } else if prot.contains(Prot::EXEC | Prot::READ) {
        HostProt::ExecuteRead
    } else if prot.contains(Prot::EXEC) {
        HostProt::Execute
    } else if prot.contains(Prot::WRITE) {
        HostProt::ReadWrite
    } else if prot.contains(Prot::READ) {
        HostProt::ReadOnly
    } else {
        HostProt::NoAccess
    }
}

impl HostProt {
    /// Whether a guest-mode read access is allowed.
    pub fn allows_read(self) -> bool {
        !matches!(self, HostProt::NoAccess | HostProt::Execute)
    }

    /// Whether a guest-mode write access is allowed.
    pub fn allows_write(self) -> bool {
        matches!(self, HostProt::ReadWrite | HostProt::ExecuteReadWrite)
    }
}

/// Opaque handle to a shareable, executable, read/write section object of
/// one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionHandle(u64);

impl SectionHandle {
    pub fn from_raw(raw: u64) -> Self {
        SectionHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Host-API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    #[error("section creation failed")]
    CreateSection,
    #[error("mapping a section view at {addr:#010x} failed")]
    MapView { addr: u32 },
    #[error("no section view mapped at {addr:#010x}")]
    UnmapView { addr: u32 },
    #[error("stale section handle")]
    BadHandle,
    #[error("changing protection at {addr:#010x} failed")]
    Protect { addr: u32 },
    #[error("guest address {addr:#010x} is not backed by a view")]
    Access { addr: u32 },
}

/// The host primitives the memory manager runs on.
pub trait HostPager {
    /// Create a block-sized section committed read/write/execute.
    fn create_section(&mut self) -> Result<SectionHandle, PagerError>;

    /// Map a view of `section` at the block-aligned guest address `addr`,
    /// read/write/execute.
    fn map_section(&mut self, section: SectionHandle, addr: u32) -> Result<(), PagerError>;

    /// Unmap the view at `addr`.
    fn unmap_view(&mut self, addr: u32) -> Result<(), PagerError>;

    /// Close this process's handle to `section`.
    fn close_section(&mut self, section: SectionHandle) -> Result<(), PagerError>;

    /// Number of processes currently holding a handle to `section` (the
    /// `NtQueryObject` handle count).
    fn section_owner_count(&self, section: SectionHandle) -> Result<u32, PagerError>;

    /// Set host protection for `[addr, addr + len)`. The range never crosses
    /// a block boundary.
    fn protect(&mut self, addr: u32, len: u32, prot: HostProt) -> Result<(), PagerError>;

    /// Copy one block from the view at `src_addr` into `dst` through a
    /// scratch mapping (section duplication for copy-on-write).
    fn copy_block_into_section(
        &mut self,
        dst: SectionHandle,
        src_addr: u32,
    ) -> Result<(), PagerError>;

    /// Host-privileged bulk write into mapped guest memory, ignoring guest
    /// page protection (file loads).
    fn write_guest(&mut self, addr: u32, data: &[u8]) -> Result<(), PagerError>;

    /// Host-privileged bulk read from mapped guest memory.
    fn read_guest(&self, addr: u32, buf: &mut [u8]) -> Result<(), PagerError>;
}
