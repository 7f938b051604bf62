//! Regiões de memória virtual
//!
//! Cada região é um trecho contíguo `[start, end)` com intenção semântica
//! e permissões próprias. Bounds sempre alinhados a página.

use crate::addr::VirtAddr;
use crate::vmm::PteFlags;
use bitflags::bitflags;

use super::fault::AccessType;

/// Intenção de uso da região
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Code,
    Heap,
    Stack,
    Shared,
    Module,
    Mmio,
    Kernel,
    Reserved,
}

bitflags! {
    /// Permissões de acesso da região
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

bitflags! {
    /// Flags de comportamento da região
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u16 {
        const NO_CACHE   = 1 << 0;
        const SHARED     = 1 << 1;
        /// Base escolhida pelo caller; nunca realocada
        const FIXED      = 1 << 2;
        const GUARD      = 1 << 3;
        const GROWS_DOWN = 1 << 4;
        const GROWS_UP   = 1 << 5;
    }
}

/// Uma região virtual registrada em um address space
#[derive(Debug, Clone)]
pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub kind: RegionKind,
    pub perms: RegionPerms,
    pub flags: RegionFlags,
    pub name: &'static str,
}

impl Region {
    pub fn new(
        start: VirtAddr,
        end: VirtAddr,
        kind: RegionKind,
        perms: RegionPerms,
        flags: RegionFlags,
        name: &'static str,
    ) -> Self {
        Self {
            start,
            end,
            kind,
            perms,
            flags,
            name,
        }
    }

    pub fn size(&self) -> u32 {
        self.end.as_u32() - self.start.as_u32()
    }

    pub fn page_count(&self) -> usize {
        self.size() as usize / crate::config::PAGE_SIZE
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// O acesso pedido é compatível com as permissões?
    pub fn permits(&self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.perms.contains(RegionPerms::READ),
            AccessType::Write => self.perms.contains(RegionPerms::WRITE),
            AccessType::Execute => self.perms.contains(RegionPerms::EXEC),
        }
    }

    /// Flags de page table derivadas das permissões da região
    pub fn pte_flags(&self) -> PteFlags {
        let mut f = PteFlags::PRESENT;
        if self.perms.contains(RegionPerms::WRITE) {
            f |= PteFlags::WRITABLE;
        }
        if self.perms.contains(RegionPerms::USER) {
            f |= PteFlags::USER;
        }
        if self.flags.contains(RegionFlags::NO_CACHE) {
            f |= PteFlags::NO_CACHE;
        }
        if self.kind == RegionKind::Kernel {
            f |= PteFlags::GLOBAL;
        }
        f
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u32, end: u32) -> Region {
        Region::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            RegionKind::Heap,
            RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER,
            RegionFlags::empty(),
            "teste",
        )
    }

    #[test]
    fn test_overlap() {
        let a = region(0x1000, 0x3000);
        assert!(a.overlaps(&region(0x2000, 0x4000)));
        assert!(a.overlaps(&region(0x0000, 0x2000)));
        assert!(!a.overlaps(&region(0x3000, 0x4000)));
        assert!(!a.overlaps(&region(0x0000, 0x1000)));
    }

    #[test]
    fn test_permits() {
        let r = region(0x1000, 0x2000);
        assert!(r.permits(AccessType::Read));
        assert!(r.permits(AccessType::Write));
        assert!(!r.permits(AccessType::Execute));
    }

    #[test]
    fn test_pte_flags_derivation() {
        let r = region(0x1000, 0x2000);
        let f = r.pte_flags();
        assert!(f.contains(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
        assert!(!f.contains(PteFlags::NO_CACHE));
    }
}
