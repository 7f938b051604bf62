//! Entradas de page table (formato de 2 níveis, entradas de 32 bits)

use crate::addr::{FrameIndex, PhysAddr};
use crate::config::ENTRIES_PER_TABLE;
use crate::hal::Hal;
use bitflags::bitflags;

bitflags! {
    /// Flags de uma entrada de diretório/tabela
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        // bit 7 (PS) não é usado: huge pages fora de escopo
        const GLOBAL        = 1 << 8;
        /// Bit disponível 9: marca páginas copy-on-write
        const COW           = 1 << 9;
    }
}

/// Máscara do endereço físico dentro de uma entrada
const PTE_ADDR_MASK: u32 = 0xFFFF_F000;

/// Uma entrada de 32 bits (diretório ou tabela)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn new(addr: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(addr.is_page_aligned());
        Self((addr.as_u32() & PTE_ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & PTE_ADDR_MASK)
    }

    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.addr().frame_index()
    }

    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !PTE_ADDR_MASK)
    }

    /// Mesma moldura física, flags substituídas
    pub fn with_flags(&self, flags: PteFlags) -> Self {
        Self((self.0 & PTE_ADDR_MASK) | flags.bits())
    }
}

/// Lê a entrada `idx` da tabela/diretório em `table`
///
/// Acesso volátil: o hardware atualiza ACCESSED/DIRTY por fora do
/// compilador.
pub(crate) fn read_entry(hal: &dyn Hal, table: PhysAddr, idx: usize) -> PageTableEntry {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    debug_assert!(table.is_page_aligned());
    let ptr = hal.frame_ptr(table.frame_index()) as *const u32;
    PageTableEntry(unsafe { core::ptr::read_volatile(ptr.add(idx)) })
}

/// Escreve a entrada `idx` da tabela/diretório em `table`
pub(crate) fn write_entry(hal: &dyn Hal, table: PhysAddr, idx: usize, entry: PageTableEntry) {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    debug_assert!(table.is_page_aligned());
    let ptr = hal.frame_ptr(table.frame_index()) as *mut u32;
    unsafe { core::ptr::write_volatile(ptr.add(idx), entry.raw()) };
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let e = PageTableEntry::new(
            PhysAddr::new(0x1234_5000),
            PteFlags::PRESENT | PteFlags::WRITABLE,
        );
        assert!(e.is_present());
        assert_eq!(e.addr().as_u32(), 0x1234_5000);
        assert_eq!(e.frame(), 0x12345);
        assert_eq!(e.flags(), PteFlags::PRESENT | PteFlags::WRITABLE);
    }

    #[test]
    fn test_with_flags_keeps_addr() {
        let e = PageTableEntry::new(PhysAddr::new(0x7000), PteFlags::PRESENT | PteFlags::WRITABLE);
        let ro = e.with_flags(PteFlags::PRESENT | PteFlags::COW);
        assert_eq!(ro.addr().as_u32(), 0x7000);
        assert!(!ro.flags().contains(PteFlags::WRITABLE));
        assert!(ro.flags().contains(PteFlags::COW));
    }
}
