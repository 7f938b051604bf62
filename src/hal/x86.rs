//! HAL x86 (paginação de 2 níveis, sem PAE)
//!
//! Implementação real sobre o direct map que o bootloader constrói em
//! `KERNEL_DIRECT_BASE`. Só compila para o alvo bare-metal.

use super::Hal;
use crate::addr::{FrameIndex, PhysAddr, VirtAddr};
use crate::boot::CpuFeatures;
use crate::config::{KERNEL_DIRECT_BASE, PAGE_SIZE};
use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};

/// HAL concreto de x86 de 32 bits
pub struct X86Hal {
    features: CpuFeatures,
    uptime_ticks: AtomicU64,
    last_interrupt: AtomicU64,
}

impl X86Hal {
    pub const fn new(features: CpuFeatures) -> Self {
        Self {
            features,
            uptime_ticks: AtomicU64::new(0),
            last_interrupt: AtomicU64::new(0),
        }
    }

    /// Chamado pelo handler de timer do kernel hospedeiro
    pub fn tick(&self) {
        self.uptime_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Chamado na entrada de qualquer interrupção
    pub fn note_interrupt(&self) {
        self.last_interrupt
            .store(self.cycle_counter(), Ordering::Relaxed);
    }
}

impl Hal for X86Hal {
    #[inline]
    fn frame_ptr(&self, idx: FrameIndex) -> *mut u8 {
        (KERNEL_DIRECT_BASE as usize + idx * PAGE_SIZE) as *mut u8
    }

    #[inline]
    fn invalidate_page(&self, virt: VirtAddr) {
        unsafe {
            asm!("invlpg [{}]", in(reg) virt.as_usize(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    unsafe fn load_root(&self, root: PhysAddr) {
        asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack, preserves_flags));
    }

    #[inline]
    fn current_root(&self) -> PhysAddr {
        let cr3: u32;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
        }
        PhysAddr::new(cr3 & crate::config::PAGE_MASK)
    }

    #[inline]
    fn cycle_counter(&self) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!("rdtsc", out("eax") lo, out("edx") hi, options(nostack, preserves_flags));
        }
        ((hi as u64) << 32) | lo as u64
    }

    fn uptime_ticks(&self) -> u64 {
        self.uptime_ticks.load(Ordering::Relaxed)
    }

    fn last_interrupt_ticks(&self) -> u64 {
        self.last_interrupt.load(Ordering::Relaxed)
    }

    fn cpu_features(&self) -> CpuFeatures {
        self.features
    }
}
