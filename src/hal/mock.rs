//! HAL simulado para testes de host
//!
//! Uma arena alinhada a página faz o papel da RAM física; a janela direta
//! é o próprio buffer, o que preserva o contrato de linearidade. As
//! invalidações de TLB e trocas de CR3 são apenas contabilizadas, para
//! que os testes possam afirmar coerência.

use super::Hal;
use crate::addr::{FrameIndex, PhysAddr, VirtAddr};
use crate::boot::CpuFeatures;
use crate::config::PAGE_SIZE;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

extern crate alloc;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};

pub struct MockHal {
    base: *mut u8,
    frames: usize,
    root: AtomicU32,
    invalidations: AtomicUsize,
    root_loads: AtomicUsize,
    fake_cycles: AtomicU64,
    features: CpuFeatures,
}

// SAFETY: a arena só é tocada através da API do core, que serializa acesso
unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl MockHal {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "MockHal: arena allocation failed");
        Self {
            base,
            frames,
            root: AtomicU32::new(0),
            invalidations: AtomicUsize::new(0),
            root_loads: AtomicUsize::new(0),
            fake_cycles: AtomicU64::new(0x5EED_0000_0000_0001),
            features: CpuFeatures {
                has_nx: false,
                has_global_pages: true,
                has_pae: false,
            },
        }
    }

    /// Constrói e vaza (os testes vivem pouco e o Hal precisa de 'static)
    pub fn leak(frames: usize) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(frames)))
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn root_load_count(&self) -> usize {
        self.root_loads.load(Ordering::Relaxed)
    }
}

impl Drop for MockHal {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

impl Hal for MockHal {
    fn frame_ptr(&self, idx: FrameIndex) -> *mut u8 {
        assert!(idx < self.frames, "MockHal: frame {} fora da arena", idx);
        unsafe { self.base.add(idx * PAGE_SIZE) }
    }

    fn invalidate_page(&self, _virt: VirtAddr) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn load_root(&self, root: PhysAddr) {
        self.root.store(root.as_u32(), Ordering::SeqCst);
        self.root_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn current_root(&self) -> PhysAddr {
        PhysAddr::new(self.root.load(Ordering::SeqCst))
    }

    fn cycle_counter(&self) -> u64 {
        // Sequência determinística: testes de ASLR precisam de seeds estáveis
        self.fake_cycles.fetch_add(0x9E37_79B9, Ordering::Relaxed)
    }

    fn uptime_ticks(&self) -> u64 {
        42
    }

    fn last_interrupt_ticks(&self) -> u64 {
        7
    }

    fn cpu_features(&self) -> CpuFeatures {
        self.features
    }
}
