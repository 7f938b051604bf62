//! # Memory Statistics

use core::sync::atomic::{AtomicU64, Ordering};

/// Contadores globais do subsistema (um conjunto por `MemoryManager`)
#[derive(Debug, Default)]
pub struct MmStats {
    pub page_faults: AtomicU64,
    pub cow_faults: AtomicU64,
    pub lazy_faults: AtomicU64,
    pub fatal_faults: AtomicU64,
    pub spaces_created: AtomicU64,
    pub spaces_destroyed: AtomicU64,
}

/// Snapshot consistente o suficiente para diagnóstico
#[derive(Debug, Clone, Copy)]
pub struct MmStatsSnapshot {
    pub page_faults: u64,
    pub cow_faults: u64,
    pub lazy_faults: u64,
    pub fatal_faults: u64,
    pub spaces_created: u64,
    pub spaces_destroyed: u64,
}

impl MmStats {
    pub const fn new() -> Self {
        Self {
            page_faults: AtomicU64::new(0),
            cow_faults: AtomicU64::new(0),
            lazy_faults: AtomicU64::new(0),
            fatal_faults: AtomicU64::new(0),
            spaces_created: AtomicU64::new(0),
            spaces_destroyed: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MmStatsSnapshot {
        MmStatsSnapshot {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            cow_faults: self.cow_faults.load(Ordering::Relaxed),
            lazy_faults: self.lazy_faults.load(Ordering::Relaxed),
            fatal_faults: self.fatal_faults.load(Ordering::Relaxed),
            spaces_created: self.spaces_created.load(Ordering::Relaxed),
            spaces_destroyed: self.spaces_destroyed.load(Ordering::Relaxed),
        }
    }
}
