#![cfg(test)]
//! Testes de integração do subsistema completo
//!
//! Cada teste constrói um `MemoryManager` inteiro sobre um `MockHal` e
//! exercita os fluxos de ponta a ponta: fork com COW, compartilhamento
//! com refcount e o ciclo de vida do heap.

mod cow;
mod e2e;

extern crate alloc;

use crate::addr::PhysAddr;
use crate::aspace::fault::LogFaultSink;
use crate::boot::{AslrBootConfig, MemoryMap, MemoryRange, RangeKind};
use crate::config::PAGE_SIZE;
use crate::hal::mock::MockHal;
use crate::hal::Hal;
use crate::manager::MemoryManager;

static FAULT_SINK: LogFaultSink = LogFaultSink;

/// Sobe um subsistema completo com `frames` frames de RAM simulada
pub(crate) fn setup_manager(frames: usize) -> (&'static MockHal, MemoryManager) {
    let hal = MockHal::leak(frames);
    let ranges = alloc::vec![MemoryRange::new(
        PhysAddr::new(0),
        (frames * PAGE_SIZE) as u32,
        RangeKind::Usable,
    )];
    let map = MemoryMap::new(alloc::boxed::Box::leak(ranges.into_boxed_slice()));
    let mgr = MemoryManager::init(hal, &map, AslrBootConfig::default(), &FAULT_SINK).unwrap();
    (hal, mgr)
}

/// Escreve uma palavra no endereço físico dado, via janela direta
pub(crate) fn write_phys_u32(hal: &MockHal, phys: PhysAddr, value: u32) {
    unsafe {
        let p = hal.frame_ptr(phys.frame_index()).add(phys.page_offset()) as *mut u32;
        p.write(value);
    }
}

/// Lê uma palavra do endereço físico dado
pub(crate) fn read_phys_u32(hal: &MockHal, phys: PhysAddr) -> u32 {
    unsafe {
        let p = hal.frame_ptr(phys.frame_index()).add(phys.page_offset()) as *const u32;
        p.read()
    }
}
