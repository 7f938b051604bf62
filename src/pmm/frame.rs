//! Metadados por frame físico
//!
//! Cada frame do pool carrega estado, flags de papel, contagem de
//! referências e dono. A tabela vive nos próprios frames reservados do
//! pool (ver `pmm::FramePool::new`).

use bitflags::bitflags;

use crate::{Pid, PID_KERNEL};

/// Estado de um frame físico
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Free = 0,
    Allocated = 1,
}

bitflags! {
    /// Papéis de um frame físico
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Frame pertence ao kernel (page tables, heap, metadados)
        const KERNEL   = 1 << 0;
        /// Frame não pode ser liberado nem realocado
        const LOCKED   = 1 << 1;
        /// Frame aparece em mais de um address space
        const SHARED   = 1 << 2;
        /// Reservado pelo firmware/metadados do pool
        const RESERVED = 1 << 3;
    }
}

/// Entrada da tabela de frames (8 bytes, tabela carvada do próprio pool)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    state: u8,
    flags: u8,
    ref_count: u16,
    owner: Pid,
}

impl FrameInfo {
    pub const fn free() -> Self {
        Self {
            state: FrameState::Free as u8,
            flags: 0,
            ref_count: 0,
            owner: PID_KERNEL,
        }
    }

    pub fn state(&self) -> FrameState {
        if self.state == FrameState::Allocated as u8 {
            FrameState::Allocated
        } else {
            FrameState::Free
        }
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    pub fn ref_count(&self) -> u16 {
        self.ref_count
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn set_allocated(&mut self, owner: Pid, flags: FrameFlags) {
        self.state = FrameState::Allocated as u8;
        self.flags = flags.bits();
        self.ref_count = 1;
        self.owner = owner;
    }

    pub fn set_free(&mut self) {
        self.state = FrameState::Free as u8;
        self.flags = 0;
        self.ref_count = 0;
        self.owner = PID_KERNEL;
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.bits();
    }

    /// Incrementa refcount, saturando em u16::MAX (nunca dá wrap)
    pub fn inc_ref(&mut self) -> u16 {
        self.ref_count = self.ref_count.saturating_add(1);
        self.ref_count
    }

    /// Decrementa refcount; retorna o valor resultante
    pub fn dec_ref(&mut self) -> u16 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}
