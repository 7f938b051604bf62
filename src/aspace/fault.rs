//! # Page Fault Handler
//!
//! Resolve os três desfechos possíveis de um fault:
//!
//! 1. **Lazy allocation** - endereço dentro de uma região registrada, sem
//!    frame por trás: aloca, zera, mapeia com as flags da região.
//! 2. **Copy-on-write** - escrita em página presente marcada COW: copia
//!    (ou reabilita escrita quando a última referência já é nossa).
//! 3. **Fatal** - sem região, ou acesso que as permissões negam: o
//!    processo dono morre (via `FaultSink`); em contexto de kernel não há
//!    quem culpar e o kernel entra em pânico (decisão do `manager`).

use crate::addr::VirtAddr;
use crate::error::MmError;
use crate::pmm::frame::FrameFlags;
use crate::pmm::FramePool;
use crate::vmm::{Mapper, PteFlags};
use crate::Pid;

use super::AddressSpace;

/// Tipo de acesso que causou o fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Desfecho de um page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// Mapeamento instalado; a instrução pode reexecutar
    Resolved,
    /// Pool exausto durante a resolução
    OutOfMemory,
    /// Endereço fora de qualquer região
    InvalidAddress,
    /// Acesso nega as permissões da região
    ProtectionViolation,
    /// Fault em contexto de kernel sem resolução possível
    FatalKernel,
}

/// Informações decodificadas de um page fault
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub addr: VirtAddr,
    pub ip: VirtAddr,
    pub access: AccessType,
    pub user_mode: bool,
    /// A página estava presente (fault de proteção, não de ausência)
    pub present: bool,
}

impl PageFaultInfo {
    /// Decodifica o error code de hardware (formato x86)
    pub fn from_error_code(addr: u32, ip: u32, error_code: u32) -> Self {
        let access = if error_code & 0x10 != 0 {
            AccessType::Execute
        } else if error_code & 0x02 != 0 {
            AccessType::Write
        } else {
            AccessType::Read
        };
        Self {
            addr: VirtAddr::new(addr),
            ip: VirtAddr::new(ip),
            access,
            user_mode: error_code & 0x04 != 0,
            present: error_code & 0x01 != 0,
        }
    }
}

/// Destino de faults fatais de usuário (injetável: o scheduler real
/// registra um, os testes registram outro)
pub trait FaultSink: Sync {
    /// Processo deve ser terminado com a razão dada
    fn process_fatal(&self, pid: Pid, info: &PageFaultInfo, reason: MmError);
}

/// Sink default: só registra. Útil em early-boot e em testes.
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn process_fatal(&self, pid: Pid, info: &PageFaultInfo, reason: MmError) {
        crate::kerror!(
            "(Fault) processo {} terminado: {} em {:?} (ip {:?})",
            pid,
            reason.as_str(),
            info.addr,
            info.ip
        );
    }
}

/// Resolve um page fault dentro do address space dono do endereço.
///
/// NÃO mata processo nem entra em pânico: devolve a classificação e deixa
/// a política para o caller (`manager::MemoryManager::handle_page_fault`).
pub fn handle_page_fault(
    mapper: &Mapper,
    pool: &mut FramePool,
    space: &mut AddressSpace,
    info: &PageFaultInfo,
) -> FaultResult {
    let page = info.addr.align_down();

    let (permits, pte_flags, shared) = match space.find_region(info.addr) {
        Some(r) => (
            r.permits(info.access),
            r.pte_flags(),
            r.flags.contains(super::region::RegionFlags::SHARED),
        ),
        None => {
            if !info.user_mode {
                crate::kerror!("(Fault) kernel fault em {:?} (ip {:?})", info.addr, info.ip);
                return FaultResult::FatalKernel;
            }
            crate::kerror!("(Fault) segfault: sem região para {:?}", info.addr);
            return FaultResult::InvalidAddress;
        }
    };

    if !permits {
        crate::kerror!(
            "(Fault) violação de proteção: {:?} {:?}",
            info.access,
            info.addr
        );
        return FaultResult::ProtectionViolation;
    }

    if info.present {
        // Página presente e acesso permitido pela região: ou é COW, ou é
        // inconsistência entre região e page table.
        if info.access == AccessType::Write {
            if let Some(entry) = mapper.entry(space.root(), page) {
                if entry.flags().contains(PteFlags::COW) {
                    return resolve_cow(mapper, pool, space, page, entry);
                }
            }
        }
        crate::kerror!("(Fault) fault de proteção não-COW em {:?}", info.addr);
        return FaultResult::ProtectionViolation;
    }

    // Lazy allocation: primeira vez que a página é tocada
    let frame_flags = if shared {
        FrameFlags::SHARED
    } else {
        FrameFlags::empty()
    };
    let frame = match pool.allocate_frame(space.owner(), frame_flags) {
        Some(f) => f,
        None => return FaultResult::OutOfMemory,
    };
    pool.zero_frame(frame);

    match mapper.map(pool, space.root(), page, crate::addr::PhysAddr::from_frame(frame), pte_flags)
    {
        Ok(()) => {
            space.note_lazy_fault();
            crate::ktrace!("(Fault) lazy alloc {:?} -> frame {}", page, frame);
            FaultResult::Resolved
        }
        Err(e) => {
            let _ = pool.free_frame(frame);
            crate::kerror!("(Fault) map falhou em {:?}: {}", page, e.as_str());
            FaultResult::OutOfMemory
        }
    }
}

/// Resolve um write fault em página COW.
///
/// Última referência: reabilita escrita in place. Compartilhada: aloca
/// frame novo, copia o conteúdo, remapeia writable e devolve a referência
/// do frame antigo.
fn resolve_cow(
    mapper: &Mapper,
    pool: &mut FramePool,
    space: &mut AddressSpace,
    page: VirtAddr,
    entry: crate::vmm::PageTableEntry,
) -> FaultResult {
    let old_frame = entry.frame();
    let writable = (entry.flags() - PteFlags::COW) | PteFlags::WRITABLE;

    let refs = match pool.ref_count(old_frame) {
        Ok(r) => r,
        Err(_) => return FaultResult::InvalidAddress,
    };

    if refs == 1 {
        if mapper.replace_entry(space.root(), page, entry.with_flags(writable)).is_err() {
            return FaultResult::InvalidAddress;
        }
        space.note_cow_fault();
        return FaultResult::Resolved;
    }

    let new_frame = match pool.allocate_frame(space.owner(), FrameFlags::empty()) {
        Some(f) => f,
        None => return FaultResult::OutOfMemory,
    };

    let hal = mapper.hal();
    unsafe {
        core::ptr::copy_nonoverlapping(
            hal.frame_ptr(old_frame),
            hal.frame_ptr(new_frame),
            crate::config::PAGE_SIZE,
        );
    }

    let new_entry =
        crate::vmm::PageTableEntry::new(crate::addr::PhysAddr::from_frame(new_frame), writable);
    if mapper.replace_entry(space.root(), page, new_entry).is_err() {
        let _ = pool.free_frame(new_frame);
        return FaultResult::InvalidAddress;
    }
    // Devolve a referência que este espaço tinha sobre o frame antigo
    let _ = pool.free_frame(old_frame);

    space.note_cow_fault();
    crate::ktrace!("(Fault) COW {:?}: frame {} -> {}", page, old_frame, new_frame);
    FaultResult::Resolved
}
