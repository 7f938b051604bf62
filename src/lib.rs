//! # ember-mm - Núcleo de Gerenciamento de Memória do Ember OS
//!
//! Este crate é o **coração** do gerenciamento de recursos do Ember OS:
//! frames físicos, paginação de 2 níveis, address spaces por processo,
//! demand paging com copy-on-write, heap do kernel com detecção de
//! corrupção e ASLR.
//!
//! ## 🏗️ Arquitetura dos Módulos
//!
//! | Módulo | Responsabilidade | Estado Atual |
//! |--------|------------------|--------------|
//! | `pmm`    | Frames físicos (4 KiB) via bitmap + refcount. | **Funcional:** scan linear é O(N), suficiente até aqui. |
//! | `vmm`    | Page tables de 2 níveis, COW, TLB por entrada. | **Robusto:** diretórios clonáveis, destruição rastreada. |
//! | `aspace` | Regiões, layout de processo, page faults. | **Funcional:** lookup O(n) sobre ~5-20 regiões. |
//! | `aslr`   | Offsets aleatórios limitados por categoria. | **Best-effort:** entropia fraca documentada. |
//! | `heap`   | Bins segregados + guard pages + canários. | **Funcional:** corrupção recusada, nunca "consertada". |
//! | `hal`    | Fronteira de operações privilegiadas. | **Estável:** x86 real ou mock de teste. |
//!
//! ## 🔍 Decisões estruturais
//!
//! - **Sem estado global implícito:** todo o subsistema vive em um
//!   [`manager::MemoryManager`], construído explicitamente no boot e
//!   passado por referência. Testes constroem quantos quiserem.
//! - **Operação privilegiada só atrás do [`hal::Hal`]:** o restante do
//!   crate é lógica comum, auditável e testável em host.
//! - **Locks com hierarquia documentada** (ver `manager`): heap ou
//!   address space primeiro, pool de frames por último, ASLR como folha.
//!
//! ## Ordem de boot
//!
//! ```text
//! PMM ──▶ VMM (diretório kernel + janela direta) ──▶ ASLR ──▶ Heap
//! ```
//!
//! Se algo falhar aqui, o kernel NÃO deve continuar.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod aslr;
pub mod aspace;
pub mod boot;
pub mod config;
pub mod error;
pub mod hal;
pub mod heap;
pub mod klog;
pub mod manager;
pub mod pmm;
pub mod stats;
pub mod vmm;

#[cfg(feature = "self_test")]
pub mod selftest;

#[cfg(test)]
mod test;

/// Identificador de processo (0 é o kernel)
pub type Pid = u32;

/// PID reservado do kernel
pub const PID_KERNEL: Pid = 0;

// Re-exports para conveniência
pub use addr::{FrameIndex, PhysAddr, VirtAddr};
pub use error::{MmError, MmResult};
pub use manager::MemoryManager;
