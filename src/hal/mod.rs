//! # Hardware Abstraction Layer do Core de Memória
//!
//! Fronteira única para toda operação privilegiada: janela de acesso
//! direto à RAM física, invalidação de TLB, registrador-raiz de paginação
//! e fontes fracas de entropia. Tudo acima desta fronteira (bitmap,
//! regiões, bins do heap, classificação de faults) é lógica comum segura.
//!
//! ## Contrato da janela direta
//!
//! `frame_ptr` expõe a RAM física através de um mapeamento LINEAR:
//! `frame_ptr(i + 1) == frame_ptr(i) + PAGE_SIZE`. O PMM depende disso
//! para carvar bitmap e tabela de frames em frames consecutivos, assim
//! como o direct map do kernel (`KERNEL_DIRECT_BASE`) faz no hardware.

use crate::addr::{FrameIndex, PhysAddr, VirtAddr};
use crate::boot::CpuFeatures;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(test)]
pub mod mock;

/// Operações privilegiadas que o core exige da plataforma
pub trait Hal: Sync {
    /// Ponteiro para o conteúdo do frame físico `idx` (janela direta)
    fn frame_ptr(&self, idx: FrameIndex) -> *mut u8;

    /// Invalida a entrada de TLB do endereço virtual dado (INVLPG)
    fn invalidate_page(&self, virt: VirtAddr);

    /// Recarrega o registrador-raiz de paginação (CR3)
    ///
    /// # Safety
    /// `root` deve apontar para um diretório válido que mantenha o kernel
    /// mapeado, ou a próxima instrução causa triple fault.
    unsafe fn load_root(&self, root: PhysAddr);

    /// Diretório atualmente ativo
    fn current_root(&self) -> PhysAddr;

    /// Contador de ciclos (TSC) - fonte fraca de entropia
    fn cycle_counter(&self) -> u64;

    /// Ticks desde o boot - fonte fraca de entropia
    fn uptime_ticks(&self) -> u64;

    /// Timestamp da última interrupção - fonte fraca de entropia
    fn last_interrupt_ticks(&self) -> u64;

    /// Features da CPU relevantes para paginação
    fn cpu_features(&self) -> CpuFeatures;
}
