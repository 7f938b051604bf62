//! # PMM - Physical Memory Manager
//!
//! Gerencia frames físicos de 4 KiB usando bitmap + tabela de metadados.
//!
//! ## 🎯 Propósito e Responsabilidade
//! - **Classificação do memory map:** interpreta os trechos reportados
//!   pelo boot e marca Reserved/Kernel/MMIO como inalocáveis.
//! - **Alocação:** frames avulsos (com hint de próximo livre) e runs
//!   contíguos (scan linear first-fit a partir do frame 0).
//! - **Refcount:** um frame mapeado em N address spaces só volta ao pool
//!   quando a última referência cai (`free_frame` decrementa; libera em 0).
//!
//! ## 🏗️ Onde vivem os metadados
//!
//! O bitmap e a tabela de `FrameInfo` são CARVADOS dos primeiros frames do
//! próprio pool, através da janela direta do HAL:
//!
//! ```text
//! frame 0..k: [ bitmap (1 bit/frame) | FrameInfo[total] ]
//! frame k..:  frames alocáveis
//! ```
//!
//! Os frames de metadados nascem `RESERVED | KERNEL` com refcount 1 e
//! nunca são liberados. Todo acesso ao bitmap/tabela passa por accessors
//! com bounds check; ponteiro cru não escapa deste módulo.
//!
//! ## ⚠️ Lições herdadas do incidente de colisão de memória
//!
//! * **NUNCA** aloque estruturas críticas no frame 0 (endereço físico
//!   `0x0` vira ponteiro nulo na janela direta).
//! * **NUNCA** confie que um trecho `Usable` tem frames inteiros nas
//!   bordas: só frames completamente contidos no trecho são liberados.

pub mod frame;
pub mod stats;

use crate::addr::FrameIndex;
use crate::boot::{MemoryMap, RangeKind};
use crate::config::{pages_for, KERNEL_DIRECT_LIMIT, PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::hal::Hal;
use crate::{Pid, PID_KERNEL};
use core::sync::atomic::Ordering;
use frame::{FrameFlags, FrameInfo, FrameState};
use stats::PmmStats;

/// Pool de frames físicos
pub struct FramePool {
    hal: &'static dyn Hal,
    total_frames: usize,
    meta_frames: usize,
    bitmap: *mut u64,
    bitmap_words: usize,
    info: *mut FrameInfo,
    next_free: usize,
    stats: PmmStats,
}

// SAFETY: os ponteiros de metadados apontam para frames reservados do pool;
// o acesso é serializado pelo Mutex que envolve o FramePool no manager.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Constrói o pool a partir do memory map do boot.
    ///
    /// Reserva os primeiros frames para bitmap + tabela de frames e marca
    /// como inalocável tudo que o map não declarar `Usable`.
    pub fn new(hal: &'static dyn Hal, map: &MemoryMap<'_>) -> MmResult<Self> {
        let highest = map.highest_addr().min(KERNEL_DIRECT_LIMIT);
        let total_frames = highest as usize / PAGE_SIZE;
        if total_frames < 2 {
            return Err(MmError::InitFailed);
        }

        let bitmap_words = (total_frames + 63) / 64;
        let bitmap_bytes = bitmap_words * 8;
        let info_offset = crate::config::align_up(bitmap_bytes, 8);
        let meta_bytes = info_offset + total_frames * core::mem::size_of::<FrameInfo>();
        let meta_frames = pages_for(meta_bytes);
        if meta_frames >= total_frames {
            return Err(MmError::InitFailed);
        }

        let base = hal.frame_ptr(0);
        let bitmap = base as *mut u64;
        let info = unsafe { base.add(info_offset) } as *mut FrameInfo;

        let mut pool = Self {
            hal,
            total_frames,
            meta_frames,
            bitmap,
            bitmap_words,
            info,
            next_free: meta_frames,
            stats: PmmStats::new(),
        };
        pool.stats.total_frames = total_frames;

        // Tudo começa inalocável; só trechos Usable liberam frames inteiros.
        unsafe {
            for w in 0..bitmap_words {
                pool.bitmap.add(w).write(!0u64);
            }
            for i in 0..total_frames {
                pool.info.add(i).write(FrameInfo::free());
            }
        }

        let mut usable = 0usize;
        for range in map.ranges.iter().filter(|r| r.kind == RangeKind::Usable) {
            let first = (range.base.as_u32() as usize + PAGE_SIZE - 1) / PAGE_SIZE;
            let last = range.end().min(highest) as usize / PAGE_SIZE;
            for idx in first..last {
                pool.clear_bit(idx);
                usable += 1;
            }
        }

        // Metadados do pool: reservados para sempre (inclui o frame 0).
        // O começo da janela PRECISA ser RAM utilizável - é onde o bitmap
        // e a tabela de frames acabaram de ser escritos.
        for idx in 0..meta_frames {
            if pool.test_bit(idx) {
                return Err(MmError::InitFailed);
            }
            pool.set_bit(idx);
            pool.info_mut(idx)
                .set_allocated(PID_KERNEL, FrameFlags::RESERVED | FrameFlags::KERNEL);
            usable -= 1;
        }

        pool.stats
            .used_frames
            .store(total_frames - usable, Ordering::Relaxed);

        crate::kinfo!(
            "(PMM) pool: {} frames ({} KiB), {} de metadados, {} livres",
            total_frames,
            total_frames * 4,
            meta_frames,
            usable
        );
        Ok(pool)
    }

    // -------------------------------------------------------------------------
    // Bitmap (bit ligado = frame em uso)
    // -------------------------------------------------------------------------

    fn test_bit(&self, idx: FrameIndex) -> bool {
        debug_assert!(idx < self.total_frames);
        unsafe { self.bitmap.add(idx / 64).read() & (1u64 << (idx % 64)) != 0 }
    }

    fn set_bit(&mut self, idx: FrameIndex) {
        debug_assert!(idx < self.total_frames);
        unsafe {
            let w = self.bitmap.add(idx / 64);
            w.write(w.read() | (1u64 << (idx % 64)));
        }
    }

    fn clear_bit(&mut self, idx: FrameIndex) {
        debug_assert!(idx < self.total_frames);
        unsafe {
            let w = self.bitmap.add(idx / 64);
            w.write(w.read() & !(1u64 << (idx % 64)));
        }
    }

    fn info_mut(&mut self, idx: FrameIndex) -> &mut FrameInfo {
        debug_assert!(idx < self.total_frames);
        unsafe { &mut *self.info.add(idx) }
    }

    fn info_ref(&self, idx: FrameIndex) -> &FrameInfo {
        debug_assert!(idx < self.total_frames);
        unsafe { &*self.info.add(idx) }
    }

    fn check_bounds(&self, idx: FrameIndex) -> MmResult<()> {
        if idx >= self.total_frames {
            return Err(MmError::InvalidAddress);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Alocação
    // -------------------------------------------------------------------------

    /// Aloca um frame avulso. Retorna `None` quando o pool está exausto.
    pub fn allocate_frame(&mut self, owner: Pid, flags: FrameFlags) -> Option<FrameIndex> {
        let start = self.next_free.min(self.total_frames);
        let idx = (start..self.total_frames)
            .chain(self.meta_frames..start)
            .find(|&i| !self.test_bit(i));

        match idx {
            Some(i) => {
                self.set_bit(i);
                self.info_mut(i).set_allocated(owner, flags);
                self.next_free = i + 1;
                self.stats.inc_alloc();
                Some(i)
            }
            None => {
                self.stats.inc_failed();
                crate::kwarn!("(PMM) OOM: pool exausto ({} frames)", self.total_frames);
                None
            }
        }
    }

    /// Aloca `n` frames contíguos.
    ///
    /// Scan linear first-fit a partir do frame 0 - O(total_frames) no pior
    /// caso, sem compactação. Falha com `None` se nenhum run existir.
    pub fn allocate_contiguous(
        &mut self,
        n: usize,
        owner: Pid,
        flags: FrameFlags,
    ) -> Option<FrameIndex> {
        if n == 0 {
            return None;
        }

        let mut run_start = self.meta_frames;
        let mut run_len = 0usize;
        for idx in self.meta_frames..self.total_frames {
            if self.test_bit(idx) {
                run_start = idx + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == n {
                for i in run_start..run_start + n {
                    self.set_bit(i);
                    self.info_mut(i).set_allocated(owner, flags);
                    self.stats.inc_alloc();
                }
                return Some(run_start);
            }
        }

        self.stats.inc_failed();
        crate::kwarn!("(PMM) OOM: sem run contíguo de {} frames", n);
        None
    }

    // -------------------------------------------------------------------------
    // Liberação (refcount-aware)
    // -------------------------------------------------------------------------

    /// Decrementa a referência do frame; libera de fato quando chega a 0.
    pub fn free_frame(&mut self, idx: FrameIndex) -> MmResult<()> {
        self.check_bounds(idx)?;

        let info = self.info_ref(idx);
        if info.state() == FrameState::Free {
            crate::kerror!("(PMM) double free do frame {}", idx);
            return Err(MmError::DoubleFree);
        }
        if info.flags().contains(FrameFlags::RESERVED) || info.flags().contains(FrameFlags::LOCKED)
        {
            return Err(MmError::InvalidParameter);
        }

        if self.info_mut(idx).dec_ref() == 0 {
            self.info_mut(idx).set_free();
            self.clear_bit(idx);
            if idx < self.next_free {
                self.next_free = idx;
            }
            self.stats.inc_free();
        }
        Ok(())
    }

    /// Libera um run contíguo alocado por `allocate_contiguous`
    pub fn free_contiguous(&mut self, idx: FrameIndex, n: usize) -> MmResult<()> {
        for i in idx..idx + n {
            self.free_frame(i)?;
        }
        Ok(())
    }

    /// Incrementa a referência (frame compartilhado entre address spaces)
    pub fn inc_ref(&mut self, idx: FrameIndex) -> MmResult<u16> {
        self.check_bounds(idx)?;
        if self.info_ref(idx).state() == FrameState::Free {
            return Err(MmError::InvalidParameter);
        }
        Ok(self.info_mut(idx).inc_ref())
    }

    // -------------------------------------------------------------------------
    // Consultas
    // -------------------------------------------------------------------------

    pub fn ref_count(&self, idx: FrameIndex) -> MmResult<u16> {
        self.check_bounds(idx)?;
        Ok(self.info_ref(idx).ref_count())
    }

    pub fn owner(&self, idx: FrameIndex) -> MmResult<Pid> {
        self.check_bounds(idx)?;
        Ok(self.info_ref(idx).owner())
    }

    pub fn flags(&self, idx: FrameIndex) -> MmResult<FrameFlags> {
        self.check_bounds(idx)?;
        Ok(self.info_ref(idx).flags())
    }

    pub fn set_flags(&mut self, idx: FrameIndex, flags: FrameFlags) -> MmResult<()> {
        self.check_bounds(idx)?;
        self.info_mut(idx).set_flags(flags);
        Ok(())
    }

    pub fn is_allocated(&self, idx: FrameIndex) -> bool {
        idx < self.total_frames && self.test_bit(idx)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.stats.used_frames.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &PmmStats {
        &self.stats
    }

    /// Zera o conteúdo de um frame através da janela direta
    pub fn zero_frame(&self, idx: FrameIndex) {
        debug_assert!(idx < self.total_frames);
        unsafe {
            core::ptr::write_bytes(self.hal.frame_ptr(idx), 0, PAGE_SIZE);
        }
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::boot::MemoryRange;
    use crate::hal::mock::MockHal;

    fn pool_with(frames: usize) -> FramePool {
        let hal = MockHal::leak(frames);
        let ranges = alloc::vec![MemoryRange::new(
            PhysAddr::new(0),
            (frames * PAGE_SIZE) as u32,
            RangeKind::Usable,
        )];
        let map = MemoryMap::new(alloc::boxed::Box::leak(ranges.into_boxed_slice()));
        FramePool::new(hal, &map).unwrap()
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut pool = pool_with(64);
        let before = pool.free_frames();

        let f = pool.allocate_frame(PID_KERNEL, FrameFlags::KERNEL).unwrap();
        assert!(pool.is_allocated(f));
        assert_eq!(pool.free_frames(), before - 1);

        pool.free_frame(f).unwrap();
        assert_eq!(pool.free_frames(), before);
        assert!(!pool.is_allocated(f));
    }

    #[test]
    fn test_contiguous_counts() {
        let mut pool = pool_with(256);
        let before = pool.free_frames();

        let run = pool
            .allocate_contiguous(16, PID_KERNEL, FrameFlags::KERNEL)
            .unwrap();
        assert_eq!(pool.free_frames(), before - 16);
        for i in run..run + 16 {
            assert!(pool.is_allocated(i));
        }

        pool.free_contiguous(run, 16).unwrap();
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn test_contiguous_is_first_fit() {
        let mut pool = pool_with(64);
        // Fragmenta: aloca 8, libera os 4 do meio
        let run = pool
            .allocate_contiguous(8, PID_KERNEL, FrameFlags::empty())
            .unwrap();
        pool.free_contiguous(run + 2, 4).unwrap();

        // Um run de 4 cabe no buraco; first-fit deve escolhê-lo
        let hole = pool
            .allocate_contiguous(4, PID_KERNEL, FrameFlags::empty())
            .unwrap();
        assert_eq!(hole, run + 2);
    }

    #[test]
    fn test_refcount_blocks_free() {
        let mut pool = pool_with(64);
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        pool.inc_ref(f).unwrap();
        assert_eq!(pool.ref_count(f).unwrap(), 2);

        // Primeira liberação só decrementa
        pool.free_frame(f).unwrap();
        assert!(pool.is_allocated(f));
        assert_eq!(pool.ref_count(f).unwrap(), 1);

        // Segunda devolve ao pool
        pool.free_frame(f).unwrap();
        assert!(!pool.is_allocated(f));
    }

    #[test]
    fn test_double_free_refused() {
        let mut pool = pool_with(64);
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        pool.free_frame(f).unwrap();
        assert_eq!(pool.free_frame(f), Err(MmError::DoubleFree));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pool = pool_with(16);
        while pool
            .allocate_frame(PID_KERNEL, FrameFlags::empty())
            .is_some()
        {}
        assert_eq!(pool.free_frames(), 0);
        assert!(pool.allocate_frame(PID_KERNEL, FrameFlags::empty()).is_none());
        assert!(pool
            .allocate_contiguous(2, PID_KERNEL, FrameFlags::empty())
            .is_none());
    }

    #[test]
    fn test_meta_frames_protected() {
        let mut pool = pool_with(64);
        assert_eq!(pool.free_frame(0), Err(MmError::InvalidParameter));
    }
}
