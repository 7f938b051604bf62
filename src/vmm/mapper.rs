//! Mapper: mutações na hierarquia de page tables
//!
//! Todas as funções recebem o diretório alvo explicitamente - o mapper em
//! si não guarda estado de processo, só a política derivada das features
//! da CPU. Quem serializa o acesso a um diretório é o lock do address
//! space dono dele (ver hierarquia de locks em `manager`).

use crate::addr::{PhysAddr, VirtAddr};
use crate::boot::CpuFeatures;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_DIR_SLOT, PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::hal::Hal;
use crate::pmm::frame::FrameFlags;
use crate::pmm::FramePool;
use crate::{Pid, PID_KERNEL};

use super::table::{read_entry, write_entry, PageTableEntry, PteFlags};

/// Política de mapeamento derivada das features da CPU
#[derive(Debug, Clone, Copy)]
pub struct MapperPolicy {
    /// Usar flag GLOBAL em mapeamentos do kernel
    pub global_pages: bool,
    /// Recusar regiões de usuário WRITE+EXEC (aplicada em `aspace`)
    pub wx_enforce: bool,
}

impl MapperPolicy {
    pub fn from_features(features: CpuFeatures) -> Self {
        Self {
            global_pages: features.has_global_pages,
            wx_enforce: cfg!(feature = "wx_enforcement"),
        }
    }
}

/// Mutador da hierarquia de 2 níveis
#[derive(Clone, Copy)]
pub struct Mapper {
    hal: &'static dyn Hal,
    policy: MapperPolicy,
}

/// Endereço virtual coberto pela entrada (`slot`, `idx`)
#[inline]
fn slot_virt(slot: usize, idx: usize) -> VirtAddr {
    VirtAddr::new(((slot as u32) << 22) | ((idx as u32) << 12))
}

impl Mapper {
    pub fn new(hal: &'static dyn Hal, policy: MapperPolicy) -> Self {
        Self { hal, policy }
    }

    pub fn policy(&self) -> MapperPolicy {
        self.policy
    }

    pub fn hal(&self) -> &'static dyn Hal {
        self.hal
    }

    // -------------------------------------------------------------------------
    // Mapeamento unitário
    // -------------------------------------------------------------------------

    /// Instala um mapeamento `virt` → `phys` no diretório `root`.
    ///
    /// Cria a tabela intermediária sob demanda (falha com `OutOfMemory` se
    /// o pool não tiver frame para ela). Invalida a entrada de TLB do
    /// endereço afetado e NADA além dela.
    ///
    /// Não mexe em refcounts: quem compartilha um frame entre espaços
    /// incrementa explicitamente (`share`, clone COW). `unmap` decrementa.
    pub fn map(
        &self,
        pool: &mut FramePool,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PteFlags,
    ) -> MmResult<()> {
        if !virt.is_page_aligned() || !phys.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }

        let slot = virt.dir_index();
        let mut dir_entry = read_entry(self.hal, root, slot);

        if !dir_entry.is_present() {
            let table_frame = pool
                .allocate_frame(PID_KERNEL, FrameFlags::KERNEL)
                .ok_or(MmError::OutOfMemory)?;
            pool.zero_frame(table_frame);

            let mut dflags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if flags.contains(PteFlags::USER) {
                dflags |= PteFlags::USER;
            }
            dir_entry = PageTableEntry::new(PhysAddr::from_frame(table_frame), dflags);
            write_entry(self.hal, root, slot, dir_entry);
        } else if flags.contains(PteFlags::USER) && !dir_entry.flags().contains(PteFlags::USER) {
            // Tabela criada para uso do kernel, agora recebe página de user
            write_entry(
                self.hal,
                root,
                slot,
                dir_entry.with_flags(dir_entry.flags() | PteFlags::USER),
            );
        }

        let table = dir_entry.addr();
        let idx = virt.table_index();
        if read_entry(self.hal, table, idx).is_present() {
            return Err(MmError::AlreadyMapped);
        }

        let mut flags = flags | PteFlags::PRESENT;
        if !self.policy.global_pages {
            flags -= PteFlags::GLOBAL;
        }
        write_entry(self.hal, table, idx, PageTableEntry::new(phys, flags));
        self.hal.invalidate_page(virt);
        Ok(())
    }

    /// Garante que o slot de diretório que cobre `virt` tem tabela.
    ///
    /// Usado no boot para pré-crescer as janelas do kernel (heap, guard
    /// pages, MMIO): tabelas criadas ANTES do primeiro clone de diretório
    /// ficam visíveis em todo address space que copiar os slots do kernel.
    pub fn ensure_table(&self, pool: &mut FramePool, root: PhysAddr, virt: VirtAddr) -> MmResult<()> {
        let slot = virt.dir_index();
        if read_entry(self.hal, root, slot).is_present() {
            return Ok(());
        }
        let frame = pool
            .allocate_frame(PID_KERNEL, FrameFlags::KERNEL)
            .ok_or(MmError::OutOfMemory)?;
        pool.zero_frame(frame);
        write_entry(
            self.hal,
            root,
            slot,
            PageTableEntry::new(
                PhysAddr::from_frame(frame),
                PteFlags::PRESENT | PteFlags::WRITABLE,
            ),
        );
        Ok(())
    }

    /// Desfaz o mapeamento de `virt`.
    ///
    /// Decrementa o refcount do frame alvo (liberação real acontece em 0).
    /// Desfazer um endereço sem mapeamento é no-op, não erro. Frames fora
    /// do pool (MMIO) não passam pelo refcount.
    pub fn unmap(&self, pool: &mut FramePool, root: PhysAddr, virt: VirtAddr) -> MmResult<()> {
        if !virt.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }

        let dir_entry = read_entry(self.hal, root, virt.dir_index());
        if !dir_entry.is_present() {
            return Ok(());
        }
        let table = dir_entry.addr();
        let idx = virt.table_index();
        let entry = read_entry(self.hal, table, idx);
        if !entry.is_present() {
            return Ok(());
        }

        write_entry(self.hal, table, idx, PageTableEntry::zero());
        self.hal.invalidate_page(virt);

        let frame = entry.frame();
        if frame < pool.total_frames() {
            pool.free_frame(frame)?;
        }
        Ok(())
    }

    /// Desfaz um mapeamento sem tocar no pool (janelas de dispositivo)
    pub fn unmap_raw(&self, root: PhysAddr, virt: VirtAddr) -> MmResult<()> {
        if !virt.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }
        let dir_entry = read_entry(self.hal, root, virt.dir_index());
        if !dir_entry.is_present() {
            return Ok(());
        }
        let idx = virt.table_index();
        let entry = read_entry(self.hal, dir_entry.addr(), idx);
        if entry.is_present() {
            write_entry(self.hal, dir_entry.addr(), idx, PageTableEntry::zero());
            self.hal.invalidate_page(virt);
        }
        Ok(())
    }

    /// Troca só os bits de proteção, mantendo o frame físico.
    pub fn update_flags(&self, root: PhysAddr, virt: VirtAddr, flags: PteFlags) -> MmResult<()> {
        if !virt.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }
        let dir_entry = read_entry(self.hal, root, virt.dir_index());
        if !dir_entry.is_present() {
            return Err(MmError::NotMapped);
        }
        let table = dir_entry.addr();
        let idx = virt.table_index();
        let entry = read_entry(self.hal, table, idx);
        if !entry.is_present() {
            return Err(MmError::NotMapped);
        }

        let mut flags = flags | PteFlags::PRESENT;
        if !self.policy.global_pages {
            flags -= PteFlags::GLOBAL;
        }
        write_entry(self.hal, table, idx, entry.with_flags(flags));
        self.hal.invalidate_page(virt);
        Ok(())
    }

    /// Tradução de diagnóstico: virt → phys (com offset dentro da página)
    pub fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        self.entry(root, virt).map(|e| {
            PhysAddr::new(e.addr().as_u32() | virt.page_offset() as u32)
        })
    }

    /// Entrada presente que cobre `virt`, se houver
    pub(crate) fn entry(&self, root: PhysAddr, virt: VirtAddr) -> Option<PageTableEntry> {
        let dir_entry = read_entry(self.hal, root, virt.dir_index());
        if !dir_entry.is_present() {
            return None;
        }
        let entry = read_entry(self.hal, dir_entry.addr(), virt.table_index());
        entry.is_present().then_some(entry)
    }

    /// Reescreve a entrada presente que cobre `virt` (resolução de COW)
    pub(crate) fn replace_entry(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        entry: PageTableEntry,
    ) -> MmResult<()> {
        let dir_entry = read_entry(self.hal, root, virt.dir_index());
        if !dir_entry.is_present() {
            return Err(MmError::NotMapped);
        }
        write_entry(self.hal, dir_entry.addr(), virt.table_index(), entry);
        self.hal.invalidate_page(virt);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ciclo de vida de diretórios
    // -------------------------------------------------------------------------

    /// Aloca um diretório novo.
    ///
    /// Os slots do kernel (768..1024) são SEMPRE copiados literalmente do
    /// diretório do kernel - o kernel precisa estar alcançável em qualquer
    /// espaço para a entrada de trap/syscall. Com `kernel_accessible`,
    /// entradas kernel-only da metade baixa também são herdadas.
    pub fn create_directory(
        &self,
        pool: &mut FramePool,
        kernel_root: PhysAddr,
        kernel_accessible: bool,
    ) -> MmResult<PhysAddr> {
        let frame = pool
            .allocate_frame(PID_KERNEL, FrameFlags::KERNEL)
            .ok_or(MmError::OutOfMemory)?;
        pool.zero_frame(frame);
        let root = PhysAddr::from_frame(frame);

        for slot in KERNEL_DIR_SLOT..ENTRIES_PER_TABLE {
            write_entry(self.hal, root, slot, read_entry(self.hal, kernel_root, slot));
        }

        if kernel_accessible {
            for slot in 0..KERNEL_DIR_SLOT {
                let e = read_entry(self.hal, kernel_root, slot);
                if e.is_present() && !e.flags().contains(PteFlags::USER) {
                    write_entry(self.hal, root, slot, e);
                }
            }
        }

        Ok(root)
    }

    /// Clona todos os mapeamentos de usuário de `src_root`.
    ///
    /// Com `copy_on_write`, páginas writable privadas são rebaixadas para
    /// read-only + COW NOS DOIS LADOS e o frame é compartilhado (refcount
    /// +1); o write fault posterior resolve a cópia. Frames `SHARED` e de
    /// dispositivo continuam compartilhados como estão. Sem COW, cada
    /// página presente é duplicada byte a byte.
    pub fn clone_directory(
        &self,
        pool: &mut FramePool,
        src_root: PhysAddr,
        kernel_root: PhysAddr,
        new_owner: Pid,
        copy_on_write: bool,
    ) -> MmResult<PhysAddr> {
        let new_root = self.create_directory(pool, kernel_root, false)?;

        for slot in 0..KERNEL_DIR_SLOT {
            let dir_entry = read_entry(self.hal, src_root, slot);
            if !dir_entry.is_present() {
                continue;
            }
            // Entradas kernel-only herdadas (espaços kernel_accessible):
            // compartilhadas, nunca clonadas.
            if dir_entry == read_entry(self.hal, kernel_root, slot) {
                write_entry(self.hal, new_root, slot, dir_entry);
                continue;
            }

            let src_table = dir_entry.addr();
            let table_frame = match pool.allocate_frame(PID_KERNEL, FrameFlags::KERNEL) {
                Some(f) => f,
                None => {
                    let _ = self.destroy_directory(pool, new_root, kernel_root);
                    return Err(MmError::OutOfMemory);
                }
            };
            pool.zero_frame(table_frame);
            let new_table = PhysAddr::from_frame(table_frame);
            write_entry(
                self.hal,
                new_root,
                slot,
                PageTableEntry::new(new_table, dir_entry.flags()),
            );

            for idx in 0..ENTRIES_PER_TABLE {
                let pte = read_entry(self.hal, src_table, idx);
                if !pte.is_present() {
                    continue;
                }
                let virt = slot_virt(slot, idx);
                match self.clone_entry(pool, src_table, idx, virt, pte, new_owner, copy_on_write) {
                    Ok(new_pte) => write_entry(self.hal, new_table, idx, new_pte),
                    Err(e) => {
                        let _ = self.destroy_directory(pool, new_root, kernel_root);
                        return Err(e);
                    }
                }
            }
        }

        Ok(new_root)
    }

    fn clone_entry(
        &self,
        pool: &mut FramePool,
        src_table: PhysAddr,
        idx: usize,
        virt: VirtAddr,
        pte: PageTableEntry,
        new_owner: Pid,
        copy_on_write: bool,
    ) -> MmResult<PageTableEntry> {
        let frame = pte.frame();
        let device = frame >= pool.total_frames();
        let shared = !device && pool.flags(frame)?.contains(FrameFlags::SHARED);

        if copy_on_write || shared || device {
            if !device {
                pool.inc_ref(frame)?;
            }
            if copy_on_write && !shared && !device && pte.flags().contains(PteFlags::WRITABLE) {
                // Rebaixa os DOIS lados; o dono original também passa a
                // faultar na próxima escrita.
                let down = pte.with_flags((pte.flags() - PteFlags::WRITABLE) | PteFlags::COW);
                write_entry(self.hal, src_table, idx, down);
                self.hal.invalidate_page(virt);
                return Ok(down);
            }
            return Ok(pte);
        }

        // Cópia profunda
        let new_frame = pool
            .allocate_frame(new_owner, FrameFlags::empty())
            .ok_or(MmError::OutOfMemory)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.hal.frame_ptr(frame),
                self.hal.frame_ptr(new_frame),
                PAGE_SIZE,
            );
        }
        Ok(PageTableEntry::new(
            PhysAddr::from_frame(new_frame),
            pte.flags(),
        ))
    }

    /// Libera tudo que o diretório possui com exclusividade.
    ///
    /// Percorre a metade de usuário: cada página presente devolve uma
    /// referência ao pool, cada tabela própria é liberada, e por fim o
    /// frame do próprio diretório. Slots do kernel e entradas herdadas do
    /// diretório do kernel são compartilhados - ficam intactos.
    pub fn destroy_directory(
        &self,
        pool: &mut FramePool,
        root: PhysAddr,
        kernel_root: PhysAddr,
    ) -> MmResult<()> {
        for slot in 0..KERNEL_DIR_SLOT {
            let dir_entry = read_entry(self.hal, root, slot);
            if !dir_entry.is_present() {
                continue;
            }
            if dir_entry == read_entry(self.hal, kernel_root, slot) {
                continue;
            }

            let table = dir_entry.addr();
            for idx in 0..ENTRIES_PER_TABLE {
                let pte = read_entry(self.hal, table, idx);
                if !pte.is_present() {
                    continue;
                }
                let frame = pte.frame();
                if frame < pool.total_frames() {
                    if let Err(e) = pool.free_frame(frame) {
                        crate::kerror!(
                            "(VMM) destroy: frame {} inconsistente: {}",
                            frame,
                            e.as_str()
                        );
                    }
                }
            }
            if let Err(e) = pool.free_frame(table.frame_index()) {
                crate::kerror!("(VMM) destroy: tabela {:?} inconsistente: {}", table, e.as_str());
            }
        }

        pool.free_frame(root.frame_index())
    }

    // -------------------------------------------------------------------------
    // Troca de contexto
    // -------------------------------------------------------------------------

    /// Ativa o diretório `root`.
    ///
    /// # Safety
    /// `root` deve ser um diretório válido com o kernel mapeado.
    pub unsafe fn activate(&self, root: PhysAddr) {
        // Recarga de CR3: efeito de flush total implícito no hardware
        self.hal.load_root(root);
    }

    /// Diretório atualmente ativo
    pub fn current_root(&self) -> PhysAddr {
        self.hal.current_root()
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryMap, MemoryRange, RangeKind};
    use crate::hal::mock::MockHal;

    fn setup(frames: usize) -> (&'static MockHal, FramePool, Mapper, PhysAddr) {
        let hal = MockHal::leak(frames);
        let ranges = alloc::vec![MemoryRange::new(
            PhysAddr::new(0),
            (frames * PAGE_SIZE) as u32,
            RangeKind::Usable,
        )];
        let map = MemoryMap::new(alloc::boxed::Box::leak(ranges.into_boxed_slice()));
        let mut pool = FramePool::new(hal, &map).unwrap();

        let mapper = Mapper::new(hal, MapperPolicy::from_features(hal.cpu_features()));
        let kroot_frame = pool
            .allocate_frame(PID_KERNEL, FrameFlags::KERNEL)
            .unwrap();
        pool.zero_frame(kroot_frame);
        (hal, pool, mapper, PhysAddr::from_frame(kroot_frame))
    }

    #[test]
    fn test_map_translate_unmap() {
        let (hal, mut pool, mapper, kroot) = setup(128);
        let frame = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        let virt = VirtAddr::new(0x0804_8000);

        mapper
            .map(
                &mut pool,
                kroot,
                virt,
                PhysAddr::from_frame(frame),
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();

        let phys = mapper.translate(kroot, VirtAddr::new(0x0804_8123)).unwrap();
        assert_eq!(phys.frame_index(), frame);
        assert_eq!(phys.page_offset(), 0x123);
        assert!(hal.invalidation_count() >= 1);

        mapper.unmap(&mut pool, kroot, virt).unwrap();
        assert!(mapper.translate(kroot, virt).is_none());
        // unmap decrementou a única referência: frame voltou ao pool
        assert!(!pool.is_allocated(frame));
    }

    #[test]
    fn test_unmap_absent_is_noop() {
        let (_hal, mut pool, mapper, kroot) = setup(64);
        assert_eq!(
            mapper.unmap(&mut pool, kroot, VirtAddr::new(0x4000_0000)),
            Ok(())
        );
    }

    #[test]
    fn test_remap_is_already_mapped() {
        let (_hal, mut pool, mapper, kroot) = setup(64);
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        let virt = VirtAddr::new(0x1000_0000);
        mapper
            .map(&mut pool, kroot, virt, PhysAddr::from_frame(f), PteFlags::USER)
            .unwrap();
        assert_eq!(
            mapper.map(&mut pool, kroot, virt, PhysAddr::from_frame(f), PteFlags::USER),
            Err(MmError::AlreadyMapped)
        );
    }

    #[test]
    fn test_update_flags() {
        let (_hal, mut pool, mapper, kroot) = setup(64);
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        let virt = VirtAddr::new(0x1000_0000);

        assert_eq!(
            mapper.update_flags(kroot, virt, PteFlags::WRITABLE),
            Err(MmError::NotMapped)
        );

        mapper
            .map(
                &mut pool,
                kroot,
                virt,
                PhysAddr::from_frame(f),
                PteFlags::USER | PteFlags::WRITABLE,
            )
            .unwrap();
        mapper.update_flags(kroot, virt, PteFlags::USER).unwrap();

        let e = mapper.entry(kroot, virt).unwrap();
        assert!(!e.flags().contains(PteFlags::WRITABLE));
        assert_eq!(e.frame(), f);
    }

    #[test]
    fn test_create_directory_copies_kernel_slots() {
        let (_hal, mut pool, mapper, kroot) = setup(128);
        // Simula um mapeamento do kernel na metade alta
        let f = pool.allocate_frame(PID_KERNEL, FrameFlags::KERNEL).unwrap();
        mapper
            .map(
                &mut pool,
                kroot,
                VirtAddr::new(0xC010_0000),
                PhysAddr::from_frame(f),
                PteFlags::WRITABLE | PteFlags::GLOBAL,
            )
            .unwrap();

        let proc_root = mapper.create_directory(&mut pool, kroot, false).unwrap();
        let phys = mapper
            .translate(proc_root, VirtAddr::new(0xC010_0000))
            .unwrap();
        assert_eq!(phys.frame_index(), f);
    }

    #[test]
    fn test_clone_cow_downgrades_both_sides() {
        let (_hal, mut pool, mapper, kroot) = setup(128);
        let src_root = mapper.create_directory(&mut pool, kroot, false).unwrap();
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        let virt = VirtAddr::new(0x1000_0000);
        mapper
            .map(
                &mut pool,
                src_root,
                virt,
                PhysAddr::from_frame(f),
                PteFlags::USER | PteFlags::WRITABLE,
            )
            .unwrap();

        let dst_root = mapper
            .clone_directory(&mut pool, src_root, kroot, 2, true)
            .unwrap();

        for root in [src_root, dst_root] {
            let e = mapper.entry(root, virt).unwrap();
            assert!(!e.flags().contains(PteFlags::WRITABLE));
            assert!(e.flags().contains(PteFlags::COW));
            assert_eq!(e.frame(), f);
        }
        assert_eq!(pool.ref_count(f).unwrap(), 2);
    }

    #[test]
    fn test_destroy_frees_unique_frames() {
        let (_hal, mut pool, mapper, kroot) = setup(128);
        let before = pool.free_frames();

        let root = mapper.create_directory(&mut pool, kroot, false).unwrap();
        let f = pool.allocate_frame(1, FrameFlags::empty()).unwrap();
        mapper
            .map(
                &mut pool,
                root,
                VirtAddr::new(0x1000_0000),
                PhysAddr::from_frame(f),
                PteFlags::USER | PteFlags::WRITABLE,
            )
            .unwrap();

        mapper.destroy_directory(&mut pool, root, kroot).unwrap();
        assert_eq!(pool.free_frames(), before);
    }
}
