//! # Address Space Manager
//!
//! O dono do bookkeeping de regiões por processo. Aqui vive a visão
//! SEMÂNTICA da memória virtual (o que cada trecho significa, quem pode
//! acessar); a visão física (page tables) fica no `vmm` e só é tocada
//! através dele.
//!
//! Alocação é LAZY por padrão: `alloc` registra a região e não toca em
//! frame nenhum; o primeiro acesso gera page fault e o handler materializa
//! a página (ver `fault`). `map_physical` é a exceção eager, para MMIO.
//!
//! Lookup de região é O(n) sobre a lista ordenada - processos têm ~5-20
//! regiões e isso nunca apareceu em profile. Se um dia aparecer, a lista
//! ordenada já permite busca binária sem mudar o comportamento observável.

pub mod fault;
pub mod layout;
pub mod region;

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};
use crate::config::{
    KERNEL_BASE, KMMIO_VIRT_BASE, PAGE_SIZE, USER_HEAP_BASE, USER_MMAP_BASE,
};
use crate::error::{MmError, MmResult};
use crate::pmm::frame::FrameFlags;
use crate::pmm::FramePool;
use crate::vmm::{Mapper, MapperPolicy};
use crate::{Pid, PID_KERNEL};

use region::{Region, RegionFlags, RegionKind, RegionPerms};

/// Contadores por address space
#[derive(Debug, Default, Clone, Copy)]
pub struct AspaceStats {
    pub lazy_faults: u64,
    pub cow_faults: u64,
}

/// Um address space: diretório + lista ordenada de regiões
pub struct AddressSpace {
    root: PhysAddr,
    owner: Pid,
    regions: Vec<Region>,
    tlb_gen: AtomicU64,
    stats: AspaceStats,
}

impl AddressSpace {
    /// Cria um espaço novo com diretório próprio
    pub fn new(
        mapper: &Mapper,
        pool: &mut FramePool,
        owner: Pid,
        kernel_root: PhysAddr,
        kernel_accessible: bool,
    ) -> MmResult<Self> {
        let root = mapper.create_directory(pool, kernel_root, kernel_accessible)?;
        Ok(Self {
            root,
            owner,
            regions: Vec::new(),
            tlb_gen: AtomicU64::new(0),
            stats: AspaceStats::default(),
        })
    }

    /// Embrulha o diretório do kernel (criado fora, no boot)
    pub fn kernel(root: PhysAddr) -> Self {
        Self {
            root,
            owner: PID_KERNEL,
            regions: Vec::new(),
            tlb_gen: AtomicU64::new(0),
            stats: AspaceStats::default(),
        }
    }

    /// Clona outro espaço (fork). Regiões são copiadas; os mapeamentos
    /// seguem a semântica de `Mapper::clone_directory` (COW opcional).
    pub fn clone_from(
        mapper: &Mapper,
        pool: &mut FramePool,
        src: &AddressSpace,
        new_owner: Pid,
        kernel_root: PhysAddr,
        copy_on_write: bool,
    ) -> MmResult<Self> {
        let root =
            mapper.clone_directory(pool, src.root, kernel_root, new_owner, copy_on_write)?;
        Ok(Self {
            root,
            owner: new_owner,
            regions: src.regions.clone(),
            tlb_gen: AtomicU64::new(0),
            stats: AspaceStats::default(),
        })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn stats(&self) -> AspaceStats {
        self.stats
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub(crate) fn note_lazy_fault(&mut self) {
        self.stats.lazy_faults += 1;
    }

    pub(crate) fn note_cow_fault(&mut self) {
        self.stats.cow_faults += 1;
    }

    // -------------------------------------------------------------------------
    // Regiões
    // -------------------------------------------------------------------------

    /// Insere mantendo a lista ordenada por `start`. Regiões nunca se
    /// sobrepõem - invariante verificada aqui e em nenhum outro lugar.
    pub fn insert_region(&mut self, region: Region) -> MmResult<()> {
        if !region.start.is_page_aligned() || !region.end.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }
        if region.start >= region.end {
            return Err(MmError::InvalidSize);
        }
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(MmError::RegionOverlap);
        }

        let pos = self
            .regions
            .iter()
            .position(|r| r.start > region.start)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Remove a região cujo `start` é exatamente `addr`
    pub fn remove_region(&mut self, addr: VirtAddr) -> MmResult<Region> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.start == addr)
            .ok_or(MmError::RegionNotFound)?;
        self.tlb_gen.fetch_add(1, Ordering::Release);
        Ok(self.regions.remove(idx))
    }

    /// Região que contém `addr`, se houver
    pub fn find_region(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Procura um buraco livre de `size` bytes a partir de `hint`
    fn find_free_range(&self, hint: VirtAddr, size: u32) -> MmResult<VirtAddr> {
        // Kernel: a última janela de 4 MiB fica de fora (APIC e afins
        // moram lá, e o topo do espaço não pode dar wrap).
        let limit: u64 = if self.owner == PID_KERNEL {
            0xFFC0_0000
        } else {
            KERNEL_BASE as u64
        };

        let mut candidate = hint.as_u32() as u64;
        for r in &self.regions {
            if (r.end.as_u32() as u64) <= candidate {
                continue;
            }
            if candidate + size as u64 <= r.start.as_u32() as u64 {
                break;
            }
            candidate = r.end.as_u32() as u64;
        }

        if candidate + size as u64 <= limit {
            Ok(VirtAddr::new(candidate as u32))
        } else {
            Err(MmError::OutOfMemory)
        }
    }

    // -------------------------------------------------------------------------
    // Operações do contrato do VMM
    // -------------------------------------------------------------------------

    /// Registra uma região lazy de `size` bytes e devolve a base.
    /// NENHUM frame é alocado aqui: o primeiro acesso materializa.
    pub fn alloc(
        &mut self,
        mapper: &Mapper,
        size: usize,
        perms: RegionPerms,
        kind: RegionKind,
        name: &'static str,
    ) -> MmResult<VirtAddr> {
        if size == 0 {
            return Err(MmError::InvalidSize);
        }
        check_wx(mapper.policy(), perms)?;

        let size = crate::config::align_up(size, PAGE_SIZE) as u32;
        let hint = match kind {
            RegionKind::Heap => VirtAddr::new(USER_HEAP_BASE),
            RegionKind::Kernel | RegionKind::Mmio => VirtAddr::new(KMMIO_VIRT_BASE),
            _ => VirtAddr::new(USER_MMAP_BASE),
        };
        let base = self.find_free_range(hint, size)?;

        let mut flags = RegionFlags::empty();
        if kind == RegionKind::Heap {
            flags |= RegionFlags::GROWS_UP;
        }
        self.insert_region(Region::new(
            base,
            VirtAddr::new(base.as_u32() + size),
            kind,
            perms,
            flags,
            name,
        ))?;
        Ok(base)
    }

    /// Desfaz `alloc`: remove a região e devolve as páginas que chegaram
    /// a ser materializadas. `addr` precisa ser exatamente o início de uma
    /// região, e `size` cobrir o tamanho dela.
    pub fn free(
        &mut self,
        mapper: &Mapper,
        pool: &mut FramePool,
        addr: VirtAddr,
        size: usize,
    ) -> MmResult<()> {
        let region = match self.regions.iter().find(|r| r.start == addr) {
            Some(r) => r.clone(),
            None => {
                crate::kwarn!("(ASpace) free de endereço que não inicia região: {:?}", addr);
                return Err(MmError::InvalidParameter);
            }
        };
        if crate::config::align_up(size, PAGE_SIZE) as u32 != region.size() {
            return Err(MmError::InvalidSize);
        }

        self.unmap_region_pages(mapper, pool, &region);
        self.remove_region(addr)?;
        Ok(())
    }

    fn unmap_region_pages(&self, mapper: &Mapper, pool: &mut FramePool, region: &Region) {
        let mut virt = region.start;
        while virt < region.end {
            let res = if region.kind == RegionKind::Mmio {
                mapper.unmap_raw(self.root, virt)
            } else {
                mapper.unmap(pool, self.root, virt)
            };
            if let Err(e) = res {
                crate::kerror!("(ASpace) unmap {:?} falhou: {}", virt, e.as_str());
            }
            virt = virt.saturating_add(PAGE_SIZE as u32);
        }
    }

    /// Mapeia memória de dispositivo (eager, sem cache, nunca demand-paged)
    pub fn map_physical(
        &mut self,
        mapper: &Mapper,
        pool: &mut FramePool,
        phys: PhysAddr,
        size: usize,
        perms: RegionPerms,
        name: &'static str,
    ) -> MmResult<VirtAddr> {
        if size == 0 {
            return Err(MmError::InvalidSize);
        }
        if !phys.is_page_aligned() {
            return Err(MmError::InvalidAlignment);
        }

        let size = crate::config::align_up(size, PAGE_SIZE) as u32;
        let base = self.find_free_range(VirtAddr::new(KMMIO_VIRT_BASE), size)?;

        let region = Region::new(
            base,
            VirtAddr::new(base.as_u32() + size),
            RegionKind::Mmio,
            perms,
            RegionFlags::NO_CACHE | RegionFlags::FIXED,
            name,
        );
        let pte = region.pte_flags();
        self.insert_region(region)?;

        let pages = size as usize / PAGE_SIZE;
        for i in 0..pages {
            let virt = VirtAddr::new(base.as_u32() + (i * PAGE_SIZE) as u32);
            let frame_addr = PhysAddr::new(phys.as_u32() + (i * PAGE_SIZE) as u32);
            if let Err(e) = mapper.map(pool, self.root, virt, frame_addr, pte) {
                // Rollback das páginas já instaladas
                for j in 0..i {
                    let v = VirtAddr::new(base.as_u32() + (j * PAGE_SIZE) as u32);
                    let _ = mapper.unmap_raw(self.root, v);
                }
                let _ = self.remove_region(base);
                return Err(e);
            }
        }
        Ok(base)
    }

    /// Materializa eagerly todas as páginas de `[addr, addr+size)`.
    /// Usado pelo loader de ELF, que escreve nos trechos logo em seguida.
    pub fn back_range(
        &mut self,
        mapper: &Mapper,
        pool: &mut FramePool,
        addr: VirtAddr,
        size: usize,
    ) -> MmResult<()> {
        let start = addr.align_down();
        let end = VirtAddr::new(addr.as_u32().checked_add(size as u32).ok_or(MmError::InvalidSize)?)
            .align_up();

        let mut virt = start;
        while virt < end {
            let pte = match self.find_region(virt) {
                Some(r) => r.pte_flags(),
                None => return Err(MmError::RegionNotFound),
            };
            if mapper.entry(self.root, virt).is_none() {
                let frame = pool
                    .allocate_frame(self.owner, FrameFlags::empty())
                    .ok_or(MmError::OutOfMemory)?;
                pool.zero_frame(frame);
                mapper.map(pool, self.root, virt, PhysAddr::from_frame(frame), pte)?;
            }
            virt = virt.saturating_add(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Despeja as regiões no log (diagnóstico de console)
    pub fn dump_regions(&self) -> usize {
        crate::kinfo!(
            "(ASpace) pid {} - {} regiões (root {:?})",
            self.owner,
            self.regions.len(),
            self.root
        );
        for r in &self.regions {
            crate::kinfo!(
                "  {:?}..{:?} {:?} perms={:#04x} {}",
                r.start,
                r.end,
                r.kind,
                r.perms.bits(),
                r.name
            );
        }
        self.regions.len()
    }
}

/// Recusa regiões de usuário W+X quando a política exige
pub(crate) fn check_wx(policy: MapperPolicy, perms: RegionPerms) -> MmResult<()> {
    if policy.wx_enforce
        && perms.contains(RegionPerms::USER)
        && perms.contains(RegionPerms::WRITE | RegionPerms::EXEC)
    {
        return Err(MmError::WxViolation);
    }
    Ok(())
}

/// Compartilha `[src_addr, src_addr+size)` entre dois espaços.
///
/// Cria uma região `Shared` no destino apontando para OS MESMOS frames do
/// trecho de origem (refcount incrementado). Páginas de origem ainda não
/// materializadas são alocadas aqui - compartilhar exige substrato.
#[allow(clippy::too_many_arguments)]
pub fn share(
    mapper: &Mapper,
    pool: &mut FramePool,
    src: &mut AddressSpace,
    src_addr: VirtAddr,
    dst: &mut AddressSpace,
    dst_addr: VirtAddr,
    size: usize,
    perms: RegionPerms,
) -> MmResult<()> {
    if size == 0 {
        return Err(MmError::InvalidSize);
    }
    if !src_addr.is_page_aligned() || !dst_addr.is_page_aligned() {
        return Err(MmError::InvalidAlignment);
    }

    let size = crate::config::align_up(size, PAGE_SIZE) as u32;
    let src_end = VirtAddr::new(
        src_addr
            .as_u32()
            .checked_add(size)
            .ok_or(MmError::InvalidSize)?,
    );

    // A origem precisa de uma região cobrindo o trecho inteiro
    let (src_pte, src_covers) = match src.find_region(src_addr) {
        Some(r) => (r.pte_flags(), r.end >= src_end),
        None => return Err(MmError::RegionNotFound),
    };
    if !src_covers {
        return Err(MmError::RegionNotFound);
    }

    let dst_region = Region::new(
        dst_addr,
        VirtAddr::new(dst_addr.as_u32() + size),
        RegionKind::Shared,
        perms,
        RegionFlags::SHARED,
        "shared",
    );
    let dst_pte = dst_region.pte_flags();
    dst.insert_region(dst_region)?;

    let pages = size as usize / PAGE_SIZE;
    for i in 0..pages {
        let sv = VirtAddr::new(src_addr.as_u32() + (i * PAGE_SIZE) as u32);
        let dv = VirtAddr::new(dst_addr.as_u32() + (i * PAGE_SIZE) as u32);

        // Materializa a página de origem se necessário
        let frame = match mapper.entry(src.root(), sv) {
            Some(e) => e.frame(),
            None => {
                let f = pool
                    .allocate_frame(src.owner(), FrameFlags::SHARED)
                    .ok_or(MmError::OutOfMemory)?;
                pool.zero_frame(f);
                mapper.map(pool, src.root(), sv, PhysAddr::from_frame(f), src_pte)?;
                f
            }
        };

        let flags = pool.flags(frame)?;
        pool.set_flags(frame, flags | FrameFlags::SHARED)?;
        pool.inc_ref(frame)?;
        mapper.map(pool, dst.root(), dv, PhysAddr::from_frame(frame), dst_pte)?;
    }
    Ok(())
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryMap, MemoryRange, RangeKind};
    use crate::hal::mock::MockHal;
    use crate::hal::Hal;
    use crate::vmm::MapperPolicy;

    fn setup(frames: usize) -> (FramePool, Mapper, PhysAddr) {
        let hal = MockHal::leak(frames);
        let ranges = alloc::vec![MemoryRange::new(
            PhysAddr::new(0),
            (frames * PAGE_SIZE) as u32,
            RangeKind::Usable,
        )];
        let map = MemoryMap::new(alloc::boxed::Box::leak(ranges.into_boxed_slice()));
        let mut pool = FramePool::new(hal, &map).unwrap();
        let mapper = Mapper::new(hal, MapperPolicy::from_features(hal.cpu_features()));
        let kroot = {
            let f = pool
                .allocate_frame(PID_KERNEL, FrameFlags::KERNEL)
                .unwrap();
            pool.zero_frame(f);
            PhysAddr::from_frame(f)
        };
        (pool, mapper, kroot)
    }

    fn user_space(pool: &mut FramePool, mapper: &Mapper, kroot: PhysAddr, pid: Pid) -> AddressSpace {
        AddressSpace::new(mapper, pool, pid, kroot, false).unwrap()
    }

    #[test]
    fn test_alloc_is_lazy() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);
        let free_before = pool.free_frames();

        let base = space
            .alloc(
                &mapper,
                3 * PAGE_SIZE,
                RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER,
                RegionKind::Shared,
                "anon",
            )
            .unwrap();

        // Região registrada, zero frames tocados
        assert!(space.find_region(base).is_some());
        assert_eq!(pool.free_frames(), free_before);
        assert!(mapper.translate(space.root(), base).is_none());
    }

    #[test]
    fn test_overlap_rejected() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);

        space
            .insert_region(Region::new(
                VirtAddr::new(0x4000_0000),
                VirtAddr::new(0x4001_0000),
                RegionKind::Shared,
                RegionPerms::READ | RegionPerms::USER,
                RegionFlags::empty(),
                "a",
            ))
            .unwrap();
        let err = space.insert_region(Region::new(
            VirtAddr::new(0x4000_8000),
            VirtAddr::new(0x4002_0000),
            RegionKind::Shared,
            RegionPerms::READ | RegionPerms::USER,
            RegionFlags::empty(),
            "b",
        ));
        assert_eq!(err, Err(MmError::RegionOverlap));
    }

    #[test]
    fn test_fault_then_free_returns_frames() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);
        let free_before = pool.free_frames();

        let base = space
            .alloc(
                &mapper,
                2 * PAGE_SIZE,
                RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER,
                RegionKind::Heap,
                "heap",
            )
            .unwrap();

        // Simula o primeiro acesso de escrita
        let info = fault::PageFaultInfo {
            addr: base,
            ip: VirtAddr::new(0),
            access: fault::AccessType::Write,
            user_mode: true,
            present: false,
        };
        assert_eq!(
            fault::handle_page_fault(&mapper, &mut pool, &mut space, &info),
            fault::FaultResult::Resolved
        );
        assert!(mapper.translate(space.root(), base).is_some());
        assert_eq!(pool.free_frames(), free_before - 1);

        space.free(&mapper, &mut pool, base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(pool.free_frames(), free_before);
        assert!(space.find_region(base).is_none());
    }

    #[test]
    fn test_free_requires_region_start() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);
        let base = space
            .alloc(
                &mapper,
                PAGE_SIZE,
                RegionPerms::READ | RegionPerms::USER,
                RegionKind::Shared,
                "anon",
            )
            .unwrap();

        let middle = VirtAddr::new(base.as_u32() + 0x1000);
        assert_eq!(
            space.free(&mapper, &mut pool, middle, PAGE_SIZE),
            Err(MmError::InvalidParameter)
        );
    }

    #[test]
    fn test_fault_outside_region_is_invalid() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);

        let info = fault::PageFaultInfo {
            addr: VirtAddr::new(0x6666_6000),
            ip: VirtAddr::new(0),
            access: fault::AccessType::Read,
            user_mode: true,
            present: false,
        };
        assert_eq!(
            fault::handle_page_fault(&mapper, &mut pool, &mut space, &info),
            fault::FaultResult::InvalidAddress
        );
    }

    #[test]
    fn test_fault_permission_denied() {
        let (mut pool, mapper, kroot) = setup(128);
        let mut space = user_space(&mut pool, &mapper, kroot, 1);
        let base = space
            .alloc(
                &mapper,
                PAGE_SIZE,
                RegionPerms::READ | RegionPerms::USER,
                RegionKind::Shared,
                "ro",
            )
            .unwrap();

        let info = fault::PageFaultInfo {
            addr: base,
            ip: VirtAddr::new(0),
            access: fault::AccessType::Write,
            user_mode: true,
            present: false,
        };
        assert_eq!(
            fault::handle_page_fault(&mapper, &mut pool, &mut space, &info),
            fault::FaultResult::ProtectionViolation
        );
    }

    #[test]
    fn test_share_same_frames() {
        let (mut pool, mapper, kroot) = setup(256);
        let mut a = user_space(&mut pool, &mapper, kroot, 1);
        let mut b = user_space(&mut pool, &mapper, kroot, 2);

        let src = a
            .alloc(
                &mapper,
                2 * PAGE_SIZE,
                RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER,
                RegionKind::Shared,
                "shm",
            )
            .unwrap();
        let dst = VirtAddr::new(0x5000_0000);
        share(
            &mapper, &mut pool, &mut a, src, &mut b, dst, 2 * PAGE_SIZE,
            RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER,
        )
        .unwrap();

        for i in 0..2u32 {
            let pa = mapper
                .translate(a.root(), VirtAddr::new(src.as_u32() + i * 0x1000))
                .unwrap();
            let pb = mapper
                .translate(b.root(), VirtAddr::new(dst.as_u32() + i * 0x1000))
                .unwrap();
            assert_eq!(pa, pb);
            assert_eq!(pool.ref_count(pa.frame_index()).unwrap(), 2);
        }

        // Desfazer um lado não devolve o frame; o outro ainda o referencia
        let free_mid = pool.free_frames();
        b.free(&mapper, &mut pool, dst, 2 * PAGE_SIZE).unwrap();
        assert_eq!(pool.free_frames(), free_mid);
        a.free(&mapper, &mut pool, src, 2 * PAGE_SIZE).unwrap();
        assert_eq!(pool.free_frames(), free_mid + 2);
    }
}
