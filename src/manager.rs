//! # MemoryManager - Facade do Subsistema de Memória
//!
//! O ponto único de entrada: inicialização na ordem certa, ciclo de vida
//! de processos, entrada de page faults e diagnóstico. Todos os outros
//! subsistemas do kernel (scheduler, loader de ELF, virtualização,
//! console) falam com a memória através deste tipo.
//!
//! ---------------------------------------------------------------------
//! ORDEM DE INICIALIZAÇÃO
//! ---------------------------------------------------------------------
//!
//! ```text
//! PMM  ──▶ bitmap + tabela de frames a partir do memory map
//!  │
//!  ▼
//! VMM  ──▶ diretório do kernel + janela direta + tabelas pré-crescidas
//!  │
//!  ▼
//! ASLR ──▶ seed de entropia fraca, janelas por categoria
//!  │
//!  ▼
//! Heap ──▶ extent inicial carvado do pool
//! ```
//!
//! ❗ A ordem NÃO é opcional: cada estágio consome o anterior.
//!
//! ---------------------------------------------------------------------
//! HIERARQUIA DE LOCKS (ÚNICA ORDEM PERMITIDA)
//! ---------------------------------------------------------------------
//!
//! ```text
//! heap ─────────────┐
//! processes ────────┼──▶ pool        (PMM é sempre o ÚLTIMO lock)
//! kernel_space ─────┘
//! aslr (folha: nunca segura outro lock)
//! ```
//!
//! O pool é adquirido por quem já segura heap OU um address space, nunca
//! o contrário. Não existe caminho que segure dois address spaces além de
//! `share`, que os adquire sob o MESMO lock de `processes`. Seguir esta
//! ordem à risca é o que nos dispensa de um lock global.
//!
//! ---------------------------------------------------------------------
//! TABELAS DO KERNEL PRÉ-CRESCIDAS
//! ---------------------------------------------------------------------
//!
//! As janelas do heap, de alocações grandes e de MMIO têm suas tabelas
//! de segundo nível criadas AQUI, no boot. Motivo: os slots de diretório
//! do kernel são copiados para cada processo na criação; tabela criada
//! depois não apareceria nos diretórios já clonados. Falhar em crescer
//! as tabelas do próprio kernel é fatal - não há fallback.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::addr::{PhysAddr, VirtAddr};
use crate::aslr::AslrConfig;
use crate::aspace::fault::{handle_page_fault, FaultResult, FaultSink, PageFaultInfo};
use crate::aspace::layout::create_default_layout;
use crate::aspace::region::{Region, RegionFlags, RegionKind, RegionPerms};
use crate::aspace::{check_wx, AddressSpace};
use crate::boot::{AslrBootConfig, CpuFeatures, MemoryMap};
use crate::config::{
    KERNEL_BASE, KHEAP_MAX_SIZE, KHEAP_VIRT_BASE, KLARGE_MAX_SIZE, KLARGE_VIRT_BASE,
    KMMIO_VIRT_BASE, PAGE_SIZE,
};
use crate::error::{MmError, MmResult};
use crate::hal::Hal;
use crate::heap::{HeapStats, KernelHeap};
use crate::pmm::FramePool;
use crate::stats::{MmStats, MmStatsSnapshot};
use crate::vmm::{Mapper, MapperPolicy, PteFlags};
use crate::Pid;

/// Janela de MMIO pré-crescida (tabelas criadas no boot)
const KMMIO_PREGROWN: u32 = 64 * 1024 * 1024;

struct ProcessSpace {
    pid: Pid,
    space: AddressSpace,
}

/// O subsistema de memória inteiro, como um único valor
pub struct MemoryManager {
    hal: &'static dyn Hal,
    mapper: Mapper,
    kernel_root: PhysAddr,
    pool: spin::Mutex<FramePool>,
    kernel_space: spin::Mutex<AddressSpace>,
    processes: spin::Mutex<Vec<ProcessSpace>>,
    aslr: AslrConfig,
    heap: spin::Mutex<KernelHeap>,
    fault_sink: &'static dyn FaultSink,
    stats: MmStats,
}

impl MemoryManager {
    /// Inicializa completamente o subsistema de memória.
    ///
    /// Deve ser chamada exatamente uma vez, em early-boot, antes de
    /// qualquer outro uso do crate.
    pub fn init(
        hal: &'static dyn Hal,
        map: &MemoryMap<'_>,
        aslr_cfg: AslrBootConfig,
        fault_sink: &'static dyn FaultSink,
    ) -> MmResult<Self> {
        crate::kinfo!("(MM) Inicializando subsistema de memória...");

        // 1. PMM
        let mut pool = FramePool::new(hal, map)?;
        crate::kinfo!("(MM) PMM OK, iniciando VMM...");

        // 2. VMM: diretório do kernel + janela direta
        let features = hal.cpu_features();
        let mapper = Mapper::new(hal, MapperPolicy::from_features(features));

        let kroot_frame = pool
            .allocate_frame(crate::PID_KERNEL, crate::pmm::frame::FrameFlags::KERNEL)
            .ok_or(MmError::InitFailed)?;
        pool.zero_frame(kroot_frame);
        let kernel_root = PhysAddr::from_frame(kroot_frame);

        // Janela direta: frame N visível em KERNEL_BASE + N*4096. Alias
        // privilegiado de TODA a RAM gerenciada; fica fora da disciplina
        // de refcount porque nunca é desfeita.
        let total = pool.total_frames();
        for i in 0..total {
            mapper.map(
                &mut pool,
                kernel_root,
                VirtAddr::new(KERNEL_BASE + (i * PAGE_SIZE) as u32),
                PhysAddr::from_frame(i),
                PteFlags::WRITABLE | PteFlags::GLOBAL,
            )?;
        }

        // Tabelas pré-crescidas das janelas do kernel (fatal se faltar
        // frame: o kernel não tem fallback para as próprias tabelas)
        let windows = [
            (KHEAP_VIRT_BASE, KHEAP_MAX_SIZE),
            (KLARGE_VIRT_BASE, KLARGE_MAX_SIZE),
            (KMMIO_VIRT_BASE, KMMIO_PREGROWN),
        ];
        for (base, len) in windows {
            let mut virt = base;
            while virt < base.saturating_add(len) {
                mapper.ensure_table(&mut pool, kernel_root, VirtAddr::new(virt))?;
                virt = match virt.checked_add(1 << 22) {
                    Some(v) => v,
                    None => break,
                };
            }
        }

        let mut kernel_space = AddressSpace::kernel(kernel_root);
        kernel_space.insert_region(Region::new(
            VirtAddr::new(KERNEL_BASE),
            VirtAddr::new(KERNEL_BASE + (total * PAGE_SIZE) as u32),
            RegionKind::Kernel,
            RegionPerms::READ | RegionPerms::WRITE,
            RegionFlags::FIXED,
            "direct-map",
        ))?;

        unsafe { hal.load_root(kernel_root) };
        crate::kinfo!("(MM) VMM OK, iniciando ASLR + Heap...");

        // 3. ASLR
        let aslr = AslrConfig::init(hal, aslr_cfg);

        // 4. Heap do kernel
        let heap = KernelHeap::init(mapper, kernel_root, &mut pool)?;

        crate::kinfo!(
            "(MM) Subsistema de memória inicializado ({} frames livres)",
            pool.free_frames()
        );

        Ok(Self {
            hal,
            mapper,
            kernel_root,
            pool: spin::Mutex::new(pool),
            kernel_space: spin::Mutex::new(kernel_space),
            processes: spin::Mutex::new(Vec::new()),
            aslr,
            heap: spin::Mutex::new(heap),
            fault_sink,
            stats: MmStats::new(),
        })
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.hal.cpu_features()
    }

    pub fn aslr(&self) -> &AslrConfig {
        &self.aslr
    }

    // -------------------------------------------------------------------------
    // Ciclo de vida de processos
    // -------------------------------------------------------------------------

    /// Cria o address space de um processo com o layout default
    pub fn create_process_space(&self, pid: Pid) -> MmResult<()> {
        if pid == crate::PID_KERNEL {
            return Err(MmError::InvalidParameter);
        }
        let mut procs = self.processes.lock();
        if procs.iter().any(|p| p.pid == pid) {
            return Err(MmError::InvalidParameter);
        }

        let mut pool = self.pool.lock();
        let mut space = AddressSpace::new(&self.mapper, &mut pool, pid, self.kernel_root, false)?;
        drop(pool);

        create_default_layout(&mut space, &self.aslr)?;
        procs.push(ProcessSpace { pid, space });
        self.stats.spaces_created.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!("(MM) address space do pid {} criado", pid);
        Ok(())
    }

    /// Clona o address space de `src_pid` para um processo novo (fork)
    pub fn clone_process_space(&self, src_pid: Pid, dst_pid: Pid, copy_on_write: bool) -> MmResult<()> {
        let mut procs = self.processes.lock();
        if procs.iter().any(|p| p.pid == dst_pid) {
            return Err(MmError::InvalidParameter);
        }
        let src = procs
            .iter()
            .find(|p| p.pid == src_pid)
            .ok_or(MmError::NoSuchProcess)?;

        let mut pool = self.pool.lock();
        let space = AddressSpace::clone_from(
            &self.mapper,
            &mut pool,
            &src.space,
            dst_pid,
            self.kernel_root,
            copy_on_write,
        )?;
        drop(pool);

        procs.push(ProcessSpace {
            pid: dst_pid,
            space,
        });
        self.stats.spaces_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Destrói o address space do processo, devolvendo cada frame que ele
    /// possuía com exclusividade.
    pub fn destroy_process_space(&self, pid: Pid) -> MmResult<()> {
        let mut procs = self.processes.lock();
        let idx = procs
            .iter()
            .position(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        let entry = procs.remove(idx);
        drop(procs);

        // Nunca destruir o diretório ativo por baixo da CPU
        if self.mapper.current_root() == entry.space.root() {
            unsafe { self.mapper.activate(self.kernel_root) };
        }

        let mut pool = self.pool.lock();
        self.mapper
            .destroy_directory(&mut pool, entry.space.root(), self.kernel_root)?;
        self.stats.spaces_destroyed.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!("(MM) address space do pid {} destruído", pid);
        Ok(())
    }

    /// Ativa o diretório do processo (troca de contexto)
    pub fn switch_to_process(&self, pid: Pid) -> MmResult<()> {
        let procs = self.processes.lock();
        let entry = procs
            .iter()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        unsafe { self.mapper.activate(entry.space.root()) };
        Ok(())
    }

    /// Volta para o diretório do kernel
    pub fn switch_to_kernel(&self) {
        unsafe { self.mapper.activate(self.kernel_root) };
    }

    // -------------------------------------------------------------------------
    // Operações de região (VMM)
    // -------------------------------------------------------------------------

    /// Registra uma região lazy no espaço do processo
    pub fn alloc(
        &self,
        pid: Pid,
        size: usize,
        perms: RegionPerms,
        kind: RegionKind,
        name: &'static str,
    ) -> MmResult<VirtAddr> {
        let mut procs = self.processes.lock();
        let entry = procs
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        entry.space.alloc(&self.mapper, size, perms, kind, name)
    }

    /// Desfaz `alloc`
    pub fn free(&self, pid: Pid, addr: VirtAddr, size: usize) -> MmResult<()> {
        let mut procs = self.processes.lock();
        let entry = procs
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        let mut pool = self.pool.lock();
        entry.space.free(&self.mapper, &mut pool, addr, size)
    }

    /// Mapeia uma janela de dispositivo no espaço do KERNEL
    pub fn map_physical(
        &self,
        phys: PhysAddr,
        size: usize,
        perms: RegionPerms,
        name: &'static str,
    ) -> MmResult<VirtAddr> {
        let mut kspace = self.kernel_space.lock();
        let mut pool = self.pool.lock();
        kspace.map_physical(&self.mapper, &mut pool, phys, size, perms, name)
    }

    /// Mapeia (eager) um trecho no espaço do processo - interface do
    /// loader de ELF. Trecho dentro de região existente é materializado;
    /// trecho virgem ganha uma região `Module` própria.
    pub fn map_range(
        &self,
        pid: Pid,
        addr: VirtAddr,
        size: usize,
        perms: RegionPerms,
    ) -> MmResult<()> {
        if size == 0 {
            return Err(MmError::InvalidSize);
        }
        check_wx(self.mapper.policy(), perms)?;

        let mut procs = self.processes.lock();
        let entry = procs
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        let mut pool = self.pool.lock();

        let start = addr.align_down();
        let end = VirtAddr::new(
            addr.as_u32()
                .checked_add(size as u32)
                .ok_or(MmError::InvalidSize)?,
        )
        .align_up();

        if entry.space.find_region(start).is_none() {
            entry.space.insert_region(Region::new(
                start,
                end,
                RegionKind::Module,
                perms,
                RegionFlags::FIXED,
                "mapped",
            ))?;
        }
        entry
            .space
            .back_range(&self.mapper, &mut pool, start, (end.as_u32() - start.as_u32()) as usize)
    }

    /// Compartilha um trecho entre dois processos (mesmos frames)
    #[allow(clippy::too_many_arguments)]
    pub fn share(
        &self,
        src_pid: Pid,
        src_addr: VirtAddr,
        dst_pid: Pid,
        dst_addr: VirtAddr,
        size: usize,
        perms: RegionPerms,
    ) -> MmResult<()> {
        if src_pid == dst_pid {
            return Err(MmError::InvalidParameter);
        }
        let mut procs = self.processes.lock();
        let si = procs
            .iter()
            .position(|p| p.pid == src_pid)
            .ok_or(MmError::NoSuchProcess)?;
        let di = procs
            .iter()
            .position(|p| p.pid == dst_pid)
            .ok_or(MmError::NoSuchProcess)?;

        let (src, dst) = if si < di {
            let (l, r) = procs.split_at_mut(di);
            (&mut l[si], &mut r[0])
        } else {
            let (l, r) = procs.split_at_mut(si);
            (&mut r[0], &mut l[di])
        };

        let mut pool = self.pool.lock();
        crate::aspace::share(
            &self.mapper,
            &mut pool,
            &mut src.space,
            src_addr,
            &mut dst.space,
            dst_addr,
            size,
            perms,
        )
    }

    // -------------------------------------------------------------------------
    // Page faults
    // -------------------------------------------------------------------------

    /// Entrada única de page faults do trap handler.
    ///
    /// Fault fatal de usuário passa pelo `FaultSink` (o scheduler termina
    /// o processo com a razão registrada). Fault fatal em contexto de
    /// kernel não tem a quem culpar: pânico com diagnóstico.
    pub fn handle_page_fault(&self, pid: Pid, info: &PageFaultInfo) -> FaultResult {
        self.stats.page_faults.fetch_add(1, Ordering::Relaxed);

        // Usuário cutucando a metade do kernel: fatal imediato
        if info.user_mode && info.addr.is_kernel() {
            self.stats.fatal_faults.fetch_add(1, Ordering::Relaxed);
            self.fault_sink
                .process_fatal(pid, info, MmError::PermissionDenied);
            return FaultResult::ProtectionViolation;
        }

        let result = if info.user_mode {
            let mut procs = self.processes.lock();
            match procs.iter_mut().find(|p| p.pid == pid) {
                Some(entry) => {
                    let mut pool = self.pool.lock();
                    let r = handle_page_fault(&self.mapper, &mut pool, &mut entry.space, info);
                    if r == FaultResult::Resolved {
                        match info.access {
                            crate::aspace::fault::AccessType::Write
                                if info.present =>
                            {
                                self.stats.cow_faults.fetch_add(1, Ordering::Relaxed)
                            }
                            _ => self.stats.lazy_faults.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                    r
                }
                None => FaultResult::InvalidAddress,
            }
        } else {
            // Contexto de kernel: só o kernel_space pode resolver
            let mut kspace = self.kernel_space.lock();
            let mut pool = self.pool.lock();
            handle_page_fault(&self.mapper, &mut pool, &mut kspace, info)
        };

        match result {
            FaultResult::Resolved => result,
            FaultResult::FatalKernel => {
                panic!(
                    "(MM) page fault fatal em contexto de kernel: addr {:?} ip {:?}",
                    info.addr, info.ip
                );
            }
            reason => {
                self.stats.fatal_faults.fetch_add(1, Ordering::Relaxed);
                if !info.user_mode {
                    panic!(
                        "(MM) page fault irrecuperável no kernel: {:?} em {:?}",
                        reason, info.addr
                    );
                }
                let err = match reason {
                    FaultResult::OutOfMemory => MmError::OutOfMemory,
                    FaultResult::ProtectionViolation => MmError::PermissionDenied,
                    _ => MmError::InvalidAddress,
                };
                self.fault_sink.process_fatal(pid, info, err);
                result
            }
        }
    }

    // -------------------------------------------------------------------------
    // Heap do kernel
    // -------------------------------------------------------------------------

    /// Alocação dinâmica do kernel (zerada)
    pub fn kmalloc(&self, size: usize) -> MmResult<VirtAddr> {
        let mut heap = self.heap.lock();
        let mut pool = self.pool.lock();
        heap.alloc(&mut pool, size)
    }

    pub fn kfree(&self, ptr: VirtAddr) -> MmResult<()> {
        let mut heap = self.heap.lock();
        let mut pool = self.pool.lock();
        heap.free(&mut pool, ptr)
    }

    pub fn krealloc(&self, ptr: VirtAddr, new_size: usize) -> MmResult<VirtAddr> {
        let mut heap = self.heap.lock();
        let mut pool = self.pool.lock();
        heap.realloc(&mut pool, ptr, new_size)
    }

    // -------------------------------------------------------------------------
    // Diagnóstico (consoles e testes)
    // -------------------------------------------------------------------------

    /// Frames livres no pool
    pub fn free_pages_count(&self) -> usize {
        self.pool.lock().free_frames()
    }

    /// Estatísticas do heap (e despejo no log)
    pub fn heap_dump_stats(&self) -> HeapStats {
        let heap = self.heap.lock();
        heap.dump_stats();
        heap.stats()
    }

    /// Integridade do heap: número de inconsistências
    pub fn heap_check_integrity(&self) -> usize {
        self.heap.lock().check_integrity()
    }

    /// Despeja as regiões de um processo (ou do kernel, com `PID_KERNEL`)
    pub fn dump_regions(&self, pid: Pid) -> MmResult<usize> {
        if pid == crate::PID_KERNEL {
            return Ok(self.kernel_space.lock().dump_regions());
        }
        let procs = self.processes.lock();
        let entry = procs
            .iter()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        Ok(entry.space.dump_regions())
    }

    pub fn stats(&self) -> MmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Tradução de diagnóstico no espaço de um processo
    pub fn translate(&self, pid: Pid, virt: VirtAddr) -> MmResult<Option<PhysAddr>> {
        if pid == crate::PID_KERNEL {
            return Ok(self.mapper.translate(self.kernel_root, virt));
        }
        let procs = self.processes.lock();
        let entry = procs
            .iter()
            .find(|p| p.pid == pid)
            .ok_or(MmError::NoSuchProcess)?;
        Ok(self.mapper.translate(entry.space.root(), virt))
    }
}
