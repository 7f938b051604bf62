//! # Kernel Heap Allocator
//!
//! Alocador de listas livres segregadas (bins por faixa de tamanho) sobre
//! um arena de extents, com detecção de corrupção em todas as bordas.
//!
//! ## 🎯 Propósito e Responsabilidade
//! - **Alocação dinâmica do kernel:** todo `alloc`/`free`/`realloc` de
//!   objetos internos passa por aqui.
//! - **Detecção de corrupção:** header + footer com magic e canário
//!   posicional; QUALQUER desacordo recusa a operação, conta e loga -
//!   nunca "conserta" em silêncio.
//! - **Isolamento de alocações grandes:** pedidos ≥ 1 página saem dos
//!   bins e ganham guard pages (ver `large`).
//!
//! ## 🏗️ Arquitetura
//!
//! ```text
//! bins[8]: 32  64  128  256  512  1024  2048  3072+   (payload < 4096)
//!            \   \    \    listas duplamente ligadas por OFFSET
//! extents:  [ ext0: frames contíguos mapeados em KHEAP_VIRT_BASE.. ]
//!           [ ext1: próximo trecho virtual, frames próprios        ]
//! ```
//!
//! Blocos são endereçados por offset de 32 bits relativo à base do heap;
//! todo acesso passa por bounds check contra o extent dono. Blocos NUNCA
//! atravessam extents: cada extensão nasce como um bloco livre próprio e
//! as listas de vizinhança física param na borda (extents são virtualmente
//! adjacentes mas não necessariamente adjacentes na janela direta).
//!
//! ## 🔍 Decisões que valem registro
//! - First-fit dentro do bin, subindo de bin até achar: previsível e
//!   barato; a fragmentação fica controlada pelo split/merge agressivo.
//! - Split só quando a sobra comporta 32 bytes de payload + metadados;
//!   sobra menor fica no bloco (desperdício menor que um bloco inútil).
//! - `free` envenena o payload (0xDE) antes de fundir: use-after-free
//!   aparece como lixo reconhecível, não como dado plausível.

pub mod block;
pub mod large;

use crate::addr::{PhysAddr, VirtAddr};
use crate::config::{
    align_up, pages_for, HEAP_BIN_COUNT, HEAP_BIN_FLOOR, HEAP_GRANULARITY, HEAP_MIN_PAYLOAD,
    HEAP_POISON_BYTE, KHEAP_EXTEND_MIN_PAGES, KHEAP_INITIAL_PAGES, KHEAP_MAX_SIZE,
    KHEAP_VIRT_BASE, PAGE_SIZE,
};
use crate::error::{MmError, MmResult};
use crate::pmm::frame::FrameFlags;
use crate::pmm::FramePool;
use crate::vmm::{Mapper, PteFlags};
use crate::PID_KERNEL;

use block::{
    canary_for, BlockFooter, BlockHeader, FOOTER_MAGIC, HEADER_MAGIC, HEADER_SIZE, META_SIZE,
    NULL_OFF, STATUS_FREE, STATUS_USED,
};

/// Máximo de extents por heap
const MAX_EXTENTS: usize = 32;

/// Limite de saltos ao percorrer uma lista de bin (quebra laços de lista
/// corrompida em vez de travar o kernel)
const BIN_WALK_LIMIT: usize = 100_000;

/// Um trecho contíguo (virtual E na janela direta) do heap
#[derive(Clone, Copy)]
struct HeapExtent {
    virt_off: u32,
    len: u32,
    base: *mut u8,
}

/// Snapshot de estatísticas do heap
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub large_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub corruption_count: u64,
    pub double_free_count: u64,
    pub extent_count: usize,
}

/// O heap do kernel
pub struct KernelHeap {
    mapper: Mapper,
    kernel_root: PhysAddr,
    extents: [Option<HeapExtent>; MAX_EXTENTS],
    extent_count: usize,
    /// Bytes virtuais já consumidos da janela do heap
    cursor: u32,
    /// Cabeça de cada bin (offset do primeiro bloco livre)
    bins: [u32; HEAP_BIN_COUNT],
    free_bytes: usize,
    used_bytes: usize,
    total_bytes: usize,
    alloc_count: u64,
    free_count: u64,
    corruption_count: u64,
    double_free_count: u64,
    large: large::LargeState,
}

// SAFETY: os ponteiros de extent apontam para frames do pool; o heap
// inteiro vive atrás de um Mutex no manager.
unsafe impl Send for KernelHeap {}

/// Bin que ARMAZENA blocos livres deste tamanho
fn bin_index(size: usize) -> usize {
    for i in (0..HEAP_BIN_COUNT).rev() {
        if size >= HEAP_BIN_FLOOR[i] {
            return i;
        }
    }
    0
}

impl KernelHeap {
    /// Inicializa o heap com o extent inicial e um único bloco livre
    pub fn init(mapper: Mapper, kernel_root: PhysAddr, pool: &mut FramePool) -> MmResult<Self> {
        let mut heap = Self {
            mapper,
            kernel_root,
            extents: [None; MAX_EXTENTS],
            extent_count: 0,
            cursor: 0,
            bins: [NULL_OFF; HEAP_BIN_COUNT],
            free_bytes: 0,
            used_bytes: 0,
            total_bytes: 0,
            alloc_count: 0,
            free_count: 0,
            corruption_count: 0,
            double_free_count: 0,
            large: large::LargeState::new(),
        };
        heap.extend(pool, KHEAP_INITIAL_PAGES * PAGE_SIZE - META_SIZE)?;
        crate::kinfo!(
            "(Heap) inicializado: {} KiB em {:#010x}",
            heap.total_bytes / 1024,
            KHEAP_VIRT_BASE
        );
        Ok(heap)
    }

    // -------------------------------------------------------------------------
    // Arena: acesso bounds-checked por offset
    // -------------------------------------------------------------------------

    fn off_to_ptr(&self, off: u32, len: usize) -> Option<*mut u8> {
        let end = off as u64 + len as u64;
        for e in self.extents.iter().take(self.extent_count).flatten() {
            if off >= e.virt_off && end <= e.virt_off as u64 + e.len as u64 {
                return Some(unsafe { e.base.add((off - e.virt_off) as usize) });
            }
        }
        None
    }

    fn read_header(&self, off: u32) -> MmResult<BlockHeader> {
        let ptr = self
            .off_to_ptr(off, HEADER_SIZE)
            .ok_or(MmError::Corruption)?;
        Ok(unsafe { core::ptr::read(ptr as *const BlockHeader) })
    }

    fn write_header(&mut self, off: u32, h: &BlockHeader) -> MmResult<()> {
        let ptr = self
            .off_to_ptr(off, HEADER_SIZE)
            .ok_or(MmError::Corruption)?;
        unsafe { core::ptr::write(ptr as *mut BlockHeader, *h) };
        Ok(())
    }

    fn read_footer(&self, off: u32, size: u32) -> MmResult<BlockFooter> {
        let foff = off + HEADER_SIZE as u32 + size;
        let ptr = self
            .off_to_ptr(foff, core::mem::size_of::<BlockFooter>())
            .ok_or(MmError::Corruption)?;
        Ok(unsafe { core::ptr::read(ptr as *const BlockFooter) })
    }

    fn write_footer(&mut self, off: u32, h: &BlockHeader) -> MmResult<()> {
        let foff = off + HEADER_SIZE as u32 + h.size;
        let ptr = self
            .off_to_ptr(foff, core::mem::size_of::<BlockFooter>())
            .ok_or(MmError::Corruption)?;
        unsafe { core::ptr::write(ptr as *mut BlockFooter, BlockFooter::for_header(off, h)) };
        Ok(())
    }

    /// Validação completa de um bloco: magic, canário posicional, status
    /// e acordo header/footer. Qualquer desvio é `Corruption`.
    fn validate_block(&self, off: u32) -> MmResult<BlockHeader> {
        if off % HEAP_GRANULARITY as u32 != 0 {
            return Err(MmError::Corruption);
        }
        let h = self.read_header(off)?;
        if h.magic != HEADER_MAGIC
            || h.canary != canary_for(off)
            || (h.status != STATUS_FREE && h.status != STATUS_USED)
        {
            return Err(MmError::Corruption);
        }
        // O footer só existe se o tamanho for plausível dentro do extent
        let f = self.read_footer(off, h.size)?;
        if f.magic != FOOTER_MAGIC
            || f.header_off != off
            || f.size != h.size
            || f.canary != canary_for(off)
        {
            return Err(MmError::Corruption);
        }
        Ok(h)
    }

    // -------------------------------------------------------------------------
    // Bins
    // -------------------------------------------------------------------------

    fn unlink(&mut self, off: u32, h: &BlockHeader) -> MmResult<()> {
        let bin = bin_index(h.size as usize);
        if h.prev_free == NULL_OFF {
            debug_assert_eq!(self.bins[bin], off);
            self.bins[bin] = h.next_free;
        } else {
            let mut prev = self.read_header(h.prev_free)?;
            prev.next_free = h.next_free;
            self.write_header(h.prev_free, &prev)?;
        }
        if h.next_free != NULL_OFF {
            let mut next = self.read_header(h.next_free)?;
            next.prev_free = h.prev_free;
            self.write_header(h.next_free, &next)?;
        }
        Ok(())
    }

    fn push_free(&mut self, off: u32, h: &mut BlockHeader) -> MmResult<()> {
        let bin = bin_index(h.size as usize);
        h.status = STATUS_FREE;
        h.canary = canary_for(off);
        h.prev_free = NULL_OFF;
        h.next_free = self.bins[bin];
        if self.bins[bin] != NULL_OFF {
            let mut head = self.read_header(self.bins[bin])?;
            head.prev_free = off;
            self.write_header(self.bins[bin], &head)?;
        }
        self.bins[bin] = off;
        self.write_header(off, h)?;
        self.write_footer(off, h)
    }

    /// First-fit: do bin que comporta o pedido para cima
    fn find_fit(&mut self, want: u32) -> MmResult<Option<(u32, BlockHeader)>> {
        for bin in bin_index(want as usize)..HEAP_BIN_COUNT {
            let mut cur = self.bins[bin];
            let mut hops = 0;
            while cur != NULL_OFF {
                if hops > BIN_WALK_LIMIT {
                    crate::kerror!("(Heap) bin {} com lista circular; abandonando", bin);
                    self.corruption_count += 1;
                    break;
                }
                let h = self.read_header(cur)?;
                if h.magic != HEADER_MAGIC || !h.is_free() {
                    crate::kerror!("(Heap) bloco {:#x} corrompido na lista do bin {}", cur, bin);
                    self.corruption_count += 1;
                    break;
                }
                if h.size >= want {
                    self.unlink(cur, &h)?;
                    return Ok(Some((cur, h)));
                }
                cur = h.next_free;
                hops += 1;
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Crescimento
    // -------------------------------------------------------------------------

    /// Estende o heap com um extent novo de pelo menos `min_payload` bytes
    /// utilizáveis.
    ///
    /// Os frames do extent são CONTÍGUOS: a aritmética de offsets exige
    /// que cada extent seja linear também na janela direta.
    fn extend(&mut self, pool: &mut FramePool, min_payload: usize) -> MmResult<()> {
        if self.extent_count == MAX_EXTENTS {
            crate::kwarn!("(Heap) limite de extents atingido");
            return Err(MmError::OutOfMemory);
        }

        let pages = pages_for(min_payload + META_SIZE).max(KHEAP_EXTEND_MIN_PAGES);
        let len = (pages * PAGE_SIZE) as u32;
        if self.cursor.saturating_add(len) > KHEAP_MAX_SIZE {
            crate::kwarn!("(Heap) janela virtual do heap exausta");
            return Err(MmError::OutOfMemory);
        }

        let first = pool
            .allocate_contiguous(pages, PID_KERNEL, FrameFlags::KERNEL)
            .ok_or(MmError::OutOfMemory)?;

        for i in 0..pages {
            let virt = VirtAddr::new(KHEAP_VIRT_BASE + self.cursor + (i * PAGE_SIZE) as u32);
            if let Err(e) = self.mapper.map(
                pool,
                self.kernel_root,
                virt,
                PhysAddr::from_frame(first + i),
                PteFlags::WRITABLE | PteFlags::GLOBAL,
            ) {
                for j in 0..i {
                    let v = VirtAddr::new(KHEAP_VIRT_BASE + self.cursor + (j * PAGE_SIZE) as u32);
                    let _ = self.mapper.unmap(pool, self.kernel_root, v);
                }
                let _ = pool.free_contiguous(first + i, pages - i);
                return Err(e);
            }
        }

        let ext = HeapExtent {
            virt_off: self.cursor,
            len,
            base: self.mapper.hal().frame_ptr(first),
        };
        self.extents[self.extent_count] = Some(ext);
        self.extent_count += 1;

        // O extent inteiro vira um bloco livre, sem vizinhos além da borda
        let off = ext.virt_off;
        let size = len - META_SIZE as u32;
        let mut h = BlockHeader::new_free(off, size, NULL_OFF, NULL_OFF);
        self.cursor += len;
        self.total_bytes += len as usize;
        self.free_bytes += size as usize;
        self.push_free(off, &mut h)?;

        crate::kdebug!("(Heap) extent {}: +{} KiB", self.extent_count - 1, len / 1024);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // alloc / free / realloc
    // -------------------------------------------------------------------------

    /// Aloca `size` bytes zerados. Pedidos ≥ 1 página ganham frames
    /// dedicados com guard pages.
    pub fn alloc(&mut self, pool: &mut FramePool, size: usize) -> MmResult<VirtAddr> {
        if size == 0 {
            return Err(MmError::InvalidSize);
        }
        if size >= PAGE_SIZE {
            let ptr = large::alloc_large(&self.mapper, self.kernel_root, &mut self.large, pool, size)?;
            self.alloc_count += 1;
            return Ok(ptr);
        }

        let want = align_up(size.max(HEAP_MIN_PAYLOAD), HEAP_GRANULARITY) as u32;

        let mut extended = false;
        let (off, mut h) = loop {
            if let Some(found) = self.find_fit(want)? {
                break found;
            }
            if extended {
                return Err(MmError::OutOfMemory);
            }
            self.extend(pool, want as usize)?;
            extended = true;
        };

        // Split se a sobra ainda é um bloco útil
        if h.size as usize >= want as usize + META_SIZE + HEAP_MIN_PAYLOAD {
            self.split_block(off, &mut h, want)?;
            self.free_bytes -= want as usize + META_SIZE;
        } else {
            self.free_bytes -= h.size as usize;
        }

        h.status = STATUS_USED;
        h.canary = canary_for(off);
        h.next_free = NULL_OFF;
        h.prev_free = NULL_OFF;
        self.write_header(off, &h)?;
        self.write_footer(off, &h)?;

        // Memória entregue sempre zerada
        let payload = self
            .off_to_ptr(off + HEADER_SIZE as u32, h.size as usize)
            .ok_or(MmError::Corruption)?;
        unsafe { core::ptr::write_bytes(payload, 0, h.size as usize) };

        self.used_bytes += h.size as usize;
        self.alloc_count += 1;
        Ok(VirtAddr::new(KHEAP_VIRT_BASE + off + HEADER_SIZE as u32))
    }

    fn split_block(&mut self, off: u32, h: &mut BlockHeader, want: u32) -> MmResult<()> {
        let rem_off = off + META_SIZE as u32 + want;
        let rem_size = h.size - want - META_SIZE as u32;

        let mut rem = BlockHeader::new_free(rem_off, rem_size, off, h.next_phys);
        if h.next_phys != NULL_OFF {
            let mut n = self.read_header(h.next_phys)?;
            n.prev_phys = rem_off;
            self.write_header(h.next_phys, &n)?;
        }
        h.next_phys = rem_off;
        h.size = want;
        self.push_free(rem_off, &mut rem)
    }

    /// Libera um bloco. Valida header E footer antes de tocar em qualquer
    /// coisa: desacordo é contado, logado e a operação é RECUSADA.
    pub fn free(&mut self, pool: &mut FramePool, ptr: VirtAddr) -> MmResult<()> {
        if large::is_large_ptr(ptr) {
            return match large::free_large(
                &self.mapper,
                self.kernel_root,
                &mut self.large,
                pool,
                ptr,
            ) {
                Ok(()) => {
                    self.free_count += 1;
                    Ok(())
                }
                Err(MmError::DoubleFree) => {
                    self.double_free_count += 1;
                    crate::kerror!("(Heap) double free de alocação grande {:?}", ptr);
                    Err(MmError::DoubleFree)
                }
                Err(e) => {
                    self.corruption_count += 1;
                    crate::kerror!("(Heap) free grande recusado: {} ({:?})", e.as_str(), ptr);
                    Err(e)
                }
            };
        }

        let p = ptr.as_u32();
        if p < KHEAP_VIRT_BASE + HEADER_SIZE as u32 || p >= KHEAP_VIRT_BASE + self.cursor {
            self.corruption_count += 1;
            crate::kerror!("(Heap) free de ponteiro fora do heap: {:?}", ptr);
            return Err(MmError::Corruption);
        }
        let off = p - KHEAP_VIRT_BASE - HEADER_SIZE as u32;

        let mut h = match self.validate_block(off) {
            Ok(h) => h,
            Err(e) => {
                self.corruption_count += 1;
                crate::kerror!("(Heap) free recusado: bloco {:#x} corrompido", off);
                return Err(e);
            }
        };
        if h.is_free() {
            self.double_free_count += 1;
            crate::kerror!("(Heap) double free do bloco {:#x}", off);
            return Err(MmError::DoubleFree);
        }

        let freed_size = h.size as usize;

        // Poison: use-after-free vira lixo reconhecível
        if let Some(payload) = self.off_to_ptr(off + HEADER_SIZE as u32, freed_size) {
            unsafe { core::ptr::write_bytes(payload, HEAP_POISON_BYTE, freed_size) };
        }

        self.used_bytes -= freed_size;
        self.free_bytes += freed_size;
        self.free_count += 1;

        let merged_off = self.merge_neighbors(off, &mut h)?;
        let mut h = self.read_header(merged_off)?;
        self.push_free(merged_off, &mut h)
    }

    /// Funde o bloco com vizinhos físicos livres. Retorna o offset do
    /// bloco resultante (muda quando o anterior absorve).
    fn merge_neighbors(&mut self, off: u32, h: &mut BlockHeader) -> MmResult<u32> {
        // Vizinho seguinte
        if h.next_phys != NULL_OFF {
            match self.validate_block(h.next_phys) {
                Ok(n) if n.is_free() => {
                    self.unlink(h.next_phys, &n)?;
                    h.size += META_SIZE as u32 + n.size;
                    h.next_phys = n.next_phys;
                    if n.next_phys != NULL_OFF {
                        let mut nn = self.read_header(n.next_phys)?;
                        nn.prev_phys = off;
                        self.write_header(n.next_phys, &nn)?;
                    }
                    self.free_bytes += META_SIZE;
                }
                Ok(_) => {}
                Err(_) => {
                    // Vizinho podre: não funde, mas registra
                    self.corruption_count += 1;
                    crate::kerror!("(Heap) vizinho {:#x} corrompido; merge abortado", h.next_phys);
                }
            }
        }
        self.write_header(off, h)?;
        self.write_footer(off, h)?;

        // Vizinho anterior
        if h.prev_phys != NULL_OFF {
            match self.validate_block(h.prev_phys) {
                Ok(mut p) if p.is_free() => {
                    let poff = h.prev_phys;
                    self.unlink(poff, &p)?;
                    p.size += META_SIZE as u32 + h.size;
                    p.next_phys = h.next_phys;
                    if h.next_phys != NULL_OFF {
                        let mut nn = self.read_header(h.next_phys)?;
                        nn.prev_phys = poff;
                        self.write_header(h.next_phys, &nn)?;
                    }
                    self.write_header(poff, &p)?;
                    self.write_footer(poff, &p)?;
                    self.free_bytes += META_SIZE;
                    return Ok(poff);
                }
                Ok(_) => {}
                Err(_) => {
                    self.corruption_count += 1;
                    crate::kerror!("(Heap) vizinho {:#x} corrompido; merge abortado", h.prev_phys);
                }
            }
        }
        Ok(off)
    }

    /// Realloc: encolhe in place, absorve o vizinho seguinte quando dá,
    /// ou aloca-copia-libera.
    pub fn realloc(
        &mut self,
        pool: &mut FramePool,
        ptr: VirtAddr,
        new_size: usize,
    ) -> MmResult<VirtAddr> {
        if new_size == 0 {
            return Err(MmError::InvalidSize);
        }

        // Qualquer lado grande: aloca-copia-libera (o caminho grande não
        // tem vizinhos para absorver)
        if large::is_large_ptr(ptr) || new_size >= PAGE_SIZE {
            let old_payload = if large::is_large_ptr(ptr) {
                large::large_payload_bytes(&self.mapper, self.kernel_root, ptr)?
            } else {
                let off = ptr.as_u32() - KHEAP_VIRT_BASE - HEADER_SIZE as u32;
                self.validate_block(off)?.size as usize
            };
            let new_ptr = self.alloc(pool, new_size)?;
            self.copy_payload(new_ptr, ptr, old_payload.min(new_size));
            self.free(pool, ptr)?;
            return Ok(new_ptr);
        }

        let off = ptr.as_u32() - KHEAP_VIRT_BASE - HEADER_SIZE as u32;
        let mut h = match self.validate_block(off) {
            Ok(h) => h,
            Err(e) => {
                self.corruption_count += 1;
                return Err(e);
            }
        };
        if h.is_free() {
            self.double_free_count += 1;
            return Err(MmError::DoubleFree);
        }

        let want = align_up(new_size.max(HEAP_MIN_PAYLOAD), HEAP_GRANULARITY) as u32;

        // Encolhimento in place
        if want <= h.size {
            if h.size as usize >= want as usize + META_SIZE + HEAP_MIN_PAYLOAD {
                let shed = h.size - want;
                self.split_block(off, &mut h, want)?;
                self.write_header(off, &h)?;
                self.write_footer(off, &h)?;
                self.used_bytes -= shed as usize;
                self.free_bytes += (shed as usize) - META_SIZE;
            }
            return Ok(ptr);
        }

        // Absorver o vizinho seguinte livre
        if h.next_phys != NULL_OFF {
            if let Ok(n) = self.validate_block(h.next_phys) {
                if n.is_free() && h.size + META_SIZE as u32 + n.size >= want {
                    let old_size = h.size;
                    self.unlink(h.next_phys, &n)?;
                    let gained = META_SIZE as u32 + n.size;
                    h.size += gained;
                    h.next_phys = n.next_phys;
                    if n.next_phys != NULL_OFF {
                        let mut nn = self.read_header(n.next_phys)?;
                        nn.prev_phys = off;
                        self.write_header(n.next_phys, &nn)?;
                    }
                    self.free_bytes -= n.size as usize;
                    self.used_bytes += gained as usize;

                    // Sobra absorvida demais? Devolve como bloco livre
                    if h.size as usize >= want as usize + META_SIZE + HEAP_MIN_PAYLOAD {
                        let shed = h.size - want;
                        self.split_block(off, &mut h, want)?;
                        self.used_bytes -= shed as usize;
                        self.free_bytes += (shed as usize) - META_SIZE;
                    }
                    self.write_header(off, &h)?;
                    self.write_footer(off, &h)?;

                    // A área ganha carrega metadados velhos: entrega zerada
                    let grown = (h.size - old_size) as usize;
                    if let Some(p) = self.off_to_ptr(
                        off + HEADER_SIZE as u32 + old_size,
                        grown,
                    ) {
                        unsafe { core::ptr::write_bytes(p, 0, grown) };
                    }
                    return Ok(ptr);
                }
            }
        }

        // Sem espaço adjacente: aloca-copia-libera
        let old_size = h.size as usize;
        let new_ptr = self.alloc(pool, new_size)?;
        self.copy_payload(new_ptr, ptr, old_size.min(new_size));
        self.free(pool, ptr)?;
        Ok(new_ptr)
    }

    /// Copia payload entre endereços do heap (extents ou janela grande),
    /// respeitando bordas de página na janela grande.
    fn copy_payload(&self, dst: VirtAddr, src: VirtAddr, len: usize) {
        let mut copied = 0usize;
        while copied < len {
            let s = src.as_u32() + copied as u32;
            let d = dst.as_u32() + copied as u32;
            let chunk = (len - copied)
                .min(PAGE_SIZE - (s as usize % PAGE_SIZE))
                .min(PAGE_SIZE - (d as usize % PAGE_SIZE));
            let (Some(sp), Some(dp)) = (self.mem_ptr(s, chunk), self.mem_ptr(d, chunk)) else {
                crate::kerror!("(Heap) copy_payload: trecho inacessível");
                return;
            };
            unsafe { core::ptr::copy_nonoverlapping(sp, dp, chunk) };
            copied += chunk;
        }
    }

    /// Ponteiro para `len` bytes contíguos em `virt` (heap ou janela
    /// grande). `None` fora das janelas ou sem mapeamento.
    fn mem_ptr(&self, virt: u32, len: usize) -> Option<*mut u8> {
        if virt >= KHEAP_VIRT_BASE && virt < KHEAP_VIRT_BASE + self.cursor {
            return self.off_to_ptr(virt - KHEAP_VIRT_BASE, len);
        }
        if large::is_large_ptr(VirtAddr::new(virt)) {
            let page = VirtAddr::new(virt).align_down();
            if virt as usize + len > page.as_usize() + PAGE_SIZE {
                return None;
            }
            let phys = self.mapper.translate(self.kernel_root, page)?;
            let base = self.mapper.hal().frame_ptr(phys.frame_index());
            return Some(unsafe { base.add(virt as usize - page.as_usize()) });
        }
        None
    }

    // -------------------------------------------------------------------------
    // Diagnóstico
    // -------------------------------------------------------------------------

    /// Percorre TODOS os blocos validando header/footer. Retorna o número
    /// de inconsistências (0 em um heap saudável).
    pub fn check_integrity(&self) -> usize {
        let mut errors = 0usize;
        for e in self.extents.iter().take(self.extent_count).flatten() {
            let end = e.virt_off + e.len;
            let mut off = e.virt_off;
            while off < end {
                match self.validate_block(off) {
                    Ok(h) => {
                        off += META_SIZE as u32 + h.size;
                    }
                    Err(_) => {
                        errors += 1;
                        // Sem tamanho confiável não há como continuar o walk
                        break;
                    }
                }
            }
            if off != end && errors == 0 {
                errors += 1;
            }
        }
        errors
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Total de operações recusadas por corrupção ou double free
    pub fn error_count(&self) -> u64 {
        self.corruption_count + self.double_free_count
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes,
            used_bytes: self.used_bytes,
            large_bytes: self.large.live_bytes,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            corruption_count: self.corruption_count,
            double_free_count: self.double_free_count,
            extent_count: self.extent_count,
        }
    }

    /// Despeja as estatísticas no log
    pub fn dump_stats(&self) {
        let s = self.stats();
        crate::kinfo!(
            "(Heap) {} KiB total, {} livres, {} em uso, {} em alocações grandes",
            s.total_bytes / 1024,
            s.free_bytes / 1024,
            s.used_bytes / 1024,
            s.large_bytes / 1024
        );
        crate::kinfo!(
            "(Heap) {} allocs, {} frees, {} corrupções, {} double frees, {} extents",
            s.alloc_count,
            s.free_count,
            s.corruption_count,
            s.double_free_count,
            s.extent_count
        );
    }
}

// =============================================================================
// TESTES
// =============================================================================
