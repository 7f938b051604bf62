//! Caminho de alocações grandes (≥ 1 página)
//!
//! Pedidos de uma página para cima não passam pelos bins: recebem frames
//! inteiros mapeados em uma janela virtual própria, com UMA guard page
//! não mapeada imediatamente antes e outra imediatamente depois do
//! payload. Escrita em qualquer das duas guarda vira page fault na hora,
//! não corrupção silenciosa.
//!
//! O número de páginas da alocação fica gravado no começo da primeira
//! página, logo antes do ponteiro de usuário - `free`/`realloc` recuperam
//! o tamanho dali, sem tabela de lookup paralela.
//!
//! A janela virtual é bump-allocated e não é reciclada (os FRAMES voltam
//! ao pool no free; os endereços virtuais não são reusados). Com 64 MiB
//! de janela isso comporta a vida útil esperada do kernel; se um dia
//! transbordar, `OutOfMemory` aparece aqui primeiro.

use crate::addr::{PhysAddr, VirtAddr};
use crate::config::{pages_for, KLARGE_MAX_SIZE, KLARGE_VIRT_BASE, PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::pmm::frame::FrameFlags;
use crate::pmm::FramePool;
use crate::vmm::{Mapper, PteFlags};
use crate::PID_KERNEL;

const LARGE_MAGIC: u32 = 0x1A26_F00D;
/// Bytes reservados no início da primeira página (contagem + magic + pad)
pub const LARGE_HEADER: usize = 16;

/// Estado do caminho de alocações grandes
pub struct LargeState {
    /// Offset do próximo slot na janela (relativo a KLARGE_VIRT_BASE)
    next_off: u32,
    /// Bytes atualmente mapeados por alocações vivas
    pub live_bytes: usize,
}

impl LargeState {
    pub const fn new() -> Self {
        Self {
            next_off: 0,
            live_bytes: 0,
        }
    }
}

/// O endereço pertence à janela de alocações grandes?
pub fn is_large_ptr(ptr: VirtAddr) -> bool {
    ptr.as_u32() >= KLARGE_VIRT_BASE
        && ptr.as_u32() < KLARGE_VIRT_BASE.saturating_add(KLARGE_MAX_SIZE)
}

/// Aloca `size` bytes com guard pages. Retorna o ponteiro de usuário
/// (base da primeira página + LARGE_HEADER).
pub fn alloc_large(
    mapper: &Mapper,
    kernel_root: PhysAddr,
    state: &mut LargeState,
    pool: &mut FramePool,
    size: usize,
) -> MmResult<VirtAddr> {
    let pages = pages_for(size + LARGE_HEADER);
    let window = ((pages + 2) * PAGE_SIZE) as u32;

    if state.next_off.saturating_add(window) > KLARGE_MAX_SIZE {
        crate::kwarn!("(Heap) janela de alocações grandes exausta");
        return Err(MmError::OutOfMemory);
    }

    // Slot: [guard][payload pages][guard]
    let guard_lo = KLARGE_VIRT_BASE + state.next_off;
    let base = VirtAddr::new(guard_lo + PAGE_SIZE as u32);

    for i in 0..pages {
        let frame = match pool.allocate_frame(PID_KERNEL, FrameFlags::KERNEL) {
            Some(f) => f,
            None => {
                rollback(mapper, pool, kernel_root, base, i);
                return Err(MmError::OutOfMemory);
            }
        };
        pool.zero_frame(frame);
        let virt = VirtAddr::new(base.as_u32() + (i * PAGE_SIZE) as u32);
        if let Err(e) = mapper.map(
            pool,
            kernel_root,
            virt,
            PhysAddr::from_frame(frame),
            PteFlags::WRITABLE | PteFlags::GLOBAL,
        ) {
            let _ = pool.free_frame(frame);
            rollback(mapper, pool, kernel_root, base, i);
            return Err(e);
        }
    }

    // Header in-band na primeira página
    let first_frame = mapper
        .translate(kernel_root, base)
        .ok_or(MmError::NotMapped)?
        .frame_index();
    let hal = mapper.hal();
    unsafe {
        let p = hal.frame_ptr(first_frame) as *mut u32;
        p.write(pages as u32);
        p.add(1).write(LARGE_MAGIC);
    }

    state.next_off += window;
    state.live_bytes += pages * PAGE_SIZE;

    crate::ktrace!("(Heap) large alloc: {} páginas em {:?}", pages, base);
    Ok(VirtAddr::new(base.as_u32() + LARGE_HEADER as u32))
}

fn rollback(mapper: &Mapper, pool: &mut FramePool, root: PhysAddr, base: VirtAddr, mapped: usize) {
    for j in 0..mapped {
        let v = VirtAddr::new(base.as_u32() + (j * PAGE_SIZE) as u32);
        let _ = mapper.unmap(pool, root, v);
    }
}

/// Libera uma alocação grande, devolvendo os frames ao pool.
///
/// Valida magic e alinhamento antes de tocar em qualquer coisa; um slot
/// já desfeito aparece como página ausente e vira `DoubleFree`.
pub fn free_large(
    mapper: &Mapper,
    kernel_root: PhysAddr,
    state: &mut LargeState,
    pool: &mut FramePool,
    ptr: VirtAddr,
) -> MmResult<()> {
    if ptr.page_offset() != LARGE_HEADER {
        return Err(MmError::Corruption);
    }
    let base = ptr.align_down();

    let first = match mapper.translate(kernel_root, base) {
        Some(p) => p.frame_index(),
        None => return Err(MmError::DoubleFree),
    };

    let hal = mapper.hal();
    let (pages, magic) = unsafe {
        let p = hal.frame_ptr(first) as *const u32;
        (p.read() as usize, p.add(1).read())
    };
    if magic != LARGE_MAGIC || pages == 0 || pages > KLARGE_MAX_SIZE as usize / PAGE_SIZE {
        return Err(MmError::Corruption);
    }

    for i in 0..pages {
        let v = VirtAddr::new(base.as_u32() + (i * PAGE_SIZE) as u32);
        if let Err(e) = mapper.unmap(pool, kernel_root, v) {
            crate::kerror!("(Heap) large free: unmap {:?} falhou: {}", v, e.as_str());
        }
    }
    state.live_bytes = state.live_bytes.saturating_sub(pages * PAGE_SIZE);
    Ok(())
}

/// Payload utilizável de uma alocação grande viva (para realloc)
pub fn large_payload_bytes(mapper: &Mapper, kernel_root: PhysAddr, ptr: VirtAddr) -> MmResult<usize> {
    if ptr.page_offset() != LARGE_HEADER {
        return Err(MmError::Corruption);
    }
    let base = ptr.align_down();
    let first = mapper
        .translate(kernel_root, base)
        .ok_or(MmError::NotMapped)?
        .frame_index();
    let hal = mapper.hal();
    let (pages, magic) = unsafe {
        let p = hal.frame_ptr(first) as *const u32;
        (p.read() as usize, p.add(1).read())
    };
    if magic != LARGE_MAGIC {
        return Err(MmError::Corruption);
    }
    Ok(pages * PAGE_SIZE - LARGE_HEADER)
}
