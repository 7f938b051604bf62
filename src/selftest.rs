//! Testes de Memória em Runtime
//!
//! Executa verificações de integridade do subsistema no boot, com saída
//! para o log. Compilado apenas com a feature `self_test`.
//!
//! # Uso
//! Chamar `run_memory_tests(&mm)` logo após `MemoryManager::init`.

use crate::aslr::AslrRegionKind;
use crate::config::{KERNEL_BASE, PAGE_SIZE};
use crate::manager::MemoryManager;

/// Executa todos os testes de memória no boot
pub fn run_memory_tests(mm: &MemoryManager) {
    crate::kinfo!("╔════════════════════════════════════════╗");
    crate::kinfo!("║     🧪 TESTES DE MEMÓRIA               ║");
    crate::kinfo!("╚════════════════════════════════════════╝");

    test_heap_roundtrip(mm);
    test_heap_integrity(mm);
    test_translate_kernel(mm);
    test_aslr_bounds(mm);

    crate::kinfo!("╔════════════════════════════════════════╗");
    crate::kinfo!("║  ✅ TODOS OS TESTES PASSARAM!          ║");
    crate::kinfo!("╚════════════════════════════════════════╝");
}

/// Heap: alocar e liberar devolve os bytes ao pool livre
fn test_heap_roundtrip(mm: &MemoryManager) {
    crate::kinfo!("┌─ Teste Heap ────────────────────────────┐");

    let stats_before = mm.heap_dump_stats();
    let ptr = match mm.kmalloc(512) {
        Ok(p) => p,
        Err(e) => panic!("Teste Heap falhou: kmalloc: {}", e.as_str()),
    };
    if mm.kfree(ptr).is_err() {
        panic!("Teste Heap falhou: kfree");
    }
    let stats_after = mm.heap_dump_stats();

    if stats_after.free_bytes != stats_before.free_bytes {
        panic!("Teste Heap falhou: free_bytes não restaurado");
    }
    crate::kinfo!("│  ✓ Heap alloc/free OK                   │");
    crate::kinfo!("└──────────────────────────────────────────┘");
}

/// Heap: walk completo sem inconsistências
fn test_heap_integrity(mm: &MemoryManager) {
    crate::kinfo!("┌─ Teste Integridade ─────────────────────┐");
    let errors = mm.heap_check_integrity();
    if errors != 0 {
        panic!("Teste Integridade falhou: {} erros", errors);
    }
    crate::kinfo!("│  ✓ check_integrity == 0                 │");
    crate::kinfo!("└──────────────────────────────────────────┘");
}

/// VMM: a janela direta do kernel traduz
fn test_translate_kernel(mm: &MemoryManager) {
    crate::kinfo!("┌─ Teste VMM ─────────────────────────────┐");
    let virt = crate::addr::VirtAddr::new(KERNEL_BASE + PAGE_SIZE as u32);
    match mm.translate(crate::PID_KERNEL, virt) {
        Ok(Some(phys)) => {
            crate::kdebug!("(VMM) Teste: {:?} -> {:?}", virt, phys);
            crate::kinfo!("│  ✓ VMM translate (kernel) OK           │");
        }
        _ => panic!("Teste VMM falhou: janela direta não mapeada"),
    }
    crate::kinfo!("└──────────────────────────────────────────┘");
}

/// ASLR: offsets dentro da janela e alinhados a página
fn test_aslr_bounds(mm: &MemoryManager) {
    crate::kinfo!("┌─ Teste ASLR ────────────────────────────┐");
    let kinds = [
        AslrRegionKind::Stack,
        AslrRegionKind::Heap,
        AslrRegionKind::Mmap,
        AslrRegionKind::Exec,
        AslrRegionKind::Lib,
        AslrRegionKind::Vdso,
    ];
    for kind in kinds {
        let limit = kind.max_pages() * PAGE_SIZE as u32;
        for _ in 0..32 {
            let off = mm.aslr().random_offset(kind);
            if off >= limit || off % PAGE_SIZE as u32 != 0 {
                panic!("Teste ASLR falhou: offset fora da janela");
            }
        }
    }
    crate::kinfo!("│  ✓ ASLR offsets limitados OK            │");
    crate::kinfo!("└──────────────────────────────────────────┘");
}
