#![cfg(test)]
//! Cenário de ponta a ponta do heap: pool de 256 frames (1 MiB), heap
//! inicial de 16 frames, 100 objetos, frees intercalados, merge.

use super::setup_manager;
use crate::config::PAGE_SIZE;

#[test]
fn test_heap_lifecycle_end_to_end() {
    // 256 frames = 1 MiB de "RAM"; o heap nasce com 16 frames
    let (_hal, mgr) = setup_manager(256);

    // 100 objetos de 64 bytes
    let mut ptrs = Vec::with_capacity(100);
    for _ in 0..100 {
        ptrs.push(mgr.kmalloc(64).unwrap());
    }
    let total_after_allocs = mgr.heap_dump_stats().total_bytes;

    // Libera um sim, um não
    for p in ptrs.iter().step_by(2) {
        mgr.kfree(*p).unwrap();
    }

    // Heap permanece íntegro e sem erros registrados
    assert_eq!(mgr.heap_check_integrity(), 0);
    assert_eq!(mgr.heap_dump_stats().corruption_count, 0);

    // Libera o vizinho do primeiro: blocos 0,1,2 fundem em um só
    mgr.kfree(ptrs[1]).unwrap();

    // Um pedido que só cabe no bloco fundido - e SEM crescer o heap
    let merged = mgr.kmalloc(200).unwrap();
    assert_eq!(merged, ptrs[0]);
    assert_eq!(mgr.heap_dump_stats().total_bytes, total_after_allocs);
    assert_eq!(mgr.heap_check_integrity(), 0);
}

#[test]
fn test_frame_accounting_through_heap_growth() {
    let (_hal, mgr) = setup_manager(256);
    let free0 = mgr.free_pages_count();

    // Força crescimento: mais do que o extent inicial comporta
    let mut ptrs = Vec::new();
    for _ in 0..40 {
        ptrs.push(mgr.kmalloc(2048).unwrap());
    }
    assert!(mgr.free_pages_count() < free0);
    assert_eq!(mgr.heap_check_integrity(), 0);

    for p in ptrs {
        mgr.kfree(p).unwrap();
    }
    // Os extents ficam com o heap (não há shrink), mas nada vazou nem
    // corrompeu; o espaço todo volta aos bins
    assert_eq!(mgr.heap_check_integrity(), 0);
    let stats = mgr.heap_dump_stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.corruption_count + stats.double_free_count, 0);
}

#[test]
fn test_large_alloc_roundtrip_returns_frames() {
    let (_hal, mgr) = setup_manager(256);
    let free0 = mgr.free_pages_count();

    let p = mgr.kmalloc(3 * PAGE_SIZE).unwrap();
    assert!(mgr.free_pages_count() < free0);

    mgr.kfree(p).unwrap();
    assert_eq!(mgr.free_pages_count(), free0);
}

#[test]
fn test_layouts_are_isolated_per_process() {
    let (_hal, mgr) = setup_manager(512);

    mgr.create_process_space(1).unwrap();
    mgr.create_process_space(2).unwrap();

    // Cada processo tem as cinco regiões default e nada vazou entre eles
    assert_eq!(mgr.dump_regions(1).unwrap(), 5);
    assert_eq!(mgr.dump_regions(2).unwrap(), 5);

    mgr.destroy_process_space(1).unwrap();
    assert!(mgr.dump_regions(1).is_err());
    assert_eq!(mgr.dump_regions(2).unwrap(), 5);
}
