#![cfg(test)]
//! Copy-on-write de ponta a ponta: dois "processos", uma página, escritas
//! independentes depois do fork.

use super::{read_phys_u32, setup_manager, write_phys_u32};
use crate::addr::VirtAddr;
use crate::aspace::fault::{AccessType, FaultResult, PageFaultInfo};
use crate::aspace::region::{RegionKind, RegionPerms};
use crate::config::PAGE_SIZE;

fn write_fault_at(addr: VirtAddr) -> PageFaultInfo {
    PageFaultInfo {
        addr,
        ip: VirtAddr::new(0x0804_8000),
        access: AccessType::Write,
        user_mode: true,
        present: true,
    }
}

#[test]
fn test_cow_isolation_after_clone() {
    let (hal, mgr) = setup_manager(512);
    let rw = RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER;

    mgr.create_process_space(1).unwrap();
    let buf = mgr.alloc(1, PAGE_SIZE, rw, RegionKind::Shared, "buf").unwrap();
    mgr.map_range(1, buf, PAGE_SIZE, rw).unwrap();

    // Valor inicial visível antes do fork
    let phys0 = mgr.translate(1, buf).unwrap().unwrap();
    write_phys_u32(hal, phys0, 0xBA5E_0001);

    // Fork com COW: mesma moldura nos dois espaços, ambos read-only
    mgr.clone_process_space(1, 2, true).unwrap();
    let p1 = mgr.translate(1, buf).unwrap().unwrap();
    let p2 = mgr.translate(2, buf).unwrap().unwrap();
    assert_eq!(p1, p2);

    // Escrita no pai: fault COW resolve com cópia privada
    assert_eq!(
        mgr.handle_page_fault(1, &write_fault_at(buf)),
        FaultResult::Resolved
    );
    let p1 = mgr.translate(1, buf).unwrap().unwrap();
    write_phys_u32(hal, p1, 0xAAAA_AAAA);

    // Escrita no filho: última referência, write-enable in place
    assert_eq!(
        mgr.handle_page_fault(2, &write_fault_at(buf)),
        FaultResult::Resolved
    );
    let p2 = mgr.translate(2, buf).unwrap().unwrap();
    write_phys_u32(hal, p2, 0x5555_5555);

    // Cada espaço enxerga SÓ o próprio valor
    assert_ne!(p1, p2);
    assert_eq!(read_phys_u32(hal, mgr.translate(1, buf).unwrap().unwrap()), 0xAAAA_AAAA);
    assert_eq!(read_phys_u32(hal, mgr.translate(2, buf).unwrap().unwrap()), 0x5555_5555);
}

#[test]
fn test_cow_copy_preserves_contents() {
    let (hal, mgr) = setup_manager(512);
    let rw = RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER;

    mgr.create_process_space(1).unwrap();
    let buf = mgr.alloc(1, PAGE_SIZE, rw, RegionKind::Shared, "buf").unwrap();
    mgr.map_range(1, buf, PAGE_SIZE, rw).unwrap();
    write_phys_u32(hal, mgr.translate(1, buf).unwrap().unwrap(), 0x0123_4567);

    mgr.clone_process_space(1, 2, true).unwrap();

    // A cópia privada do pai herda o conteúdo pré-fork
    assert_eq!(
        mgr.handle_page_fault(1, &write_fault_at(buf)),
        FaultResult::Resolved
    );
    let p1 = mgr.translate(1, buf).unwrap().unwrap();
    assert_eq!(read_phys_u32(hal, p1), 0x0123_4567);

    // E o filho continua lendo o original intocado
    let p2 = mgr.translate(2, buf).unwrap().unwrap();
    assert_eq!(read_phys_u32(hal, p2), 0x0123_4567);
    assert_ne!(p1, p2);
}

#[test]
fn test_deep_clone_duplicates_frames() {
    let (hal, mgr) = setup_manager(512);
    let rw = RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER;

    mgr.create_process_space(1).unwrap();
    let buf = mgr.alloc(1, PAGE_SIZE, rw, RegionKind::Shared, "buf").unwrap();
    mgr.map_range(1, buf, PAGE_SIZE, rw).unwrap();
    write_phys_u32(hal, mgr.translate(1, buf).unwrap().unwrap(), 0xFEED_C0DE);

    // Clone SEM COW: frames duplicados na hora, nenhum fault necessário
    mgr.clone_process_space(1, 2, false).unwrap();
    let p1 = mgr.translate(1, buf).unwrap().unwrap();
    let p2 = mgr.translate(2, buf).unwrap().unwrap();
    assert_ne!(p1, p2);
    assert_eq!(read_phys_u32(hal, p2), 0xFEED_C0DE);
}
