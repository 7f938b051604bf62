//! Layout default de processo
//!
//! O ponto de composição entre VMM e ASLR: cinco regiões registradas na
//! criação de todo processo. Código fica FIXO (loaders dependem da base);
//! heap, área de mmap e bibliotecas somam seus offsets; a stack cresce
//! para baixo e o offset é subtraído do topo.

use crate::addr::VirtAddr;
use crate::aslr::{AslrConfig, AslrRegionKind};
use crate::config::{
    USER_CODE_BASE, USER_CODE_SIZE, USER_HEAP_BASE, USER_HEAP_SIZE, USER_LIB_BASE, USER_LIB_SIZE,
    USER_MMAP_BASE, USER_MMAP_SIZE, USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::error::MmResult;

use super::region::{Region, RegionFlags, RegionKind, RegionPerms};
use super::AddressSpace;

/// Registra o layout default: code / heap / mmap / lib / stack.
///
/// Nenhuma página é materializada aqui - todas as regiões nascem lazy e
/// são preenchidas por page fault conforme o processo toca nelas.
pub fn create_default_layout(space: &mut AddressSpace, aslr: &AslrConfig) -> MmResult<()> {
    let rw_user = RegionPerms::READ | RegionPerms::WRITE | RegionPerms::USER;
    let rx_user = RegionPerms::READ | RegionPerms::EXEC | RegionPerms::USER;

    // Código: base fixa, não randomizada
    space.insert_region(Region::new(
        VirtAddr::new(USER_CODE_BASE),
        VirtAddr::new(USER_CODE_BASE + USER_CODE_SIZE),
        RegionKind::Code,
        rx_user,
        RegionFlags::FIXED,
        "code",
    ))?;

    // Heap: randomizado, cresce para cima
    let heap_base = aslr.randomize_address(VirtAddr::new(USER_HEAP_BASE), AslrRegionKind::Heap);
    space.insert_region(Region::new(
        heap_base,
        VirtAddr::new(heap_base.as_u32() + USER_HEAP_SIZE),
        RegionKind::Heap,
        rw_user,
        RegionFlags::GROWS_UP,
        "heap",
    ))?;

    // Área de mmap/memória compartilhada: janela grande de randomização
    let mmap_base = aslr.randomize_address(VirtAddr::new(USER_MMAP_BASE), AslrRegionKind::Mmap);
    space.insert_region(Region::new(
        mmap_base,
        VirtAddr::new(mmap_base.as_u32() + USER_MMAP_SIZE),
        RegionKind::Shared,
        rw_user,
        RegionFlags::empty(),
        "mmap",
    ))?;

    // Bibliotecas dinâmicas
    let lib_base = aslr.randomize_address(VirtAddr::new(USER_LIB_BASE), AslrRegionKind::Lib);
    space.insert_region(Region::new(
        lib_base,
        VirtAddr::new(lib_base.as_u32() + USER_LIB_SIZE),
        RegionKind::Module,
        rx_user,
        RegionFlags::empty(),
        "lib",
    ))?;

    // Stack: offset SUBTRAÍDO do topo, cresce para baixo
    let stack_top = aslr.randomize_address(VirtAddr::new(USER_STACK_TOP), AslrRegionKind::Stack);
    space.insert_region(Region::new(
        VirtAddr::new(stack_top.as_u32() - USER_STACK_SIZE),
        stack_top,
        RegionKind::Stack,
        rw_user,
        RegionFlags::GROWS_DOWN,
        "stack",
    ))?;

    crate::kdebug!(
        "(Layout) pid {}: heap {:?} mmap {:?} lib {:?} stack_top {:?}",
        space.owner(),
        heap_base,
        mmap_base,
        lib_base,
        stack_top
    );
    Ok(())
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::aslr::AslrKindMask;
    use crate::boot::{AslrBootConfig, MemoryMap, MemoryRange, RangeKind};
    use crate::config::PAGE_SIZE;
    use crate::hal::mock::MockHal;
    use crate::hal::Hal;
    use crate::pmm::frame::FrameFlags;
    use crate::pmm::FramePool;
    use crate::vmm::{Mapper, MapperPolicy};
    use crate::PID_KERNEL;

    fn setup() -> (FramePool, Mapper, PhysAddr, &'static MockHal) {
        let hal = MockHal::leak(128);
        let ranges = alloc::vec![MemoryRange::new(
            PhysAddr::new(0),
            (128 * PAGE_SIZE) as u32,
            RangeKind::Usable,
        )];
        let map = MemoryMap::new(alloc::boxed::Box::leak(ranges.into_boxed_slice()));
        let mut pool = FramePool::new(hal, &map).unwrap();
        let mapper = Mapper::new(hal, MapperPolicy::from_features(hal.cpu_features()));
        let f = pool.allocate_frame(PID_KERNEL, FrameFlags::KERNEL).unwrap();
        pool.zero_frame(f);
        (pool, mapper, PhysAddr::from_frame(f), hal)
    }

    #[test]
    fn test_layout_has_five_regions() {
        let (mut pool, mapper, kroot, hal) = setup();
        let mut space = AddressSpace::new(&mapper, &mut pool, 1, kroot, false).unwrap();
        let aslr = AslrConfig::init(hal, AslrBootConfig::default());

        create_default_layout(&mut space, &aslr).unwrap();
        assert_eq!(space.region_count(), 5);

        // Código é fixo mesmo com ASLR ligado
        assert!(space.find_region(VirtAddr::new(USER_CODE_BASE)).is_some());
    }

    #[test]
    fn test_layout_deterministic_without_aslr() {
        let (mut pool, mapper, kroot, hal) = setup();
        let mut space = AddressSpace::new(&mapper, &mut pool, 1, kroot, false).unwrap();
        let aslr = AslrConfig::init(
            hal,
            AslrBootConfig {
                enabled: false,
                entropy_bits: 16,
                kinds: AslrKindMask::all(),
            },
        );

        create_default_layout(&mut space, &aslr).unwrap();
        let heap = space.find_region(VirtAddr::new(USER_HEAP_BASE)).unwrap();
        assert_eq!(heap.start, VirtAddr::new(USER_HEAP_BASE));
        let stack = space
            .find_region(VirtAddr::new(USER_STACK_TOP - 0x1000))
            .unwrap();
        assert_eq!(stack.end, VirtAddr::new(USER_STACK_TOP));
    }

    #[test]
    fn test_layout_regions_never_overlap_with_aslr() {
        // Mesmo no pior caso das janelas, as cinco regiões não colidem
        for _ in 0..16 {
            let (mut pool, mapper, kroot, hal) = setup();
            let mut space = AddressSpace::new(&mapper, &mut pool, 1, kroot, false).unwrap();
            let aslr = AslrConfig::init(hal, AslrBootConfig::default());
            create_default_layout(&mut space, &aslr).unwrap();
            assert_eq!(space.region_count(), 5);
        }
    }
}
