//! # ASLR - Address Space Layout Randomization
//!
//! Mantém um PRNG global e produz offsets aleatórios LIMITADOS por
//! categoria de região. O VMM consulta este módulo ao montar o layout de
//! um processo novo; o loader de ELF consulta via facade.
//!
//! ## ⚠️ Qualidade da entropia (leia antes de confiar)
//!
//! O PRNG é um xorshift64 simples, semeado UMA vez no boot com o XOR de
//! fontes fracas: contador de ciclos, ticks de uptime, um endereço de
//! código, um endereço de stack e o timestamp da última interrupção.
//! Isso é best-effort contra exploits oportunistas - NÃO é resistente a
//! um atacante que consiga ler /proc ou medir tempo com precisão.
//! Upgrade futuro óbvio: RDRAND quando disponível.
//!
//! O estado do PRNG fica atrás de um `spin::Mutex` porque criação de
//! processos pode rodar concorrente em múltiplos cores.

use crate::addr::VirtAddr;
use crate::boot::AslrBootConfig;
use crate::config::{
    ASLR_EXEC_MAX_PAGES, ASLR_HEAP_MAX_PAGES, ASLR_LIB_MAX_PAGES, ASLR_MAX_ENTROPY_BITS,
    ASLR_MIN_ENTROPY_BITS, ASLR_MMAP_MAX_PAGES, ASLR_STACK_MAX_PAGES, ASLR_VDSO_MAX_PAGES,
    PAGE_SIZE,
};
use crate::hal::Hal;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Categorias de região randomizáveis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AslrRegionKind {
    Stack,
    Heap,
    Mmap,
    Exec,
    Lib,
    Vdso,
}

bitflags! {
    /// Máscara de categorias sujeitas a randomização
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AslrKindMask: u8 {
        const STACK = 1 << 0;
        const HEAP  = 1 << 1;
        const MMAP  = 1 << 2;
        const EXEC  = 1 << 3;
        const LIB   = 1 << 4;
        const VDSO  = 1 << 5;
    }
}

impl AslrRegionKind {
    fn mask_bit(&self) -> AslrKindMask {
        match self {
            Self::Stack => AslrKindMask::STACK,
            Self::Heap => AslrKindMask::HEAP,
            Self::Mmap => AslrKindMask::MMAP,
            Self::Exec => AslrKindMask::EXEC,
            Self::Lib => AslrKindMask::LIB,
            Self::Vdso => AslrKindMask::VDSO,
        }
    }

    /// Janela máxima da categoria, em páginas.
    ///
    /// Stack/heap/exec/lib/vdso: janelas pequenas (loaders sensíveis a
    /// alinhamento); mmap: a janela grande.
    pub fn max_pages(&self) -> u32 {
        match self {
            Self::Stack => ASLR_STACK_MAX_PAGES,
            Self::Heap => ASLR_HEAP_MAX_PAGES,
            Self::Mmap => ASLR_MMAP_MAX_PAGES,
            Self::Exec => ASLR_EXEC_MAX_PAGES,
            Self::Lib => ASLR_LIB_MAX_PAGES,
            Self::Vdso => ASLR_VDSO_MAX_PAGES,
        }
    }
}

/// Stream cipher mínimo (xorshift64)
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Configuração global de ASLR (uma por kernel)
pub struct AslrConfig {
    enabled: AtomicBool,
    entropy_bits: AtomicU8,
    kinds: AtomicU8,
    rng: spin::Mutex<XorShift64>,
}

impl AslrConfig {
    /// Inicializa a partir da configuração de boot, semeando o PRNG.
    pub fn init(hal: &dyn Hal, cfg: AslrBootConfig) -> Self {
        let stack_probe = 0u8;
        let mut seed = hal.cycle_counter()
            ^ hal.uptime_ticks().rotate_left(17)
            ^ hal.last_interrupt_ticks().rotate_left(31)
            ^ (Self::init as usize as u64).rotate_left(7)
            ^ (&stack_probe as *const u8 as usize as u64).rotate_left(43);
        if seed == 0 {
            seed = 0x9E37_79B9_7F4A_7C15;
        }

        let bits = cfg
            .entropy_bits
            .clamp(ASLR_MIN_ENTROPY_BITS, ASLR_MAX_ENTROPY_BITS);

        crate::kinfo!(
            "(ASLR) {} ({} bits, mask {:#04x})",
            if cfg.enabled { "habilitado" } else { "desabilitado" },
            bits,
            cfg.kinds.bits()
        );

        Self {
            enabled: AtomicBool::new(cfg.enabled),
            entropy_bits: AtomicU8::new(bits),
            kinds: AtomicU8::new(cfg.kinds.bits()),
            rng: spin::Mutex::new(XorShift64::new(seed)),
        }
    }

    // -------------------------------------------------------------------------
    // Mutadores explícitos
    // -------------------------------------------------------------------------

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_entropy_bits(&self, bits: u8) {
        self.entropy_bits.store(
            bits.clamp(ASLR_MIN_ENTROPY_BITS, ASLR_MAX_ENTROPY_BITS),
            Ordering::Relaxed,
        );
    }

    pub fn entropy_bits(&self) -> u8 {
        self.entropy_bits.load(Ordering::Relaxed)
    }

    pub fn kinds(&self) -> AslrKindMask {
        AslrKindMask::from_bits_truncate(self.kinds.load(Ordering::Relaxed))
    }

    // -------------------------------------------------------------------------
    // Consulta (read-only para quem monta layouts)
    // -------------------------------------------------------------------------

    /// Offset aleatório em bytes para a categoria, sempre múltiplo de
    /// página e dentro de `[0, max_pages * PAGE_SIZE)`. Zero quando ASLR
    /// está desabilitado ou a categoria está fora da máscara.
    pub fn random_offset(&self, kind: AslrRegionKind) -> u32 {
        if !self.is_enabled() || !self.kinds().contains(kind.mask_bit()) {
            return 0;
        }

        let raw = self.rng.lock().next();
        let bits = self.entropy_bits() as u32;
        let masked = raw & ((1u64 << bits) - 1);
        let pages = (masked % kind.max_pages() as u64) as u32;
        pages * PAGE_SIZE as u32
    }

    /// Aplica o offset à base: stacks crescem para baixo, então o offset
    /// é SUBTRAÍDO; todas as outras categorias somam.
    pub fn randomize_address(&self, base: VirtAddr, kind: AslrRegionKind) -> VirtAddr {
        let off = self.random_offset(kind);
        match kind {
            AslrRegionKind::Stack => VirtAddr::new(base.as_u32().saturating_sub(off)),
            _ => base.saturating_add(off),
        }
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;

    const ALL_KINDS: [AslrRegionKind; 6] = [
        AslrRegionKind::Stack,
        AslrRegionKind::Heap,
        AslrRegionKind::Mmap,
        AslrRegionKind::Exec,
        AslrRegionKind::Lib,
        AslrRegionKind::Vdso,
    ];

    #[test]
    fn test_offsets_bounded_and_page_aligned() {
        let hal = MockHal::leak(1);
        let aslr = AslrConfig::init(hal, AslrBootConfig::default());

        for kind in ALL_KINDS {
            let limit = kind.max_pages() * PAGE_SIZE as u32;
            for _ in 0..256 {
                let off = aslr.random_offset(kind);
                assert!(off < limit, "{:?}: offset {} >= {}", kind, off, limit);
                assert_eq!(off % PAGE_SIZE as u32, 0);
            }
        }
    }

    #[test]
    fn test_disabled_yields_zero() {
        let hal = MockHal::leak(1);
        let aslr = AslrConfig::init(
            hal,
            AslrBootConfig {
                enabled: false,
                ..AslrBootConfig::default()
            },
        );
        for kind in ALL_KINDS {
            assert_eq!(aslr.random_offset(kind), 0);
        }
    }

    #[test]
    fn test_masked_out_kind_yields_zero() {
        let hal = MockHal::leak(1);
        let aslr = AslrConfig::init(
            hal,
            AslrBootConfig {
                enabled: true,
                entropy_bits: 16,
                kinds: AslrKindMask::HEAP,
            },
        );
        assert_eq!(aslr.random_offset(AslrRegionKind::Stack), 0);
        // Heap segue randomizável (estatisticamente não-zero em 64 draws)
        let any = (0..64).any(|_| aslr.random_offset(AslrRegionKind::Heap) != 0);
        assert!(any);
    }

    #[test]
    fn test_stack_offset_is_subtracted() {
        let hal = MockHal::leak(1);
        let aslr = AslrConfig::init(hal, AslrBootConfig::default());
        let base = VirtAddr::new(0xBF80_0000);

        let addr = aslr.randomize_address(base, AslrRegionKind::Stack);
        assert!(addr <= base);
        let addr = aslr.randomize_address(VirtAddr::new(0x1000_0000), AslrRegionKind::Heap);
        assert!(addr >= VirtAddr::new(0x1000_0000));
    }

    #[test]
    fn test_entropy_bits_clamped() {
        let hal = MockHal::leak(1);
        let aslr = AslrConfig::init(hal, AslrBootConfig::default());
        aslr.set_entropy_bits(40);
        assert_eq!(aslr.entropy_bits(), 24);
        aslr.set_entropy_bits(1);
        assert_eq!(aslr.entropy_bits(), 8);
    }
}
