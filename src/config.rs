//! # Configuração do Núcleo de Memória
//!
//! Define constantes, layout virtual e parâmetros globais do subsistema.
//!
//! ⚠️ Qualquer alteração no layout virtual **DEVE** ser refletida no
//! bootloader (Kindle) e no loader de ELF. Desalinhamento aqui causa
//! falhas difíceis de diagnosticar.

// =============================================================================
// GEOMETRIA DE PÁGINA
// =============================================================================

/// Tamanho de uma página / frame (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Bits de offset dentro de uma página
pub const PAGE_SHIFT: usize = 12;

/// Entradas por tabela (diretório e tabelas de segundo nível)
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Máscara para alinhar endereços a página
pub const PAGE_MASK: u32 = !(PAGE_SIZE as u32 - 1);

// =============================================================================
// LAYOUT DE MEMÓRIA VIRTUAL (split 3G/1G)
// =============================================================================

/// Base da metade do kernel (slots 768..1024 do diretório)
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Slot do diretório onde começa o kernel
pub const KERNEL_DIR_SLOT: usize = (KERNEL_BASE as usize) >> 22;

/// Base do código de usuário (fixo, nunca randomizado)
pub const USER_CODE_BASE: u32 = 0x0804_8000;

/// Tamanho default da região de código
pub const USER_CODE_SIZE: u32 = 4 * 1024 * 1024;

/// Base do heap de usuário (antes do offset ASLR)
pub const USER_HEAP_BASE: u32 = 0x1000_0000;

/// Tamanho default da região de heap de usuário
pub const USER_HEAP_SIZE: u32 = 16 * 1024 * 1024;

/// Base da área de mmap/compartilhamento (antes do offset ASLR)
pub const USER_MMAP_BASE: u32 = 0x4000_0000;

/// Tamanho default da área de mmap
pub const USER_MMAP_SIZE: u32 = 64 * 1024 * 1024;

/// Base da área de bibliotecas (antes do offset ASLR)
pub const USER_LIB_BASE: u32 = 0x7000_0000;

/// Tamanho default da área de bibliotecas
pub const USER_LIB_SIZE: u32 = 32 * 1024 * 1024;

/// Topo da stack de usuário (antes do offset ASLR, que é SUBTRAÍDO)
pub const USER_STACK_TOP: u32 = 0xBF80_0000;

/// Tamanho default da stack de usuário
pub const USER_STACK_SIZE: u32 = 8 * 1024 * 1024;

// =============================================================================
// LAYOUT DO KERNEL (acima de KERNEL_BASE)
// =============================================================================

/// Janela de mapeamento direto da RAM física (phys 0 → KERNEL_BASE)
pub const KERNEL_DIRECT_BASE: u32 = KERNEL_BASE;

/// Limite da janela direta (256 MiB de RAM física endereçável pelo core)
pub const KERNEL_DIRECT_LIMIT: u32 = 0x1000_0000;

/// Base do heap do kernel
pub const KHEAP_VIRT_BASE: u32 = 0xD000_0000;

/// Tamanho máximo do heap do kernel (janela virtual reservada)
pub const KHEAP_MAX_SIZE: u32 = 64 * 1024 * 1024;

/// Páginas do extent inicial do heap
pub const KHEAP_INITIAL_PAGES: usize = 16;

/// Extensão mínima do heap, em páginas
pub const KHEAP_EXTEND_MIN_PAGES: usize = 4;

/// Base das alocações grandes com guard pages
pub const KLARGE_VIRT_BASE: u32 = 0xE000_0000;

/// Tamanho máximo da janela de alocações grandes
pub const KLARGE_MAX_SIZE: u32 = 64 * 1024 * 1024;

/// Base dos mapeamentos MMIO do kernel
pub const KMMIO_VIRT_BASE: u32 = 0xF000_0000;

// =============================================================================
// ASLR - JANELAS POR CATEGORIA (em páginas)
// =============================================================================
// Stack/heap/exec/lib/vdso recebem janelas pequenas (loaders sensíveis a
// alinhamento); mmap recebe a janela grande.

pub const ASLR_STACK_MAX_PAGES: u32 = 256;
pub const ASLR_HEAP_MAX_PAGES: u32 = 512;
pub const ASLR_MMAP_MAX_PAGES: u32 = 16384;
pub const ASLR_EXEC_MAX_PAGES: u32 = 16;
pub const ASLR_LIB_MAX_PAGES: u32 = 256;
pub const ASLR_VDSO_MAX_PAGES: u32 = 16;

/// Bits de entropia: mínimo aceito
pub const ASLR_MIN_ENTROPY_BITS: u8 = 8;

/// Bits de entropia: máximo aceito
pub const ASLR_MAX_ENTROPY_BITS: u8 = 24;

// =============================================================================
// CONFIGURAÇÃO DO HEAP DO KERNEL
// =============================================================================

/// Granularidade mínima de alocação (e alinhamento do payload)
pub const HEAP_GRANULARITY: usize = 16;

/// Menor payload útil de um bloco
pub const HEAP_MIN_PAYLOAD: usize = 32;

/// Número de bins segregados por tamanho
pub const HEAP_BIN_COUNT: usize = 8;

/// Limite inferior de cada bin (bin i cobre [BIN_FLOOR[i], BIN_FLOOR[i+1]))
pub const HEAP_BIN_FLOOR: [usize; HEAP_BIN_COUNT] = [32, 64, 128, 256, 512, 1024, 2048, 3072];

/// Byte de poison escrito sobre payloads liberados
pub const HEAP_POISON_BYTE: u8 = 0xDE;

// =============================================================================
// FUNÇÕES UTILITÁRIAS
// =============================================================================

/// Alinha valor para cima ao múltiplo de align
#[inline(always)]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Alinha valor para baixo ao múltiplo de align
#[inline(always)]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Verifica se valor está alinhado
#[inline(always)]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    val & (align - 1) == 0
}

/// Converte bytes em páginas, arredondando para cima
#[inline(always)]
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}
