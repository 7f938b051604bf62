//! VMM - Gerenciador de Page Tables (2 níveis)
//! ===========================================
//!
//! Visão geral
//! -----------
//! Este módulo manipula a estrutura de tradução de 2 níveis por address
//! space: um diretório de 1024 entradas, cada uma apontando (ou não) para
//! uma tabela de 1024 entradas, cada uma apontando (ou não) para um frame
//! de 4 KiB.
//!
//! Endereço virtual (32 bits):
//!
//! ```text
//! ┌────────────────┬────────────────┬────────────┐
//! │ Diretório      │ Tabela         │  Offset    │
//! │ (10 bits)      │ (10 bits)      │ (12 bits)  │
//! └────────────────┴────────────────┴────────────┘
//!      bits 31-22       21-12           11-0
//! ```
//!
//! Responsabilidades:
//! - criar mapeamentos Virtual → Físico (tabelas intermediárias sob
//!   demanda, via PMM);
//! - desfazer mapeamentos decrementando o refcount do frame alvo;
//! - criar/clonar (com COW)/destruir diretórios de processo;
//! - invalidar EXATAMENTE a entrada de TLB afetada por cada mutação
//!   (troca de diretório recarrega CR3 e dispensa flush explícito).
//!
//! CONTRATOS E INVARIANTES (NÃO QUEBRE)
//! ------------------------------------
//! 1. Uma entrada só fica PRESENT se o refcount do frame alvo é ≥ 1.
//! 2. Os slots do kernel (768..1024) de todo diretório são cópias
//!    literais dos slots do diretório do kernel; nunca são liberados na
//!    destruição de um processo.
//! 3. Toda tabela recém-alocada é zerada ANTES de ser publicada no
//!    diretório.

pub mod mapper;
pub mod table;

pub use mapper::{Mapper, MapperPolicy};
pub use table::{PageTableEntry, PteFlags};
