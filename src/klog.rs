//! Sistema de logging do kernel
//!
//! O core de memória não conhece drivers: a saída é feita através de um
//! *sink* registrado pelo kernel hospedeiro em `set_sink`. Antes do
//! registro, todo log é descartado em silêncio (early-boot).
//!
//! Os níveis são filtrados em tempo de COMPILAÇÃO pelas features
//! `no_logs` / `log_error` / `log_info` / `log_debug` / `log_trace`:
//! um nível desativado custa zero bytes no binário.

use core::fmt;

/// Nível de log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    /// Prefixo textual do nível
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Trace => "[TRACE] ",
            LogLevel::Debug => "[DEBUG] ",
            LogLevel::Info => "[INFO]  ",
            LogLevel::Warn => "[WARN]  ",
            LogLevel::Error => "[ERROR] ",
        }
    }
}

/// Função de saída registrada pelo kernel hospedeiro
pub type LogSink = fn(LogLevel, &fmt::Arguments<'_>);

static SINK: spin::Once<LogSink> = spin::Once::new();

/// Registra o sink de log. Chamadas subsequentes são ignoradas.
pub fn set_sink(sink: LogSink) {
    SINK.call_once(|| sink);
}

/// Emite uma linha de log através do sink registrado
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        sink(level, &args);
    }
}

// Macros de conveniência
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        #[cfg(not(feature = "no_logs"))]
        $crate::klog::log($crate::klog::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        #[cfg(not(feature = "no_logs"))]
        $crate::klog::log($crate::klog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        #[cfg(any(feature = "log_info", feature = "log_debug", feature = "log_trace"))]
        $crate::klog::log($crate::klog::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        #[cfg(any(feature = "log_debug", feature = "log_trace"))]
        $crate::klog::log($crate::klog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log_trace")]
        $crate::klog::log($crate::klog::LogLevel::Trace, format_args!($($arg)*));
    }};
}
