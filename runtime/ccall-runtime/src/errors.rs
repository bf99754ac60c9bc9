///
/// Interop error types.
///
/// Every failure the interop layer can surface: library and symbol
/// resolution, executable memory exhaustion, type instantiation during
/// trampoline specialization, and configuration loading.
///

use thiserror::Error;

/// Boxed error produced by host collaborators (type system callbacks,
/// deferred library loaders). Passed through without modification.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum InteropError {
    #[error("could not load library \"{name}\": {reason}")]
    LibraryNotFound { name: String, reason: String },

    #[error("could not load symbol \"{symbol}\" from {library}")]
    SymbolNotFound { symbol: String, library: String },

    #[error("out of memory: failed to map {requested} bytes of executable memory: {reason}")]
    OutOfMemory { requested: usize, reason: String },

    #[error(transparent)]
    Instantiation(BoxError),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl InteropError {
    pub fn is_library_not_found(&self) -> bool {
        matches!(self, InteropError::LibraryNotFound { .. })
    }

    pub fn is_symbol_not_found(&self) -> bool {
        matches!(self, InteropError::SymbolNotFound { .. })
    }
}
