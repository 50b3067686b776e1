//! Error types returned by filter operations.

use thiserror::Error;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, CqfError>;

/// Failure modes for [`crate::filter::CountingQuotientFilter`] operations.
#[derive(Error, Debug)]
pub enum CqfError {
    /// Insertion was refused because the filter is full and `auto_resize` is
    /// disabled.
    #[error("insertion refused: filter is at capacity")]
    NoSpace,

    /// A `remove`/`replace` targeted a `(key, value)` pair that is not
    /// present, or asked to remove more than the current count.
    #[error("key/value pair not found")]
    NotFound,

    /// `nslots`, `key_bits`, or `value_bits` failed validation at
    /// construction time.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A caller-provided buffer was smaller than the filter needs; the
    /// number of bytes actually required is carried in `needed`.
    #[error("buffer too small: {needed} bytes required")]
    BufferTooSmall {
        /// The number of bytes the caller must provide.
        needed: u64,
    },

    /// A read or write against the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header of a file opened via [`crate::persist::usefile`] did not
    /// match the expected magic, version, or layout.
    #[error("corrupted file: {0}")]
    Corruption(String),
}
