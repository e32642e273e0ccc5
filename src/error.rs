use std::io;

/// The error taxonomy surfaced by every fallible `Store` operation.
///
/// `NotFound` and `Duplicate` are deliberately absent: those outcomes are carried by
/// the `bool`/`Option` return values of `insert`/`find`/`erase`/`update`, not raised
/// as errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("data allocator has no free block large enough for {requested} bytes")]
    OutOfSpace { requested: usize },

    #[error("on-disk structure is corrupt: {0}")]
    Corrupt(String),

    #[error("store is not initialised")]
    NotInitialised,
}

pub type Result<T> = std::result::Result<T, Error>;
