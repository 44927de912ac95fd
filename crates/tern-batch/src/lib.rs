#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Row chunks and append-only chunk collections.
//!
//! A [`Chunk`] is a fixed-width row group of at most [`STANDARD_VECTOR_SIZE`]
//! rows. A [`Collection`] is an ordered sequence of chunks with byte-size
//! accounting, owned exclusively by whoever holds it.

mod chunk;
mod collection;
mod error;

pub use chunk::*;
pub use collection::*;
pub use error::*;

/// Maximum number of rows in a single [`Chunk`].
///
/// Also the tolerance used when deciding whether a collection is
/// "approximately" the size of an output batch.
pub const STANDARD_VECTOR_SIZE: usize = 2048;
