#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Concrete copy formats for the tern engine.
//!
//! Each format implements the [`tern_interfaces::CopyFormat`] contract:
//! `prepare` does the sink-specific encoding off the write path, and
//! `flush` appends the encoded artifact to the output file.

mod csv;
mod parquet;

pub use crate::csv::*;
pub use crate::parquet::*;
