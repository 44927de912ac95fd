use std::any::Any;
use std::fmt::Debug;
use std::path::Path;

use arrow_schema::SchemaRef;
use tern_batch::Collection;

/// Interface defining how collections are written to a particular file format.
///
/// A format describes the sink-specific half of a copy operation: how large
/// output batches should be, how a collection is transformed into a
/// ready-to-write artifact, and how artifacts are written out.
pub trait CopyFormat: Send + Sync + Debug {
    /// The row count the format prefers per flushed artifact.
    ///
    /// Must be positive.
    fn desired_batch_size(&self) -> usize;

    /// Open the sink for the given output path.
    ///
    /// Called once per copy operation, before any data arrives.
    fn new_sink(
        &self,
        path: &Path,
        schema: SchemaRef,
    ) -> error_stack::Result<Box<dyn FormatSink>, FormatError>;

    /// Create per-producer format state.
    ///
    /// Most formats have none.
    fn new_local_state(&self) -> Box<dyn FormatLocalState> {
        Box::new(NoLocalState)
    }
}

/// An open sink for a single copy operation.
///
/// `prepare` may be called concurrently from many threads and in any order.
/// `flush` calls are serialized by the engine and arrive strictly in output
/// order. Neither may call back into the engine.
pub trait FormatSink: Send + Sync + Debug {
    /// Transform a collection into a ready-to-write artifact.
    ///
    /// Consumes the collection.
    fn prepare(
        &self,
        collection: Collection,
    ) -> error_stack::Result<Box<dyn PreparedBatch>, FormatError>;

    /// Write a prepared artifact to the sink.
    ///
    /// Only ever called by one thread at a time, in output order.
    fn flush(&self, prepared: Box<dyn PreparedBatch>) -> error_stack::Result<(), FormatError>;

    /// Finish writing. Called exactly once, after the final flush.
    fn finish(&self) -> error_stack::Result<(), FormatError>;
}

/// A sink-specific artifact produced by [`FormatSink::prepare`], ready to be
/// flushed.
///
/// Opaque to the engine; the owning format downcasts it back in `flush`.
pub trait PreparedBatch: Send + Debug {
    fn as_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Per-producer format state.
pub trait FormatLocalState: Send + Debug {}

/// Local state for formats that don't track anything per producer.
#[derive(Debug)]
pub struct NoLocalState;

impl FormatLocalState for NoLocalState {}

#[non_exhaustive]
#[derive(derive_more::Display, Debug)]
pub enum FormatError {
    #[display(fmt = "internal error in copy format: {_0}")]
    Internal(&'static str),
    #[display(fmt = "failed to open the sink")]
    Open,
    #[display(fmt = "failed to prepare a batch for writing")]
    Prepare,
    #[display(fmt = "failed to flush a batch to the sink")]
    Flush,
    #[display(fmt = "failed to finish writing to the sink")]
    Finish,
}

impl error_stack::Context for FormatError {}
