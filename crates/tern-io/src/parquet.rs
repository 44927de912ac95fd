use std::fs::File;
use std::path::Path;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use arrow_select::concat::concat_batches;
use error_stack::{IntoReport, ResultExt};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tern_batch::Collection;
use tern_interfaces::{CopyFormat, FormatError, FormatSink, PreparedBatch};

/// Options for Parquet output.
#[derive(Debug, Clone)]
pub struct ParquetOptions {
    /// Rows per flushed artifact, which also bounds the row group size.
    pub batch_size: usize,
}

impl Default for ParquetOptions {
    fn default() -> Self {
        Self {
            batch_size: 122_880,
        }
    }
}

/// Parquet copy format.
///
/// `prepare` coalesces a collection's chunks into a single record batch;
/// the serial `flush` hands it to the file writer, which cuts row groups at
/// the configured size.
#[derive(Debug, Default)]
pub struct ParquetFormat {
    options: ParquetOptions,
}

impl ParquetFormat {
    pub fn new(options: ParquetOptions) -> Self {
        Self { options }
    }
}

impl CopyFormat for ParquetFormat {
    fn desired_batch_size(&self) -> usize {
        self.options.batch_size
    }

    fn new_sink(
        &self,
        path: &Path,
        schema: SchemaRef,
    ) -> error_stack::Result<Box<dyn FormatSink>, FormatError> {
        let file = File::create(path)
            .into_report()
            .change_context(FormatError::Open)
            .attach_printable_lazy(|| format!("creating {path:?}"))?;
        let properties = WriterProperties::builder()
            .set_max_row_group_size(self.options.batch_size)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(properties))
            .into_report()
            .change_context(FormatError::Open)?;
        tracing::debug!("Opened Parquet sink at {path:?}");
        Ok(Box::new(ParquetSink {
            schema,
            writer: Mutex::new(Some(writer)),
        }))
    }
}

struct ParquetSink {
    schema: SchemaRef,
    /// Taken on `finish`; the Arrow writer's `close` consumes it.
    writer: Mutex<Option<ArrowWriter<File>>>,
}

impl FormatSink for ParquetSink {
    fn prepare(
        &self,
        collection: Collection,
    ) -> error_stack::Result<Box<dyn PreparedBatch>, FormatError> {
        let chunks: Vec<RecordBatch> = collection
            .into_chunks()
            .map(tern_batch::Chunk::into_record_batch)
            .collect();
        let coalesced = concat_batches(&self.schema, chunks.iter())
            .into_report()
            .change_context(FormatError::Prepare)?;
        Ok(Box::new(ParquetCoalescedBatch { batch: coalesced }))
    }

    fn flush(&self, prepared: Box<dyn PreparedBatch>) -> error_stack::Result<(), FormatError> {
        let coalesced = prepared
            .as_any()
            .downcast::<ParquetCoalescedBatch>()
            .map_err(|_| FormatError::Internal("unexpected prepared batch type"))?;
        let mut writer = self.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| FormatError::Internal("parquet sink already finished"))?;
        writer
            .write(&coalesced.batch)
            .into_report()
            .change_context(FormatError::Flush)?;
        Ok(())
    }

    fn finish(&self) -> error_stack::Result<(), FormatError> {
        let writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| FormatError::Internal("parquet sink already finished"))?;
        writer
            .close()
            .into_report()
            .change_context(FormatError::Finish)?;
        Ok(())
    }
}

impl std::fmt::Debug for ParquetSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetSink")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ParquetCoalescedBatch {
    batch: RecordBatch,
}

impl PreparedBatch for ParquetCoalescedBatch {
    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}
