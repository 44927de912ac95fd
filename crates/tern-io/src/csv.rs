use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use arrow_csv::WriterBuilder;
use arrow_schema::SchemaRef;
use error_stack::{IntoReport, ResultExt};
use parking_lot::Mutex;
use tern_batch::Collection;
use tern_interfaces::{CopyFormat, FormatError, FormatSink, PreparedBatch};

/// Options for CSV output.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Rows per flushed artifact.
    pub batch_size: usize,
    pub delimiter: u8,
    /// Write a header row with the column names.
    pub include_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            delimiter: b',',
            include_header: true,
        }
    }
}

/// CSV copy format.
///
/// `prepare` renders a collection to CSV bytes in memory; `flush` appends
/// them to the output file.
#[derive(Debug, Default)]
pub struct CsvFormat {
    options: CsvOptions,
}

impl CsvFormat {
    pub fn new(options: CsvOptions) -> Self {
        Self { options }
    }
}

impl CopyFormat for CsvFormat {
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
        let mut output = BufWriter::new(file);
        if self.options.include_header {
            // The header is written up front; prepared artifacts carry data
            // rows only.
            let delimiter = (self.options.delimiter as char).to_string();
            let header = schema
                .fields()
                .iter()
                .map(|field| field.name().as_str())
                .collect::<Vec<_>>()
                .join(&delimiter);
            writeln!(output, "{header}")
                .into_report()
                .change_context(FormatError::Open)?;
        }
        tracing::debug!("Opened CSV sink at {path:?}");
        Ok(Box::new(CsvSink {
            output: Mutex::new(output),
            delimiter: self.options.delimiter,
        }))
    }
}

#[derive(Debug)]
struct CsvSink {
    output: Mutex<BufWriter<File>>,
    delimiter: u8,
}

impl FormatSink for CsvSink {
    fn prepare(
        &self,
        collection: Collection,
    ) -> error_stack::Result<Box<dyn PreparedBatch>, FormatError> {
        let num_rows = collection.num_rows();
        let mut bytes = Vec::new();
        {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .with_delimiter(self.delimiter)
                .build(&mut bytes);
            for chunk in collection.chunks() {
                writer
                    .write(chunk.record_batch())
                    .into_report()
                    .change_context(FormatError::Prepare)?;
            }
        }
        Ok(Box::new(CsvEncodedBatch { bytes, num_rows }))
    }

    fn flush(&self, prepared: Box<dyn PreparedBatch>) -> error_stack::Result<(), FormatError> {
        let encoded = prepared
            .as_any()
            .downcast::<CsvEncodedBatch>()
            .map_err(|_| FormatError::Internal("unexpected prepared batch type"))?;
        tracing::trace!("Appending {} CSV rows", encoded.num_rows);
        self.output
            .lock()
            .write_all(&encoded.bytes)
            .into_report()
            .change_context(FormatError::Flush)?;
        Ok(())
    }

    fn finish(&self) -> error_stack::Result<(), FormatError> {
        self.output
            .lock()
            .flush()
            .into_report()
            .change_context(FormatError::Finish)
    }
}

#[derive(Debug)]
struct CsvEncodedBatch {
    bytes: Vec<u8>,
    num_rows: usize,
}

impl PreparedBatch for CsvEncodedBatch {
    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
        self
    }
}
