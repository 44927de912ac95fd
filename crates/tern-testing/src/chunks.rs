use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use tern_batch::{Chunk, STANDARD_VECTOR_SIZE};

/// The single-column schema used by most engine tests.
pub fn number_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]))
}

/// A chunk of `rows` consecutive integers starting at `start`.
pub fn number_chunk(start: i64, rows: usize) -> Chunk {
    assert!(rows > 0 && rows <= STANDARD_VECTOR_SIZE);
    let values: Vec<i64> = (start..start + rows as i64).collect();
    let batch =
        RecordBatch::try_new(number_schema(), vec![Arc::new(Int64Array::from(values))]).unwrap();
    Chunk::try_new(batch).unwrap()
}

/// Chunks covering `[start, start + rows)`, each at most `chunk_rows` rows.
pub fn number_chunks(start: i64, rows: usize, chunk_rows: usize) -> Vec<Chunk> {
    assert!(chunk_rows > 0 && chunk_rows <= STANDARD_VECTOR_SIZE);
    let mut chunks = Vec::with_capacity((rows + chunk_rows - 1) / chunk_rows);
    let mut offset = 0;
    while offset < rows {
        let len = chunk_rows.min(rows - offset);
        chunks.push(number_chunk(start + offset as i64, len));
        offset += len;
    }
    chunks
}
