use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::{Error, STANDARD_VECTOR_SIZE};

/// A fixed-width row group: typed column arrays plus a row count.
///
/// Chunks are immutable after they have been appended to a [`Collection`].
///
/// [`Collection`]: crate::Collection
#[derive(Clone, PartialEq, Debug)]
pub struct Chunk {
    data: RecordBatch,
}

impl Chunk {
    /// Construct a chunk from a record batch.
    ///
    /// The batch must contain between 1 and [`STANDARD_VECTOR_SIZE`] rows.
    pub fn try_new(data: RecordBatch) -> error_stack::Result<Self, Error> {
        error_stack::ensure!(data.num_rows() > 0, Error::EmptyChunk);
        error_stack::ensure!(
            data.num_rows() <= STANDARD_VECTOR_SIZE,
            Error::ChunkTooLarge(data.num_rows())
        );
        Ok(Self { data })
    }

    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.data.schema()
    }

    /// Bytes of buffer space the chunk's arrays occupy.
    pub fn size_in_bytes(&self) -> usize {
        self.data.get_array_memory_size()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.data
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn batch_of(rows: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let values: Vec<i64> = (0..rows as i64).collect();
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn test_rejects_empty_chunk() {
        let result = Chunk::try_new(batch_of(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_oversized_chunk() {
        let result = Chunk::try_new(batch_of(STANDARD_VECTOR_SIZE + 1));
        assert!(result.is_err());
    }

    #[test]
    fn test_accepts_full_vector() {
        let chunk = Chunk::try_new(batch_of(STANDARD_VECTOR_SIZE)).unwrap();
        assert_eq!(chunk.num_rows(), STANDARD_VECTOR_SIZE);
        assert!(chunk.size_in_bytes() >= STANDARD_VECTOR_SIZE * 8);
    }
}
