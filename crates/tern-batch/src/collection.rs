use arrow_schema::SchemaRef;

use crate::{Chunk, Error};

/// An ordered, append-only sequence of [`Chunk`]s with byte-size accounting.
///
/// A collection has a single owner at any moment -- a producer, the raw
/// batch store, an in-flight prepare task, or a prepared artifact. Transfers
/// are moves; collections are never aliased.
#[derive(Debug)]
pub struct Collection {
    schema: SchemaRef,
    chunks: Vec<Chunk>,
    num_rows: usize,
    size_in_bytes: usize,
}

impl Collection {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            chunks: Vec::new(),
            num_rows: 0,
            size_in_bytes: 0,
        }
    }

    /// Append a chunk, growing the row and byte accounting.
    ///
    /// `size_in_bytes` is monotone in appended data.
    pub fn append(&mut self, chunk: Chunk) -> error_stack::Result<(), Error> {
        error_stack::ensure!(chunk.schema() == self.schema, Error::SchemaMismatch);
        self.num_rows += chunk.num_rows();
        self.size_in_bytes += chunk.size_in_bytes();
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn into_chunks(self) -> impl Iterator<Item = Chunk> {
        self.chunks.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{Int64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]))
    }

    fn int_chunk(rows: usize) -> Chunk {
        let values: Vec<i64> = (0..rows as i64).collect();
        let batch =
            RecordBatch::try_new(int_schema(), vec![Arc::new(Int64Array::from(values))]).unwrap();
        Chunk::try_new(batch).unwrap()
    }

    #[test]
    fn test_append_accounting_is_monotone() {
        let mut collection = Collection::new(int_schema());
        assert!(collection.is_empty());
        assert_eq!(collection.size_in_bytes(), 0);

        let mut last_size = 0;
        for rows in [100, 1, 2048] {
            collection.append(int_chunk(rows)).unwrap();
            assert!(collection.size_in_bytes() > last_size);
            last_size = collection.size_in_bytes();
        }
        assert_eq!(collection.num_rows(), 2149);
        assert_eq!(collection.num_chunks(), 3);
    }

    #[test]
    fn test_append_rejects_schema_mismatch() {
        let mut collection = Collection::new(int_schema());
        let other = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let batch =
            RecordBatch::try_new(other, vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        let chunk = Chunk::try_new(batch).unwrap();
        assert!(collection.append(chunk).is_err());
    }

    #[test]
    fn test_chunks_iterate_in_append_order() {
        let mut collection = Collection::new(int_schema());
        for rows in [10, 20, 30] {
            collection.append(int_chunk(rows)).unwrap();
        }
        let sizes: Vec<_> = collection.chunks().map(Chunk::num_rows).collect();
        assert_eq!(sizes, vec![10, 20, 30]);
    }
}
