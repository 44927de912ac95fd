#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "chunk of {_0} rows exceeds the vector size")]
    ChunkTooLarge(usize),
    #[display(fmt = "chunks must contain at least one row")]
    EmptyChunk,
    #[display(fmt = "chunk schema does not match the collection schema")]
    SchemaMismatch,
}

impl error_stack::Context for Error {}
