/// Top level errors reported during a batch copy.
///
/// The engine has no local recovery: every variant here is fatal to the
/// operation, and the sink is left in whatever partial state the copy
/// format produced.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "duplicate batch index {_0} encountered in batch copy")]
    DuplicateBatchIndex(u64),
    #[display(fmt = "prepared batch {actual} is out of order (next to flush is {expected})")]
    FlushOutOfOrder { expected: u64, actual: u64 },
    #[display(fmt = "collection memory usage decreased during append")]
    MemoryUsageDecreased,
    #[display(fmt = "unexecuted tasks are remaining at final flush")]
    TasksRemainingAtFinalFlush,
    #[display(fmt = "{unflushed} batches were never flushed to the sink - incomplete file?")]
    IncompleteFile { unflushed: u64 },
    #[display(fmt = "copy format reported a batch size of zero")]
    InvalidBatchSize,
    #[display(fmt = "error appending chunk to collection")]
    Collection,
    #[display(fmt = "error in copy format while {_0}")]
    Format(&'static str),
    #[display(fmt = "failed to move temporary file to {_0:?}")]
    PersistTmpFile(std::path::PathBuf),
    #[display(fmt = "spawning finalize worker")]
    SpawnWorker,
    #[display(fmt = "finalize worker panicked")]
    WorkerPanicked,
    #[display(fmt = "batch copy was cancelled")]
    Cancelled,
}

impl error_stack::Context for Error {}
