use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    InvalidData(String),
    CorruptedJournal(String),
    // A row changed between the dirty read and the update by a writer that
    // does not follow the refuse-on-conflict protocol.
    ForeignWriterConflict { relation: &'static str, key: String },
    TupleSelfModified(&'static str),
    HashTableCorrupted(String),
    SizeMismatch { expected: usize, actual: usize },
    InvalidRelation,
    RelationMissing(&'static str),
    OutOfMemory { requested: usize, capacity: usize },
    InvalidHandle(u64),
    AlreadyInitialized(String),
    LockError(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::CorruptedJournal(msg) => write!(f, "Corrupted journal: {}", msg),
            Error::ForeignWriterConflict { relation, key } => write!(
                f,
                "Row {} in {} concurrently updated by a foreign writer",
                key, relation
            ),
            Error::TupleSelfModified(relation) => {
                write!(f, "Tuple in {} already updated by this transaction", relation)
            }
            Error::HashTableCorrupted(msg) => write!(f, "Hash table corrupted: {}", msg),
            Error::SizeMismatch { expected, actual } => write!(
                f,
                "Record size mismatch: expected {} bytes, found {}",
                expected, actual
            ),
            Error::InvalidRelation => write!(f, "Invalid relation id in the knowledge base"),
            Error::RelationMissing(name) => write!(f, "Relation {} does not exist", name),
            Error::OutOfMemory {
                requested,
                capacity,
            } => write!(
                f,
                "Arena exhausted: requested {} bytes, capacity {}",
                requested, capacity
            ),
            Error::InvalidHandle(handle) => write!(f, "Invalid arena handle: {:#x}", handle),
            Error::AlreadyInitialized(dir) => {
                write!(f, "Knowledge base at {} is already initialized", dir)
            }
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {}
