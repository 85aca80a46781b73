use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Out of memory in every acceptable pool")]
    OutOfMemory,

    #[error("Buffer object reservation is held by another caller")]
    Busy,

    #[error("Buffer object still has a live kernel mapping")]
    StillMapped,

    #[error("Invalid allocation size")]
    InvalidSize,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Fence wait timed out")]
    WaitTimeout,

    #[error("Device fault: {0}")]
    DeviceFault(String),
}

// A convenient alias
pub type MemResult<T> = Result<T, MemError>;
