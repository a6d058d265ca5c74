use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Budget rejected before any isolate was created.
    #[error("invalid memory budget: {0}")]
    InvalidBudget(String),

    /// The context was terminated; its execution lock can no longer be taken.
    #[error("execution context has been terminated")]
    Terminated,

    /// Uncaught script exception, carrying the formatted diagnostic.
    #[error("{0}")]
    Script(String),

    #[error("snapshot creation failed: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
