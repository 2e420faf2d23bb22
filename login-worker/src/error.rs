use login_common::{queue::QueueError, record::RecordError, sink::SinkError};
use thiserror::Error;

/// Enumeration of errors that end a run.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("message {message_id} could not be turned into a login record: {error}")]
    MalformedRecord {
        message_id: String,
        #[source]
        error: RecordError,
    },
    #[error("message {message_id} could not be decoded: {error}")]
    UndecodableMessage {
        message_id: String,
        #[source]
        error: RecordError,
    },
    #[error("failed to write the batch to the store")]
    Sink(#[from] SinkError),
    #[error("queue operation failed")]
    Queue(#[from] QueueError),
}

/// How a caller should treat an error, regardless of where it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The broker was unreachable or handed out something that is not a login event.
    TransientSource,
    /// A message is malformed and will be malformed on every redelivery.
    MalformedRecord,
    /// The store rejected or lost the write.
    Sink,
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::MalformedRecord { .. } => ErrorKind::MalformedRecord,
            WorkerError::Sink(_) => ErrorKind::Sink,
            WorkerError::Queue(_) | WorkerError::UndecodableMessage { .. } => {
                ErrorKind::TransientSource
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientSource
    }
}
