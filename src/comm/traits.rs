//! Process-group interface for the cross-device exchange.
//!
//! The dispatched expert buffers are shipped between devices through an
//! all-to-all primitive this crate only consumes. The group handle is always
//! explicit: there is no hidden global default group.

use std::fmt;

/// Communication error types.
#[derive(Debug)]
pub enum CommError {
    /// Invalid rank, world size or message shape.
    InvalidConfig(String),
    /// Send operation failed.
    SendFailed(String),
    /// Receive operation failed.
    RecvFailed(String),
    /// Channel disconnected.
    Disconnected,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            CommError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            CommError::RecvFailed(msg) => write!(f, "Recv failed: {}", msg),
            CommError::Disconnected => write!(f, "Channel disconnected"),
        }
    }
}

impl std::error::Error for CommError {}

/// Result type for communication operations.
pub type CommResult<T> = Result<T, CommError>;

/// A tensor payload exchanged between ranks: raw data plus shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMessage {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl TensorMessage {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> CommResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(CommError::InvalidConfig(format!(
                "shape {:?} does not describe {} elements",
                shape,
                data.len()
            )));
        }
        if shape.is_empty() {
            return Err(CommError::InvalidConfig("shape must be non-empty".to_string()));
        }
        Ok(Self { data, shape })
    }

    /// Leading dimension, the one all-to-all splits across ranks.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Elements per leading-dimension row.
    pub fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }
}

/// Explicit process-group handle.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this participant.
    fn rank(&self) -> usize;

    /// Total number of participants.
    fn world_size(&self) -> usize;

    /// Barrier synchronization across all ranks.
    fn barrier(&self) -> CommResult<()>;

    /// All-to-all exchange: the leading dimension is split into
    /// `world_size` equal chunks, chunk `j` is shipped to rank `j`, and the
    /// returned message holds chunk `j` received from rank `j`. Same shape
    /// in, same shape out.
    ///
    /// Fails if the leading dimension is not divisible by the world size.
    fn all_to_all(&self, message: TensorMessage) -> CommResult<TensorMessage>;

    /// List form: each message is exchanged independently, preserving order.
    fn all_to_all_list(&self, messages: Vec<TensorMessage>) -> CommResult<Vec<TensorMessage>> {
        messages
            .into_iter()
            .map(|message| self.all_to_all(message))
            .collect()
    }
}
