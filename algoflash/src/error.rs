use thiserror::Error;

/// Errors raised by the probe primitives.
#[derive(Error, Debug)]
pub enum Error {
    /// The probe failed to carry out a memory or register access.
    #[error("Communication with the target failed: {0}")]
    Transport(String),
    /// The address can not be reached by the probe.
    #[error("Address {0:#010x} is not accessible on the target")]
    InvalidAddress(u64),
    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a transport error from anything printable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }

    /// Returns `true` if the error means the link to the target is in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
