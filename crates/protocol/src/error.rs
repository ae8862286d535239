/// Error kinds surfaced by the relay core (§7).
///
/// Keepalive-driven failover is an expected path and is never represented
/// here — it is reported through the Coordinator's event stream instead.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{what} already closed")]
    Closed { what: &'static str },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("malformed payload: {0}")]
    Marshal(String),

    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },
}

impl RelayError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid_state(expected: &'static str, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected,
            actual: actual.into(),
        }
    }
}
