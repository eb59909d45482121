use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error only reflects a torn-down session or channel
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidTopology("ring".to_string());
        assert_eq!(err.to_string(), "Invalid topology: ring");

        let err = Error::NotFound("peer bob".to_string());
        assert_eq!(err.to_string(), "Not found: peer bob");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_closed());
        assert!(Error::Closed("session".to_string()).is_closed());
    }
}
