//! Error types for the relay coordinator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Routing decision invalid: {0}")]
    RoutingDecisionInvalid(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Credential missing: {0}")]
    CredentialMissing(String),

    #[error("Malformed stream event: {0}")]
    MalformedStreamEvent(String),

    #[error("Output sink error: {0}")]
    OutputSink(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Errors that are handled where they occur and never end a turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedStreamEvent(_) | Self::OutputSink(_))
    }

    /// Short machine-readable code used by the HTTP harness.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoutingDecisionInvalid(_) => "ROUTING_DECISION_INVALID",
            Self::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            Self::CredentialMissing(_) => "CREDENTIAL_MISSING",
            Self::MalformedStreamEvent(_) => "MALFORMED_STREAM_EVENT",
            Self::OutputSink(_) => "OUTPUT_SINK_FAILURE",
            Self::Llm(_) => "LLM_ERROR",
            Self::InvalidTurn(_) => "INVALID_TURN",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_and_sink_errors_are_recoverable() {
        assert!(RelayError::MalformedStreamEvent("x".into()).is_recoverable());
        assert!(RelayError::OutputSink("x".into()).is_recoverable());
        assert!(!RelayError::RoutingDecisionInvalid("x".into()).is_recoverable());
        assert!(!RelayError::BackendUnreachable("x".into()).is_recoverable());
        assert!(!RelayError::CredentialMissing("x".into()).is_recoverable());
    }

    #[test]
    fn display_includes_detail() {
        let err = RelayError::CredentialMissing("no Api-Key header".into());
        assert_eq!(err.to_string(), "Credential missing: no Api-Key header");
        assert_eq!(err.code(), "CREDENTIAL_MISSING");
    }
}
