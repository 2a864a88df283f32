use thiserror::Error;

use crate::endpoint::Endpoint;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Call {method} to {endpoint} timed out")]
    Timeout {
        endpoint: Endpoint,
        method: &'static str,
    },

    #[error("Transport error calling {method} on {endpoint}: {reason}")]
    Transport {
        endpoint: Endpoint,
        method: &'static str,
        reason: String,
    },

    #[error("{endpoint} rejected {method}: {reason}")]
    Rejected {
        endpoint: Endpoint,
        method: &'static str,
        reason: String,
    },

    /// The peer understood the call and will never accept it as sent
    /// (e.g. a body over its size limit). Retrying is pointless.
    #[error("{endpoint} refused {method}: {reason}")]
    Refused {
        endpoint: Endpoint,
        method: &'static str,
        reason: String,
    },

    #[error("Worker already holds a job")]
    AlreadyAssigned,

    #[error("Execution unit error: {0}")]
    Execution(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HiveError {
    /// Failures a caller recovers from by retrying or requeueing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HiveError::Timeout { .. } | HiveError::Transport { .. } | HiveError::Rejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_family_is_transient() {
        let endpoint = Endpoint::new("127.0.0.1:7701");
        assert!(HiveError::Timeout {
            endpoint: endpoint.clone(),
            method: "assign",
        }
        .is_transient());
        assert!(HiveError::Transport {
            endpoint: endpoint.clone(),
            method: "remind",
            reason: "connection refused".to_string(),
        }
        .is_transient());
        assert!(HiveError::Rejected {
            endpoint,
            method: "assign",
            reason: "busy".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn local_failures_are_not_transient() {
        assert!(!HiveError::AlreadyAssigned.is_transient());
        assert!(!HiveError::Config("zero interval".to_string()).is_transient());
        assert!(!HiveError::Execution("closed".to_string()).is_transient());
    }

    #[test]
    fn refused_call_is_not_transient() {
        let err = HiveError::Refused {
            endpoint: Endpoint::new("127.0.0.1:7700"),
            method: "done",
            reason: "HTTP 413 Payload Too Large".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "127.0.0.1:7700 refused done: HTTP 413 Payload Too Large"
        );
    }

    #[test]
    fn timeout_message_names_endpoint_and_method() {
        let err = HiveError::Timeout {
            endpoint: Endpoint::new("10.0.0.2:9000"),
            method: "assign",
        };
        assert_eq!(err.to_string(), "Call assign to 10.0.0.2:9000 timed out");
    }
}
