//! Classification of agent process failures.

use serde::{Deserialize, Serialize};

/// Why an agent process failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Connectivity or upstream availability problem.
    Network,
    /// The agent ran out of time.
    Timeout,
    /// Anything else: non-zero exit, fatal signal.
    Crash,
    /// The agent was refused permission. Retrying will not help.
    Permission,
}

/// `timeout(1)` exits with this code when the command timed out.
const TIMEOUT_EXIT_CODE: i32 = 124;
/// SIGALRM.
const TIMEOUT_SIGNAL: i32 = 14;

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "requires approval",
    "not allowed to",
    "eacces",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "network error",
    "network is unreachable",
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "could not resolve host",
    "overloaded",
    "rate limit",
    "service unavailable",
];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "deadline exceeded", "timeout"];

impl FailureType {
    /// Retryable failures put the agent into backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permission)
    }

    /// Classify a failed exit from its exit code, terminating signal, and output.
    pub fn classify(exit_code: Option<i32>, signal: Option<i32>, output: &str) -> Self {
        if exit_code == Some(TIMEOUT_EXIT_CODE) || signal == Some(TIMEOUT_SIGNAL) {
            return Self::Timeout;
        }

        let output = output.to_lowercase();
        let mentions = |markers: &[&str]| markers.iter().any(|m| output.contains(m));

        if mentions(PERMISSION_MARKERS) {
            Self::Permission
        } else if mentions(NETWORK_MARKERS) {
            Self::Network
        } else if mentions(TIMEOUT_MARKERS) {
            Self::Timeout
        } else {
            Self::Crash
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Permission => "permission",
        }
    }
}

/// How a process ended, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionType {
    Success,
    Failed,
    Timeout,
    NetworkError,
    PermissionBlocked,
    Killed,
}

impl From<FailureType> for CompletionType {
    fn from(failure: FailureType) -> Self {
        match failure {
            FailureType::Network => Self::NetworkError,
            FailureType::Timeout => Self::Timeout,
            FailureType::Crash => Self::Failed,
            FailureType::Permission => Self::PermissionBlocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_exit_code() {
        assert_eq!(FailureType::classify(Some(124), None, ""), FailureType::Timeout);
        assert_eq!(FailureType::classify(None, Some(14), ""), FailureType::Timeout);
    }

    #[test]
    fn test_classify_from_output() {
        assert_eq!(
            FailureType::classify(Some(1), None, "Error: connect ECONNREFUSED 127.0.0.1:443"),
            FailureType::Network
        );
        assert_eq!(
            FailureType::classify(Some(1), None, "bash: ./run.sh: Permission denied"),
            FailureType::Permission
        );
        assert_eq!(
            FailureType::classify(Some(1), None, "request timed out after 600s"),
            FailureType::Timeout
        );
        assert_eq!(
            FailureType::classify(Some(2), None, "panicked at src/main.rs"),
            FailureType::Crash
        );
        assert_eq!(FailureType::classify(None, Some(9), ""), FailureType::Crash);
    }

    #[test]
    fn test_connection_timeout_is_network() {
        assert_eq!(
            FailureType::classify(Some(1), None, "connection timed out"),
            FailureType::Network
        );
    }

    #[test]
    fn test_retryable() {
        assert!(FailureType::Network.is_retryable());
        assert!(FailureType::Timeout.is_retryable());
        assert!(FailureType::Crash.is_retryable());
        assert!(!FailureType::Permission.is_retryable());
    }

    #[test]
    fn test_completion_type_mapping() {
        assert_eq!(CompletionType::from(FailureType::Network), CompletionType::NetworkError);
        assert_eq!(
            CompletionType::from(FailureType::Permission),
            CompletionType::PermissionBlocked
        );
    }
}
