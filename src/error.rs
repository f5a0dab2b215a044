use thiserror::Error;

/// Failure taxonomy for the orchestrator. Every runtime call site maps
/// into one of these variants; raw engine error strings never reach a
/// caller-facing message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("default fallback image missing: {0}")]
    DefaultImageMissing(String),

    #[error("no free port available in range {start}-{end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("instance never reached running state: {0}")]
    StartupFailure(String),

    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("no active instance for owner {0}")]
    NoActiveInstance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code, part of the response contract.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            Error::DefaultImageMissing(_) => "DEFAULT_IMAGE_MISSING",
            Error::PortExhaustion { .. } => "PORT_EXHAUSTION",
            Error::StartupFailure(_) => "STARTUP_FAILURE",
            Error::RuntimeUnreachable(_) => "RUNTIME_UNREACHABLE",
            Error::Runtime(_) => "RUNTIME_ERROR",
            Error::NoActiveInstance(_) => "NO_ACTIVE_INSTANCE",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Message safe to show to a learner.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::ImageNotFound(_) => "Lab image not available. Please contact support.",
            Error::DefaultImageMissing(_) => {
                "System configuration error. Please contact support."
            }
            Error::PortExhaustion { .. } => "Server is busy. Please try again later.",
            Error::StartupFailure(_) => "Lab failed to start. Please try again.",
            Error::RuntimeUnreachable(_) => "Lab infrastructure is offline.",
            Error::Runtime(_) => "Failed to start lab. Please try again.",
            Error::NoActiveInstance(_) => "You have no active lab.",
            Error::Io(_) => "An unexpected error occurred.",
        }
    }

    /// Transient conditions the caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PortExhaustion { .. } | Error::StartupFailure(_) | Error::Runtime(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::ImageNotFound("x".into()).code(), "IMAGE_NOT_FOUND");
        assert_eq!(
            Error::DefaultImageMissing("x".into()).code(),
            "DEFAULT_IMAGE_MISSING"
        );
        assert_eq!(
            Error::PortExhaustion { start: 1, end: 2 }.code(),
            "PORT_EXHAUSTION"
        );
        assert_eq!(Error::NoActiveInstance("7".into()).code(), "NO_ACTIVE_INSTANCE");
    }

    #[test]
    fn user_messages_never_leak_detail() {
        let err = Error::Runtime("connect ENOENT /var/run/docker.sock".into());
        assert!(!err.user_message().contains("docker.sock"));
    }
}
