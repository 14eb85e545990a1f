use std::fmt::{Display, Formatter};

/// Status codes returned by the broker core.
///
/// Named the same as the gRPC status codes a managed pub/sub service would
/// return for the equivalent condition, but standalone: the broker has no
/// wire protocol, so there's no `tonic`/`Status` underneath.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Code {
    /// Some requested entity (topic, subscription, ack id) was not found.
    NotFound,
    /// Some entity that we attempted to create already exists.
    AlreadyExists,
    /// Client specified an invalid argument.
    InvalidArgument,
    /// Some resource has been exhausted (queue capacity ceiling).
    ResourceExhausted,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition,
    /// Operation is not implemented or not supported.
    Unimplemented,
    /// Internal error — an invariant was violated.
    Internal,
}

impl Code {
    pub fn description(&self) -> &'static str {
        match self {
            Code::NotFound => "some requested entity was not found",
            Code::AlreadyExists => "some entity that we attempted to create already exists",
            Code::InvalidArgument => "client specified an invalid argument",
            Code::ResourceExhausted => "some resource has been exhausted",
            Code::FailedPrecondition => "the system is not in a state required for the operation's execution",
            Code::Unimplemented => "operation is not implemented or not supported",
            Code::Internal => "internal error",
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.description(), f)
    }
}

/// An error describing the result of a broker operation.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
