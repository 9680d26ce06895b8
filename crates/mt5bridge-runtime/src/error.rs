use thiserror::Error;

/// Failure reported by the embedded runtime itself.
///
/// Carries the runtime's own description of the problem (for CPython, the
/// `str()` of the raised exception) when it produced one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message.as_deref().unwrap_or("runtime reported no error detail"))]
pub struct RuntimeFault {
    message: Option<String>,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// A failure the runtime signalled without describing it.
    pub fn unreported() -> Self {
        Self { message: None }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The runtime's description, or `fallback` if it gave none.
    pub fn describe_or(self, fallback: &str) -> String {
        self.message.unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("runtime bring-up failed: {0}")]
    RuntimeBringup(String),

    #[error("{0}")]
    Handshake(String),

    #[error("bridge not initialized")]
    NotInitialized,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("missing field `{field}` for method `{method}`")]
    MissingField { method: String, field: &'static str },

    #[error("field `{field}` of method `{method}` must be {expected}")]
    InvalidField {
        method: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("{0}")]
    ExternalCall(String),

    #[error("{0}")]
    Marshaling(String),

    #[error("{0}")]
    Teardown(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("panic inside bridge: {0}")]
    Panic(String),
}

/// Coarse classification of a [`BridgeError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RuntimeBringup,
    Handshake,
    NotInitialized,
    MalformedRequest,
    UnknownMethod,
    MissingField,
    InvalidField,
    ExternalCall,
    Marshaling,
    Teardown,
    Config,
    Panic,
}

impl ErrorKind {
    /// Status code returned through the C surface.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::RuntimeBringup => -1,
            ErrorKind::Handshake => -2,
            ErrorKind::Config => -3,
            _ => -4,
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::RuntimeBringup(_) => ErrorKind::RuntimeBringup,
            BridgeError::Handshake(_) => ErrorKind::Handshake,
            BridgeError::NotInitialized => ErrorKind::NotInitialized,
            BridgeError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            BridgeError::UnknownMethod(_) => ErrorKind::UnknownMethod,
            BridgeError::MissingField { .. } => ErrorKind::MissingField,
            BridgeError::InvalidField { .. } => ErrorKind::InvalidField,
            BridgeError::ExternalCall(_) => ErrorKind::ExternalCall,
            BridgeError::Marshaling(_) => ErrorKind::Marshaling,
            BridgeError::Teardown(_) => ErrorKind::Teardown,
            BridgeError::Config(_) => ErrorKind::Config,
            BridgeError::Panic(_) => ErrorKind::Panic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_messages_pass_through_verbatim() {
        let err = BridgeError::Handshake("No module named 'MetaTrader5'".into());
        assert_eq!(err.to_string(), "No module named 'MetaTrader5'");
        assert_eq!(err.kind().code(), -2);
    }

    #[test]
    fn fault_without_detail_uses_fallback() {
        let fault = RuntimeFault::unreported();
        assert_eq!(fault.to_string(), "runtime reported no error detail");
        assert_eq!(fault.describe_or("failed to serialize result"), "failed to serialize result");
        assert_eq!(RuntimeFault::new("boom").describe_or("unused"), "boom");
    }

    #[test]
    fn field_errors_name_method_and_field() {
        let err = BridgeError::MissingField {
            method: "get_m1_bars".into(),
            field: "symbol",
        };
        assert_eq!(err.to_string(), "missing field `symbol` for method `get_m1_bars`");
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert_eq!(err.kind().code(), -4);
    }
}
