//! Error taxonomy for the UART link

use thiserror::Error;

/// Errors returned from writes or emitted through
/// [`ConnectionHandler::on_error`](crate::ConnectionHandler::on_error)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UartError {
    /// Service or characteristic enumeration failed; the session is abandoned
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Notification, read or acknowledged write failed on a bound characteristic
    #[error("Characteristic error: {0}")]
    Characteristic(String),

    /// TX characteristic advertises neither write mode
    #[error("TX characteristic is not writable")]
    Unwritable,

    /// Write attempted while the link is not connected
    #[error("UART link not ready")]
    NotReady,

    /// Transport connect attempt failed
    #[error("Unable to connect: {0}")]
    ConnectFailed(String),
}

impl UartError {
    /// Whether the error ends the current session
    pub fn is_fatal(&self) -> bool {
        matches!(self, UartError::Discovery(_) | UartError::ConnectFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = UartError::Discovery("services".into());
        assert_eq!(err.to_string(), "Discovery failed: services");
        assert_eq!(UartError::NotReady.to_string(), "UART link not ready");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(UartError::Discovery(String::new()).is_fatal());
        assert!(UartError::ConnectFailed(String::new()).is_fatal());
        assert!(!UartError::Characteristic(String::new()).is_fatal());
        assert!(!UartError::Unwritable.is_fatal());
        assert!(!UartError::NotReady.is_fatal());
    }
}
