use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_DEVICE_NOT_FOUND: &str = "ERR_DEVICE_NOT_FOUND";
pub const ERR_SERVICE_UNREACHABLE: &str = "ERR_SERVICE_UNREACHABLE";
pub const ERR_SPAWN: &str = "ERR_SPAWN";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn device_not_found(trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEVICE_NOT_FOUND, "No device detected", trace_id)
    }

    pub fn service_unreachable(service: &str, trace_id: impl Into<String>) -> Self {
        Self::new(
            ERR_SERVICE_UNREACHABLE,
            format!("{service} is not reachable"),
            trace_id,
        )
    }

    pub fn spawn(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SPAWN, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = AppError::spawn("netmuxd missing", "trace-1");
        assert_eq!(err.to_string(), "netmuxd missing (ERR_SPAWN)");
        assert_eq!(err.trace_id, "trace-1");
    }

    #[test]
    fn timeout_is_detectable() {
        assert!(AppError::timeout("Command timed out", "t").is_timeout());
        assert!(!AppError::system("boom", "t").is_timeout());
    }
}
