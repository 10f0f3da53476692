use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    None,
    Local,
    Alternate,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::None => "none",
            Transport::Local => "usb",
            Transport::Alternate => "network",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub identifier: String,
    pub transport: Transport,
}

impl Device {
    pub fn none() -> Self {
        Self {
            identifier: String::new(),
            transport: Transport::None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.transport != Transport::None && !self.identifier.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceListing {
    pub local: Vec<String>,
    pub alternate: Vec<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(account_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            secret: secret.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.account_id.trim().is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Installing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            TaskStatus::Pending | TaskStatus::Installing => false,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Installing => "Installing",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Canceled => "Canceled",
        }
    }
}

/// Read-only view of a queued install, safe to hand to the UI thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub package_path: String,
    pub account_id: String,
    pub created_at: String,
    pub status: TaskStatus,
    pub progress: Option<f64>,
    pub detail: String,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub binary_path: String,
    pub binary_present: bool,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRequestResult {
    pub task_id: String,
    pub device_version: Option<String>,
    pub version_supported: Option<bool>,
}

/// Blank `account_id`/`secret` fall back to the saved credentials; a missing
/// `package_path` means the bundled AltStore package.
#[derive(Clone, Default, Deserialize)]
pub struct InstallRequest {
    pub package_path: Option<String>,
    pub account_id: Option<String>,
    pub secret: Option<String>,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: Device,
    pub version: Option<String>,
    pub version_supported: Option<bool>,
    pub needs_pairing: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunk {
    pub text: String,
    pub next_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("user@example.com", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Installing.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn transport_serializes_snake_case() {
        let device = Device {
            identifier: "00008030-001".to_string(),
            transport: Transport::Alternate,
        };
        let value = serde_json::to_value(&device).expect("json");
        assert_eq!(value["transport"], "alternate");
        assert!(device.is_found());
        assert!(!Device::none().is_found());
    }
}
