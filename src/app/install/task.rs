use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app::install::process::ProcessHandle;
use crate::app::models::{Credentials, TaskSnapshot, TaskStatus};

/// One-way cancellation latch shared between the queue and the worker driving the task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct InstallTask {
    pub id: String,
    pub package_path: String,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub progress: Option<f64>,
    pub detail: String,
    pub process_handle: Option<ProcessHandle>,
    cancel: CancelFlag,
}

impl InstallTask {
    pub fn new(package_path: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            package_path: package_path.into(),
            credentials,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            progress: None,
            detail: String::new(),
            process_handle: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Progress never moves backwards while installing.
    pub fn set_progress(&mut self, progress: Option<f64>) {
        match (self.progress, progress) {
            (Some(current), Some(next)) if next < current && !self.status.is_terminal() => {}
            (_, next) => self.progress = next.or(self.progress),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            package_path: self.package_path.clone(),
            account_id: self.credentials.account_id.clone(),
            created_at: self.created_at.to_rfc3339(),
            status: self.status,
            progress: self.progress,
            detail: self.detail.clone(),
            cancel_requested: self.cancel_requested(),
        }
    }
}
