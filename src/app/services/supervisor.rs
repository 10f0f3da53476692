use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::config::Timeouts;
use crate::app::error::AppError;
use crate::app::log_sink::LogSink;
use crate::app::models::ServiceStatus;
use crate::app::process::control::ProcessControl;
use crate::app::process::poll::poll_until;
use crate::app::services::descriptor::{ServiceDescriptor, ServiceKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupReport {
    pub services: Vec<ServiceStatus>,
    pub all_ready: bool,
}

impl StartupReport {
    pub fn ready(&self, kind: ServiceKind) -> bool {
        self.services
            .iter()
            .any(|status| status.name == kind.name() && status.ready)
    }
}

/// Keeps the background services alive. Every operation is safe to call from
/// any worker thread; the supervisor holds no mutable state of its own.
pub struct ServiceSupervisor {
    descriptors: Vec<ServiceDescriptor>,
    processes: Arc<dyn ProcessControl>,
    timeouts: Timeouts,
    log_sink: Option<Arc<LogSink>>,
}

impl ServiceSupervisor {
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        processes: Arc<dyn ProcessControl>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            descriptors,
            processes,
            timeouts,
            log_sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn descriptor(&self, kind: ServiceKind) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().find(|d| d.kind == kind)
    }

    fn require(&self, kind: ServiceKind, trace_id: &str) -> Result<&ServiceDescriptor, AppError> {
        self.descriptor(kind).ok_or_else(|| {
            AppError::system(format!("No descriptor registered for {}", kind.name()), trace_id)
        })
    }

    fn record(&self, trace_id: &str, message: &str) {
        warn!(trace_id = %trace_id, "{message}");
        if let Some(sink) = &self.log_sink {
            sink.note(message);
        }
    }

    pub fn readiness_probe(&self, kind: ServiceKind, trace_id: &str) -> bool {
        match self.descriptor(kind) {
            Some(descriptor) => (descriptor.readiness_probe)(trace_id),
            None => false,
        }
    }

    /// Returns `Ok(true)` when a fresh instance was spawned, `Ok(false)` when
    /// the service was already ready and nothing was touched.
    pub fn ensure_running(&self, kind: ServiceKind, trace_id: &str) -> Result<bool, AppError> {
        let descriptor = self.require(kind, trace_id)?;
        if (descriptor.readiness_probe)(trace_id) {
            debug!(trace_id = %trace_id, service = descriptor.name(), "service already ready");
            return Ok(false);
        }
        self.spawn_fresh(descriptor, trace_id)?;
        Ok(true)
    }

    pub fn restart(&self, kind: ServiceKind, trace_id: &str) -> Result<(), AppError> {
        let descriptor = self.require(kind, trace_id)?;
        self.spawn_fresh(descriptor, trace_id).map(|_| ())
    }

    fn spawn_fresh(&self, descriptor: &ServiceDescriptor, trace_id: &str) -> Result<u32, AppError> {
        if !descriptor.binary_present() {
            let message = format!(
                "{} binary not found at {}",
                descriptor.name(),
                descriptor.binary_path.display()
            );
            self.record(trace_id, &message);
            return Err(AppError::spawn(message, trace_id));
        }
        let signature = descriptor.signature();
        self.processes.kill_matching(&signature);
        let env = (descriptor.spawn_env)(trace_id);
        let pid = self
            .processes
            .spawn_detached(&signature, &descriptor.spawn_args, &env, trace_id)
            .map_err(|err| {
                self.record(trace_id, &format!("{}: spawn failed: {}", descriptor.name(), err));
                err
            })?;
        info!(trace_id = %trace_id, service = descriptor.name(), pid, "service spawned");
        Ok(pid)
    }

    pub fn wait_ready(&self, kind: ServiceKind, deadline: Duration, trace_id: &str) -> bool {
        let Some(descriptor) = self.descriptor(kind) else {
            return false;
        };
        let ready = poll_until(
            || (descriptor.readiness_probe)(trace_id),
            self.timeouts.readiness_poll_interval,
            deadline,
        );
        if !ready {
            self.record(
                trace_id,
                &format!("{}: not ready after {:?}", descriptor.name(), deadline),
            );
        }
        ready
    }

    /// Ensures the service and waits for it; spawn failures report not-ready.
    fn bring_up(&self, kind: ServiceKind, deadline: Duration, trace_id: &str) -> bool {
        match self.ensure_running(kind, trace_id) {
            Ok(false) => true,
            Ok(true) => self.wait_ready(kind, deadline, trace_id),
            Err(_) => false,
        }
    }

    pub fn stop_all(&self, trace_id: &str) -> usize {
        let killed: usize = self
            .descriptors
            .iter()
            .rev()
            .map(|descriptor| self.processes.kill_matching(&descriptor.signature()))
            .sum();
        info!(trace_id = %trace_id, killed, "services stopped");
        killed
    }

    fn status_with(&self, kind: ServiceKind, ready: bool) -> ServiceStatus {
        let (binary_path, binary_present) = match self.descriptor(kind) {
            Some(descriptor) => (descriptor.signature(), descriptor.binary_present()),
            None => (String::new(), false),
        };
        ServiceStatus {
            name: kind.name().to_string(),
            binary_path,
            binary_present,
            ready,
        }
    }

    pub fn status(&self, kind: ServiceKind, trace_id: &str) -> ServiceStatus {
        self.status_with(kind, self.readiness_probe(kind, trace_id))
    }

    pub fn service_statuses(&self, trace_id: &str) -> Vec<ServiceStatus> {
        ServiceKind::ALL
            .iter()
            .map(|kind| self.status(*kind, trace_id))
            .collect()
    }

    /// Startup order: attestation service first (slowest to come up), then the
    /// multiplexer, then the helper daemon, then a final attestation wait.
    pub fn start_all(&self, deadline: Duration, trace_id: &str) -> StartupReport {
        let anisette_spawned = self.ensure_running(ServiceKind::Anisette, trace_id).is_ok();
        let multiplexer_ready = self.bring_up(ServiceKind::Multiplexer, deadline, trace_id);
        let helper_ready = self.ensure_running(ServiceKind::Helper, trace_id).is_ok()
            && self.readiness_probe(ServiceKind::Helper, trace_id);
        let anisette_ready =
            anisette_spawned && self.wait_ready(ServiceKind::Anisette, deadline, trace_id);

        let services = vec![
            self.status_with(ServiceKind::Anisette, anisette_ready),
            self.status_with(ServiceKind::Multiplexer, multiplexer_ready),
            self.status_with(ServiceKind::Helper, helper_ready),
        ];
        let all_ready = services.iter().all(|status| status.ready);
        info!(
            trace_id = %trace_id,
            anisette = anisette_ready,
            multiplexer = multiplexer_ready,
            helper = helper_ready,
            "startup sequence finished"
        );
        StartupReport { services, all_ready }
    }

    /// Restart-and-retry for an unreachable attestation service. The helper
    /// caches the attestation endpoint, so it is re-ensured afterwards.
    pub fn recover_anisette(&self, deadline: Duration, trace_id: &str) -> Result<(), AppError> {
        self.restart(ServiceKind::Anisette, trace_id)?;
        if !self.wait_ready(ServiceKind::Anisette, deadline, trace_id) {
            return Err(AppError::service_unreachable(
                ServiceKind::Anisette.name(),
                trace_id,
            ));
        }
        self.ensure_running(ServiceKind::Helper, trace_id)?;
        Ok(())
    }
}
