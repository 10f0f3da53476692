use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::config::{AppPaths, ALTERNATE_SOCKET_ADDRESS, SOCKET_ADDRESS_ENV};
use crate::app::device::locator::DeviceLocator;
use crate::app::error::AppError;
use crate::app::install::driver::{DriverState, DriverUpdate, InstallProtocolDriver};
use crate::app::install::process::{InstallerProcess, SpawnedInstaller};
use crate::app::install::queue::{TaskContext, TaskRunner};
use crate::app::log_sink::LogSink;
use crate::app::models::{Device, Transport};
use crate::app::services::descriptor::helper_base_env;

pub trait InstallerLauncher: Send + Sync {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, Option<String>)],
        trace_id: &str,
    ) -> Result<Box<dyn InstallerProcess>, AppError>;
}

pub struct SystemLauncher {
    log_sink: Option<Arc<LogSink>>,
    grace: Duration,
}

impl SystemLauncher {
    pub fn new(log_sink: Option<Arc<LogSink>>, grace: Duration) -> Self {
        Self { log_sink, grace }
    }
}

impl InstallerLauncher for SystemLauncher {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, Option<String>)],
        trace_id: &str,
    ) -> Result<Box<dyn InstallerProcess>, AppError> {
        let process =
            SpawnedInstaller::spawn(program, args, env, self.log_sink.clone(), self.grace, trace_id)?;
        Ok(Box::new(process))
    }
}

/// Environment for a one-shot helper run against `device`.
pub fn helper_env(transport: Transport) -> Vec<(String, Option<String>)> {
    let mut env = helper_base_env();
    let socket = match transport {
        Transport::Alternate => Some(ALTERNATE_SOCKET_ADDRESS.to_string()),
        Transport::Local | Transport::None => None,
    };
    env.push((SOCKET_ADDRESS_ENV.to_string(), socket));
    env
}

/// `None` when any argument is blank; the helper would prompt for it on stdin.
pub fn helper_args(device: &Device, context: &TaskContext) -> Option<Vec<String>> {
    let args = vec![
        "-u".to_string(),
        device.identifier.clone(),
        "-a".to_string(),
        context.credentials.account_id.clone(),
        "-p".to_string(),
        context.credentials.secret.clone(),
        context.package_path.clone(),
    ];
    if args.iter().any(|arg| arg.trim().is_empty()) {
        return None;
    }
    Some(args)
}

fn settled(state: DriverState, detail: &str) -> DriverUpdate {
    DriverUpdate {
        state,
        progress: None,
        detail: detail.to_string(),
    }
}

/// Resolves the device, launches the helper with the matching transport and
/// hands it to the protocol driver.
pub struct HelperTaskRunner {
    locator: Arc<DeviceLocator>,
    paths: AppPaths,
    driver: InstallProtocolDriver,
    launcher: Arc<dyn InstallerLauncher>,
}

impl HelperTaskRunner {
    pub fn new(
        locator: Arc<DeviceLocator>,
        paths: AppPaths,
        driver: InstallProtocolDriver,
        launcher: Arc<dyn InstallerLauncher>,
    ) -> Self {
        Self {
            locator,
            paths,
            driver,
            launcher,
        }
    }

    fn record(context: &TaskContext, message: &str) {
        warn!(trace_id = %context.trace_id, task_id = %context.task_id, "{message}");
        if let Some(sink) = context.log_sink() {
            sink.note(message);
        }
    }
}

impl TaskRunner for HelperTaskRunner {
    fn run(&self, context: &TaskContext) -> DriverUpdate {
        let trace_id = context.trace_id.as_str();
        let device = self.locator.resolve(trace_id);
        if !device.is_found() {
            Self::record(context, "install: no device detected");
            return settled(DriverState::Failed, "No device detected");
        }
        let Some(args) = helper_args(&device, context) else {
            Self::record(context, "install: missing helper arguments");
            return settled(DriverState::Failed, "Missing arguments");
        };
        if context.cancel.is_requested() {
            return settled(DriverState::Canceled, "Canceled");
        }

        context.update(&DriverUpdate {
            state: DriverState::Running,
            progress: None,
            detail: "Running…".to_string(),
        });
        let program = self.paths.altserver().to_string_lossy().to_string();
        let env = helper_env(device.transport);
        info!(
            trace_id = %trace_id,
            task_id = %context.task_id,
            transport = device.transport.label(),
            "launching installer helper"
        );
        let mut process = match self.launcher.launch(&program, &args, &env, trace_id) {
            Ok(process) => process,
            Err(err) => {
                Self::record(context, &format!("install: {}", err.error));
                return settled(DriverState::Failed, "Failed");
            }
        };
        context.attach_process(process.handle());

        let mut forward = |update: &DriverUpdate| context.update(update);
        self.driver.run(
            &context.task_id,
            process.as_mut(),
            &context.cancel,
            &mut forward,
            trace_id,
        )
    }
}
