use std::sync::{Arc, Mutex};

use crate::app::config::{load_settings, AppPaths, Settings, Timeouts};
use crate::app::credentials::CredentialStore;
use crate::app::device::locator::DeviceLocator;
use crate::app::dispatch::UiDispatcher;
use crate::app::install::driver::InstallProtocolDriver;
use crate::app::install::markers::LineParser;
use crate::app::install::queue::InstallQueueManager;
use crate::app::install::runner::{HelperTaskRunner, InstallerLauncher, SystemLauncher};
use crate::app::log_sink::LogSink;
use crate::app::process::control::{ProcessControl, SystemProcesses};
use crate::app::process::runner::{CommandRunner, SystemRunner};
use crate::app::services::descriptor::standard_descriptors;
use crate::app::services::supervisor::ServiceSupervisor;

/// External collaborators; swapped for fakes in tests.
pub struct Backends {
    pub runner: Arc<dyn CommandRunner>,
    pub processes: Arc<dyn ProcessControl>,
    pub launcher: Arc<dyn InstallerLauncher>,
    pub dispatcher: Arc<dyn UiDispatcher>,
    pub credentials: Arc<dyn CredentialStore>,
}

pub struct AppState {
    pub paths: AppPaths,
    pub timeouts: Timeouts,
    pub runner: Arc<dyn CommandRunner>,
    pub log_sink: Arc<LogSink>,
    pub locator: Arc<DeviceLocator>,
    pub supervisor: ServiceSupervisor,
    pub queue: InstallQueueManager,
    pub credentials: Arc<dyn CredentialStore>,
    pub settings: Mutex<Settings>,
}

impl AppState {
    pub fn new(
        paths: AppPaths,
        dispatcher: Arc<dyn UiDispatcher>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let timeouts = Timeouts::default();
        let log_sink = Arc::new(LogSink::new(paths.log_file()));
        let backends = Backends {
            runner: Arc::new(SystemRunner),
            processes: Arc::new(SystemProcesses),
            launcher: Arc::new(SystemLauncher::new(
                Some(Arc::clone(&log_sink)),
                timeouts.terminate_grace,
            )),
            dispatcher,
            credentials,
        };
        Self::assemble(paths, timeouts, log_sink, backends)
    }

    pub fn assemble(
        paths: AppPaths,
        timeouts: Timeouts,
        log_sink: Arc<LogSink>,
        backends: Backends,
    ) -> Self {
        let locator = Arc::new(
            DeviceLocator::new(Arc::clone(&backends.runner), timeouts.clone())
                .with_log_sink(Arc::clone(&log_sink)),
        );
        let supervisor = ServiceSupervisor::new(
            standard_descriptors(
                &paths,
                &timeouts,
                Arc::clone(&backends.runner),
                Arc::clone(&backends.processes),
                Arc::clone(&locator),
            ),
            backends.processes,
            timeouts.clone(),
        )
        .with_log_sink(Arc::clone(&log_sink));
        let driver = InstallProtocolDriver::new(
            Arc::new(LineParser::default()),
            Arc::clone(&backends.dispatcher),
            timeouts.helper_exit,
        )
        .with_log_sink(Arc::clone(&log_sink));
        let task_runner = HelperTaskRunner::new(
            Arc::clone(&locator),
            paths.clone(),
            driver,
            backends.launcher,
        );
        let queue = InstallQueueManager::with_log_sink(
            Arc::new(task_runner),
            backends.dispatcher,
            Arc::clone(&log_sink),
        );
        let settings = load_settings(&paths);
        Self {
            paths,
            timeouts,
            runner: backends.runner,
            log_sink,
            locator,
            supervisor,
            queue,
            credentials: backends.credentials,
            settings: Mutex::new(settings),
        }
    }
}
