use std::sync::Arc;

use tracing::{debug, info};

use crate::app::config::{
    Timeouts, ALTERNATE_SOCKET_ADDRESS, DEVICE_ID_PROGRAM, DEVICE_INFO_PROGRAM, SOCKET_ADDRESS_ENV,
};
use crate::app::device::parse::{parse_identifier_list, parse_product_version};
use crate::app::log_sink::LogSink;
use crate::app::models::{Device, DeviceListing, Transport};
use crate::app::process::runner::{CommandRunner, CommandSpec};

pub const UNKNOWN_VERSION: &str = "0.0";

/// Finds the connected device, preferring the direct socket over the
/// alternate socket that proxies network-connected devices.
pub struct DeviceLocator {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
    log_sink: Option<Arc<LogSink>>,
}

impl DeviceLocator {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self {
            runner,
            timeouts,
            log_sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    fn record(&self, trace_id: &str, message: &str) {
        debug!(trace_id = %trace_id, "{message}");
        if let Some(sink) = &self.log_sink {
            sink.note(message);
        }
    }

    pub fn local_discovery_spec(&self) -> CommandSpec {
        CommandSpec::new(DEVICE_ID_PROGRAM, &["-l"], self.timeouts.discovery)
            .without_env(SOCKET_ADDRESS_ENV)
    }

    pub fn alternate_discovery_spec(&self) -> CommandSpec {
        CommandSpec::new(DEVICE_ID_PROGRAM, &["-n", "-l"], self.timeouts.discovery)
            .with_env(SOCKET_ADDRESS_ENV, ALTERNATE_SOCKET_ADDRESS)
    }

    fn discover(&self, spec: &CommandSpec, trace_id: &str) -> Vec<String> {
        match self.runner.run(spec, trace_id) {
            Ok(output) if output.success() => parse_identifier_list(&output.stdout),
            Ok(output) => {
                self.record(
                    trace_id,
                    &format!(
                        "discovery: {} failed rc={:?} output_tail={:?}",
                        spec.display(),
                        output.exit_code,
                        output.tail(200)
                    ),
                );
                Vec::new()
            }
            Err(err) => {
                self.record(
                    trace_id,
                    &format!("discovery: {} failed: {}", spec.display(), err),
                );
                Vec::new()
            }
        }
    }

    pub fn local_identifiers(&self, trace_id: &str) -> Vec<String> {
        self.discover(&self.local_discovery_spec(), trace_id)
    }

    pub fn alternate_identifiers(&self, trace_id: &str) -> Vec<String> {
        self.discover(&self.alternate_discovery_spec(), trace_id)
    }

    /// Never fails: `Transport::None` with an empty identifier means nothing answered.
    pub fn resolve(&self, trace_id: &str) -> Device {
        if let Some(identifier) = self.local_identifiers(trace_id).into_iter().next() {
            info!(trace_id = %trace_id, identifier = %identifier, "device found on local transport");
            return Device {
                identifier,
                transport: Transport::Local,
            };
        }
        if let Some(identifier) = self.alternate_identifiers(trace_id).into_iter().next() {
            info!(trace_id = %trace_id, identifier = %identifier, "device found on alternate transport");
            return Device {
                identifier,
                transport: Transport::Alternate,
            };
        }
        self.record(trace_id, "discovery: no device on either transport");
        Device::none()
    }

    /// Both transports, with alternate entries that are also directly attached removed.
    pub fn list_devices(&self, trace_id: &str) -> DeviceListing {
        let local = self.local_identifiers(trace_id);
        let alternate = self
            .alternate_identifiers(trace_id)
            .into_iter()
            .filter(|identifier| !local.contains(identifier))
            .collect();
        DeviceListing { local, alternate }
    }

    pub fn version_attempts(&self, device: &Device) -> Vec<(&'static str, CommandSpec)> {
        let timeout = self.timeouts.version_probe;
        let mut selector = Vec::new();
        if !device.identifier.is_empty() {
            selector.push("-u");
            selector.push(device.identifier.as_str());
        }
        let build = |network: bool, tail: &[&str]| {
            let mut args: Vec<&str> = Vec::new();
            if network {
                args.push("-n");
            }
            args.extend(selector.iter().copied());
            args.extend(tail.iter().copied());
            let spec = CommandSpec::new(DEVICE_INFO_PROGRAM, &args, timeout);
            if network {
                spec.with_env(SOCKET_ADDRESS_ENV, ALTERNATE_SOCKET_ADDRESS)
            } else {
                spec.without_env(SOCKET_ADDRESS_ENV)
            }
        };
        vec![
            ("direct-key", build(false, &["-k", "ProductVersion"])),
            ("direct-full", build(false, &["-s"])),
            ("alternate-key", build(true, &["-k", "ProductVersion"])),
            ("alternate-full", build(true, &["-s"])),
        ]
    }

    /// First parseable version wins; `"0.0"` when every attempt fails.
    pub fn resolve_version(&self, device: &Device, trace_id: &str) -> String {
        for (mode, spec) in self.version_attempts(device) {
            match self.runner.run(&spec, trace_id) {
                Ok(output) if output.success() => {
                    if let Some(version) = parse_product_version(&output.combined()) {
                        info!(trace_id = %trace_id, mode, version = %version, "device version resolved");
                        return version;
                    }
                    self.record(
                        trace_id,
                        &format!(
                            "version: ({mode}) could not parse ProductVersion from output_tail={:?}",
                            output.tail(200)
                        ),
                    );
                }
                Ok(output) => {
                    self.record(
                        trace_id,
                        &format!(
                            "version: ({mode}) rc={:?} output_tail={:?}",
                            output.exit_code,
                            output.tail(200)
                        ),
                    );
                }
                Err(err) => {
                    self.record(trace_id, &format!("version: ({mode}) failed: {err}"));
                }
            }
        }
        self.record(trace_id, "version: failed to detect ProductVersion, defaulting to 0.0");
        UNKNOWN_VERSION.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::AppError;
    use crate::app::process::runner::CommandOutput;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, AppError> + Send + Sync>;

    struct FakeRunner {
        respond: Responder,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl FakeRunner {
        fn new(
            respond: impl Fn(&CommandSpec) -> Result<CommandOutput, AppError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec, _trace_id: &str) -> Result<CommandOutput, AppError> {
            self.calls.lock().expect("calls").push(spec.clone());
            (self.respond)(spec)
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, AppError> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    fn failed(code: i32, stderr: &str) -> Result<CommandOutput, AppError> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        })
    }

    fn is_alternate(spec: &CommandSpec) -> bool {
        spec.args.iter().any(|arg| arg == "-n")
    }

    fn locator(runner: Arc<FakeRunner>) -> DeviceLocator {
        DeviceLocator::new(runner, Timeouts::default())
    }

    #[test]
    fn prefers_local_when_both_transports_answer() {
        let runner = FakeRunner::new(|spec| {
            if is_alternate(spec) {
                ok("NET-UDID (Network)\n")
            } else {
                ok("USB-UDID\n")
            }
        });
        let device = locator(Arc::clone(&runner)).resolve("trace");
        assert_eq!(device.transport, Transport::Local);
        assert_eq!(device.identifier, "USB-UDID");
        assert_eq!(runner.calls().len(), 1, "alternate should not be queried");
    }

    #[test]
    fn falls_back_to_alternate_socket() {
        let runner = FakeRunner::new(|spec| {
            if is_alternate(spec) {
                assert_eq!(spec.env_value(SOCKET_ADDRESS_ENV), Some(ALTERNATE_SOCKET_ADDRESS));
                ok("NET-UDID (Network)\nOTHER\n")
            } else {
                ok("\n")
            }
        });
        let device = locator(runner).resolve("trace");
        assert_eq!(
            device,
            Device {
                identifier: "NET-UDID".to_string(),
                transport: Transport::Alternate,
            }
        );
    }

    #[test]
    fn timeouts_and_spawn_failures_mean_no_device() {
        let runner = FakeRunner::new(|spec| {
            if is_alternate(spec) {
                Err(AppError::timeout("idevice_id timed out", "trace"))
            } else {
                Err(AppError::spawn("idevice_id missing", "trace"))
            }
        });
        let device = locator(runner).resolve("trace");
        assert_eq!(device, Device::none());
        assert!(!device.is_found());
    }

    #[test]
    fn nonzero_exit_is_treated_as_empty() {
        let runner = FakeRunner::new(|spec| {
            if is_alternate(spec) {
                failed(1, "ERROR: Unable to retrieve device list!")
            } else {
                Ok(CommandOutput {
                    stdout: "STALE-UDID\n".to_string(),
                    stderr: String::new(),
                    exit_code: Some(255),
                })
            }
        });
        assert_eq!(locator(runner).resolve("trace"), Device::none());
    }

    #[test]
    fn list_devices_dedupes_alternate_against_local() {
        let runner = FakeRunner::new(|spec| {
            if is_alternate(spec) {
                ok("USB-UDID (Network)\nNET-ONLY (Network)\n")
            } else {
                ok("USB-UDID\n")
            }
        });
        let listing = locator(runner).list_devices("trace");
        assert_eq!(listing.local, vec!["USB-UDID"]);
        assert_eq!(listing.alternate, vec!["NET-ONLY"]);
    }

    #[test]
    fn version_attempts_follow_priority_order() {
        let runner = FakeRunner::new(|_| ok(""));
        let device = Device {
            identifier: "UDID".to_string(),
            transport: Transport::Local,
        };
        let attempts = locator(runner).version_attempts(&device);
        let modes: Vec<_> = attempts.iter().map(|(mode, _)| *mode).collect();
        assert_eq!(modes, vec!["direct-key", "direct-full", "alternate-key", "alternate-full"]);
        assert_eq!(attempts[0].1.args, vec!["-u", "UDID", "-k", "ProductVersion"]);
        assert_eq!(attempts[3].1.args, vec!["-n", "-u", "UDID", "-s"]);
        assert_eq!(attempts[3].1.env_value(SOCKET_ADDRESS_ENV), Some(ALTERNATE_SOCKET_ADDRESS));
    }

    #[test]
    fn resolve_version_takes_first_parseable_attempt() {
        let runner = FakeRunner::new(|spec| {
            let network = is_alternate(spec);
            let full = spec.args.iter().any(|arg| arg == "-s");
            match (network, full) {
                (false, false) => failed(1, "No device found"),
                (false, true) => ok("DeviceName: iPhone\n"),
                (true, false) => ok("16.7.2\n"),
                (true, true) => ok("ProductVersion: 99.0\n"),
            }
        });
        let device = Device {
            identifier: "UDID".to_string(),
            transport: Transport::Alternate,
        };
        assert_eq!(locator(Arc::clone(&runner)).resolve_version(&device, "trace"), "16.7.2");
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn resolve_version_defaults_to_sentinel() {
        let runner = FakeRunner::new(|_| Err(AppError::timeout("ideviceinfo timed out", "trace")));
        let version = locator(Arc::clone(&runner)).resolve_version(&Device::none(), "trace");
        assert_eq!(version, UNKNOWN_VERSION);
        assert_eq!(runner.calls().len(), 4);
        assert!(runner.calls().iter().all(|spec| !spec.args.contains(&"-u".to_string())));
    }

    #[test]
    fn recovered_failures_are_written_to_log_sink() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let sink = Arc::new(LogSink::new(tmp.path().join("althea.log")));
        let runner = FakeRunner::new(|_| Err(AppError::spawn("idevice_id missing", "trace")));
        let locator = DeviceLocator::new(runner, Timeouts::default()).with_log_sink(Arc::clone(&sink));
        locator.resolve("trace");
        let text = sink.read_since(0).expect("read").text;
        assert!(text.contains("idevice_id missing"));
        assert!(text.contains("no device on either transport"));
    }
}
