use tracing::{info, warn};

use crate::app::config::Timeouts;
use crate::app::error::AppError;
use crate::app::process::runner::{CommandRunner, CommandSpec};

/// Host daemons that own the local device socket, in the order they are tried.
pub const HOST_TRANSPORT_UNITS: [&str; 2] = ["lockdownd", "usbmuxd"];

/// Restarts the host-side transport daemon. The first unit that restarts
/// cleanly wins; returns its name.
pub fn restart_host_transport(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    trace_id: &str,
) -> Result<String, AppError> {
    let mut last_tail = String::new();
    for unit in HOST_TRANSPORT_UNITS {
        let spec = CommandSpec::new("systemctl", &["restart", unit], timeouts.host_restart);
        let output = match runner.run(&spec, trace_id) {
            Ok(output) => output,
            Err(err) if err.is_timeout() => {
                return Err(AppError::timeout(
                    format!("Timed out restarting {unit}"),
                    trace_id,
                ));
            }
            Err(err) => {
                return Err(AppError::dependency(
                    format!("systemctl is unavailable: {}", err.error),
                    trace_id,
                ));
            }
        };
        if output.success() {
            info!(trace_id = %trace_id, unit, "host transport restarted");
            return Ok(unit.to_string());
        }
        warn!(trace_id = %trace_id, unit, exit_code = ?output.exit_code, "unit restart failed");
        last_tail = output.tail(300).trim().to_string();
    }
    Err(AppError::dependency(
        format!("Failed to restart lockdownd/usbmuxd: {last_tail}"),
        trace_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::{ERR_DEPENDENCY, ERR_TIMEOUT};
    use crate::app::process::runner::CommandOutput;
    use std::sync::Mutex;

    struct Scripted {
        results: Mutex<Vec<Result<CommandOutput, AppError>>>,
        units: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<CommandOutput, AppError>>) -> Self {
            Self {
                results: Mutex::new(results),
                units: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, spec: &CommandSpec, _trace_id: &str) -> Result<CommandOutput, AppError> {
            self.units.lock().expect("units").push(spec.args[1].clone());
            self.results.lock().expect("results").remove(0)
        }
    }

    fn exit(code: i32, stderr: &str) -> Result<CommandOutput, AppError> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        })
    }

    #[test]
    fn falls_through_to_second_unit() {
        let runner = Scripted::new(vec![exit(5, "Unit lockdownd.service not found."), exit(0, "")]);
        let unit = restart_host_transport(&runner, &Timeouts::default(), "t").expect("restart");
        assert_eq!(unit, "usbmuxd");
        assert_eq!(*runner.units.lock().expect("units"), vec!["lockdownd", "usbmuxd"]);
    }

    #[test]
    fn reports_last_failure_output() {
        let runner = Scripted::new(vec![exit(5, "first"), exit(1, "Access denied")]);
        let err = restart_host_transport(&runner, &Timeouts::default(), "t").expect_err("fails");
        assert_eq!(err.code, ERR_DEPENDENCY);
        assert!(err.error.contains("Access denied"));
    }

    #[test]
    fn timeout_stops_immediately() {
        let runner = Scripted::new(vec![Err(AppError::timeout("slow", "t"))]);
        let err = restart_host_transport(&runner, &Timeouts::default(), "t").expect_err("fails");
        assert_eq!(err.code, ERR_TIMEOUT);
        assert_eq!(runner.units.lock().expect("units").len(), 1);
    }
}
