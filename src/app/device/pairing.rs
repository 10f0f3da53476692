use tracing::info;

use crate::app::config::{Timeouts, DEVICE_PAIR_PROGRAM};
use crate::app::error::AppError;
use crate::app::log_sink::LogSink;
use crate::app::process::runner::{CommandRunner, CommandSpec};

/// True when the host holds no valid pairing record for the attached device.
/// Timeouts and launch failures count as "needs pairing".
pub fn needs_pairing(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    log_sink: Option<&LogSink>,
    trace_id: &str,
) -> bool {
    let spec = CommandSpec::new(DEVICE_PAIR_PROGRAM, &["validate"], timeouts.pair_validate);
    let note = |message: String| {
        info!(trace_id = %trace_id, "{message}");
        if let Some(sink) = log_sink {
            sink.note(&message);
        }
    };
    match runner.run(&spec, trace_id) {
        Ok(output) if output.success() => false,
        Ok(output) => {
            note(format!(
                "paircheck: not paired (rc={:?}) output_tail={:?}",
                output.exit_code,
                output.tail(200)
            ));
            true
        }
        Err(err) if err.is_timeout() => {
            note("paircheck: timed out; treating as not paired".to_string());
            true
        }
        Err(err) => {
            note(format!("paircheck: failed: {err}; treating as not paired"));
            true
        }
    }
}

pub fn pair_device(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    trace_id: &str,
) -> Result<(), AppError> {
    let spec = CommandSpec::new(DEVICE_PAIR_PROGRAM, &["pair"], timeouts.pair);
    let output = runner.run(&spec, trace_id)?;
    if output.success() {
        info!(trace_id = %trace_id, "device paired");
        return Ok(());
    }
    Err(AppError::dependency(
        format!("Pairing failed: {}", output.tail(250).trim()),
        trace_id,
    ))
}
