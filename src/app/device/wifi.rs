use tracing::{info, warn};

use crate::app::config::{Timeouts, WIFI_SYNC_PROGRAM};
use crate::app::error::AppError;
use crate::app::models::Device;
use crate::app::process::runner::{CommandRunner, CommandSpec};

fn wifi_sync_spec(identifier: &str, timeouts: &Timeouts) -> CommandSpec {
    CommandSpec::new(
        WIFI_SYNC_PROGRAM,
        &[
            "lockdown",
            "wifi-connections",
            "--state",
            "on",
            "--udid",
            identifier,
        ],
        timeouts.wifi_sync,
    )
}

/// Turns on "sync over Wi-Fi" for `device` so it stays reachable through the
/// alternate transport once the cable is unplugged.
pub fn enable_wifi_sync(
    runner: &dyn CommandRunner,
    timeouts: &Timeouts,
    device: &Device,
    trace_id: &str,
) -> Result<(), AppError> {
    if !device.is_found() {
        return Err(AppError::device_not_found(trace_id));
    }
    let spec = wifi_sync_spec(&device.identifier, timeouts);
    let output = runner.run(&spec, trace_id)?;
    if output.success() {
        info!(trace_id = %trace_id, device = %device.identifier, "wifi sync enabled");
        return Ok(());
    }
    let stderr = output.stderr.trim();
    let details = if stderr.is_empty() {
        "Unknown error".to_string()
    } else {
        let count = stderr.chars().count();
        stderr.chars().skip(count.saturating_sub(250)).collect()
    };
    warn!(
        trace_id = %trace_id,
        exit_code = ?output.exit_code,
        "wifi sync command failed"
    );
    Err(AppError::dependency(
        format!("Could not enable WiFi Sync: {details}"),
        trace_id,
    ))
}
