use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::config::{save_settings, Settings, StartupMode, MINIMUM_SUPPORTED_VERSION};
use crate::app::credentials::{
    forget_credentials, has_saved_credentials, load_saved_credentials, save_credentials,
};
use crate::app::device::pairing::{needs_pairing, pair_device as run_pair_device};
use crate::app::device::parse::is_supported_version;
use crate::app::device::wifi;
use crate::app::error::AppError;
use crate::app::install::task::InstallTask;
use crate::app::models::{
    CommandResponse, Credentials, DeviceListing, DeviceReport, InstallRequest,
    InstallRequestResult, LogChunk, ServiceStatus, TaskSnapshot,
};
use crate::app::services::descriptor::ServiceKind;
use crate::app::services::host;
use crate::app::services::supervisor::StartupReport;
use crate::app::state::AppState;


/// Upper bound for a single log read so the viewer never pulls the whole file.
pub const LOG_TAIL_MAX_BYTES: u64 = 256 * 1024;

fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn respond<T>(trace_id: String, data: T) -> Result<CommandResponse<T>, AppError> {
    Ok(CommandResponse { trace_id, data })
}

fn resolve_credentials(
    state: &AppState,
    request: &InstallRequest,
    trace_id: &str,
) -> Result<Credentials, AppError> {
    let account_id = non_blank(request.account_id.clone());
    let secret = request.secret.clone().filter(|value| !value.is_empty());
    if account_id.is_none() && secret.is_none() {
        return load_saved_credentials(state.credentials.as_ref()).ok_or_else(|| {
            AppError::validation("account_id is required (no saved credentials)", trace_id)
        });
    }
    let account_id = account_id.unwrap_or_default();
    let secret = secret.unwrap_or_default();
    ensure_non_empty(&account_id, "account_id", trace_id)?;
    ensure_non_empty(&secret, "secret", trace_id)?;
    Ok(Credentials::new(account_id.trim(), secret))
}

/// Queues an install. The device and its OS version are probed up front so
/// the caller can warn about unsupported versions; the install is queued either way.
pub fn submit_install(
    state: &AppState,
    request: InstallRequest,
    trace_id: Option<String>,
) -> Result<CommandResponse<InstallRequestResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "submit_install");

    let credentials = resolve_credentials(state, &request, &trace_id)?;
    let package_path = non_blank(request.package_path.clone())
        .unwrap_or_else(|| state.paths.altstore_ipa().to_string_lossy().to_string());
    if !Path::new(&package_path).is_file() {
        return Err(AppError::validation(
            format!("Package not found: {package_path}"),
            &trace_id,
        ));
    }
    if request.remember && !save_credentials(state.credentials.as_ref(), &credentials) {
        state.log_sink.note("credentials: failed to save to store");
    }

    let device = state.locator.resolve(&trace_id);
    let (device_version, version_supported) = if device.is_found() {
        let version = state.locator.resolve_version(&device, &trace_id);
        let supported = is_supported_version(&version, MINIMUM_SUPPORTED_VERSION);
        if !supported {
            warn!(trace_id = %trace_id, version = %version, "device version below supported minimum");
            state.log_sink.note(&format!(
                "version: iOS {version} is below {MINIMUM_SUPPORTED_VERSION}; install may fail"
            ));
        }
        (Some(version), Some(supported))
    } else {
        (None, None)
    };

    let task_id = state
        .queue
        .enqueue(InstallTask::new(package_path, credentials));
    respond(
        trace_id,
        InstallRequestResult {
            task_id,
            device_version,
            version_supported,
        },
    )
}

pub fn check_device(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<DeviceReport>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "check_device");
    let device = state.locator.resolve(&trace_id);
    if !device.is_found() {
        return respond(
            trace_id,
            DeviceReport {
                device,
                version: None,
                version_supported: None,
                needs_pairing: None,
            },
        );
    }
    let version = state.locator.resolve_version(&device, &trace_id);
    let version_supported = is_supported_version(&version, MINIMUM_SUPPORTED_VERSION);
    let unpaired = needs_pairing(
        state.runner.as_ref(),
        &state.timeouts,
        Some(state.log_sink.as_ref()),
        &trace_id,
    );
    respond(
        trace_id,
        DeviceReport {
            device,
            version: Some(version),
            version_supported: Some(version_supported),
            needs_pairing: Some(unpaired),
        },
    )
}

pub fn list_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<DeviceListing>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "list_devices");
    let listing = state.locator.list_devices(&trace_id);
    respond(trace_id, listing)
}

pub fn pair_device(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "pair_device");
    run_pair_device(state.runner.as_ref(), &state.timeouts, &trace_id)?;
    respond(trace_id, ())
}

/// Enables sync over Wi-Fi on the resolved device (USB first, then network).
pub fn enable_wifi_sync(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<String>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "enable_wifi_sync");
    let device = state.locator.resolve(&trace_id);
    wifi::enable_wifi_sync(state.runner.as_ref(), &state.timeouts, &device, &trace_id)?;
    respond(trace_id, device.identifier)
}

pub fn get_install_queue(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<TaskSnapshot>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    respond(trace_id, state.queue.snapshot())
}

pub fn move_install_up(
    state: &AppState,
    task_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&task_id, "task_id", &trace_id)?;
    let moved = state.queue.move_up(&task_id);
    respond(trace_id, moved)
}

pub fn move_install_down(
    state: &AppState,
    task_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&task_id, "task_id", &trace_id)?;
    let moved = state.queue.move_down(&task_id);
    respond(trace_id, moved)
}

pub fn cancel_install(
    state: &AppState,
    task_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, task_id = %task_id, "cancel_install");
    ensure_non_empty(&task_id, "task_id", &trace_id)?;
    let canceled = state.queue.cancel(&task_id);
    respond(trace_id, canceled)
}

pub fn clear_finished_installs(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<usize>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    respond(trace_id, state.queue.clear_finished())
}

pub fn start_services(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<StartupReport>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "start_services");
    let report = state
        .supervisor
        .start_all(state.timeouts.service_start, &trace_id);
    respond(trace_id, report)
}

pub fn get_service_statuses(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<ServiceStatus>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let statuses = state.supervisor.service_statuses(&trace_id);
    respond(trace_id, statuses)
}

pub fn restart_service(
    state: &AppState,
    kind: ServiceKind,
    trace_id: Option<String>,
) -> Result<CommandResponse<ServiceStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, service = kind.name(), "restart_service");
    state.supervisor.restart(kind, &trace_id)?;
    state
        .supervisor
        .wait_ready(kind, state.timeouts.service_start, &trace_id);
    let status = state.supervisor.status(kind, &trace_id);
    respond(trace_id, status)
}

pub fn recover_anisette(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "recover_anisette");
    state
        .supervisor
        .recover_anisette(state.timeouts.service_start, &trace_id)?;
    respond(trace_id, ())
}

pub fn stop_services(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<usize>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "stop_services");
    let killed = state.supervisor.stop_all(&trace_id);
    respond(trace_id, killed)
}

pub fn restart_host_transport(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<String>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "restart_host_transport");
    let unit = host::restart_host_transport(state.runner.as_ref(), &state.timeouts, &trace_id)
        .map_err(|err| {
            state
                .log_sink
                .note(&format!("host transport restart failed: {}", err.error));
            err
        })?;
    respond(trace_id, unit)
}

pub fn get_settings(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Settings>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let settings = state
        .settings
        .lock()
        .map_err(|_| AppError::system("Settings lock poisoned", &trace_id))?
        .clone();
    respond(trace_id, settings)
}

pub fn set_startup_mode(
    state: &AppState,
    mode: StartupMode,
    trace_id: Option<String>,
) -> Result<CommandResponse<Settings>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, mode = ?mode, "set_startup_mode");
    let mut guard = state
        .settings
        .lock()
        .map_err(|_| AppError::system("Settings lock poisoned", &trace_id))?;
    let mut updated = guard.clone();
    updated.startup_mode = mode;
    save_settings(&state.paths, &updated).map_err(|err| AppError::system(err.error, &trace_id))?;
    *guard = updated.clone();
    respond(trace_id, updated)
}

pub fn read_log(
    state: &AppState,
    offset: Option<u64>,
    trace_id: Option<String>,
) -> Result<CommandResponse<LogChunk>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let chunk = match offset {
        Some(offset) => state.log_sink.read_since(offset),
        None => state.log_sink.tail(LOG_TAIL_MAX_BYTES),
    }
    .map_err(|err| AppError::system(err.error, &trace_id))?;
    respond(trace_id, chunk)
}

pub fn get_saved_credentials_status(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    respond(trace_id, has_saved_credentials(state.credentials.as_ref()))
}

pub fn forget_saved_credentials(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "forget_saved_credentials");
    forget_credentials(state.credentials.as_ref());
    respond(trace_id, ())
}
