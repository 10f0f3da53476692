use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use althea_rust_lib::app::commands::{
    check_device, get_install_queue, get_service_statuses, list_devices, start_services,
    stop_services, submit_install,
};
use althea_rust_lib::app::config::AppPaths;
use althea_rust_lib::app::credentials::MemoryCredentialStore;
use althea_rust_lib::app::dispatch::{
    ChannelDispatcher, PromptAnswer, PromptKind, UiInbox, UiMessage,
};
use althea_rust_lib::app::error::{ERR_SYSTEM, ERR_TIMEOUT};
use althea_rust_lib::app::logging::init_logging;
use althea_rust_lib::app::models::{InstallRequest, TaskStatus};
use althea_rust_lib::app::state::AppState;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    data_dir: Option<PathBuf>,
    start_services: bool,
    stop_services: bool,
    ipa: Option<String>,
    account_id: Option<String>,
    confirm: bool,
    code: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    data_dir: String,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

const USAGE: &str = "Usage: cargo run --bin smoke -- [--data-dir DIR] [--start-services] [--stop-services] \
[--ipa PATH] [--account ID] [--confirm] [--code CODE] [--timeout SECS]\n\
The install secret is read from ALTHEA_SECRET.\n";

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        data_dir: None,
        start_services: false,
        stop_services: false,
        ipa: None,
        account_id: None,
        confirm: false,
        code: None,
        timeout: Duration::from_secs(300),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--data-dir" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--data-dir requires a value".to_string())?;
                args.data_dir = Some(PathBuf::from(value));
            }
            "--start-services" => args.start_services = true,
            "--stop-services" => args.stop_services = true,
            "--ipa" => {
                args.ipa = Some(
                    it.next()
                        .ok_or_else(|| "--ipa requires a value".to_string())?,
                );
            }
            "--account" => {
                args.account_id = Some(
                    it.next()
                        .ok_or_else(|| "--account requires a value".to_string())?,
                );
            }
            "--confirm" => args.confirm = true,
            "--code" => {
                args.code = Some(
                    it.next()
                        .ok_or_else(|| "--code requires a value".to_string())?,
                );
            }
            "--timeout" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--timeout requires a value".to_string())?;
                let secs = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid --timeout: {value}"))?;
                args.timeout = Duration::from_secs(secs.max(1));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn record<T: Serialize>(
    checks: &mut Vec<SmokeCheck>,
    name: &'static str,
    start: Instant,
    result: Result<(&'static str, T), (String, String)>,
) -> &'static str {
    let check = match result {
        Ok((status, detail)) => SmokeCheck {
            name,
            status,
            duration_ms: start.elapsed().as_millis(),
            detail: serde_json::to_value(detail).ok(),
            error_code: None,
            error: None,
        },
        Err((code, error)) => SmokeCheck {
            name,
            status: "fail",
            duration_ms: start.elapsed().as_millis(),
            detail: None,
            error_code: Some(code),
            error: Some(error),
        },
    };
    let status = check.status;
    checks.push(check);
    status
}

/// Plays the event loop: prints progress and answers prompts from the flags.
fn pump_until_idle(state: &AppState, inbox: &UiInbox, args: &Args) -> bool {
    let started = Instant::now();
    while started.elapsed() < args.timeout {
        if let Some(message) = inbox.recv_timeout(Duration::from_millis(200)) {
            match message {
                UiMessage::TaskUpdated(task) => {
                    eprintln!("[{}] {} {}", task.status.label(), task.id, task.detail);
                }
                UiMessage::QueueChanged(_) => {}
                UiMessage::Prompt(request) => {
                    let answer = match &request.kind {
                        PromptKind::Confirm { text } => {
                            eprintln!("prompt: {text} -> {}", if args.confirm { "yes" } else { "no" });
                            if args.confirm {
                                PromptAnswer::Yes
                            } else {
                                PromptAnswer::No
                            }
                        }
                        PromptKind::TwoFactorCode => match &args.code {
                            Some(code) => PromptAnswer::Code(code.clone()),
                            None => PromptAnswer::Dismissed,
                        },
                    };
                    request.responder.respond(answer);
                }
            }
        }
        if state.queue.is_idle() {
            return true;
        }
    }
    false
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_logging();

    let trace_id = Uuid::new_v4().to_string();
    let paths = args
        .data_dir
        .clone()
        .map(AppPaths::new)
        .unwrap_or_else(AppPaths::resolve);
    let (dispatcher, inbox) = ChannelDispatcher::new();
    let state = AppState::new(
        paths,
        Arc::new(dispatcher),
        Arc::new(MemoryCredentialStore::new()),
    );

    let mut checks: Vec<SmokeCheck> = Vec::new();
    let mut status = "pass";

    let start = Instant::now();
    let result = get_service_statuses(&state, Some(trace_id.clone()))
        .map(|resp| {
            let ready = resp.data.iter().all(|s| s.ready);
            (if ready { "pass" } else { "warn" }, resp.data)
        })
        .map_err(|err| (err.code, err.error));
    record(&mut checks, "service_statuses", start, result);

    if args.start_services {
        let start = Instant::now();
        let result = start_services(&state, Some(trace_id.clone()))
            .map(|resp| (if resp.data.all_ready { "pass" } else { "fail" }, resp.data))
            .map_err(|err| (err.code, err.error));
        if record(&mut checks, "start_services", start, result) == "fail" {
            status = "fail";
        }
    }

    let start = Instant::now();
    let result = list_devices(&state, Some(trace_id.clone()))
        .map(|resp| ("pass", resp.data))
        .map_err(|err| (err.code, err.error));
    record(&mut checks, "list_devices", start, result);

    let start = Instant::now();
    let result = check_device(&state, Some(trace_id.clone()))
        .map(|resp| {
            let level = match resp.data.version_supported {
                Some(true) => "pass",
                _ => "warn",
            };
            (level, resp.data)
        })
        .map_err(|err| (err.code, err.error));
    record(&mut checks, "check_device", start, result);

    if let Some(ipa) = args.ipa.clone() {
        let start = Instant::now();
        let request = InstallRequest {
            package_path: Some(ipa),
            account_id: args.account_id.clone(),
            secret: std::env::var("ALTHEA_SECRET").ok(),
            remember: false,
        };
        let result = submit_install(&state, request, Some(trace_id.clone()))
            .map_err(|err| (err.code, err.error))
            .and_then(|resp| {
                if !pump_until_idle(&state, &inbox, &args) {
                    return Err((ERR_TIMEOUT.to_string(), "install did not settle".to_string()));
                }
                let rows = get_install_queue(&state, Some(trace_id.clone()))
                    .map_err(|err| (err.code, err.error))?
                    .data;
                let row = rows
                    .into_iter()
                    .find(|row| row.id == resp.data.task_id)
                    .ok_or_else(|| (ERR_SYSTEM.to_string(), "task vanished".to_string()))?;
                let level = if row.status == TaskStatus::Succeeded { "pass" } else { "fail" };
                Ok((level, row))
            });
        if record(&mut checks, "install", start, result) == "fail" {
            status = "fail";
        }
    } else {
        checks.push(SmokeCheck {
            name: "install",
            status: "skip",
            duration_ms: 0,
            detail: None,
            error_code: None,
            error: None,
        });
    }

    if args.stop_services {
        let start = Instant::now();
        let result = stop_services(&state, Some(trace_id.clone()))
            .map(|resp| ("pass", resp.data))
            .map_err(|err| (err.code, err.error));
        record(&mut checks, "stop_services", start, result);
    }

    let summary = SmokeSummary {
        tool: "althea_backend_smoke",
        status,
        trace_id,
        data_dir: state.paths.data_dir.to_string_lossy().to_string(),
        checks,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    if status == "fail" {
        std::process::exit(1);
    }
}
