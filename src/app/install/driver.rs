use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::dispatch::{ask, PromptAnswer, PromptKind, UiDispatcher};
use crate::app::install::markers::{LineParser, OutcomeMarker, PromptMarker};
use crate::app::install::process::{InstallerProcess, ProcessHandle};
use crate::app::install::task::CancelFlag;
use crate::app::log_sink::LogSink;
use crate::app::models::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Succeeded | DriverState::Failed | DriverState::Canceled
        )
    }

    pub fn task_status(&self) -> TaskStatus {
        match self {
            DriverState::Starting | DriverState::Running => TaskStatus::Installing,
            DriverState::Succeeded => TaskStatus::Succeeded,
            DriverState::Failed => TaskStatus::Failed,
            DriverState::Canceled => TaskStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverUpdate {
    pub state: DriverState,
    pub progress: Option<f64>,
    pub detail: String,
}

pub type UpdateSink<'a> = &'a mut dyn FnMut(&DriverUpdate);

/// Runs one install against an already-spawned helper. The driver owns the
/// prompt latches and the progress high-water mark for the run; the caller
/// owns the task and applies each emitted update to it.
pub struct InstallProtocolDriver {
    parser: Arc<LineParser>,
    dispatcher: Arc<dyn UiDispatcher>,
    exit_timeout: Duration,
    log_sink: Option<Arc<LogSink>>,
}

struct Run<'a> {
    task_id: &'a str,
    trace_id: &'a str,
    update: DriverUpdate,
    handle: ProcessHandle,
    terminated: bool,
    confirm_seen: bool,
    two_factor_seen: bool,
}

impl Run<'_> {
    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.handle.terminate();
        }
    }

    fn settle(&mut self, state: DriverState, detail: &str) {
        self.update.state = state;
        self.update.detail = detail.to_string();
        if state == DriverState::Succeeded {
            self.update.progress = Some(1.0);
        }
    }
}

impl InstallProtocolDriver {
    pub fn new(parser: Arc<LineParser>, dispatcher: Arc<dyn UiDispatcher>, exit_timeout: Duration) -> Self {
        Self {
            parser,
            dispatcher,
            exit_timeout,
            log_sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    fn record(&self, trace_id: &str, message: &str) {
        warn!(trace_id = %trace_id, "{message}");
        if let Some(sink) = &self.log_sink {
            sink.note(message);
        }
    }

    /// Drives `process` to a terminal state and returns the final update,
    /// which has also been passed to `on_update`.
    pub fn run(
        &self,
        task_id: &str,
        process: &mut dyn InstallerProcess,
        cancel: &CancelFlag,
        on_update: UpdateSink<'_>,
        trace_id: &str,
    ) -> DriverUpdate {
        let mut run = Run {
            task_id,
            trace_id,
            update: DriverUpdate {
                state: DriverState::Starting,
                progress: None,
                detail: "Starting…".to_string(),
            },
            handle: process.handle(),
            terminated: false,
            confirm_seen: false,
            two_factor_seen: false,
        };
        run.update.state = DriverState::Running;
        run.update.detail = "Running…".to_string();
        on_update(&run.update);

        while let Some(line) = process.read_line() {
            if cancel.is_requested() {
                run.terminate();
                run.settle(DriverState::Canceled, "Canceled");
                break;
            }
            self.process_line(&mut run, &line, process, on_update);
            if run.update.state.is_terminal() {
                break;
            }
        }

        let exit_code = process.wait_exit(self.exit_timeout);
        if !run.update.state.is_terminal() {
            if cancel.is_requested() {
                run.settle(DriverState::Canceled, "Canceled");
            } else {
                match exit_code {
                    Some(0) => run.settle(DriverState::Succeeded, "Done"),
                    Some(code) => run.settle(DriverState::Failed, &format!("Exit {code}")),
                    None => {
                        self.record(trace_id, "installer: no exit status after output closed");
                        run.settle(DriverState::Failed, "Failed");
                    }
                }
            }
        }
        info!(
            trace_id = %trace_id,
            task_id = %task_id,
            state = ?run.update.state,
            exit_code = ?exit_code,
            "install finished"
        );
        on_update(&run.update);
        run.update
    }

    fn process_line(
        &self,
        run: &mut Run<'_>,
        line: &str,
        process: &mut dyn InstallerProcess,
        on_update: UpdateSink<'_>,
    ) {
        let scan = self.parser.scan(line);

        if let Some(progress) = scan.progress {
            let current = run.update.progress.unwrap_or(0.0);
            if progress.fraction >= current {
                run.update.progress = Some(progress.fraction);
                run.update.detail = progress.detail;
                on_update(&run.update);
            } else {
                debug!(task_id = %run.task_id, fraction = progress.fraction, "ignoring regressed progress");
            }
        }

        for prompt in scan.prompts {
            match prompt {
                PromptMarker::Confirm if !run.confirm_seen => {
                    run.confirm_seen = true;
                    let kind = PromptKind::Confirm {
                        text: self.parser.table().confirm_text.clone(),
                    };
                    match ask(self.dispatcher.as_ref(), run.task_id, kind) {
                        PromptAnswer::Yes => self.answer(run, process, "\n"),
                        _ => {
                            run.terminate();
                            run.settle(DriverState::Canceled, "Canceled by user");
                            return;
                        }
                    }
                }
                PromptMarker::TwoFactor if !run.two_factor_seen => {
                    run.two_factor_seen = true;
                    match ask(self.dispatcher.as_ref(), run.task_id, PromptKind::TwoFactorCode) {
                        PromptAnswer::Code(code) if !code.trim().is_empty() => {
                            self.answer(run, process, &format!("{}\n", code.trim()));
                        }
                        _ => {
                            run.terminate();
                            run.settle(DriverState::Canceled, "2FA canceled");
                            return;
                        }
                    }
                }
                PromptMarker::Confirm | PromptMarker::TwoFactor => {
                    debug!(task_id = %run.task_id, ?prompt, "prompt already answered this run");
                }
            }
        }

        match scan.outcome {
            Some(OutcomeMarker::Succeeded) => run.settle(DriverState::Succeeded, "Done"),
            Some(OutcomeMarker::Failed) => {
                run.terminate();
                run.settle(DriverState::Failed, "Failed");
            }
            None => {}
        }
    }

    fn answer(&self, run: &Run<'_>, process: &mut dyn InstallerProcess, text: &str) {
        if let Err(err) = process.write_input(text) {
            self.record(run.trace_id, &format!("installer: failed to write answer: {err}"));
        }
    }
}
