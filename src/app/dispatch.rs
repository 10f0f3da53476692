use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::models::TaskSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PromptKind {
    /// Yes/no question; `text` is what the dialog shows.
    Confirm { text: String },
    TwoFactorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptAnswer {
    Yes,
    No,
    Code(String),
    /// Window closed, event loop gone, or the request was dropped unanswered.
    Dismissed,
}

struct PromptSlot {
    answer: Mutex<Option<PromptAnswer>>,
    cv: Condvar,
}

impl PromptSlot {
    fn fill(&self, answer: PromptAnswer) {
        let mut slot = self.answer.lock().expect("prompt slot poisoned");
        if slot.is_none() {
            *slot = Some(answer);
            self.cv.notify_all();
        }
    }
}

/// Event-loop half of a prompt. Answering consumes it; dropping it unanswered
/// resolves the prompt as `Dismissed` so the waiting worker never hangs.
pub struct PromptResponder {
    slot: Arc<PromptSlot>,
}

impl PromptResponder {
    pub fn respond(self, answer: PromptAnswer) {
        self.slot.fill(answer);
    }
}

impl Drop for PromptResponder {
    fn drop(&mut self) {
        self.slot.fill(PromptAnswer::Dismissed);
    }
}

/// Worker half of a prompt.
pub struct PendingPrompt {
    slot: Arc<PromptSlot>,
}

impl PendingPrompt {
    pub fn wait(self) -> PromptAnswer {
        let mut slot = self.slot.answer.lock().expect("prompt slot poisoned");
        loop {
            if let Some(answer) = slot.take() {
                return answer;
            }
            slot = self.slot.cv.wait(slot).expect("prompt slot poisoned");
        }
    }
}

pub struct PromptRequest {
    pub task_id: String,
    pub kind: PromptKind,
    pub responder: PromptResponder,
}

impl fmt::Debug for PromptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptRequest")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .finish()
    }
}

pub fn prompt_channel(task_id: &str, kind: PromptKind) -> (PromptRequest, PendingPrompt) {
    let slot = Arc::new(PromptSlot {
        answer: Mutex::new(None),
        cv: Condvar::new(),
    });
    let request = PromptRequest {
        task_id: task_id.to_string(),
        kind,
        responder: PromptResponder {
            slot: Arc::clone(&slot),
        },
    };
    (request, PendingPrompt { slot })
}

#[derive(Debug)]
pub enum UiMessage {
    TaskUpdated(TaskSnapshot),
    QueueChanged(Vec<TaskSnapshot>),
    Prompt(PromptRequest),
}

/// The single-threaded event loop as seen from worker threads. `post` must not
/// block; delivery order is post order.
pub trait UiDispatcher: Send + Sync {
    fn post(&self, message: UiMessage);
}

/// Posts a prompt and blocks the calling worker until the event loop answers.
/// Never call this from the event loop itself.
pub fn ask(dispatcher: &dyn UiDispatcher, task_id: &str, kind: PromptKind) -> PromptAnswer {
    let (request, pending) = prompt_channel(task_id, kind);
    debug!(task_id = %task_id, kind = ?request.kind, "prompt posted");
    dispatcher.post(UiMessage::Prompt(request));
    pending.wait()
}

/// Inbox-backed dispatcher: workers post, the event loop drains `UiInbox`.
#[derive(Clone)]
pub struct ChannelDispatcher {
    sender: Sender<UiMessage>,
}

pub struct UiInbox {
    receiver: Receiver<UiMessage>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, UiInbox) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, UiInbox { receiver })
    }
}

impl UiDispatcher for ChannelDispatcher {
    fn post(&self, message: UiMessage) {
        // A closed inbox drops the message, which dismisses any prompt in it.
        if self.sender.send(message).is_err() {
            debug!("ui inbox closed; message dropped");
        }
    }
}

impl UiInbox {
    /// `None` on timeout or when every dispatcher is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<UiMessage> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn drain(&self) -> Vec<UiMessage> {
        self.receiver.try_iter().collect()
    }
}

/// Dispatcher that discards everything; prompts resolve as `Dismissed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl UiDispatcher for NullDispatcher {
    fn post(&self, _message: UiMessage) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn worker_blocks_until_event_loop_answers() {
        let (dispatcher, inbox) = ChannelDispatcher::new();
        let worker = thread::spawn(move || {
            ask(
                &dispatcher,
                "task-1",
                PromptKind::Confirm {
                    text: "Continue installation?".to_string(),
                },
            )
        });
        let message = inbox
            .recv_timeout(Duration::from_secs(5))
            .expect("prompt posted");
        match message {
            UiMessage::Prompt(request) => {
                assert_eq!(request.task_id, "task-1");
                request.responder.respond(PromptAnswer::Yes);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(worker.join().expect("join"), PromptAnswer::Yes);
    }

    #[test]
    fn dropped_request_is_dismissed() {
        let (dispatcher, inbox) = ChannelDispatcher::new();
        let worker = thread::spawn(move || ask(&dispatcher, "task-2", PromptKind::TwoFactorCode));
        let message = inbox.recv_timeout(Duration::from_secs(5)).expect("prompt");
        drop(message);
        assert_eq!(worker.join().expect("join"), PromptAnswer::Dismissed);
    }

    #[test]
    fn closed_inbox_does_not_hang_worker() {
        let (dispatcher, inbox) = ChannelDispatcher::new();
        drop(inbox);
        assert_eq!(
            ask(&dispatcher, "task-3", PromptKind::TwoFactorCode),
            PromptAnswer::Dismissed
        );
        assert_eq!(ask(&NullDispatcher, "task-3", PromptKind::TwoFactorCode), PromptAnswer::Dismissed);
    }

    #[test]
    fn first_answer_wins() {
        let (request, pending) = prompt_channel("t", PromptKind::TwoFactorCode);
        request.responder.respond(PromptAnswer::Code("123456".to_string()));
        assert_eq!(pending.wait(), PromptAnswer::Code("123456".to_string()));
    }

    #[test]
    fn messages_arrive_in_post_order() {
        use crate::app::models::TaskStatus;
        let (dispatcher, inbox) = ChannelDispatcher::new();
        for n in 0..5 {
            dispatcher.post(UiMessage::TaskUpdated(TaskSnapshot {
                id: "t".to_string(),
                package_path: "app.ipa".to_string(),
                account_id: "a@b.c".to_string(),
                created_at: String::new(),
                status: TaskStatus::Installing,
                progress: Some(n as f64 / 10.0),
                detail: format!("{}%", n * 10),
                cancel_requested: false,
            }));
        }
        let details: Vec<String> = inbox
            .drain()
            .into_iter()
            .filter_map(|message| match message {
                UiMessage::TaskUpdated(snapshot) => Some(snapshot.detail),
                _ => None,
            })
            .collect();
        assert_eq!(details, vec!["0%", "10%", "20%", "30%", "40%"]);
    }
}
