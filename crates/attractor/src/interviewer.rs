use crate::{AttractorError, CancelToken};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const DEFAULT_QUESTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub stage: String,
    pub text: String,
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub timed_out: bool,
}

impl Answer {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            text: String::new(),
            timed_out: true,
        }
    }
}

struct PendingQuestion {
    question: Question,
    sender: oneshot::Sender<Answer>,
}

/// Parks interactive questions for out-of-band answering (HTTP, CLI).
///
/// At most one question is pending per run. `ask` blocks the calling stage
/// until `answer` arrives, cancellation is signalled, or the per-question
/// timeout expires; the latter two resolve with `timed_out=true`.
#[derive(Clone, Default)]
pub struct InterviewDesk {
    pending: Arc<Mutex<Option<PendingQuestion>>>,
}

impl InterviewDesk {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ask(
        &self,
        question: Question,
        cancel: &CancelToken,
    ) -> Result<Answer, AttractorError> {
        let timeout = question
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_QUESTION_TIMEOUT);

        let receiver = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| AttractorError::Runtime("interviewer mutex poisoned".to_string()))?;
            if let Some(existing) = pending.as_ref() {
                return Err(AttractorError::Runtime(format!(
                    "a question is already pending ({})",
                    existing.question.id
                )));
            }
            let (sender, receiver) = oneshot::channel();
            *pending = Some(PendingQuestion { question, sender });
            receiver
        };

        let answer = tokio::select! {
            received = receiver => received.unwrap_or_else(|_| Answer::timed_out()),
            _ = cancel.cancelled() => {
                self.clear();
                Answer::timed_out()
            }
            _ = tokio::time::sleep(timeout) => {
                self.clear();
                Answer::timed_out()
            }
        };
        Ok(answer)
    }

    /// Delivers the answer for the pending question. Returns false when no
    /// question is pending or the id does not match; a second delivery for
    /// the same question also returns false.
    pub fn answer(&self, question_id: &str, text: impl Into<String>) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.as_ref() {
            Some(parked) if parked.question.id == question_id => {}
            _ => return false,
        }
        let Some(parked) = pending.take() else {
            return false;
        };
        parked.sender.send(Answer::text(text)).is_ok()
    }

    /// The parked question, for HTTP surfacing.
    pub fn pending(&self) -> Option<Question> {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.as_ref().map(|parked| parked.question.clone()))
    }

    /// Unblocks the pending question as timed out. Returns false when
    /// nothing is pending.
    pub fn cancel_pending(&self) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.take() {
            Some(parked) => parked.sender.send(Answer::timed_out()).is_ok(),
            None => false,
        }
    }

    fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
    }
}

/// Pluggable answering strategy for hosts that answer questions in-process
/// (tests, non-interactive CLI runs).
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: Question) -> Answer;
}

#[derive(Debug, Default)]
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        match question.choices.first() {
            Some(choice) => Answer::text(choice.clone()),
            None => Answer::text("yes"),
        }
    }
}

#[derive(Default)]
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn with_answers<I>(answers: I) -> Self
    where
        I: IntoIterator<Item = Answer>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: Question) -> Answer {
        self.answers
            .lock()
            .expect("queue interviewer mutex should lock")
            .pop_front()
            .unwrap_or_else(Answer::timed_out)
    }
}

/// Bridges an in-process interviewer onto the desk: whenever a question
/// parks, the interviewer answers it. Runs until the desk is dropped or the
/// cancel token fires.
pub fn attach_interviewer(
    desk: InterviewDesk,
    interviewer: Arc<dyn Interviewer>,
    cancel: CancelToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_canceled() {
                return;
            }
            if let Some(question) = desk.pending() {
                let question_id = question.id.clone();
                let answer = interviewer.ask(question).await;
                if answer.timed_out {
                    desk.cancel_pending();
                } else {
                    desk.answer(&question_id, answer.text);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}
