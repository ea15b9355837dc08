//! Exchange controller: runs one streaming exchange at a time and publishes
//! its answer through watch channels.
//!
//! A new [`ExchangeController::send`] supersedes whatever exchange is still
//! running. Every write to the answer slot carries the generation of the
//! exchange that produced it and is ignored once a newer exchange started.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use kbchat_core::config::Config;
use kbchat_upstream::{ChatBackend, CompletionRequest, FrameStream, SseEvent, UpstreamError};

use crate::answer::AnswerState;
use crate::error::ExchangeError;
use crate::reducer::{self, FoldOutcome};
use crate::ExchangeOutcome;

pub const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_STALE_STREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePhase {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl ExchangePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Legal moves within one exchange. Terminal phases have none; the next
    /// exchange starts over from `Sending`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExchangePhase::*;
        matches!(
            (self, next),
            (Idle, Sending)
                | (Sending, Streaming)
                | (Sending, Cancelled)
                | (Sending, Failed)
                | (Streaming, Completed)
                | (Streaming, Cancelled)
                | (Streaming, Failed)
        )
    }
}

struct Slot {
    generation: u64,
    cancel: Option<CancellationToken>,
    reset: Option<JoinHandle<()>>,
}

struct Shared {
    slot: Mutex<Slot>,
    answer: watch::Sender<AnswerState>,
    done: watch::Sender<bool>,
    phase: watch::Sender<ExchangePhase>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new generation, superseding the running exchange and any pending reset.
    fn begin(&self, conversation_id: &str, cancel: CancellationToken) -> u64 {
        let mut slot = self.lock();
        if let Some(previous) = slot.cancel.take() {
            debug!(generation = slot.generation, "Superseding running exchange");
            previous.cancel();
        }
        if let Some(timer) = slot.reset.take() {
            timer.abort();
        }
        slot.generation += 1;
        slot.cancel = Some(cancel);

        self.answer.send_replace(AnswerState::begin(conversation_id));
        self.done.send_replace(false);
        self.phase.send_replace(ExchangePhase::Sending);
        slot.generation
    }

    fn advance(&self, generation: u64, next: ExchangePhase) -> bool {
        let slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        debug_assert!(self.phase.borrow().can_transition_to(next));
        self.phase.send_replace(next);
        true
    }

    fn publish(&self, generation: u64, state: &AnswerState) -> bool {
        let slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        self.answer.send_replace(state.clone());
        true
    }

    /// Publish the terminal answer and flip `done`. Returns false when the
    /// exchange was already superseded.
    fn finish(&self, generation: u64, phase: ExchangePhase, answer: AnswerState) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        slot.cancel = None;
        debug_assert!(self.phase.borrow().can_transition_to(phase));
        self.answer.send_replace(answer);
        self.phase.send_replace(phase);
        self.done.send_replace(true);
        true
    }

    /// Clear the answer after `delay`, replacing any timer already pending.
    /// Outside a tokio runtime there is no timer to run, so the answer is
    /// cleared at once.
    fn schedule_reset(self: &Arc<Self>, delay: Duration) {
        let mut slot = self.lock();
        if let Some(timer) = slot.reset.take() {
            timer.abort();
        }
        let generation = slot.generation;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(generation, "No runtime for the reset timer; clearing answer now");
            self.answer.send_replace(AnswerState::default());
            return;
        };
        let shared = Arc::clone(self);
        slot.reset = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let slot = shared.lock();
            if slot.generation == generation {
                shared.answer.send_replace(AnswerState::default());
                trace!(generation, "Answer reset");
            }
        }));
    }
}

enum NextFrame {
    Frame(SseEvent),
    Error(UpstreamError),
    Stale(Duration),
    End,
}

/// Open the response stream, giving up after `stale_timeout` without headers.
async fn open_stream(
    backend: &dyn ChatBackend,
    request: &CompletionRequest,
    stale_timeout: Option<Duration>,
) -> Result<FrameStream, ExchangeError> {
    let opened = match stale_timeout {
        Some(limit) => match tokio::time::timeout(limit, backend.completions(request)).await {
            Ok(opened) => opened,
            Err(_) => return Err(ExchangeError::StaleStream(limit)),
        },
        None => backend.completions(request).await,
    };
    opened.map_err(ExchangeError::from)
}

async fn next_frame(frames: &mut FrameStream, stale_timeout: Option<Duration>) -> NextFrame {
    let next = match stale_timeout {
        Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
            Ok(next) => next,
            Err(_) => return NextFrame::Stale(limit),
        },
        None => frames.next().await,
    };
    match next {
        Some(Ok(frame)) => NextFrame::Frame(frame),
        Some(Err(e)) => NextFrame::Error(e),
        None => NextFrame::End,
    }
}

pub struct ExchangeController {
    backend: Arc<dyn ChatBackend>,
    shared: Arc<Shared>,
    reset_delay: Duration,
    stale_timeout: Option<Duration>,
}

impl ExchangeController {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    generation: 0,
                    cancel: None,
                    reset: None,
                }),
                answer: watch::Sender::new(AnswerState::default()),
                done: watch::Sender::new(true),
                phase: watch::Sender::new(ExchangePhase::Idle),
            }),
            reset_delay: DEFAULT_RESET_DELAY,
            stale_timeout: Some(DEFAULT_STALE_STREAM_TIMEOUT),
        }
    }

    /// Controller with the timings of the `exchange` config section.
    pub fn from_config(backend: Arc<dyn ChatBackend>, config: &Config) -> Self {
        Self::new(backend)
            .with_reset_delay(config.reset_delay())
            .with_stale_timeout(config.stale_stream_timeout())
    }

    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// `None` waits for frames indefinitely.
    pub fn with_stale_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn subscribe(&self) -> watch::Receiver<AnswerState> {
        self.shared.answer.subscribe()
    }

    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.shared.done.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ExchangePhase> {
        self.shared.phase.subscribe()
    }

    /// Current answer snapshot.
    pub fn answer(&self) -> AnswerState {
        self.shared.answer.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }

    pub fn phase(&self) -> ExchangePhase {
        *self.shared.phase.borrow()
    }

    /// Cancel the running exchange, if any.
    pub fn cancel(&self) {
        let slot = self.shared.lock();
        if let Some(token) = &slot.cancel {
            token.cancel();
        }
    }

    /// Clear the answer after the reset delay. Calling again restarts the delay.
    ///
    /// The delay runs on the current tokio runtime; called outside one, the
    /// answer is cleared immediately.
    pub fn reset_answer(&self) {
        self.shared.schedule_reset(self.reset_delay);
    }

    /// Ask `question` in conversation `conversation_id` and stream the answer.
    ///
    /// Snapshots are published to [`subscribe`](Self::subscribe) receivers as
    /// frames arrive. Cancelling `cancel` (or calling [`cancel`](Self::cancel))
    /// drops the response stream and clears the answer.
    pub async fn send(
        &self,
        question: &str,
        conversation_id: &str,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ExchangeError::EmptyQuestion);
        }
        if conversation_id.is_empty() {
            return Err(ExchangeError::MissingConversation);
        }

        let token = cancel.child_token();
        let generation = self.shared.begin(conversation_id, token.clone());
        info!(generation, conversation_id, "Exchange started");

        let request = CompletionRequest::streaming(question, conversation_id);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = open_stream(self.backend.as_ref(), &request, self.stale_timeout) => Some(opened),
        };
        let mut frames = match opened {
            None => return Ok(self.cancelled(generation)),
            Some(Ok(frames)) => frames,
            Some(Err(e)) => return Err(self.failed(generation, e)),
        };
        self.shared.advance(generation, ExchangePhase::Streaming);

        let mut state = AnswerState::begin(conversation_id);
        let mut progressed = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = next_frame(&mut frames, self.stale_timeout) => Some(next),
            };
            let Some(next) = next else {
                return Ok(self.cancelled(generation));
            };

            match next {
                NextFrame::Frame(frame) => match reducer::fold(&mut state, &frame.data) {
                    FoldOutcome::Applied => {
                        progressed = true;
                        debug!(generation, chars = state.text.chars().count(), "Answer frame applied");
                        self.shared.publish(generation, &state);
                    }
                    FoldOutcome::Control => trace!(generation, "Control frame"),
                    FoldOutcome::Malformed(reason) => {
                        warn!(generation, %reason, "Dropping malformed frame");
                    }
                    FoldOutcome::Rejected { code, message } => {
                        if !progressed {
                            let err = ExchangeError::Business { code, message };
                            return Err(self.failed(generation, err));
                        }
                        warn!(generation, code, %message, "Dropping error frame after partial answer");
                    }
                },
                NextFrame::End => break,
                NextFrame::Error(e) => {
                    if !progressed {
                        return Err(self.failed(generation, e.into()));
                    }
                    warn!(generation, error = %e, "Stream broke off; keeping partial answer");
                    break;
                }
                NextFrame::Stale(after) => {
                    if !progressed {
                        return Err(self.failed(generation, ExchangeError::StaleStream(after)));
                    }
                    warn!(generation, ?after, "Stream went quiet; keeping partial answer");
                    break;
                }
            }
        }
        drop(frames);

        state.streaming = false;
        if !self
            .shared
            .finish(generation, ExchangePhase::Completed, state.clone())
        {
            return Ok(ExchangeOutcome::Cancelled);
        }
        self.shared.schedule_reset(self.reset_delay);
        info!(generation, chars = state.text.chars().count(), "Exchange completed");
        Ok(ExchangeOutcome::Completed(state))
    }

    fn cancelled(&self, generation: u64) -> ExchangeOutcome {
        if self
            .shared
            .finish(generation, ExchangePhase::Cancelled, AnswerState::default())
        {
            info!(generation, "Exchange cancelled");
        }
        ExchangeOutcome::Cancelled
    }

    fn failed(&self, generation: u64, err: ExchangeError) -> ExchangeError {
        if self
            .shared
            .finish(generation, ExchangePhase::Failed, AnswerState::default())
        {
            warn!(generation, error = %err, "Exchange failed");
        }
        err
    }
}

impl Drop for ExchangeController {
    fn drop(&mut self) {
        let mut slot = self.shared.lock();
        if let Some(token) = slot.cancel.take() {
            token.cancel();
        }
        if let Some(timer) = slot.reset.take() {
            timer.abort();
        }
    }
}
