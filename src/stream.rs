//! Abort-safe token accounting for streamed responses.
//!
//! Every text-delta chunk lands in a buffer that is re-tokenized on a fixed
//! cadence. Completion, mid-stream error, and downstream drop all converge
//! on a single terminal usage record through a one-shot latch: whichever
//! path fires first wins, later calls see the cached result. Provider-
//! authoritative usage at completion overrides the estimate.

use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use crate::error::Result;
use crate::events::{EventBus, ShieldEvent};
use crate::pricing::CostEstimator;
use crate::tokens::TokenCounter;
use crate::types::{FinishReason, StreamChunk, Usage};

/// Recount the buffer every this many chunks; `stream:chunk` events follow
/// the same cadence.
pub const RECOUNT_INTERVAL: u64 = 8;

/// Stream tracking configuration.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    /// Fired once when the estimated cost first crosses the threshold.
    pub cost_threshold: Option<f64>,
    pub on_cost_threshold: Option<Arc<dyn Fn(f64) + Send + Sync>>,
    /// Fired on abort with the terminal outcome.
    pub on_abort: Option<Arc<dyn Fn(&StreamOutcome) + Send + Sync>>,
}

/// Terminal accounting for one stream, produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub cost: f64,
    pub finish_reason: FinishReason,
    pub aborted: bool,
    pub chunk_count: u64,
    pub latency_ms: u64,
    /// Accumulated output text, used for the post-completion cache store.
    pub text: String,
}

struct TrackerState {
    buffer: String,
    output_tokens: u64,
    chunk_count: u64,
    provider_usage: Option<Usage>,
    threshold_fired: bool,
    outcome: Option<StreamOutcome>,
}

/// Per-stream token counter with a one-shot terminal latch.
pub struct StreamTracker {
    model_id: String,
    input_tokens: u64,
    started: Instant,
    counter: TokenCounter,
    estimator: CostEstimator,
    bus: Arc<EventBus>,
    callbacks: StreamCallbacks,
    state: Mutex<TrackerState>,
}

impl StreamTracker {
    pub fn new(
        model_id: impl Into<String>,
        input_tokens: u64,
        estimator: CostEstimator,
        bus: Arc<EventBus>,
        callbacks: StreamCallbacks,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            input_tokens,
            started: Instant::now(),
            counter: TokenCounter::new(),
            estimator,
            bus,
            callbacks,
            state: Mutex::new(TrackerState {
                buffer: String::new(),
                output_tokens: 0,
                chunk_count: 0,
                provider_usage: None,
                threshold_fired: false,
                outcome: None,
            }),
        }
    }

    /// Feed one text delta. Recounts and emits `stream:chunk` on the
    /// recount cadence.
    pub fn on_chunk(&self, text_delta: &str) {
        let (emit, threshold) = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return;
            }
            state.buffer.push_str(text_delta);
            state.chunk_count += 1;

            if state.chunk_count % RECOUNT_INTERVAL != 0 {
                (None, None)
            } else {
                state.output_tokens = self.counter.count(&state.buffer);
                let cost = self.estimator.safe_cost(
                    &self.model_id,
                    self.input_tokens,
                    state.output_tokens,
                );

                let threshold = match self.callbacks.cost_threshold {
                    Some(t) if cost >= t && !state.threshold_fired => {
                        state.threshold_fired = true;
                        Some(cost)
                    }
                    _ => None,
                };
                (Some((state.output_tokens, cost)), threshold)
            }
        };

        if let Some((tokens, estimated_cost)) = emit {
            self.bus.emit(ShieldEvent::StreamChunk {
                tokens,
                estimated_cost,
            });
        }
        if let Some(cost) = threshold {
            if let Some(cb) = &self.callbacks.on_cost_threshold {
                cb(cost);
            }
        }
    }

    /// Record provider-authoritative usage, used at finalization in place
    /// of the estimate.
    pub fn set_provider_usage(&self, usage: Usage) {
        let mut state = self.lock();
        state.provider_usage = Some(usage);
    }

    /// Normal completion. First terminal call wins; returns `None` if the
    /// latch already fired.
    pub fn finish(&self, provider_usage: Option<Usage>) -> Option<StreamOutcome> {
        if let Some(usage) = provider_usage {
            self.set_provider_usage(usage);
        }
        self.finalize(FinishReason::Stop, false)
    }

    /// Abort or downstream cancel. Same latch as [`Self::finish`].
    pub fn abort(&self) -> Option<StreamOutcome> {
        self.finalize(FinishReason::Abort, true)
    }

    /// The terminal outcome, once one exists.
    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.lock().outcome.clone()
    }

    fn finalize(&self, finish_reason: FinishReason, aborted: bool) -> Option<StreamOutcome> {
        let outcome = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return None;
            }

            state.output_tokens = self.counter.count(&state.buffer);
            let usage = state.provider_usage.unwrap_or(Usage {
                input_tokens: self.input_tokens,
                output_tokens: state.output_tokens,
            });
            let cost = self
                .estimator
                .safe_cost(&self.model_id, usage.input_tokens, usage.output_tokens);

            let outcome = StreamOutcome {
                usage,
                cost,
                finish_reason,
                aborted,
                chunk_count: state.chunk_count,
                latency_ms: self.started.elapsed().as_millis() as u64,
                text: state.buffer.clone(),
            };
            state.outcome = Some(outcome.clone());
            outcome
        };

        let event = if aborted {
            ShieldEvent::StreamAbort {
                tokens: outcome.usage.output_tokens,
                estimated_cost: outcome.cost,
            }
        } else {
            ShieldEvent::StreamComplete {
                tokens: outcome.usage.output_tokens,
                estimated_cost: outcome.cost,
            }
        };
        self.bus.emit(event);

        if aborted {
            if let Some(cb) = &self.callbacks.on_abort {
                cb(&outcome);
            }
        }
        Some(outcome)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type FinalizeHook = Box<dyn FnOnce(&StreamOutcome) + Send>;

enum StreamSource<S> {
    /// Cache-hit short circuit: replays stored text as a one-chunk stream.
    Synthetic { text: Option<String> },
    Live(S),
}

/// The stream handed back to the host by `wrap_stream`.
///
/// Forwards the provider's chunks while the tracker counts them. Dropping
/// the stream before exhaustion triggers abort accounting in the same
/// tick; polling it to completion triggers completion accounting. Either
/// way the terminal record is produced exactly once.
pub struct ShieldStream<S> {
    source: StreamSource<S>,
    tracker: Option<Arc<StreamTracker>>,
    hook: Option<FinalizeHook>,
    preset_outcome: Option<StreamOutcome>,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl<S> ShieldStream<S> {
    pub(crate) fn live(stream: S, tracker: Arc<StreamTracker>, hook: FinalizeHook) -> Self {
        Self {
            source: StreamSource::Live(stream),
            tracker: Some(tracker),
            hook: Some(hook),
            preset_outcome: None,
            finish_reason: None,
            done: false,
        }
    }

    pub(crate) fn synthetic(text: String, outcome: StreamOutcome) -> Self {
        Self {
            source: StreamSource::Synthetic { text: Some(text) },
            tracker: None,
            hook: None,
            preset_outcome: Some(outcome),
            finish_reason: Some(FinishReason::Stop),
            done: false,
        }
    }

    /// Terminal usage, available once the stream has ended (or immediately
    /// for a synthetic cache-hit stream).
    pub fn outcome(&self) -> Option<StreamOutcome> {
        if let Some(preset) = &self.preset_outcome {
            return Some(preset.clone());
        }
        self.tracker.as_ref().and_then(|t| t.outcome())
    }

    /// Terminal usage numbers, once available.
    pub fn usage(&self) -> Option<Usage> {
        self.outcome().map(|o| o.usage)
    }

    /// Finish reason, once the stream has ended.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    fn finalize(&mut self, aborted: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let tracker = match &self.tracker {
            Some(tracker) => Arc::clone(tracker),
            None => return,
        };

        let outcome = if aborted {
            tracker.abort()
        } else {
            tracker.finish(None)
        };
        if let (Some(outcome), Some(hook)) = (outcome, self.hook.take()) {
            hook(&outcome);
        }
        if self.finish_reason.is_none() {
            self.finish_reason = tracker.outcome().map(|o| o.finish_reason);
        }
    }
}

impl<S> Stream for ShieldStream<S>
where
    S: Stream<Item = Result<StreamChunk>> + Unpin,
{
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done && matches!(this.source, StreamSource::Synthetic { text: None }) {
            return Poll::Ready(None);
        }

        match &mut this.source {
            StreamSource::Synthetic { text } => match text.take() {
                Some(text_delta) => Poll::Ready(Some(Ok(StreamChunk::TextDelta { text_delta }))),
                None => {
                    this.done = true;
                    Poll::Ready(None)
                }
            },
            StreamSource::Live(inner) => match Pin::new(inner).poll_next(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    match &chunk {
                        StreamChunk::TextDelta { text_delta } => {
                            if let Some(tracker) = &this.tracker {
                                tracker.on_chunk(text_delta);
                            }
                        }
                        StreamChunk::Usage {
                            input_tokens,
                            output_tokens,
                        } => {
                            if let Some(tracker) = &this.tracker {
                                tracker.set_provider_usage(Usage {
                                    input_tokens: *input_tokens,
                                    output_tokens: *output_tokens,
                                });
                            }
                        }
                        StreamChunk::Finish { finish_reason } => {
                            this.finish_reason = Some(*finish_reason);
                        }
                    }
                    Poll::Ready(Some(Ok(chunk)))
                }
                Poll::Ready(Some(Err(e))) => {
                    // Mid-stream failure: terminal accounting now, error
                    // forwarded to the host unchanged.
                    this.finalize(true);
                    Poll::Ready(Some(Err(e)))
                }
                Poll::Ready(None) => {
                    if this.finish_reason.is_none() {
                        this.finish_reason = Some(FinishReason::Stop);
                    }
                    this.finalize(false);
                    Poll::Ready(None)
                }
            },
        }
    }
}

impl<S> Drop for ShieldStream<S> {
    fn drop(&mut self) {
        // Downstream cancel: the host dropped the stream before the end.
        self.finalize(true);
    }
}
