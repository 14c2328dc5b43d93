use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use loom_core::cancel::Deadline;
use loom_core::context::LlmContext;
use loom_core::errors::GatewayError;
use loom_core::provider::{EventStream, LlmProvider, StreamOptions};
use loom_core::stream::{GatewayErrorInfo, StreamEvent};

/// Retry behavior for [`ReliableProvider`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Fraction of the backoff randomly added or removed. Zero keeps delays
    /// exactly `base * 2^attempt`.
    pub jitter_factor: f64,
    /// Upper bound on a single attempt, from request to terminal event.
    #[serde(with = "option_duration_ms")]
    pub attempt_timeout: Option<Duration>,
    pub respect_retry_after: bool,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            attempt_timeout: None,
            respect_retry_after: true,
        }
    }
}

impl ReliableConfig {
    /// Delay before retry number `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let backoff = if jitter > 0.0 {
            backoff.mul_f64(rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter))
        } else {
            backoff
        };

        match suggested {
            Some(hint) if self.respect_retry_after => backoff.max(hint),
            _ => backoff,
        }
    }
}

/// Adds retry with exponential backoff to any provider.
///
/// A retry is a fresh call: the consumer sees a `Retry` event and must drop
/// whatever the failed attempt already produced. Cancellation is checked
/// before every attempt, while waiting on the provider and during backoff.
pub struct ReliableProvider<P: ?Sized> {
    inner: Arc<P>,
    config: ReliableConfig,
    total_retries: Arc<AtomicU64>,
}

impl<P: LlmProvider + ?Sized + 'static> ReliableProvider<P> {
    pub fn new(inner: Arc<P>, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: Arc<P>) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

fn interruption(deadline: &Deadline, timeout: Option<Duration>) -> GatewayError {
    if deadline.timed_out() {
        GatewayError::Timeout(timeout.unwrap_or_default())
    } else {
        GatewayError::Cancelled
    }
}

#[async_trait]
impl<P: LlmProvider + ?Sized + 'static> LlmProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    fn supports_thinking(&self) -> bool {
        self.inner.supports_thinking()
    }

    fn supports_tools(&self) -> bool {
        self.inner.supports_tools()
    }

    #[instrument(skip_all, fields(provider = self.inner.name(), model = self.inner.model()))]
    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let retries = Arc::clone(&self.total_retries);
        let context = context.clone();
        let options = options.clone();

        let events = stream! {
            let mut attempt: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    yield StreamEvent::Error { error: GatewayError::Cancelled };
                    return;
                }

                let deadline = Deadline::new(&cancel, config.attempt_timeout);
                let attempt_options = StreamOptions {
                    cancel: Some(deadline.token().clone()),
                    ..options.clone()
                };

                let opened = tokio::select! {
                    biased;
                    _ = deadline.token().cancelled() => Err(interruption(&deadline, config.attempt_timeout)),
                    result = inner.stream(&context, &attempt_options) => result,
                };

                let mut failure = GatewayError::StreamInterrupted("stream ended without a terminal event".into());
                match opened {
                    Err(error) => failure = error,
                    Ok(mut attempt_events) => loop {
                        let next = tokio::select! {
                            biased;
                            _ = deadline.token().cancelled() => Err(interruption(&deadline, config.attempt_timeout)),
                            event = attempt_events.next() => Ok(event),
                        };
                        match next {
                            Err(error) => {
                                failure = error;
                                break;
                            }
                            Ok(None) => break,
                            Ok(Some(StreamEvent::Error { error })) => {
                                failure = error;
                                break;
                            }
                            Ok(Some(event)) => {
                                let done = matches!(event, StreamEvent::Done { .. });
                                yield event;
                                if done {
                                    return;
                                }
                            }
                        }
                    },
                }

                // A provider that saw the deadline fire reports plain cancellation.
                if failure.is_cancelled() && deadline.timed_out() {
                    failure = GatewayError::Timeout(config.attempt_timeout.unwrap_or_default());
                }
                drop(deadline);

                if !failure.is_retryable() || attempt >= config.max_retries {
                    if attempt > 0 {
                        warn!(attempts = attempt + 1, error = %failure, "giving up on provider call");
                    }
                    yield StreamEvent::Error { error: failure };
                    return;
                }

                let delay = config.retry_delay(attempt, failure.suggested_delay());
                retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "retrying after error"
                );
                yield StreamEvent::Retry {
                    attempt: attempt + 1,
                    max_retries: config.max_retries,
                    delay_ms: delay.as_millis() as u64,
                    error: GatewayErrorInfo::from(&failure),
                };

                let slept = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                };
                if !slept {
                    debug!("cancelled during backoff");
                    yield StreamEvent::Error { error: GatewayError::Cancelled };
                    return;
                }
                attempt += 1;
            }
        };

        Ok(Box::pin(events))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
