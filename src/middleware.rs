//! Middleware chain (§4.7): interception of request initiation, response
//! termination, per-frame pass-through, and error observation, composed in
//! order and shared verbatim between the caller and responder sides of one
//! [`crate::endpoint::Endpoint`].

use crate::contract::Pattern;
use crate::status::Status;
use crate::wire::{Frame, StreamId};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a middleware hook sees: enough to log or key a policy by, without
/// handing over the call's live channels (§4.7: a hook "may transform the
/// payload or metadata, short-circuit ... or let it pass" — this crate's
/// hooks transform by returning an `Err` that short-circuits the call with
/// that status, and observe otherwise; see `DESIGN.md` for why payload
/// rewriting is out of scope for the shipped middlewares).
#[derive(Debug, Clone)]
pub struct CallContext {
    pub method_path: String,
    pub pattern: Pattern,
    pub stream_id: StreamId,
    pub label: Option<String>,
}

/// One hook point implementation. All methods default to a no-op so a
/// middleware only needs to implement the hooks it cares about (§4.7).
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Outbound request initiation, before the first frame is sent. An
    /// `Err` short-circuits the call with that status instead of opening
    /// the stream.
    async fn on_request(&self, _ctx: &CallContext) -> Result<()> {
        Ok(())
    }

    /// Inbound response termination: the call's terminal status, observed
    /// on both caller and responder sides.
    async fn on_response(&self, _ctx: &CallContext, _status: &Status) {}

    /// Per-frame pass-through, both directions (§4.7). Returning `Err`
    /// aborts the call; middleware MUST NOT hold the frame indefinitely
    /// (§4.7) — these hooks are `await`ed inline on the hot path.
    async fn on_frame(&self, _ctx: &CallContext, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &CallContext, _error: &Error) {}
}

/// An ordered composition of [`Middleware`] (§4.7). The same chain instance
/// is consulted by both the caller and responder halves of an endpoint.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        MiddlewareChain { middlewares: Vec::new() }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.push(middleware);
        self
    }

    pub async fn before_request(&self, ctx: &CallContext) -> Result<()> {
        for middleware in &self.middlewares {
            middleware.on_request(ctx).await?;
        }
        Ok(())
    }

    pub async fn after_response(&self, ctx: &CallContext, status: &Status) {
        for middleware in &self.middlewares {
            middleware.on_response(ctx, status).await;
        }
    }

    pub async fn on_frame(&self, ctx: &CallContext, frame: &Frame) -> Result<()> {
        for middleware in &self.middlewares {
            middleware.on_frame(ctx, frame).await?;
        }
        Ok(())
    }

    pub async fn on_error(&self, ctx: &CallContext, error: &Error) {
        for middleware in &self.middlewares {
            middleware.on_error(ctx, error).await;
        }
    }
}

/// Emits a `tracing` event at each hook, carrying method path, pattern, and
/// stream id (grounded in the teacher's `client::retry`/`circuit_breaker`
/// `tracing::{debug, warn}` call sites).
#[derive(Debug, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn on_request(&self, ctx: &CallContext) -> Result<()> {
        debug!(
            method = %ctx.method_path,
            pattern = ?ctx.pattern,
            stream = %ctx.stream_id,
            label = ctx.label.as_deref().unwrap_or("-"),
            "call started"
        );
        Ok(())
    }

    async fn on_response(&self, ctx: &CallContext, status: &Status) {
        if status.is_ok() {
            debug!(method = %ctx.method_path, stream = %ctx.stream_id, "call completed OK");
        } else {
            warn!(method = %ctx.method_path, stream = %ctx.stream_id, status = %status, "call completed with error");
        }
    }

    async fn on_error(&self, ctx: &CallContext, error: &Error) {
        warn!(method = %ctx.method_path, stream = %ctx.stream_id, error = %error, "middleware observed an error");
    }
}

/// Exponential-backoff-plus-jitter retry, generalised from the teacher's
/// `transport::client::retry::RetryExecutor`. Not one of the four
/// [`Middleware`] hooks: retrying means replaying the *whole* call, which
/// only [`crate::caller::CallerEndpoint`] is positioned to do, so this is a
/// standalone policy object the caller endpoint wraps unary/client-stream
/// invocations in when configured (see `DESIGN.md`).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { max_retries: 0, backoff_ms: 100 }
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        RetryExecutor { config }
    }

    /// Only status codes that plausibly reflect a transient condition are
    /// retried (§7 class 4 transport failures, resource exhaustion); a
    /// handler-supplied `INVALID_ARGUMENT` or similar will never succeed on
    /// replay.
    fn is_retryable(error: &Error) -> bool {
        matches!(
            error,
            Error::Unavailable(_) | Error::Io(_)
        ) || matches!(error, Error::Status(s) if matches!(s.code, crate::status::StatusCode::ResourceExhausted | crate::status::StatusCode::Unavailable))
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let max_attempts = self.config.max_retries + 1;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && Self::is_retryable(&err) => {
                    let backoff = self.config.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    let jitter_range = (backoff / 4) as i64;
                    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range as f64;
                    let delay = (backoff as i64 + jitter as i64).max(0) as u64;
                    warn!(attempt, max_attempts, error = %err, delay_ms = delay, "retrying call");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Closed/open/half-open circuit breaker, generalised from the teacher's
/// `transport::client::circuit_breaker::CircuitBreaker`.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig { failure_threshold: 5, success_threshold: 2, reset_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<tokio::time::Instant>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: tokio::sync::RwLock<CircuitBreakerState>,
    label: String,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: tokio::sync::RwLock::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
            label: label.into(),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit().await?;
        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    async fn admit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_millis(self.config.reset_timeout_ms) {
                    debug!(label = %self.label, "circuit breaker half-opening");
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(Error::Unavailable(format!("circuit breaker open for '{}'", self.label)))
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        if state.state == CircuitState::HalfOpen && state.consecutive_successes >= self.config.success_threshold {
            debug!(label = %self.label, "circuit breaker closing");
            state.state = CircuitState::Closed;
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.last_failure = Some(tokio::time::Instant::now());
        if state.state != CircuitState::Open && state.consecutive_failures >= self.config.failure_threshold {
            warn!(label = %self.label, failures = state.consecutive_failures, "circuit breaker opening");
            state.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_executor_retries_unavailable_errors() {
        let executor = RetryExecutor::new(RetryConfig { max_retries: 2, backoff_ms: 1 });
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = executor
            .execute(|| async {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 1 {
                    Err(Error::Unavailable("transient".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_executor_does_not_retry_non_transient_errors() {
        let executor = RetryExecutor::new(RetryConfig { max_retries: 3, backoff_ms: 1 });
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = executor
            .execute(|| async {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(Error::Unimplemented("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig { failure_threshold: 2, success_threshold: 1, reset_timeout_ms: 10_000 },
        );
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<(), _>(Error::Unavailable("x".into())) }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        let result = cb.execute(|| async { Ok::<(), Error>(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn circuit_breaker_half_opens_after_timeout_then_closes() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig { failure_threshold: 1, success_threshold: 1, reset_timeout_ms: 10 },
        );
        let _ = cb.execute(|| async { Err::<(), _>(Error::Unavailable("x".into())) }).await;
        assert_eq!(cb.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = cb.execute(|| async { Ok::<(), Error>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
