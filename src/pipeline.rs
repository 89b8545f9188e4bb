//! End-to-end conversion of one request
//!
//! ```text
//! NotStarted ──session opened──▶ Pending ──▶ Done
//!     │                             │
//!     └──────────────┬──────────────┘
//!                    ▼
//!           Failed | Cancelled
//! ```
//!
//! A deadline timer is armed as soon as the request starts waiting on the pool.
//! When it fires the request's [`CancelSignal`] is raised; the pipeline notices
//! at its next checkpoint. Engine calls already in flight are allowed to finish
//! and their results are dropped. This is an accepted limitation of the remote
//! control protocol, which offers no safe way to abort a call midway.

use crate::cancel::CancelSignal;
use crate::capture::{self, capture_surface, CaptureLimits};
use crate::codec::{Codec, PngCodec};
use crate::config::Config;
use crate::dimensions::resolve;
use crate::document::{DocumentSize, SizePlan, APPLY_SIZE_SCRIPT, READ_SIZE_SCRIPT};
use crate::engine::{NavigateOptions, Session};
use crate::health::CloseFailures;
use crate::history::History;
use crate::pool::{InstancePool, Lease};
use crate::request::{ConversionRequest, ConvertOptions, Timeouts};
use crate::{Error, Result};
use log::{debug, warn};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Longest we wait for a session to close before recording it as failed
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest locator prefix copied into the history
const LOCATOR_PREVIEW: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    NotStarted,
    Pending,
    Done,
    Failed,
    Cancelled,
}

impl ConversionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversionState::Done | ConversionState::Failed | ConversionState::Cancelled
        )
    }

    pub fn can_transition(self, next: ConversionState) -> bool {
        use ConversionState::*;
        matches!(
            (self, next),
            (NotStarted, Pending | Failed | Cancelled) | (Pending, Done | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversionState::NotStarted => "not-started",
            ConversionState::Pending => "pending",
            ConversionState::Done => "done",
            ConversionState::Failed => "failed",
            ConversionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed conversion, with everything needed for a post-mortem
#[derive(Debug, thiserror::Error)]
#[error("Conversion {request_id} {state}: {source}")]
pub struct ConversionError {
    pub request_id: u64,
    pub state: ConversionState,
    pub source: Error,
    pub history: History,
}

impl ConversionError {
    pub fn kind(&self) -> &Error {
        &self.source
    }
}

struct Conversion {
    request: ConversionRequest,
    state: ConversionState,
    history: History,
    signal: CancelSignal,
}

impl Conversion {
    fn new(request: ConversionRequest, signal: CancelSignal) -> Self {
        let history = History::new(request.id(), request.debug());
        Self {
            request,
            state: ConversionState::NotStarted,
            history,
            signal,
        }
    }

    fn transition(&mut self, next: ConversionState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::InvalidState(format!(
                "request {} cannot move from {} to {}",
                self.request.id(),
                self.state,
                next
            )));
        }
        self.history.record(format!("state:{}", next));
        self.state = next;
        Ok(())
    }

    fn fail(mut self, error: Error) -> ConversionError {
        let next = if error.is_cancelled() {
            ConversionState::Cancelled
        } else {
            ConversionState::Failed
        };
        if let Err(e) = self.transition(next) {
            warn!("{}", e);
        }
        self.history
            .record_with("error", json!({ "message": error.to_string() }));
        debug!("Request {} ended {}: {}", self.request.id(), self.state, error);
        ConversionError {
            request_id: self.request.id(),
            state: self.state,
            source: error,
            history: self.history,
        }
    }
}

/// Aborts the deadline timer when the conversion finishes or is dropped
struct Deadline(JoinHandle<()>);

impl Deadline {
    fn arm(signal: CancelSignal, after: Duration) -> Self {
        Self(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    let reason = format!("conversion timed out after {}ms", after.as_millis());
                    if let Err(e) = signal.cancel(reason) {
                        debug!("Deadline elapsed after cancellation: {}", e);
                    }
                }
                _ = signal.cancelled() => {}
            }
        }))
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Converts documents using instances from a shared pool
pub struct Converter {
    pool: InstancePool,
    codec: Arc<dyn Codec>,
    limits: CaptureLimits,
    timeouts: Timeouts,
    close_failures: CloseFailures,
    next_request: AtomicU64,
}

impl Converter {
    /// A converter with the PNG codec and default limits and timeouts
    pub fn new(pool: InstancePool) -> Self {
        Self {
            pool,
            codec: Arc::new(PngCodec),
            limits: CaptureLimits::default(),
            timeouts: Timeouts::default(),
            close_failures: CloseFailures::new(),
            next_request: AtomicU64::new(0),
        }
    }

    /// Configure `pool` from `config` and build a converter around it.
    ///
    /// Fails with [`Error::ConfigLocked`] if the pool was already configured or used.
    pub fn from_config(pool: InstancePool, config: &Config) -> Result<Self> {
        config.validate()?;
        pool.configure(config.pool.clone())?;
        Ok(Self::new(pool)
            .with_limits(config.capture)
            .with_timeouts(config.timeouts()))
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_limits(mut self, limits: CaptureLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Ids of requests whose session failed to close
    pub fn close_failures(&self) -> Vec<u64> {
        self.close_failures.snapshot()
    }

    pub fn take_close_failures(&self) -> Vec<u64> {
        self.close_failures.take()
    }

    /// Drain the pool. Must be awaited before the process exits.
    pub async fn shutdown(&self) {
        self.pool.drain_and_close().await;
    }

    /// Convert one document to PNG bytes.
    pub async fn convert(&self, options: &ConvertOptions) -> std::result::Result<Vec<u8>, ConversionError> {
        self.convert_with_signal(options, CancelSignal::new()).await
    }

    /// Convert with a caller-held cancel signal in addition to the deadline.
    pub async fn convert_with_signal(
        &self,
        options: &ConvertOptions,
        signal: CancelSignal,
    ) -> std::result::Result<Vec<u8>, ConversionError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let request = match ConversionRequest::new(id, options, self.timeouts).await {
            Ok(request) => request,
            Err(error) => {
                let mut history = History::new(id, options.debug);
                history.record_with("rejected", json!({ "message": error.to_string() }));
                return Err(ConversionError {
                    request_id: id,
                    state: ConversionState::Failed,
                    source: error,
                    history,
                });
            }
        };

        let mut run = Conversion::new(request, signal);
        run.history.record_with(
            "accepted",
            json!({
                "locator": preview(run.request.locator()),
                "overrides": run.request.overrides(),
                "timeoutMs": run.request.conversion_timeout().as_millis() as u64,
            }),
        );

        let deadline = Deadline::arm(run.signal.clone(), run.request.conversion_timeout());
        let outcome = self.execute(&mut run).await;
        drop(deadline);

        match outcome.and_then(|bytes| run.transition(ConversionState::Done).map(|_| bytes)) {
            Ok(bytes) => {
                debug!("Request {} done ({} bytes)", id, bytes.len());
                Ok(bytes)
            }
            Err(error) => Err(run.fail(error)),
        }
    }

    async fn execute(&self, run: &mut Conversion) -> Result<Vec<u8>> {
        run.history.record("pool:waiting");
        let acquired = self.pool.acquire_cancellable(run.signal.token()).await;
        let lease = match acquired {
            Ok(lease) => lease,
            Err(error) => {
                run.signal.check()?;
                return Err(error);
            }
        };
        if let Err(cancelled) = run.signal.check() {
            self.pool.release(lease).await;
            return Err(cancelled);
        }
        run.history.record_with(
            "pool:acquired",
            json!({ "instance": lease.id(), "uses": lease.uses() }),
        );

        let outcome = self.run_on(run, &lease).await;
        self.pool.release(lease).await;
        run.history.record("pool:released");
        outcome
    }

    async fn run_on(&self, run: &mut Conversion, lease: &Lease) -> Result<Vec<u8>> {
        let opened = lease.instance().open_session().await;
        let session = match opened {
            Ok(session) => session,
            Err(error) => {
                run.signal.check()?;
                return Err(error);
            }
        };
        let mut guard = SessionGuard {
            session: Some(session),
            request_id: run.request.id(),
            failures: self.close_failures.clone(),
        };
        run.history.record("session:opened");

        let outcome = match run
            .transition(ConversionState::Pending)
            .and_then(|_| guard.session())
        {
            Ok(session) => self.drive(run, session).await,
            Err(e) => Err(e),
        };
        self.close_session(run, &mut guard).await;
        outcome
    }

    async fn drive(&self, run: &mut Conversion, session: &mut dyn Session) -> Result<Vec<u8>> {
        run.signal.check()?;
        let locator = run.request.locator().to_string();

        let navigated = session
            .navigate(
                &locator,
                &NavigateOptions {
                    wait_until: run.request.wait_until(),
                    timeout: run.request.navigation_timeout(),
                },
            )
            .await;
        run.signal.check()?;
        let response = navigated
            .map_err(|e| match e {
                Error::NavigationFailed(_) => e,
                other => Error::NavigationFailed(other.to_string()),
            })?
            .ok_or_else(|| {
                Error::NavigationFailed(format!("no response for {}", preview(&locator)))
            })?;
        if !response.ok() {
            return Err(Error::NavigationFailed(format!(
                "{} responded with status {}",
                preview(&locator),
                response.status
            )));
        }
        run.history
            .record_with("navigated", json!({ "status": response.status }));

        let read = session.evaluate(READ_SIZE_SCRIPT, serde_json::Value::Null).await;
        run.signal.check()?;
        let size = DocumentSize::from_script_value(read?)?;
        run.history.record_with(
            "document:size",
            serde_json::to_value(size).unwrap_or(serde_json::Value::Null),
        );

        let resolution = resolve(
            &size.intrinsic(),
            size.view_box,
            run.request.overrides(),
            run.request.rounding(),
        )?;
        let dimensions = resolution.dimensions;
        run.history.record_with(
            "dimensions",
            json!({
                "width": dimensions.width,
                "height": dimensions.height,
                "scale": dimensions.scale,
            }),
        );

        let plan = SizePlan::new(&resolution, run.request.background());
        let applied = session.evaluate(APPLY_SIZE_SCRIPT, plan.to_args()).await;
        run.signal.check()?;
        applied?;

        let sized = session
            .set_surface_size(dimensions.width, dimensions.height)
            .await;
        run.signal.check()?;
        sized?;
        run.history.record("surface:sized");

        let capture_plan = capture::plan(dimensions.width, dimensions.height, &self.limits)?;
        let bytes = capture_surface(
            session,
            self.codec.clone(),
            &capture_plan,
            run.request.background().is_none(),
            &run.signal,
            &mut run.history,
        )
        .await?;
        run.history
            .record_with("encoded", json!({ "bytes": bytes.len() }));
        Ok(bytes)
    }

    async fn close_session(&self, run: &mut Conversion, guard: &mut SessionGuard) {
        let Some(mut session) = guard.session.take() else {
            return;
        };
        match close_within(session.as_mut()).await {
            None => run.history.record("session:closed"),
            Some(error) => {
                warn!("Request {}: {}", run.request.id(), error);
                run.history
                    .record_with("session:close-failed", json!({ "message": error.to_string() }));
                self.close_failures.record(run.request.id());
            }
        }
    }
}

/// Holds a request's open session until it is closed.
///
/// If the conversion future is dropped before reaching its close, the session
/// is closed on the runtime in the background and a failure is still recorded.
struct SessionGuard {
    session: Option<Box<dyn Session>>,
    request_id: u64,
    failures: CloseFailures,
}

impl SessionGuard {
    fn session(&mut self) -> Result<&mut dyn Session> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(Error::InvalidState("session is already closed".into())),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let id = self.request_id;
        let failures = self.failures.clone();
        warn!("Request {} abandoned with its session open; closing it", id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(error) = close_within(session.as_mut()).await {
                        warn!("Request {}: {}", id, error);
                        failures.record(id);
                    }
                });
            }
            Err(_) => failures.record(id),
        }
    }
}

async fn close_within(session: &mut dyn Session) -> Option<Error> {
    match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(Error::SessionCloseFailed(e.to_string())),
        Err(_) => Some(Error::SessionCloseFailed(format!(
            "no answer after {}s",
            SESSION_CLOSE_TIMEOUT.as_secs()
        ))),
    }
}

fn preview(locator: &str) -> String {
    match locator.char_indices().nth(LOCATOR_PREVIEW) {
        Some((cut, _)) => format!("{}...", &locator[..cut]),
        None => locator.to_string(),
    }
}
