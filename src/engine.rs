//! Contract with the external rendering engine
//!
//! The core never talks to a browser directly. It launches instances through an
//! [`InstanceFactory`], opens one [`Session`] per request on a borrowed
//! [`RenderingInstance`], and drives it through the narrow set of calls below.
//! The `cdp` module provides the headless Chrome implementation; tests use an
//! in-process fake.

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Launches rendering engine instances for the pool
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    /// Start a new engine instance. `id` is the pool-assigned identity.
    async fn launch(&self, id: u64) -> Result<Arc<dyn RenderingInstance>>;
}

/// One running engine process
///
/// Methods take `&self` so the pool can force-close an instance that is still
/// checked out; implementations must make `close` idempotent and fail any
/// later call on an already-closed instance.
#[async_trait]
pub trait RenderingInstance: Send + Sync {
    /// Open a fresh browsing context for a single request
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Cheap liveness probe used by the default pool validator
    fn is_alive(&self) -> bool;

    /// Terminate the engine process
    async fn close(&self) -> Result<()>;
}

/// A browsing context scoped to one request
#[async_trait]
pub trait Session: Send {
    /// Load `locator`. `Ok(None)` means the engine produced no main-document response.
    async fn navigate(
        &mut self,
        locator: &str,
        options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>>;

    /// Resize the drawing surface in device pixels
    async fn set_surface_size(&mut self, width: u32, height: u32) -> Result<()>;

    /// Call the JavaScript function expression `function` with `args` and return
    /// its JSON-serializable result.
    async fn evaluate(
        &mut self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Capture the surface (or a clip of it) as encoded image bytes
    async fn capture(&mut self, options: &CaptureOptions) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// When navigation counts as finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    /// Wait for the document load event
    #[default]
    Load,
    /// Return as soon as the navigation is committed
    Commit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigateOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

/// Main-document response observed during navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationResponse {
    /// Status code; `0` for schemes without one (`file:`, `data:`)
    pub status: u16,
}

impl NavigationResponse {
    pub fn ok(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status)
    }
}

/// A rectangle of the surface in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// `None` captures the full surface
    pub clip: Option<ClipRegion>,
    /// Leave the default background transparent
    pub omit_background: bool,
}
