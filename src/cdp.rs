//! Chrome DevTools Protocol adapter implementation
//!
//! Implements the [`crate::engine`] traits on top of the `headless_chrome`
//! crate. Its API is blocking, so every call is moved onto tokio's blocking
//! pool. One browser process backs each pooled instance and each session is a
//! fresh tab.

use crate::engine::{
    CaptureOptions, InstanceFactory, NavigateOptions, NavigationResponse, RenderingInstance,
    Session, WaitUntil,
};
use crate::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Page, DOM};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Status of the main document, or `null` when the page has no navigation entry
const RESPONSE_STATUS_SCRIPT: &str = r#"
(function() {
    const entry = performance.getEntriesByType('navigation')[0];
    if (!entry) {
        return null;
    }
    return typeof entry.responseStatus === 'number' ? entry.responseStatus : 0;
})()
"#;

/// How browser processes are launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChromeConfig {
    /// Chrome binary; auto-detected when unset
    pub path: Option<PathBuf>,
    pub sandbox: bool,
    /// How long the DevTools connection may stay silent before the browser is dropped
    pub idle_browser_timeout_ms: u64,
    /// Extra command line switches
    pub args: Vec<String>,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            path: None,
            sandbox: true,
            idle_browser_timeout_ms: 600_000,
            args: Vec::new(),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::CdpError(format!("Browser worker failed: {}", e)))?
}

/// Launches one headless Chrome process per pooled instance
#[derive(Debug, Clone, Default)]
pub struct ChromeFactory {
    config: ChromeConfig,
}

impl ChromeFactory {
    pub fn new(config: ChromeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InstanceFactory for ChromeFactory {
    async fn launch(&self, id: u64) -> Result<Arc<dyn RenderingInstance>> {
        let config = self.config.clone();
        let browser = blocking(move || {
            let args: Vec<OsString> = config.args.iter().map(OsString::from).collect();
            let launch_options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(config.sandbox)
                .path(config.path.clone())
                .idle_browser_timeout(Duration::from_millis(config.idle_browser_timeout_ms))
                .args(args.iter().map(OsString::as_os_str).collect::<Vec<&OsStr>>())
                .build()
                .map_err(|e| Error::CdpError(format!("Failed to build launch options: {}", e)))?;

            Ok(Browser::new(launch_options).context("Failed to launch browser")?)
        })
        .await?;
        debug!("Launched browser instance {}", id);

        Ok(Arc::new(ChromeInstance {
            id,
            browser: Mutex::new(Some(Arc::new(browser))),
            alive: AtomicBool::new(true),
        }))
    }
}

/// A running browser process
pub struct ChromeInstance {
    id: u64,
    browser: Mutex<Option<Arc<Browser>>>,
    alive: AtomicBool,
}

impl ChromeInstance {
    fn browser(&self) -> Result<Arc<Browser>> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::CdpError(format!("Browser instance {} is closed", self.id)))
    }
}

#[async_trait]
impl RenderingInstance for ChromeInstance {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let browser = self.browser()?;
        let opened = blocking(move || {
            browser
                .new_tab()
                .map_err(|e| Error::RenderError(format!("Failed to create tab: {}", e)))
        })
        .await;
        match opened {
            Ok(tab) => Ok(Box::new(ChromeSession { tab })),
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
            && self
                .browser
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(browser) = browser {
            // Dropping the last handle kills the process and waits for it.
            blocking(move || {
                drop(browser);
                Ok(())
            })
            .await?;
            debug!("Closed browser instance {}", self.id);
        }
        Ok(())
    }
}

/// One tab
pub struct ChromeSession {
    tab: Arc<Tab>,
}

#[async_trait]
impl Session for ChromeSession {
    async fn navigate(
        &mut self,
        locator: &str,
        options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>> {
        let tab = self.tab.clone();
        let locator = locator.to_string();
        let options = options.clone();
        blocking(move || {
            tab.set_default_timeout(options.timeout);
            tab.navigate_to(&locator)
                .map_err(|e| Error::NavigationFailed(format!("Navigation failed: {}", e)))?;
            if options.wait_until == WaitUntil::Load {
                tab.wait_until_navigated().map_err(|e| {
                    Error::NavigationFailed(format!("Wait for navigation failed: {}", e))
                })?;
            }

            let status = tab
                .evaluate(RESPONSE_STATUS_SCRIPT, false)
                .map_err(|e| Error::ScriptError(format!("Failed to read response status: {}", e)))?
                .value
                .and_then(|v| v.as_u64());
            // A committed navigation may not have its timing entry yet.
            let status = match options.wait_until {
                WaitUntil::Commit => status.or(Some(0)),
                WaitUntil::Load => status,
            };
            Ok(status.map(|status| NavigationResponse {
                status: u16::try_from(status).unwrap_or(u16::MAX),
            }))
        })
        .await
    }

    async fn set_surface_size(&mut self, width: u32, height: u32) -> Result<()> {
        let tab = self.tab.clone();
        blocking(move || {
            tab.call_method(Emulation::SetDeviceMetricsOverride {
                width,
                height,
                device_scale_factor: 1.0,
                mobile: false,
                scale: None,
                screen_width: None,
                screen_height: None,
                position_x: None,
                position_y: None,
                dont_set_visible_size: None,
                screen_orientation: None,
                viewport: None,
                display_feature: None,
                device_posture: None,
            })
            .map_err(|e| Error::RenderError(format!("Failed to resize surface: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn evaluate(
        &mut self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tab = self.tab.clone();
        let expression = format!("JSON.stringify(({})({}))", function, args);
        blocking(move || {
            let result = tab
                .evaluate(&expression, false)
                .map_err(|e| Error::ScriptError(format!("Evaluation failed: {}", e)))?;
            match result.value {
                Some(serde_json::Value::String(json)) => serde_json::from_str(&json)
                    .map_err(|e| Error::ScriptError(format!("Script returned invalid JSON: {}", e))),
                _ => Ok(serde_json::Value::Null),
            }
        })
        .await
    }

    async fn capture(&mut self, options: &CaptureOptions) -> Result<Vec<u8>> {
        let tab = self.tab.clone();
        let options = *options;
        blocking(move || {
            let color = options.omit_background.then_some(DOM::RGBA {
                r: 0,
                g: 0,
                b: 0,
                a: Some(0.0),
            });
            tab.call_method(Emulation::SetDefaultBackgroundColorOverride { color })
                .map_err(|e| Error::RenderError(format!("Failed to set background: {}", e)))?;

            let clip = options.clip.map(|c| Page::Viewport {
                x: f64::from(c.x),
                y: f64::from(c.y),
                width: f64::from(c.width),
                height: f64::from(c.height),
                scale: 1.0,
            });
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, clip, true)
                .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let tab = self.tab.clone();
        blocking(move || {
            if !tab
                .close(true)
                .map_err(|e| Error::SessionCloseFailed(format!("Failed to close tab: {}", e)))?
            {
                warn!("Tab did not confirm close");
            }
            Ok(())
        })
        .await
    }
}
