//! In-process rendering engine for integration tests
//!
//! Captures synthesize a deterministic gradient so chunked and single-shot
//! output can be compared pixel for pixel.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svgshot::codec::{Codec, PngCodec, RawImage, CHANNELS};
use svgshot::document::{APPLY_SIZE_SCRIPT, READ_SIZE_SCRIPT};
use svgshot::engine::{
    CaptureOptions, InstanceFactory, NavigateOptions, NavigationResponse, RenderingInstance,
    Session,
};
use svgshot::{Error, Result};

/// What the main-document navigation returns
#[derive(Debug, Clone)]
pub enum Navigation {
    Status(u16),
    NoResponse,
    Fails,
}

/// Behaviour of every instance launched by a [`FakeFactory`]
#[derive(Debug, Clone)]
pub struct Script {
    pub fail_launch: bool,
    pub navigation: Navigation,
    /// Value returned by the size-reading script
    pub document: Value,
    /// Zero-based capture call that fails
    pub fail_capture_at: Option<usize>,
    /// Zero-based capture call that returns an image one row short
    pub short_capture_at: Option<usize>,
    pub capture_delay: Duration,
    pub fail_session_close: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_launch: false,
            navigation: Navigation::Status(200),
            document: sized(100.0, 50.0),
            fail_capture_at: None,
            short_capture_at: None,
            capture_delay: Duration::ZERO,
            fail_session_close: false,
        }
    }
}

/// Size-script result for an absolute `width`×`height` root
pub fn sized(width: f64, height: f64) -> Value {
    json!({
        "width": { "value": width, "percent": false },
        "height": { "value": height, "percent": false },
        "viewBox": null,
    })
}

/// Size-script result with only a view box
pub fn view_box_only(width: f64, height: f64) -> Value {
    json!({
        "width": null,
        "height": null,
        "viewBox": { "width": width, "height": height },
    })
}

/// Observations shared by a factory and everything it creates
#[derive(Debug, Default)]
pub struct Record {
    pub launched: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub instances_closed: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    /// Close calls per session, indexed by session number
    pub session_closes: Mutex<HashMap<usize, usize>>,
    pub captures: Mutex<Vec<CaptureOptions>>,
    pub plans: Mutex<Vec<Value>>,
    pub navigations: Mutex<Vec<String>>,
}

impl Record {
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Every opened session was closed exactly once
    pub fn all_sessions_closed_once(&self) -> bool {
        let closes = self.session_closes.lock().unwrap();
        let opened = self.sessions_opened();
        (0..opened).all(|i| closes.get(&i) == Some(&1)) && closes.len() == opened
    }

    pub fn captures(&self) -> Vec<CaptureOptions> {
        self.captures.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeFactory {
    pub script: Script,
    pub record: Arc<Record>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            record: Arc::new(Record::default()),
        }
    }
}

#[async_trait]
impl InstanceFactory for FakeFactory {
    async fn launch(&self, id: u64) -> Result<Arc<dyn RenderingInstance>> {
        if self.script.fail_launch {
            return Err(Error::PoolCreationFailed(format!("instance {} refused to start", id)));
        }
        self.record.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.record.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.record.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(FakeInstance {
            id,
            script: self.script.clone(),
            record: self.record.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct FakeInstance {
    pub id: u64,
    script: Script,
    record: Arc<Record>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RenderingInstance for FakeInstance {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RenderError("instance is closed".into()));
        }
        let number = self.record.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            number,
            script: self.script.clone(),
            record: self.record.clone(),
            instance_closed: self.closed.clone(),
            surface: None,
            captures: 0,
        }))
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record.live.fetch_sub(1, Ordering::SeqCst);
            self.record.instances_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakeSession {
    number: usize,
    script: Script,
    record: Arc<Record>,
    instance_closed: Arc<AtomicBool>,
    surface: Option<(u32, u32)>,
    captures: usize,
}

impl FakeSession {
    fn ensure_open(&self) -> Result<()> {
        if self.instance_closed.load(Ordering::SeqCst) {
            return Err(Error::RenderError("instance is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn navigate(
        &mut self,
        locator: &str,
        _options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>> {
        self.ensure_open()?;
        self.record.navigations.lock().unwrap().push(locator.to_string());
        match self.script.navigation {
            Navigation::Status(status) => Ok(Some(NavigationResponse { status })),
            Navigation::NoResponse => Ok(None),
            Navigation::Fails => Err(Error::NavigationFailed("net::ERR_CONNECTION_REFUSED".into())),
        }
    }

    async fn set_surface_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_open()?;
        self.surface = Some((width, height));
        Ok(())
    }

    async fn evaluate(&mut self, function: &str, args: Value) -> Result<Value> {
        self.ensure_open()?;
        if function == READ_SIZE_SCRIPT {
            Ok(self.script.document.clone())
        } else if function == APPLY_SIZE_SCRIPT {
            self.record.plans.lock().unwrap().push(args);
            Ok(Value::Bool(true))
        } else {
            Err(Error::ScriptError("unknown script".into()))
        }
    }

    async fn capture(&mut self, options: &CaptureOptions) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let call = self.captures;
        self.captures += 1;
        self.record.captures.lock().unwrap().push(*options);
        if !self.script.capture_delay.is_zero() {
            tokio::time::sleep(self.script.capture_delay).await;
        }
        if self.script.fail_capture_at == Some(call) {
            return Err(Error::RenderError(format!("capture {} crashed", call)));
        }

        let (width, height) = self
            .surface
            .ok_or_else(|| Error::RenderError("surface was never sized".into()))?;
        let (x, y, w, mut h) = match options.clip {
            Some(clip) => (clip.x, clip.y, clip.width, clip.height),
            None => (0, 0, width, height),
        };
        if self.script.short_capture_at == Some(call) {
            h -= 1;
        }
        PngCodec.encode_raw(gradient(x, y, w, h))
    }

    async fn close(&mut self) -> Result<()> {
        *self
            .record
            .session_closes
            .lock()
            .unwrap()
            .entry(self.number)
            .or_insert(0) += 1;
        if self.script.fail_session_close {
            return Err(Error::RenderError("target crashed".into()));
        }
        Ok(())
    }
}

/// Pixel (x, y) of the synthetic surface
pub fn pixel(x: u32, y: u32) -> [u8; 4] {
    [(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255]
}

/// The synthetic surface cropped to the given region
pub fn gradient(x0: u32, y0: u32, width: u32, height: u32) -> RawImage {
    let mut buffer = Vec::with_capacity(RawImage::expected_len(width, height, CHANNELS));
    for y in y0..y0 + height {
        for x in x0..x0 + width {
            buffer.extend_from_slice(&pixel(x, y));
        }
    }
    RawImage {
        buffer,
        width,
        height,
        channels: CHANNELS,
    }
}

pub fn decode(png: &[u8]) -> RawImage {
    PngCodec.decode_to_raw(png).unwrap()
}
