//! svgshot
//!
//! Converts SVG documents to PNG images by driving a pool of headless browser
//! instances.
//!
//! # Features
//!
//! - **CDP Backend** (default): Uses Chrome DevTools Protocol via headless Chrome
//! - **Pooled instances**: bounded concurrency, per-instance use limits and idle eviction
//! - **Chunked capture**: surfaces larger than one capture allows are stitched from strips
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use svgshot::cdp::ChromeFactory;
//! use svgshot::{ConvertOptions, Converter, InstancePool};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = InstancePool::new(Arc::new(ChromeFactory::default()));
//! let converter = Converter::new(pool);
//!
//! let options = ConvertOptions {
//!     width: Some(512.0),
//!     ..ConvertOptions::from_locator("logo.svg")
//! };
//! let png = converter.convert(&options).await?;
//! std::fs::write("logo.png", png)?;
//!
//! converter.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod cancel;
pub mod capture;
pub mod codec;
pub mod config;
pub mod dimensions;
pub mod document;
pub mod engine;
pub mod health;
pub mod history;
pub mod pipeline;
pub mod pool;
pub mod request;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use cancel::CancelSignal;
pub use capture::{CaptureLimits, CapturePlan};
pub use codec::{Codec, PngCodec, RawImage};
pub use config::Config;
pub use dimensions::{Dimensions, Rounding};
pub use engine::{InstanceFactory, RenderingInstance, Session, WaitUntil};
pub use history::{History, HistoryEvent};
pub use pipeline::{ConversionError, ConversionState, Converter};
pub use pool::{InstancePool, PoolConfig, PoolStatus};
pub use request::{ConvertOptions, Source, Timeouts};
