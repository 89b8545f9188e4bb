//! Conversion inputs

use crate::dimensions::{Overrides, Rounding};
use crate::engine::WaitUntil;
use crate::{Error, Result};
use base64::Engine as _;
use std::time::Duration;
use url::Url;

/// The document to convert
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// URL or filesystem path
    Locator(String),
    /// SVG markup, loaded through a `data:` URL
    Markup(String),
}

/// Caller-facing conversion options
///
/// # Examples
///
/// ```
/// let opts = svgshot::ConvertOptions {
///     width: Some(640.0),
///     ..svgshot::ConvertOptions::from_locator("icons/logo.svg")
/// };
/// assert!(opts.height.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOptions {
    pub source: Source,
    /// Output width in pixels
    pub width: Option<f64>,
    /// Output height in pixels
    pub height: Option<f64>,
    /// Inverse zoom applied to the view box
    pub scale: Option<f64>,
    /// CSS colour painted behind the document; transparent when `None`
    pub background: Option<String>,
    pub rounding: Rounding,
    pub wait_until: WaitUntil,
    pub navigation_timeout_ms: Option<u64>,
    pub conversion_timeout_ms: Option<u64>,
    /// Echo the request history to the debug log as it is recorded
    pub debug: bool,
}

impl ConvertOptions {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            width: None,
            height: None,
            scale: None,
            background: None,
            rounding: Rounding::default(),
            wait_until: WaitUntil::default(),
            navigation_timeout_ms: None,
            conversion_timeout_ms: None,
            debug: false,
        }
    }

    pub fn from_locator(locator: impl Into<String>) -> Self {
        Self::new(Source::Locator(locator.into()))
    }

    pub fn from_markup(markup: impl Into<String>) -> Self {
        Self::new(Source::Markup(markup.into()))
    }
}

/// Timeouts applied when the options leave them unset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub navigation: Duration,
    pub conversion: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            conversion: Duration::from_secs(300),
        }
    }
}

/// A validated, immutable request
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    id: u64,
    locator: String,
    overrides: Overrides,
    background: Option<String>,
    rounding: Rounding,
    wait_until: WaitUntil,
    navigation_timeout: Duration,
    conversion_timeout: Duration,
    debug: bool,
}

impl ConversionRequest {
    /// Validate `options` and copy everything the pipeline needs out of them.
    pub async fn new(id: u64, options: &ConvertOptions, defaults: Timeouts) -> Result<Self> {
        let overrides = Overrides {
            width: options.width,
            height: options.height,
            scale: options.scale,
        };
        overrides.validate()?;

        let locator = match &options.source {
            Source::Locator(raw) => normalize_locator(raw).await?,
            Source::Markup(markup) => markup_locator(markup)?,
        };

        let navigation_timeout = timeout(options.navigation_timeout_ms, defaults.navigation, "navigation")?;
        let conversion_timeout = timeout(options.conversion_timeout_ms, defaults.conversion, "conversion")?;

        Ok(Self {
            id,
            locator,
            overrides,
            background: options
                .background
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string),
            rounding: options.rounding,
            wait_until: options.wait_until,
            navigation_timeout,
            conversion_timeout,
            debug: options.debug,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    pub fn background(&self) -> Option<&str> {
        self.background.as_deref()
    }

    pub fn rounding(&self) -> Rounding {
        self.rounding
    }

    pub fn wait_until(&self) -> WaitUntil {
        self.wait_until
    }

    pub fn navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    pub fn conversion_timeout(&self) -> Duration {
        self.conversion_timeout
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

fn timeout(ms: Option<u64>, default: Duration, what: &str) -> Result<Duration> {
    match ms {
        Some(0) => Err(Error::InvalidOptions(format!("{} timeout must be positive", what))),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

const URL_SCHEMES: &[&str] = &["http", "https", "file", "data", "about"];

/// Turn a URL or filesystem path into a locator the engine can navigate to.
///
/// Paths are canonicalized and become `file://` URLs, so they must exist.
pub async fn normalize_locator(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidOptions("source locator is empty".into()));
    }

    if let Ok(url) = Url::parse(raw) {
        if URL_SCHEMES.contains(&url.scheme()) {
            return Ok(url.into());
        }
    }

    let path = tokio::fs::canonicalize(raw).await.map_err(|e| {
        Error::InvalidOptions(format!("cannot resolve source path '{}': {}", raw, e))
    })?;
    Url::from_file_path(&path)
        .map(String::from)
        .map_err(|_| Error::InvalidOptions(format!("'{}' is not an absolute path", path.display())))
}

fn markup_locator(markup: &str) -> Result<String> {
    if markup.trim().is_empty() {
        return Err(Error::InvalidOptions("SVG markup is empty".into()));
    }
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(markup)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn network_locators_are_kept() {
        assert_eq!(
            normalize_locator(" https://example.com/a.svg ").await.unwrap(),
            "https://example.com/a.svg"
        );
        assert_eq!(
            normalize_locator("file:///tmp/x.svg").await.unwrap(),
            "file:///tmp/x.svg"
        );
    }

    #[tokio::test]
    async fn paths_become_file_urls() {
        let path = std::env::temp_dir().join(format!("svgshot-locator-{}.svg", std::process::id()));
        std::fs::write(&path, "<svg xmlns='http://www.w3.org/2000/svg'/>").unwrap();

        let locator = normalize_locator(path.to_str().unwrap()).await.unwrap();
        assert!(locator.starts_with("file://"));
        assert!(locator.ends_with(".svg"));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_paths_are_rejected() {
        let err = normalize_locator("definitely/not/here.svg").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
        assert!(normalize_locator("  ").await.is_err());
    }

    #[tokio::test]
    async fn markup_becomes_data_url() {
        let markup = "<svg xmlns='http://www.w3.org/2000/svg' width='1' height='1'/>";
        let request = ConversionRequest::new(1, &ConvertOptions::from_markup(markup), Timeouts::default()).await.unwrap();
        let encoded = request
            .locator()
            .strip_prefix("data:image/svg+xml;base64,")
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, markup.as_bytes());
    }

    #[tokio::test]
    async fn request_copies_and_validates_options() {
        let mut options = ConvertOptions::from_markup("<svg/>");
        options.scale = Some(0.0);
        let err = ConversionRequest::new(1, &options, Timeouts::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        options.scale = Some(2.0);
        options.conversion_timeout_ms = Some(1500);
        options.background = Some("  ".into());
        let request = ConversionRequest::new(9, &options, Timeouts::default()).await.unwrap();
        options.scale = Some(5.0);

        assert_eq!(request.id(), 9);
        assert_eq!(request.overrides().scale, Some(2.0));
        assert_eq!(request.conversion_timeout(), Duration::from_millis(1500));
        assert_eq!(request.navigation_timeout(), Duration::from_secs(30));
        assert_eq!(request.background(), None);
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let options = ConvertOptions {
            navigation_timeout_ms: Some(0),
            ..ConvertOptions::from_markup("<svg/>")
        };
        assert!(ConversionRequest::new(1, &options, Timeouts::default()).await.is_err());
    }
}
