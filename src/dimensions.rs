//! Output size resolution
//!
//! Reconciles the document's intrinsic `width`/`height` attributes, its view
//! box, and caller overrides into the integer pixel size of the raster surface.
//!
//! Overrides are applied as attribute replacements before anything else: as
//! soon as any override is given, the intrinsic `width` and `height` are both
//! replaced by the override values, and an omitted override removes the
//! attribute. The rules below then only see "present" or "absent":
//!
//! 1. a `scale` override sizes the surface to `viewBox / scale`
//! 2. width and height both present are used as-is
//! 3. one of them present plus a view box derives the other from the box's aspect ratio
//! 4. anything else is [`Error::DimensionsUndetermined`]

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for either side of the raster surface
pub const MAX_DIMENSION: u32 = 1 << 20;

/// A length attribute as reported by the document
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Length {
    /// Value in CSS pixels
    pub value: f64,
    /// The attribute was a percentage (relative to an unknown container)
    #[serde(default)]
    pub percent: bool,
}

impl Length {
    pub fn px(value: f64) -> Self {
        Self {
            value,
            percent: false,
        }
    }

    pub fn percent(value: f64) -> Self {
        Self {
            value,
            percent: true,
        }
    }

    /// The value if it counts as a dimension at all
    fn absolute(self) -> Option<f64> {
        if self.percent || !self.value.is_finite() || self.value <= 0.0 {
            None
        } else {
            Some(self.value)
        }
    }
}

/// Intrinsic size attributes of the document root
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Intrinsic {
    pub width: Option<Length>,
    pub height: Option<Length>,
}

/// Logical coordinate box declared by the document
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewBox {
    pub width: f64,
    pub height: f64,
}

/// Caller-supplied size overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub width: Option<f64>,
    pub height: Option<f64>,
    /// Inverse zoom factor applied to the view box (`2.0` halves the output)
    pub scale: Option<f64>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.scale.is_none()
    }

    /// Reject values that cannot describe a finite, non-empty surface
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("width", self.width), ("height", self.height), ("scale", self.scale)] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(Error::InvalidOptions(format!(
                        "{} must be a positive finite number, got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How fractional pixel sizes become integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    #[default]
    Round,
    Ceil,
    Floor,
}

impl Rounding {
    fn apply(self, value: f64) -> f64 {
        match self {
            Rounding::Round => value.round(),
            Rounding::Ceil => value.ceil(),
            Rounding::Floor => value.floor(),
        }
    }
}

impl std::str::FromStr for Rounding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round" => Ok(Rounding::Round),
            "ceil" => Ok(Rounding::Ceil),
            "floor" => Ok(Rounding::Floor),
            other => Err(Error::InvalidOptions(format!("unknown rounding mode '{}'", other))),
        }
    }
}

/// Final raster size in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

/// Output of [`resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolution {
    pub dimensions: Dimensions,
    /// The root's `clip` attribute was computed against the unscaled box and
    /// must be removed before capture.
    pub clear_clip: bool,
}

/// Compute the raster size for a document.
pub fn resolve(
    intrinsic: &Intrinsic,
    view_box: Option<ViewBox>,
    overrides: &Overrides,
    rounding: Rounding,
) -> Result<Resolution> {
    overrides.validate()?;

    let view_box = view_box.filter(|b| {
        b.width.is_finite() && b.height.is_finite() && b.width > 0.0 && b.height > 0.0
    });

    let (width, height) = if overrides.is_empty() {
        (
            intrinsic.width.and_then(Length::absolute),
            intrinsic.height.and_then(Length::absolute),
        )
    } else {
        (overrides.width, overrides.height)
    };

    if let Some(scale) = overrides.scale {
        let view_box = view_box.ok_or_else(|| {
            Error::DimensionsUndetermined("a scale override requires a view box".into())
        })?;
        return Ok(Resolution {
            dimensions: Dimensions {
                width: to_pixels(view_box.width / scale, rounding, "width")?,
                height: to_pixels(view_box.height / scale, rounding, "height")?,
                scale,
            },
            clear_clip: true,
        });
    }

    let (w, h) = match (width, height, view_box) {
        (Some(w), Some(h), _) => (w, h),
        (Some(w), None, Some(b)) => (w, w * b.height / b.width),
        (None, Some(h), Some(b)) => (h * b.width / b.height, h),
        (Some(_), None, None) | (None, Some(_), None) => {
            return Err(Error::DimensionsUndetermined(
                "only one of width/height is known and there is no view box".into(),
            ))
        }
        (None, None, _) => {
            return Err(Error::DimensionsUndetermined(
                "document declares neither width nor height and none was given".into(),
            ))
        }
    };

    Ok(Resolution {
        dimensions: Dimensions {
            width: to_pixels(w, rounding, "width")?,
            height: to_pixels(h, rounding, "height")?,
            scale: 1.0,
        },
        clear_clip: false,
    })
}

fn to_pixels(value: f64, rounding: Rounding, axis: &str) -> Result<u32> {
    let px = rounding.apply(value);
    if !px.is_finite() || px < 1.0 {
        return Err(Error::DimensionsUndetermined(format!(
            "{} resolves to {} which is less than one pixel",
            axis, value
        )));
    }
    if px > MAX_DIMENSION as f64 {
        return Err(Error::InvalidOptions(format!(
            "{} of {}px exceeds the {}px limit",
            axis, px, MAX_DIMENSION
        )));
    }
    Ok(px as u32)
}
