//! Scripts that read and rewrite the size attributes of the loaded SVG root
//!
//! Both scripts are function expressions passed to [`Session::evaluate`]
//! together with their JSON argument.
//!
//! [`Session::evaluate`]: crate::engine::Session::evaluate

use crate::dimensions::{Intrinsic, Length, Resolution, ViewBox};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Reads `width`, `height` and `viewBox` of the root `<svg>`; `null` when the
/// document root is not an SVG element.
pub const READ_SIZE_SCRIPT: &str = r#"function () {
    const svg = document.documentElement;
    if (!svg || svg.namespaceURI !== 'http://www.w3.org/2000/svg') {
        return null;
    }
    const length = function (name) {
        if (!svg.hasAttribute(name)) return null;
        const base = svg[name].baseVal;
        return {
            value: base.value,
            percent: base.unitType === SVGLength.SVG_LENGTHTYPE_PERCENTAGE
        };
    };
    let viewBox = null;
    if (svg.hasAttribute('viewBox') && svg.viewBox.baseVal) {
        const box = svg.viewBox.baseVal;
        viewBox = { width: box.width, height: box.height };
    }
    return { width: length('width'), height: length('height'), viewBox: viewBox };
}"#;

/// Writes the resolved size back onto the root so the engine lays it out at
/// exactly the surface size.
pub const APPLY_SIZE_SCRIPT: &str = r#"function (plan) {
    const svg = document.documentElement;
    svg.setAttribute('width', plan.width + 'px');
    svg.setAttribute('height', plan.height + 'px');
    if (plan.clearClip) {
        svg.removeAttribute('clip');
    }
    if (plan.background) {
        svg.style.background = plan.background;
    }
    return true;
}"#;

/// Size attributes reported by [`READ_SIZE_SCRIPT`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSize {
    pub width: Option<Length>,
    pub height: Option<Length>,
    pub view_box: Option<ViewBox>,
}

impl DocumentSize {
    pub fn intrinsic(&self) -> Intrinsic {
        Intrinsic {
            width: self.width,
            height: self.height,
        }
    }

    /// Parse the value returned by [`READ_SIZE_SCRIPT`]
    pub fn from_script_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Err(Error::DimensionsUndetermined(
                "document root is not an <svg> element".into(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| Error::ScriptError(format!("Unexpected size attributes: {}", e)))
    }
}

/// Argument of [`APPLY_SIZE_SCRIPT`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizePlan {
    pub width: u32,
    pub height: u32,
    pub clear_clip: bool,
    pub background: Option<String>,
}

impl SizePlan {
    pub fn new(resolution: &Resolution, background: Option<&str>) -> Self {
        Self {
            width: resolution.dimensions.width,
            height: resolution.dimensions.height,
            clear_clip: resolution.clear_clip,
            background: background.map(str::to_string),
        }
    }

    pub fn to_args(&self) -> serde_json::Value {
        serde_json::json!({
            "width": self.width,
            "height": self.height,
            "clearClip": self.clear_clip,
            "background": self.background,
        })
    }
}
