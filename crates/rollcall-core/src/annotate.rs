//! Frame annotation: colored boxes around detected faces, with the
//! predicted name written above each box when a label font is configured.
//!
//! Box colors come from a display configuration that maps identity names to
//! RGB triples, falling back to one color for known faces and one for unknown.

use crate::types::BoundingBox;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label for faces that match no identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Pixels between a label and its box.
const LABEL_GAP: i32 = 2;

#[derive(Error, Debug)]
pub enum DisplayConfigError {
    #[error("reading display config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing display config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("loading label font {path}: {reason}")]
    Font { path: String, reason: String },
}

/// Display attributes loaded from TOML:
///
/// ```toml
/// known = [20, 255, 70]
/// unknown = [255, 0, 0]
/// thickness = 2
/// font = "DejaVuSans.ttf"
/// font_size = 20.0
///
/// [colors]
/// alice = [215, 168, 150]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub known: [u8; 3],
    pub unknown: [u8; 3],
    pub thickness: u32,
    /// TrueType/OpenType font for name labels. Relative paths resolve
    /// against the config file. Without a font only boxes are drawn.
    pub font: Option<PathBuf>,
    /// Label height in pixels.
    pub font_size: f32,
    pub colors: HashMap<String, [u8; 3]>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            known: [20, 255, 70],
            unknown: [255, 0, 0],
            thickness: 2,
            font: None,
            font_size: 20.0,
            colors: HashMap::new(),
        }
    }
}

impl DisplayConfig {
    pub fn load(path: &Path) -> Result<Self, DisplayConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| DisplayConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = toml::from_str::<Self>(&src).map_err(|source| DisplayConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let (Some(font), Some(dir)) = (config.font.as_mut(), path.parent()) {
            if font.is_relative() {
                *font = dir.join(&*font);
            }
        }
        tracing::debug!(path = %path.display(), overrides = config.colors.len(), "loaded display config");
        Ok(config)
    }

    /// Box color for a matched identity, or for an unknown face when `None`.
    pub fn color_for(&self, identity: Option<&str>) -> Rgb<u8> {
        match identity {
            None => Rgb(self.unknown),
            Some(name) => Rgb(self.colors.get(name).copied().unwrap_or(self.known)),
        }
    }

    /// Read the configured label font, if any.
    pub fn load_font(&self) -> Result<Option<FontVec>, DisplayConfigError> {
        let Some(path) = &self.font else {
            return Ok(None);
        };
        let bytes = std::fs::read(path).map_err(|source| DisplayConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| DisplayConfigError::Font {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), "loaded label font");
        Ok(Some(font))
    }
}

/// Draws face boxes, and name labels when a font is available.
#[derive(Default)]
pub struct Annotator {
    config: DisplayConfig,
    font: Option<FontVec>,
}

impl fmt::Debug for Annotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Annotator")
            .field("config", &self.config)
            .field("font", &self.font.is_some())
            .finish()
    }
}

impl Annotator {
    /// Loads the font named by `config`, if any.
    pub fn new(config: DisplayConfig) -> Result<Self, DisplayConfigError> {
        let font = config.load_font()?;
        Ok(Self { config, font })
    }

    pub fn with_font(config: DisplayConfig, font: FontVec) -> Self {
        Self {
            config,
            font: Some(font),
        }
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    /// Outline `bbox` in the identity's color and write the identity name,
    /// or [`UNKNOWN_LABEL`], above it.
    pub fn annotate(&self, frame: &mut RgbImage, bbox: &BoundingBox, identity: Option<&str>) {
        let color = self.config.color_for(identity);
        draw_box(frame, bbox, color, self.config.thickness);
        if let Some(font) = &self.font {
            let text = identity.unwrap_or(UNKNOWN_LABEL);
            draw_label(frame, font, self.config.font_size, bbox, text, color);
        }
    }
}

/// Draw a hollow rectangle for `bbox`, clipped to the frame.
pub fn draw_box(frame: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let (w, h) = (frame.width() as i32, frame.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    let (x1, y1, x2, y2) = bbox.corners();
    let t = i32::try_from(thickness.max(1)).unwrap_or(i32::MAX);

    let mut fill = |xa: i32, ya: i32, xb: i32, yb: i32| {
        let (xa, ya, xb, yb) = (xa.max(0), ya.max(0), xb.min(w), yb.min(h));
        if xa < xb && ya < yb {
            let rect = Rect::at(xa, ya).of_size((xb - xa) as u32, (yb - ya) as u32);
            draw_filled_rect_mut(frame, rect, color);
        }
    };
    // Corners of extreme detections sit at the i32 limits.
    fill(x1, y1, x2, y1.saturating_add(t)); // top
    fill(x1, y2.saturating_sub(t), x2, y2); // bottom
    fill(x1, y1, x1.saturating_add(t), y2); // left
    fill(x2.saturating_sub(t), y1, x2, y2); // right
}

/// Write `text` just above `bbox`, or inside its top edge when the box
/// touches the top of the frame.
pub fn draw_label(frame: &mut RgbImage, font: &FontVec, size: f32, bbox: &BoundingBox, text: &str, color: Rgb<u8>) {
    if text.is_empty() {
        return;
    }
    let scale = PxScale::from(size.max(1.0));
    let (_, text_h) = text_size(scale, font, text);
    let text_h = i32::try_from(text_h).unwrap_or(i32::MAX);
    let Some((x, y)) = label_origin(frame.width(), frame.height(), bbox.corners(), text_h) else {
        return;
    };
    draw_text_mut(frame, color, x, y, scale, font, text);
}

/// Top-left corner of a label `text_h` pixels tall, or `None` when the box
/// lies entirely outside the frame.
fn label_origin(width: u32, height: u32, corners: (i32, i32, i32, i32), text_h: i32) -> Option<(i32, i32)> {
    let (w, h) = (i32::try_from(width).ok()?, i32::try_from(height).ok()?);
    let (x1, y1, x2, y2) = corners;
    if w == 0 || h == 0 || x2 <= 0 || y2 <= 0 || x1 >= w || y1 >= h {
        return None;
    }
    let above = y1.saturating_sub(text_h).saturating_sub(LABEL_GAP);
    let y = if above >= 0 {
        above
    } else {
        y1.max(0).saturating_add(LABEL_GAP)
    };
    Some((x1.clamp(0, w - 1), y.min(h - 1)))
}
