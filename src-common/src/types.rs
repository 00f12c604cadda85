//! Raw video formats and their textual caps representation.
//!
//! Formats travel between producer and clients as caps strings such as
//! `video/x-raw,format=RGB,width=320,height=240,framerate=10/1`. A producer
//! always works with a fully specified [`VideoFormat`]; a client may ask for
//! a partial [`CapsFilter`] and learn the concrete format from the attach
//! reply.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media type prefix of every caps string.
pub const MEDIA_TYPE: &str = "video/x-raw";

/// Format produced when nothing else is configured.
pub const DEFAULT_CAPS: &str = "video/x-raw,format=BGR,width=1280,height=720,framerate=30/1";

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Error produced while parsing or validating caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Caps describe something other than raw video
    UnsupportedMediaType(String),
    /// Pixel layout is not one of the supported names
    UnknownPixelFormat(String),
    /// A field could not be parsed
    InvalidField { field: String, value: String },
    /// A required field is missing from a concrete format
    MissingField(&'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::UnsupportedMediaType(t) => write!(f, "Unsupported media type: {}", t),
            FormatError::UnknownPixelFormat(p) => write!(f, "Unknown pixel format: {}", p),
            FormatError::InvalidField { field, value } => {
                write!(f, "Invalid value for {}: {}", field, value)
            }
            FormatError::MissingField(field) => write!(f, "Missing caps field: {}", field),
        }
    }
}

impl std::error::Error for FormatError {}

/// Pixel layout of a raw video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
    #[serde(rename = "RGBx")]
    Rgbx,
    #[serde(rename = "BGRx")]
    Bgrx,
    Gray8,
    I420,
    Yuy2,
}

impl PixelFormat {
    /// Parse the caps name of a pixel layout (`RGB`, `BGRx`, `I420`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RGB" => Some(PixelFormat::Rgb),
            "BGR" => Some(PixelFormat::Bgr),
            "RGBA" => Some(PixelFormat::Rgba),
            "BGRA" => Some(PixelFormat::Bgra),
            "RGBx" => Some(PixelFormat::Rgbx),
            "BGRx" => Some(PixelFormat::Bgrx),
            "GRAY8" => Some(PixelFormat::Gray8),
            "I420" => Some(PixelFormat::I420),
            "YUY2" => Some(PixelFormat::Yuy2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgbx => "RGBx",
            PixelFormat::Bgrx => "BGRx",
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::I420 => "I420",
            PixelFormat::Yuy2 => "YUY2",
        }
    }

    /// Bytes per pixel for packed layouts, `None` for planar ones.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => Some(3),
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Rgbx | PixelFormat::Bgrx => {
                Some(4)
            }
            PixelFormat::Yuy2 => Some(2),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::I420 => None,
        }
    }

    /// Size in bytes of one frame of `width` x `height` pixels.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        match self.bytes_per_pixel() {
            Some(bpp) => w.checked_mul(h)?.checked_mul(bpp),
            None => {
                // Full-resolution luma plus two quarter-resolution chroma planes.
                let luma = w.checked_mul(h)?;
                let chroma = w.div_ceil(2).checked_mul(h.div_ceil(2))?;
                luma.checked_add(chroma.checked_mul(2)?)
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame rate as an exact rational number of frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    fn parse(value: &str) -> Option<Self> {
        let (num, den) = match value.split_once('/') {
            Some((n, d)) => (n.trim().parse().ok()?, d.trim().parse().ok()?),
            None => (value.trim().parse().ok()?, 1),
        };
        if den == 0 {
            return None;
        }
        Some(Self { num, den })
    }

    /// Presentation timestamp of frame `n`, in nanoseconds.
    ///
    /// Computed from the frame index rather than accumulated, so rounding
    /// never drifts over a long stream.
    pub fn frame_pts(&self, n: u64) -> u64 {
        if self.num == 0 {
            return 0;
        }
        let nanos = n as u128 * NANOS_PER_SECOND * self.den as u128 / self.num as u128;
        nanos.min(u64::MAX as u128) as u64
    }

    /// Duration of frame `n`, in nanoseconds.
    pub fn frame_duration(&self, n: u64) -> u64 {
        self.frame_pts(n + 1).saturating_sub(self.frame_pts(n))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// A fully specified raw video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
}

impl VideoFormat {
    /// Bytes in one frame of this format.
    pub fn frame_size(&self) -> usize {
        self.format
            .frame_size(self.width, self.height)
            .unwrap_or(usize::MAX)
    }

    /// Frame size as carried in the wire header, or `None` when a frame
    /// does not fit in 32 bits.
    pub fn frame_length(&self) -> Option<u32> {
        let size = self.format.frame_size(self.width, self.height)?;
        u32::try_from(size).ok()
    }

    /// Check that frames of this format can be produced and sent.
    pub fn validate(&self) -> Result<(), FormatError> {
        let size = || format!("{}x{}", self.width, self.height);
        if self.width == 0 || self.height == 0 {
            return Err(FormatError::InvalidField {
                field: "size".to_string(),
                value: size(),
            });
        }
        if self.framerate.num == 0 {
            return Err(FormatError::InvalidField {
                field: "framerate".to_string(),
                value: self.framerate.to_string(),
            });
        }
        // A zero or wrapped length would read as end-of-stream
        if self.frame_length().is_none() {
            return Err(FormatError::InvalidField {
                field: "size".to_string(),
                value: size(),
            });
        }
        Ok(())
    }

    /// Caps string describing exactly this format.
    pub fn to_caps(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},format={},width={},height={},framerate={}",
            MEDIA_TYPE, self.format, self.width, self.height, self.framerate
        )
    }
}

impl FromStr for VideoFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let filter = CapsFilter::parse(s)?;
        let format = VideoFormat {
            format: filter.format.ok_or(FormatError::MissingField("format"))?,
            width: filter.width.ok_or(FormatError::MissingField("width"))?,
            height: filter.height.ok_or(FormatError::MissingField("height"))?,
            framerate: filter.framerate.ok_or(FormatError::MissingField("framerate"))?,
        };
        format.validate()?;
        Ok(format)
    }
}

/// A possibly partial format request. Absent fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapsFilter {
    pub format: Option<PixelFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Fraction>,
}

impl CapsFilter {
    /// Filter that accepts every format.
    pub fn any() -> Self {
        Self::default()
    }

    /// Parse a caps string. An empty string is the unrestricted filter.
    ///
    /// Typed values (`width=(int)320`) are accepted; fields this crate does
    /// not interpret (`pixel-aspect-ratio`, `interlace-mode`, ...) are ignored.
    pub fn parse(s: &str) -> Result<Self, FormatError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::any());
        }

        let mut parts = s.split(',');
        let media_type = parts.next().unwrap_or_default().trim();
        if media_type != MEDIA_TYPE {
            return Err(FormatError::UnsupportedMediaType(media_type.to_string()));
        }

        let mut filter = Self::any();
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| FormatError::InvalidField {
                field: part.to_string(),
                value: String::new(),
            })?;
            let key = key.trim();
            let value = strip_type_annotation(value.trim());
            let invalid = || FormatError::InvalidField {
                field: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "format" => {
                    filter.format = Some(
                        PixelFormat::parse(value)
                            .ok_or_else(|| FormatError::UnknownPixelFormat(value.to_string()))?,
                    )
                }
                "width" => filter.width = Some(value.parse().map_err(|_| invalid())?),
                "height" => filter.height = Some(value.parse().map_err(|_| invalid())?),
                "framerate" => filter.framerate = Some(Fraction::parse(value).ok_or_else(invalid)?),
                _ => {}
            }
        }
        Ok(filter)
    }

    /// Whether `format` satisfies every field this filter names.
    pub fn matches(&self, format: &VideoFormat) -> bool {
        self.format.map_or(true, |f| f == format.format)
            && self.width.map_or(true, |w| w == format.width)
            && self.height.map_or(true, |h| h == format.height)
            && self.framerate.map_or(true, |r| {
                // 20/2 and 10/1 are the same rate
                r.num as u64 * format.framerate.den as u64
                    == format.framerate.num as u64 * r.den as u64
            })
    }
}

fn strip_type_annotation(value: &str) -> &str {
    if value.starts_with('(') {
        if let Some(end) = value.find(')') {
            return value[end + 1..].trim();
        }
    }
    value
}
