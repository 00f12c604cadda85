//! Generated test patterns.

use clap::ValueEnum;
use framebus_common::{PixelFormat, VideoFormat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{CaptureError, FrameSource};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    White,
    Black,
    /// Vertical colour bars
    #[default]
    Bars,
    /// Every byte of frame `n` is `n mod 256`
    Counter,
}

/// Colours of the bar pattern, left to right.
const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
}

/// Render one frame where column `x` has colour `color(x)`.
fn render_columns(format: &VideoFormat, color: impl Fn(u32) -> [u8; 3]) -> Vec<u8> {
    let width = format.width as usize;
    let height = format.height as usize;
    let mut data = Vec::with_capacity(format.frame_size());

    match format.format {
        PixelFormat::I420 => {
            for _ in 0..height {
                data.extend((0..format.width).map(|x| luma(color(x))));
            }
            // Neutral chroma
            data.resize(format.frame_size(), 0x80);
        }
        PixelFormat::Yuy2 => {
            for _ in 0..height {
                for x in 0..width {
                    data.push(luma(color(x as u32)));
                    data.push(0x80);
                }
            }
        }
        pixel => {
            let row: Vec<u8> = (0..format.width)
                .flat_map(|x| {
                    let [r, g, b] = color(x);
                    match pixel {
                        PixelFormat::Rgb => vec![r, g, b],
                        PixelFormat::Bgr => vec![b, g, r],
                        PixelFormat::Rgba | PixelFormat::Rgbx => vec![r, g, b, 255],
                        PixelFormat::Bgra | PixelFormat::Bgrx => vec![b, g, r, 255],
                        _ => vec![luma([r, g, b])],
                    }
                })
                .collect();
            for _ in 0..height {
                data.extend_from_slice(&row);
            }
        }
    }
    data
}

/// Produces a synthetic stream of a fixed format.
pub struct TestPattern {
    format: VideoFormat,
    pattern: Pattern,
    live: bool,
    size_jitter: bool,
    num_frames: Option<u64>,
    index: u64,
    started: Option<Instant>,
    base: Vec<u8>,
    rng: StdRng,
}

impl TestPattern {
    pub fn new(format: VideoFormat, pattern: Pattern) -> Self {
        let base = match pattern {
            Pattern::White => render_columns(&format, |_| [255, 255, 255]),
            Pattern::Black => render_columns(&format, |_| [0, 0, 0]),
            Pattern::Bars => {
                let width = format.width.max(1);
                render_columns(&format, |x| BARS[(x as usize * BARS.len()) / width as usize])
            }
            Pattern::Counter => Vec::new(),
        };
        Self {
            format,
            pattern,
            live: true,
            size_jitter: false,
            num_frames: None,
            index: 0,
            started: None,
            base,
            rng: StdRng::from_entropy(),
        }
    }

    /// Pace frames at the frame rate (default) or emit them as fast as
    /// they are consumed.
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Make some frames one byte too short or too long.
    pub fn size_jitter(mut self, enabled: bool) -> Self {
        self.size_jitter = enabled;
        self
    }

    /// End the stream after `n` frames.
    pub fn num_frames(mut self, n: Option<u64>) -> Self {
        self.num_frames = n;
        self
    }

    fn render(&self) -> Vec<u8> {
        match self.pattern {
            Pattern::Counter => vec![self.index as u8; self.format.frame_size()],
            _ => self.base.clone(),
        }
    }
}

impl FrameSource for TestPattern {
    fn describe(&self) -> String {
        format!("test pattern {:?} ({})", self.pattern, self.format)
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.num_frames.is_some_and(|n| self.index >= n) {
            return Ok(None);
        }

        if self.live {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = started + Duration::from_nanos(self.format.framerate.frame_pts(self.index));
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let mut data = self.render();
        if self.size_jitter {
            match self.rng.gen_range(0..3) {
                0 => {
                    data.pop();
                }
                1 => data.push(0),
                _ => {}
            }
        }
        self.index += 1;
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(caps: &str) -> VideoFormat {
        caps.parse().unwrap()
    }

    #[test]
    fn test_frames_have_format_size() {
        for caps in [
            "video/x-raw,format=RGB,width=7,height=3,framerate=10/1",
            "video/x-raw,format=BGRx,width=8,height=2,framerate=10/1",
            "video/x-raw,format=GRAY8,width=5,height=5,framerate=10/1",
            "video/x-raw,format=I420,width=5,height=3,framerate=10/1",
            "video/x-raw,format=YUY2,width=4,height=2,framerate=10/1",
        ] {
            let format = format(caps);
            for pattern in [Pattern::White, Pattern::Bars, Pattern::Counter] {
                let mut source = TestPattern::new(format, pattern).live(false);
                let frame = source.next_frame().unwrap().unwrap();
                assert_eq!(frame.len(), format.frame_size(), "{} {:?}", caps, pattern);
            }
        }
    }

    #[test]
    fn test_constant_pattern_repeats() {
        let format = format("video/x-raw,format=RGB,width=16,height=4,framerate=30/1");
        let mut source = TestPattern::new(format, Pattern::Bars).live(false);
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first, second);
        // Leftmost bar is white, rightmost black
        assert_eq!(&first[..3], &[255, 255, 255]);
        assert_eq!(&first[45..48], &[0, 0, 0]);
    }

    #[test]
    fn test_counter_and_limit() {
        let format = format("video/x-raw,format=GRAY8,width=2,height=2,framerate=30/1");
        let mut source = TestPattern::new(format, Pattern::Counter)
            .live(false)
            .num_frames(Some(3));
        for n in 0..3u8 {
            assert_eq!(source.next_frame().unwrap().unwrap(), vec![n; 4]);
        }
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn test_size_jitter_range() {
        let format = format("video/x-raw,format=RGB,width=4,height=4,framerate=30/1");
        let size = format.frame_size();
        let mut source = TestPattern::new(format, Pattern::White)
            .live(false)
            .size_jitter(true);
        let sizes: Vec<usize> = (0..200)
            .map(|_| source.next_frame().unwrap().unwrap().len())
            .collect();
        assert!(sizes.iter().all(|s| (size - 1..=size + 1).contains(s)));
        assert!(sizes.contains(&size));
        assert!(sizes.iter().any(|s| *s != size));
    }

    #[test]
    fn test_live_pacing() {
        let format = format("video/x-raw,format=GRAY8,width=2,height=2,framerate=50/1");
        let mut source = TestPattern::new(format, Pattern::Black);
        let start = Instant::now();
        for _ in 0..6 {
            source.next_frame().unwrap();
        }
        // Frame 5 is due 100 ms after frame 0
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
