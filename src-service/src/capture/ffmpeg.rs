//! FFmpeg-backed source: decodes any FFmpeg input to raw frames.

use ffmpeg_sidecar::command::FfmpegCommand;
use framebus_common::{PixelFormat, VideoFormat};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Stdio};
use tracing::{debug, warn};

use super::{CaptureError, FrameSource};

/// Use the system FFmpeg from PATH.
fn resolve_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

/// FFmpeg's name for a pixel layout.
fn pix_fmt(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Rgb => "rgb24",
        PixelFormat::Bgr => "bgr24",
        PixelFormat::Rgba => "rgba",
        PixelFormat::Bgra => "bgra",
        PixelFormat::Rgbx => "rgb0",
        PixelFormat::Bgrx => "bgr0",
        PixelFormat::Gray8 => "gray",
        PixelFormat::I420 => "yuv420p",
        PixelFormat::Yuy2 => "yuyv422",
    }
}

/// Arguments after the input: scale and retime to `format`, raw frames on
/// stdout.
fn output_args(format: &VideoFormat) -> Vec<String> {
    vec![
        "-vf".to_string(),
        format!(
            "scale={}:{},fps={}/{}",
            format.width, format.height, format.framerate.num, format.framerate.den
        ),
        "-pix_fmt".to_string(),
        pix_fmt(format.format).to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
    ]
}

pub struct FfmpegSource {
    input: String,
    child: Child,
    stdout: ChildStdout,
    frame_size: usize,
}

impl FfmpegSource {
    /// Start decoding `input`. With `live`, FFmpeg reads the input at its
    /// native rate.
    pub fn spawn(input: &str, format: &VideoFormat, live: bool) -> Result<Self, CaptureError> {
        let mut command = FfmpegCommand::new_with_path(resolve_ffmpeg_path());
        command.hide_banner().args(["-loglevel", "error", "-nostdin"]);
        if live {
            command.arg("-re");
        }
        command.input(input).args(output_args(format)).output("-");

        let inner_command = command.as_inner_mut();
        inner_command.stdin(Stdio::null());
        inner_command.stdout(Stdio::piped());
        inner_command.stderr(Stdio::piped());

        let mut child = inner_command
            .spawn()
            .map_err(|e| CaptureError::StartFailed(format!("Failed to start FFmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::StartFailed("Failed to get FFmpeg stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                use std::io::{BufRead, BufReader};
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    warn!("[FFmpeg] {}", line);
                }
                debug!("FFmpeg stderr reader exiting");
            });
        }

        Ok(Self {
            input: input.to_string(),
            child,
            stdout,
            frame_size: format.frame_size(),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> String {
        format!("FFmpeg input {}", self.input)
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        let mut data = vec![0u8; self.frame_size];
        let mut filled = 0;
        while filled < data.len() {
            match self.stdout.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CaptureError::ReadFailed(e.to_string())),
            }
        }

        if filled == data.len() {
            return Ok(Some(data));
        }

        let status = self
            .child
            .wait()
            .map_err(|e| CaptureError::ReadFailed(format!("FFmpeg process error: {}", e)))?;
        if !status.success() {
            return Err(CaptureError::ReadFailed(format!(
                "FFmpeg exited with {}",
                status
            )));
        }
        if filled > 0 {
            return Err(CaptureError::ReadFailed(format!(
                "FFmpeg output ended mid-frame ({} of {} bytes)",
                filled,
                data.len()
            )));
        }
        Ok(None)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_args() {
        let format: VideoFormat = "video/x-raw,format=BGRx,width=320,height=240,framerate=30000/1001"
            .parse()
            .unwrap();
        assert_eq!(
            output_args(&format),
            vec![
                "-vf",
                "scale=320:240,fps=30000/1001",
                "-pix_fmt",
                "bgr0",
                "-f",
                "rawvideo"
            ]
        );
    }

    #[test]
    fn test_missing_binary_is_start_error() {
        // Only meaningful when ffmpeg is absent; otherwise the spawn succeeds
        // and the nonexistent input makes the first read fail.
        let format: VideoFormat = "video/x-raw,format=GRAY8,width=2,height=2,framerate=1/1"
            .parse()
            .unwrap();
        match FfmpegSource::spawn("/nonexistent/input.mkv", &format, false) {
            Err(CaptureError::StartFailed(_)) => {}
            Ok(mut source) => assert!(source.next_frame().is_err()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
