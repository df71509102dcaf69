//! FFmpeg-subprocess capture for camera devices and video files.
//!
//! Both readers spawn an `ffmpeg` child that decodes the source and writes
//! raw BGR8 frames to stdout. A background thread slices the byte stream into
//! [`Frame`]s and forwards them over a small bounded channel so downstream
//! backpressure reaches the decoder.

use std::{
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::warn;

use crate::types::{CaptureError, Frame, FrameFormat};

/// Consecutive failed reads tolerated before the capture thread gives up.
const MAX_READ_RETRIES: u32 = 3;
/// Backoff between retried reads.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Spawn an FFmpeg reader for a video file on disk.
///
/// The returned channel closes when the file is exhausted; dropping the
/// receiver kills the decoder and releases the file handle.
pub fn spawn_file_reader(
    path: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    if !Path::new(path).is_file() {
        return Err(CaptureError::Open {
            uri: path.to_string(),
        }
        .into());
    }

    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-re")
        .arg("-i")
        .arg(path)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    spawn_ffmpeg_reader(cmd, target_size, 3)
}

/// Spawn an FFmpeg reader for a V4L2 camera device.
///
/// `uri` may be a bare index (`0`), a `/dev/videoN` path, or anything FFmpeg
/// accepts as a `video4linux2` input.
pub fn spawn_camera_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let device = match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    };

    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-f")
        .arg("video4linux2")
        .arg("-i")
        .arg(&device)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    spawn_ffmpeg_reader(cmd, target_size, 3)
}

/// Probe a video file's frame rate with `ffprobe`.
///
/// Returns `None` when the probe fails or reports a non-positive rate; the
/// caller falls back to its default.
pub fn probe_source_fps(path: &str) -> Option<f64> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=r_frame_rate")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let rate = text.trim().lines().next()?;
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    if fps > 0.0 { Some(fps) } else { None }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    target_size: (i32, i32),
    queue_size: usize,
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (tx, rx) = bounded(queue_size);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    thread::spawn(move || {
        let tx_clone = tx.clone();
        if let Err(err) = ffmpeg_loop(stdout, child, target_size, tx_clone) {
            let _ = tx.send(Err(err));
        }
    });

    Ok(rx)
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    mut child: Child,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut retries = 0u32;
    let mut result = Ok(());

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                retries = 0;
                let timestamp_ms = Utc::now().timestamp_millis();
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            // EOF: the source is exhausted; closing the channel is the
            // end-of-input signal.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                retries += 1;
                if retries > MAX_READ_RETRIES {
                    result = Err(CaptureError::Other(err.into()));
                    break;
                }
                warn!("capture read failed ({err}), retry {retries}/{MAX_READ_RETRIES}");
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = spawn_file_reader("/no/such/file.mp4", (64, 64)).unwrap_err();
        let err = err.downcast::<CaptureError>().unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}
