//! Local-file media backend driven by the `ffmpeg` and `ffprobe` binaries.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::config::CropConfig;
use crate::error::{Error, Result};
use crate::models::RawAsset;
use crate::pipeline::MediaOps;

const FILE_SCHEME: &str = "file://";

pub fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix(FILE_SCHEME).unwrap_or(uri))
}

pub fn path_to_uri(path: &Path) -> String {
    format!("{FILE_SCHEME}{}", path.display())
}

/// Maps a 0..=1 quality onto ffmpeg's JPEG `-q:v` scale, where 2 is best
/// and 31 is worst.
pub fn jpeg_qscale(quality: f32) -> u8 {
    let quality = if quality.is_finite() {
        quality.clamp(0.0, 1.0)
    } else {
        1.0
    };
    (2.0 + (1.0 - quality) * 29.0).round() as u8
}

#[derive(Debug, Clone)]
pub struct FfmpegMedia {
    output_dir: PathBuf,
    timeout: Option<Duration>,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegMedia {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            timeout: None,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    pub fn from_config(output_dir: impl Into<PathBuf>, config: &CropConfig) -> Self {
        Self::new(output_dir).with_timeout(config.media_timeout_secs.map(Duration::from_secs))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_binaries(
        mut self,
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
    ) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Reads what a picker would report about a local file: size, container
    /// type sniffed from its magic bytes, and duration/dimensions from ffprobe.
    pub fn probe_asset(&self, path: &Path) -> Result<RawAsset> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(Error::InvalidArgument(format!(
                "not a file: {}",
                path.display()
            )));
        }
        let mime_type = infer::get_from_path(path)?.map(|kind| kind.mime_type().to_string());

        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path);
        let stdout = self.run(&mut cmd, "ffprobe")?;
        let probe = parse_probe(&stdout)?;

        Ok(RawAsset {
            uri: path_to_uri(path),
            duration_ms: probe.duration_ms,
            width: probe.width,
            height: probe.height,
            file_size_bytes: Some(meta.len()),
            mime_type,
        })
    }

    fn new_output(&self, prefix: &str, extension: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        Ok(self
            .output_dir
            .join(format!("{prefix}-{}.{extension}", Uuid::new_v4())))
    }

    /// Runs a child to completion and returns its stdout. Both pipes are
    /// drained on their own threads so a chatty child cannot block.
    fn run(&self, cmd: &mut Command, what: &str) -> Result<Vec<u8>> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Media(format!("failed to start {what}: {err}")))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Media(format!("{what} timed out after {limit:?}")));
                }
            },
            None => child.wait()?,
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            return Err(Error::Media(format!("{what} failed ({status}): {detail}")));
        }
        Ok(stdout)
    }

    /// Runs an ffmpeg command that writes `output`. A failed or timed out
    /// run leaves no partial file behind.
    fn run_to_output(&self, cmd: &mut Command, output: &Path) -> Result<()> {
        if let Err(err) = self.run(cmd, "ffmpeg") {
            remove_partial(output);
            return Err(err);
        }
        Ok(())
    }
}

impl MediaOps for FfmpegMedia {
    fn exists(&self, uri: &str) -> bool {
        uri_to_path(uri).is_file()
    }

    fn trim(&self, uri: &str, start_secs: f64, end_secs: f64) -> Result<String> {
        let input = uri_to_path(uri);
        let extension = input
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4")
            .to_ascii_lowercase();
        let output = self.new_output("clip", &extension)?;
        debug!(input = %input.display(), output = %output.display(), "ffmpeg trim");

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{start_secs:.3}"))
            .arg("-i")
            .arg(&input)
            .arg("-t")
            .arg(format!("{:.3}", end_secs - start_secs))
            .args(["-c", "copy", "-avoid_negative_ts", "make_zero"])
            .arg(&output);
        self.run_to_output(&mut cmd, &output)?;
        Ok(path_to_uri(&output))
    }

    fn thumbnail(&self, uri: &str, at_secs: f64, quality: f32) -> Result<String> {
        let input = uri_to_path(uri);
        let output = self.new_output("thumb", "jpg")?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{at_secs:.3}"))
            .arg("-i")
            .arg(&input)
            .args(["-frames:v", "1", "-q:v"])
            .arg(jpeg_qscale(quality).to_string())
            .arg(&output);
        self.run_to_output(&mut cmd, &output)?;

        if !output.is_file() {
            return Err(Error::Media(format!(
                "no frame at {at_secs:.3}s in {}",
                input.display()
            )));
        }
        Ok(path_to_uri(&output))
    }

    /// Only files under the output directory are ever removed.
    fn remove_artifact(&self, uri: &str) -> Result<()> {
        let path = uri_to_path(uri);
        if !path.starts_with(&self.output_dir) {
            return Err(Error::InvalidArgument(format!(
                "refusing to remove {} outside {}",
                path.display(),
                self.output_dir.display()
            )));
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "artifact removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "artifact removal failed");
                Err(err.into())
            }
        }
    }
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "partial output removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "partial output not removed"),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
struct ProbeInfo {
    duration_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

fn parse_probe(stdout: &[u8]) -> Result<ProbeInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;
    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::Media("no video stream found".into()))?;

    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);

    Ok(ProbeInfo {
        duration_ms: duration_secs.map(|d| (d * 1000.0).round() as u64),
        width: video.width,
        height: video.height,
    })
}
