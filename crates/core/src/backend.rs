//! Boundary to the external inference and encoding tools.
//!
//! The diffusion sampler and the video encoder are black boxes reached through
//! three narrow traits. Production implementations drive subprocesses: the
//! sampler receives the parameter snapshot as JSON on stdin and answers with
//! packed rgb24 frames on stdout, and FFmpeg receives those frames on stdin.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::params::GenerationParams;

const BYTES_PER_PIXEL: usize = 3;

/// Decoded frames produced by the sampler: `frame_count` packed rgb24 images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrames {
    width: u32,
    height: u32,
    frame_count: u32,
    data: Vec<u8>,
}

impl VideoFrames {
    pub fn new(width: u32, height: u32, frame_count: u32, data: Vec<u8>) -> Result<Self> {
        let expected = frame_size(width, height) * frame_count as usize;
        if data.len() != expected {
            bail!(
                "frame buffer size mismatch: expected {expected} bytes for {frame_count} frames of {width}x{height}, got {}",
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            frame_count,
            data,
        })
    }

    /// Split a raw rgb24 stream into whole frames of `width`x`height`.
    pub fn from_rgb24_stream(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let size = frame_size(width, height);
        if size == 0 || data.is_empty() || data.len() % size != 0 {
            bail!(
                "sampler produced {} bytes, which is not a whole number of {width}x{height} rgb24 frames",
                data.len()
            );
        }
        let frame_count = u32::try_from(data.len() / size).context("too many frames")?;
        Self::new(width, height, frame_count, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_size(&self) -> usize {
        frame_size(self.width, self.height)
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.frame_size())
    }
}

fn frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// A loaded diffusion model. `predict` is long-running, CPU-bound and not
/// cancellable.
pub trait Sampler: Send + Sync {
    fn predict(&self, params: &GenerationParams) -> Result<VideoFrames>;
}

/// Performs the slow one-time load of weights from the model root.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_root: &Path) -> Result<Arc<dyn Sampler>>;
}

/// Materializes frames into a container file at `output_path`.
pub trait Encoder: Send + Sync {
    fn encode(&self, frames: &VideoFrames, fps: u32, output_path: &Path) -> Result<()>;
}

fn drain_stderr(stderr: ChildStderr, target: &'static str) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => match target {
                    "sampler_stderr" => debug!(target: "sampler_stderr", "{}", line),
                    _ => debug!(target: "encoder_stderr", "{}", line),
                },
                Err(_) => break,
                _ => {}
            }
        }
    })
}

/// Loads the model by validating the model root and locating the sampler
/// program that will host the weights.
#[derive(Debug, Clone)]
pub struct ProcessModelLoader {
    program: String,
    args: Vec<String>,
}

impl ProcessModelLoader {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ModelLoader for ProcessModelLoader {
    fn load(&self, model_root: &Path) -> Result<Arc<dyn Sampler>> {
        if !model_root.is_dir() {
            bail!("model directory not found: {}", model_root.display());
        }

        let program = crate::runtime::resolve_binary(&self.program)
            .ok_or_else(|| anyhow!("sampler program not found: {}", self.program))?;

        info!(
            model_root = %model_root.display(),
            program = %program.display(),
            "Sampler backend resolved"
        );

        Ok(Arc::new(ProcessSampler {
            program,
            args: self.args.clone(),
            model_root: model_root.to_path_buf(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSampler {
    program: PathBuf,
    args: Vec<String>,
    model_root: PathBuf,
}

impl Sampler for ProcessSampler {
    fn predict(&self, params: &GenerationParams) -> Result<VideoFrames> {
        let request = serde_json::to_vec(params).context("failed to serialize sampler request")?;

        let mut child = std::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--model-base")
            .arg(&self.model_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch sampler {}", self.program.display()))?;

        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, "sampler_stderr"));

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&request) {
                Ok(()) => {}
                // The sampler may exit before reading its request; its exit status reports why.
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                Err(err) => return Err(err).context("failed to write sampler request"),
            }
        }

        let mut data = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_end(&mut data)
                .context("failed to read frames from sampler")?;
        }

        let status = child.wait().context("failed to wait for sampler")?;
        if let Some(handle) = stderr_thread {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("sampler exited with status {status}");
        }

        VideoFrames::from_rgb24_stream(params.width, params.height, data)
    }
}

/// Encodes rgb24 frames to H.264 MP4 through an FFmpeg subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn build_args(width: u32, height: u32, fps: u32, output_path: &Path) -> Vec<String> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            // Output may carry a temporary extension.
            "-f".into(),
            "mp4".into(),
            output_path.to_string_lossy().into_owned(),
        ]
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, frames: &VideoFrames, fps: u32, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }

        let args = Self::build_args(frames.width(), frames.height(), fps, output_path);
        debug!(
            cmd = %format!("{} {}", self.program, args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, "encoder_stderr"));

        let write_result = match child.stdin.take() {
            Some(mut stdin) => frames
                .frames()
                .try_for_each(|frame| stdin.write_all(frame))
                .context("failed to write frame to ffmpeg stdin"),
            None => Err(anyhow!("failed to open ffmpeg stdin")),
        };

        let status = child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = stderr_thread {
            let _ = handle.join();
        }

        write_result?;
        if !status.success() {
            bail!("ffmpeg encoder exited with status {status}");
        }
        if !output_path.is_file() {
            bail!("ffmpeg reported success but {} is missing", output_path.display());
        }

        debug!(
            frames = frames.frame_count(),
            output = %output_path.display(),
            "FFmpeg encoder finished"
        );
        Ok(())
    }
}
