//! Backend doubles shared by the registry, server and relay tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::backend::{Encoder, ModelLoader, Sampler, VideoFrames};
use crate::params::GenerationParams;

/// Sampler that blocks each call until the test opens the gate for it.
///
/// Prompts containing `explode` fail once released.
#[derive(Default)]
pub(crate) struct GatedSampler {
    permits: Mutex<usize>,
    opened: Condvar,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedSampler {
    pub(crate) fn open(&self, n: usize) {
        *self.permits.lock().unwrap() += n;
        self.opened.notify_all();
    }

    /// Never blocks.
    pub(crate) fn open_all(&self) {
        self.open(usize::MAX / 2);
    }

    pub(crate) fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Sampler for GatedSampler {
    fn predict(&self, params: &GenerationParams) -> Result<VideoFrames> {
        self.started.lock().unwrap().push(params.prompt.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.opened.wait(permits).unwrap();
        }
        *permits -= 1;
        drop(permits);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if params.prompt.contains("explode") {
            bail!("sampler ran out of memory");
        }
        VideoFrames::new(1, 1, 1, vec![0, 0, 0])
    }
}

/// Loader that hands out an existing sampler and counts how often it ran.
pub(crate) struct SharedLoader<S: Sampler + 'static> {
    sampler: Arc<S>,
    pub(crate) calls: AtomicUsize,
}

impl<S: Sampler + 'static> SharedLoader<S> {
    pub(crate) fn new(sampler: Arc<S>) -> Self {
        Self {
            sampler,
            calls: AtomicUsize::new(0),
        }
    }
}

impl<S: Sampler + 'static> ModelLoader for SharedLoader<S> {
    fn load(&self, _model_root: &Path) -> Result<Arc<dyn Sampler>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sampler: Arc<dyn Sampler> = self.sampler.clone();
        Ok(sampler)
    }
}

pub(crate) struct BrokenLoader;

impl ModelLoader for BrokenLoader {
    fn load(&self, model_root: &Path) -> Result<Arc<dyn Sampler>> {
        bail!("model directory not found: {}", model_root.display())
    }
}

/// Writes one byte per pixel of the first frame so artifacts exist on disk.
pub(crate) struct FileEncoder;

impl Encoder for FileEncoder {
    fn encode(&self, frames: &VideoFrames, _fps: u32, output_path: &Path) -> Result<()> {
        std::fs::write(output_path, vec![7u8; frames.frame_size()])?;
        Ok(())
    }
}

/// Encoder that writes a few bytes and then fails, like an interrupted FFmpeg.
pub(crate) struct PartialThenFailEncoder;

impl Encoder for PartialThenFailEncoder {
    fn encode(&self, _frames: &VideoFrames, _fps: u32, output_path: &Path) -> Result<()> {
        std::fs::write(output_path, b"partial")?;
        bail!("ffmpeg encoder exited with status 1")
    }
}

pub(crate) fn output_dir(root: &Path) -> PathBuf {
    root.join("results")
}

pub(crate) async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
