//! Process-wide guard around the one-time model load.
//!
//! The guard is an explicit state machine:
//! `Uninitialized -> Initializing -> Ready | Failed`. Exactly one caller
//! performs the load; concurrent callers block on a condition variable until
//! the outcome is published. A failed load is sticky for the life of the
//! process.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::backend::{ModelLoader, Sampler};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model initialization failed: {reason}")]
pub struct InitError {
    pub reason: String,
}

/// Externally visible lifecycle phase of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

enum GuardState {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn Sampler>),
    Failed(InitError),
}

impl GuardState {
    fn phase(&self) -> ModelState {
        match self {
            GuardState::Uninitialized => ModelState::Uninitialized,
            GuardState::Initializing => ModelState::Initializing,
            GuardState::Ready(_) => ModelState::Ready,
            GuardState::Failed(_) => ModelState::Failed,
        }
    }
}

pub struct ModelGuard {
    loader: Arc<dyn ModelLoader>,
    model_root: PathBuf,
    state: Mutex<GuardState>,
    settled: Condvar,
}

impl ModelGuard {
    pub fn new(loader: Arc<dyn ModelLoader>, model_root: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            model_root: model_root.into(),
            state: Mutex::new(GuardState::Uninitialized),
            settled: Condvar::new(),
        }
    }

    pub fn model_root(&self) -> &Path {
        &self.model_root
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the loaded sampler, loading it first if nobody has yet.
    ///
    /// Blocks the calling thread while another caller's load is in flight, so
    /// async callers must run this on a blocking thread.
    pub fn ensure_ready(&self) -> Result<Arc<dyn Sampler>, InitError> {
        let mut state = self.lock();
        loop {
            match &*state {
                GuardState::Ready(sampler) => return Ok(Arc::clone(sampler)),
                GuardState::Failed(err) => return Err(err.clone()),
                GuardState::Initializing => {
                    state = self
                        .settled
                        .wait(state)
                        .unwrap_or_else(|p| p.into_inner());
                }
                GuardState::Uninitialized => {
                    *state = GuardState::Initializing;
                    break;
                }
            }
        }
        drop(state);

        info!(model_root = %self.model_root.display(), "Loading model");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(&self.model_root)));

        let (next, result) = match outcome {
            Ok(Ok(sampler)) => {
                info!("Model ready");
                (GuardState::Ready(Arc::clone(&sampler)), Ok(sampler))
            }
            Ok(Err(err)) => {
                let err = InitError {
                    reason: format!("{err:#}"),
                };
                error!(reason = %err.reason, "Model load failed");
                (GuardState::Failed(err.clone()), Err(err))
            }
            Err(payload) => {
                let err = InitError {
                    reason: format!("model loader panicked: {}", panic_message(&*payload)),
                };
                error!(reason = %err.reason, "Model load failed");
                (GuardState::Failed(err.clone()), Err(err))
            }
        };

        *self.lock() = next;
        self.settled.notify_all();
        result
    }

    pub fn state(&self) -> ModelState {
        self.lock().phase()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// The recorded failure, once the guard is permanently failed.
    pub fn failure(&self) -> Option<InitError> {
        match &*self.lock() {
            GuardState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use anyhow::{bail, Result};

    use super::*;
    use crate::backend::VideoFrames;
    use crate::params::GenerationParams;

    struct NullSampler;

    impl Sampler for NullSampler {
        fn predict(&self, params: &GenerationParams) -> Result<VideoFrames> {
            VideoFrames::new(params.width, params.height, 0, Vec::new())
        }
    }

    struct SlowLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ModelLoader for SlowLoader {
        fn load(&self, _model_root: &Path) -> Result<Arc<dyn Sampler>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            if self.fail {
                bail!("weights are corrupt");
            }
            Ok(Arc::new(NullSampler))
        }
    }

    struct PanickingLoader;

    impl ModelLoader for PanickingLoader {
        fn load(&self, _model_root: &Path) -> Result<Arc<dyn Sampler>> {
            panic!("out of memory");
        }
    }

    fn slow_loader(fail: bool) -> Arc<SlowLoader> {
        Arc::new(SlowLoader {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn concurrent_callers_share_a_single_load() {
        let loader = slow_loader(false);
        let guard = ModelGuard::new(loader.clone(), "ckpts");
        assert_eq!(guard.state(), ModelState::Uninitialized);

        let samplers: Vec<Arc<dyn Sampler>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| guard.ensure_ready().expect("load succeeds")))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread"))
                .collect()
        });

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(samplers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(guard.is_ready());
        assert!(guard.failure().is_none());
    }

    #[test]
    fn failure_is_sticky_and_never_retried() {
        let loader = slow_loader(true);
        let guard = ModelGuard::new(loader.clone(), "ckpts");

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| guard.ensure_ready().map(|_| ())))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread"))
                .collect()
        });

        for result in &results {
            let err = result.as_ref().expect_err("every caller sees the failure");
            assert!(err.reason.contains("weights are corrupt"));
        }

        let again = guard.ensure_ready().map(|_| ()).expect_err("still failed");
        assert_eq!(Some(again), guard.failure());
        assert_eq!(guard.state(), ModelState::Failed);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loader_panic_becomes_init_failure() {
        let guard = ModelGuard::new(Arc::new(PanickingLoader), "ckpts");

        let err = guard.ensure_ready().map(|_| ()).expect_err("panic is a failure");
        assert!(err.reason.contains("out of memory"));
        assert_eq!(guard.state(), ModelState::Failed);
    }

    #[test]
    fn model_state_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&ModelState::Initializing).unwrap(),
            "\"initializing\""
        );
    }
}
