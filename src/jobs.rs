// ============================================================================
// BACKGROUND JOBS: render and selection passes off the interactive thread
// ============================================================================
//
// Each job kind owns a token.  A request bumps its kind's token and captures
// the new value; a job whose captured token no longer matches is stale.
// Stale jobs stop early (`Superseded`) and their results are discarded on
// delivery.  Workers never write pixels: a selection job only computes its
// mask, and the owner writes it with `commit` once the result is current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use crate::canvas::{LayerId, LayerStack};
use crate::error::{EngineError, Result};
use crate::ops::compositor::{RenderScene, RenderSize};
use crate::ops::selection::{self, FillAction, SelectionMask, SelectionScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Render,
    Selection,
}

/// Result delivered from a worker.
#[derive(Debug)]
pub enum JobOutput {
    Render {
        token: u64,
        image: Result<RgbaImage>,
    },
    Selection {
        token: u64,
        layer: LayerId,
        /// Edit [`JobQueue::commit`] writes through the mask.
        action: Option<FillAction>,
        mask: Result<SelectionMask>,
    },
}

impl JobOutput {
    pub fn kind(&self) -> JobKind {
        match self {
            JobOutput::Render { .. } => JobKind::Render,
            JobOutput::Selection { .. } => JobKind::Selection,
        }
    }

    pub fn token(&self) -> u64 {
        match self {
            JobOutput::Render { token, .. } | JobOutput::Selection { token, .. } => *token,
        }
    }
}

/// A magic wand request against one layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectionRequest {
    pub layer: LayerId,
    pub seed: (u32, u32),
    pub tolerance: f32,
    pub scope: SelectionScope,
    /// `None` computes the mask only.
    pub action: Option<FillAction>,
}

pub struct JobQueue {
    sender: mpsc::Sender<JobOutput>,
    receiver: mpsc::Receiver<JobOutput>,
    render_token: Arc<AtomicU64>,
    selection_token: Arc<AtomicU64>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            render_token: Arc::new(AtomicU64::new(0)),
            selection_token: Arc::new(AtomicU64::new(0)),
        }
    }

    fn token_cell(&self, kind: JobKind) -> &Arc<AtomicU64> {
        match kind {
            JobKind::Render => &self.render_token,
            JobKind::Selection => &self.selection_token,
        }
    }

    fn bump(&self, kind: JobKind) -> u64 {
        self.token_cell(kind).fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub fn current_token(&self, kind: JobKind) -> u64 {
        self.token_cell(kind).load(Ordering::SeqCst)
    }

    pub fn is_current(&self, output: &JobOutput) -> bool {
        output.token() == self.current_token(output.kind())
    }

    /// Supersede any in-flight job of `kind` without starting a new one.
    pub fn cancel(&self, kind: JobKind) {
        self.bump(kind);
    }

    /// Render the stack on the rayon pool.  Size errors are reported here,
    /// synchronously; the raster arrives through [`poll`](Self::poll).
    pub fn request_render(&self, stack: &LayerStack, size: RenderSize, background: Option<Rgba<u8>>) -> Result<u64> {
        let scene = RenderScene::capture(stack);
        let dims = scene.resolve_size(size)?;
        let token = self.bump(JobKind::Render);
        let current = Arc::clone(&self.render_token);
        let sender = self.sender.clone();

        rayon::spawn(move || {
            let cancelled = || current.load(Ordering::SeqCst) != token;
            let image = if cancelled() {
                Err(EngineError::Superseded)
            } else {
                scene.composite_cancellable(dims, background, &cancelled)
            };
            let _ = sender.send(JobOutput::Render { token, image });
        });
        log::debug!("render job {token} queued at {}×{}", dims.0, dims.1);
        Ok(token)
    }

    /// Compute a magic wand mask on the rayon pool.  The layer's buffer is
    /// read-locked for the pass; nothing is written until [`commit`](Self::commit).
    pub fn request_selection(&self, stack: &LayerStack, request: SelectionRequest) -> Result<u64> {
        let layer = stack.get(request.layer)?;
        let (w, h) = layer.pixel_size();
        if request.seed.0 >= w || request.seed.1 >= h {
            return Err(EngineError::out_of_bounds(request.seed.0 as f64, request.seed.1 as f64, w, h));
        }
        let pixels = layer.shared_pixels();
        let token = self.bump(JobKind::Selection);
        let current = Arc::clone(&self.selection_token);
        let sender = self.sender.clone();

        rayon::spawn(move || {
            let cancelled = || current.load(Ordering::SeqCst) != token;
            let mask = if cancelled() {
                Err(EngineError::Superseded)
            } else {
                let guard = pixels.read().unwrap_or_else(PoisonError::into_inner);
                selection::select_cancellable(&guard, request.seed, request.tolerance, request.scope, &cancelled)
            };
            let _ = sender.send(JobOutput::Selection {
                token,
                layer: request.layer,
                action: request.action,
                mask,
            });
        });
        log::debug!("selection job {token} queued for layer {}", request.layer);
        Ok(token)
    }

    /// Write a delivered selection's fill action into its layer, under the
    /// layer's write guard.  Returns the number of pixels written.
    ///
    /// Fails with `Superseded` when a newer request of the same kind exists,
    /// leaving the layer untouched.  Renders and mask-only selections write
    /// nothing.
    pub fn commit(&self, stack: &LayerStack, output: &JobOutput) -> Result<usize> {
        if !self.is_current(output) {
            return Err(EngineError::Superseded);
        }
        match output {
            JobOutput::Render { .. } | JobOutput::Selection { action: None, .. } => Ok(0),
            JobOutput::Selection {
                layer,
                action: Some(action),
                mask,
                ..
            } => {
                let mask = mask.as_ref().map_err(Clone::clone)?;
                let layer = stack.get(*layer)?;
                let written = selection::apply(mask, &mut layer.pixels_mut(), *action)?;
                log::debug!("committed selection {} ({written} pixel(s))", output.token());
                Ok(written)
            }
        }
    }

    /// Drain finished jobs, keeping only results of the latest request of
    /// each kind.
    pub fn poll(&self) -> Vec<JobOutput> {
        let mut out = Vec::new();
        while let Ok(result) = self.receiver.try_recv() {
            if self.is_current(&result) {
                out.push(result);
            }
        }
        out
    }

    /// Block until a current result arrives or `timeout` elapses.
    pub fn wait_next(&self, timeout: Duration) -> Option<JobOutput> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.receiver.recv_timeout(remaining) {
                Ok(result) if self.is_current(&result) => return Some(result),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}
