//! Trim + thumbnail job for one confirmed crop.
//!
//! `run` is the synchronous body; `spawn` runs it on a background thread and
//! reports over a channel that lives exactly as long as the run. Failures are
//! always returned as `ProcessingResult::Failure`, never raised.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{ProcessingError, Result};
use crate::models::ProcessingResult;

pub const PROGRESS_ANALYZING: f64 = 0.2;
pub const PROGRESS_TRIMMED: f64 = 0.8;
pub const PROGRESS_THUMBNAIL: f64 = 0.9;
pub const PROGRESS_DONE: f64 = 1.0;

/// External media operations the pipeline drives.
pub trait MediaOps: Send + Sync {
    /// Whether `uri` names a readable, existing file.
    fn exists(&self, uri: &str) -> bool;

    fn trim(&self, uri: &str, start_secs: f64, end_secs: f64) -> Result<String>;

    fn thumbnail(&self, uri: &str, at_secs: f64, quality: f32) -> Result<String>;

    /// Best-effort removal of an artifact this pipeline produced.
    fn remove_artifact(&self, uri: &str) -> Result<()> {
        let _ = uri;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Identifies one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunToken(pub u64);

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimRequest {
    pub source_uri: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Progress { token: RunToken, fraction: f64 },
    Finished { token: RunToken, result: ProcessingResult },
}

impl PipelineEvent {
    pub fn token(&self) -> RunToken {
        match self {
            PipelineEvent::Progress { token, .. } | PipelineEvent::Finished { token, .. } => *token,
        }
    }
}

/// A run in flight. Dropping the handle unsubscribes from its events.
#[derive(Debug)]
pub struct RunHandle {
    pub token: RunToken,
    pub cancel: CancelToken,
    pub events: Receiver<PipelineEvent>,
    thread: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Blocks until the worker thread exits.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct ProcessingPipeline {
    media: Arc<dyn MediaOps>,
    thumbnail_quality: f32,
}

impl ProcessingPipeline {
    pub fn new(media: Arc<dyn MediaOps>, thumbnail_quality: f32) -> Self {
        Self {
            media,
            thumbnail_quality,
        }
    }

    pub fn media(&self) -> &Arc<dyn MediaOps> {
        &self.media
    }

    pub fn run<F>(
        &self,
        request: &TrimRequest,
        cancel: Option<&CancelToken>,
        mut on_progress: F,
    ) -> ProcessingResult
    where
        F: FnMut(f64),
    {
        match self.run_steps(request, cancel, &mut on_progress) {
            Ok((output_uri, thumbnail_uri)) => ProcessingResult::Success {
                output_uri,
                thumbnail_uri,
            },
            Err(reason) => {
                warn!(source = %request.source_uri, %reason, "processing failed");
                ProcessingResult::Failure { reason }
            }
        }
    }

    fn run_steps<F>(
        &self,
        request: &TrimRequest,
        cancel: Option<&CancelToken>,
        on_progress: &mut F,
    ) -> std::result::Result<(String, Option<String>), ProcessingError>
    where
        F: FnMut(f64),
    {
        check_request(request)?;
        let cancelled = || cancel.is_some_and(|c| c.is_cancelled());

        if cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        if !self.media.exists(&request.source_uri) {
            return Err(ProcessingError::SourceUnavailable(request.source_uri.clone()));
        }

        on_progress(PROGRESS_ANALYZING);
        debug!(
            source = %request.source_uri,
            start = request.start_secs,
            end = request.end_secs,
            "trimming"
        );
        let output_uri = self
            .media
            .trim(&request.source_uri, request.start_secs, request.end_secs)
            .map_err(|err| ProcessingError::UnderlyingFailure(err.to_string()))?;

        if cancelled() {
            self.discard(&output_uri);
            return Err(ProcessingError::Cancelled);
        }

        on_progress(PROGRESS_TRIMMED);
        if output_uri.trim().is_empty() || !self.media.exists(&output_uri) {
            return Err(ProcessingError::OutputMissing(output_uri));
        }

        on_progress(PROGRESS_THUMBNAIL);
        let midpoint = request.start_secs + (request.end_secs - request.start_secs) / 2.0;
        let thumbnail_uri = match self.media.thumbnail(
            &request.source_uri,
            midpoint,
            self.thumbnail_quality,
        ) {
            Ok(uri) => Some(uri),
            Err(err) => {
                warn!(
                    source = %request.source_uri,
                    error = %err,
                    "thumbnail failed, continuing without one"
                );
                None
            }
        };

        on_progress(PROGRESS_DONE);
        Ok((output_uri, thumbnail_uri))
    }

    /// Runs on a background thread. Results of a cancelled run, or of a run
    /// nobody listens to any more, are cleaned up instead of delivered.
    pub fn spawn(self: &Arc<Self>, request: TrimRequest, token: RunToken) -> Result<RunHandle> {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let pipeline = Arc::clone(self);
        let worker_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name(format!("clipdiary-{token}"))
            .spawn(move || pipeline.run_reporting(&request, token, &worker_cancel, tx))?;

        info!(run = %token, "processing started");
        Ok(RunHandle {
            token,
            cancel,
            events: rx,
            thread: Some(thread),
        })
    }

    fn run_reporting(
        &self,
        request: &TrimRequest,
        token: RunToken,
        cancel: &CancelToken,
        tx: Sender<PipelineEvent>,
    ) {
        let result = self.run(request, Some(cancel), |fraction| {
            let _ = tx.send(PipelineEvent::Progress { token, fraction });
        });

        if cancel.is_cancelled() {
            info!(run = %token, "run cancelled, dropping its result");
            self.discard_result(&result);
            return;
        }
        if let Err(mpsc::SendError(event)) = tx.send(PipelineEvent::Finished { token, result }) {
            warn!(run = %token, "no listener for finished run, dropping its result");
            if let PipelineEvent::Finished { result, .. } = event {
                self.discard_result(&result);
            }
        }
    }

    pub fn discard_result(&self, result: &ProcessingResult) {
        if let ProcessingResult::Success {
            output_uri,
            thumbnail_uri,
        } = result
        {
            self.discard(output_uri);
            if let Some(thumb) = thumbnail_uri {
                self.discard(thumb);
            }
        }
    }

    fn discard(&self, uri: &str) {
        if let Err(err) = self.media.remove_artifact(uri) {
            warn!(uri, error = %err, "failed to remove artifact");
        }
    }
}

fn check_request(request: &TrimRequest) -> std::result::Result<(), ProcessingError> {
    if request.source_uri.trim().is_empty() {
        return Err(ProcessingError::InvalidParameters(
            "source uri is required".into(),
        ));
    }
    if !request.start_secs.is_finite() || request.start_secs < 0.0 {
        return Err(ProcessingError::InvalidParameters(format!(
            "start time must be a non-negative number, got {}",
            request.start_secs
        )));
    }
    if !request.end_secs.is_finite() || request.end_secs <= request.start_secs {
        return Err(ProcessingError::InvalidParameters(format!(
            "end time {} must be greater than start time {}",
            request.end_secs, request.start_secs
        )));
    }
    Ok(())
}
