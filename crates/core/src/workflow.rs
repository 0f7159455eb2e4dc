//! The four-stage crop session: select, crop, annotate, process.
//!
//! Each stage owns exactly the data collected so far, so later stages cannot
//! be reached without what they depend on. The controller is the only place
//! that moves between stages; the segment model and the pipeline report back
//! to it and never change the stage themselves.

use std::fmt;
use std::mem;
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CropConfig;
use crate::error::{Error, ProcessingError, Result};
use crate::models::{
    CropSelection, Moment, ProcessingResult, RawAsset, SelectedVideo, VideoMetadata,
};
use crate::pipeline::{PipelineEvent, ProcessingPipeline, RunHandle, RunToken, TrimRequest};
use crate::segment::SegmentModel;
use crate::store::{MomentStorage, MomentStore};
use crate::validate::SelectionValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStage {
    Selecting,
    Cropping,
    AnnotatingMetadata,
    Processing,
    Committed,
    Failed,
    Exited,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Selecting => "selecting",
            WorkflowStage::Cropping => "cropping",
            WorkflowStage::AnnotatingMetadata => "annotating metadata",
            WorkflowStage::Processing => "processing",
            WorkflowStage::Committed => "committed",
            WorkflowStage::Failed => "failed",
            WorkflowStage::Exited => "exited",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the session sits in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowFailure {
    Processing(ProcessingError),
    /// Processing succeeded but saving the moment did not.
    Persistence(String),
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowFailure::Processing(err) => write!(f, "{err}"),
            WorkflowFailure::Persistence(msg) => write!(f, "could not save moment: {msg}"),
        }
    }
}

impl From<WorkflowFailure> for Error {
    fn from(failure: WorkflowFailure) -> Self {
        match failure {
            WorkflowFailure::Processing(err) => Error::Processing(err),
            WorkflowFailure::Persistence(msg) => Error::Persistence(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Progress(f64),
    Committed(Moment),
    Failed(WorkflowFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started(RunToken),
    AlreadyProcessing,
}

/// Everything collected before processing starts.
#[derive(Debug, Clone)]
struct Draft {
    video: SelectedVideo,
    segment: SegmentModel,
    crop: CropSelection,
    metadata: VideoMetadata,
}

impl Draft {
    fn into_moment(self, output_uri: String, thumbnail_uri: Option<String>) -> Moment {
        Moment {
            id: Uuid::new_v4().to_string(),
            name: self.metadata.name,
            description: self.metadata.description,
            original_uri: self.video.uri,
            cropped_uri: output_uri,
            start_time_secs: self.crop.start_time_secs,
            end_time_secs: self.crop.end_time_secs,
            created_at: Utc::now(),
            thumbnail_uri,
        }
    }
}

enum Session {
    Selecting,
    Cropping {
        video: SelectedVideo,
        segment: SegmentModel,
    },
    Annotating {
        video: SelectedVideo,
        segment: SegmentModel,
        crop: CropSelection,
        /// Metadata from an earlier failed attempt, kept for editing.
        previous: Option<VideoMetadata>,
    },
    Processing {
        draft: Draft,
        run: RunHandle,
        progress: f64,
    },
    Failed {
        draft: Draft,
        failure: WorkflowFailure,
        pending: Option<Moment>,
    },
    Committed {
        moment: Moment,
    },
    Exited,
}

impl Session {
    fn stage(&self) -> WorkflowStage {
        match self {
            Session::Selecting => WorkflowStage::Selecting,
            Session::Cropping { .. } => WorkflowStage::Cropping,
            Session::Annotating { .. } => WorkflowStage::AnnotatingMetadata,
            Session::Processing { .. } => WorkflowStage::Processing,
            Session::Failed { .. } => WorkflowStage::Failed,
            Session::Committed { .. } => WorkflowStage::Committed,
            Session::Exited => WorkflowStage::Exited,
        }
    }

    fn draft(&self) -> Option<&Draft> {
        match self {
            Session::Processing { draft, .. } | Session::Failed { draft, .. } => Some(draft),
            _ => None,
        }
    }
}

pub struct WorkflowController {
    config: CropConfig,
    validator: SelectionValidator,
    pipeline: Arc<ProcessingPipeline>,
    session: Session,
    next_run: u64,
}

impl WorkflowController {
    pub fn new(config: CropConfig, pipeline: Arc<ProcessingPipeline>) -> Self {
        Self {
            validator: SelectionValidator::new(&config),
            config,
            pipeline,
            session: Session::Selecting,
            next_run: 1,
        }
    }

    pub fn config(&self) -> &CropConfig {
        &self.config
    }

    pub fn stage(&self) -> WorkflowStage {
        self.session.stage()
    }

    pub fn selected_video(&self) -> Option<&SelectedVideo> {
        match &self.session {
            Session::Cropping { video, .. } | Session::Annotating { video, .. } => Some(video),
            other => other.draft().map(|d| &d.video),
        }
    }

    pub fn segment(&self) -> Option<&SegmentModel> {
        match &self.session {
            Session::Cropping { segment, .. } | Session::Annotating { segment, .. } => {
                Some(segment)
            }
            other => other.draft().map(|d| &d.segment),
        }
    }

    /// Only while cropping; the window is frozen once confirmed.
    pub fn segment_mut(&mut self) -> Option<&mut SegmentModel> {
        match &mut self.session {
            Session::Cropping { segment, .. } => Some(segment),
            _ => None,
        }
    }

    pub fn crop(&self) -> Option<&CropSelection> {
        match &self.session {
            Session::Annotating { crop, .. } => Some(crop),
            other => other.draft().map(|d| &d.crop),
        }
    }

    /// Submitted metadata, or while annotating the metadata of a failed
    /// attempt the user went back from.
    pub fn metadata(&self) -> Option<&VideoMetadata> {
        match &self.session {
            Session::Annotating { previous, .. } => previous.as_ref(),
            other => other.draft().map(|d| &d.metadata),
        }
    }

    pub fn progress(&self) -> Option<f64> {
        match &self.session {
            Session::Processing { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    pub fn active_run(&self) -> Option<RunToken> {
        match &self.session {
            Session::Processing { run, .. } => Some(run.token),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&WorkflowFailure> {
        match &self.session {
            Session::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// The processed clip waiting to be saved, if only saving failed.
    pub fn pending_moment(&self) -> Option<&Moment> {
        match &self.session {
            Session::Failed { pending, .. } => pending.as_ref(),
            _ => None,
        }
    }

    pub fn committed(&self) -> Option<&Moment> {
        match &self.session {
            Session::Committed { moment } => Some(moment),
            _ => None,
        }
    }

    /// Selecting -> Cropping. A rejected asset keeps the session in
    /// `Selecting` and returns the validation error for display.
    pub fn select(&mut self, asset: &RawAsset) -> Result<()> {
        if !matches!(self.session, Session::Selecting) {
            return Err(self.invalid("select a video"));
        }
        let video = self.validator.validate(asset)?;
        let segment = SegmentModel::new(
            video.duration_secs,
            self.config.required_duration_secs,
            self.config.track_width_px,
        )?;
        info!(uri = %video.uri, duration = video.duration_secs, "video selected");
        self.session = Session::Cropping { video, segment };
        Ok(())
    }

    /// Feeds the player-reported duration to the segment. If it arrives after
    /// the crop was confirmed and invalidates it, the session returns to
    /// `Cropping` so the window can be placed again. A crop that still fits
    /// keeps the window where it was confirmed.
    pub fn correct_duration(&mut self, duration_secs: f64) -> Result<bool> {
        match self.take() {
            Session::Cropping { video, mut segment } => {
                let applied = segment.on_duration_corrected(duration_secs);
                self.session = Session::Cropping { video, segment };
                Ok(applied)
            }
            Session::Annotating {
                video,
                mut segment,
                crop,
                previous,
            } => {
                let applied = segment.on_duration_corrected(duration_secs);
                if applied {
                    if let Err(err) = self.check_crop(&crop, &segment) {
                        warn!(error = %err, "confirmed crop no longer fits, back to cropping");
                        self.session = Session::Cropping { video, segment };
                        return Ok(true);
                    }
                    segment.seek_to(crop.start_time_secs);
                }
                self.session = Session::Annotating {
                    video,
                    segment,
                    crop,
                    previous,
                };
                Ok(applied)
            }
            other => {
                self.session = other;
                Err(self.invalid("correct the duration"))
            }
        }
    }

    /// Cropping -> AnnotatingMetadata. The window is re-checked against the
    /// current (possibly corrected) duration before it is accepted.
    pub fn confirm_crop(&mut self) -> Result<CropSelection> {
        match self.take() {
            Session::Cropping { video, segment } => {
                let crop = segment.confirm();
                if let Err(err) = self.check_crop(&crop, &segment) {
                    self.session = Session::Cropping { video, segment };
                    return Err(err);
                }
                debug!(start = crop.start_time_secs, end = crop.end_time_secs, "crop confirmed");
                self.session = Session::Annotating {
                    video,
                    segment,
                    crop,
                    previous: None,
                };
                Ok(crop)
            }
            other => {
                self.session = other;
                Err(self.invalid("confirm a crop"))
            }
        }
    }

    /// One step back. From `Failed` this returns to metadata editing; an
    /// unsaved clip from that run is discarded.
    pub fn back(&mut self) -> Result<()> {
        match self.take() {
            Session::Cropping { .. } => self.session = Session::Selecting,
            Session::Annotating { video, segment, .. } => {
                self.session = Session::Cropping { video, segment };
            }
            Session::Failed { draft, pending, .. } => {
                self.discard_pending(pending);
                self.session = Session::Annotating {
                    video: draft.video,
                    segment: draft.segment,
                    crop: draft.crop,
                    previous: Some(draft.metadata),
                };
            }
            other => {
                self.session = other;
                return Err(self.invalid("go back"));
            }
        }
        Ok(())
    }

    /// AnnotatingMetadata -> Processing. A second submit while a run is in
    /// flight is a no-op.
    pub fn submit(&mut self, name: &str, description: &str) -> Result<SubmitOutcome> {
        match self.take() {
            Session::Annotating {
                video,
                segment,
                crop,
                previous,
            } => {
                let metadata = match VideoMetadata::new(name, description) {
                    Ok(metadata) => metadata,
                    Err(errors) => {
                        self.session = Session::Annotating {
                            video,
                            segment,
                            crop,
                            previous,
                        };
                        return Err(errors.into());
                    }
                };
                let token = self.start_run(Draft {
                    video,
                    segment,
                    crop,
                    metadata,
                });
                Ok(SubmitOutcome::Started(token))
            }
            other => {
                let processing = matches!(other, Session::Processing { .. });
                self.session = other;
                if processing {
                    debug!("submit ignored, already processing");
                    Ok(SubmitOutcome::AlreadyProcessing)
                } else {
                    Err(self.invalid("submit"))
                }
            }
        }
    }

    /// From `Failed`: re-saves a processed clip if only the save failed,
    /// otherwise re-runs the pipeline with identical inputs.
    pub fn retry<S: MomentStorage>(
        &mut self,
        store: &mut MomentStore<S>,
    ) -> Result<Vec<WorkflowEvent>> {
        let mut events = Vec::new();
        match self.take() {
            Session::Failed {
                draft,
                pending: Some(moment),
                ..
            } => {
                info!(id = %moment.id, "retrying save");
                self.commit(draft, moment, store, &mut events);
            }
            Session::Failed {
                draft,
                pending: None,
                ..
            } => {
                self.start_run(draft);
            }
            other => {
                self.session = other;
                return Err(self.invalid("retry"));
            }
        }
        Ok(events)
    }

    /// Leaves the workflow from any non-terminal stage. An in-flight run is
    /// cancelled first; whatever it still produces is discarded.
    pub fn cancel(&mut self) -> Result<()> {
        match self.take() {
            Session::Committed { moment } => {
                self.session = Session::Committed { moment };
                return Err(self.invalid("cancel"));
            }
            Session::Processing { run, .. } => {
                run.cancel.cancel();
                info!(run = %run.token, "processing cancelled");
            }
            Session::Failed { pending, .. } => self.discard_pending(pending),
            Session::Selecting
            | Session::Cropping { .. }
            | Session::Annotating { .. }
            | Session::Exited => {}
        }
        self.session = Session::Exited;
        Ok(())
    }

    /// Applies whatever the active run reported so far without blocking.
    pub fn poll<S: MomentStorage>(&mut self, store: &mut MomentStore<S>) -> Vec<WorkflowEvent> {
        let mut out = Vec::new();
        let Session::Processing { run, .. } = &self.session else {
            return out;
        };
        let token = run.token;
        let mut received = Vec::new();
        let mut disconnected = false;
        loop {
            match run.events.try_recv() {
                Ok(event) => received.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }
        for event in received {
            self.apply(event, store, &mut out);
        }
        if disconnected {
            self.worker_gone(token, &mut out);
        }
        out
    }

    /// Blocks until the active run settles or `timeout` passes.
    pub fn wait<S: MomentStorage>(
        &mut self,
        store: &mut MomentStore<S>,
        timeout: Duration,
    ) -> Vec<WorkflowEvent> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            let (token, received) = match &self.session {
                Session::Processing { run, .. } => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    (run.token, run.events.recv_timeout(remaining))
                }
                _ => break,
            };
            match received {
                Ok(event) => self.apply(event, store, &mut out),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    self.worker_gone(token, &mut out);
                    break;
                }
            }
        }
        out
    }

    fn apply<S: MomentStorage>(
        &mut self,
        event: PipelineEvent,
        store: &mut MomentStore<S>,
        out: &mut Vec<WorkflowEvent>,
    ) {
        if self.active_run() != Some(event.token()) {
            debug!(run = %event.token(), "dropping event from a stale run");
            if let PipelineEvent::Finished { result, .. } = &event {
                self.pipeline.discard_result(result);
            }
            return;
        }

        match event {
            PipelineEvent::Progress { fraction, .. } => {
                if let Session::Processing { progress, .. } = &mut self.session {
                    if fraction > *progress {
                        *progress = fraction;
                        out.push(WorkflowEvent::Progress(fraction));
                    }
                }
            }
            PipelineEvent::Finished { result, .. } => match self.take() {
                Session::Processing { draft, .. } => match result {
                    ProcessingResult::Success {
                        output_uri,
                        thumbnail_uri,
                    } => {
                        let moment = draft.clone().into_moment(output_uri, thumbnail_uri);
                        self.commit(draft, moment, store, out);
                    }
                    ProcessingResult::Failure { reason } => {
                        self.fail(draft, WorkflowFailure::Processing(reason), out);
                    }
                },
                other => self.session = other,
            },
        }
    }

    fn worker_gone(&mut self, token: RunToken, out: &mut Vec<WorkflowEvent>) {
        if self.active_run() != Some(token) {
            return;
        }
        warn!(run = %token, "processing worker stopped without a result");
        match self.take() {
            Session::Processing { draft, .. } => {
                let reason =
                    ProcessingError::UnderlyingFailure("processing stopped unexpectedly".into());
                self.fail(draft, WorkflowFailure::Processing(reason), out);
            }
            other => self.session = other,
        }
    }

    fn fail(&mut self, draft: Draft, failure: WorkflowFailure, out: &mut Vec<WorkflowEvent>) {
        out.push(WorkflowEvent::Failed(failure.clone()));
        self.session = Session::Failed {
            draft,
            failure,
            pending: None,
        };
    }

    /// Saves the moment, retrying once. On a second failure the moment is
    /// kept so `retry` can save it without re-processing.
    fn commit<S: MomentStorage>(
        &mut self,
        draft: Draft,
        moment: Moment,
        store: &mut MomentStore<S>,
        out: &mut Vec<WorkflowEvent>,
    ) {
        let mut result = store.append(moment.clone());
        if let Err(err) = &result {
            if !matches!(err, Error::DuplicateId(_) | Error::NotInitialized) {
                warn!(id = %moment.id, error = %err, "saving moment failed, retrying once");
                result = store.append(moment.clone());
            }
        }

        match result {
            Ok(()) => {
                info!(id = %moment.id, name = %moment.name, "moment saved");
                out.push(WorkflowEvent::Committed(moment.clone()));
                self.session = Session::Committed { moment };
            }
            Err(err) => {
                warn!(id = %moment.id, error = %err, "moment could not be saved");
                let failure = WorkflowFailure::Persistence(err.to_string());
                out.push(WorkflowEvent::Failed(failure.clone()));
                self.session = Session::Failed {
                    draft,
                    failure,
                    pending: Some(moment),
                };
            }
        }
    }

    fn start_run(&mut self, draft: Draft) -> RunToken {
        let token = RunToken(self.next_run);
        self.next_run += 1;
        let request = TrimRequest {
            source_uri: draft.video.uri.clone(),
            start_secs: draft.crop.start_time_secs,
            end_secs: draft.crop.end_time_secs,
        };

        match self.pipeline.spawn(request, token) {
            Ok(run) => {
                self.session = Session::Processing {
                    draft,
                    run,
                    progress: 0.0,
                };
            }
            Err(err) => {
                warn!(run = %token, error = %err, "could not start processing");
                self.session = Session::Failed {
                    draft,
                    failure: WorkflowFailure::Processing(ProcessingError::UnderlyingFailure(
                        err.to_string(),
                    )),
                    pending: None,
                };
            }
        }
        token
    }

    fn check_crop(&self, crop: &CropSelection, segment: &SegmentModel) -> Result<()> {
        crop.check(
            self.config.required_duration_secs,
            self.config.duration_tolerance_secs,
            segment.source_duration_secs(),
        )
    }

    fn discard_pending(&self, pending: Option<Moment>) {
        if let Some(moment) = pending {
            self.pipeline.discard_result(&ProcessingResult::Success {
                output_uri: moment.cropped_uri,
                thumbnail_uri: moment.thumbnail_uri,
            });
        }
    }

    fn take(&mut self) -> Session {
        mem::replace(&mut self.session, Session::Exited)
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            from: self.stage().as_str(),
            action,
        }
    }
}
