//! Fixed-length crop window over a video timeline.
//!
//! The whole window is dragged as one piece; its length never changes, only
//! its position. All values are seconds except the `*_px` accessors, which
//! are positions on a track `track_width_px` wide. Everything here is plain
//! arithmetic so it can run on every gesture frame.

use tracing::warn;

use crate::error::{Error, Result};
use crate::models::CropSelection;

#[derive(Debug, Clone)]
pub struct SegmentModel {
    source_duration_secs: f64,
    required_duration_secs: f64,
    track_width_px: f64,
    start_secs: f64,
    end_secs: f64,
    drag_origin_px: Option<f64>,
}

impl SegmentModel {
    pub fn new(
        source_duration_secs: f64,
        required_duration_secs: f64,
        track_width_px: f64,
    ) -> Result<Self> {
        if !(track_width_px.is_finite() && track_width_px > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "track width must be positive, got {track_width_px}"
            )));
        }
        let mut model = Self {
            source_duration_secs: 0.0,
            required_duration_secs: 0.0,
            track_width_px,
            start_secs: 0.0,
            end_secs: 0.0,
            drag_origin_px: None,
        };
        model.initialize(source_duration_secs, required_duration_secs)?;
        Ok(model)
    }

    /// Resets the window to `[0, min(required, source)]`.
    pub fn initialize(
        &mut self,
        source_duration_secs: f64,
        required_duration_secs: f64,
    ) -> Result<()> {
        check_duration("source duration", source_duration_secs)?;
        check_duration("required duration", required_duration_secs)?;
        self.source_duration_secs = source_duration_secs;
        self.required_duration_secs = required_duration_secs;
        self.start_secs = 0.0;
        self.end_secs = self.window_len_secs();
        self.drag_origin_px = None;
        Ok(())
    }

    pub fn source_duration_secs(&self) -> f64 {
        self.source_duration_secs
    }

    pub fn required_duration_secs(&self) -> f64 {
        self.required_duration_secs
    }

    pub fn track_width_px(&self) -> f64 {
        self.track_width_px
    }

    pub fn start_secs(&self) -> f64 {
        self.start_secs
    }

    pub fn end_secs(&self) -> f64 {
        self.end_secs
    }

    pub fn window_px(&self) -> (f64, f64) {
        (
            self.time_to_pixel(self.start_secs),
            self.time_to_pixel(self.end_secs),
        )
    }

    pub fn window_width_px(&self) -> f64 {
        self.time_to_pixel(self.window_len_secs())
    }

    pub fn pixel_to_time(&self, px: f64) -> f64 {
        px / self.track_width_px * self.source_duration_secs
    }

    pub fn time_to_pixel(&self, secs: f64) -> f64 {
        secs / self.source_duration_secs * self.track_width_px
    }

    /// Places the window start under `px`. Returns false (and leaves the
    /// window untouched) for non-finite or negative input.
    pub fn drag_to(&mut self, px: f64) -> bool {
        if !px.is_finite() || px < 0.0 {
            warn!(px, "ignoring invalid drag position");
            return false;
        }
        self.place_start(self.pixel_to_time(px));
        true
    }

    /// Places the window start at `start_secs`, clamped like a drag.
    pub fn seek_to(&mut self, start_secs: f64) -> bool {
        if !start_secs.is_finite() || start_secs < 0.0 {
            warn!(start_secs, "ignoring invalid window start");
            return false;
        }
        self.place_start(start_secs);
        true
    }

    /// Places the window end under `px`, dragging by the trailing edge.
    pub fn drag_end_to(&mut self, px: f64) -> bool {
        if !px.is_finite() || px < 0.0 {
            warn!(px, "ignoring invalid drag position");
            return false;
        }
        self.place_start(self.pixel_to_time(px) - self.window_len_secs());
        true
    }

    /// Records the current start as the origin of a pan gesture.
    pub fn begin_drag(&mut self) {
        self.drag_origin_px = Some(self.time_to_pixel(self.start_secs));
    }

    /// Moves the window by a gesture translation measured from `begin_drag`.
    pub fn drag_by(&mut self, translation_px: f64) -> bool {
        if !translation_px.is_finite() {
            warn!(translation_px, "ignoring invalid drag translation");
            return false;
        }
        let origin = self
            .drag_origin_px
            .unwrap_or_else(|| self.time_to_pixel(self.start_secs));
        let target = (origin + translation_px).max(0.0);
        self.place_start(self.pixel_to_time(target));
        true
    }

    pub fn end_drag(&mut self) {
        self.drag_origin_px = None;
    }

    /// Adopts an authoritative duration reported once the player is ready.
    /// The window keeps its fractional position on the track and is then
    /// re-clamped to the new bounds.
    pub fn on_duration_corrected(&mut self, new_duration_secs: f64) -> bool {
        if !(new_duration_secs.is_finite() && new_duration_secs > 0.0) {
            warn!(new_duration_secs, "ignoring invalid corrected duration");
            return false;
        }
        let fraction = self.start_secs / self.source_duration_secs;
        self.source_duration_secs = new_duration_secs;
        self.place_start(fraction * new_duration_secs);
        if self.drag_origin_px.is_some() {
            self.begin_drag();
        }
        true
    }

    pub fn confirm(&self) -> CropSelection {
        CropSelection::new(self.start_secs, self.end_secs)
    }

    fn window_len_secs(&self) -> f64 {
        self.required_duration_secs.min(self.source_duration_secs)
    }

    fn max_start_secs(&self) -> f64 {
        (self.source_duration_secs - self.window_len_secs()).max(0.0)
    }

    fn place_start(&mut self, start_secs: f64) {
        let start = start_secs.clamp(0.0, self.max_start_secs());
        self.start_secs = start;
        self.end_secs = (start + self.required_duration_secs).min(self.source_duration_secs);
    }
}

fn check_duration(what: &str, secs: f64) -> Result<()> {
    if secs.is_finite() && secs > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{what} must be positive, got {secs}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-3;

    fn model(duration: f64) -> SegmentModel {
        SegmentModel::new(duration, 5.0, 300.0).unwrap()
    }

    fn assert_window_ok(m: &SegmentModel) {
        assert!(m.start_secs() >= 0.0, "start {}", m.start_secs());
        assert!(
            m.end_secs() <= m.source_duration_secs() + 1e-9,
            "end {} > {}",
            m.end_secs(),
            m.source_duration_secs()
        );
        assert!(
            (m.end_secs() - m.start_secs() - m.required_duration_secs()).abs() < TOL,
            "window {}..{}",
            m.start_secs(),
            m.end_secs()
        );
    }

    #[test]
    fn initializes_at_track_start() {
        let m = model(12.0);
        assert_eq!(m.start_secs(), 0.0);
        assert_eq!(m.end_secs(), 5.0);
        assert!((m.window_width_px() - 125.0).abs() < 1e-9);
    }

    #[test]
    fn short_source_gets_whole_range() {
        let m = model(3.0);
        assert_eq!(m.start_secs(), 0.0);
        assert_eq!(m.end_secs(), 3.0);
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(SegmentModel::new(f64::NAN, 5.0, 300.0).is_err());
        assert!(SegmentModel::new(10.0, 0.0, 300.0).is_err());
        assert!(SegmentModel::new(10.0, 5.0, 0.0).is_err());
    }

    #[test]
    fn drag_keeps_fixed_length_in_bounds() {
        for duration in [5.0, 5.5, 7.25, 10.0, 33.3, 600.0] {
            let mut m = model(duration);
            let mut px = 0.0;
            while px <= 300.0 {
                assert!(m.drag_to(px));
                assert_window_ok(&m);
                px += 0.75;
            }
            assert!(m.drag_to(10_000.0));
            assert_window_ok(&m);
            assert!((m.end_secs() - duration).abs() < 1e-9);
        }
    }

    #[test]
    fn drag_maps_pixels_linearly() {
        let mut m = model(30.0);
        assert!(m.drag_to(100.0));
        assert!((m.start_secs() - 10.0).abs() < 1e-9);
        assert!((m.end_secs() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_drag_is_ignored() {
        let mut m = model(20.0);
        m.drag_to(60.0);
        let before = m.confirm();
        assert!(!m.drag_to(f64::NAN));
        assert!(!m.drag_to(f64::INFINITY));
        assert!(!m.drag_to(-1.0));
        assert!(!m.drag_by(f64::NAN));
        assert_eq!(m.confirm(), before);
        assert!(m.start_secs().is_finite());
    }

    #[test]
    fn pan_gesture_moves_relative_to_origin() {
        let mut m = model(30.0);
        m.drag_to(50.0);
        m.begin_drag();
        m.drag_by(20.0);
        m.drag_by(40.0);
        assert!((m.time_to_pixel(m.start_secs()) - 90.0).abs() < 1e-9);
        m.drag_by(-500.0);
        assert_eq!(m.start_secs(), 0.0);
        m.end_drag();
        assert_window_ok(&m);
    }

    #[test]
    fn seek_places_start_in_seconds() {
        let mut m = model(30.0);
        assert!(m.seek_to(12.5));
        assert_eq!((m.start_secs(), m.end_secs()), (12.5, 17.5));
        assert!(m.seek_to(29.0));
        assert_eq!((m.start_secs(), m.end_secs()), (25.0, 30.0));
        assert!(!m.seek_to(-1.0));
        assert!(!m.seek_to(f64::INFINITY));
        assert_eq!(m.start_secs(), 25.0);
    }

    #[test]
    fn trailing_edge_drag() {
        let mut m = model(30.0);
        m.drag_end_to(150.0);
        assert!((m.end_secs() - 15.0).abs() < 1e-9);
        assert!((m.start_secs() - 10.0).abs() < 1e-9);
        m.drag_end_to(10.0);
        assert_eq!(m.start_secs(), 0.0);
        assert_window_ok(&m);
    }

    #[test]
    fn pixel_time_round_trip() {
        for duration in [5.0, 9.7, 61.0, 3600.0] {
            let m = model(duration);
            let mut t = 0.0;
            while t <= duration {
                let back = m.pixel_to_time(m.time_to_pixel(t));
                assert!((back - t).abs() < 1e-9, "t={t} back={back}");
                t += duration / 97.0;
            }
            let mut px = 0.0;
            while px <= 300.0 {
                let back = m.time_to_pixel(m.pixel_to_time(px));
                assert!((back - px).abs() < 1e-9);
                px += 3.3;
            }
        }
    }

    #[test]
    fn duration_correction_keeps_relative_position() {
        let mut m = model(20.0);
        m.drag_to(150.0);
        assert!((m.start_secs() - 10.0).abs() < 1e-9);

        assert!(m.on_duration_corrected(40.0));
        assert!((m.start_secs() - 20.0).abs() < 1e-9);
        assert_window_ok(&m);

        assert!(m.on_duration_corrected(12.0));
        assert!((m.start_secs() - 6.0).abs() < 1e-9);
        assert_window_ok(&m);
    }

    #[test]
    fn duration_correction_reclamps_to_shorter_video() {
        let mut m = model(20.0);
        m.drag_to(10_000.0);
        assert_eq!(m.end_secs(), 20.0);
        assert!(m.on_duration_corrected(16.0));
        assert_window_ok(&m);
        assert!(m.end_secs() <= 16.0);

        assert!(m.on_duration_corrected(4.0));
        assert_eq!(m.start_secs(), 0.0);
        assert_eq!(m.end_secs(), 4.0);

        assert!(!m.on_duration_corrected(0.0));
        assert!(!m.on_duration_corrected(f64::NAN));
        assert_eq!(m.source_duration_secs(), 4.0);
    }
}
