//! Real-time recognition scheduler.
//!
//! Bounds how often the expensive detection and matching path runs. Each
//! frame is classified by its sequence number: most frames are skipped and
//! re-show the last annotations for a limited number of frames, every
//! `frame_skip`-th frame runs detection, and among those the ones that also
//! fall on `encoding_every` run identity matching and may emit attendance.

use crate::detector::{DetectorError, FaceLocator};
use crate::frame::{self, Frame};
use crate::matcher::{label_for, Matcher};
use crate::recognizer::FaceEncoder;
use crate::types::{is_reserved_name, Annotation, AnnotationSet, Face, KnownIdentity, Label, Region};
use image::RgbImage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tunable scheduler constants.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Run detection on every Nth frame.
    pub frame_skip: u64,
    /// Factor in (0, 1] applied to the frame before detection.
    pub downscale_factor: f32,
    /// Run identity matching on frames whose sequence is also a multiple of this.
    pub encoding_every: u64,
    /// Skipped frames that keep showing the last matched annotations.
    pub persistence_frames: i64,
    /// Minimum gap between two attendance events for the same name.
    pub cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frame_skip: 3,
            downscale_factor: 0.5,
            encoding_every: 2,
            persistence_frames: 10,
            cooldown: Duration::from_secs(2),
        }
    }
}

/// What a frame is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Skip,
    DetectOnly,
    DetectAndMatch,
}

/// Classifies frames by sequence number. Pure arithmetic, no state.
#[derive(Debug, Clone, Copy)]
pub struct CadenceController {
    frame_skip: u64,
    encoding_every: u64,
}

impl CadenceController {
    /// Zero intervals are treated as 1 (every frame).
    pub fn new(frame_skip: u64, encoding_every: u64) -> Self {
        Self {
            frame_skip: frame_skip.max(1),
            encoding_every: encoding_every.max(1),
        }
    }

    pub fn classify(&self, sequence: u64) -> Cadence {
        if sequence % self.frame_skip != 0 {
            Cadence::Skip
        } else if sequence % self.encoding_every != 0 {
            Cadence::DetectOnly
        } else {
            Cadence::DetectAndMatch
        }
    }
}

/// The last annotations and how many more skipped frames may show them.
#[derive(Debug)]
pub struct PersistenceState {
    annotations: AnnotationSet,
    counter: i64,
    persistence_frames: i64,
}

impl PersistenceState {
    pub fn new(persistence_frames: i64) -> Self {
        Self {
            annotations: AnnotationSet::default(),
            counter: 0,
            persistence_frames,
        }
    }

    /// Count down one skipped frame. The annotations are returned only
    /// while the counter is still positive.
    pub fn on_skip(&mut self) -> Option<&AnnotationSet> {
        self.counter = self.counter.saturating_sub(1);
        (self.counter > 0).then_some(&self.annotations)
    }

    /// Fresh regions from a detect-only pass. Labels are dropped and the
    /// counter is left alone.
    pub fn on_detect(&mut self, regions: impl IntoIterator<Item = Region>) -> &AnnotationSet {
        self.annotations = AnnotationSet::unlabeled(regions);
        &self.annotations
    }

    /// Fully labelled annotations from a matching pass; restarts the countdown.
    pub fn on_match(&mut self, annotations: AnnotationSet) -> &AnnotationSet {
        self.annotations = annotations;
        self.counter = self.persistence_frames;
        &self.annotations
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    /// Zero or below means expired.
    pub fn counter(&self) -> i64 {
        self.counter
    }
}

/// Per-name rate limit for attendance events.
#[derive(Debug)]
pub struct AttendanceDeduplicator {
    cooldown: Duration,
    last_dispatch: HashMap<String, Instant>,
}

impl AttendanceDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_dispatch: HashMap::new(),
        }
    }

    /// True when `name` has never dispatched or its last dispatch is at
    /// least one cooldown before `now`. A true result records `now`.
    pub fn should_dispatch(&mut self, name: &str, now: Instant) -> bool {
        if let Some(&last) = self.last_dispatch.get(name) {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.last_dispatch.insert(name.to_string(), now);
        true
    }

    pub fn last_dispatch(&self, name: &str) -> Option<Instant> {
        self.last_dispatch.get(name).copied()
    }
}

/// Result of scheduling one frame.
#[derive(Debug)]
pub struct FrameOutcome<'a> {
    pub cadence: Cadence,
    /// Annotations to draw over this frame, if any.
    pub overlay: Option<&'a AnnotationSet>,
    /// Names that should produce an attendance event now, in match order.
    pub dispatches: Vec<String>,
}

/// Downscale, detect, and map faces back to full resolution.
pub fn locate_full_resolution<L: FaceLocator + ?Sized>(
    locator: &mut L,
    image: &RgbImage,
    downscale_factor: f32,
) -> Result<Vec<Face>, DetectorError> {
    if downscale_factor >= 1.0 {
        return locator.locate(image);
    }
    let small = frame::downscale(image, downscale_factor);
    Ok(locator
        .locate(&small)?
        .iter()
        .map(|face| face.to_full_resolution(downscale_factor))
        .collect())
}

/// Owns all per-stream recognition state.
pub struct Scheduler<L, E, M> {
    config: SchedulerConfig,
    cadence: CadenceController,
    persistence: PersistenceState,
    dedup: AttendanceDeduplicator,
    locator: L,
    encoder: E,
    matcher: M,
    known: Vec<KnownIdentity>,
}

impl<L: FaceLocator, E: FaceEncoder, M: Matcher> Scheduler<L, E, M> {
    pub fn new(
        config: SchedulerConfig,
        locator: L,
        encoder: E,
        matcher: M,
        mut known: Vec<KnownIdentity>,
    ) -> Self {
        known.retain(|identity| {
            let reserved = is_reserved_name(&identity.name);
            if reserved {
                tracing::warn!(name = %identity.name, "ignoring identity with a reserved name");
            }
            !reserved
        });
        Self {
            cadence: CadenceController::new(config.frame_skip, config.encoding_every),
            persistence: PersistenceState::new(config.persistence_frames),
            dedup: AttendanceDeduplicator::new(config.cooldown),
            config,
            locator,
            encoder,
            matcher,
            known,
        }
    }

    pub fn persistence(&self) -> &PersistenceState {
        &self.persistence
    }

    /// Schedule one frame observed at `now`.
    ///
    /// Detection or encoding failures are logged and leave the previous
    /// annotations in place; they never stop the stream.
    pub fn process_frame(&mut self, frame: &Frame, now: Instant) -> FrameOutcome<'_> {
        let cadence = self.cadence.classify(frame.sequence);
        tracing::trace!(seq = frame.sequence, ?cadence, "frame scheduled");

        let mut dispatches = Vec::new();
        let overlay = match cadence {
            Cadence::Skip => self.persistence.on_skip(),
            Cadence::DetectOnly => match self.locate(frame) {
                Some(faces) => Some(self.persistence.on_detect(faces.iter().map(|f| f.region))),
                None => Some(self.persistence.annotations()),
            },
            Cadence::DetectAndMatch => match self.recognize(frame) {
                Some(annotations) => {
                    for name in annotations.iter().filter_map(|a| a.label.known_name()) {
                        if self.dedup.should_dispatch(name, now) {
                            dispatches.push(name.to_string());
                        } else {
                            tracing::trace!(name, "attendance suppressed by cooldown");
                        }
                    }
                    Some(self.persistence.on_match(annotations))
                }
                None => Some(self.persistence.annotations()),
            },
        };

        FrameOutcome {
            cadence,
            overlay,
            dispatches,
        }
    }

    fn locate(&mut self, frame: &Frame) -> Option<Vec<Face>> {
        match locate_full_resolution(&mut self.locator, &frame.image, self.config.downscale_factor) {
            Ok(faces) => {
                tracing::debug!(seq = frame.sequence, faces = faces.len(), "faces located");
                Some(faces)
            }
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face detection failed; keeping previous annotations");
                None
            }
        }
    }

    /// Detect, encode on the full-resolution frame, and label every face.
    fn recognize(&mut self, frame: &Frame) -> Option<AnnotationSet> {
        let faces = self.locate(frame)?;
        if faces.is_empty() {
            return Some(AnnotationSet::default());
        }

        let embeddings = match self.encoder.encode(&frame.image, &faces) {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face encoding failed; keeping previous annotations");
                return None;
            }
        };

        let annotations: Vec<Annotation> = faces
            .iter()
            .zip(embeddings.iter())
            .map(|(face, embedding)| Annotation {
                region: face.region,
                label: label_for(embedding, &self.known, &self.matcher),
            })
            .collect();

        tracing::debug!(
            seq = frame.sequence,
            known = annotations.iter().filter(|a| matches!(a.label, Label::Known(_))).count(),
            unknown = annotations.iter().filter(|a| a.label == Label::Unknown).count(),
            "faces matched"
        );
        Some(AnnotationSet::new(annotations))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matcher::CosineMatcher;
    use crate::recognizer::RecognizerError;
    use crate::types::Embedding;
    use rstest::rstest;

    /// Returns the same faces for every image, scaled to the image size
    /// it is given relative to `full_width`.
    pub(crate) struct FixedLocator {
        pub faces: Vec<Face>,
        pub full_width: u32,
        pub calls: usize,
        pub fail: bool,
    }

    impl FixedLocator {
        pub(crate) fn new(faces: Vec<Face>, full_width: u32) -> Self {
            Self { faces, full_width, calls: 0, fail: false }
        }
    }

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<Face>, DetectorError> {
            self.calls += 1;
            if self.fail {
                return Err(DetectorError::InferenceFailed("boom".into()));
            }
            let s = image.width() as f32 / self.full_width as f32;
            Ok(self
                .faces
                .iter()
                .map(|f| Face { region: f.region.scaled_by(s), ..f.clone() })
                .collect())
        }
    }

    /// Hands out queued embeddings, one per face.
    pub(crate) struct QueuedEncoder {
        pub embeddings: Vec<Embedding>,
        pub seen: Vec<Vec<Region>>,
    }

    impl QueuedEncoder {
        pub(crate) fn new(embeddings: Vec<Embedding>) -> Self {
            Self { embeddings, seen: Vec::new() }
        }
    }

    impl FaceEncoder for QueuedEncoder {
        fn encode(&mut self, _image: &RgbImage, faces: &[Face]) -> Result<Vec<Embedding>, RecognizerError> {
            self.seen.push(faces.iter().map(|f| f.region).collect());
            Ok(faces
                .iter()
                .enumerate()
                .map(|(i, _)| self.embeddings[i % self.embeddings.len()].clone())
                .collect())
        }
    }

    pub(crate) fn alice() -> KnownIdentity {
        KnownIdentity { name: "alice".into(), embedding: Embedding::new(vec![1.0, 0.0]) }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(RgbImage::new(200, 100), sequence)
    }

    fn face(region: Region) -> Face {
        Face::from_region(region)
    }

    fn scheduler(
        config: SchedulerConfig,
        embeddings: Vec<Embedding>,
    ) -> Scheduler<FixedLocator, QueuedEncoder, CosineMatcher> {
        Scheduler::new(
            config,
            FixedLocator::new(vec![face(Region::new(20, 80, 60, 40))], 200),
            QueuedEncoder::new(embeddings),
            CosineMatcher { threshold: 0.9 },
            vec![alice()],
        )
    }

    #[rstest]
    #[case(1, Cadence::Skip)]
    #[case(2, Cadence::Skip)]
    #[case(3, Cadence::DetectOnly)]
    #[case(4, Cadence::Skip)]
    #[case(5, Cadence::Skip)]
    #[case(6, Cadence::DetectAndMatch)]
    #[case(9, Cadence::DetectOnly)]
    #[case(12, Cadence::DetectAndMatch)]
    fn test_cadence_skip3_encode2(#[case] seq: u64, #[case] expected: Cadence) {
        assert_eq!(CadenceController::new(3, 2).classify(seq), expected);
    }

    #[test]
    fn test_cadence_sequence_one_to_six() {
        let cadence = CadenceController::new(3, 2);
        let classes: Vec<Cadence> = (1..=6).map(|s| cadence.classify(s)).collect();
        assert_eq!(
            classes,
            vec![
                Cadence::Skip,
                Cadence::Skip,
                Cadence::DetectOnly,
                Cadence::Skip,
                Cadence::Skip,
                Cadence::DetectAndMatch,
            ]
        );
    }

    #[test]
    fn test_cadence_deterministic() {
        let cadence = CadenceController::new(4, 3);
        let first: Vec<Cadence> = (0..200).map(|s| cadence.classify(s)).collect();
        let second: Vec<Cadence> = (0..200).map(|s| cadence.classify(s)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cadence_every_frame() {
        let cadence = CadenceController::new(1, 1);
        assert!((1..50).all(|s| cadence.classify(s) == Cadence::DetectAndMatch));
        // zero is clamped rather than dividing by zero
        assert_eq!(CadenceController::new(0, 0).classify(7), Cadence::DetectAndMatch);
    }

    #[test]
    fn test_persistence_counts_down_and_expires() {
        let mut state = PersistenceState::new(3);
        state.on_match(AnnotationSet::unlabeled([Region::new(0, 1, 1, 0)]));
        assert_eq!(state.counter(), 3);

        assert!(state.on_skip().is_some()); // 2
        assert!(state.on_skip().is_some()); // 1
        assert!(state.on_skip().is_none()); // 0
        assert!(state.on_skip().is_none()); // -1
        assert_eq!(state.counter(), -1);
    }

    #[test]
    fn test_persistence_non_increasing_across_skips() {
        let mut state = PersistenceState::new(5);
        state.on_match(AnnotationSet::default());
        let mut prev = state.counter();
        for _ in 0..20 {
            state.on_skip();
            assert!(state.counter() <= prev);
            prev = state.counter();
        }
    }

    #[test]
    fn test_persistence_detect_keeps_counter() {
        let mut state = PersistenceState::new(4);
        state.on_match(AnnotationSet::default());
        state.on_skip();
        let set = state.on_detect([Region::new(1, 2, 3, 4)]);
        assert_eq!(set.len(), 1);
        assert!(set.iter().all(|a| a.label == Label::Unlabeled));
        assert_eq!(state.counter(), 3);
    }

    #[test]
    fn test_dedup_within_cooldown() {
        let mut dedup = AttendanceDeduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.should_dispatch("alice", t0));
        assert!(!dedup.should_dispatch("alice", t0 + Duration::from_millis(1999)));
        assert_eq!(dedup.last_dispatch("alice"), Some(t0));
    }

    #[test]
    fn test_dedup_at_and_after_cooldown() {
        let mut dedup = AttendanceDeduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.should_dispatch("alice", t0));
        assert!(dedup.should_dispatch("alice", t0 + Duration::from_secs(2)));
        assert!(!dedup.should_dispatch("alice", t0 + Duration::from_millis(2500)));
        assert!(dedup.should_dispatch("alice", t0 + Duration::from_millis(4100)));
    }

    #[test]
    fn test_dedup_names_independent() {
        let mut dedup = AttendanceDeduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.should_dispatch("alice", t0));
        assert!(dedup.should_dispatch("bob", t0));
        assert!(!dedup.should_dispatch("alice", t0));
    }

    #[test]
    fn test_locate_full_resolution_rescales() {
        let mut locator = FixedLocator::new(vec![face(Region::new(20, 80, 60, 40))], 200);
        let image = RgbImage::new(200, 100);
        let faces = locate_full_resolution(&mut locator, &image, 0.5).unwrap();
        assert_eq!(faces[0].region, Region::new(20, 80, 60, 40));
    }

    #[test]
    fn test_alice_scenario_cooldown() {
        // every frame matches; alice seen at t=0, 0.5, 2.1
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![1.0, 0.0])]);
        let t0 = Instant::now();

        let out = s.process_frame(&frame(1), t0);
        assert_eq!(out.dispatches, vec!["alice".to_string()]);

        let out = s.process_frame(&frame(2), t0 + Duration::from_millis(500));
        assert!(out.dispatches.is_empty());

        let out = s.process_frame(&frame(3), t0 + Duration::from_millis(2100));
        assert_eq!(out.dispatches, vec!["alice".to_string()]);
    }

    #[test]
    fn test_unknown_never_dispatched() {
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![0.0, 1.0])]);
        let out = s.process_frame(&frame(1), Instant::now());
        assert!(out.dispatches.is_empty());
        let overlay = out.overlay.unwrap();
        assert_eq!(overlay.iter().next().unwrap().label, Label::Unknown);
    }

    #[test]
    fn test_identity_named_unknown_is_never_dispatched() {
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = Scheduler::new(
            config,
            FixedLocator::new(vec![face(Region::new(20, 80, 60, 40))], 200),
            QueuedEncoder::new(vec![Embedding::new(vec![1.0, 0.0])]),
            CosineMatcher { threshold: 0.9 },
            vec![KnownIdentity { name: "Unknown".into(), embedding: Embedding::new(vec![1.0, 0.0]) }],
        );
        let out = s.process_frame(&frame(1), Instant::now());
        assert!(out.dispatches.is_empty());
        assert_eq!(out.overlay.unwrap().iter().next().unwrap().label, Label::Unknown);
    }

    #[test]
    fn test_match_frame_encodes_full_resolution_regions() {
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![1.0, 0.0])]);
        s.process_frame(&frame(1), Instant::now());
        assert_eq!(s.encoder.seen, vec![vec![Region::new(20, 80, 60, 40)]]);
        assert_eq!(s.persistence().counter(), 10);
    }

    #[test]
    fn test_full_cadence_cycle() {
        let config = SchedulerConfig { persistence_frames: 2, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![1.0, 0.0])]);
        let t0 = Instant::now();

        // 1, 2: skip with nothing to show
        assert!(s.process_frame(&frame(1), t0).overlay.is_none());
        assert!(s.process_frame(&frame(2), t0).overlay.is_none());

        // 3: detect-only renders unlabeled regions, no dispatch
        let out = s.process_frame(&frame(3), t0);
        assert_eq!(out.cadence, Cadence::DetectOnly);
        assert!(out.dispatches.is_empty());
        assert_eq!(out.overlay.unwrap().iter().next().unwrap().label, Label::Unlabeled);

        // 4, 5: counter never reset, so nothing persists
        assert!(s.process_frame(&frame(4), t0).overlay.is_none());
        assert!(s.process_frame(&frame(5), t0).overlay.is_none());

        // 6: match
        let out = s.process_frame(&frame(6), t0);
        assert_eq!(out.cadence, Cadence::DetectAndMatch);
        assert_eq!(out.dispatches, vec!["alice".to_string()]);
        assert_eq!(
            out.overlay.unwrap().iter().next().unwrap().label,
            Label::Known("alice".into())
        );

        // 7: persisted (counter 1), 8: expired (counter 0)
        let out = s.process_frame(&frame(7), t0);
        assert_eq!(out.overlay.map(|o| o.len()), Some(1));
        assert!(s.process_frame(&frame(8), t0).overlay.is_none());
        assert_eq!(s.locator.calls, 2);
    }

    #[test]
    fn test_detection_failure_keeps_previous_annotations() {
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![1.0, 0.0])]);
        let t0 = Instant::now();
        s.process_frame(&frame(1), t0);

        s.locator.fail = true;
        let out = s.process_frame(&frame(2), t0 + Duration::from_secs(5));
        assert!(out.dispatches.is_empty());
        assert_eq!(out.overlay.map(|o| o.len()), Some(1));
    }

    #[test]
    fn test_no_faces_clears_annotations() {
        let config = SchedulerConfig { frame_skip: 1, encoding_every: 1, ..Default::default() };
        let mut s = scheduler(config, vec![Embedding::new(vec![1.0, 0.0])]);
        s.process_frame(&frame(1), Instant::now());
        s.locator.faces.clear();
        let out = s.process_frame(&frame(2), Instant::now());
        assert!(out.overlay.unwrap().is_empty());
    }
}
