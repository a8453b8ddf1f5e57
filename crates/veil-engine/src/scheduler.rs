//! Viewport-prioritised triage of discovered images.
//!
//! Images are enqueued as the renderer discovers them, never blocking the
//! caller. Admission is bounded by the configured concurrency limit and always
//! takes the highest-priority queued item, ties going to the earlier
//! discovery. Every result is tagged with the source version it was computed
//! for; a result whose version no longer matches its slot is dropped.
//!
//! All queue state lives behind one mutex that is never held across an await
//! or while calling the verdict sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use veil_core::Verdict;

use crate::engine::Engine;
use crate::pipeline::{DetectAndMatch, ErrorKind, ImageJob, PipelineError, Stage, StageObserver};
use crate::priority::{priority_score, IntrinsicSize, Rect, Viewport};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler requires a Tokio runtime")]
    NoRuntime,
}

/// An image slot in the document and the source currently bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageRef {
    pub slot: String,
    pub src: String,
    /// Content digest, when the caller can compute one. A changed digest
    /// under the same `src` is a new source version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn new(slot: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            src: src.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    fn same_source(&self, other: &ImageRef) -> bool {
        self.src == other.src && self.digest == other.digest
    }
}

/// Lifecycle of one work item. Transitions only move forward.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkState {
    Queued,
    Preprocessing,
    Detecting,
    Matching,
    Done(Verdict),
    Failed(ErrorKind),
}

impl WorkState {
    fn rank(&self) -> u8 {
        match self {
            WorkState::Queued => 0,
            WorkState::Preprocessing => 1,
            WorkState::Detecting => 2,
            WorkState::Matching => 3,
            WorkState::Done(_) | WorkState::Failed(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }
}

impl From<Stage> for WorkState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Preprocessing => WorkState::Preprocessing,
            Stage::Detecting => WorkState::Detecting,
            Stage::Matching => WorkState::Matching,
        }
    }
}

/// What `enqueue_image` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// First sighting of this slot.
    New,
    /// The slot's source changed; the old result, if any, is superseded.
    Requeued,
    /// Same source as before; nothing to do.
    Duplicate,
}

/// Renderer collaborator: receives the outcome for every image.
pub trait VerdictSink: Send + Sync {
    fn on_verdict(&self, image: &ImageRef, verdict: &Verdict);
    fn on_error(&self, image: &ImageRef, kind: ErrorKind);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Verdict { image: ImageRef, verdict: Verdict },
    Error { image: ImageRef, kind: ErrorKind },
}

/// Forwards every outcome into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl VerdictSink for ChannelSink {
    fn on_verdict(&self, image: &ImageRef, verdict: &Verdict) {
        let _ = self.tx.send(ScanEvent::Verdict {
            image: image.clone(),
            verdict: verdict.clone(),
        });
    }

    fn on_error(&self, image: &ImageRef, kind: ErrorKind) {
        let _ = self.tx.send(ScanEvent::Error {
            image: image.clone(),
            kind,
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

struct WorkItem {
    image: ImageRef,
    version: u64,
    rect: Rect,
    intrinsic: IntrinsicSize,
    priority: f64,
    seq: u64,
    enqueued_at: Instant,
    state: WorkState,
}

impl WorkItem {
    fn advance(&mut self, next: WorkState) -> bool {
        if next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }
}

struct Queue {
    items: HashMap<String, WorkItem>,
    /// Slots waiting for admission. Sorted so the next one to admit is last.
    pending: Vec<String>,
    dirty: bool,
    in_flight: usize,
    viewport: Viewport,
    next_seq: u64,
    next_version: u64,
}

impl Queue {
    fn new(viewport: Viewport) -> Self {
        Self {
            items: HashMap::new(),
            pending: Vec::new(),
            dirty: false,
            in_flight: 0,
            viewport,
            next_seq: 0,
            next_version: 0,
        }
    }

    fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight
    }

    fn resort(&mut self) {
        let Queue {
            items,
            pending,
            viewport,
            ..
        } = self;
        for slot in pending.iter() {
            if let Some(item) = items.get_mut(slot) {
                item.priority = priority_score(&item.rect, &item.intrinsic, viewport);
            }
        }
        // Ascending, so the highest priority (earliest on ties) pops first.
        pending.sort_by(|a, b| {
            let (a, b) = (&items[a], &items[b]);
            a.priority.total_cmp(&b.priority).then(b.seq.cmp(&a.seq))
        });
        self.dirty = false;
    }

    fn admit(&mut self) -> Option<ImageJob> {
        if self.dirty {
            self.resort();
        }
        while let Some(slot) = self.pending.pop() {
            let Some(item) = self.items.get(&slot) else {
                continue;
            };
            self.in_flight += 1;
            tracing::debug!(
                slot = %slot,
                priority = item.priority,
                waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
                "admitted"
            );
            return Some(ImageJob {
                slot,
                src: item.image.src.clone(),
                version: item.version,
            });
        }
        None
    }
}

enum Outcome {
    Verdict(ImageRef, Verdict),
    Error(ImageRef, ErrorKind),
}

struct Shared {
    queue: Mutex<Queue>,
    engine: Engine,
    pipeline: Arc<dyn DetectAndMatch>,
    sink: Arc<dyn VerdictSink>,
    runtime: Handle,
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, queue: &Queue) {
        self.outstanding.send_replace(queue.outstanding());
    }

    /// Admit queued items until the concurrency limit is reached.
    fn pump(self: &Arc<Self>) {
        let limit = self.engine.snapshot().config.concurrency_limit.max(1);
        loop {
            let job = {
                let mut queue = self.lock();
                if queue.in_flight >= limit {
                    return;
                }
                match queue.admit() {
                    Some(job) => job,
                    None => return,
                }
            };
            let shared = Arc::clone(self);
            self.runtime.spawn(async move {
                let tracker = StageTracker {
                    shared: &shared,
                    slot: &job.slot,
                    version: job.version,
                };
                let result = shared.pipeline.detect_and_match(&job, &tracker).await;
                shared.finish(&job, result);
                shared.pump();
            });
        }
    }

    /// Record the result, deliver it, and only then release the in-flight
    /// slot, so an idle scheduler has no undelivered outcomes.
    fn finish(&self, job: &ImageJob, result: Result<Verdict, PipelineError>) {
        let outcome = {
            let mut queue = self.lock();
            match queue.items.get_mut(&job.slot) {
                Some(item) if item.version == job.version => match result {
                    Ok(verdict) => {
                        item.advance(WorkState::Done(verdict.clone()));
                        Some(Outcome::Verdict(item.image.clone(), verdict))
                    }
                    Err(err) => {
                        let kind = err.kind();
                        tracing::warn!(slot = %job.slot, src = %job.src, error = %err, "image failed");
                        item.advance(WorkState::Failed(kind));
                        Some(Outcome::Error(item.image.clone(), kind))
                    }
                },
                _ => {
                    tracing::debug!(slot = %job.slot, version = job.version, "stale result discarded");
                    None
                }
            }
        };

        match outcome {
            Some(Outcome::Verdict(image, verdict)) => self.sink.on_verdict(&image, &verdict),
            Some(Outcome::Error(image, kind)) => {
                // A failure never blocks: report it, then let the image through.
                self.sink.on_error(&image, kind);
                self.sink.on_verdict(&image, &Verdict::allow());
            }
            None => {}
        }

        let mut queue = self.lock();
        queue.in_flight = queue.in_flight.saturating_sub(1);
        self.publish(&queue);
    }
}

struct StageTracker<'a> {
    shared: &'a Shared,
    slot: &'a str,
    version: u64,
}

impl StageObserver for StageTracker<'_> {
    fn enter(&self, stage: Stage) {
        let mut queue = self.shared.lock();
        if let Some(item) = queue.items.get_mut(self.slot) {
            if item.version == self.version {
                item.advance(stage.into());
            }
        }
    }
}

/// Cheap to clone; clones drive the same queue.
#[derive(Clone)]
pub struct TriageScheduler {
    shared: Arc<Shared>,
}

impl TriageScheduler {
    /// Must be called from within a Tokio runtime; admitted work is spawned
    /// onto it.
    pub fn new(
        engine: Engine,
        pipeline: Arc<dyn DetectAndMatch>,
        sink: Arc<dyn VerdictSink>,
        viewport: Viewport,
    ) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let (outstanding, _rx) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::new(viewport)),
                engine,
                pipeline,
                sink,
                runtime,
                outstanding,
            }),
        })
    }

    /// Register an image for triage. Returns immediately; the verdict arrives
    /// through the sink.
    pub fn enqueue_image(&self, image: ImageRef, rect: Rect, intrinsic: IntrinsicSize) -> Enqueued {
        let outcome = {
            let mut guard = self.shared.lock();
            let queue = &mut *guard;
            let priority = priority_score(&rect, &intrinsic, &queue.viewport);
            let seq = queue.next_seq;
            queue.next_seq += 1;

            let outcome = match queue.items.get_mut(&image.slot) {
                Some(item) if item.image.same_source(&image) => Enqueued::Duplicate,
                Some(item) => {
                    queue.next_version += 1;
                    // Admitted items are off `pending` but still `Queued`
                    // until their first stage runs.
                    let waiting = queue.pending.contains(&image.slot);
                    tracing::debug!(slot = %image.slot, src = %image.src, "source changed; requeueing");
                    *item = WorkItem {
                        image,
                        version: queue.next_version,
                        rect,
                        intrinsic,
                        priority,
                        seq,
                        enqueued_at: Instant::now(),
                        state: WorkState::Queued,
                    };
                    if !waiting {
                        queue.pending.push(item.image.slot.clone());
                    }
                    Enqueued::Requeued
                }
                None => {
                    queue.next_version += 1;
                    let slot = image.slot.clone();
                    queue.items.insert(
                        slot.clone(),
                        WorkItem {
                            image,
                            version: queue.next_version,
                            rect,
                            intrinsic,
                            priority,
                            seq,
                            enqueued_at: Instant::now(),
                            state: WorkState::Queued,
                        },
                    );
                    queue.pending.push(slot);
                    Enqueued::New
                }
            };
            if outcome != Enqueued::Duplicate {
                queue.dirty = true;
            }
            self.shared.publish(queue);
            outcome
        };

        if outcome != Enqueued::Duplicate {
            self.shared.pump();
        }
        outcome
    }

    /// New scroll position or viewport size. Queued items are re-scored before
    /// the next admission.
    pub fn update_viewport(&self, viewport: Viewport) {
        let mut queue = self.shared.lock();
        queue.viewport = viewport;
        queue.dirty = true;
    }

    /// The slot moved in the layout.
    pub fn update_geometry(&self, slot: &str, rect: Rect) -> bool {
        let mut queue = self.shared.lock();
        let Some(item) = queue.items.get_mut(slot) else {
            return false;
        };
        item.rect = rect;
        queue.dirty = true;
        true
    }

    /// Forget a slot. Any in-flight result for it is discarded on arrival.
    pub fn remove_image(&self, slot: &str) -> bool {
        let mut queue = self.shared.lock();
        let removed = queue.items.remove(slot).is_some();
        if removed {
            queue.pending.retain(|s| s != slot);
            self.shared.publish(&queue);
        }
        removed
    }

    pub fn state_of(&self, slot: &str) -> Option<WorkState> {
        self.shared.lock().items.get(slot).map(|item| item.state.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        let queue = self.shared.lock();
        let mut stats = SchedulerStats {
            queued: queue.pending.len(),
            in_flight: queue.in_flight,
            ..SchedulerStats::default()
        };
        for item in queue.items.values() {
            match item.state {
                WorkState::Done(_) => stats.done += 1,
                WorkState::Failed(_) => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    /// Resolves once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::{LoadError, PipelineError};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    /// Records admission order; each job waits for a semaphore permit.
    struct GatedPipeline {
        gate: Semaphore,
        started: std::sync::Mutex<Vec<String>>,
    }

    impl GatedPipeline {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                started: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DetectAndMatch for GatedPipeline {
        async fn detect_and_match(&self, job: &ImageJob, stages: &dyn StageObserver) -> Result<Verdict, PipelineError> {
            self.started.lock().unwrap().push(job.slot.clone());
            stages.enter(Stage::Preprocessing);
            self.gate.acquire().await.unwrap().forget();
            if job.src.starts_with("broken") {
                return Err(PipelineError::Load {
                    src: job.src.clone(),
                    source: LoadError::NotFound(job.src.clone()),
                });
            }
            stages.enter(Stage::Detecting);
            stages.enter(Stage::Matching);
            Ok(Verdict {
                blocked: job.src.starts_with("blocked"),
                faces_detected: 1,
                matches: Vec::new(),
            })
        }
    }

    fn engine(limit: usize) -> Engine {
        let config = Config {
            concurrency_limit: limit,
            ..Config::default()
        };
        Engine::new(config, Vec::new()).unwrap()
    }

    fn scheduler(limit: usize, pipeline: Arc<GatedPipeline>) -> (TriageScheduler, mpsc::UnboundedReceiver<ScanEvent>) {
        let (sink, rx) = ChannelSink::new();
        let scheduler = TriageScheduler::new(engine(limit), pipeline, Arc::new(sink), Viewport::new(1280.0, 720.0)).unwrap();
        (scheduler, rx)
    }

    fn visible() -> (Rect, IntrinsicSize) {
        (Rect::new(100.0, 100.0, 200.0, 200.0), IntrinsicSize::new(200, 200))
    }

    fn offscreen_tiny() -> (Rect, IntrinsicSize) {
        (Rect::new(0.0, 5_000.0, 20.0, 20.0), IntrinsicSize::new(20, 20))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_visible_image_admitted_before_offscreen() {
        let pipeline = GatedPipeline::new();
        let (scheduler, _rx) = scheduler(1, pipeline.clone());

        let (r, s) = visible();
        scheduler.enqueue_image(ImageRef::new("blocker", "a.png"), r, s);
        let (r, s) = offscreen_tiny();
        scheduler.enqueue_image(ImageRef::new("tiny", "b.png"), r, s);
        let (r, s) = visible();
        scheduler.enqueue_image(ImageRef::new("large", "c.png"), r, s);
        assert_eq!(scheduler.stats().in_flight, 1);

        pipeline.gate.add_permits(3);
        scheduler.wait_idle().await;
        assert_eq!(pipeline.started(), ["blocker", "large", "tiny"]);
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let pipeline = GatedPipeline::new();
        let (scheduler, _rx) = scheduler(1, pipeline.clone());
        let (r, s) = offscreen_tiny();
        for slot in ["first", "second", "third"] {
            scheduler.enqueue_image(ImageRef::new(slot, format!("{slot}.png")), r, s);
        }
        pipeline.gate.add_permits(3);
        scheduler.wait_idle().await;
        assert_eq!(pipeline.started(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_scroll_reorders_queue() {
        let pipeline = GatedPipeline::new();
        let (scheduler, _rx) = scheduler(1, pipeline.clone());

        let (r, s) = visible();
        scheduler.enqueue_image(ImageRef::new("blocker", "a.png"), r, s);
        scheduler.enqueue_image(ImageRef::new("top", "top.png"), Rect::new(0.0, 400.0, 300.0, 300.0), s);
        scheduler.enqueue_image(ImageRef::new("bottom", "bottom.png"), Rect::new(0.0, 6_000.0, 300.0, 300.0), s);

        scheduler.update_viewport(Viewport::new(1280.0, 720.0).scrolled_to(0.0, 5_800.0));
        pipeline.gate.add_permits(3);
        scheduler.wait_idle().await;
        assert_eq!(pipeline.started(), ["blocker", "bottom", "top"]);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let pipeline = GatedPipeline::new();
        let (scheduler, _rx) = scheduler(2, pipeline.clone());
        let (r, s) = visible();
        for i in 0..5 {
            scheduler.enqueue_image(ImageRef::new(format!("s{i}"), format!("{i}.png")), r, s);
        }
        let stats = scheduler.stats();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.queued, 3);

        pipeline.gate.add_permits(5);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.stats().done, 5);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_processed_once() {
        let pipeline = GatedPipeline::new();
        let (scheduler, mut rx) = scheduler(4, pipeline.clone());
        let (r, s) = visible();

        assert_eq!(scheduler.enqueue_image(ImageRef::new("x", "a.png"), r, s), Enqueued::New);
        assert_eq!(scheduler.enqueue_image(ImageRef::new("x", "a.png"), r, s), Enqueued::Duplicate);
        pipeline.gate.add_permits(4);
        scheduler.wait_idle().await;

        assert_eq!(scheduler.enqueue_image(ImageRef::new("x", "a.png"), r, s), Enqueued::Duplicate);
        scheduler.wait_idle().await;

        assert_eq!(pipeline.started(), ["x"]);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(matches!(scheduler.state_of("x"), Some(WorkState::Done(_))));
    }

    #[tokio::test]
    async fn test_stale_result_discarded_after_source_change() {
        let pipeline = GatedPipeline::new();
        let (scheduler, mut rx) = scheduler(4, pipeline.clone());
        let (r, s) = visible();

        scheduler.enqueue_image(ImageRef::new("x", "blocked-old.png"), r, s);
        assert_eq!(
            scheduler.enqueue_image(ImageRef::new("x", "new.png"), r, s),
            Enqueued::Requeued
        );
        pipeline.gate.add_permits(2);
        scheduler.wait_idle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Verdict { image, verdict } => {
                assert_eq!(image.src, "new.png");
                assert!(!verdict.blocked);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_source_swap_before_first_stage_gets_verdict() {
        use crate::pipeline::{FsImageLoader, Pipeline};
        use crate::registry::BackendRegistry;
        use veil_core::DetectorMode;

        // Detection off: the pipeline returns without reporting any stage.
        let config = Config {
            detector_mode: DetectorMode::Off,
            ..Config::default()
        };
        let engine = Engine::new(config, Vec::new()).unwrap();
        let pipeline = Arc::new(Pipeline::new(engine.clone(), BackendRegistry::new(), Arc::new(FsImageLoader)));
        let (sink, mut rx) = ChannelSink::new();
        let scheduler = TriageScheduler::new(engine, pipeline, Arc::new(sink), Viewport::default()).unwrap();
        let (r, s) = visible();

        scheduler.enqueue_image(ImageRef::new("x", "old.png"), r, s);
        assert_eq!(scheduler.stats().in_flight, 1);
        assert_eq!(scheduler.state_of("x"), Some(WorkState::Queued));
        assert_eq!(
            scheduler.enqueue_image(ImageRef::new("x", "new.png"), r, s),
            Enqueued::Requeued
        );
        scheduler.wait_idle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ScanEvent::Verdict { image, .. } if image.src == "new.png"));
        assert_eq!(scheduler.state_of("x"), Some(WorkState::Done(Verdict::allow())));
    }

    #[tokio::test]
    async fn test_changed_digest_requeues() {
        let pipeline = GatedPipeline::new();
        let (scheduler, _rx) = scheduler(4, pipeline.clone());
        let (r, s) = visible();
        pipeline.gate.add_permits(2);

        scheduler.enqueue_image(ImageRef::new("x", "a.png").with_digest("aa"), r, s);
        scheduler.wait_idle().await;
        let outcome = scheduler.enqueue_image(ImageRef::new("x", "a.png").with_digest("bb"), r, s);
        assert_eq!(outcome, Enqueued::Requeued);
        scheduler.wait_idle().await;
        assert_eq!(pipeline.started().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_reports_error_then_allows() {
        let pipeline = GatedPipeline::new();
        let (scheduler, mut rx) = scheduler(1, pipeline.clone());
        let (r, s) = visible();

        scheduler.enqueue_image(ImageRef::new("bad", "broken.png"), r, s);
        scheduler.enqueue_image(ImageRef::new("good", "blocked.png"), r, s);
        pipeline.gate.add_permits(2);
        scheduler.wait_idle().await;

        assert_eq!(
            scheduler.state_of("bad"),
            Some(WorkState::Failed(ErrorKind::ImageDecodeFailure))
        );
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ScanEvent::Error { kind: ErrorKind::ImageDecodeFailure, .. }));
        assert!(matches!(&events[1], ScanEvent::Verdict { verdict, .. } if !verdict.blocked));
        assert!(matches!(&events[2], ScanEvent::Verdict { verdict, .. } if verdict.blocked));
    }

    #[tokio::test]
    async fn test_removed_slot_result_dropped() {
        let pipeline = GatedPipeline::new();
        let (scheduler, mut rx) = scheduler(2, pipeline.clone());
        let (r, s) = visible();

        scheduler.enqueue_image(ImageRef::new("gone", "a.png"), r, s);
        assert!(scheduler.remove_image("gone"));
        assert_eq!(scheduler.state_of("gone"), None);
        pipeline.gate.add_permits(1);
        scheduler.wait_idle().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_states_only_move_forward() {
        let mut item = WorkItem {
            image: ImageRef::new("s", "a.png"),
            version: 1,
            rect: Rect::default(),
            intrinsic: IntrinsicSize::default(),
            priority: 0.0,
            seq: 0,
            enqueued_at: Instant::now(),
            state: WorkState::Queued,
        };
        assert!(item.advance(WorkState::Detecting));
        assert!(!item.advance(WorkState::Preprocessing));
        assert!(item.advance(WorkState::Done(Verdict::allow())));
        assert!(!item.advance(WorkState::Failed(ErrorKind::DetectionFailed)));
        assert!(item.state.is_terminal());
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let (sink, _rx) = ChannelSink::new();
        let result = TriageScheduler::new(engine(1), GatedPipeline::new(), Arc::new(sink), Viewport::default());
        assert!(matches!(result, Err(SchedulerError::NoRuntime)));
    }

    #[test]
    fn test_scan_event_json() {
        let event = ScanEvent::Error {
            image: ImageRef::new("s", "a.png"),
            kind: ErrorKind::BackendUnavailable,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "BackendUnavailable");
        assert_eq!(json["image"]["slot"], "s");
    }
}
