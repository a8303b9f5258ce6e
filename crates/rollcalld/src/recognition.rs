//! Live recognition loop and still-photo recognition.
//!
//! The loop ticks at a fixed interval, pulls the newest frame from a
//! [`FrameSource`] and submits it to the engine worker. While an inference is
//! in flight further ticks are skipped and counted rather than queued, and
//! each inference is bounded by the frame budget. Results go out on a watch
//! channel and, when configured, as an overlay image on disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use rollcall_core::{
    Identity, ParamsError, RecognitionParameters, RecognitionResult, RecognizedFace,
};
use rollcall_frame::{draw_overlay, frame, Frame, FrameError, FrameSource};
use rollcall_store::Store;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::{EngineHandle, FaceMatch, SessionKind, WorkerError};
use crate::settings::live_session_config;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("recognition is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("cannot decode photo: {0}")]
    Decode(#[from] FrameError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub interval: Duration,
    pub frame_budget: Duration,
    pub overlay_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct LoopStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub processed: u64,
    pub skipped: u64,
    pub timed_out: u64,
    pub failed: u64,
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything one inference needs; cloned into each in-flight task.
#[derive(Clone)]
struct Pipeline {
    engine: EngineHandle,
    store: Store,
    config: LoopConfig,
    results: Arc<watch::Sender<RecognitionResult>>,
    stats: Arc<LoopStats>,
}

#[derive(Clone)]
pub struct RecognitionService {
    pipeline: Pipeline,
    running: Arc<Mutex<Option<RunningLoop>>>,
}

impl RecognitionService {
    pub fn new(engine: EngineHandle, store: Store, config: LoopConfig) -> Self {
        let (results, _) = watch::channel(RecognitionResult::default());
        Self {
            pipeline: Pipeline {
                engine,
                store,
                config,
                results: Arc::new(results),
                stats: Arc::new(LoopStats::default()),
            },
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the live loop over `source`.
    pub async fn start(
        &self,
        source: Box<dyn FrameSource>,
        params: RecognitionParameters,
    ) -> Result<(), RecognitionError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(RecognitionError::AlreadyRunning);
        }
        params.validate()?;
        self.pipeline
            .engine
            .configure_live(live_session_config(&params))
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(run_loop(pipeline, source, params, stop_rx));
        *running = Some(RunningLoop { stop_tx, task });
        tracing::info!(interval = ?self.pipeline.config.interval, "recognition started");
        Ok(())
    }

    /// Stop the loop and wait for it to exit. Returns `false` if it was not
    /// running. Once this returns the engine runs no further detection for
    /// the loop.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        // Live requests still queued at the engine are dropped; the one it is
        // working on is awaited by the loop below.
        self.pipeline.engine.cancel_live();
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "recognition loop ended abnormally");
        }
        tracing::info!("recognition stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub fn last_result(&self) -> RecognitionResult {
        self.pipeline.results.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecognitionResult> {
        self.pipeline.results.subscribe()
    }

    pub async fn status(&self) -> LoopStatus {
        let stats = &self.pipeline.stats;
        LoopStatus {
            running: self.is_running().await,
            processed: stats.processed.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            timed_out: stats.timed_out.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Recognise the faces in one encoded photo.
    pub async fn recognize_photo(
        &self,
        photo: &[u8],
        params: &RecognitionParameters,
    ) -> Result<RecognitionResult, RecognitionError> {
        let image = frame::decode(photo)?;
        let (width, height) = params.preview_size()?;
        let (preview, sx, sy) = frame::fit_preview(&image, width, height);
        let matches = self
            .pipeline
            .engine
            .recognize(preview, SessionKind::Still, params.similarity_cutoff())
            .await?;
        let mut result = self.pipeline.resolve(matches, None).await;
        // Report boxes in the caller's photo coordinates.
        for face in &mut result.faces {
            face.detection.bbox = face.detection.bbox.scaled(sx, sy);
        }
        Ok(result)
    }
}

async fn run_loop(
    pipeline: Pipeline,
    mut source: Box<dyn FrameSource>,
    params: RecognitionParameters,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(pipeline.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        if in_flight.as_ref().is_some_and(|t| !t.is_finished()) {
            pipeline.stats.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("inference in flight, tick skipped");
            continue;
        }

        let (returned, captured) = match tokio::task::spawn_blocking(move || {
            let captured = source.capture();
            (source, captured)
        })
        .await
        {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "frame capture task failed");
                break;
            }
        };
        source = returned;
        if *stop_rx.borrow() {
            break;
        }
        let captured = match captured {
            Ok(Some(captured)) => captured,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                continue;
            }
        };

        let pipeline = pipeline.clone();
        let params = params.clone();
        in_flight = Some(tokio::spawn(async move {
            pipeline.process(captured, &params).await;
        }));
    }

    if let Some(task) = in_flight {
        let _ = task.await;
    }
    tracing::debug!("recognition loop exited");
}

impl Pipeline {
    async fn process(&self, captured: Frame, params: &RecognitionParameters) {
        let (width, height) = match params.preview_size() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "bad preview size");
                return;
            }
        };
        let (preview, _, _) = frame::fit_preview(&captured.image, width, height);

        let submitted = self.engine.recognize(
            preview.clone(),
            SessionKind::Live,
            params.similarity_cutoff(),
        );
        tokio::pin!(submitted);
        let reply = tokio::select! {
            reply = &mut submitted => reply,
            _ = tokio::time::sleep(self.config.frame_budget) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    seq = captured.sequence,
                    budget = ?self.config.frame_budget,
                    "frame over budget"
                );
                // The engine is still on this frame. Keep the slot until it
                // answers and discard the late result.
                if let Err(WorkerError::Timeout(_)) = submitted.await {
                    self.engine.cancel_live();
                }
                return;
            }
        };
        let matches = match reply {
            Ok(matches) => matches,
            Err(WorkerError::Cancelled) => return,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(seq = captured.sequence, error = %e, "frame recognition failed");
                if matches!(e, WorkerError::Timeout(_)) {
                    self.engine.cancel_live();
                }
                return;
            }
        };

        let result = self.resolve(matches, Some(captured.sequence)).await;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            seq = captured.sequence,
            faces = result.faces.len(),
            matched = result.matched().count(),
            "frame recognised"
        );

        if let Some(path) = &self.config.overlay_path {
            self.write_overlay(preview, &result, params.use_front_camera, path.clone())
                .await;
        }
        self.results.send_replace(result);
    }

    /// Attach local people to hub hits.
    async fn resolve(
        &self,
        matches: Vec<FaceMatch>,
        frame_sequence: Option<u64>,
    ) -> RecognitionResult {
        let mut faces = Vec::with_capacity(matches.len());
        for m in matches {
            let identity = match m.hit {
                Some(hit) => {
                    let person = match self.store.get_by_face_id(hit.face_id).await {
                        Ok(person) => person,
                        Err(e) => {
                            tracing::warn!(
                                face_id = hit.face_id,
                                error = %e,
                                "mapping lookup failed"
                            );
                            None
                        }
                    };
                    Some(Identity {
                        face_id: hit.face_id,
                        confidence: hit.confidence,
                        person,
                    })
                }
                None => None,
            };
            faces.push(RecognizedFace {
                detection: m.detection,
                identity,
            });
        }
        RecognitionResult {
            faces,
            frame_sequence,
        }
    }

    async fn write_overlay(
        &self,
        preview: RgbImage,
        result: &RecognitionResult,
        mirrored: bool,
        path: PathBuf,
    ) {
        let result = result.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut image = if mirrored { frame::mirror(&preview) } else { preview };
            draw_overlay(&mut image, &result, mirrored);
            image.save(&path)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "overlay write failed"),
            Err(e) => tracing::warn!(error = %e, "overlay task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::{encoded_face, face_image, spawn_fake, FakeEngine};
    use rollcall_core::Role;
    use rollcall_store::Person;

    /// Yields a fresh frame of the same face on every capture.
    struct Repeating {
        shade: u8,
        sequence: u64,
    }

    impl FrameSource for Repeating {
        fn capture(&mut self) -> Result<Option<Frame>, FrameError> {
            self.sequence += 1;
            Ok(Some(Frame::new(face_image(self.shade), self.sequence)))
        }
    }

    /// Blocks the calling thread on every capture, like a slow disk.
    struct Sluggish;

    impl FrameSource for Sluggish {
        fn capture(&mut self) -> Result<Option<Frame>, FrameError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(None)
        }
    }

    fn source(shade: u8) -> Box<dyn FrameSource> {
        Box::new(Repeating { shade, sequence: 0 })
    }

    async fn service(
        engine: &FakeEngine,
        overlay_path: Option<PathBuf>,
    ) -> (RecognitionService, EngineHandle, Store) {
        let handle = spawn_fake(engine).await;
        let store = Store::open_in_memory().await.unwrap();
        let config = LoopConfig {
            interval: Duration::from_millis(10),
            frame_budget: Duration::from_secs(2),
            overlay_path,
        };
        (RecognitionService::new(handle.clone(), store.clone(), config), handle, store)
    }

    async fn enrol(handle: &EngineHandle, store: &Store, shade: u8, name: &str) -> Person {
        let face_id = handle.register(face_image(shade)).await.unwrap();
        let person = Person {
            face_id,
            external_id: name.to_lowercase(),
            display_name: name.into(),
            role: Role::Student,
            org_id: "c1".into(),
            org_name: "North".into(),
            source_image_url: String::new(),
            photo_digest: None,
            updated_at: String::new(),
        };
        store.record_mapping(person.clone()).await.unwrap();
        person
    }

    #[tokio::test]
    async fn test_no_detection_after_stop_returns() {
        let engine = FakeEngine::new();
        let (svc, _handle, _store) = service(&engine, None).await;

        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(svc.stop().await);

        let calls = engine.detect_calls();
        assert!(calls > 0, "loop never ran");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.detect_calls(), calls);
        assert!(!svc.is_running().await);
        assert!(!svc.stop().await);
    }

    #[tokio::test]
    async fn test_slow_engine_gets_no_detection_after_stop() {
        let engine = FakeEngine::new();
        engine.state.lock().unwrap().detect_delay = Some(Duration::from_millis(150));
        let handle = spawn_fake(&engine).await;
        let store = Store::open_in_memory().await.unwrap();
        let config = LoopConfig {
            interval: Duration::from_millis(10),
            frame_budget: Duration::from_millis(30),
            overlay_path: None,
        };
        let svc = RecognitionService::new(handle, store, config);

        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(svc.stop().await);

        let calls = engine.detect_calls();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(engine.detect_calls(), calls);

        let status = svc.status().await;
        assert!(status.timed_out > 0, "{status:?}");
        assert!(status.skipped > 0, "{status:?}");
        // One frame at a time: the budget does not release the engine early.
        assert!(calls <= 3, "{calls} detections in 300ms");
    }

    #[tokio::test]
    async fn test_slow_capture_leaves_runtime_responsive() {
        let engine = FakeEngine::new();
        let (svc, _handle, _store) = service(&engine, None).await;

        svc.start(Box::new(Sluggish), RecognitionParameters::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "runtime stalled for {:?}",
            started.elapsed()
        );
        assert!(svc.stop().await);
    }

    #[tokio::test]
    async fn test_loop_publishes_identities() {
        let engine = FakeEngine::new();
        let (svc, handle, store) = service(&engine, None).await;
        let ann = enrol(&handle, &store, 40, "Ann").await;

        let mut results = svc.subscribe();
        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), results.changed())
            .await
            .unwrap()
            .unwrap();
        svc.stop().await;

        let result = svc.last_result();
        let identity = result.matched().next().expect("Ann is recognised");
        assert_eq!(identity.face_id, ann.face_id);
        assert_eq!(identity.display_name(), "Ann");
        assert!(result.frame_sequence.is_some());
        assert!(svc.status().await.processed >= 1);
    }

    #[tokio::test]
    async fn test_busy_engine_skips_ticks() {
        let engine = FakeEngine::new();
        engine.state.lock().unwrap().detect_delay = Some(Duration::from_millis(60));
        let (svc, _handle, _store) = service(&engine, None).await;

        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        svc.stop().await;

        let status = svc.status().await;
        assert!(status.skipped > 0, "{status:?}");
        assert!(engine.detect_calls() < 10);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let engine = FakeEngine::new();
        let (svc, _handle, _store) = service(&engine, None).await;
        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        assert!(matches!(
            svc.start(source(40), RecognitionParameters::default()).await,
            Err(RecognitionError::AlreadyRunning)
        ));
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_overlay_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.png");
        let engine = FakeEngine::new();
        let (svc, _handle, _store) = service(&engine, Some(path.clone())).await;

        let mut results = svc.subscribe();
        svc.start(source(40), RecognitionParameters::default()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), results.changed())
            .await
            .unwrap()
            .unwrap();
        svc.stop().await;

        let overlay = image::open(&path).unwrap().to_rgb8();
        assert_eq!(overlay.dimensions(), (16, 16));
        // Unknown face: red frame at the box corner.
        assert_eq!(overlay.get_pixel(14, 1).0, [229, 57, 53]);
    }

    #[tokio::test]
    async fn test_recognize_photo() {
        let engine = FakeEngine::new();
        let (svc, handle, store) = service(&engine, None).await;
        enrol(&handle, &store, 80, "Bob").await;

        let params = RecognitionParameters::default();
        let known = svc.recognize_photo(&encoded_face(80), &params).await.unwrap();
        assert_eq!(known.matched().next().map(|i| i.display_name()), Some("Bob"));

        let nobody = svc.recognize_photo(&encoded_face(0), &params).await.unwrap();
        assert!(nobody.faces.is_empty());

        assert!(matches!(
            svc.recognize_photo(b"junk", &params).await,
            Err(RecognitionError::Decode(_))
        ));
    }
}
