use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use rollcall_core::{
    EngineError, FaceDetection, FaceEngine, FaceId, FaceSession, FeatureHub, FeatureVector,
    HubOutcome, SearchHit, SessionConfig,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("feature hub: {0}")]
    Hub(String),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("live request cancelled")]
    Cancelled,
}

/// Which of the worker's sessions serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Independent images: registration photos, still-photo recognition.
    Still,
    /// Consecutive frames of the live loop, with tracking.
    Live,
}

/// One detected face and its hub match, if any cleared the cutoff.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub detection: FaceDetection,
    pub hit: Option<SearchHit>,
}

/// Messages sent from the flows to the engine thread.
enum WorkerRequest {
    Register {
        image: RgbImage,
        reply: oneshot::Sender<Result<FaceId, WorkerError>>,
    },
    Refresh {
        face_id: FaceId,
        image: RgbImage,
        reply: oneshot::Sender<Result<HubOutcome<()>, WorkerError>>,
    },
    Recognize {
        image: RgbImage,
        kind: SessionKind,
        cutoff: f32,
        /// Live epoch at submission; stale live requests are dropped unseen.
        epoch: Option<u64>,
        reply: oneshot::Sender<Result<Vec<FaceMatch>, WorkerError>>,
    },
    Remove {
        face_id: FaceId,
        reply: oneshot::Sender<HubOutcome<()>>,
    },
    ConfigureLive {
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), WorkerError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// The engine's sessions are disposed once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<WorkerRequest>,
    reply_timeout: Duration,
    live_epoch: Arc<AtomicU64>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
        timeout: Duration,
    ) -> Result<T, WorkerError> {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        match tokio::time::timeout(timeout, &mut reply_rx).await {
            Ok(reply) => reply.map_err(|_| WorkerError::ChannelClosed),
            Err(_) => {
                // Closing first means the worker either sees the request
                // abandoned or has already delivered; never both.
                reply_rx.close();
                reply_rx.try_recv().map_err(|_| WorkerError::Timeout(timeout))
            }
        }
    }

    /// Detect the largest face, extract its feature and insert it into the hub.
    ///
    /// If the caller gives up waiting, the worker withdraws the inserted face.
    pub async fn register(&self, image: RgbImage) -> Result<FaceId, WorkerError> {
        self.request(|reply| WorkerRequest::Register { image, reply }, self.reply_timeout)
            .await?
    }

    /// Replace the feature stored under `face_id` with the largest face of
    /// `image`. `NotFound` means the hub no longer has that face.
    pub async fn refresh(
        &self,
        face_id: FaceId,
        image: RgbImage,
    ) -> Result<HubOutcome<()>, WorkerError> {
        self.request(
            |reply| WorkerRequest::Refresh {
                face_id,
                image,
                reply,
            },
            self.reply_timeout,
        )
        .await?
    }

    /// Detect every face and search the hub for each.
    ///
    /// `cutoff` is the minimum engine confidence, in [0, 1], for a hit to count.
    pub async fn recognize(
        &self,
        image: RgbImage,
        kind: SessionKind,
        cutoff: f32,
    ) -> Result<Vec<FaceMatch>, WorkerError> {
        let epoch = match kind {
            SessionKind::Live => Some(self.live_epoch.load(Ordering::SeqCst)),
            SessionKind::Still => None,
        };
        self.request(
            |reply| WorkerRequest::Recognize {
                image,
                kind,
                cutoff,
                epoch,
                reply,
            },
            self.reply_timeout,
        )
        .await?
    }

    pub async fn remove(&self, face_id: FaceId) -> Result<HubOutcome<()>, WorkerError> {
        self.request(|reply| WorkerRequest::Remove { face_id, reply }, self.reply_timeout)
            .await
    }

    /// Drop every live request submitted so far that the worker has not
    /// started yet. They are answered with [`WorkerError::Cancelled`].
    pub fn cancel_live(&self) {
        self.live_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Recreate the live session with new options.
    pub async fn configure_live(&self, config: SessionConfig) -> Result<(), WorkerError> {
        self.request(
            |reply| WorkerRequest::ConfigureLive { config, reply },
            self.reply_timeout,
        )
        .await?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Sessions and the hub are created on that thread and never leave it.
/// Fails if any of them cannot be created.
pub async fn spawn_worker(
    engine: Box<dyn FaceEngine>,
    live_config: SessionConfig,
    reply_timeout: Duration,
) -> Result<EngineHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), WorkerError>>();
    let live_epoch = Arc::new(AtomicU64::new(0));
    let worker_epoch = live_epoch.clone();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut worker = match Worker::open(engine, live_config, worker_epoch) {
                Ok(w) => {
                    let _ = ready_tx.send(Ok(()));
                    w
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            worker.close();
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Transport(format!("failed to spawn engine thread: {e}")))?;

    ready_rx.await.map_err(|_| WorkerError::ChannelClosed)??;
    Ok(EngineHandle {
        tx,
        reply_timeout,
        live_epoch,
    })
}

struct Worker {
    engine: Box<dyn FaceEngine>,
    still: Box<dyn FaceSession>,
    live: Option<Box<dyn FaceSession>>,
    hub: Box<dyn FeatureHub>,
    live_epoch: Arc<AtomicU64>,
}

impl Worker {
    fn open(
        engine: Box<dyn FaceEngine>,
        live_config: SessionConfig,
        live_epoch: Arc<AtomicU64>,
    ) -> Result<Self, WorkerError> {
        let still = engine.create_session(&SessionConfig {
            tracking: false,
            max_faces: 1,
            ..SessionConfig::default()
        })?;
        let live = match engine.create_session(&live_config) {
            Ok(live) => live,
            Err(e) => {
                still.dispose();
                return Err(e.into());
            }
        };
        let hub = match engine.open_hub() {
            Ok(hub) => hub,
            Err(e) => {
                still.dispose();
                live.dispose();
                return Err(e.into());
            }
        };
        tracing::info!(?live_config, "engine sessions ready");
        Ok(Self {
            engine,
            still,
            live: Some(live),
            hub,
            live_epoch,
        })
    }

    fn handle(&mut self, req: WorkerRequest) {
        match req {
            WorkerRequest::Register { image, reply } => {
                if reply.is_closed() {
                    tracing::debug!("register abandoned before it started");
                    return;
                }
                if let Err(Ok(face_id)) = reply.send(self.register(&image)) {
                    tracing::warn!(face_id, "register abandoned by caller; withdrawing face");
                    if let HubOutcome::Failed(reason) = self.hub.remove(face_id) {
                        tracing::warn!(face_id, %reason, "orphaned hub face");
                    }
                }
            }
            WorkerRequest::Refresh {
                face_id,
                image,
                reply,
            } => {
                let _ = reply.send(self.refresh(face_id, &image));
            }
            WorkerRequest::Recognize {
                image,
                kind,
                cutoff,
                epoch,
                reply,
            } => {
                if epoch.is_some_and(|e| e != self.live_epoch.load(Ordering::SeqCst)) {
                    tracing::trace!("stale live request dropped");
                    let _ = reply.send(Err(WorkerError::Cancelled));
                    return;
                }
                let _ = reply.send(self.recognize(&image, kind, cutoff));
            }
            WorkerRequest::Remove { face_id, reply } => {
                let outcome = self.hub.remove(face_id);
                tracing::debug!(face_id, ?outcome, "hub remove");
                let _ = reply.send(outcome);
            }
            WorkerRequest::ConfigureLive { config, reply } => {
                let _ = reply.send(self.configure_live(config));
            }
        }
    }

    /// Feature of the largest face, from the still session.
    fn largest_feature(&mut self, image: &RgbImage) -> Result<FeatureVector, WorkerError> {
        let faces = self.still.detect_faces(image)?;
        let face = FaceDetection::largest(&faces).ok_or(WorkerError::NoFaceDetected)?;
        Ok(self.still.extract_feature(image, &face.token)?)
    }

    fn register(&mut self, image: &RgbImage) -> Result<FaceId, WorkerError> {
        let feature = self.largest_feature(image)?;
        match self.hub.insert(&feature) {
            HubOutcome::Ok(face_id) => {
                tracing::debug!(face_id, "feature inserted");
                Ok(face_id)
            }
            HubOutcome::NotFound => Err(WorkerError::Hub("insert reported not found".into())),
            HubOutcome::Failed(reason) => Err(WorkerError::Hub(reason)),
        }
    }

    fn refresh(
        &mut self,
        face_id: FaceId,
        image: &RgbImage,
    ) -> Result<HubOutcome<()>, WorkerError> {
        let feature = self.largest_feature(image)?;
        let outcome = self.hub.update(face_id, &feature);
        tracing::debug!(face_id, ?outcome, "hub update");
        Ok(outcome)
    }

    fn recognize(
        &mut self,
        image: &RgbImage,
        kind: SessionKind,
        cutoff: f32,
    ) -> Result<Vec<FaceMatch>, WorkerError> {
        let session = match kind {
            SessionKind::Still => &mut self.still,
            SessionKind::Live => self
                .live
                .as_mut()
                .ok_or_else(|| EngineError::SessionCreate("live session unavailable".into()))?,
        };

        let faces = session.detect_faces(image)?;
        let mut matches = Vec::with_capacity(faces.len());
        for detection in faces {
            let hit = match session.extract_feature(image, &detection.token) {
                Ok(feature) => match self.hub.search(&feature) {
                    HubOutcome::Ok(hit) if hit.confidence >= cutoff => Some(hit),
                    HubOutcome::Ok(_) | HubOutcome::NotFound => None,
                    HubOutcome::Failed(reason) => {
                        tracing::warn!(track = detection.track_id, %reason, "hub search failed");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        track = detection.track_id,
                        error = %e,
                        "feature extraction failed"
                    );
                    None
                }
            };
            matches.push(FaceMatch { detection, hit });
        }
        Ok(matches)
    }

    fn configure_live(&mut self, config: SessionConfig) -> Result<(), WorkerError> {
        if let Some(old) = self.live.take() {
            old.dispose();
        }
        self.live = Some(self.engine.create_session(&config)?);
        tracing::info!(?config, "live session reconfigured");
        Ok(())
    }

    fn close(self) {
        self.still.dispose();
        if let Some(live) = self.live {
            live.dispose();
        }
    }
}

/// In-memory engine used by the daemon's tests.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use rollcall_core::{BoundingBox, FaceToken};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Arc, Mutex};

    /// Shared view of what the fake engine has seen and holds.
    #[derive(Default)]
    pub(crate) struct FakeState {
        pub detect_calls: usize,
        pub sessions_created: usize,
        pub sessions_disposed: usize,
        pub hub: BTreeMap<FaceId, Vec<f32>>,
        pub next_id: FaceId,
        /// Faces whose removal and update fail.
        pub locked_faces: HashSet<FaceId>,
        pub detect_delay: Option<Duration>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeEngine {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            let engine = Self::default();
            engine.state.lock().unwrap().next_id = 1;
            engine
        }

        pub fn hub_ids(&self) -> Vec<FaceId> {
            self.state.lock().unwrap().hub.keys().copied().collect()
        }

        pub fn detect_calls(&self) -> usize {
            self.state.lock().unwrap().detect_calls
        }
    }

    /// A photo of "someone": the fake identifies people by the image's
    /// first pixel. All-black images contain no face.
    pub(crate) fn face_image(shade: u8) -> RgbImage {
        RgbImage::from_pixel(16, 16, image::Rgb([shade, shade, shade]))
    }

    pub(crate) fn encoded_face(shade: u8) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        face_image(shade)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn signature(image: &RgbImage) -> f32 {
        image.get_pixel(0, 0).0[0] as f32
    }

    struct FakeSession {
        state: Arc<Mutex<FakeState>>,
    }

    impl FaceSession for FakeSession {
        fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
            let delay = {
                let mut s = self.state.lock().unwrap();
                s.detect_calls += 1;
                s.detect_delay
            };
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if signature(image) == 0.0 {
                return Ok(Vec::new());
            }
            Ok(vec![FaceDetection {
                bbox: BoundingBox {
                    x: 1.0,
                    y: 1.0,
                    width: image.width() as f32 - 2.0,
                    height: image.height() as f32 - 2.0,
                },
                track_id: 1,
                token: FaceToken("t".into()),
            }])
        }

        fn extract_feature(
            &mut self,
            image: &RgbImage,
            _token: &FaceToken,
        ) -> Result<FeatureVector, EngineError> {
            Ok(FeatureVector {
                values: vec![signature(image)],
                model_version: None,
            })
        }

        fn dispose(self: Box<Self>) {
            self.state.lock().unwrap().sessions_disposed += 1;
        }
    }

    struct FakeHub {
        state: Arc<Mutex<FakeState>>,
    }

    impl FeatureHub for FakeHub {
        fn insert(&mut self, feature: &FeatureVector) -> HubOutcome<FaceId> {
            let mut s = self.state.lock().unwrap();
            let id = s.next_id;
            s.next_id += 1;
            s.hub.insert(id, feature.values.clone());
            HubOutcome::Ok(id)
        }

        fn update(&mut self, face_id: FaceId, feature: &FeatureVector) -> HubOutcome<()> {
            let mut s = self.state.lock().unwrap();
            if s.locked_faces.contains(&face_id) {
                return HubOutcome::Failed("locked".into());
            }
            match s.hub.get_mut(&face_id) {
                Some(v) => {
                    *v = feature.values.clone();
                    HubOutcome::Ok(())
                }
                None => HubOutcome::NotFound,
            }
        }

        fn search(&mut self, feature: &FeatureVector) -> HubOutcome<SearchHit> {
            let s = self.state.lock().unwrap();
            s.hub
                .iter()
                .find(|(_, v)| **v == feature.values)
                .map(|(id, _)| {
                    HubOutcome::Ok(SearchHit {
                        face_id: *id,
                        confidence: 0.9,
                    })
                })
                .unwrap_or(HubOutcome::NotFound)
        }

        fn remove(&mut self, face_id: FaceId) -> HubOutcome<()> {
            let mut s = self.state.lock().unwrap();
            if s.locked_faces.contains(&face_id) {
                return HubOutcome::Failed("locked".into());
            }
            match s.hub.remove(&face_id) {
                Some(_) => HubOutcome::Ok(()),
                None => HubOutcome::NotFound,
            }
        }
    }

    impl FaceEngine for FakeEngine {
        fn create_session(
            &self,
            _config: &SessionConfig,
        ) -> Result<Box<dyn FaceSession>, EngineError> {
            self.state.lock().unwrap().sessions_created += 1;
            Ok(Box::new(FakeSession {
                state: self.state.clone(),
            }))
        }

        fn open_hub(&self) -> Result<Box<dyn FeatureHub>, EngineError> {
            Ok(Box::new(FakeHub {
                state: self.state.clone(),
            }))
        }
    }

    pub(crate) async fn spawn_fake(engine: &FakeEngine) -> EngineHandle {
        spawn_fake_with_timeout(engine, Duration::from_secs(5)).await
    }

    pub(crate) async fn spawn_fake_with_timeout(
        engine: &FakeEngine,
        reply_timeout: Duration,
    ) -> EngineHandle {
        spawn_worker(Box::new(engine.clone()), SessionConfig::default(), reply_timeout)
            .await
            .unwrap()
    }
}
