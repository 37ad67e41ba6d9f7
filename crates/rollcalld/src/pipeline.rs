//! The sampling loop: acquire a frame, encode its faces, decide each one,
//! audit it, and hand `Sent` outcomes to the dispatcher.

use crate::audit_store::{AuditHandle, AuditWriterError};
use crate::dispatcher::{Dispatcher, EventTransport};
use crate::encoder::{Encoder, EncoderError};
use crate::shutdown::Shutdown;
use rollcall_capture::{Frame, FrameSampler, FrameSource};
use rollcall_core::{DecisionEngine, Observation, Outcome, OutcomeTag, SharedKnownSet};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("encoder: {0}")]
    Encoder(#[source] EncoderError),
    #[error(transparent)]
    Audit(#[from] AuditWriterError),
}

/// Running counters, shared with the control interface.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames: AtomicU64,
    faces: AtomicU64,
    sent: AtomicU64,
    debounced: AtomicU64,
    ignored: AtomicU64,
    dispatch_failures: AtomicU64,
    frame_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub faces: u64,
    pub sent: u64,
    pub debounced: u64,
    pub ignored: u64,
    pub dispatch_failures: u64,
    pub frame_errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
        }
    }

    fn count_outcome(&self, tag: OutcomeTag) {
        let counter = match tag {
            OutcomeTag::Sent => &self.sent,
            OutcomeTag::Debounced => &self.debounced,
            OutcomeTag::Ignored | OutcomeTag::IgnoredEmptyRoster => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Pipeline<S, E, T> {
    source: S,
    sampler: FrameSampler,
    encoder: E,
    engine: DecisionEngine,
    known: Arc<SharedKnownSet>,
    dispatcher: Arc<Dispatcher<T>>,
    audit: AuditHandle,
    stats: Arc<PipelineStats>,
    retry_backoff: Duration,
    in_flight: JoinSet<()>,
}

impl<S, E, T> Pipeline<S, E, T>
where
    S: FrameSource,
    E: Encoder,
    T: EventTransport,
{
    pub fn new(
        source: S,
        sampler: FrameSampler,
        encoder: E,
        engine: DecisionEngine,
        known: Arc<SharedKnownSet>,
        dispatcher: Arc<Dispatcher<T>>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            source,
            sampler,
            encoder,
            engine,
            known,
            dispatcher,
            audit,
            stats: Arc::new(PipelineStats::default()),
            retry_backoff: Duration::from_secs(2),
            in_flight: JoinSet::new(),
        }
    }

    /// Delay before the next acquisition attempt after a failed one.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` fires or a fatal error occurs. In-flight
    /// dispatches are awaited and the audit log flushed either way.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), PipelineError> {
        tracing::info!(
            sample_period = ?self.sampler.period(),
            tolerance = self.engine.tolerance(),
            cooldown_secs = self.engine.cooldown().num_seconds(),
            "sampling loop started"
        );
        let result = self.run_loop(&shutdown).await;

        let pending = self.in_flight.len();
        if pending > 0 {
            tracing::info!(pending, "waiting for in-flight dispatches");
        }
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "dispatch task failed");
            }
        }
        let flushed = self.audit.flush().await;

        let stats = self.stats.snapshot();
        tracing::info!(
            frames = stats.frames,
            sent = stats.sent,
            debounced = stats.debounced,
            ignored = stats.ignored,
            "sampling loop stopped"
        );
        result?;
        flushed?;
        Ok(())
    }

    async fn run_loop(&mut self, shutdown: &Shutdown) -> Result<(), PipelineError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                next = self.source.next_frame() => next,
            };
            self.reap_dispatches();

            match next {
                Ok(frame) => {
                    if self.sampler.admit(frame.timestamp) {
                        self.process_frame(&frame, shutdown).await?;
                    }
                }
                Err(e) => {
                    self.stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        retry_in = ?self.retry_backoff,
                        "frame acquisition failed"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }

    async fn process_frame(
        &mut self,
        frame: &Frame,
        shutdown: &Shutdown,
    ) -> Result<(), PipelineError> {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        let faces = match self.encoder.detect_and_encode(&frame.data).await {
            Ok(faces) => faces,
            Err(e) if e.is_fatal() => return Err(PipelineError::Encoder(e)),
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "frame skipped");
                return Ok(());
            }
        };
        // No events once shutdown has been requested.
        if shutdown.is_triggered() {
            tracing::debug!(
                seq = frame.sequence,
                faces = faces.len(),
                "shutting down; frame dropped"
            );
            return Ok(());
        }
        if faces.is_empty() {
            tracing::trace!(seq = frame.sequence, "no faces");
            return Ok(());
        }
        self.stats
            .faces
            .fetch_add(faces.len() as u64, Ordering::Relaxed);

        // One roster snapshot per frame; a concurrent refresh applies to the next.
        let known = self.known.load();
        for face in faces {
            if shutdown.is_triggered() {
                tracing::debug!(seq = frame.sequence, "shutting down; remaining faces dropped");
                break;
            }
            tracing::trace!(seq = frame.sequence, bbox = ?face.bbox, "face");
            let observation = Observation {
                vector: face.vector,
                captured_at: frame.captured_at,
            };
            let decision = self.engine.evaluate(&known, &observation);
            self.stats.count_outcome(decision.outcome.tag());

            match &decision.outcome {
                Outcome::Sent {
                    identity_id,
                    confidence,
                } => tracing::info!(
                    identity_id,
                    name = decision.display_name.as_deref().unwrap_or_default(),
                    confidence,
                    distance = decision.distance,
                    "attendance recognised"
                ),
                Outcome::Debounced { identity_id, .. } => {
                    tracing::debug!(identity_id, "within cooldown; debounced")
                }
                Outcome::Ignored { reason } => {
                    tracing::debug!(?reason, distance = decision.distance, "face ignored")
                }
            }

            self.audit.record(decision.audit_record()).await?;

            if matches!(decision.outcome, Outcome::Sent { .. }) {
                let dispatcher = self.dispatcher.clone();
                let stats = self.stats.clone();
                let outcome = decision.outcome;
                self.in_flight.spawn(async move {
                    if let Some(report) = dispatcher.dispatch(&outcome).await {
                        stats
                            .dispatch_failures
                            .fetch_add(report.failures() as u64, Ordering::Relaxed);
                    }
                });
            }
        }
        Ok(())
    }

    fn reap_dispatches(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "dispatch task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_store::spawn_audit_writer;
    use crate::dispatcher::{AttendanceEvent, DispatchError, DispatchMode, Endpoint};
    use crate::encoder::EncodedFace;
    use reqwest::StatusCode;
    use rollcall_capture::CaptureError;
    use rollcall_core::{
        AuditError, AuditRecord, AuditSink, DedupLedger, FeatureVector, KnownIdentitySet,
        VectorError, FEATURE_DIM,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn unit_on(axis: usize, magnitude: f64) -> FeatureVector {
        let mut values = vec![0.0; FEATURE_DIM];
        values[axis] = magnitude;
        FeatureVector::new(values).unwrap()
    }

    fn roster() -> KnownIdentitySet {
        KnownIdentitySet::build([
            (1_i64, "Ana".to_string(), unit_on(0, 1.0)),
            (2_i64, "Bruno".to_string(), unit_on(1, 1.0)),
        ])
        .unwrap()
    }

    /// Yields the scripted frames, then triggers shutdown.
    struct ScriptedSource {
        frames: VecDeque<Result<Frame, CaptureError>>,
        shutdown: Shutdown,
    }

    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            match self.frames.pop_front() {
                Some(next) => next,
                None => {
                    self.shutdown.trigger();
                    Err(CaptureError::StreamEnded)
                }
            }
        }
    }

    /// Answers each call with the next scripted result; no faces once exhausted.
    struct ScriptedEncoder {
        script: Mutex<VecDeque<Result<Vec<FeatureVector>, EncoderError>>>,
        calls: AtomicU64,
        // Fired while a frame is being encoded.
        interrupt: Option<Shutdown>,
    }

    impl ScriptedEncoder {
        fn new(script: Vec<Result<Vec<FeatureVector>, EncoderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
                interrupt: None,
            }
        }

        fn interrupting(mut self, shutdown: Shutdown) -> Self {
            self.interrupt = Some(shutdown);
            self
        }
    }

    impl Encoder for ScriptedEncoder {
        async fn detect_and_encode(&self, _image: &[u8]) -> Result<Vec<EncodedFace>, EncoderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(shutdown) = &self.interrupt {
                shutdown.trigger();
            }
            let next = self.script.lock().unwrap().pop_front();
            let vectors = next.unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(vectors
                .into_iter()
                .map(|vector| EncodedFace { bbox: None, vector })
                .collect())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<(String, AttendanceEvent)>>>,
        failing_url: Option<String>,
    }

    impl EventTransport for RecordingTransport {
        async fn submit(
            &self,
            endpoint: &Endpoint,
            event: &AttendanceEvent,
        ) -> Result<StatusCode, DispatchError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.url.clone(), event.clone()));
            if self.failing_url.as_deref() == Some(endpoint.url.as_str()) {
                return Err(DispatchError::Status {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: String::new(),
                });
            }
            Ok(StatusCode::OK)
        }
    }

    struct SharedSink(Arc<Mutex<Vec<AuditRecord>>>);

    impl AuditSink for SharedSink {
        fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Harness {
        audit: Arc<Mutex<Vec<AuditRecord>>>,
        calls: Arc<Mutex<Vec<(String, AttendanceEvent)>>>,
        stats: StatsSnapshot,
        result: Result<(), PipelineError>,
        encoder_calls: u64,
    }

    fn frames(count: u64) -> Vec<Result<Frame, CaptureError>> {
        (1..=count).map(|seq| Ok(Frame::new(vec![0xFF, 0xD8], seq))).collect()
    }

    async fn run_pipeline(
        source_frames: Vec<Result<Frame, CaptureError>>,
        encoder: ScriptedEncoder,
        known: KnownIdentitySet,
        mode: DispatchMode,
        transport: RecordingTransport,
        sampler: FrameSampler,
    ) -> Harness {
        run_pipeline_until(
            Shutdown::new(),
            source_frames,
            encoder,
            known,
            mode,
            transport,
            sampler,
        )
        .await
    }

    async fn run_pipeline_until(
        shutdown: Shutdown,
        source_frames: Vec<Result<Frame, CaptureError>>,
        encoder: ScriptedEncoder,
        known: KnownIdentitySet,
        mode: DispatchMode,
        transport: RecordingTransport,
        sampler: FrameSampler,
    ) -> Harness {
        let source = ScriptedSource {
            frames: source_frames.into(),
            shutdown: shutdown.clone(),
        };
        let audit = Arc::new(Mutex::new(Vec::new()));
        let (handle, writer) = spawn_audit_writer(Box::new(SharedSink(audit.clone()))).unwrap();
        let engine = DecisionEngine::new(
            Arc::new(DedupLedger::new()),
            0.5,
            chrono::Duration::seconds(60),
        )
        .unwrap();
        let calls = transport.calls.clone();
        let dispatcher = Arc::new(Dispatcher::new(transport, mode, Some("cam-1".into()), None));
        let encoder = Arc::new(encoder);

        let pipeline = Pipeline::new(
            source,
            sampler,
            EncoderRef(encoder.clone()),
            engine,
            Arc::new(SharedKnownSet::new(known)),
            dispatcher,
            handle,
        )
        .with_retry_backoff(Duration::from_millis(1));
        let stats = pipeline.stats();

        let result = tokio::time::timeout(Duration::from_secs(5), pipeline.run(shutdown))
            .await
            .expect("pipeline did not stop");
        tokio::task::spawn_blocking(move || writer.join().unwrap())
            .await
            .unwrap();

        Harness {
            audit,
            calls,
            stats: stats.snapshot(),
            result,
            encoder_calls: encoder.calls.load(Ordering::Relaxed),
        }
    }

    struct EncoderRef(Arc<ScriptedEncoder>);

    impl Encoder for EncoderRef {
        async fn detect_and_encode(&self, image: &[u8]) -> Result<Vec<EncodedFace>, EncoderError> {
            self.0.detect_and_encode(image).await
        }
    }

    fn single() -> DispatchMode {
        DispatchMode::Single {
            attendance: Endpoint::authenticated("http://api/attendance"),
        }
    }

    fn events(harness: &Harness) -> Vec<&'static str> {
        harness
            .audit
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.event.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_repeat_sighting_is_debounced() {
        let encoder = ScriptedEncoder::new(vec![
            Ok(vec![unit_on(0, 1.1)]),
            Ok(vec![unit_on(0, 1.1)]),
        ]);
        let harness = run_pipeline(
            frames(2),
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        harness.result.as_ref().unwrap();
        assert_eq!(events(&harness), ["sent", "debounced"]);
        let calls = harness.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://api/attendance");
        assert_eq!(calls[0].1.user_id, 1);
        assert_eq!(calls[0].1.device_label.as_deref(), Some("cam-1"));
        assert_eq!(harness.stats.sent, 1);
        assert_eq!(harness.stats.debounced, 1);
        assert_eq!(harness.stats.frames, 2);
    }

    #[tokio::test]
    async fn test_every_face_in_a_frame_is_decided() {
        let encoder = ScriptedEncoder::new(vec![Ok(vec![
            unit_on(0, 1.0),
            unit_on(1, 1.0),
            unit_on(2, 1.0),
        ])]);
        let harness = run_pipeline(
            frames(1),
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        assert_eq!(events(&harness), ["sent", "sent", "ignored"]);
        assert_eq!(harness.calls.lock().unwrap().len(), 2);
        assert_eq!(harness.stats.faces, 3);
    }

    #[tokio::test]
    async fn test_empty_roster_ignores_everything() {
        let encoder = ScriptedEncoder::new(vec![Ok(vec![unit_on(0, 1.0)])]);
        let harness = run_pipeline(
            frames(1),
            encoder,
            KnownIdentitySet::empty(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        assert_eq!(events(&harness), ["ignored_empty_roster"]);
        assert!(harness.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dual_dispatch_failure_keeps_sent_record() {
        let encoder = ScriptedEncoder::new(vec![Ok(vec![unit_on(0, 1.0)])]);
        let transport = RecordingTransport {
            failing_url: Some("http://api/attendance".into()),
            ..Default::default()
        };
        let mode = DispatchMode::Dual {
            attendance: Endpoint::authenticated("http://api/attendance"),
            consolidation: Endpoint::open("http://api/consolidate"),
        };
        let harness = run_pipeline(
            frames(1),
            encoder,
            roster(),
            mode,
            transport,
            FrameSampler::unthrottled(),
        )
        .await;

        harness.result.as_ref().unwrap();
        assert_eq!(events(&harness), ["sent"]);
        let mut urls: Vec<String> = harness
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        assert_eq!(urls, ["http://api/attendance", "http://api/consolidate"]);
        assert_eq!(harness.stats.dispatch_failures, 1);
    }

    #[tokio::test]
    async fn test_acquisition_and_encoding_failures_are_skipped() {
        let mut source = frames(2);
        source.insert(1, Err(CaptureError::EmptyFrame));
        let encoder = ScriptedEncoder::new(vec![
            Err(EncoderError::Status(StatusCode::BAD_GATEWAY)),
            Ok(vec![unit_on(1, 1.0)]),
        ]);
        let harness = run_pipeline(
            source,
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        harness.result.as_ref().unwrap();
        assert_eq!(events(&harness), ["sent"]);
        // The scripted source ends with one more acquisition error.
        assert_eq!(harness.stats.frame_errors, 2);
        assert_eq!(harness.stats.frames, 2);
    }

    #[tokio::test]
    async fn test_malformed_vector_stops_the_loop() {
        let encoder = ScriptedEncoder::new(vec![Err(EncoderError::InvalidVector(
            VectorError::WrongDimension {
                expected: FEATURE_DIM,
                actual: 127,
            },
        ))]);
        let harness = run_pipeline(
            frames(3),
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        assert!(matches!(harness.result, Err(PipelineError::Encoder(_))));
        assert_eq!(harness.encoder_calls, 1);
        assert!(events(&harness).is_empty());
    }

    #[tokio::test]
    async fn test_sampler_drops_frames_inside_period() {
        let encoder = ScriptedEncoder::new(vec![Ok(vec![unit_on(0, 1.0)])]);
        let harness = run_pipeline(
            frames(4),
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::new(Duration::from_secs(3600)),
        )
        .await;

        assert_eq!(harness.encoder_calls, 1);
        assert_eq!(harness.stats.frames, 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_encoding_emits_nothing() {
        let shutdown = Shutdown::new();
        let encoder =
            ScriptedEncoder::new(vec![Ok(vec![unit_on(0, 1.0)])]).interrupting(shutdown.clone());
        let harness = run_pipeline_until(
            shutdown,
            frames(1),
            encoder,
            roster(),
            single(),
            RecordingTransport::default(),
            FrameSampler::unthrottled(),
        )
        .await;

        harness.result.as_ref().unwrap();
        assert_eq!(harness.encoder_calls, 1);
        assert!(events(&harness).is_empty());
        assert!(harness.calls.lock().unwrap().is_empty());
        assert_eq!(harness.stats.sent, 0);
    }

    /// Fails every acquisition and records when each attempt was made.
    struct FailingSource {
        attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
        remaining: usize,
        shutdown: Shutdown,
    }

    impl FrameSource for FailingSource {
        async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            self.attempts
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            if self.remaining == 0 {
                self.shutdown.trigger();
                return Err(CaptureError::StreamEnded);
            }
            self.remaining -= 1;
            Err(CaptureError::EmptyFrame)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_retry_waits_for_backoff_not_sample_period() {
        let backoff = Duration::from_secs(30);
        let shutdown = Shutdown::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let source = FailingSource {
            attempts: attempts.clone(),
            remaining: 2,
            shutdown: shutdown.clone(),
        };
        let (handle, writer) = spawn_audit_writer(Box::new(Vec::<AuditRecord>::new())).unwrap();
        let engine = DecisionEngine::new(
            Arc::new(DedupLedger::new()),
            0.5,
            chrono::Duration::seconds(60),
        )
        .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            RecordingTransport::default(),
            single(),
            None,
            None,
        ));

        let pipeline = Pipeline::new(
            source,
            FrameSampler::new(Duration::from_secs(3600)),
            ScriptedEncoder::new(Vec::new()),
            engine,
            Arc::new(SharedKnownSet::new(roster())),
            dispatcher,
            handle,
        )
        .with_retry_backoff(backoff);
        let stats = pipeline.stats();
        pipeline.run(shutdown).await.unwrap();
        tokio::task::spawn_blocking(move || writer.join().unwrap())
            .await
            .unwrap();

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= backoff && gap < backoff + Duration::from_millis(10),
                "retry gap was {gap:?}"
            );
        }
        assert_eq!(stats.snapshot().frame_errors, 3);
    }
}
