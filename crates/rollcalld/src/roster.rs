//! Roster retrieval and enrollment.
//!
//! The roster service lists enrolled people with a photo URL each. Every
//! photo is downloaded and run through the encoder; the first face found
//! becomes that identity's reference vector.

use crate::encoder::{Encoder, EncoderError};
use crate::shutdown::Shutdown;
use image::imageops::FilterType;
use rollcall_core::{
    FeatureVector, IdentityEntry, KnownIdentitySet, KnownSetError, SharedKnownSet,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

/// Photos whose longer side exceeds this are halved on retry; smaller ones
/// are doubled.
const RESCALE_THRESHOLD_PX: u32 = 1200;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
    #[error("roster unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),
    #[error("roster service returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("photo download failed: {0}")]
    Photo(#[source] reqwest::Error),
    #[error("photo server returned HTTP {0}")]
    PhotoStatus(reqwest::StatusCode),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    KnownSet(#[from] KnownSetError),
}

impl RosterError {
    pub fn is_fatal(&self) -> bool {
        match self {
            RosterError::Encoder(e) => e.is_fatal(),
            RosterError::KnownSet(_) => true,
            _ => false,
        }
    }
}

/// One roster entry as served by the roster service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RosterRecord {
    pub user_id: i64,
    pub name: String,
    pub photo_url: String,
}

#[derive(Deserialize)]
struct RosterResponse {
    #[serde(default)]
    faces: Vec<RosterRecord>,
}

pub trait RosterProvider: Send + Sync {
    fn fetch_roster(&self) -> impl Future<Output = Result<Vec<RosterRecord>, RosterError>> + Send;

    fn fetch_photo(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, RosterError>> + Send;
}

pub struct HttpRosterProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpRosterProvider {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RosterError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(RosterError::Client)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RosterProvider for HttpRosterProvider {
    async fn fetch_roster(&self) -> Result<Vec<RosterRecord>, RosterError> {
        tracing::info!(url = %self.url, "fetching roster");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(RosterError::Unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RosterError::Status(status));
        }
        let body: RosterResponse = response.json().await.map_err(RosterError::Unavailable)?;
        tracing::info!(count = body.faces.len(), "roster entries with photo");
        Ok(body.faces)
    }

    async fn fetch_photo(&self, url: &str) -> Result<Vec<u8>, RosterError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(RosterError::Photo)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RosterError::PhotoStatus(status));
        }
        let bytes = response.bytes().await.map_err(RosterError::Photo)?;
        Ok(bytes.to_vec())
    }
}

/// Re-encode `photo` as PNG at half size (longer side above 1200 px) or
/// double size (otherwise).
pub fn rescale_for_retry(photo: &[u8]) -> Result<Vec<u8>, EncoderError> {
    let image = image::load_from_memory(photo)?.to_rgb8();
    let (width, height) = image.dimensions();
    let (new_width, new_height) = if width.max(height) > RESCALE_THRESHOLD_PX {
        ((width / 2).max(1), (height / 2).max(1))
    } else {
        (width.saturating_mul(2), height.saturating_mul(2))
    };
    let resized = image::imageops::resize(&image, new_width, new_height, FilterType::CatmullRom);

    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// First face of `photo`, retrying once on a rescaled copy if none is found.
async fn enroll_photo<E: Encoder>(
    encoder: &E,
    photo: &[u8],
) -> Result<Option<FeatureVector>, RosterError> {
    if let Some(face) = encoder.detect_and_encode(photo).await?.into_iter().next() {
        return Ok(Some(face.vector));
    }
    let rescaled = rescale_for_retry(photo)?;
    Ok(encoder
        .detect_and_encode(&rescaled)
        .await?
        .into_iter()
        .next()
        .map(|face| face.vector))
}

/// Fetch the roster and enroll every identity whose photo yields a face.
///
/// Per-identity failures are logged and skipped; only a roster fetch failure
/// or a fatal encoder error aborts the build.
pub async fn build_known_set<P, E>(
    provider: &P,
    encoder: &E,
) -> Result<KnownIdentitySet, RosterError>
where
    P: RosterProvider,
    E: Encoder,
{
    let records = provider.fetch_roster().await?;
    let mut enrolled_ids = HashSet::with_capacity(records.len());
    let mut entries = Vec::with_capacity(records.len());

    for record in records {
        if enrolled_ids.contains(&record.user_id) {
            tracing::warn!(
                identity_id = record.user_id,
                name = %record.name,
                "duplicate roster entry; keeping the first"
            );
            continue;
        }

        let enrolled = match provider.fetch_photo(&record.photo_url).await {
            Ok(photo) => enroll_photo(encoder, &photo).await,
            Err(e) => Err(e),
        };
        match enrolled {
            Ok(Some(vector)) => {
                tracing::info!(
                    identity_id = record.user_id,
                    name = %record.name,
                    "identity enrolled"
                );
                enrolled_ids.insert(record.user_id);
                entries.push(IdentityEntry {
                    identity_id: record.user_id,
                    display_name: record.name,
                    reference_vector: vector,
                });
            }
            Ok(None) => {
                tracing::warn!(
                    identity_id = record.user_id,
                    name = %record.name,
                    photo_url = %record.photo_url,
                    "no face detected in roster photo"
                );
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    identity_id = record.user_id,
                    name = %record.name,
                    error = %e,
                    "failed to enroll identity"
                );
            }
        }
    }

    let set = KnownIdentitySet::build(entries)?;
    tracing::info!(identities = set.len(), "known set built");
    Ok(set)
}

/// Rebuilds the roster and swaps it into the shared known set.
///
/// Concurrent refreshes are serialised; the matching loop keeps using the
/// previous set until the swap.
pub struct RosterRefresher<P, E> {
    provider: P,
    encoder: E,
    known: Arc<SharedKnownSet>,
    lock: tokio::sync::Mutex<()>,
}

impl<P: RosterProvider, E: Encoder> RosterRefresher<P, E> {
    pub fn new(provider: P, encoder: E, known: Arc<SharedKnownSet>) -> Self {
        Self {
            provider,
            encoder,
            known,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn known(&self) -> &Arc<SharedKnownSet> {
        &self.known
    }

    /// Rebuild and swap. On error the previous set stays in place.
    pub async fn refresh(&self) -> Result<usize, RosterError> {
        let _guard = self.lock.lock().await;
        let set = build_known_set(&self.provider, &self.encoder).await?;
        let count = set.len();
        let previous = self.known.replace(set);
        tracing::info!(identities = count, previous = previous.len(), "roster swapped");
        Ok(count)
    }
}

/// Refresh the roster every `every` until shutdown. A fatal error triggers
/// shutdown and is returned; anything else keeps the previous roster.
pub async fn run_periodic_refresh<P, E>(
    refresher: Arc<RosterRefresher<P, E>>,
    every: Duration,
    shutdown: Shutdown,
) -> Result<(), RosterError>
where
    P: RosterProvider,
    E: Encoder,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already loaded a roster.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match refresher.refresh().await {
            Ok(count) => tracing::debug!(identities = count, "periodic roster refresh done"),
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "roster refresh hit an unrecoverable error");
                shutdown.trigger();
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "roster refresh failed; keeping previous roster")
            }
        }
    }
}
