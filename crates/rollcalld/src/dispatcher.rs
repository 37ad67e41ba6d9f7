//! Attendance event dispatch.
//!
//! Only `Sent` outcomes produce network traffic. In dual mode the event goes
//! to the attendance endpoint and the consolidation endpoint concurrently;
//! each result is logged on its own and neither is retried.

use reqwest::StatusCode;
use rollcall_core::Outcome;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("submit failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Payload posted for one `Sent` decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub user_id: i64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classroom_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Whether the API key header is attached.
    pub authenticated: bool,
}

impl Endpoint {
    pub fn authenticated(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            authenticated: true,
        }
    }

    pub fn open(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            authenticated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    Single {
        attendance: Endpoint,
    },
    Dual {
        attendance: Endpoint,
        consolidation: Endpoint,
    },
}

/// Delivers one event to one endpoint.
pub trait EventTransport: Send + Sync + 'static {
    fn submit(
        &self,
        endpoint: &Endpoint,
        event: &AttendanceEvent,
    ) -> impl Future<Output = Result<StatusCode, DispatchError>> + Send;
}

/// JSON over HTTP POST, with `X-API-Key` on authenticated endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, api_key })
    }
}

impl EventTransport for HttpTransport {
    async fn submit(
        &self,
        endpoint: &Endpoint,
        event: &AttendanceEvent,
    ) -> Result<StatusCode, DispatchError> {
        let mut request = self.client.post(&endpoint.url).json(event);
        if endpoint.authenticated {
            if let Some(key) = &self.api_key {
                request = request.header("X-API-Key", key);
            }
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(status);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Status { status, body })
    }
}

/// Per-endpoint results of one dispatch.
#[derive(Debug)]
pub struct DispatchReport {
    pub attendance: Result<StatusCode, DispatchError>,
    /// `None` in single mode.
    pub consolidation: Option<Result<StatusCode, DispatchError>>,
}

impl DispatchReport {
    pub fn failures(&self) -> usize {
        usize::from(self.attendance.is_err())
            + usize::from(matches!(self.consolidation, Some(Err(_))))
    }
}

pub struct Dispatcher<T> {
    transport: T,
    mode: DispatchMode,
    device_label: Option<String>,
    classroom_code: Option<String>,
}

impl<T: EventTransport> Dispatcher<T> {
    pub fn new(
        transport: T,
        mode: DispatchMode,
        device_label: Option<String>,
        classroom_code: Option<String>,
    ) -> Self {
        Self {
            transport,
            mode,
            device_label,
            classroom_code,
        }
    }

    pub fn event_for(&self, identity_id: i64, confidence: f64) -> AttendanceEvent {
        AttendanceEvent {
            user_id: identity_id,
            confidence,
            device_label: self.device_label.clone(),
            classroom_code: self.classroom_code.clone(),
        }
    }

    /// Submit the event for a `Sent` outcome. Other outcomes send nothing
    /// and return `None`.
    pub async fn dispatch(&self, outcome: &Outcome) -> Option<DispatchReport> {
        let Outcome::Sent {
            identity_id,
            confidence,
        } = *outcome
        else {
            return None;
        };
        let event = self.event_for(identity_id, confidence);

        let report = match &self.mode {
            DispatchMode::Single { attendance } => DispatchReport {
                attendance: self.submit_logged(attendance, &event).await,
                consolidation: None,
            },
            DispatchMode::Dual {
                attendance,
                consolidation,
            } => {
                let (attendance, consolidation) = tokio::join!(
                    self.submit_logged(attendance, &event),
                    self.submit_logged(consolidation, &event),
                );
                DispatchReport {
                    attendance,
                    consolidation: Some(consolidation),
                }
            }
        };
        Some(report)
    }

    async fn submit_logged(
        &self,
        endpoint: &Endpoint,
        event: &AttendanceEvent,
    ) -> Result<StatusCode, DispatchError> {
        let result = self.transport.submit(endpoint, event).await;
        match &result {
            Ok(status) => tracing::info!(
                identity_id = event.user_id,
                confidence = event.confidence,
                endpoint = %endpoint.url,
                status = status.as_u16(),
                "attendance event delivered"
            ),
            Err(e) => tracing::error!(
                identity_id = event.user_id,
                endpoint = %endpoint.url,
                error = %e,
                "attendance event not delivered"
            ),
        }
        result
    }
}
