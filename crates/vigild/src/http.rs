//! Browser-facing HTTP: the annotated MJPEG stream, the alert event feed and
//! alert ingestion from external reporters.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use vigil_core::pipeline::PipelineCounters;
use vigil_core::stream::CONTENT_TYPE;
use vigil_core::{
    Alert, AlertDispatcher, Blacklist, Classification, DispatchOutcome, FrameFeed, LogEntry,
    LogSink, SinkError, Verdict, UNKNOWN_NAME,
};

/// SSE event name carried by every alert.
pub const ALERT_EVENT: &str = "face_detected";

/// Where reported sightings are logged, checked and alerted.
pub struct Ingest {
    pub sink: Arc<dyn LogSink>,
    pub blacklist: Arc<dyn Blacklist>,
    /// Reported alerts bypass the throttle.
    pub alerts: AlertDispatcher,
}

#[derive(Debug, Deserialize)]
struct AlertReport {
    name: Option<String>,
    confidence: Option<f32>,
    notes: Option<String>,
}

impl Ingest {
    /// Log the sighting, then alert when the name is blacklisted or unknown.
    fn record(&self, report: AlertReport) -> Result<DispatchOutcome, SinkError> {
        let name = report
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());
        let distance = report.confidence.unwrap_or(f32::INFINITY);
        let timestamp = Utc::now();

        self.sink.append(&LogEntry {
            name: name.clone(),
            confidence: distance,
            timestamp,
        })?;

        let blacklisted = match self.blacklist.is_blacklisted(&name) {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(error = %err, name = %name, "blacklist lookup failed; treating as not blacklisted");
                false
            }
        };
        let classification = if blacklisted {
            Classification::Blacklisted
        } else if name == UNKNOWN_NAME {
            Classification::Unknown
        } else {
            return Ok(DispatchOutcome::NotAlertable);
        };

        let verdict = Verdict {
            classification,
            display_name: name,
            distance,
            identity: None,
        };
        let mut alert = Alert::from_verdict(&verdict, timestamp, None);
        alert.notes = report.notes.filter(|n| !n.is_empty());
        Ok(self.alerts.enqueue(alert))
    }
}

#[derive(Clone)]
pub struct HttpState {
    feed: FrameFeed,
    // Template receiver; each SSE client gets its own via `resubscribe`.
    // Holding a receiver rather than a sender lets the feed end once the
    // pipeline's senders are gone.
    events: Arc<broadcast::Receiver<Arc<Alert>>>,
    counters: Arc<PipelineCounters>,
    ingest: Arc<Ingest>,
    // Flips to `true` on shutdown; ends streams and stops the server.
    closing: watch::Receiver<bool>,
}

impl HttpState {
    pub fn new(
        feed: FrameFeed,
        events: &broadcast::Sender<Arc<Alert>>,
        counters: Arc<PipelineCounters>,
        ingest: Ingest,
        closing: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed,
            events: Arc::new(events.subscribe()),
            counters,
            ingest: Arc::new(ingest),
            closing,
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/events", get(events))
        .route("/api/alert", post(report_alert))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve until the state's closing flag is raised, then drain open
/// connections. Open streams end at the same moment.
pub async fn serve(listener: TcpListener, state: HttpState) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "http server listening");
    let closing = state.closing.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(closed(closing))
        .await
}

/// Resolves once `closing` is `true` or its sender is gone.
async fn closed(mut closing: watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

async fn video_feed(State(state): State<HttpState>) -> impl IntoResponse {
    tracing::debug!("stream viewer connected");
    let frames = state.feed.stream().take_until(closed(state.closing.clone()));
    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
}

async fn events(State(state): State<HttpState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.resubscribe();
    let events = alert_events(rx).take_until(closed(state.closing.clone()));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn alert_events(
    rx: broadcast::Receiver<Arc<Alert>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(alert) => match Event::default().event(ALERT_EVENT).json_data(&*alert) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(err) => tracing::warn!(error = %err, "failed to serialize alert event"),
                },
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagging; alerts skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

async fn report_alert(
    State(state): State<HttpState>,
    Json(report): Json<AlertReport>,
) -> (StatusCode, Json<serde_json::Value>) {
    tracing::debug!(?report, "alert reported");
    let ingest = Arc::clone(&state.ingest);
    match tokio::task::spawn_blocking(move || ingest.record(report)).await {
        Ok(Ok(outcome)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "ok": true,
                "alerted": outcome == DispatchOutcome::Dispatched,
            })),
        ),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to record reported alert");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "ok": false, "error": err.to_string() })),
            )
        }
        Err(err) => {
            tracing::error!(error = %err, "alert ingestion task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": "internal error" })),
            )
        }
    }
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "counters": state.counters.snapshot(),
    }))
}
