use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CallError;
use crate::retry::is_error_class;

/// Status code and decoded body of one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub body: T,
}

impl<T> ApiResponse<T> {
    pub fn new(status: u16, body: T) -> Self {
        Self { status, body }
    }
}

/// Reaction submitted against an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Like,
    Dislike,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Like => "like",
            EventKind::Dislike => "dislike",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumProfile {
    pub artist: String,
    pub title: String,
    pub year: String,
}

impl Default for AlbumProfile {
    fn default() -> Self {
        Self {
            artist: "Artist".to_string(),
            title: "Moon".to_string(),
            year: "1980".to_string(),
        }
    }
}

/// Body of a create call: an image plus its profile.
#[derive(Debug, Clone)]
pub struct ResourcePayload {
    pub image: Vec<u8>,
    pub profile: AlbumProfile,
}

impl ResourcePayload {
    pub fn new(image: Vec<u8>, profile: AlbumProfile) -> Self {
        Self { image, profile }
    }

    /// Deterministic filler image of `size` bytes.
    pub fn synthetic(size: usize) -> Self {
        let image = (0..size).map(|i| (i % 251) as u8).collect();
        Self::new(image, AlbumProfile::default())
    }
}

/// The service under test, seen as four blocking operations.
///
/// Implementations must be shareable across worker threads. Every method
/// returns the observed status code even for 4xx/5xx replies; only failures
/// that produced no status at all come back as `Err`.
pub trait ResourceApi: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a resource and return its server-assigned id.
    fn create_resource(&self, payload: &ResourcePayload) -> Result<ApiResponse<String>, CallError>;

    fn fetch_resource(&self, id: &str) -> Result<ApiResponse<String>, CallError>;

    fn submit_event(&self, kind: EventKind, id: &str) -> Result<ApiResponse<()>, CallError>;

    /// Read the event tally of a resource. Used by the samplers.
    fn fetch_events(&self, id: &str) -> Result<ApiResponse<String>, CallError>;
}

/// In-process stand-in for the service with a fixed latency and a seeded
/// failure rate.
pub struct MockApi {
    delay_ms: u64,
    error_rate: f64,
    transport_error_rate: f64,
    next_id: AtomicU64,
    rng: Mutex<StdRng>,
}

impl MockApi {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            error_rate: 0.0,
            transport_error_rate: 0.0,
            next_id: AtomicU64::new(1),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Answer a share of calls with 500 and drop another share without a
    /// status. Rates are clamped to [0, 1].
    pub fn with_failures(mut self, error_rate: f64, transport_error_rate: f64, seed: u64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self.transport_error_rate = transport_error_rate.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Simulate one round trip: sleep, then decide the outcome.
    fn round_trip(&self, ok_status: u16) -> Result<u16, CallError> {
        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }
        let roll: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(poisoned) => poisoned.into_inner().gen(),
        };
        if roll < self.transport_error_rate {
            return Err(CallError::Transport("mock connection reset".to_string()));
        }
        if roll < self.transport_error_rate + self.error_rate {
            return Ok(500);
        }
        Ok(ok_status)
    }
}

impl ResourceApi for MockApi {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_resource(&self, _payload: &ResourcePayload) -> Result<ApiResponse<String>, CallError> {
        let status = self.round_trip(200)?;
        let id = if status < 300 {
            self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
        } else {
            String::new()
        };
        Ok(ApiResponse::new(status, id))
    }

    fn fetch_resource(&self, id: &str) -> Result<ApiResponse<String>, CallError> {
        let status = self.round_trip(200)?;
        Ok(ApiResponse::new(status, format!("{{\"albumID\":\"{id}\"}}")))
    }

    fn submit_event(&self, _kind: EventKind, _id: &str) -> Result<ApiResponse<()>, CallError> {
        let status = self.round_trip(201)?;
        Ok(ApiResponse::new(status, ()))
    }

    fn fetch_events(&self, _id: &str) -> Result<ApiResponse<String>, CallError> {
        let status = self.round_trip(200)?;
        Ok(ApiResponse::new(status, "{\"likes\":0,\"dislikes\":0}".to_string()))
    }
}

/// HTTP adapter for the album/review service.
///
/// Owns its async runtime and connection pool. Worker threads block on each
/// request through the runtime; both are released when the adapter drops.
pub struct HttpApi {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout_ms: u64, io_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("loadrig-io")
            .enable_all()
            .build()
            .context("Failed to build HTTP runtime")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            runtime,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_text(&self, url: String) -> Result<ApiResponse<String>, CallError> {
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiResponse::new(status, body))
    }
}

/// Error-class replies carry no id. Any other reply must name the created
/// album, otherwise the attempt fails as a decode error.
fn create_reply(status: u16, body: &[u8]) -> Result<ApiResponse<String>, CallError> {
    if is_error_class(status) {
        return Ok(ApiResponse::new(status, String::new()));
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| CallError::Decode(format!("create reply {status}: {e}")))?;
    Ok(ApiResponse::new(status, album_id(&value)?))
}

/// Extract `albumID` from a create reply. Servers in the wild send it either
/// as a string or as a bare number.
fn album_id(body: &serde_json::Value) -> Result<String, CallError> {
    match body.get("albumID") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(CallError::Decode(format!("missing albumID in {body}"))),
    }
}

impl ResourceApi for HttpApi {
    fn name(&self) -> &'static str {
        "http"
    }

    fn create_resource(&self, payload: &ResourcePayload) -> Result<ApiResponse<String>, CallError> {
        let url = self.endpoint("albums");
        let profile = serde_json::to_string(&payload.profile)
            .map_err(|e| CallError::Decode(e.to_string()))?;
        let image = reqwest::multipart::Part::bytes(payload.image.clone())
            .file_name("album.png")
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("profile", profile);

        self.runtime.block_on(async {
            let response = self.client.post(&url).multipart(form).send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;
            create_reply(status, &body)
        })
    }

    fn fetch_resource(&self, id: &str) -> Result<ApiResponse<String>, CallError> {
        let url = self.endpoint(&format!("albums/{id}"));
        self.runtime.block_on(self.get_text(url))
    }

    fn submit_event(&self, kind: EventKind, id: &str) -> Result<ApiResponse<()>, CallError> {
        let url = self.endpoint(&format!("review/{}/{id}", kind.as_str()));
        self.runtime.block_on(async {
            let response = self.client.post(&url).send().await?;
            Ok::<_, CallError>(ApiResponse::new(response.status().as_u16(), ()))
        })
    }

    fn fetch_events(&self, id: &str) -> Result<ApiResponse<String>, CallError> {
        let url = self.endpoint(&format!("review/{id}"));
        self.runtime.block_on(self.get_text(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_assigns_sequential_ids() {
        let api = MockApi::new(0);
        let payload = ResourcePayload::synthetic(16);

        let first = api.create_resource(&payload).unwrap();
        let second = api.create_resource(&payload).unwrap();

        assert_eq!(first.status, 200);
        assert_eq!(first.body, "1");
        assert_eq!(second.body, "2");
    }

    #[test]
    fn test_mock_event_returns_created() {
        let api = MockApi::new(0);
        let res = api.submit_event(EventKind::Like, "1").unwrap();
        assert_eq!(res.status, 201);
    }

    #[test]
    fn test_mock_full_error_rate_always_500() {
        let api = MockApi::new(0).with_failures(1.0, 0.0, 7);
        for _ in 0..20 {
            let res = api.fetch_resource("1").unwrap();
            assert_eq!(res.status, 500);
        }
    }

    #[test]
    fn test_mock_full_transport_rate_always_errors() {
        let api = MockApi::new(0).with_failures(0.0, 1.0, 7);
        let payload = ResourcePayload::synthetic(4);
        assert!(matches!(
            api.create_resource(&payload),
            Err(CallError::Transport(_))
        ));
    }

    #[test]
    fn test_album_id_accepts_string_and_number() {
        let as_str = serde_json::json!({"albumID": "42", "imageSize": "10"});
        let as_num = serde_json::json!({"albumID": 42});
        let missing = serde_json::json!({"imageSize": "10"});

        assert_eq!(album_id(&as_str).unwrap(), "42");
        assert_eq!(album_id(&as_num).unwrap(), "42");
        assert!(album_id(&missing).is_err());
        assert!(album_id(&serde_json::json!({"albumID": ""})).is_err());
    }

    #[test]
    fn test_accepted_create_reply_needs_an_id() {
        let ok = create_reply(201, br#"{"albumID":"9"}"#).unwrap();
        assert_eq!(ok, ApiResponse::new(201, "9".to_string()));

        let failed = create_reply(500, b"internal error").unwrap();
        assert_eq!(failed.status, 500);
        assert!(failed.body.is_empty());

        assert!(matches!(create_reply(302, b""), Err(CallError::Decode(_))));
        assert!(matches!(create_reply(200, b"{}"), Err(CallError::Decode(_))));
    }

    #[test]
    fn test_event_kind_path_segment() {
        assert_eq!(EventKind::Like.as_str(), "like");
        assert_eq!(EventKind::Dislike.as_str(), "dislike");
    }

    #[test]
    fn test_synthetic_payload_size() {
        let payload = ResourcePayload::synthetic(300);
        assert_eq!(payload.image.len(), 300);
        assert_eq!(payload.profile.title, "Moon");
    }
}
