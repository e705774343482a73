// # HTTP Remote Adapter
//
// This crate provides a `RemoteAdapter` over a plain JSON/HTTP document API,
// plus a reachability probe that drives automatic queue replay.
//
// ## Adapter Rules
//
// - One HTTP request per call: no retry, no backoff (the offline queue owns retry)
// - Every request carries a timeout
// - The bearer token never appears in logs or Debug output
// - Live queries poll and emit a full snapshot only when the result changes
//
// ## API Reference
//
// - Upsert: `PUT {base}/collections/{scope}/documents/{id}` with the record as body
// - Delete: `DELETE {base}/collections/{scope}/documents/{id}` (404 counts as deleted)
// - Query: `GET {base}/collections/{scope}/documents?field=value&...`, answered
//   with either `{"documents": [...]}` or a bare array of
//   `{"id", "data", "updatedAt"?}` objects
// - Health: `GET {base}/health`, any 2xx means reachable

use async_trait::async_trait;
use orisync_core::config::RemoteConfig;
use orisync_core::traits::{
    ConnectivityEvent, ConnectivityNotifier, QueryDescriptor, RemoteAdapter, RemoteAdapterFactory,
    RemoteDocument, SnapshotStream,
};
use orisync_core::{AdapterRegistry, Error, Result};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Default per-request timeout
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling interval for live queries
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Remote adapter for a JSON/HTTP document API
///
/// Cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub struct HttpRemoteAdapter {
    base_url: Url,
    /// ⚠️ NEVER log this value
    api_token: Option<String>,
    client: reqwest::Client,
    poll_interval: Duration,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for HttpRemoteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteAdapter")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "<REDACTED>"))
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Query answer in either accepted shape
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Wrapped { documents: Vec<RemoteDocument> },
    Bare(Vec<RemoteDocument>),
}

impl ListResponse {
    fn into_documents(self) -> Vec<RemoteDocument> {
        match self {
            Self::Wrapped { documents } | Self::Bare(documents) => documents,
        }
    }
}

/// What a live query last emitted
#[derive(Debug, PartialEq)]
enum LastDelivery {
    Nothing,
    Snapshot(Vec<RemoteDocument>),
    Failed,
}

impl HttpRemoteAdapter {
    /// Create a new adapter
    ///
    /// # Parameters
    ///
    /// - `base_url`: API root, e.g. `https://sync.example.com/v1`
    /// - `api_token`: Optional bearer token
    /// - `timeout`: Per-request timeout
    /// - `poll_interval`: How often live queries re-fetch
    ///
    /// # Returns
    ///
    /// - `Err(Error::Config)` if the URL is not an absolute http(s) URL, the
    ///   token is empty, or the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::config(format!("Invalid HTTP remote base URL '{}': {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(Error::config(format!(
                "HTTP remote base URL must be an absolute http(s) URL, got '{}'",
                base_url
            )));
        }
        if api_token.as_deref().is_some_and(|token| token.trim().is_empty()) {
            return Err(Error::config("HTTP remote API token cannot be empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            api_token,
            client,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        })
    }

    /// Create an adapter with default timeout and polling interval
    pub fn with_defaults(base_url: &str, api_token: Option<String>) -> Result<Self> {
        Self::new(base_url, api_token, DEFAULT_HTTP_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    /// Build `{base}/{segments...}` with every segment percent-encoded
    fn url<'a, I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config("HTTP remote base URL cannot take a path"))?
            // A trailing slash on the base would leave an empty segment
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, scope: &str) -> Result<Url> {
        self.url(
            std::iter::once("collections")
                .chain(scope.split('/').filter(|part| !part.is_empty()))
                .chain(std::iter::once("documents")),
        )
    }

    fn document_url(&self, scope: &str, id: &str) -> Result<Url> {
        let mut url = self.collection_url(scope)?;
        url.path_segments_mut()
            .map_err(|_| Error::config("HTTP remote base URL cannot take a path"))?
            .push(id);
        Ok(url)
    }

    fn query_url(&self, query: &QueryDescriptor) -> Result<Url> {
        let mut url = self.collection_url(&query.scope)?;
        if !query.filters.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for filter in &query.filters {
                pairs.append_pair(&filter.field, &filter_value(&filter.value));
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch one snapshot of a query
    async fn fetch(&self, query: &QueryDescriptor) -> Result<Vec<RemoteDocument>> {
        let url = self.query_url(query)?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::transport(format!("Query '{}' failed: {}", query.key, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Error::transport(format!(
                "Query '{}' failed: {}",
                query.key,
                describe_status(status, &body)
            )));
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("Query '{}' returned invalid JSON: {}", query.key, e)))?;
        Ok(parsed.into_documents())
    }
}

/// Render a filter value the way it appears in a query string
fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map an unsuccessful status to a message
fn describe_status(status: StatusCode, body: &str) -> String {
    match status.as_u16() {
        401 | 403 => format!(
            "Authentication failed: invalid API token or insufficient permissions. Status: {}",
            status
        ),
        404 => format!("Not found. Status: {}", status),
        409 => format!("Conflict: document is being changed concurrently. Status: {}", status),
        429 => format!("Rate limit exceeded. Status: {}", status),
        500..=599 => format!("Server error (transient): {} - {}", status, body),
        _ => format!("Unexpected response: {} - {}", status, body),
    }
}

#[async_trait]
impl RemoteAdapter for HttpRemoteAdapter {
    async fn write(&self, scope: &str, id: &str, data: &Value) -> Result<()> {
        let url = self.document_url(scope, id)?;
        tracing::debug!("PUT {}", url);

        let response = self
            .authorized(self.client.put(url))
            .json(data)
            .send()
            .await
            .map_err(|e| Error::write_failed(scope, id, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        Err(Error::write_failed(scope, id, describe_status(status, &body)))
    }

    fn subscribe(&self, query: &QueryDescriptor) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.clone();
        let query = query.clone();

        tokio::spawn(async move {
            tracing::debug!(
                "Polling query '{}' on '{}' every {:?}",
                query.key,
                query.scope,
                adapter.poll_interval
            );
            let mut interval = tokio::time::interval(adapter.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = LastDelivery::Nothing;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }

                let delivery = match adapter.fetch(&query).await {
                    Ok(documents) => {
                        let next = LastDelivery::Snapshot(documents.clone());
                        if next == last {
                            continue;
                        }
                        last = next;
                        Ok(documents)
                    }
                    Err(e) => {
                        // Report an outage once, not on every poll
                        if last == LastDelivery::Failed {
                            continue;
                        }
                        last = LastDelivery::Failed;
                        Err(e)
                    }
                };

                if tx.send(delivery).is_err() {
                    break;
                }
            }
            tracing::debug!("Stopped polling query '{}'", query.key);
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<()> {
        let url = self.document_url(scope, id)?;
        tracing::debug!("DELETE {}", url);

        let response = self
            .authorized(self.client.delete(url))
            .send()
            .await
            .map_err(|e| Error::write_failed(scope, id, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        // Already gone counts as deleted, so replays stay idempotent
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        Err(Error::write_failed(scope, id, describe_status(status, &body)))
    }

    fn adapter_name(&self) -> &'static str {
        "http"
    }
}

/// Connectivity notifier probing `{base}/health`
///
/// Emits [`ConnectivityEvent::Online`] on the first successful probe and on
/// every recovery, [`ConnectivityEvent::Offline`] on every loss, and
/// [`ConnectivityEvent::Tick`] on every further successful probe so actions
/// that failed while the remote stayed reachable are replayed too.
#[derive(Debug, Clone)]
pub struct HttpConnectivityProbe {
    health_url: Url,
    client: reqwest::Client,
    period: Duration,
}

impl HttpConnectivityProbe {
    /// Create a probe against the adapter's base URL
    pub fn new(base_url: &str, period: Duration, timeout: Duration) -> Result<Self> {
        let adapter = HttpRemoteAdapter::new(base_url, None, timeout, period)?;
        Ok(Self {
            health_url: adapter.url(["health"])?,
            client: adapter.client,
            period: adapter.poll_interval,
        })
    }

    /// The probed URL
    pub fn health_url(&self) -> &str {
        self.health_url.as_str()
    }
}

/// Event for one probe result, given the previous one
fn transition(previous: Option<bool>, reachable: bool) -> Option<ConnectivityEvent> {
    match (previous, reachable) {
        (Some(true), true) => Some(ConnectivityEvent::Tick),
        (_, true) => Some(ConnectivityEvent::Online),
        (Some(true), false) => Some(ConnectivityEvent::Offline),
        // Still down, or unreachable from the start
        (_, false) => None,
    }
}

impl ConnectivityNotifier for HttpConnectivityProbe {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = ConnectivityEvent> + Send + 'static>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(probe.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut reachable: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }

                let now = match probe.client.get(probe.health_url.clone()).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        tracing::trace!("Health probe failed: {}", e);
                        false
                    }
                };

                if let Some(event) = transition(reachable, now) {
                    if event != ConnectivityEvent::Tick {
                        tracing::info!("Remote {} ({})", if now { "reachable" } else { "unreachable" }, probe.health_url);
                    }
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                reachable = Some(now);
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn notifier_name(&self) -> &'static str {
        "http-probe"
    }
}

/// Factory for creating HTTP remote adapters
pub struct HttpRemoteFactory;

impl RemoteAdapterFactory for HttpRemoteFactory {
    fn create(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteAdapter>> {
        match config {
            RemoteConfig::Http {
                base_url,
                poll_interval_secs,
                timeout_secs,
                api_token,
            } => {
                let adapter = HttpRemoteAdapter::new(
                    base_url,
                    api_token.clone(),
                    Duration::from_secs(*timeout_secs),
                    Duration::from_secs(*poll_interval_secs),
                )?;
                tracing::debug!("Created {:?}", adapter);
                Ok(Arc::new(adapter))
            }
            _ => Err(Error::config("Invalid config for HTTP remote")),
        }
    }
}

/// Register the HTTP remote with a registry
///
/// # Example
///
/// ```rust
/// use orisync_core::AdapterRegistry;
///
/// let registry = AdapterRegistry::new();
/// orisync_remote_http::register(&registry);
/// assert!(registry.has_remote("http"));
/// ```
pub fn register(registry: &AdapterRegistry) {
    registry.register_remote("http", Box::new(HttpRemoteFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_stream::StreamExt;

    fn adapter(base: &str) -> HttpRemoteAdapter {
        HttpRemoteAdapter::new(base, None, Duration::from_secs(2), Duration::from_millis(20)).unwrap()
    }

    /// Serve canned HTTP responses, one per connection, recording request heads
    async fn serve(responses: Vec<(u16, String)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let mut responses = responses.into_iter();
        let mut last = None;
        serve_with(move |_request| match responses.next() {
            Some(next) => {
                last = Some(next.clone());
                next
            }
            None => last.clone().unwrap_or((200, "[]".to_string())),
        })
        .await
    }

    /// Serve one response per connection, chosen from the request text
    async fn serve_with<F>(mut respond: F) -> (String, mpsc::UnboundedReceiver<String>)
    where
        F: FnMut(&str) -> (u16, String) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };

                let mut request = String::new();
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    let text = String::from_utf8_lossy(&buf[..read]).to_string();
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let content_length = text[..head_end]
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if read >= head_end + 4 + content_length {
                            request = text;
                            break;
                        }
                    }
                }
                let (status, body) = respond(&request);
                let _ = seen_tx.send(request);

                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base, seen_rx)
    }

    #[test]
    fn test_document_url_encoding() {
        let remote = adapter("https://sync.example.com/v1/");
        let url = remote.document_url("events/e1/entries", "runner 7").unwrap();
        assert_eq!(
            url.as_str(),
            "https://sync.example.com/v1/collections/events/e1/entries/documents/runner%207"
        );
    }

    #[test]
    fn test_query_url_filters() {
        let remote = adapter("https://sync.example.com");
        let query = QueryDescriptor::new("club:A", "entries")
            .where_eq("clubId", "A")
            .where_eq("year", 2025);
        assert_eq!(
            remote.query_url(&query).unwrap().as_str(),
            "https://sync.example.com/collections/entries/documents?clubId=A&year=2025"
        );
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert!(HttpRemoteAdapter::with_defaults("sync.example.com", None).is_err());
        assert!(HttpRemoteAdapter::with_defaults("ftp://sync.example.com", None).is_err());
        assert!(HttpRemoteAdapter::with_defaults("https://sync.example.com", Some(" ".into())).is_err());
    }

    #[test]
    fn test_api_token_not_exposed_in_debug() {
        let remote =
            HttpRemoteAdapter::with_defaults("https://sync.example.com", Some("secret_token_12345".into()))
                .unwrap();
        let debug_str = format!("{:?}", remote);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("<REDACTED>"));
    }

    #[test]
    fn test_list_response_shapes() {
        let wrapped: ListResponse =
            serde_json::from_value(json!({"documents": [{"id": "a", "data": {"v": 1}}]})).unwrap();
        let bare: ListResponse = serde_json::from_value(json!([
            {"id": "b", "data": {}, "updatedAt": "2025-06-01T12:00:00Z"}
        ]))
        .unwrap();

        assert_eq!(wrapped.into_documents()[0].id, "a");
        let bare = bare.into_documents();
        assert!(bare[0].updated_at.is_some());
    }

    #[test]
    fn test_health_check_transitions() {
        assert_eq!(transition(None, true), Some(ConnectivityEvent::Online));
        assert_eq!(transition(None, false), None);
        assert_eq!(transition(Some(true), true), Some(ConnectivityEvent::Tick));
        assert_eq!(transition(Some(false), false), None);
        assert_eq!(transition(Some(true), false), Some(ConnectivityEvent::Offline));
        assert_eq!(transition(Some(false), true), Some(ConnectivityEvent::Online));
    }

    #[test]
    fn test_factory() {
        let factory = HttpRemoteFactory;
        let config = RemoteConfig::Http {
            base_url: "https://sync.example.com".into(),
            poll_interval_secs: 15,
            timeout_secs: 10,
            api_token: Some("token".into()),
        };
        let remote = factory.create(&config).unwrap();
        assert_eq!(remote.adapter_name(), "http");
        assert!(remote.is_configured());

        assert!(factory.create(&RemoteConfig::Unconfigured).is_err());
    }

    #[tokio::test]
    async fn test_write_sends_put_with_token() {
        let (base, mut seen) = serve(vec![(200, "{}".into())]).await;
        let remote = HttpRemoteAdapter::new(
            &base,
            Some("tok".into()),
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .unwrap();

        remote.write("entries", "r1", &json!({"class": "H21"})).await.unwrap();

        let request = seen.recv().await.unwrap();
        assert!(request.starts_with("PUT /collections/entries/documents/r1 "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
        assert!(request.contains(r#"{"class":"H21"}"#));
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (base, _seen) = serve(vec![(503, "maintenance".into())]).await;
        let err = adapter(&base)
            .write("entries", "r1", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_document_succeeds() {
        let (base, _seen) = serve(vec![(404, String::new())]).await;
        adapter(&base).delete("entries", "gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_emits_only_changes() {
        let first = json!([{"id": "a", "data": {"v": 1}}]).to_string();
        let second = json!({"documents": [{"id": "a", "data": {"v": 2}}]}).to_string();
        let (base, _seen) = serve(vec![
            (200, first.clone()),
            (200, first),
            (500, "boom".into()),
            (500, "boom".into()),
            (200, second),
        ])
        .await;

        async fn next(stream: &mut SnapshotStream) -> Result<Vec<RemoteDocument>> {
            tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("snapshot within 5 seconds")
                .expect("stream still open")
        }

        let remote = adapter(&base);
        let mut stream = remote.subscribe(&QueryDescriptor::new("all", "entries"));

        let snapshot = next(&mut stream).await.unwrap();
        assert_eq!(snapshot[0].data, json!({"v": 1}));
        // Unchanged snapshot skipped, outage reported once
        assert!(next(&mut stream).await.is_err());
        let snapshot = next(&mut stream).await.unwrap();
        assert_eq!(snapshot[0].data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_failed_write_replayed_while_remote_stays_reachable() {
        use orisync_core::{MemoryActionLog, MemoryMirrorStore, SyncConfig, SyncEngine};

        let mut put_count = 0;
        let (base, _seen) = serve_with(move |request| {
            if request.starts_with("PUT ") {
                put_count += 1;
                if put_count == 1 {
                    return (503, "busy".to_string());
                }
            }
            (200, "{}".to_string())
        })
        .await;

        let (engine, _events) = SyncEngine::new(
            Arc::new(adapter(&base)),
            Arc::new(MemoryMirrorStore::new()),
            Box::new(MemoryActionLog::new()),
            SyncConfig::new(),
        )
        .await
        .unwrap();

        engine.upsert("entries", "r1", &json!({"v": 1})).await.unwrap();
        engine.upsert("entries", "r2", &json!({"v": 1})).await.unwrap();
        assert_eq!(engine.pending_actions(None).await.len(), 2);

        let probe =
            HttpConnectivityProbe::new(&base, Duration::from_millis(20), Duration::from_secs(2)).unwrap();
        assert!(engine.start_auto_flush(Box::new(probe)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.pending_actions(None).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("queued writes replayed while /health stays up");
        assert!(!engine.get("entries", "r1").unwrap().pending_write);
        engine.stop_auto_flush();
    }
}
