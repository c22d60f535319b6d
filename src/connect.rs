//! Live feed connection: negotiation handshake and the socket read loop.
//!
//! Attaching to the push feed is a two-step dance. A plain HTTPS `negotiate`
//! call yields a connection token and a session cookie; both are then carried
//! into the websocket `connect` request, after which a single subscribe
//! message names the streams to receive. From there the connector only reads,
//! forwarding every text frame's stream updates into the session queue.
//!
//! When recording is configured, raw frame text is appended to the recording
//! file verbatim, one line per frame, which is exactly the format
//! [`crate::replay::ReplayEngine`] plays back.

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CLIENT_PROTOCOL, FeedConfig};
use crate::error::{FeedError, Result};
use crate::wire::{NormalizedMessage, parse_frame};

/// Result of a successful negotiation handshake.
#[derive(Debug, Clone)]
pub struct Negotiation {
    /// Fully parameterized websocket connect URL.
    pub websocket_url: Url,
    /// Session cookie to present during the websocket handshake.
    pub cookie: Option<String>,
}

/// How a live connection ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// The remote end closed the connection.
    Closed,
    /// A stop request ended the connection.
    Stopped,
}

fn connection_data(hub: &str) -> String {
    json!([{"name": hub}]).to_string()
}

fn build_negotiate_url(config: &FeedConfig) -> Result<Url> {
    Url::parse_with_params(
        &format!("{}/negotiate", config.negotiate_url),
        &[
            ("connectionData", connection_data(&config.hub).as_str()),
            ("clientProtocol", CLIENT_PROTOCOL),
        ],
    )
    .map_err(|e| FeedError::negotiation_failed(format!("bad negotiate url: {e}")))
}

fn build_websocket_url(config: &FeedConfig, connection_token: &str) -> Result<Url> {
    Url::parse_with_params(
        &format!("{}/connect", config.websocket_url),
        &[
            ("transport", "webSockets"),
            ("connectionToken", connection_token),
            ("connectionData", connection_data(&config.hub).as_str()),
            ("clientProtocol", CLIENT_PROTOCOL),
        ],
    )
    .map_err(|e| FeedError::negotiation_failed(format!("bad websocket url: {e}")))
}

fn collect_cookies(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let cookies: Vec<&str> = headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .collect();
    if cookies.is_empty() { None } else { Some(cookies.join("; ")) }
}

/// Performs the negotiation handshake against the feed endpoint.
pub async fn negotiate(client: &reqwest::Client, config: &FeedConfig) -> Result<Negotiation> {
    let url = build_negotiate_url(config)?;
    debug!(%url, "negotiating");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FeedError::negotiation_failed_with_source("request failed", Box::new(e)))?;
    if !response.status().is_success() {
        return Err(FeedError::negotiation_failed(format!(
            "unexpected status {}",
            response.status()
        )));
    }

    let cookie = collect_cookies(response.headers());
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| FeedError::negotiation_failed_with_source("bad response body", Box::new(e)))?;
    let token = body
        .get("ConnectionToken")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FeedError::negotiation_failed("response missing ConnectionToken"))?;

    Ok(Negotiation {
        websocket_url: build_websocket_url(config, token)?,
        cookie,
    })
}

/// Appends raw frames to a recording file in replay format.
struct Recorder {
    file: tokio::fs::File,
}

impl Recorder {
    async fn create(path: &std::path::Path) -> Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| FeedError::file_error(path.to_path_buf(), e))?;
        let header = format!("# recording started {}\n", chrono::Utc::now().to_rfc3339());
        file.write_all(header.as_bytes())
            .await
            .map_err(|e| FeedError::file_error(path.to_path_buf(), e))?;
        Ok(Recorder { file })
    }

    async fn record(&mut self, line: &str) {
        if let Err(err) = self
            .file
            .write_all(format!("{line}\n").as_bytes())
            .await
        {
            warn!(error = %err, "recording write failed");
        }
    }

    async fn finish(mut self) {
        let footer = format!("# recording ended {}\n", chrono::Utc::now().to_rfc3339());
        if let Err(err) = self.file.write_all(footer.as_bytes()).await {
            warn!(error = %err, "recording footer write failed");
        }
    }
}

/// Owns one live connection from negotiation to close.
pub struct LiveConnector {
    config: FeedConfig,
    cancel: CancellationToken,
}

impl LiveConnector {
    pub fn new(config: FeedConfig, cancel: CancellationToken) -> Self {
        LiveConnector { config, cancel }
    }

    /// Connects, subscribes, and pumps frames into the queue until the
    /// connection closes or a stop is requested.
    pub async fn run(self, queue: mpsc::Sender<NormalizedMessage>) -> Result<LiveOutcome> {
        self.connect().await?.pump(queue).await
    }

    /// Negotiates, opens the socket, and subscribes. Errors before this
    /// returns mean the feed was never reached.
    pub async fn connect(self) -> Result<ConnectedFeed> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| FeedError::negotiation_failed_with_source("http client", Box::new(e)))?;
        let negotiation = negotiate(&client, &self.config).await?;

        let mut request = negotiation
            .websocket_url
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::socket_error_with_source("bad request", Box::new(e)))?;
        let headers = request.headers_mut();
        headers.insert(
            "User-Agent",
            "BestHTTP".parse().map_err(|_| FeedError::socket_error("bad header"))?,
        );
        headers.insert(
            "Accept-Encoding",
            "gzip,identity".parse().map_err(|_| FeedError::socket_error("bad header"))?,
        );
        if let Some(cookie) = &negotiation.cookie {
            headers.insert(
                "Cookie",
                cookie
                    .parse()
                    .map_err(|_| FeedError::socket_error("bad cookie header"))?,
            );
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| FeedError::socket_error_with_source("connect failed", Box::new(e)))?;
        info!("live feed connected");
        let (mut sink, stream) = socket.split();

        let subscribe = json!({
            "H": self.config.hub,
            "M": "Subscribe",
            "A": [self.config.streams],
            "I": 1,
        })
        .to_string();
        sink.send(Message::text(subscribe))
            .await
            .map_err(|e| FeedError::socket_error_with_source("subscribe failed", Box::new(e)))?;

        let recorder = match &self.config.record_to {
            Some(path) => Some(Recorder::create(path).await?),
            None => None,
        };

        Ok(ConnectedFeed { sink, stream, recorder, cancel: self.cancel })
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// A live connection past its handshake, ready to pump frames.
pub struct ConnectedFeed {
    sink: futures::stream::SplitSink<WsStream, Message>,
    stream: futures::stream::SplitStream<WsStream>,
    recorder: Option<Recorder>,
    cancel: CancellationToken,
}

impl ConnectedFeed {
    /// Reads frames into the queue until close, error, or stop request.
    pub async fn pump(self, queue: mpsc::Sender<NormalizedMessage>) -> Result<LiveOutcome> {
        let ConnectedFeed { mut sink, mut stream, mut recorder, cancel } = self;
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    info!("live feed stopped by request");
                    break LiveOutcome::Stopped;
                }
                received = stream.next() => {
                    match received {
                        None => {
                            warn!("live feed stream ended");
                            break LiveOutcome::Closed;
                        }
                        Some(Err(err)) => {
                            if let Some(rec) = recorder.take() {
                                rec.finish().await;
                            }
                            return Err(FeedError::socket_error_with_source(
                                "read failed",
                                Box::new(err),
                            ));
                        }
                        Some(Ok(Message::Text(text))) => {
                            if let Some(rec) = recorder.as_mut() {
                                rec.record(text.as_str()).await;
                            }
                            if !forward_frame(text.as_str(), &queue) {
                                break LiveOutcome::Stopped;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "live feed closed by remote");
                            break LiveOutcome::Closed;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        };

        if let Some(rec) = recorder.take() {
            rec.finish().await;
        }
        Ok(outcome)
    }
}

/// Parses one raw text frame and enqueues its messages. Returns false when
/// the queue has closed, which means the consumer is gone.
fn forward_frame(text: &str, queue: &mpsc::Sender<NormalizedMessage>) -> bool {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "non-JSON frame from live feed, skipping");
            return true;
        }
    };
    for message in parse_frame(&raw).messages {
        match queue.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(stream = %message.stream, "queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_url_carries_protocol_and_hub() {
        let config = FeedConfig::default();
        let url = build_negotiate_url(&config).unwrap();
        assert!(url.path().ends_with("/negotiate"));
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(query.iter().any(|(k, v)| k == "clientProtocol" && v == "1.5"));
        assert!(
            query
                .iter()
                .any(|(k, v)| k == "connectionData" && v.contains("Streaming"))
        );
    }

    #[test]
    fn websocket_url_carries_token_and_transport() {
        let config = FeedConfig::default();
        let url = build_websocket_url(&config, "abc+/123=").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(url.path().ends_with("/connect"));
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "connectionToken")
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_eq!(token, "abc+/123=");
        assert!(url.query_pairs().any(|(k, v)| k == "transport" && v == "webSockets"));
    }

    #[test]
    fn cookie_collection_strips_attributes() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            "GCLB=abc123; path=/; HttpOnly".parse().unwrap(),
        );
        headers.append(reqwest::header::SET_COOKIE, "other=1".parse().unwrap());
        assert_eq!(collect_cookies(&headers).as_deref(), Some("GCLB=abc123; other=1"));

        assert!(collect_cookies(&reqwest::header::HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn forward_frame_tolerates_garbage_and_overflow() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward_frame("not json", &tx));
        assert!(forward_frame(
            r#"{"M": [
                {"M": "feed", "A": ["TrackStatus", {"Status": "1"}, "2024-03-02T15:00:00Z"]},
                {"M": "feed", "A": ["WeatherData", {"AirTemp": "20"}, "2024-03-02T15:00:00Z"]}
            ]}"#,
            &tx,
        ));
        // Capacity one: the second message was dropped, not blocked on.
        assert_eq!(rx.try_recv().unwrap().stream, "TrackStatus");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_frame_reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!forward_frame(
            r#"{"M": [{"M": "feed", "A": ["TrackStatus", {}, "2024-03-02T15:00:00Z"]}]}"#,
            &tx,
        ));
    }

    #[tokio::test]
    async fn recorder_writes_header_lines_and_footer() {
        let path = std::env::temp_dir().join(format!(
            "recording-test-{}-{}.txt",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut recorder = Recorder::create(&path).await.unwrap();
        recorder.record(r#"{"M": []}"#).await;
        recorder.finish().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# recording started"));
        assert_eq!(lines[1], r#"{"M": []}"#);
        assert!(lines[2].starts_with("# recording ended"));
        std::fs::remove_file(path).ok();
    }
}
