//! # Realtime Transport Connector
//!
//! Opens the WebSocket to the AI service and bridges it onto a `Link`. The
//! connector is a trait so the bridge can be driven by a scripted peer in
//! tests.
//!
//! ## Connection tasks:
//! - **writer**: forwards link text to the socket; when the adapter drops its
//!   sender the socket is closed
//! - **reader**: forwards socket text to the link; a close frame or read error
//!   ends it, which the adapter sees as `recv()` returning `None`

use crate::error::{BridgeError, BridgeResult};
use crate::transport::Link;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub trait RealtimeConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, BridgeResult<Link>>;
}

/// Bounded exponential backoff for connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }
}

/// Try to connect up to `policy.attempts` times.
pub async fn connect_with_retry(
    connector: &dyn RealtimeConnector,
    policy: &RetryPolicy,
    call_id: &str,
) -> BridgeResult<Link> {
    for attempt in 1..=policy.attempts {
        match connector.connect().await {
            Ok(link) => {
                info!(call_id, attempt, "AI transport connected");
                return Ok(link);
            }
            Err(err) => {
                warn!(call_id, attempt, max_attempts = policy.attempts, error = %err, "AI transport connect failed");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }
    Err(BridgeError::AiUnavailable {
        attempts: policy.attempts,
    })
}

/// Connects to the realtime service over TLS WebSocket.
pub struct WsConnector {
    url: String,
    api_key: Option<String>,
}

impl WsConnector {
    pub fn new(url: &str, model: &str, api_key: Option<String>) -> Self {
        let separator = if url.contains('?') { '&' } else { '?' };
        Self {
            url: format!("{}{}model={}", url, separator, model),
            api_key,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> BridgeResult<Link> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        if let Some(key) = &self.api_key {
            let auth = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| BridgeError::Connect(format!("invalid API key header: {}", e)))?;
            let headers = request.headers_mut();
            headers.insert("Authorization", auth);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "Realtime WebSocket handshake complete");

        let (mut sink, mut stream) = socket.split();
        let (adapter_end, socket_end) = Link::pair();
        let (to_adapter, mut from_adapter) = socket_end.split();

        tokio::spawn(async move {
            while let Some(text) = from_adapter.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(error = %err, "Realtime socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if to_adapter.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "Realtime socket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "Realtime socket read failed");
                        break;
                    }
                }
            }
        });

        Ok(adapter_end)
    }
}

impl RealtimeConnector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, BridgeResult<Link>> {
        Box::pin(self.open())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedConnector;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(40), Duration::from_millis(4000));
    }

    #[test]
    fn test_model_appended_to_url() {
        let connector = WsConnector::new("wss://api.example.com/v1/realtime", "m1", None);
        assert_eq!(connector.url(), "wss://api.example.com/v1/realtime?model=m1");
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let (connector, mut peers) = ScriptedConnector::new(2);
        let link = connect_with_retry(&connector, &fast_policy(3), "CA1").await;
        assert!(link.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(peers.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let (connector, _peers) = ScriptedConnector::new(5);
        let err = connect_with_retry(&connector, &fast_policy(3), "CA1").await.unwrap_err();
        assert_eq!(err, BridgeError::AiUnavailable { attempts: 3 });
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }
}
