//! Channel sender abstraction and the HTTP gateway implementation.
//!
//! The pipeline never talks to a mail or SMS provider directly; it hands
//! rendered notifications to a channel gateway over HTTP and classifies the
//! outcome for the retry policy. Timeouts, connection failures, and 5xx/429
//! responses are transient; other 4xx responses are permanent rejections.

use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use courier_core::SendAck;

use crate::error::{PipelineError, Result};

/// A rendered notification ready for the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    /// Destination address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Outbound transport abstraction.
///
/// Implementations perform the physical send and classify failures into the
/// pipeline taxonomy so the worker can decide on retries.
pub trait ChannelSender: Send + Sync + 'static {
    /// Sends one notification, returning the provider acknowledgement.
    fn send(
        &self,
        outbound: Outbound,
    ) -> Pin<Box<dyn Future<Output = Result<SendAck>> + Send + '_>>;
}

/// Configuration for the HTTP channel gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway endpoint receiving outbound notifications.
    pub url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8090/send".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "Courier-Notification-Pipeline/1.0".to_string(),
        }
    }
}

/// Acknowledgement body returned by the gateway on success.
#[derive(Debug, Deserialize)]
struct GatewayAck {
    message_id: String,
    #[serde(default)]
    response: Option<String>,
}

/// Channel sender that posts notifications to an HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpGatewaySender {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGatewaySender {
    /// Creates a new gateway sender with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                PipelineError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    async fn send_inner(&self, outbound: Outbound) -> Result<SendAck> {
        let response = match self.client.post(&self.config.url).json(&outbound).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    return Err(PipelineError::transient(format!(
                        "gateway timeout after {}s",
                        self.config.timeout.as_secs()
                    )));
                }
                if e.is_connect() {
                    return Err(PipelineError::transient(format!("connection failed: {e}")));
                }
                return Err(PipelineError::transient(e.to_string()));
            },
        };

        let status = response.status();
        if status.is_success() {
            return parse_ack(response).await;
        }

        let body = truncated_body(response).await;
        if status.as_u16() == 429 || status.is_server_error() {
            Err(PipelineError::transient(format!("gateway returned {status}: {body}")))
        } else {
            Err(PipelineError::permanent(format!("gateway rejected send ({status}): {body}")))
        }
    }
}

/// Parses the gateway acknowledgement, tolerating non-JSON bodies.
async fn parse_ack(response: reqwest::Response) -> Result<SendAck> {
    let body = truncated_body(response).await;

    match serde_json::from_str::<GatewayAck>(&body) {
        Ok(ack) => Ok(SendAck { message_id: ack.message_id, provider_response: ack.response }),
        Err(_) => Ok(SendAck {
            message_id: format!("gw-{}", Uuid::new_v4()),
            provider_response: Some(body),
        }),
    }
}

/// Reads a response body, truncating oversized payloads for audit storage.
async fn truncated_body(response: reqwest::Response) -> String {
    const MAX_AUDIT_SIZE: usize = 1024;

    match response.bytes().await {
        Ok(bytes) => {
            if bytes.len() > MAX_AUDIT_SIZE {
                let suffix = "... (truncated)";
                let max_content = MAX_AUDIT_SIZE - suffix.len();
                let truncated = String::from_utf8_lossy(&bytes[..max_content]);
                format!("{truncated}{suffix}")
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        },
        Err(e) => format!("[Failed to read response body: {e}]"),
    }
}

impl ChannelSender for HttpGatewaySender {
    fn send(
        &self,
        outbound: Outbound,
    ) -> Pin<Box<dyn Future<Output = Result<SendAck>> + Send + '_>> {
        let span = info_span!("channel_send", to = %outbound.to, subject = %outbound.subject);
        Box::pin(self.send_inner(outbound).instrument(span))
    }
}

pub mod mock {
    //! Channel sender test double with scripted outcomes.

    use std::{
        collections::{HashMap, VecDeque},
        future::Future,
        pin::Pin,
        sync::Arc,
    };

    use tokio::sync::Mutex;

    use courier_core::SendAck;

    use super::{ChannelSender, Outbound};
    use crate::error::{PipelineError, Result};

    /// Scripted result for one send invocation.
    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        /// The send succeeds.
        Success,
        /// The send fails with a transient channel error.
        Transient(String),
        /// The send fails with a permanent channel error.
        Permanent(String),
    }

    /// Mock channel sender recording invocations and serving scripted
    /// outcomes.
    ///
    /// Destination overrides take precedence, then the FIFO script, then a
    /// default success.
    pub struct MockChannelSender {
        invocations: Arc<Mutex<Vec<Outbound>>>,
        script: Arc<Mutex<VecDeque<MockOutcome>>>,
        destination_outcomes: Arc<Mutex<HashMap<String, MockOutcome>>>,
    }

    impl MockChannelSender {
        /// Creates a sender that succeeds by default.
        pub fn new() -> Self {
            Self {
                invocations: Arc::new(Mutex::new(Vec::new())),
                script: Arc::new(Mutex::new(VecDeque::new())),
                destination_outcomes: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Queues an outcome for the next unscripted invocation.
        pub async fn push_outcome(&self, outcome: MockOutcome) {
            self.script.lock().await.push_back(outcome);
        }

        /// Pins an outcome to every send for a destination.
        pub async fn set_destination_outcome(
            &self,
            destination: impl Into<String>,
            outcome: MockOutcome,
        ) {
            self.destination_outcomes.lock().await.insert(destination.into(), outcome);
        }

        /// All recorded invocations, in send order.
        pub async fn invocations(&self) -> Vec<Outbound> {
            self.invocations.lock().await.clone()
        }

        /// Number of send invocations so far.
        pub async fn send_count(&self) -> usize {
            self.invocations.lock().await.len()
        }
    }

    impl Default for MockChannelSender {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ChannelSender for MockChannelSender {
        fn send(
            &self,
            outbound: Outbound,
        ) -> Pin<Box<dyn Future<Output = Result<SendAck>> + Send + '_>> {
            let invocations = self.invocations.clone();
            let script = self.script.clone();
            let destination_outcomes = self.destination_outcomes.clone();
            Box::pin(async move {
                let mut invocations = invocations.lock().await;
                invocations.push(outbound.clone());
                let sequence = invocations.len();
                drop(invocations);

                let outcome = {
                    let overrides = destination_outcomes.lock().await;
                    match overrides.get(&outbound.to) {
                        Some(outcome) => outcome.clone(),
                        None => script
                            .lock()
                            .await
                            .pop_front()
                            .unwrap_or(MockOutcome::Success),
                    }
                };

                match outcome {
                    MockOutcome::Success => Ok(SendAck {
                        message_id: format!("mock-{sequence}"),
                        provider_response: Some("250 OK".to_string()),
                    }),
                    MockOutcome::Transient(reason) => Err(PipelineError::transient(reason)),
                    MockOutcome::Permanent(reason) => Err(PipelineError::permanent(reason)),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn outbound() -> Outbound {
        Outbound {
            to: "a@b.com".to_string(),
            subject: "hello".to_string(),
            body: "world".to_string(),
        }
    }

    async fn sender_for(server: &MockServer) -> HttpGatewaySender {
        HttpGatewaySender::new(GatewayConfig {
            url: format!("{}/send", server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn successful_send_returns_gateway_ack() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/send"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"message_id": "msg-123", "response": "250 queued"}"#,
            ))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let ack = sender.send(outbound()).await.unwrap();

        assert_eq!(ack.message_id, "msg-123");
        assert_eq!(ack.provider_response.as_deref(), Some("250 queued"));
    }

    #[tokio::test]
    async fn non_json_ack_still_succeeds() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let ack = sender.send(outbound()).await.unwrap();

        assert!(ack.message_id.starts_with("gw-"));
        assert_eq!(ack.provider_response.as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let err = sender.send(outbound()).await.unwrap_err();

        assert!(err.is_retryable(), "5xx must be retryable, got: {err}");
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let err = sender.send(outbound()).await.unwrap_err();

        assert!(err.is_retryable(), "429 must be retryable, got: {err}");
    }

    #[tokio::test]
    async fn client_rejection_is_permanent() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad address"))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let err = sender.send(outbound()).await.unwrap_err();

        assert!(!err.is_retryable(), "4xx must not be retryable, got: {err}");
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        // Port 1 is reserved and nothing listens there.
        let sender = HttpGatewaySender::new(GatewayConfig {
            url: "http://127.0.0.1:1/send".to_string(),
            timeout: std::time::Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let err = sender.send(outbound()).await.unwrap_err();
        assert!(err.is_retryable(), "connect failure must be retryable, got: {err}");
    }

    #[tokio::test]
    async fn mock_sender_scripts_outcomes_in_order() {
        let sender = mock::MockChannelSender::new();
        sender.push_outcome(mock::MockOutcome::Transient("timeout".to_string())).await;

        let err = sender.send(outbound()).await.unwrap_err();
        assert!(err.is_retryable());

        let ack = sender.send(outbound()).await.unwrap();
        assert_eq!(ack.message_id, "mock-2");
        assert_eq!(sender.send_count().await, 2);
    }
}
