//! Vendor-neutral HTTP relay transport.
//!
//! Webhooks POST the rendered message to the recipient's URL. Email, SMS and
//! push POST `{channel, address, subject, body, attachments}` to a configured
//! relay endpoint. An email relay may answer with an SMTP reply code
//! (`{"smtp_code": 550, "message": "..."}`), which takes precedence over the
//! HTTP status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TransportConfig;
use crate::notification::ChannelKind;
use crate::template::{RenderedAttachment, RenderedContent};

use super::{classify_http_status, classify_smtp_reply, ChannelTransport, SendOutcome};

const MAX_DETAIL_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum HttpRelayError {
    #[error("No relay endpoint configured for {0}")]
    MissingEndpoint(ChannelKind),

    #[error("Invalid relay endpoint {0}")]
    InvalidEndpoint(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct RelayPayload<'a> {
    channel: ChannelKind,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    body: &'a str,
    #[serde(skip_serializing_if = "no_attachments")]
    attachments: &'a [RenderedAttachment],
}

fn no_attachments(attachments: &&[RenderedAttachment]) -> bool {
    attachments.is_empty()
}

#[derive(Debug, Default, Deserialize)]
struct RelayReply {
    #[serde(default)]
    smtp_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpRelayTransport {
    kind: ChannelKind,
    client: Client,
    endpoint: Option<Url>,
    auth_token: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(
        kind: ChannelKind,
        endpoint: Option<Url>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HttpRelayError> {
        if endpoint.is_none() && kind != ChannelKind::Webhook {
            return Err(HttpRelayError::MissingEndpoint(kind));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            kind,
            client,
            endpoint,
            auth_token,
        })
    }

    pub fn from_config(
        kind: ChannelKind,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Self, HttpRelayError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(|e| Url::parse(e).map_err(|_| HttpRelayError::InvalidEndpoint(e.to_string())))
            .transpose()?;
        Self::new(kind, endpoint, config.auth_token.clone(), timeout)
    }

    fn target_url(&self, address: &str) -> Result<Url, SendOutcome> {
        if self.kind == ChannelKind::Webhook {
            let url = Url::parse(address)
                .map_err(|e| SendOutcome::PermanentFailed(format!("invalid webhook url: {}", e)))?;
            return match url.scheme() {
                "http" | "https" => Ok(url),
                other => Err(SendOutcome::PermanentFailed(format!(
                    "unsupported webhook scheme: {}",
                    other
                ))),
            };
        }
        self.endpoint
            .clone()
            .ok_or_else(|| SendOutcome::PermanentFailed(format!("no relay endpoint for {}", self.kind)))
    }

    fn classify_error(&self, error: &reqwest::Error) -> SendOutcome {
        if error.is_builder() {
            SendOutcome::PermanentFailed(format!("request rejected: {}", error))
        } else {
            // Timeouts, refused connections and resets may all clear up
            SendOutcome::TransientFailed(format!("request failed: {}", error))
        }
    }
}

#[async_trait]
impl ChannelTransport for HttpRelayTransport {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, address: &str, content: &RenderedContent) -> SendOutcome {
        let url = match self.target_url(address) {
            Ok(url) => url,
            Err(outcome) => return outcome,
        };

        let payload = RelayPayload {
            channel: self.kind,
            address,
            subject: content.subject.as_deref(),
            body: &content.body,
            attachments: &content.attachments,
        };

        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(channel = %self.kind, error = %e, "Relay request failed");
                return self.classify_error(&e);
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let reply: RelayReply = serde_json::from_str(&body).unwrap_or_default();
        let mut detail = reply.message.unwrap_or(body);
        if detail.len() > MAX_DETAIL_LEN {
            let mut cut = MAX_DETAIL_LEN;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }

        match (self.kind, reply.smtp_code) {
            (ChannelKind::Email, Some(code)) => classify_smtp_reply(code, &detail),
            _ => classify_http_status(self.kind, status, detail.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one request with a canned response, returning the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{}/hook", addr), handle)
    }

    #[tokio::test]
    async fn test_webhook_posts_to_address() {
        let (url, server) = serve_once(
            "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport =
            HttpRelayTransport::new(ChannelKind::Webhook, None, Some("secret".into()), Duration::from_secs(5))
                .unwrap();

        let outcome = transport
            .send(&url, &RenderedContent::text("order shipped"))
            .await;
        assert_eq!(outcome, SendOutcome::Succeeded);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("\"body\":\"order shipped\""));
    }

    #[tokio::test]
    async fn test_email_relay_smtp_code_wins() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 43\r\nConnection: close\r\n\r\n{\"smtp_code\":452,\"message\":\"mailbox full.\"}",
        )
        .await;
        let transport = HttpRelayTransport::new(
            ChannelKind::Email,
            Some(Url::parse(&url).unwrap()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let outcome = transport
            .send("a@example.com", &RenderedContent::text("hi"))
            .await;
        assert_eq!(
            outcome,
            SendOutcome::TransientFailed("SMTP 452 mailbox full.".into())
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpRelayTransport::new(
            ChannelKind::Sms,
            Some(Url::parse(&format!("http://{}/sms", addr)).unwrap()),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let outcome = transport.send("+15550100", &RenderedContent::text("hi")).await;
        assert!(matches!(outcome, SendOutcome::TransientFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_webhook_address_is_permanent() {
        let transport =
            HttpRelayTransport::new(ChannelKind::Webhook, None, None, Duration::from_secs(1)).unwrap();
        let content = RenderedContent::text("hi");

        assert!(matches!(
            transport.send("not a url", &content).await,
            SendOutcome::PermanentFailed(_)
        ));
        assert!(matches!(
            transport.send("ftp://example.com/hook", &content).await,
            SendOutcome::PermanentFailed(_)
        ));
    }

    #[test]
    fn test_relay_channels_require_endpoint() {
        let err = HttpRelayTransport::new(ChannelKind::Push, None, None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, HttpRelayError::MissingEndpoint(ChannelKind::Push)));

        let config = TransportConfig {
            endpoint: Some("::bad::".into()),
            ..TransportConfig::default()
        };
        assert!(matches!(
            HttpRelayTransport::from_config(ChannelKind::Sms, &config, Duration::from_secs(1)),
            Err(HttpRelayError::InvalidEndpoint(_))
        ));
    }
}
