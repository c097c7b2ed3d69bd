//! SMS sender — JSON POST to an HTTP gateway with a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::ChannelError;
use crate::notify::MessageSender;

/// Ceiling on one gateway exchange, in seconds.
pub const DEFAULT_SMS_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub token: SecretString,
    pub from_number: String,
    /// Request plus response body; a gateway slower than this is a send failure.
    pub timeout: Duration,
}

impl SmsConfig {
    /// Returns `None` if `SMS_GATEWAY_URL` is not set (SMS disabled).
    pub fn from_env() -> Option<Self> {
        let gateway_url = std::env::var("SMS_GATEWAY_URL").ok()?;
        let token = SecretString::from(std::env::var("SMS_GATEWAY_TOKEN").unwrap_or_default());
        let from_number = std::env::var("SMS_FROM_NUMBER").unwrap_or_default();
        let timeout_secs = std::env::var("SMS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_SMS_TIMEOUT_SECS);
        Some(Self {
            gateway_url,
            token,
            from_number,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[derive(Serialize)]
struct OutgoingSms<'a> {
    from: &'a str,
    to: &'a str,
    body: &'a str,
}

pub struct HttpSmsSender {
    config: SmsConfig,
    client: reqwest::Client,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, payload: &OutgoingSms<'_>) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.config.gateway_url)
            .bearer_auth(self.config.token.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "sms".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "sms".into(),
                reason: format!("gateway returned {status}: {detail}"),
            });
        }
        Ok(())
    }
}

/// Loose E.164 check: optional `+`, then 7 to 15 digits.
fn is_dialable(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[async_trait]
impl MessageSender for HttpSmsSender {
    async fn send_email(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), ChannelError> {
        Err(ChannelError::NotConfigured {
            name: "email".into(),
        })
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        if !is_dialable(to) {
            return Err(ChannelError::InvalidRecipient {
                name: "sms".into(),
                recipient: to.to_string(),
            });
        }

        let payload = OutgoingSms {
            from: &self.config.from_number,
            to,
            body,
        };

        tokio::time::timeout(self.config.timeout, self.post(&payload))
            .await
            .map_err(|_| ChannelError::SendFailed {
                name: "sms".into(),
                reason: format!(
                    "gateway did not respond within {}ms",
                    self.config.timeout.as_millis()
                ),
            })??;

        tracing::info!(to = %to, "Text message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    use super::*;

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn capture(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.lock().unwrap().push((auth, body));
        StatusCode::ACCEPTED
    }

    async fn start_gateway(status_ok: bool) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = if status_ok {
            Router::new()
                .route("/send", post(capture))
                .with_state(Arc::clone(&captured))
        } else {
            Router::new().route("/send", post(|| async { StatusCode::BAD_GATEWAY }))
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{port}/send"), captured)
    }

    fn sender(url: String) -> HttpSmsSender {
        HttpSmsSender::new(SmsConfig {
            gateway_url: url,
            token: SecretString::from("gw-token"),
            from_number: "+15550000".into(),
            timeout: Duration::from_secs(DEFAULT_SMS_TIMEOUT_SECS),
        })
    }

    #[test]
    fn dialable_numbers() {
        assert!(is_dialable("+15550100"));
        assert!(is_dialable("4915112345678"));
        assert!(!is_dialable("555-0100"));
        assert!(!is_dialable("+12"));
        assert!(!is_dialable(""));
    }

    #[tokio::test]
    async fn posts_json_with_bearer_token() {
        let (url, captured) = start_gateway(true).await;
        sender(url).send_text("+15550100", "Hi there").await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (auth, body) = &captured[0];
        assert_eq!(auth.as_deref(), Some("Bearer gw-token"));
        assert_eq!(body["to"], "+15550100");
        assert_eq!(body["from"], "+15550000");
        assert_eq!(body["body"], "Hi there");
    }

    #[tokio::test]
    async fn gateway_error_is_send_failure() {
        let (url, _captured) = start_gateway(false).await;
        let err = sender(url).send_text("+15550100", "Hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed { .. }));
    }

    #[tokio::test]
    async fn rejects_undialable_recipient() {
        let err = sender("http://127.0.0.1:9/send".into())
            .send_text("call me", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidRecipient { .. }));
    }

    #[tokio::test]
    async fn hung_gateway_times_out() {
        let app = Router::new().route(
            "/send",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::ACCEPTED
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sender = HttpSmsSender::new(SmsConfig {
            gateway_url: format!("http://127.0.0.1:{port}/send"),
            token: SecretString::from("gw-token"),
            from_number: "+15550000".into(),
            timeout: Duration::from_millis(200),
        });

        let started = std::time::Instant::now();
        let err = sender.send_text("+15550100", "Hi").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            ChannelError::SendFailed { reason, .. } => assert!(reason.contains("did not respond")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
