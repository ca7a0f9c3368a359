//! HTTP publisher for the device API
//!
//! Posts to `{server}/api/v1/{key}/telemetry` and `.../attributes`.

use super::{Payload, Publisher};
use crate::error::{CloudError, CloudResult};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Proxy, StatusCode};
use tbmon_core::config::ConnectionSettings;
use tracing::{debug, error, info, warn};
use url::Url;

/// Longest server message kept in an error
const MAX_ERROR_BODY: usize = 200;

/// HTTP publisher
pub struct HttpPublisher {
    client: Client,
    base_url: Url,
}

impl HttpPublisher {
    /// Create a new publisher.
    ///
    /// Proxy selection happens here, once: with `proxy.enabled` the configured
    /// proxies are installed, otherwise the client never uses a proxy, not even
    /// one from the environment.
    pub fn new(settings: &ConnectionSettings) -> CloudResult<Self> {
        let mut builder = Client::builder()
            .timeout(settings.timeout())
            .user_agent(format!("tbmon/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true);

        if settings.proxy.enabled {
            if let Some(http) = &settings.proxy.http {
                builder = builder.proxy(Proxy::http(http)?);
            }
            if let Some(https) = &settings.proxy.https {
                builder = builder.proxy(Proxy::https(https)?);
            }
            info!("Publishing through configured proxy");
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| CloudError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: Self::parse_base(&settings.server)?,
        })
    }

    /// Parse the server setting, assuming `http://` when no scheme is given
    fn parse_base(server: &str) -> CloudResult<Url> {
        let server = server.trim();
        let url = if server.contains("://") {
            Url::parse(server)?
        } else {
            Url::parse(&format!("http://{}", server))?
        };

        if url.cannot_be_a_base() {
            return Err(CloudError::Config(format!(
                "server URL cannot be used as a base: {}",
                server
            )));
        }
        Ok(url)
    }

    /// Device API endpoint for a key and payload kind
    fn endpoint(&self, key: &str, payload: &Payload<'_>) -> CloudResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CloudError::Config("server URL cannot be used as a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", key, payload.endpoint()]);
        Ok(url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Map a response to success or a classified error
    async fn handle_response(&self, response: reqwest::Response) -> CloudResult<()> {
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let message = Self::error_body(response).await;
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                warn!("Server asked to retry later ({})", status);
                Err(CloudError::server(status.as_u16(), message))
            }
            _ if status.is_server_error() => {
                error!("Server error {}: {}", status, message);
                Err(CloudError::server(status.as_u16(), message))
            }
            _ if status.is_client_error() => Err(CloudError::rejected(status.as_u16(), message)),
            _ => Err(CloudError::server(status.as_u16(), message)),
        }
    }

    async fn error_body(response: reqwest::Response) -> String {
        let status = response.status();
        match response.text().await {
            Ok(body) if !body.trim().is_empty() => {
                let mut body = body.trim().to_string();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                body
            }
            _ => status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string(),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn send(&self, key: &str, payload: Payload<'_>) -> CloudResult<()> {
        let url = self.endpoint(key, &payload)?;
        let body = serde_json::to_vec(&payload.body())?;

        debug!("POST {} payload ({} bytes)", payload.endpoint(), body.len());

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tbmon_core::config::ProxySettings;
    use tbmon_core::{AttributeSet, Reading};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &str) -> ConnectionSettings {
        ConnectionSettings {
            server: server.to_string(),
            timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_scheme_defaults_to_http() {
        let publisher = HttpPublisher::new(&settings("tb.local:8080")).unwrap();
        assert_eq!(publisher.base_url().as_str(), "http://tb.local:8080/");
    }

    #[test]
    fn test_endpoint_escapes_key() {
        let publisher = HttpPublisher::new(&settings("https://tb.example.com/")).unwrap();
        let reading = Reading::new();
        let url = publisher
            .endpoint("A1 B2?", &Payload::Telemetry(&reading))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://tb.example.com/api/v1/A1%20B2%3F/telemetry"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let publisher = HttpPublisher::new(&settings("https://example.com/tb")).unwrap();
        let attributes = AttributeSet::new();
        let url = publisher
            .endpoint("KEY", &Payload::Attributes(&attributes))
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/tb/api/v1/KEY/attributes");
    }

    #[test]
    fn test_proxy_enabled_builds() {
        let mut s = settings("http://tb.local");
        s.proxy = ProxySettings {
            enabled: true,
            http: Some("http://proxy.local:3128".to_string()),
            https: Some("http://proxy.local:3129".to_string()),
        };
        assert!(HttpPublisher::new(&s).is_ok());
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let mut s = settings("http://tb.local");
        s.proxy = ProxySettings {
            enabled: true,
            http: Some("not a url".to_string()),
            https: None,
        };
        assert!(matches!(
            HttpPublisher::new(&s),
            Err(CloudError::Config(_))
        ));
    }

    #[test]
    fn test_disabled_proxy_ignores_urls() {
        let mut s = settings("http://tb.local");
        s.proxy = ProxySettings {
            enabled: false,
            http: Some("not a url".to_string()),
            https: None,
        };
        assert!(HttpPublisher::new(&s).is_ok());
    }

    #[tokio::test]
    async fn test_send_telemetry() {
        let server = MockServer::start().await;
        let reading = Reading::new().with_value("temp", 72);

        Mock::given(method("POST"))
            .and(path("/api/v1/DEVICE_KEY/telemetry"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "ts": reading.timestamp_millis(),
                "values": {"temp": 72}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        publisher
            .send("DEVICE_KEY", Payload::Telemetry(&reading))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_attributes() {
        let server = MockServer::start().await;
        let mut attributes = AttributeSet::new();
        attributes.insert("location".to_string(), json!("Hometown"));

        Mock::given(method("POST"))
            .and(path("/api/v1/DEVICE_KEY/attributes"))
            .and(body_json(json!({"location": "Hometown"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        publisher
            .send("DEVICE_KEY", Payload::Attributes(&attributes))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid device token"))
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        let err = publisher
            .send("BAD", Payload::Telemetry(&Reading::new()))
            .await
            .unwrap_err();

        match err {
            CloudError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid device token");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        let err = publisher
            .send("KEY", Payload::Telemetry(&Reading::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, CloudError::Server { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        let err = publisher
            .send("KEY", Payload::Telemetry(&Reading::new()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let publisher = HttpPublisher::new(&settings(&server.uri())).unwrap();
        let err = publisher
            .send("KEY", Payload::Telemetry(&Reading::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Timeout));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let publisher = HttpPublisher::new(&settings("http://127.0.0.1:1")).unwrap();
        let err = publisher
            .send("KEY", Payload::Telemetry(&Reading::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Unreachable(_)));
        assert!(err.is_retryable());
    }
}
