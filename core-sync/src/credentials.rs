//! Exchange of download tokens for signed URLs.

use async_trait::async_trait;
use bridge_traits::http::HttpRequest;
use bridge_traits::HttpClient;
use core_runtime::logging::redact_url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};
use crate::models::DownloadToken;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve a token into a time-boxed URL for the file's bytes.
    async fn signed_url(&self, token: &DownloadToken) -> Result<String>;
}

/// Posts the token to the origin's credential endpoint.
///
/// The endpoint answers `{"url": "<signed url>"}`.
pub struct HttpCredentialProvider {
    http: Arc<dyn HttpClient>,
    endpoint: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: String,
}

impl HttpCredentialProvider {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(http: Arc<dyn HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    #[instrument(skip(self, token), fields(file_path = %token.data.file_path))]
    async fn signed_url(&self, token: &DownloadToken) -> Result<String> {
        let request = HttpRequest::post(&self.endpoint)
            .json(token)
            .map_err(|e| SyncError::Serialization(e.to_string()))?
            .timeout(Self::REQUEST_TIMEOUT);

        let response = self.http.execute(request).await.map_err(SyncError::transport)?;
        if !response.is_success() {
            return Err(SyncError::Credential(format!(
                "credential endpoint returned HTTP {}",
                response.status
            )));
        }

        let body: SignedUrlResponse = response
            .json()
            .map_err(|e| SyncError::Credential(format!("malformed response: {}", e)))?;
        if body.url.is_empty() {
            return Err(SyncError::Credential("empty signed url".to_string()));
        }

        debug!(url = %redact_url(&body.url), "Obtained signed url");
        Ok(body.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenData;
    use bridge_traits::http::{HttpDownload, HttpResponse};
    use bridge_traits::BridgeError;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct CannedHttp {
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl HttpClient for CannedHttp {
        async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse> {
            assert!(request.body.is_some());
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }

        async fn download_stream(&self, _request: HttpRequest) -> bridge_traits::error::Result<HttpDownload> {
            Err(BridgeError::NotAvailable("download".into()))
        }
    }

    fn token() -> DownloadToken {
        DownloadToken {
            hash: "sig".into(),
            data: TokenData {
                timestamp: 1,
                file_path: "bucket/a".into(),
                display_id: "d".into(),
            },
        }
    }

    fn provider(status: u16, body: &'static str) -> HttpCredentialProvider {
        HttpCredentialProvider::new(Arc::new(CannedHttp { status, body }), "https://origin/sign")
    }

    #[tokio::test]
    async fn test_signed_url() {
        let url = provider(200, r#"{"url":"https://cdn/bucket/a?sig=1"}"#)
            .signed_url(&token())
            .await
            .unwrap();
        assert_eq!(url, "https://cdn/bucket/a?sig=1");
    }

    #[tokio::test]
    async fn test_signed_url_logged_without_signature() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        provider(200, r#"{"url":"https://cdn/bucket/a?X-Signature=secret"}"#)
            .signed_url(&token())
            .await
            .unwrap();

        let output = logs.text();
        assert!(output.contains("Obtained signed url"));
        assert!(output.contains("https://cdn/bucket/a"));
        assert!(!output.contains("X-Signature"));
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let err = provider(403, "forbidden").signed_url(&token()).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let err = provider(200, r#"{"nope":1}"#).signed_url(&token()).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
    }
}
