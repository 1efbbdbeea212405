//! # Document Fetcher
//!
//! Retrieves the document of one resource. The HTTP client is built once per
//! resource on top of `reqwest_middleware`, so transient failures are retried
//! with exponential backoff before a fetch is reported as failed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use thiserror::Error;

use crate::configs::ResourceConfig;

/// Retries applied to transient request failures.
const MAX_RETRIES: u32 = 3;

/// Why a fetch cycle produced no document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The fetcher could not be built from its configuration.
    #[error("fetcher setup failed: {0}")]
    Setup(String),
    /// Network failure after retries were exhausted.
    #[error("request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Numeric HTTP status.
        status: u16,
        /// The requested URL.
        url: String,
    },
    /// The body could not be read or decoded.
    #[error("failed to decode body: {0}")]
    Decode(#[source] reqwest::Error),
}

/// # Fetched Document
///
/// The body of the latest successful fetch. Cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDocument {
    /// Decoded document text.
    pub body: Arc<str>,
    /// HTTP status the document was served with.
    pub status: u16,
    /// When the fetch completed.
    pub fetched_at: DateTime<Utc>,
}

impl FetchedDocument {
    /// Wraps `body` as a document fetched now with status 200.
    pub fn new(body: impl Into<Arc<str>>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            fetched_at: Utc::now(),
        }
    }
}

/// # Document Source
///
/// Where a coordinator gets its documents from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Retrieves the current document.
    async fn fetch(&self) -> Result<FetchedDocument, FetchError>;

    /// The resource this source reads, for logs.
    fn resource(&self) -> &str;
}

/// # HTTP Fetcher
///
/// `DocumentSource` over HTTP(S) for a single configured resource.
pub struct HttpFetcher {
    inner: ClientWithMiddleware,
    url: Url,
    headers: HeaderMap,
    credentials: Option<(String, Option<String>)>,
    encoding: String,
}

impl HttpFetcher {
    /// Builds the client for `config`: timeout, certificate checking, headers and retries.
    ///
    /// # Errors
    /// Returns `FetchError::Setup` for an unparsable URL, an invalid header or a
    /// TLS backend that cannot be initialised.
    pub fn new(config: &ResourceConfig) -> Result<Self, FetchError> {
        let url = Url::parse(&config.resource).map_err(|e| FetchError::Setup(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| FetchError::Setup(format!("header '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::Setup(format!("header '{}': {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| FetchError::Setup(e.to_string()))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            url,
            headers,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
            encoding: config.encoding.clone(),
        })
    }
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch(&self) -> Result<FetchedDocument, FetchError> {
        let mut req = self
            .inner
            .get(self.url.clone())
            .headers(self.headers.clone());

        if let Some((user, password)) = &self.credentials {
            req = req.basic_auth(user, password.as_ref());
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        // The declared charset wins; the configured encoding is only a fallback.
        let body = response
            .text_with_charset(&self.encoding)
            .await
            .map_err(FetchError::Decode)?;

        Ok(FetchedDocument {
            body: Arc::from(body),
            status: status.as_u16(),
            fetched_at: Utc::now(),
        })
    }

    fn resource(&self) -> &str {
        self.url.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn config(url: String) -> ResourceConfig {
        ResourceConfig {
            resource: url,
            nickname: None,
            scan_interval: 10,
            headers: BTreeMap::from([("X-Trace".to_string(), "yes".to_string())]),
            authentication: None,
            username: Some("user".into()),
            password: Some("pass".into()),
            verify_ssl: true,
            timeout: 5,
            encoding: "UTF-8".into(),
            sensor: Vec::new(),
        }
    }

    /// Serves one canned response and hands back the raw request it received.
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buffer = [0; 4096];
            let n = stream.read(&mut buffer).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&buffer[..n]).to_string()
        });
        (format!("http://{}/page", addr), handle)
    }

    #[tokio::test]
    async fn fetches_body_with_headers_and_basic_auth() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\nConnection: close\r\n\r\n<p>hello</p>\n",
        );
        let fetcher = HttpFetcher::new(&config(url)).unwrap();

        let doc = fetcher.fetch().await.unwrap();
        assert_eq!(&*doc.body, "<p>hello</p>\n");
        assert_eq!(doc.status, 200);

        let request = server.join().unwrap().to_ascii_lowercase();
        assert!(request.contains("x-trace: yes"));
        // base64("user:pass")
        assert!(request.contains("authorization: basic dxnlcjpwyxnz"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let (url, _server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let fetcher = HttpFetcher::new(&config(url)).unwrap();

        match fetcher.fetch().await {
            Err(FetchError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_header_fails_setup() {
        let mut cfg = config("http://127.0.0.1/".into());
        cfg.headers.insert("bad header".into(), "x".into());
        assert!(matches!(HttpFetcher::new(&cfg), Err(FetchError::Setup(_))));
    }
}
