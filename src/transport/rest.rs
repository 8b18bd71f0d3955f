//! Discovery transport backed by [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{CatalogRequest, CatalogTransport};
use crate::RawHostmap;

/// Errors produced by [`HttpTransport`].
#[derive(Debug, thiserror::Error)]
pub enum HttpTransportError {
    /// The catalog does not yet know where the discovery service lives
    #[error("no url known for the '{0}' service")]
    NoBaseUrl(&'static str),
    /// The request could not be sent or its body decoded
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The discovery service answered with a non-success status
    #[error("discovery error ({status}): {body}")]
    Status {
        /// Response status
        status: reqwest::StatusCode,
        /// Response body, possibly empty
        body: String,
    },
}

/// Fetches catalogs over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpTransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Creates a transport around an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CatalogTransport for HttpTransport {
    type Error = HttpTransportError;

    async fn fetch(&self, request: CatalogRequest) -> Result<RawHostmap, Self::Error> {
        let url = request
            .url()
            .ok_or(HttpTransportError::NoBaseUrl(request.service))?;

        let mut req = self.client.get(url.as_str());
        for (name, value) in request.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let response = req.send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(HttpTransportError::Status { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DISCOVERY_SERVICE;
    use http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use url::Url;

    /// Answers a single connection with `response` and returns the base URL.
    async fn serve_once(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{addr}/u2c/api/v1")).unwrap()
    }

    fn request(base: Option<Url>) -> CatalogRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        CatalogRequest {
            service: DISCOVERY_SERVICE,
            base,
            resource: "/catalog",
            query: vec![("format".to_string(), "hostmap".to_string())],
            headers,
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn missing_base_url() {
        let err = transport().fetch(request(None)).await.unwrap_err();
        assert!(matches!(err, HttpTransportError::NoBaseUrl("u2c")));
    }

    #[tokio::test]
    async fn decodes_hostmap() {
        let base = serve_once(concat!(
            "HTTP/1.1 200 OK\r\n",
            "content-type: application/json\r\n",
            "content-length: 127\r\n",
            "connection: close\r\n\r\n",
            r#"{"serviceLinks":{"hydra":"https://h1.example/v1"},"hostCatalog":{"h1.example":[{"host":"h1.example","id":"urn:TEAM:a:hydra"}]}}"#,
        ))
        .await;
        let hostmap = transport().fetch(request(Some(base))).await.unwrap();
        assert_eq!(hostmap.service_links["hydra"], "https://h1.example/v1");
        assert_eq!(hostmap.host_catalog["h1.example"][0].host, "h1.example");
    }

    #[tokio::test]
    async fn error_status_keeps_body() {
        let base = serve_once(concat!(
            "HTTP/1.1 503 Service Unavailable\r\n",
            "content-length: 4\r\n",
            "connection: close\r\n\r\n",
            "down",
        ))
        .await;
        let err = transport().fetch(request(Some(base))).await.unwrap_err();
        match err {
            HttpTransportError::Status { status, body } => {
                assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
