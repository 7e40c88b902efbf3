//! HTTP transport over `reqwest`.

use crate::{
    config::EngineConfig,
    error::Result,
    harmonic::HarmonicId,
    schema::RemoteSchema,
    transport::{
        ActionPayload, ActionResponse, HarmonicsResponse, HttpResponse, OutboundRequest,
        RemoteActionTransport, RequestTransport, SnapshotResponse, SyncTransport,
    },
    Error,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Talks to a server exposing `schema`, `sync/{collection}`, `actions/{name}`
/// and `write/{collection}/{action}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    headers: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        // Url::join drops the last segment unless the base ends with '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            auth_token: None,
            headers: BTreeMap::new(),
        })
    }

    /// Build a transport from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::InvalidUrl("no base url configured".into()))?;
        let mut transport = Self::with_timeout(base_url, config.request_timeout)?;
        transport.auth_token = config.auth_token.clone();
        Ok(transport)
    }

    /// Builder-style method to send a bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Builder-style method to send a static header with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidUrl(format!("{path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.request(Method::GET, url).send().await?;
        let response = error_for_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Turn non-2xx responses into `Error::Http` carrying the body text.
async fn error_for_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}

/// Statuses whose body is an action response even though they are not 2xx.
fn carries_action_body(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::UNPROCESSABLE_ENTITY
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_schema(&self) -> Result<RemoteSchema> {
        self.get_json(self.url("schema")?).await
    }

    async fn fetch_snapshot(&self, collection: &str) -> Result<SnapshotResponse> {
        let mut url = self.url(&format!("sync/{collection}"))?;
        url.query_pairs_mut().append_pair("initial", "true");
        self.get_json(url).await
    }

    async fn fetch_after(&self, collection: &str, after: &HarmonicId) -> Result<HarmonicsResponse> {
        let mut url = self.url(&format!("sync/{collection}"))?;
        url.query_pairs_mut().append_pair("after", after.as_str());
        self.get_json(url).await
    }
}

#[async_trait]
impl RemoteActionTransport for HttpTransport {
    async fn execute(&self, name: &str, payload: &ActionPayload) -> Result<ActionResponse> {
        let url = self.url(&format!("actions/{name}"))?;
        let response = self.request(Method::POST, url).json(payload).send().await?;
        let status = response.status();
        if !carries_action_body(status) {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                message,
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                Error::Decode(format!("action {name}: {e}"))
            } else {
                Error::Http {
                    status: status.as_u16(),
                    message: body,
                }
            }
        })
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| Error::InvalidUrl(format!("{} {}: {e}", request.method, request.url)))?;
        let mut builder = self.request(method, self.url(&request.url)?);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_resolve_against_base() {
        let transport = HttpTransport::new("http://localhost:3000/api").unwrap();
        assert_eq!(transport.base_url().as_str(), "http://localhost:3000/api/");
        assert_eq!(
            transport.url("sync/todos").unwrap().as_str(),
            "http://localhost:3000/api/sync/todos"
        );
        assert_eq!(
            transport.url("/write/messages/create").unwrap().as_str(),
            "http://localhost:3000/api/write/messages/create"
        );
        assert_eq!(
            transport.url("https://other.example/x").unwrap().as_str(),
            "https://other.example/x"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(matches!(
            HttpTransport::new("::not a url"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpTransport::from_config(&EngineConfig::default()),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let err = transport.fetch_schema().await.unwrap_err();
        assert!(err.is_network(), "{err:?}");
    }
}
