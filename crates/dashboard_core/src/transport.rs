//! The request/response side of the message channel and the enum the store is
//! written against.

use std::sync::Arc;

use reqwest::{
    header::AUTHORIZATION,
    multipart::{Form, Part},
    Client, Method,
};
use serde_json::Value;
use shared::protocol::ApiResponse;
use tracing::debug;
use url::Url;

use crate::{bridge::Bridge, error::TransportError, media::MediaFile};

const AUTH_SCHEME: &str = "TWA";

#[derive(Clone)]
pub enum MessageChannel {
    /// Fire-and-forget sends; results arrive later as untyped broadcasts.
    Bridge(Arc<dyn Bridge>),
    /// Conventional request/response calls.
    Http(Arc<HttpChannel>),
}

impl MessageChannel {
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Bridge(_) => "bridge",
            Self::Http(_) => "http",
        }
    }
}

pub enum CallBody {
    Empty,
    Json(Value),
    Multipart(MediaFile),
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: ApiResponse,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.body.ok
    }

    pub fn into_success(self) -> Result<ApiResponse, TransportError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(TransportError::Rejected(self.body.failure(self.status)))
        }
    }
}

pub struct HttpChannel {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpChannel {
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            auth_token: auth_token.filter(|token| !token.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|source| TransportError::Endpoint {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    /// Issues one call and decodes the `{ok, data|detail|message}` body.
    ///
    /// Non-2xx replies are returned, not raised, so callers can surface the
    /// server's `detail`.
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: CallBody,
    ) -> Result<HttpReply, TransportError> {
        let url = self.endpoint_url(endpoint)?;
        let http_err = |source| TransportError::Http {
            endpoint: endpoint.to_string(),
            source,
        };

        let mut request = self.http.request(method.clone(), url);
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("{AUTH_SCHEME} {token}"));
        }
        request = match body {
            CallBody::Empty => request,
            CallBody::Json(value) => request.json(&value),
            CallBody::Multipart(file) => {
                let mut part = Part::bytes(file.bytes).file_name(file.filename);
                if let Some(mime) = &file.mime_type {
                    part = part.mime_str(mime).map_err(http_err)?;
                }
                request.multipart(Form::new().part("file", part))
            }
        };

        let response = request.send().await.map_err(http_err)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(http_err)?;
        debug!(%method, endpoint, status = status.as_u16(), "http: call completed");

        let body = match serde_json::from_slice::<ApiResponse>(&bytes) {
            Ok(body) => body,
            Err(source) if status.is_success() => {
                return Err(TransportError::Body {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
            Err(_) => ApiResponse {
                detail: Some(Value::String(format!(
                    "request failed with HTTP {}",
                    status.as_u16()
                ))),
                ..ApiResponse::default()
            },
        };

        Ok(HttpReply {
            status: status.as_u16(),
            body,
        })
    }
}
