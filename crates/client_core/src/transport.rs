use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::{ApiError, ErrorCode};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(value: HttpMethod) -> Self {
        match value {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub bearer: Option<String>,
    /// Set once the call has been resubmitted after a renewal.
    pub retried: bool,
    /// Marks the credential renewal call itself.
    pub is_renewal: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            retried: false,
            is_renewal: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ClientError::Validation(format!("unserializable body: {err}")))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn renewal(mut self) -> Self {
        self.is_renewal = true;
        self
    }

    pub fn retry_with(&self, access_token: String) -> Self {
        let mut retry = self.clone();
        retry.bearer = Some(access_token);
        retry.retried = true;
        retry
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_body<T: Serialize>(status: u16, body: &T) -> Self {
        Self::new(status, serde_json::to_vec(body).unwrap_or_default())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn into_result(self) -> Result<Self, ClientError> {
        if self.is_success() {
            return Ok(self);
        }
        let body = serde_json::from_slice::<ApiError>(&self.body)
            .ok()
            .or_else(|| {
                let text = String::from_utf8_lossy(&self.body).trim().to_string();
                (!text.is_empty()).then(|| ApiError::new(ErrorCode::from_status(self.status), text))
            });
        Err(ClientError::Status {
            status: self.status,
            body,
        })
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs one call. Any HTTP status is an `Ok`; only transport-level
    /// failures are errors.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError>;
}

pub struct ReqwestTransport {
    http: Client,
    server_url: String,
}

impl ReqwestTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let mut builder = self
            .http
            .request(request.method.into(), format!("{}{}", self.server_url, request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(ApiResponse::new(status, body.to_vec()))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
