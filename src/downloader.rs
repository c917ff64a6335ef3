use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::FetchRequest;

#[derive(Debug)]
pub struct FetchResponse {
    pub request: FetchRequest,
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Time from sending the request until the response headers arrived.
    pub latency: Duration,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// A fetch that produced no response. The request comes back so the spider
/// can decide whether to retry it.
#[derive(Debug)]
pub struct FetchFailure {
    pub request: FetchRequest,
    pub error: FetchError,
}

/// Transport used by the engine. Non-2xx statuses are responses, not
/// failures.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<FetchResponse, FetchFailure>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.bot_name.as_str())
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: &FetchRequest) -> std::result::Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("bad method {:?}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let latency = started.elapsed();

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(FetchResponse {
            request: request.clone(),
            url,
            status,
            headers,
            body,
            latency,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<FetchResponse, FetchFailure> {
        match self.send(&request).await {
            Ok(response) => Ok(response),
            Err(error) => {
                log::error!("{}: {}", request.url, error);
                Err(FetchFailure { request, error })
            }
        }
    }
}
