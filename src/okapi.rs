use crate::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use governor::{Jitter, Quota};
use json::JsonValue;
use log::{debug, warn};
use reqwest::{header::HeaderMap, RequestBuilder, Response, StatusCode, Url};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

const TENANT_HEADER: &str = "x-okapi-tenant";
const TOKEN_HEADER: &str = "x-okapi-token";
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// The two calls the item operations need from Okapi. Implemented by [`OkapiClient`] for
/// the real gateway, and mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Okapi: Send + Sync {
    /// GET `path` with a CQL `query` and parse the body as JSON.
    /// Error statuses are turned into errors.
    async fn get(&self, path: &str, query: &str) -> Result<JsonValue>;

    /// PUT `body` to `path`. The status and body are returned as-is, whatever the status.
    async fn put(&self, path: &str, body: JsonValue) -> Result<(StatusCode, String)>;
}

/// Client object for making authenticated Okapi calls. Uses `Arc` internally to be cheaply cloneable.
#[derive(Clone)]
pub struct OkapiClient {
    client: reqwest::Client,
    data: Arc<ClientData>,
}

struct ClientData {
    base_url: Url,
    tenant_id: String,
    token: String,
    max_retries: u32,
    rate_limiter: RateLimiter,
}

type RateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::QuantaClock,
    governor::middleware::NoOpMiddleware<governor::clock::QuantaInstant>,
>;

impl OkapiClient {
    /// Log in to Okapi with the configured credentials and return a client carrying the session token.
    pub async fn login(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let base_url = base_url(&config.okapi_url)?;
        let url = base_url.join("authn/login")?;
        debug!("POST {}", url);
        let mut credentials = JsonValue::new_object();
        credentials["username"] = config.username.as_str().into();
        credentials["password"] = config.password.as_str().into();
        let response = check_error(
            client
                .post(url)
                .header(TENANT_HEADER, &config.tenant_id)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::ACCEPT, "application/json")
                .body(credentials.dump())
                .send()
                .await?,
        )
        .await?;
        let token = token_from_headers(response.headers())?;
        Ok(Self {
            client,
            data: Arc::new(ClientData {
                base_url,
                tenant_id: config.tenant_id.clone(),
                token,
                max_retries: config.max_retries,
                rate_limiter: RateLimiter::direct(Quota::per_second(config.requests_per_second)),
            }),
        })
    }

    async fn until_ready(&self) {
        let jitter = Jitter::up_to(Duration::from_millis(75));
        self.data.rate_limiter.until_ready_with_jitter(jitter).await;
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.data.base_url.join(path.trim_start_matches('/'))?)
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(TENANT_HEADER, &self.data.tenant_id)
            .header(TOKEN_HEADER, &self.data.token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Send a request, retrying connection failures and timeouts up to `max_retries` times.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let mut attempt = 0;
        loop {
            self.until_ready().await;
            let this_try = request.try_clone().ok_or_else(|| anyhow!("request cannot be retried"))?;
            match this_try.send().await {
                Ok(response) => return Ok(response),
                Err(error) if attempt < self.data.max_retries && (error.is_connect() || error.is_timeout()) => {
                    attempt += 1;
                    warn!("attempt {} failed, retrying: {}", attempt, error);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[async_trait]
impl Okapi for OkapiClient {
    async fn get(&self, path: &str, query: &str) -> Result<JsonValue> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut().append_pair("query", query);
        debug!("GET {}", url);
        let body = check_error(self.send(self.authenticated(self.client.get(url))).await?).await?.text().await?;
        Ok(json::parse(&body)?)
    }

    async fn put(&self, path: &str, body: JsonValue) -> Result<(StatusCode, String)> {
        let url = self.endpoint(path)?;
        debug!("PUT {}", url);
        let request = self
            .authenticated(self.client.put(url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.dump());
        let response = self.send(request).await?;
        let status = response.status();
        Ok((status, response.text().await?))
    }
}

/// Parse the configured Okapi url, making sure it ends in a slash so that paths join onto it
/// instead of replacing its last segment.
fn base_url(okapi_url: &str) -> Result<Url> {
    let mut url = okapi_url.trim_end_matches('/').to_owned();
    url.push('/');
    Ok(url.parse()?)
}

fn token_from_headers(headers: &HeaderMap) -> Result<String> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("Okapi login response did not include an {} header", TOKEN_HEADER))
}

#[derive(Debug, Error)]
pub struct OkapiError {
    pub status_code: StatusCode,
    pub messages: Vec<String>,
}

impl fmt::Display for OkapiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Okapi error {}", self.status_code)?;
        // One line, so it can go into a single output row
        if !self.messages.is_empty() {
            write!(f, ": {}", self.messages.join("; "))?;
        }
        Ok(())
    }
}

/// Pull the error messages out of an Okapi error body. FOLIO modules answer either with
/// `{"errors": [{"message": ...}]}` or with a plain text message.
fn error_messages(content_type: Option<&str>, body: &str) -> Vec<String> {
    if let Some("application/json") = content_type.and_then(|c| c.split(';').next()).map(str::trim) {
        if let Ok(parsed) = json::parse(body) {
            let messages: Vec<String> = parsed["errors"]
                .members()
                .filter_map(|error| error["message"].as_str().map(str::to_owned))
                .collect();
            if !messages.is_empty() {
                return messages;
            }
        }
    }
    // Plain text bodies are folded onto one line
    let body = body.lines().map(str::trim).filter(|line| !line.is_empty()).collect::<Vec<_>>().join(" ");
    if body.is_empty() {
        Vec::new()
    } else {
        vec![body]
    }
}

async fn check_error(response: Response) -> Result<Response> {
    let status_code = response.status();
    if status_code.is_client_error() || status_code.is_server_error() {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;
        Err(anyhow!(OkapiError { status_code, messages: error_messages(content_type.as_deref(), &body) }))
    } else {
        Ok(response)
    }
}
