//! Presto/Trino engine client.
//!
//! Speaks the REST statement protocol: `POST /v1/statement` submits the query,
//! each response carries a `nextUri` to follow until it disappears, and a
//! `DELETE` on the current `nextUri` cancels the query.
//!
//! A query is complete only once `nextUri` is gone or the coordinator reports
//! `FINISHED`. Data pages that arrive before that are buffered, so a failure
//! on a later page is raised from `poll` as an execution error rather than
//! after rows have been handed out.

use super::{ConnectionString, Cursor, EngineClient, EngineContext, Endpoint, Row, RowBuffer};
use crate::config::EngineConfiguration;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for a single protocol request.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Maximum number of attempts for a request that hit a transient failure.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Value sent in the `Source` header.
const CLIENT_SOURCE: &str = "db-relay";

/// Presto/Trino engine client.
#[derive(Debug, Clone)]
pub struct PrestoEngine {
    family: String,
    connection: ConnectionString,
    user: String,
    password: Option<String>,
    http: Client,
}

impl PrestoEngine {
    /// Family names served by this client.
    pub const FAMILIES: [&'static str; 2] = ["presto", "trino"];

    /// Creates a client from an engine configuration.
    pub fn new(config: &EngineConfiguration, context: &EngineContext) -> Result<Self> {
        let connection = ConnectionString::parse(&config.connection_string)?;
        Ok(Self {
            family: config.family.clone(),
            connection,
            user: config
                .username
                .clone()
                .unwrap_or_else(|| CLIENT_SOURCE.to_string()),
            password: config.password()?,
            http: context.http.clone(),
        })
    }

    fn header_prefix(&self) -> &'static str {
        if self.family == "trino" {
            "X-Trino"
        } else {
            "X-Presto"
        }
    }
}

#[async_trait]
impl EngineClient for PrestoEngine {
    fn family(&self) -> &str {
        &self.family
    }

    async fn cursor(&self) -> Result<Box<dyn Cursor>> {
        let endpoint = self.connection.pick_endpoint()?;
        debug!("Opening {} cursor on {}", self.family, endpoint.base_url());
        Ok(Box::new(PrestoCursor::new(
            self.http.clone(),
            endpoint,
            self.header_prefix(),
            self.user.clone(),
            self.password.clone(),
        )))
    }
}

/// One page of the statement protocol.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    id: String,
    info_uri: Option<String>,
    next_uri: Option<String>,
    columns: Option<Vec<ColumnMeta>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    stats: Option<StatementStats>,
    error: Option<QueryError>,
}

#[derive(Debug, Deserialize)]
struct ColumnMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStats {
    state: String,
    progress_percentage: Option<f64>,
    #[serde(default)]
    completed_splits: u64,
    #[serde(default)]
    total_splits: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryError {
    message: String,
    error_name: Option<String>,
    error_location: Option<ErrorLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorLocation {
    line_number: usize,
    column_number: usize,
}

struct PrestoCursor {
    http: Client,
    endpoint: Endpoint,
    header_prefix: &'static str,
    user: String,
    password: Option<String>,
    query_id: Option<String>,
    info_uri: Option<String>,
    next_uri: Option<String>,
    columns: Option<Vec<String>>,
    state: Option<String>,
    buffer: RowBuffer,
    progress: u8,
}

/// How a protocol request failed, for the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Status(StatusCode),
    Timeout,
    Connect,
    Other,
}

impl PrestoCursor {
    fn new(
        http: Client,
        endpoint: Endpoint,
        header_prefix: &'static str,
        user: String,
        password: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            header_prefix,
            user,
            password,
            query_id: None,
            info_uri: None,
            next_uri: None,
            columns: None,
            state: None,
            buffer: RowBuffer::new(),
            progress: 0,
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let prefix = self.header_prefix;
        let mut request = self
            .http
            .request(method, url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .header(format!("{prefix}-User"), self.user.as_str())
            .header(format!("{prefix}-Source"), CLIENT_SOURCE);
        if let Some(catalog) = &self.endpoint.catalog {
            request = request.header(format!("{prefix}-Catalog"), catalog.as_str());
        }
        if let Some(schema) = &self.endpoint.schema {
            request = request.header(format!("{prefix}-Schema"), schema.as_str());
        }
        if let Some(password) = &self.password {
            request = request.basic_auth(&self.user, Some(password));
        }
        request
    }

    /// Sends a protocol request, retrying transient failures that cannot have
    /// created a second query.
    async fn send(&self, method: Method, url: &str, body: Option<&str>) -> Result<QueryResults> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let mut request = self.request(method.clone(), url);
            if let Some(body) = body {
                request = request.body(body.to_string());
            }

            let (error, failure) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.map_err(|e| {
                        RelayError::connection(format!("Failed to read Presto response: {e}"))
                    })?;
                    if status.is_success() {
                        return serde_json::from_str(&text).map_err(|e| {
                            RelayError::engine(format!("Failed to parse Presto response: {e}"))
                        });
                    }
                    (parse_http_error(status, &text), Failure::Status(status))
                }
                Err(e) => {
                    let failure = if e.is_connect() {
                        Failure::Connect
                    } else if e.is_timeout() {
                        Failure::Timeout
                    } else {
                        Failure::Other
                    };
                    let error = RelayError::connection(format!(
                        "Request to {} failed: {e}",
                        self.endpoint.base_url()
                    ));
                    (error, failure)
                }
            };

            last_error = Some(error);
            if !may_retry(&method, failure) || attempt >= MAX_RETRY_ATTEMPTS {
                break;
            }
            warn!(
                "Presto request failed (attempt {}), retrying in {:?}",
                attempt, delay
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(last_error.unwrap_or_else(|| RelayError::internal("No Presto request was attempted")))
    }

    /// Folds one protocol page into the cursor state.
    fn absorb(&mut self, page: QueryResults) -> Result<()> {
        if self.query_id.is_none() {
            debug!("Presto query id {}", page.id);
        }
        self.query_id = Some(page.id);
        if page.info_uri.is_some() {
            self.info_uri = page.info_uri;
        }
        self.next_uri = page.next_uri;

        if let Some(stats) = page.stats {
            self.progress = progress_from_stats(&stats).max(self.progress);
            self.state = Some(stats.state);
        }
        if let Some(error) = page.error {
            self.next_uri = None;
            return Err(map_query_error(error));
        }
        if let Some(columns) = page.columns {
            self.columns = Some(columns.into_iter().map(|c| c.name).collect());
        }
        if let Some(data) = page.data {
            self.buffer.extend(
                data.into_iter()
                    .map(|row| row.into_iter().map(Into::into).collect::<Row>()),
            );
        }
        Ok(())
    }

    async fn advance(&mut self) -> Result<()> {
        let Some(uri) = self.next_uri.clone() else {
            return Ok(());
        };
        let page = self.send(Method::GET, &uri, None).await?;
        self.absorb(page)
    }

    fn finished(&self) -> bool {
        self.next_uri.is_none() || self.state.as_deref() == Some("FINISHED")
    }
}

#[async_trait]
impl Cursor for PrestoCursor {
    async fn run(&mut self, statement: &str) -> Result<()> {
        let url = format!("{}/v1/statement", self.endpoint.base_url());
        let page = self.send(Method::POST, &url, Some(statement)).await?;
        self.absorb(page)
    }

    async fn poll(&mut self) -> Result<bool> {
        if self.buffer.is_ready() {
            return Ok(true);
        }
        if self.query_id.is_none() {
            return Err(RelayError::internal("poll() called before run()"));
        }
        // Pages carrying rows are followed straight away; an empty page means
        // the query is still working and the caller should wait.
        while !self.finished() {
            let buffered = self.buffer.len();
            self.advance().await?;
            if self.buffer.len() == buffered && !self.finished() {
                return Ok(false);
            }
        }
        self.progress = 100;
        self.buffer.mark_ready();
        Ok(true)
    }

    async fn cancel(&mut self) {
        let Some(uri) = self.next_uri.take() else {
            return;
        };
        match self.request(Method::DELETE, &uri).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Cancelled Presto query {:?}", self.query_id);
            }
            Ok(response) => warn!(
                "Cancelling Presto query {:?} returned {}",
                self.query_id,
                response.status()
            ),
            Err(e) => warn!("Failed to cancel Presto query {:?}: {e}", self.query_id),
        }
    }

    async fn get_n_rows(&mut self, n: usize) -> Result<Vec<Row>> {
        self.buffer.ensure_ready()?;
        while self.buffer.len() < n && self.next_uri.is_some() {
            self.advance().await?;
        }
        Ok(self.buffer.take(n))
    }

    fn get_columns(&self) -> Option<Vec<String>> {
        self.columns.clone()
    }

    fn percent_complete(&self) -> u8 {
        self.progress
    }

    fn tracking_url(&self) -> Option<String> {
        self.info_uri.clone()
    }
}

fn progress_from_stats(stats: &StatementStats) -> u8 {
    if stats.state == "FINISHED" {
        return 100;
    }
    let percent = match stats.progress_percentage {
        Some(p) => p,
        None if stats.total_splits > 0 => {
            stats.completed_splits as f64 * 100.0 / stats.total_splits as f64
        }
        None => 0.0,
    };
    percent.clamp(0.0, 100.0) as u8
}

/// Compile-time errors carry a location and are reported as syntax errors.
fn map_query_error(error: QueryError) -> RelayError {
    match error.error_location {
        Some(location) => {
            RelayError::syntax(error.message, location.line_number, location.column_number)
        }
        None => match error.error_name {
            Some(name) => RelayError::engine(format!("{name}: {}", error.message)),
            None => RelayError::engine(error.message),
        },
    }
}

/// A submitted POST may already have started a query when it times out or
/// the gateway drops it, so it is only retried when it never reached the
/// coordinator (connect failure) or was explicitly refused (503).
fn may_retry(method: &Method, failure: Failure) -> bool {
    let idempotent = *method != Method::POST;
    match failure {
        Failure::Connect => true,
        Failure::Status(StatusCode::SERVICE_UNAVAILABLE) => true,
        Failure::Status(StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT) => idempotent,
        Failure::Timeout => idempotent,
        Failure::Status(_) | Failure::Other => false,
    }
}

/// Maps a non-success HTTP response to an error.
fn parse_http_error(status: StatusCode, body: &str) -> RelayError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return RelayError::connection(format!(
            "Authentication failed ({status}). Check the engine credentials."
        ));
    }

    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return RelayError::connection(format!("Coordinator unavailable ({status})"));
    }

    let body = body.trim();
    let message = if body.is_empty() {
        format!("Presto request failed ({status})")
    } else {
        format!("Presto request failed ({status}): {body}")
    };
    RelayError::engine(message)
}
