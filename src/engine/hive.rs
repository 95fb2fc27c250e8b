//! Hive engine client over WebHCat and WebHDFS.
//!
//! Statements are submitted as WebHCat jobs whose output lands in a status
//! directory on HDFS. Progress is parsed from the job's `map X% reduce Y%`
//! status; results are streamed from the `stdout` file through the UTF-8
//! guard. Hive prints the header row first, so column names are only known
//! once that line has been read.

use super::{ConnectionString, Cursor, EngineClient, EngineContext, Endpoint, Row, RowBuffer, Value};
use crate::config::EngineConfiguration;
use crate::error::{RelayError, Result};
use crate::executor::taxonomy::syntax_or_engine;
use crate::utf8::LineAssembler;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for WebHCat and WebHDFS control requests.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default HDFS directory under which each job gets a status directory.
const DEFAULT_STATUS_DIR: &str = "/tmp/db-relay";

/// Default WebHDFS port on the name node.
const DEFAULT_WEBHDFS_PORT: u16 = 50070;

/// Hive prints this for NULL cells.
const HIVE_NULL: &str = "NULL";

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

static MAP_REDUCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"map\s+(\d+)%\s+reduce\s+(\d+)%").expect("map/reduce pattern is valid")
});

/// Hive engine client.
#[derive(Debug, Clone)]
pub struct HiveEngine {
    connection: ConnectionString,
    user: String,
    status_dir: String,
    webhdfs_url: Option<String>,
    http: Client,
}

impl HiveEngine {
    pub const FAMILY: &'static str = "hive";

    /// Creates a client from an engine configuration.
    ///
    /// Options: `webhdfs_url` (defaults to the WebHCat host on port 50070)
    /// and `status_dir`.
    pub fn new(config: &EngineConfiguration, context: &EngineContext) -> Result<Self> {
        let connection = ConnectionString::parse(&config.connection_string)?;
        let user = config
            .username
            .clone()
            .ok_or_else(|| RelayError::config(format!("Hive engine '{}' needs a username", config.name)))?;
        let status_dir = config
            .option("status_dir")
            .unwrap_or(DEFAULT_STATUS_DIR)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            connection,
            user,
            status_dir,
            webhdfs_url: config
                .option("webhdfs_url")
                .map(|url| url.trim_end_matches('/').to_string()),
            http: context.http.clone(),
        })
    }
}

#[async_trait]
impl EngineClient for HiveEngine {
    fn family(&self) -> &str {
        Self::FAMILY
    }

    async fn cursor(&self) -> Result<Box<dyn Cursor>> {
        let endpoint = self.connection.pick_endpoint()?;
        let webhdfs = self.webhdfs_url.clone().unwrap_or_else(|| {
            format!("{}://{}:{}", endpoint.protocol, endpoint.host, DEFAULT_WEBHDFS_PORT)
        });
        Ok(Box::new(HiveCursor::new(
            self.http.clone(),
            endpoint,
            webhdfs,
            self.user.clone(),
            self.status_dir.clone(),
        )))
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    status: Option<JobState>,
    profile: Option<JobProfile>,
    percent_complete: Option<String>,
    exit_value: Option<i32>,
    completed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobState {
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobProfile {
    url: Option<String>,
}

/// Terminal outcome of a job status poll.
#[derive(Debug, PartialEq, Eq)]
enum JobOutcome {
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobStatus {
    fn outcome(&self) -> JobOutcome {
        let state = self
            .status
            .as_ref()
            .and_then(|s| s.state.as_deref())
            .unwrap_or_default();
        if state == "KILLED" {
            return JobOutcome::Killed;
        }
        if self.completed.as_deref() == Some("done") {
            return match self.exit_value {
                Some(0) => JobOutcome::Succeeded,
                _ => JobOutcome::Failed,
            };
        }
        if state == "FAILED" {
            JobOutcome::Failed
        } else {
            JobOutcome::Running
        }
    }
}

struct HiveCursor {
    http: Client,
    endpoint: Endpoint,
    webhdfs: String,
    user: String,
    status_root: String,
    status_dir: String,
    job_id: Option<String>,
    progress: u8,
    tracking_url: Option<String>,
    columns: Option<Vec<String>>,
    buffer: RowBuffer,
    lines: LineAssembler,
    stream: Option<ByteStream>,
}

impl HiveCursor {
    fn new(
        http: Client,
        endpoint: Endpoint,
        webhdfs: String,
        user: String,
        status_root: String,
    ) -> Self {
        Self {
            http,
            endpoint,
            webhdfs,
            user,
            status_root,
            status_dir: String::new(),
            job_id: None,
            progress: 0,
            tracking_url: None,
            columns: None,
            buffer: RowBuffer::new(),
            lines: LineAssembler::new(),
            stream: None,
        }
    }

    fn templeton_url(&self, path: &str) -> String {
        format!("{}/templeton/v1/{path}", self.endpoint.base_url())
    }

    fn job_url(&self, job_id: &str) -> String {
        self.templeton_url(&format!("jobs/{job_id}"))
    }

    fn job_id(&self) -> Result<String> {
        self.job_id
            .clone()
            .ok_or_else(|| RelayError::internal("poll() called before run()"))
    }

    async fn open_output(&mut self, name: &str) -> Result<reqwest::Response> {
        let url = format!("{}/webhdfs/v1{}/{name}", self.webhdfs, self.status_dir);
        let response = self
            .http
            .get(&url)
            .query(&[("op", "OPEN"), ("user.name", self.user.as_str())])
            .send()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to open {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::engine(format!(
                "WebHDFS returned {} for {url}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Attaches the result byte stream and consumes the header line.
    async fn attach_stream(&mut self, stream: ByteStream) -> Result<()> {
        self.stream = Some(stream);
        if let Some(header) = self.next_line().await? {
            self.columns = Some(parse_header(&header));
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.lines.push(&chunk)?,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(RelayError::connection(format!(
                        "Failed to read Hive results: {e}"
                    )));
                }
                None => {
                    self.stream = None;
                    self.lines.finish()?;
                }
            }
        }
    }

    async fn failure(&mut self, job_id: &str) -> RelayError {
        let stderr = match self.open_output("stderr").await {
            Ok(response) => response.text().await.unwrap_or_default(),
            Err(e) => {
                warn!("Could not read stderr of Hive job {job_id}: {e}");
                String::new()
            }
        };
        match extract_failure(&stderr) {
            Some(message) => syntax_or_engine(message),
            None => RelayError::engine(format!("Hive job {job_id} failed")),
        }
    }
}

#[async_trait]
impl Cursor for HiveCursor {
    async fn run(&mut self, statement: &str) -> Result<()> {
        self.status_dir = format!("{}/{}", self.status_root, uuid::Uuid::new_v4());
        let mut execute = String::from("set hive.cli.print.header=true;\n");
        if let Some(database) = &self.endpoint.catalog {
            execute.push_str(&format!("USE {database};\n"));
        }
        execute.push_str(statement);

        let response = self
            .http
            .post(self.templeton_url("hive"))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .form(&[
                ("user.name", self.user.as_str()),
                ("execute", execute.as_str()),
                ("statusdir", self.status_dir.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to submit Hive job: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to read WebHCat response: {e}")))?;
        if !status.is_success() {
            return Err(RelayError::engine(format!(
                "WebHCat rejected the job ({status}): {}",
                body.trim()
            )));
        }

        let submitted: SubmitResponse = serde_json::from_str(&body)
            .map_err(|e| RelayError::engine(format!("Failed to parse WebHCat response: {e}")))?;
        debug!("Submitted Hive job {} ({})", submitted.id, self.status_dir);
        self.job_id = Some(submitted.id);
        Ok(())
    }

    async fn poll(&mut self) -> Result<bool> {
        if self.buffer.is_ready() {
            return Ok(true);
        }
        let job_id = self.job_id()?;

        let status: JobStatus = self
            .http
            .get(self.job_url(&job_id))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .query(&[("user.name", self.user.as_str())])
            .send()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to poll Hive job {job_id}: {e}")))?
            .json()
            .await
            .map_err(|e| RelayError::engine(format!("Failed to parse job status: {e}")))?;

        if let Some(url) = status.profile.as_ref().and_then(|p| p.url.clone()) {
            self.tracking_url = Some(url);
        }
        if let Some(progress) = status.percent_complete.as_deref().and_then(map_reduce_progress) {
            self.progress = progress.max(self.progress);
        }

        match status.outcome() {
            JobOutcome::Running => Ok(false),
            JobOutcome::Killed => Err(RelayError::engine(format!("Hive job {job_id} was killed"))),
            JobOutcome::Failed => Err(self.failure(&job_id).await),
            JobOutcome::Succeeded => {
                let stream = self.open_output("stdout").await?.bytes_stream().boxed();
                self.attach_stream(stream).await?;
                self.progress = 100;
                self.buffer.mark_ready();
                Ok(true)
            }
        }
    }

    async fn cancel(&mut self) {
        self.stream = None;
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        let result = self
            .http
            .delete(self.job_url(&job_id))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .query(&[("user.name", self.user.as_str())])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Killed Hive job {job_id}");
            }
            Ok(response) => warn!("Killing Hive job {job_id} returned {}", response.status()),
            Err(e) => warn!("Failed to kill Hive job {job_id}: {e}"),
        }
    }

    async fn get_n_rows(&mut self, n: usize) -> Result<Vec<Row>> {
        self.buffer.ensure_ready()?;
        while self.buffer.len() < n {
            match self.next_line().await? {
                Some(line) => self.buffer.extend(std::iter::once(parse_row(&line))),
                None => break,
            }
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
        self.tracking_url.clone()
    }
}

/// Parses `map X% reduce Y%` into `(X + Y) / 2`.
fn map_reduce_progress(status: &str) -> Option<u8> {
    let caps = MAP_REDUCE_RE.captures(status)?;
    let map: u32 = caps[1].parse().ok()?;
    let reduce: u32 = caps[2].parse().ok()?;
    Some(((map + reduce) / 2).min(100) as u8)
}

/// Column names from the header line, without the `table.` qualifier.
fn parse_header(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|name| name.rsplit('.').next().unwrap_or(name).to_string())
        .collect()
}

fn parse_row(line: &str) -> Row {
    line.split('\t')
        .map(|cell| {
            if cell == HIVE_NULL {
                Value::Null
            } else {
                Value::String(cell.to_string())
            }
        })
        .collect()
}

/// Picks the failure line out of Hive's stderr log.
fn extract_failure(stderr: &str) -> Option<&str> {
    let lines = || stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    lines()
        .filter(|l| l.starts_with("FAILED:"))
        .last()
        .or_else(|| lines().last())
}
