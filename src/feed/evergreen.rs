use std::time::Duration;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::EvergreenConfig;
use crate::error::StreakError;
use crate::feed::{Build, CiProvider, TaskRun, TaskStatus, TestResult, Version, VersionRef};

const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024; // 16MB

/// Versions requested per listing page.
const VERSIONS_PAGE_SIZE: usize = 50;

/// Base delay for retry backoff; doubled on every attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Evergreen REST v2 client.
pub struct EvergreenClient {
    client: Client,
    base_url: String,
    api_user: Option<String>,
    api_key: Option<String>,
    max_concurrent_requests: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct ApiVersion {
    version_id: String,
    order: i64,
    #[serde(default)]
    project: String,
    #[serde(default)]
    build_variants_status: Option<Vec<ApiBuildVariantStatus>>,
}

#[derive(Deserialize)]
struct ApiBuildVariantStatus {
    build_id: String,
}

#[derive(Deserialize)]
struct ApiBuild {
    #[serde(rename = "_id")]
    id: String,
    build_variant: String,
    display_name: String,
}

#[derive(Deserialize)]
struct ApiTask {
    task_id: String,
    display_name: String,
    build_variant: String,
    order: i64,
    version_id: String,
    status: String,
    #[serde(default)]
    status_details: ApiStatusDetails,
}

#[derive(Deserialize, Default)]
struct ApiStatusDetails {
    #[serde(default)]
    timed_out: bool,
}

impl From<ApiTask> for TaskRun {
    fn from(t: ApiTask) -> Self {
        TaskRun {
            task_id: t.task_id,
            display_name: t.display_name,
            build_variant: t.build_variant,
            order: t.order,
            version_id: t.version_id,
            status: TaskStatus::from(t.status),
            timed_out: t.status_details.timed_out,
            tests: Vec::new(),
        }
    }
}

impl EvergreenClient {
    pub fn new(config: &EvergreenConfig) -> Result<Self, StreakError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .build()?;

        if config.api_user.is_none() || config.api_key.is_none() {
            tracing::warn!("EVG_API_USER/EVG_API_KEY not set, requests will be anonymous");
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_user: config.api_user.clone(),
            api_key: config.api_key.clone(),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v2/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// One page of mainline versions, newest first. `start` is the highest
    /// order to include.
    pub async fn versions_page(
        &self,
        project: &str,
        start: Option<i64>,
        limit: usize,
    ) -> Result<Vec<VersionRef>, StreakError> {
        let mut url = self.url(&format!(
            "projects/{project}/versions?requester=gitter_request&limit={limit}"
        ));
        if let Some(start) = start {
            url.push_str(&format!("&start={start}"));
        }
        let (versions, _) = self.get_json::<Vec<ApiVersion>>(&url).await?;
        Ok(versions
            .into_iter()
            .map(|v| VersionRef {
                version_id: v.version_id,
                order: v.order,
                project: if v.project.is_empty() {
                    project.to_string()
                } else {
                    v.project
                },
                build_ids: v
                    .build_variants_status
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| b.build_id)
                    .collect(),
            })
            .collect())
    }

    async fn build(&self, build_id: &str) -> Result<ApiBuild, StreakError> {
        let (build, _) = self
            .get_json::<ApiBuild>(&self.url(&format!("builds/{build_id}")))
            .await?;
        Ok(build)
    }

    async fn build_tasks(&self, build_id: &str) -> Result<Vec<TaskRun>, StreakError> {
        let tasks: Vec<ApiTask> = self
            .get_all_pages(&self.url(&format!("builds/{build_id}/tasks")))
            .await?;
        Ok(tasks.into_iter().map(TaskRun::from).collect())
    }

    async fn task_tests(&self, task_id: &str) -> Result<Vec<TestResult>, StreakError> {
        self.get_all_pages(&self.url(&format!("tasks/{task_id}/tests")))
            .await
    }

    /// Load a build; tasks and their tests only when it is required.
    async fn load_build(
        &self,
        build_id: &str,
        required_marker: &str,
    ) -> Result<Build, StreakError> {
        let api_build = self.build(build_id).await?;
        let mut build = Build {
            build_id: api_build.id,
            build_variant: api_build.build_variant,
            display_name: api_build.display_name,
            tasks: Vec::new(),
        };
        if !build.display_name.starts_with(required_marker) {
            return Ok(build);
        }

        let tasks = self.build_tasks(build_id).await?;
        let loads: Vec<_> = tasks
            .into_iter()
            .map(|task| self.with_tests(task))
            .collect();
        build.tasks = stream::iter(loads)
            .buffered(self.max_concurrent_requests)
            .try_collect()
            .await?;
        Ok(build)
    }

    async fn with_tests(&self, mut task: TaskRun) -> Result<TaskRun, StreakError> {
        task.tests = self.task_tests(&task.task_id).await?;
        Ok(task)
    }

    /// Collect every page of a list endpoint, following `Link: rel="next"`.
    async fn get_all_pages<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, StreakError> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(url) = next {
            let (page, next_url) = self.get_json::<Vec<T>>(&url).await?;
            items.extend(page);
            next = next_url;
        }
        Ok(items)
    }

    /// GET with retry on transient failures.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<String>), StreakError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(url).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        url,
                        attempt,
                        reason = e.reason(),
                        "evergreen request failed, retrying in {}ms: {e}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<String>), StreakError> {
        let mut request = self.client.get(url).header("Accept", "application/json");
        if let (Some(user), Some(key)) = (&self.api_user, &self.api_key) {
            request = request.header("Api-User", user).header("Api-Key", key);
        }
        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StreakError::RateLimited);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(StreakError::AuthFailed {
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(1024)];
            let text = String::from_utf8_lossy(truncated);
            return Err(StreakError::Upstream {
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let next = next_link(response.headers());

        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_BYTES)
        {
            return Err(StreakError::Upstream {
                message: format!("response too large (max {MAX_RESPONSE_BYTES} bytes)"),
                status: None,
            });
        }

        let bytes = response.bytes().await.map_err(|e| StreakError::Upstream {
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(StreakError::Upstream {
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
                status: None,
            });
        }

        let parsed = serde_json::from_slice(&bytes)
            .map_err(|e| StreakError::SchemaParse(format!("{url}: {e}")))?;
        Ok((parsed, next))
    }
}

impl CiProvider for EvergreenClient {
    async fn recent_versions(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<VersionRef>, StreakError> {
        let mut versions: Vec<VersionRef> = Vec::new();
        let mut start = None;

        while versions.len() < limit {
            let page_size = VERSIONS_PAGE_SIZE.min(limit - versions.len());
            let page = self.versions_page(project, start, page_size).await?;
            let Some(lowest) = page.iter().map(|v| v.order).min() else {
                break;
            };
            versions.extend(page);
            if lowest <= 1 {
                break;
            }
            start = Some(lowest - 1);
        }

        versions.sort_by_key(|v| v.order);
        versions.dedup_by_key(|v| v.order);
        tracing::debug!(project, count = versions.len(), "listed versions");
        Ok(versions)
    }

    async fn load_version(
        &self,
        version: &VersionRef,
        required_marker: &str,
    ) -> Result<Version, StreakError> {
        // Collected first: a stream mapping over borrowed ids is not `Send`.
        let loads: Vec<_> = version
            .build_ids
            .iter()
            .map(|build_id| self.load_build(build_id, required_marker))
            .collect();
        let builds: Vec<Build> = stream::iter(loads)
            .buffered(self.max_concurrent_requests)
            .try_collect()
            .await?;

        tracing::debug!(
            order = version.order,
            builds = builds.len(),
            required = builds
                .iter()
                .filter(|b| b.display_name.starts_with(required_marker))
                .count(),
            "loaded version"
        );

        Ok(Version {
            version_id: version.version_id.clone(),
            order: version.order,
            project: version.project.clone(),
            builds,
        })
    }
}

/// Backoff before retry number `attempt + 1`, capped at `MAX_RETRY_DELAY`.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY)
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(parse_next_link)
}

fn parse_next_link(part: &str) -> Option<String> {
    let mut pieces = part.split(';').map(str::trim);
    let target = pieces.next()?;
    let is_next = pieces.any(|p| p == "rel=\"next\"" || p == "rel=next");
    if !is_next {
        return None;
    }
    target
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .map(str::to_string)
}
