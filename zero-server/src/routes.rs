//! HTTP route handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use zero_core::error::{StoreError, ZeroError};
use zero_core::events::ScanEvent;
use zero_core::hub::job_topic;
use zero_core::suppress::Verdict;
use zero_core::types::{JobSnapshot, JobSpec, RepoId};

use crate::AppState;
use crate::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

fn parse_repo(owner: &str, name: &str) -> ApiResult<RepoId> {
    format!("{owner}/{name}")
        .parse()
        .map_err(ApiError::bad_request)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

// ── Repositories ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListReposQuery {
    pub owner: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_repos(
    State(state): State<AppState>,
    Query(query): Query<ListReposQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut repos = state.store.list_repos()?;
    if let Some(owner) = &query.owner {
        repos.retain(|repo| repo.owner().eq_ignore_ascii_case(owner));
    }
    let total = repos.len();
    let offset = query.offset.unwrap_or(0).min(total);
    let limit = query.limit.unwrap_or(100);

    let mut entries = Vec::new();
    for repo in repos.into_iter().skip(offset).take(limit) {
        let freshness = state.freshness.check(&repo, None)?;
        entries.push(json!({
            "repository": repo.to_string(),
            "last_scan": freshness.last_scan,
            "level": freshness.level,
            "needs_refresh": freshness.needs_refresh,
        }));
    }
    Ok(Json(json!({"total": total, "repos": entries})))
}

pub async fn repo_summary(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let repo = parse_repo(&owner, &name)?;
    let analyzers = state.store.list(&repo)?;
    let scans = state.store.list_scans(&repo)?;
    if analyzers.is_empty() && scans.is_empty() {
        return Err(ApiError::not_found(format!("unknown repository {repo}")));
    }
    let freshness = state.freshness.check(&repo, None)?;
    Ok(Json(json!({
        "repository": repo.to_string(),
        "analyzers": analyzers,
        "scan_count": scans.len(),
        "last_scan": scans.last(),
        "freshness": freshness,
    })))
}

pub async fn delete_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let repo = parse_repo(&owner, &name)?;
    state.store.delete(&repo)?;
    state.freshness.delete(&repo)?;
    info!(repo = %repo, "repository deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn repo_freshness(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<zero_core::freshness::FreshnessReport>> {
    let repo = parse_repo(&owner, &name)?;
    Ok(Json(state.freshness.check(&repo, None)?))
}

// ── Artifacts ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ArtifactQuery {
    /// Apply verdicts and context rules before returning findings.
    #[serde(default)]
    pub suppress: bool,
}

pub async fn read_artifact(
    State(state): State<AppState>,
    Path((owner, name, analyzer)): Path<(String, String, String)>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let repo = parse_repo(&owner, &name)?;
    if !query.suppress {
        return Ok(Json(state.store.read(&repo, &analyzer)?));
    }
    let envelope = state.store.read_envelope(&repo, &analyzer)?;
    let outcome = state.suppression.apply(envelope.findings.clone());
    let mut value = serde_json::to_value(&envelope)
        .map_err(|e| ZeroError::Store(StoreError::Serialization(e)))?;
    value["findings"] = serde_json::to_value(&outcome.findings)
        .map_err(|e| ZeroError::Store(StoreError::Serialization(e)))?;
    value["suppression"] = serde_json::to_value(&outcome.summary)
        .map_err(|e| ZeroError::Store(StoreError::Serialization(e)))?;
    Ok(Json(value))
}

pub async fn analysis_summary(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let repo = parse_repo(&owner, &name)?;
    let analyzers = state.store.list(&repo)?;
    if analyzers.is_empty() {
        return Err(ApiError::not_found(format!("no analysis for {repo}")));
    }

    let mut total: u64 = 0;
    let mut by_severity = std::collections::BTreeMap::new();
    let mut per_analyzer = serde_json::Map::new();
    for analyzer in &analyzers {
        let Ok(envelope) = state.store.read_envelope(&repo, analyzer) else {
            continue;
        };
        total += envelope.findings.len() as u64;
        for (key, count) in envelope.severity_counts() {
            *by_severity.entry(key).or_insert(0u64) += count;
        }
        per_analyzer.insert(
            analyzer.clone(),
            json!({
                "findings": envelope.findings.len(),
                "timestamp": envelope.timestamp,
            }),
        );
    }
    Ok(Json(json!({
        "repository": repo.to_string(),
        "total": total,
        "severity_counts": by_severity,
        "analyzers": per_analyzer,
    })))
}

// ── Scans ──────────────────────────────────────────────────────────

pub async fn list_scans(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<zero_core::types::ScanRecord>>> {
    let repo = parse_repo(&owner, &name)?;
    Ok(Json(state.store.list_scans(&repo)?))
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub base: u64,
    pub compare: u64,
}

pub async fn diff_scans(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<zero_core::diff::ScanDelta>> {
    let repo = parse_repo(&owner, &name)?;
    Ok(Json(state.diff.diff(&repo, query.base, query.compare)?))
}

pub async fn submit_scan(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if spec.target.trim().is_empty() {
        return Err(ApiError::validation("target must not be empty"));
    }
    if !spec.is_org && spec.target.parse::<RepoId>().is_err() {
        return Err(ApiError::validation(format!(
            "target {:?} is not an owner/name pair",
            spec.target
        )));
    }
    if !state.registry.has_profile(&spec.profile) {
        return Err(ApiError::validation(format!(
            "unknown profile {:?}",
            spec.profile
        )));
    }

    let job = state.queue.enqueue(spec)?;
    info!(job_id = %job.id(), "scan submitted");
    state.hub.publish(
        &job_topic(job.id()),
        &ScanEvent::JobStatus {
            job_id: job.id().to_string(),
            status: job.status(),
            error: None,
            progress: None,
        },
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"job_id": job.id(), "status": job.status()})),
    ))
}

pub async fn active_scans(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.queue.list_active())
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    /// Window in hours; default 24.
    pub hours: Option<u32>,
}

pub async fn recent_scans(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<JobSnapshot>> {
    let window = chrono::Duration::hours(i64::from(query.hours.unwrap_or(24)));
    Json(state.queue.list_recent(window))
}

pub async fn scan_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    Ok(Json(state.queue.get(&id)?))
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let snapshot = state.queue.cancel(&id)?;
    state.hub.publish(
        &job_topic(&id),
        &ScanEvent::JobStatus {
            job_id: id.clone(),
            status: snapshot.status,
            error: None,
            progress: Some(snapshot.progress.clone()),
        },
    );
    info!(job_id = %id, "scan canceled");
    Ok(Json(snapshot))
}

// ── Feedback ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub fingerprint: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn record_feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackBody>,
) -> ApiResult<(StatusCode, Json<zero_core::suppress::FeedbackRecord>)> {
    if body.fingerprint.trim().is_empty() {
        return Err(ApiError::validation("fingerprint must not be empty"));
    }
    let record = state
        .suppression
        .feedback()
        .record(body.fingerprint, body.verdict, body.note)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_feedback(
    State(state): State<AppState>,
) -> Json<Vec<zero_core::suppress::FeedbackRecord>> {
    Json(state.suppression.feedback().list())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_validation() {
        assert!(parse_repo("acme", "widget").is_ok());
        assert!(parse_repo("", "widget").is_err());
        assert!(parse_repo("acme", "wid/get").is_err());
        assert!(parse_repo("..", "widget").is_err());
    }
}
