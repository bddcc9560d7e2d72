//! GitHub Actions CI capability.
//!
//! A pushed commit usually triggers several workflows. The pipeline is
//! pending until every run for the commit has completed, failed if any of
//! them concluded badly, and passed otherwise.

use async_trait::async_trait;
use std::fmt::Write as _;
use tracing::debug;

use super::github::{GitHubClient, WorkflowRun};
use super::parse_owner_repo;
use crate::capabilities::{CiProvider, PipelineRef, PipelineStatus};
use crate::error::CiError;

/// Conclusions that count as a failed pipeline.
const FAILED_CONCLUSIONS: &[&str] = &[
    "failure",
    "cancelled",
    "timed_out",
    "action_required",
    "startup_failure",
];

/// Combine the runs of one commit into a single pipeline status.
#[must_use]
pub fn pipeline_status(runs: &[WorkflowRun]) -> PipelineStatus {
    if runs.is_empty() {
        return PipelineStatus::Pending;
    }
    if runs
        .iter()
        .any(|run| run.status.as_deref() != Some("completed"))
    {
        return PipelineStatus::Pending;
    }
    let failed = runs.iter().any(|run| {
        run.conclusion
            .as_deref()
            .is_some_and(|c| FAILED_CONCLUSIONS.contains(&c))
    });
    if failed {
        PipelineStatus::Failed
    } else {
        PipelineStatus::Passed
    }
}

/// CI provider backed by the GitHub Actions API.
#[derive(Debug, Clone)]
pub struct GitHubActions {
    client: GitHubClient,
}

impl GitHubActions {
    #[must_use]
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }

    async fn runs(&self, pipeline: &PipelineRef) -> Result<(String, String, Vec<WorkflowRun>), CiError> {
        let (owner, repo) = parse_owner_repo(&pipeline.repo_url)
            .ok_or_else(|| CiError::Fatal(format!("Not a GitHub repository: {}", pipeline.repo_url)))?;
        let runs = self
            .client
            .workflow_runs(&owner, &repo, &pipeline.branch, &pipeline.commit_sha)
            .await?;
        Ok((owner, repo, runs))
    }
}

#[async_trait]
impl CiProvider for GitHubActions {
    async fn query_status(&self, pipeline: &PipelineRef) -> Result<PipelineStatus, CiError> {
        let (_, _, runs) = self.runs(pipeline).await?;
        let status = pipeline_status(&runs);
        debug!(sha = %pipeline.commit_sha, runs = runs.len(), ?status, "Queried workflow runs");
        Ok(status)
    }

    async fn fetch_logs(&self, pipeline: &PipelineRef) -> Result<String, CiError> {
        let (owner, repo, runs) = self.runs(pipeline).await?;

        let mut summary = String::new();
        for run in runs.iter().filter(|run| {
            run.conclusion
                .as_deref()
                .is_some_and(|c| FAILED_CONCLUSIONS.contains(&c))
        }) {
            let _ = writeln!(
                summary,
                "Workflow '{}' {} ({})",
                run.name.as_deref().unwrap_or("unnamed"),
                run.conclusion.as_deref().unwrap_or("unknown"),
                run.html_url
            );
            for job in self.client.workflow_jobs(&owner, &repo, run.id).await? {
                if job.conclusion.as_deref() != Some("failure") {
                    continue;
                }
                let _ = writeln!(summary, "  job '{}' failed", job.name);
                for step in job
                    .steps
                    .iter()
                    .filter(|s| s.conclusion.as_deref() == Some("failure"))
                {
                    let _ = writeln!(summary, "    step '{}' failed", step.name);
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline() -> PipelineRef {
        PipelineRef {
            repo_url: "https://github.com/acme/widgets".into(),
            branch: "RIFT_ADA_AI_Fix".into(),
            commit_sha: "abc123".into(),
        }
    }

    fn run(id: u64, status: &str, conclusion: Option<&str>) -> serde_json::Value {
        json!({
            "id": id,
            "name": format!("ci-{id}"),
            "head_sha": "abc123",
            "status": status,
            "conclusion": conclusion,
            "html_url": format!("https://github.com/acme/widgets/actions/runs/{id}"),
        })
    }

    async fn provider(server: &MockServer) -> GitHubActions {
        GitHubActions::new(GitHubClient::new(&server.uri(), Some("token".into())).unwrap())
    }

    async fn mount_runs(server: &MockServer, runs: Vec<serde_json::Value>) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs"))
            .and(query_param("head_sha", "abc123"))
            .and(query_param("branch", "RIFT_ADA_AI_Fix"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "workflow_runs": runs })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_no_runs_yet_is_pending() {
        let server = MockServer::start().await;
        mount_runs(&server, vec![]).await;

        let status = provider(&server).await.query_status(&pipeline()).await.unwrap();
        assert_eq!(status, PipelineStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_combines_runs() {
        let server = MockServer::start().await;
        mount_runs(
            &server,
            vec![
                run(1, "completed", Some("success")),
                run(2, "completed", Some("failure")),
            ],
        )
        .await;

        let status = provider(&server).await.query_status(&pipeline()).await.unwrap();
        assert_eq!(status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .query_status(&pipeline())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_credentials_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .query_status(&pipeline())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Bad credentials"));
    }

    #[tokio::test]
    async fn test_fetch_logs_summarises_failed_steps() {
        let server = MockServer::start().await;
        mount_runs(&server, vec![run(7, "completed", Some("failure"))]).await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/7/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobs": [
                    {
                        "name": "test",
                        "conclusion": "failure",
                        "steps": [
                            { "name": "checkout", "conclusion": "success" },
                            { "name": "pytest", "conclusion": "failure" }
                        ]
                    },
                    { "name": "lint", "conclusion": "success", "steps": [] }
                ]
            })))
            .mount(&server)
            .await;

        let summary = provider(&server).await.fetch_logs(&pipeline()).await.unwrap();
        assert!(summary.contains("Workflow 'ci-7' failure"));
        assert!(summary.contains("job 'test' failed"));
        assert!(summary.contains("step 'pytest' failed"));
        assert!(!summary.contains("lint"));
    }

    #[test]
    fn test_pipeline_status_in_progress() {
        let runs: Vec<WorkflowRun> = serde_json::from_value(json!([
            run(1, "completed", Some("success")),
            run(2, "in_progress", None),
        ]))
        .unwrap();
        assert_eq!(pipeline_status(&runs), PipelineStatus::Pending);
    }

    #[tokio::test]
    async fn test_non_github_url_is_fatal() {
        let client = GitHubClient::new("http://127.0.0.1:9", None).unwrap();
        let mut pipeline = pipeline();
        pipeline.repo_url = "https://gitlab.com/acme/widgets".into();

        let err = GitHubActions::new(client)
            .query_status(&pipeline)
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Fatal(_)));
    }
}
