use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::{
    AgentError, BaseAgent, Capability, HandlerOutcome, LlmHandler, ProgressReporter, ResultStatus,
    Task, TaskHandler, TaskOutput,
};
use crate::config::AgentConfiguration;
use crate::github::{Issue, IssueSource, IssueState, NewPullRequest, ReviewAction};
use crate::providers::TextGenerator;

const DEFAULT_LIMIT: usize = 30;
const DEFAULT_BASE_BRANCH: &str = "main";

/// An agent for issue and pull-request work.
pub type GitHubAgent = BaseAgent<GitHubHandler>;

/// What a GitHub task asks for, read from the task context key `operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubOperation {
    SearchRepositories,
    ListIssues,
    ListPullRequests,
    CreateIssue,
    CreatePullRequest,
    ReviewPullRequest,
    AnalyzeIssues,
}

impl GitHubOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search_repositories" => Some(Self::SearchRepositories),
            "list_issues" => Some(Self::ListIssues),
            "list_pull_requests" => Some(Self::ListPullRequests),
            "create_issue" => Some(Self::CreateIssue),
            "create_pull_request" => Some(Self::CreatePullRequest),
            "review_pull_request" => Some(Self::ReviewPullRequest),
            "analyze_issues" => Some(Self::AnalyzeIssues),
            _ => None,
        }
    }

    /// Without an explicit operation, pull-request tasks list pull requests
    /// and everything else lists issues.
    fn for_task(task: &Task) -> Result<Self, AgentError> {
        match task.context_text("operation") {
            Some(op) => Self::parse(op).ok_or_else(|| AgentError::Execution(format!("unknown operation `{}`", op))),
            None if task.required_capabilities().contains(&Capability::PullRequestReview) => {
                Ok(Self::ListPullRequests)
            }
            None => Ok(Self::ListIssues),
        }
    }
}

pub struct GitHubHandler {
    source: Arc<dyn IssueSource>,
    analyst: Option<LlmHandler>,
    default_limit: usize,
}

impl GitHubHandler {
    pub fn new(source: Arc<dyn IssueSource>) -> Self {
        Self {
            source,
            analyst: None,
            default_limit: DEFAULT_LIMIT,
        }
    }

    /// Use a text generator for `analyze_issues`. Without one the analysis
    /// is a local digest.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.analyst = Some(LlmHandler::new(
            generator,
            "You are an experienced maintainer triaging a repository. Group related issues, call out the most urgent ones and suggest next steps.",
        ));
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    fn repo(task: &Task) -> Result<&str, AgentError> {
        task.context_text("repo")
            .ok_or_else(|| AgentError::Execution("missing context value `repo`".to_string()))
    }

    /// A context number that is a whole value of at least 1.
    fn positive_integer(task: &Task, key: &str) -> Option<u64> {
        task.context()
            .get(key)
            .and_then(|v| v.as_number())
            .filter(|n| *n >= 1.0 && n.fract() == 0.0 && *n <= u64::MAX as f64)
            .map(|n| n as u64)
    }

    fn limit(&self, task: &Task) -> usize {
        Self::positive_integer(task, "limit")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(self.default_limit)
    }

    fn state(task: &Task) -> IssueState {
        task.context_text("state").map(IssueState::parse).unwrap_or_default()
    }

    fn structured<T: Serialize>(value: &T) -> Result<TaskOutput, AgentError> {
        serde_json::to_value(value)
            .map(TaskOutput::Structured)
            .map_err(|e| AgentError::Execution(e.to_string()))
    }

    async fn analyze_issues(
        &self,
        task: &Task,
        progress: &ProgressReporter,
        config: &AgentConfiguration,
    ) -> Result<HandlerOutcome, AgentError> {
        let repo = Self::repo(task)?;
        let issues = self.source.list_issues(repo, Self::state(task), self.limit(task)).await?;
        progress.report("fetched issues", 0.3);

        let digest = issue_digest(repo, &issues);
        let (analysis, status) = match &self.analyst {
            Some(analyst) => {
                let request = Task::new(format!("Analyze issues in {}", repo), format!("{}\n\n{}", digest, task.query()))
                    .with_capability(Capability::TextAnalysis)
                    .with_timeout(task.remaining());
                let outcome = analyst.handle(&request, progress, config).await?;
                let text = outcome.output.as_text().unwrap_or_default().to_string();
                (text, outcome.status)
            }
            None => (digest, ResultStatus::Completed),
        };

        let output = Self::structured(&serde_json::json!({
            "repo": repo,
            "issues": issues,
            "analysis": analysis,
        }))?;
        Ok(HandlerOutcome {
            output,
            status,
            usage: None,
        })
    }
}

/// Plain-text overview of a set of issues: label counts and titles.
pub fn issue_digest(repo: &str, issues: &[Issue]) -> String {
    let mut labels: BTreeMap<&str, usize> = BTreeMap::new();
    for issue in issues {
        for label in &issue.labels {
            *labels.entry(label.name.as_str()).or_default() += 1;
        }
    }

    let mut out = format!("{} issue(s) in {}", issues.len(), repo);
    if !labels.is_empty() {
        let counts: Vec<String> = labels.iter().map(|(l, n)| format!("{} ({})", l, n)).collect();
        out.push_str(&format!("\nLabels: {}", counts.join(", ")));
    }
    for issue in issues {
        out.push_str(&format!("\n#{} {}", issue.number, issue.title));
    }
    out
}

#[async_trait]
impl TaskHandler for GitHubHandler {
    fn preprocess(&self, task: &Task) -> Result<Task, AgentError> {
        GitHubOperation::for_task(task)?;
        Ok(task.clone())
    }

    async fn handle(
        &self,
        task: &Task,
        progress: &ProgressReporter,
        config: &AgentConfiguration,
    ) -> Result<HandlerOutcome, AgentError> {
        let operation = GitHubOperation::for_task(task)?;
        debug!(task_id = %task.id(), ?operation, "Running GitHub operation");
        progress.report("calling GitHub", 0.1);

        let output = match operation {
            GitHubOperation::SearchRepositories => {
                let repos = self.source.search_repositories(task.query(), self.limit(task)).await?;
                Self::structured(&repos)?
            }
            GitHubOperation::ListIssues => {
                let issues = self
                    .source
                    .list_issues(Self::repo(task)?, Self::state(task), self.limit(task))
                    .await?;
                Self::structured(&issues)?
            }
            GitHubOperation::ListPullRequests => {
                let prs = self
                    .source
                    .list_pull_requests(Self::repo(task)?, Self::state(task), self.limit(task))
                    .await?;
                Self::structured(&prs)?
            }
            GitHubOperation::CreateIssue => {
                let title = task.context_text("title").unwrap_or(task.description());
                let body = task.context_text("body").unwrap_or(task.query());
                let created = self.source.create_issue(Self::repo(task)?, title, body).await?;
                Self::structured(&created)?
            }
            GitHubOperation::CreatePullRequest => {
                let head = task
                    .context_text("head")
                    .ok_or_else(|| AgentError::Execution("missing context value `head`".to_string()))?;
                let pr = NewPullRequest {
                    title: task.context_text("title").unwrap_or(task.description()).to_string(),
                    body: task.context_text("body").unwrap_or(task.query()).to_string(),
                    head: head.to_string(),
                    base: task.context_text("base").unwrap_or(DEFAULT_BASE_BRANCH).to_string(),
                };
                let created = self.source.create_pull_request(Self::repo(task)?, &pr).await?;
                Self::structured(&created)?
            }
            GitHubOperation::ReviewPullRequest => {
                let number = Self::positive_integer(task, "number").ok_or_else(|| {
                    AgentError::Execution("context value `number` must be a positive whole number".to_string())
                })?;
                let action = match task.context_text("action").unwrap_or("comment") {
                    "approve" => ReviewAction::Approve,
                    "request_changes" => ReviewAction::RequestChanges,
                    _ => ReviewAction::Comment,
                };
                self.source
                    .review_pull_request(Self::repo(task)?, number, action, task.query())
                    .await?;
                Self::structured(&serde_json::json!({ "number": number, "action": action }))?
            }
            GitHubOperation::AnalyzeIssues => return self.analyze_issues(task, progress, config).await,
        };

        progress.report("done", 1.0);
        Ok(HandlerOutcome::completed(output))
    }

    fn clear_cache(&self) {
        if let Some(analyst) = &self.analyst {
            analyst.clear_cache();
        }
    }
}

impl GitHubAgent {
    pub fn github(source: Arc<dyn IssueSource>) -> Self {
        BaseAgent::new(
            "GitHub Agent",
            [Capability::IssueTracking, Capability::PullRequestReview],
            GitHubHandler::new(source),
        )
    }

    pub fn github_with_analysis(
        source: Arc<dyn IssueSource>,
        generator: Arc<dyn TextGenerator>,
        default_limit: usize,
    ) -> Self {
        BaseAgent::new(
            "GitHub Agent",
            [
                Capability::IssueTracking,
                Capability::PullRequestReview,
                Capability::TextAnalysis,
            ],
            GitHubHandler::new(source)
                .with_generator(generator)
                .with_default_limit(default_limit),
        )
    }
}
