//! Issue and pull-request data source.
//!
//! [`IssueSource`] is the boundary the GitHub agent works against;
//! [`GhCli`] implements it by running the GitHub CLI with `--json` output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::agents::{CredentialValidator, Credentials};

const ISSUE_FIELDS: &str = "number,title,body,state,author,labels,url,createdAt";
const PR_FIELDS: &str = "number,title,body,state,author,url,headRefName,baseRefName";
const REPO_FIELDS: &str = "fullName,description,url,stargazersCount";

#[derive(Debug, thiserror::Error)]
pub enum GhError {
    #[error("GitHub CLI not found: {0}")]
    NotInstalled(String),

    #[error("`{}` exited with code {}: {}", .command, format_exit_code(.exit_code), .stderr)]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to parse CLI output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
    All,
}

impl IssueState {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "closed" => IssueState::Closed,
            "all" => IssueState::All,
            _ => IssueState::Open,
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
            IssueState::All => "all",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewAction {
    fn flag(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "--approve",
            ReviewAction::RequestChanges => "--request-changes",
            ReviewAction::Comment => "--comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub stargazers_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    #[serde(default)]
    pub author: Option<Author>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    #[serde(default)]
    pub author: Option<Author>,
    pub url: String,
    #[serde(default)]
    pub head_ref_name: String,
    #[serde(default)]
    pub base_ref_name: String,
}

/// Something the CLI created, identified by its URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedItem {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn search_repositories(&self, query: &str, limit: usize) -> Result<Vec<Repository>, GhError>;

    async fn list_issues(&self, repo: &str, state: IssueState, limit: usize) -> Result<Vec<Issue>, GhError>;

    async fn list_pull_requests(&self, repo: &str, state: IssueState, limit: usize) -> Result<Vec<PullRequest>, GhError>;

    async fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<CreatedItem, GhError>;

    async fn create_pull_request(&self, repo: &str, pr: &NewPullRequest) -> Result<CreatedItem, GhError>;

    async fn review_pull_request(&self, repo: &str, number: u64, action: ReviewAction, body: &str) -> Result<(), GhError>;
}

/// Runs the `gh` binary.
pub struct GhCli {
    binary: String,
    token: Option<String>,
}

impl GhCli {
    pub fn new() -> Self {
        Self::with_binary("gh")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn resolve(&self) -> Result<PathBuf, GhError> {
        which::which(&self.binary).map_err(|e| GhError::NotInstalled(format!("{}: {}", self.binary, e)))
    }

    async fn run(&self, args: &[String], token: Option<&str>) -> Result<String, GhError> {
        let path = self.resolve()?;
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "Running GitHub CLI");

        let mut cmd = Command::new(path);
        cmd.args(args).kill_on_drop(true);
        if let Some(token) = token.or(self.token.as_deref()) {
            cmd.env("GH_TOKEN", token);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(GhError::CommandFailed {
                command,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: serde::de::DeserializeOwned + Send>(&self, args: &[String]) -> Result<T, GhError> {
        let stdout = self.run(args, None).await?;
        parse_json(&stdout)
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<T, GhError> {
    serde_json::from_str(stdout).map_err(|e| GhError::Parse(e.to_string()))
}

fn created_item(stdout: &str) -> Result<CreatedItem, GhError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("http"))
        .last()
        .map(|url| CreatedItem { url: url.to_string() })
        .ok_or_else(|| GhError::Parse(format!("no URL in output: {}", stdout.trim())))
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl IssueSource for GhCli {
    async fn search_repositories(&self, query: &str, limit: usize) -> Result<Vec<Repository>, GhError> {
        let limit = limit.to_string();
        self.run_json(&args(&["search", "repos", query, "--limit", &limit, "--json", REPO_FIELDS]))
            .await
    }

    async fn list_issues(&self, repo: &str, state: IssueState, limit: usize) -> Result<Vec<Issue>, GhError> {
        let (state, limit) = (state.to_string(), limit.to_string());
        self.run_json(&args(&[
            "issue", "list", "--repo", repo, "--state", &state, "--limit", &limit, "--json", ISSUE_FIELDS,
        ]))
        .await
    }

    async fn list_pull_requests(&self, repo: &str, state: IssueState, limit: usize) -> Result<Vec<PullRequest>, GhError> {
        let (state, limit) = (state.to_string(), limit.to_string());
        self.run_json(&args(&[
            "pr", "list", "--repo", repo, "--state", &state, "--limit", &limit, "--json", PR_FIELDS,
        ]))
        .await
    }

    async fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<CreatedItem, GhError> {
        let stdout = self
            .run(&args(&["issue", "create", "--repo", repo, "--title", title, "--body", body]), None)
            .await?;
        created_item(&stdout)
    }

    async fn create_pull_request(&self, repo: &str, pr: &NewPullRequest) -> Result<CreatedItem, GhError> {
        let stdout = self
            .run(
                &args(&[
                    "pr", "create", "--repo", repo, "--title", &pr.title, "--body", &pr.body, "--head", &pr.head,
                    "--base", &pr.base,
                ]),
                None,
            )
            .await?;
        created_item(&stdout)
    }

    async fn review_pull_request(&self, repo: &str, number: u64, action: ReviewAction, body: &str) -> Result<(), GhError> {
        let number = number.to_string();
        self.run(
            &args(&["pr", "review", &number, "--repo", repo, action.flag(), "--body", body]),
            None,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CredentialValidator for GhCli {
    async fn validate(&self, credentials: &Credentials) -> Result<(), String> {
        self.run(&args(&["auth", "status"]), credentials.github_token.as_deref())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
