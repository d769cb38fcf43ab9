//! Read-only clients for the systems the loaders pull from.

mod bigquery;
mod github;
mod jira;
mod object_store;

pub use bigquery::BigQueryWarehouse;
pub use github::GithubClient;
pub use jira::JiraTracker;
pub use object_store::FsObjectStore;

use tally_types::records::{BugRecord, IssueRecord, PullRequestInfo};

use async_trait::async_trait;
use futures::stream::BoxStream;
use time::OffsetDateTime;

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Error {
    #[display("{_0}: unauthorized")]
    Unauthorized(String),
    #[display("{_0}: unreachable")]
    Unreachable(String),
    #[display("{_0}: not found")]
    NotFound(String),
    #[display("Bad response: {_0}")]
    BadResponse(String),
}

impl Error {
    /// Fatal errors abort the loader that hit them; the others only spoil
    /// the item being read.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Unreachable(_))
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        let target = e
            .url()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "request".to_string());
        if e.is_connect() || e.is_timeout() {
            Error::Unreachable(target)
        } else {
            Error::BadResponse(e.to_string())
        }
    }
}

/// Maps HTTP error statuses onto connector errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    let url = response.url().to_string();
    match status.as_u16() {
        200..=299 => Ok(response),
        401 | 403 => Err(Error::Unauthorized(url)),
        404 => Err(Error::NotFound(url)),
        502..=504 => Err(Error::Unreachable(url)),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::BadResponse(format!("HTTP {} from {}: {}", status.as_u16(), url, body)))
        }
    }
}

/// A job-run artifact as listed by the object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactRef {
    pub id: String,
    pub updated: OffsetDateTime,
}

/// One warehouse row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;
/// Named string parameters of a warehouse query.
pub type Params = BTreeMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists the artifacts under `prefix` updated at or after `since`, in
    /// ascending update order. The listing is lazy.
    fn list_run_artifacts<'a>(
        &'a self,
        prefix: &'a str,
        since: Option<OffsetDateTime>,
    ) -> BoxStream<'a, Result<ArtifactRef, Error>>;

    async fn fetch_artifact(&self, id: &str) -> Result<Vec<u8>, Error>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, Error>;
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Issues mentioning any of `names`; each record lists which of the
    /// names it mentions.
    async fn find_issues_for_tests(&self, names: &[String]) -> Result<Vec<BugRecord>, Error>;

    /// Issues matched by a standing tracker `filter`, restricted to those
    /// updated at or after `since` when given.
    async fn search_issues(&self, filter: &str, since: Option<OffsetDateTime>) -> Result<Vec<IssueRecord>, Error>;
}

#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Pull requests of `repo`, given as `org/repo`.
    async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequestInfo>, Error>;
    async fn post_comment(&self, repo: &str, number: u64, text: &str) -> Result<(), Error>;
}
