pub mod bugs;
pub mod commenter;
pub mod issue_links;
pub mod job_runs;
pub mod ownership;
pub mod releases;

pub use bugs::{BugLoader, BugLoaderConfig};
pub use commenter::{CommentRequest, Commenter};
pub use issue_links::{IssueLinkLoader, IssueLinkLoaderConfig};
pub use job_runs::{JobRunLoader, JobRunLoaderConfig};
pub use ownership::TestOwnershipLoader;
pub use releases::{ReleaseLoader, ReleaseLoaderConfig};

use crate::connectors::{self, Row};
use crate::context::Context;
use crate::error::Error;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A problem confined to one item; the loader carries on without it.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display("{item}: {reason}")]
pub struct ItemError {
    pub item: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct LoadReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub item_errors: Vec<ItemError>,
}

impl LoadReport {
    pub fn item_error(&mut self, item: impl Into<String>, reason: impl std::fmt::Display) {
        let error = ItemError {
            item: item.into(),
            reason: reason.to_string(),
        };
        tracing::warn!("skipping {}", error);
        self.item_errors.push(error);
    }

    /// Fatal connector errors are returned, the others are recorded against
    /// `item`.
    pub fn triage<T>(&mut self, item: &str, res: Result<T, connectors::Error>) -> Result<Option<T>, Error> {
        match res {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                self.item_error(item, e);
                Ok(None)
            }
        }
    }

    /// Decodes warehouse rows, recording undecodable ones.
    pub fn decode_rows<T: DeserializeOwned>(&mut self, item: &str, rows: Vec<Row>) -> Vec<T> {
        rows.into_iter()
            .enumerate()
            .filter_map(|(i, row)| match serde_json::from_value(row.into()) {
                Ok(record) => Some(record),
                Err(e) => {
                    self.item_error(format!("{} row {}", item, i), e);
                    None
                }
            })
            .collect()
    }
}

/// One idempotent ingestion job. `Err` means the loader gave up; problems
/// with single items are reported in [`LoadReport::item_errors`].
#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error>;
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum LoaderKind {
    JobRuns,
    Releases,
    IssueLinks,
    Bugs,
    TestOwnership,
}
