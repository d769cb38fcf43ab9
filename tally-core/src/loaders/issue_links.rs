use super::{LoadReport, Loader};
use crate::connectors::IssueTracker;
use crate::context::Context;
use crate::error::Error;
use crate::models::NewIssueLink;
use crate::schema::issue_links;
use crate::store::Store;
use crate::Conn;

use tally_types::records::IssueRecord;

use async_trait::async_trait;
use diesel::prelude::*;
use time::OffsetDateTime;

use std::sync::Arc;

/// High-water mark category of this loader.
pub const CATEGORY: &str = "issue-links";

#[derive(Clone, Debug)]
pub struct IssueLinkLoaderConfig {
    /// Tracker query selecting the issues to link, in the tracker's own
    /// query language.
    pub filter: String,
}

impl Default for IssueLinkLoaderConfig {
    fn default() -> Self {
        IssueLinkLoaderConfig {
            filter: "labels = trt-incident".to_string(),
        }
    }
}

/// Keeps the issues picked by a standing tracker filter, typically CI
/// incidents, so the dashboard can link them to the window they were open.
pub struct IssueLinkLoader {
    store: Arc<Store>,
    tracker: Arc<dyn IssueTracker>,
    config: IssueLinkLoaderConfig,
}

impl IssueLinkLoader {
    pub fn new(store: Arc<Store>, tracker: Arc<dyn IssueTracker>, config: IssueLinkLoaderConfig) -> Self {
        IssueLinkLoader { store, tracker, config }
    }
}

fn write_issue_links(conn: &mut Conn, chunk: &[IssueRecord]) -> Result<usize, Error> {
    for issue in chunk {
        let labels = serde_json::to_string(&issue.labels)?;
        let link = NewIssueLink {
            external_id: &issue.id,
            key: &issue.key,
            labels: &labels,
            last_change_time: issue.last_change_time.unix_timestamp(),
            opened_at: issue.opened_at.unix_timestamp(),
            resolved_at: issue.resolved_at.map(|resolved| resolved.unix_timestamp()),
            status: &issue.status,
            summary: &issue.summary,
            url: &issue.url,
        };
        diesel::insert_into(issue_links::table)
            .values(&link)
            .on_conflict(issue_links::external_id)
            .do_update()
            .set(&link)
            .execute(conn)?;
    }
    Ok(chunk.len())
}

#[async_trait]
impl Loader for IssueLinkLoader {
    fn name(&self) -> &'static str {
        CATEGORY
    }

    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error> {
        let since = ctx
            .run(self.store.run(|_, conn| Store::high_water_mark(conn, CATEGORY)))
            .await??;
        let since = since.map(OffsetDateTime::from_unix_timestamp).transpose()?;
        tracing::info!(
            "searching the tracker for {:?} updated since {}",
            self.config.filter,
            since.map_or_else(|| "the beginning".to_string(), |since| since.to_string())
        );

        let mut report = LoadReport::default();
        let found = ctx.run(self.tracker.search_issues(&self.config.filter, since)).await?;
        let Some(issues) = report.triage("issue search", found)? else {
            return Ok(report);
        };
        let high_water = issues
            .iter()
            .map(|issue| issue.last_change_time.unix_timestamp())
            .max();

        ctx.check()?;
        let written = ctx
            .run(self.store.run(move |store, conn| {
                let written = store.write_chunked(conn, &issues, write_issue_links)?;
                if let Some(high_water) = high_water {
                    Store::set_high_water_mark(conn, CATEGORY, high_water, &[])?;
                }
                Ok(written)
            }))
            .await??;
        report.updated += written;
        Ok(report)
    }
}
