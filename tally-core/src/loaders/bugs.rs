use super::{LoadReport, Loader};
use crate::connectors::IssueTracker;
use crate::context::Context;
use crate::error::Error;
use crate::models::{NewBug, NewBugTest};
use crate::schema::{bug_tests, bugs, tests};
use crate::store::Store;
use crate::Conn;

use tally_types::records::BugRecord;

use async_trait::async_trait;
use diesel::prelude::*;

use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct BugLoaderConfig {
    /// Test names per tracker query.
    pub chunk_size: usize,
}

impl Default for BugLoaderConfig {
    fn default() -> Self {
        BugLoaderConfig { chunk_size: 50 }
    }
}

/// Links known tests to the tracker issues that mention them.
pub struct BugLoader {
    store: Arc<Store>,
    tracker: Arc<dyn IssueTracker>,
    config: BugLoaderConfig,
}

impl BugLoader {
    pub fn new(store: Arc<Store>, tracker: Arc<dyn IssueTracker>, config: BugLoaderConfig) -> Self {
        BugLoader { store, tracker, config }
    }
}

/// Folds records for the same issue, as returned by different queries,
/// into one with the union of their tests.
fn merge(records: impl IntoIterator<Item = BugRecord>) -> Vec<BugRecord> {
    let mut merged: BTreeMap<String, BugRecord> = BTreeMap::new();
    for record in records {
        match merged.get_mut(&record.id) {
            Some(existing) => existing.tests.extend(record.tests),
            None => {
                merged.insert(record.id.clone(), record);
            }
        }
    }
    merged
        .into_values()
        .map(|mut bug| {
            bug.tests.sort();
            bug.tests.dedup();
            bug
        })
        .collect()
}

fn write_bugs(conn: &mut Conn, chunk: &[BugRecord]) -> Result<usize, Error> {
    for bug in chunk {
        let components = serde_json::to_string(&bug.components)?;
        let affects_versions = serde_json::to_string(&bug.affects_versions)?;
        let fix_versions = serde_json::to_string(&bug.fix_versions)?;
        let new_bug = NewBug {
            affects_versions: &affects_versions,
            components: &components,
            external_id: &bug.id,
            fix_versions: &fix_versions,
            key: &bug.key,
            last_change_time: bug.last_change_time.unix_timestamp(),
            status: &bug.status,
            summary: &bug.summary,
            url: &bug.url,
        };
        let bug_id: i32 = diesel::insert_into(bugs::table)
            .values(&new_bug)
            .on_conflict(bugs::external_id)
            .do_update()
            .set(&new_bug)
            .returning(bugs::id)
            .get_result(conn)?;

        diesel::delete(bug_tests::table.filter(bug_tests::bug_id.eq(bug_id))).execute(conn)?;
        let test_ids: Vec<i32> = tests::table
            .filter(tests::name.eq_any(&bug.tests))
            .select(tests::id)
            .load(conn)?;
        let links: Vec<NewBugTest> = test_ids
            .into_iter()
            .map(|test_id| NewBugTest { bug_id, test_id })
            .collect();
        if !links.is_empty() {
            diesel::insert_into(bug_tests::table).values(&links).execute(conn)?;
        }
    }
    Ok(chunk.len())
}

#[async_trait]
impl Loader for BugLoader {
    fn name(&self) -> &'static str {
        "bugs"
    }

    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error> {
        let names: Vec<String> = ctx
            .run(self.store.run(|_, conn| {
                Ok(tests::table
                    .select(tests::name)
                    .order(tests::name.asc())
                    .load(conn)?)
            }))
            .await??;
        tracing::info!("searching the tracker for {} test(s)", names.len());

        let mut report = LoadReport::default();
        let mut records = Vec::new();
        for (i, chunk) in names.chunks(self.config.chunk_size.max(1)).enumerate() {
            ctx.check()?;
            let found = ctx.run(self.tracker.find_issues_for_tests(chunk)).await?;
            if let Some(found) = report.triage(&format!("test chunk {}", i), found)? {
                records.extend(found);
            }
        }

        let bugs = merge(records);
        let written = ctx
            .run(self.store.run(move |store, conn| store.write_chunked(conn, &bugs, write_bugs)))
            .await??;
        report.updated += written;
        Ok(report)
    }
}
