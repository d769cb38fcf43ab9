use super::{CommentRequest, Commenter, LoadReport, Loader};
use crate::connectors::ObjectStore;
use crate::context::Context;
use crate::error::Error;
use crate::models::{NewJob, NewJobRun, NewTestResult};
use crate::schema::{job_runs, jobs, test_results};
use crate::store::Store;
use crate::suites::SuiteRegistry;
use crate::synthetic::SyntheticTests;
use crate::variants::{self, VariantClassifier};
use crate::Conn;

use tally_types::artifacts::{PullRequestRef, RawJobRun};
use tally_types::{RunOutcome, TestStatus};

use async_trait::async_trait;
use diesel::prelude::*;
use futures::StreamExt;
use time::OffsetDateTime;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// High-water mark category of this loader.
pub const CATEGORY: &str = "job-runs";

#[derive(Clone, Debug, Default)]
pub struct JobRunLoaderConfig {
    /// Where the artifacts live in the object store.
    pub prefix: String,
    /// Releases to keep; empty keeps every release.
    pub releases: Vec<String>,
}

/// Ingests job-run artifacts from the object store.
pub struct JobRunLoader {
    store: Arc<Store>,
    objects: Arc<dyn ObjectStore>,
    variants: Arc<dyn VariantClassifier>,
    synthetic: Arc<dyn SyntheticTests>,
    commenter: Option<Commenter>,
    config: JobRunLoaderConfig,
}

#[derive(Debug)]
struct PreparedResult {
    suite_id: Option<i32>,
    test: String,
    invocation: i32,
    status: TestStatus,
}

/// A job run after classification and normalization, ready to be written.
#[derive(Debug)]
struct PreparedRun {
    external_id: String,
    job: String,
    release: String,
    variants: String,
    never_stable: bool,
    started_at: i64,
    outcome: RunOutcome,
    url: Option<String>,
    artifacts: String,
    results: Vec<PreparedResult>,
    pull_requests: Vec<PullRequestRef>,
}

impl PreparedRun {
    fn rows(&self) -> usize {
        1 + self.results.len()
    }

    fn failed_tests(&self) -> Vec<String> {
        let failed: BTreeSet<&str> = self
            .results
            .iter()
            .filter(|result| result.status.is_failure())
            .map(|result| result.test.as_str())
            .collect();
        failed.into_iter().map(String::from).collect()
    }
}

#[derive(Debug, Default)]
struct Batch {
    runs: Vec<PreparedRun>,
    rows: usize,
    /// Newest update second seen and the artifacts updated at it.
    high_water: Option<(i64, Vec<String>)>,
}

impl Batch {
    fn observe(&mut self, updated: OffsetDateTime, id: &str) {
        let updated = updated.unix_timestamp();
        match &mut self.high_water {
            Some((current, ids)) if *current == updated => ids.push(id.to_string()),
            Some((current, _)) if *current > updated => {}
            slot => *slot = Some((updated, vec![id.to_string()])),
        }
    }

    fn push(&mut self, run: PreparedRun) {
        self.rows += run.rows();
        self.runs.push(run);
    }

    fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.high_water.is_none()
    }
}

#[derive(Debug, Default)]
struct Flushed {
    /// Indices of the runs seen for the first time.
    inserted: Vec<usize>,
    duplicates: usize,
    tests: usize,
    results: usize,
}

impl JobRunLoader {
    pub fn new(
        store: Arc<Store>,
        objects: Arc<dyn ObjectStore>,
        variants: Arc<dyn VariantClassifier>,
        synthetic: Arc<dyn SyntheticTests>,
        config: JobRunLoaderConfig,
    ) -> Self {
        JobRunLoader {
            store,
            objects,
            variants,
            synthetic,
            commenter: None,
            config,
        }
    }

    pub fn with_commenter(mut self, commenter: Commenter) -> Self {
        self.commenter = Some(commenter);
        self
    }

    fn prepare(&self, mut raw: RawJobRun, release: String, registry: &SuiteRegistry) -> Result<PreparedRun, Error> {
        let variants = self
            .variants
            .identify_variants(&raw.job, &release, &raw.cluster_data);
        let synthetic = self.synthetic.synthesize(&raw);
        raw.tests.extend(synthetic);

        let started_at = raw.started_at.unix_timestamp();
        let mut occurrences: HashMap<String, i32> = HashMap::new();
        let results = raw
            .tests
            .iter()
            .map(|test| {
                let normalized = registry.split(&test.name);
                let occurrence = occurrences.entry(normalized.name.to_string()).or_insert(0);
                let invocation = *occurrence;
                *occurrence += 1;
                PreparedResult {
                    suite_id: normalized.suite.map(|suite| suite.id),
                    test: normalized.name.to_string(),
                    invocation,
                    status: test.status,
                }
            })
            .collect();

        Ok(PreparedRun {
            never_stable: self.variants.is_job_never_stable(&raw.job),
            variants: serde_json::to_string(&variants)?,
            artifacts: serde_json::to_string(&raw.artifacts)?,
            external_id: raw.id,
            job: raw.job,
            release,
            started_at,
            outcome: raw.outcome,
            url: raw.url,
            results,
            pull_requests: raw.pull_requests,
        })
    }

    async fn flush(
        &self,
        ctx: &Context,
        batch: &mut Batch,
        report: &mut LoadReport,
        comments: &mut Vec<CommentRequest>,
    ) -> Result<(), Error> {
        let Batch { runs, high_water, .. } = std::mem::take(batch);
        let (runs, flushed) = ctx
            .run(self.store.run(move |store, conn| {
                let flushed = conn.transaction::<_, Error, _>(|conn| write_runs(store, conn, &runs, high_water))?;
                Ok((runs, flushed))
            }))
            .await??;

        tracing::debug!(
            "committed {} new run(s), {} test(s), {} result(s); {} duplicate run(s)",
            flushed.inserted.len(),
            flushed.tests,
            flushed.results,
            flushed.duplicates
        );
        report.inserted += flushed.inserted.len() + flushed.tests + flushed.results;
        report.skipped += flushed.duplicates;

        if let Some(commenter) = &self.commenter {
            for run in flushed.inserted.iter().map(|&i| &runs[i]) {
                if !run.outcome.is_failure() {
                    continue;
                }
                let failed_tests = run.failed_tests();
                comments.extend(run.pull_requests.iter().filter_map(|pull_request| {
                    commenter.request_for(&run.job, &run.external_id, run.url.as_deref(), &failed_tests, pull_request)
                }));
            }
        }
        Ok(())
    }
}

fn upsert_job(conn: &mut Conn, run: &PreparedRun, now: i64) -> Result<i32, Error> {
    let job = NewJob {
        name: &run.job,
        never_stable: run.never_stable,
        release: &run.release,
        time_updated: now,
        variants: &run.variants,
    };
    Ok(diesel::insert_into(jobs::table)
        .values(&job)
        .on_conflict(jobs::name)
        .do_update()
        .set(&job)
        .returning(jobs::id)
        .get_result(conn)?)
}

/// Writes one batch. Must run inside a transaction so that the batch and
/// the advanced high-water mark commit together.
fn write_runs(
    store: &Store,
    conn: &mut Conn,
    runs: &[PreparedRun],
    high_water: Option<(i64, Vec<String>)>,
) -> Result<Flushed, Error> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let mut flushed = Flushed::default();
    let mut fresh = Vec::new();
    for (i, run) in runs.iter().enumerate() {
        let job_id = upsert_job(conn, run, now)?;
        let run_id: Option<i32> = diesel::insert_into(job_runs::table)
            .values(NewJobRun {
                artifacts: &run.artifacts,
                external_id: &run.external_id,
                job_id,
                outcome: run.outcome.into(),
                started_at: run.started_at,
                url: run.url.as_deref(),
            })
            .on_conflict(job_runs::external_id)
            .do_nothing()
            .returning(job_runs::id)
            .get_result(conn)
            .optional()?;
        match run_id {
            Some(run_id) => {
                flushed.inserted.push(i);
                fresh.push((run_id, run));
            }
            None => {
                tracing::trace!("job run {} is already stored", run.external_id);
                flushed.duplicates += 1;
            }
        }
    }

    let names: Vec<&str> = fresh
        .iter()
        .flat_map(|(_, run)| run.results.iter().map(|result| result.test.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let (test_ids, created) = store.ensure_tests(conn, &names)?;
    flushed.tests = created;

    let test_ids = &test_ids;
    let rows = fresh
        .iter()
        .flat_map(|&(run_id, run)| {
            run.results.iter().map(move |result| -> Result<NewTestResult, Error> {
                let test_id = test_ids
                    .get(&result.test)
                    .copied()
                    .ok_or(Error::UnexpectedDatabaseError(diesel::result::Error::NotFound))?;
                Ok(NewTestResult {
                    invocation: result.invocation,
                    job_run_id: run_id,
                    status: result.status.into(),
                    suite_id: result.suite_id,
                    test_id,
                    timestamp: run.started_at,
                })
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    for chunk in rows.chunks(store.batch_size()) {
        flushed.results += diesel::insert_into(test_results::table)
            .values(chunk)
            .execute(conn)?;
    }

    if let Some((value, ids)) = high_water {
        Store::set_high_water_mark(conn, CATEGORY, value, &ids)?;
    }
    Ok(flushed)
}

#[async_trait]
impl Loader for JobRunLoader {
    fn name(&self) -> &'static str {
        CATEGORY
    }

    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error> {
        let (registry, mark, seen) = ctx
            .run(self.store.run(|_, conn| {
                let registry = SuiteRegistry::load(conn)?;
                let mark = Store::high_water_mark(conn, CATEGORY)?;
                let seen = Store::high_water_items(conn, CATEGORY)?;
                Ok((registry, mark, seen))
            }))
            .await??;
        let since = mark.map(OffsetDateTime::from_unix_timestamp).transpose()?;
        tracing::info!(
            "listing job-run artifacts under {:?} updated since {}",
            self.config.prefix,
            since.map_or_else(|| "the beginning".to_string(), |since| since.to_string())
        );

        let mut report = LoadReport::default();
        let mut batch = Batch::default();
        let mut comments = Vec::new();
        let mut artifacts = self.objects.list_run_artifacts(&self.config.prefix, since);
        while let Some(listed) = ctx.run(artifacts.next()).await? {
            let Some(artifact) = report.triage("artifact listing", listed)? else {
                continue;
            };
            // Listing includes the mark second, whose artifacts may already be done.
            if mark == Some(artifact.updated.unix_timestamp()) && seen.contains(&artifact.id) {
                tracing::trace!("artifact {} was processed by an earlier load", artifact.id);
                report.skipped += 1;
                continue;
            }
            batch.observe(artifact.updated, &artifact.id);

            let fetched = ctx.run(self.objects.fetch_artifact(&artifact.id)).await?;
            let Some(bytes) = report.triage(&artifact.id, fetched)? else {
                continue;
            };
            let raw: RawJobRun = match serde_json::from_slice(&bytes) {
                Ok(raw) => raw,
                Err(e) => {
                    report.item_error(&artifact.id, format!("malformed artifact: {}", e));
                    continue;
                }
            };
            let release = raw
                .release
                .clone()
                .filter(|release| !release.is_empty())
                .or_else(|| variants::release_from_job_name(&raw.job))
                .unwrap_or_default();
            if !self.config.releases.is_empty() && !self.config.releases.contains(&release) {
                tracing::trace!("skipping run {} of release {:?}", raw.id, release);
                report.skipped += 1;
                continue;
            }

            batch.push(self.prepare(raw, release, &registry)?);
            if batch.rows >= self.store.batch_size() {
                ctx.check()?;
                self.flush(ctx, &mut batch, &mut report, &mut comments).await?;
            }
        }
        if !batch.is_empty() {
            ctx.check()?;
            self.flush(ctx, &mut batch, &mut report, &mut comments).await?;
        }

        if let Some(commenter) = &self.commenter {
            let requested = comments.len();
            let posted = commenter.post_all(ctx, comments).await;
            tracing::info!("posted {} of {} pull request comment(s)", posted, requested);
        }
        Ok(report)
    }
}
