use super::{LoadReport, Loader};
use crate::connectors::{Params, SourceHost, Warehouse};
use crate::context::Context;
use crate::error::Error;
use crate::models::{NewPullRequest, NewReleaseTag, NewReleaseTagPullRequest};
use crate::schema::{pull_requests, release_tag_pull_requests, release_tags};
use crate::store::Store;
use crate::Conn;

use tally_types::records::{PullRequestInfo, ReleasePullRequestRecord, ReleaseTagRecord};

use async_trait::async_trait;
use diesel::prelude::*;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const RELEASE_TAGS_QUERY: &str = "SELECT release_tag, release, architecture, phase, reject_reason, \
     UNIX_SECONDS(release_time) AS release_time, forced \
     FROM release_tags \
     WHERE release = @release AND architecture = @architecture \
     ORDER BY release_time";

pub const RELEASE_PULL_REQUESTS_QUERY: &str = "SELECT release_tag, url, org, repo, number, sha \
     FROM release_pull_requests \
     WHERE release = @release AND architecture = @architecture";

#[derive(Clone, Debug, Default)]
pub struct ReleaseLoaderConfig {
    pub releases: Vec<String>,
    pub architectures: Vec<String>,
}

/// Loads release payload tags and the pull requests they shipped.
pub struct ReleaseLoader {
    store: Arc<Store>,
    warehouse: Arc<dyn Warehouse>,
    source_host: Option<Arc<dyn SourceHost>>,
    config: ReleaseLoaderConfig,
}

type PullRequestKey = (String, u64);

impl ReleaseLoader {
    pub fn new(store: Arc<Store>, warehouse: Arc<dyn Warehouse>, config: ReleaseLoaderConfig) -> Self {
        ReleaseLoader {
            store,
            warehouse,
            source_host: None,
            config,
        }
    }

    /// Pull requests are enriched with their title and merge time when a
    /// source host is available.
    pub fn with_source_host(mut self, source_host: Arc<dyn SourceHost>) -> Self {
        self.source_host = Some(source_host);
        self
    }

    async fn enrich(
        &self,
        ctx: &Context,
        pulls: &[ReleasePullRequestRecord],
        known: &mut HashMap<String, Vec<PullRequestInfo>>,
        report: &mut LoadReport,
    ) -> Result<HashMap<PullRequestKey, PullRequestInfo>, Error> {
        let Some(source_host) = &self.source_host else {
            return Ok(HashMap::new());
        };
        let repos: BTreeSet<String> = pulls.iter().map(|pull| format!("{}/{}", pull.org, pull.repo)).collect();
        for repo in repos {
            if known.contains_key(&repo) {
                continue;
            }
            let listed = ctx.run(source_host.list_pull_requests(&repo)).await?;
            // A repository that cannot be listed is remembered as empty.
            let infos = report.triage(&repo, listed)?.unwrap_or_default();
            known.insert(repo, infos);
        }
        Ok(pulls
            .iter()
            .filter_map(|pull| {
                let repo = format!("{}/{}", pull.org, pull.repo);
                let info = known.get(&repo)?.iter().find(|info| info.number == pull.number)?;
                Some(((repo, pull.number), info.clone()))
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct Written {
    tags: usize,
    pull_requests: usize,
    links: usize,
}

fn write_release(
    conn: &mut Conn,
    tags: &[ReleaseTagRecord],
    pulls: &[ReleasePullRequestRecord],
    details: &HashMap<PullRequestKey, PullRequestInfo>,
) -> Result<Written, Error> {
    let mut written = Written::default();
    let mut tag_ids = HashMap::new();
    for tag in tags {
        let new_tag = NewReleaseTag {
            architecture: &tag.architecture,
            forced: tag.forced,
            phase: &tag.phase,
            reject_reason: tag.reject_reason.as_deref(),
            release: &tag.release,
            release_time: tag.release_time.unix_timestamp(),
            tag: &tag.release_tag,
        };
        let id: i32 = diesel::insert_into(release_tags::table)
            .values(&new_tag)
            .on_conflict(release_tags::tag)
            .do_update()
            .set(&new_tag)
            .returning(release_tags::id)
            .get_result(conn)?;
        tag_ids.insert(tag.release_tag.as_str(), id);
        written.tags += 1;
    }

    for pull in pulls {
        let tag_id = match tag_ids.get(pull.release_tag.as_str()) {
            Some(id) => *id,
            None => match release_tags::table
                .filter(release_tags::tag.eq(&pull.release_tag))
                .select(release_tags::id)
                .first::<i32>(conn)
                .optional()?
            {
                Some(id) => id,
                None => {
                    tracing::debug!("pull request {} references unknown tag {}", pull.url, pull.release_tag);
                    continue;
                }
            },
        };
        let info = details.get(&(format!("{}/{}", pull.org, pull.repo), pull.number));
        let new_pull = NewPullRequest {
            merged_at: info.and_then(|info| info.merged_at).map(|t| t.unix_timestamp()),
            number: pull.number as i64,
            org: &pull.org,
            repo: &pull.repo,
            sha: &pull.sha,
            title: info.map(|info| info.title.as_str()),
            url: &pull.url,
        };
        let pull_id: i32 = diesel::insert_into(pull_requests::table)
            .values(&new_pull)
            .on_conflict(pull_requests::url)
            .do_update()
            .set(&new_pull)
            .returning(pull_requests::id)
            .get_result(conn)?;
        written.pull_requests += 1;
        written.links += diesel::insert_into(release_tag_pull_requests::table)
            .values(NewReleaseTagPullRequest {
                pull_request_id: pull_id,
                release_tag_id: tag_id,
            })
            .on_conflict_do_nothing()
            .execute(conn)?;
    }
    Ok(written)
}

#[async_trait]
impl Loader for ReleaseLoader {
    fn name(&self) -> &'static str {
        "releases"
    }

    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error> {
        let mut report = LoadReport::default();
        let mut known = HashMap::new();
        for release in &self.config.releases {
            for architecture in &self.config.architectures {
                ctx.check()?;
                let item = format!("{}/{}", release, architecture);
                let params = Params::from([
                    ("release".to_string(), release.clone()),
                    ("architecture".to_string(), architecture.clone()),
                ]);

                let rows = ctx.run(self.warehouse.query(RELEASE_TAGS_QUERY, &params)).await?;
                let Some(rows) = report.triage(&item, rows)? else {
                    continue;
                };
                let tags: Vec<ReleaseTagRecord> = report.decode_rows(&format!("{} tags", item), rows);

                let rows = ctx.run(self.warehouse.query(RELEASE_PULL_REQUESTS_QUERY, &params)).await?;
                let rows = report.triage(&item, rows)?.unwrap_or_default();
                let pulls: Vec<ReleasePullRequestRecord> =
                    report.decode_rows(&format!("{} pull requests", item), rows);

                let details = self.enrich(ctx, &pulls, &mut known, &mut report).await?;

                let written = ctx
                    .run(self.store.run(move |_, conn| {
                        conn.transaction::<_, Error, _>(|conn| write_release(conn, &tags, &pulls, &details))
                    }))
                    .await??;
                tracing::debug!(
                    "release {}: {} tag(s), {} pull request(s), {} new link(s)",
                    item,
                    written.tags,
                    written.pull_requests,
                    written.links
                );
                report.updated += written.tags + written.pull_requests;
                report.inserted += written.links;
            }
        }
        Ok(report)
    }
}
