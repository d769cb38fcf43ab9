use crate::connectors::{
    ArtifactRef, Error, IssueTracker, ObjectStore, Params, Row, SourceHost, Warehouse,
};
use crate::store::Store;
use crate::Settings;

use tally_types::records::{BugRecord, IssueRecord, PullRequestInfo};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tempfile::TempDir;
use time::OffsetDateTime;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A migrated store in a fresh temporary directory. The directory must
/// outlive the store.
pub fn temp_store(batch_size: usize) -> (TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        database_url: dir.path().join("tally.sqlite").display().to_string(),
        batch_size,
        write_retries: 3,
        pool_size: 4,
    };
    let store = Store::open(&settings).unwrap();
    (dir, Arc::new(store))
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (OffsetDateTime, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn put(&self, id: &str, updated: OffsetDateTime, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(id.to_string(), (updated, bytes.into()));
    }

    pub fn put_json(&self, id: &str, updated: OffsetDateTime, value: serde_json::Value) {
        self.put(id, updated, serde_json::to_vec(&value).unwrap());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn list_run_artifacts<'a>(
        &'a self,
        prefix: &'a str,
        since: Option<OffsetDateTime>,
    ) -> BoxStream<'a, Result<ArtifactRef, Error>> {
        let mut listed: Vec<ArtifactRef> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .filter(|(_, (updated, _))| since.map_or(true, |since| *updated >= since))
            .map(|(id, (updated, _))| ArtifactRef {
                id: id.clone(),
                updated: *updated,
            })
            .collect();
        listed.sort_by(|a, b| a.updated.cmp(&b.updated).then_with(|| a.id.cmp(&b.id)));
        stream::iter(listed).map(Ok).boxed()
    }

    async fn fetch_artifact(&self, id: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

/// Answers queries by their SQL text.
#[derive(Default)]
pub struct FakeWarehouse {
    responses: Mutex<HashMap<String, Result<Vec<Row>, Error>>>,
    queries: Mutex<Vec<(String, Params)>>,
}

impl FakeWarehouse {
    pub fn respond(&self, sql: &str, rows: Vec<serde_json::Value>) {
        let rows = rows
            .into_iter()
            .map(|row| row.as_object().cloned().unwrap())
            .collect();
        self.responses.lock().unwrap().insert(sql.to_string(), Ok(rows));
    }

    pub fn fail(&self, sql: &str, error: Error) {
        self.responses
            .lock()
            .unwrap()
            .insert(sql.to_string(), Err(error));
    }

    pub fn queries(&self) -> Vec<(String, Params)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, Error> {
        self.queries
            .lock()
            .unwrap()
            .push((sql.to_string(), params.clone()));
        self.responses
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Knows a fixed set of issues, or fails every search.
#[derive(Default)]
pub struct FakeTracker {
    bugs: Vec<BugRecord>,
    issues: Vec<IssueRecord>,
    failure: Option<Error>,
    searches: Mutex<Vec<(String, Option<OffsetDateTime>)>>,
}

impl FakeTracker {
    pub fn with_bugs(bugs: Vec<BugRecord>) -> Self {
        FakeTracker {
            bugs,
            ..Default::default()
        }
    }

    pub fn with_issues(issues: Vec<IssueRecord>) -> Self {
        FakeTracker {
            issues,
            ..Default::default()
        }
    }

    pub fn failing(error: Error) -> Self {
        FakeTracker {
            failure: Some(error),
            ..Default::default()
        }
    }

    /// The filter and lower bound of every issue search so far.
    pub fn searches(&self) -> Vec<(String, Option<OffsetDateTime>)> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn find_issues_for_tests(&self, names: &[String]) -> Result<Vec<BugRecord>, Error> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self
            .bugs
            .iter()
            .filter_map(|bug| {
                let tests: Vec<String> = bug
                    .tests
                    .iter()
                    .filter(|test| names.contains(*test))
                    .cloned()
                    .collect();
                (!tests.is_empty()).then(|| BugRecord {
                    tests,
                    ..bug.clone()
                })
            })
            .collect())
    }

    async fn search_issues(&self, filter: &str, since: Option<OffsetDateTime>) -> Result<Vec<IssueRecord>, Error> {
        self.searches.lock().unwrap().push((filter.to_string(), since));
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self
            .issues
            .iter()
            .filter(|issue| since.map_or(true, |since| issue.last_change_time >= since))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeSourceHost {
    pulls: Mutex<HashMap<String, Vec<PullRequestInfo>>>,
    failing: Mutex<HashSet<String>>,
    comments: Mutex<Vec<(String, u64, String)>>,
}

impl FakeSourceHost {
    pub fn add_pull(&self, repo: &str, info: PullRequestInfo) {
        self.pulls
            .lock()
            .unwrap()
            .entry(repo.to_string())
            .or_default()
            .push(info);
    }

    /// Every call about `repo` fails with a bad response.
    pub fn fail_calls_on(&self, repo: &str) {
        self.failing.lock().unwrap().insert(repo.to_string());
    }

    pub fn comments(&self) -> Vec<(String, u64, String)> {
        self.comments.lock().unwrap().clone()
    }

    fn check(&self, repo: &str) -> Result<(), Error> {
        if self.failing.lock().unwrap().contains(repo) {
            Err(Error::BadResponse(format!("{} is broken", repo)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequestInfo>, Error> {
        self.check(repo)?;
        Ok(self
            .pulls
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_comment(&self, repo: &str, number: u64, text: &str) -> Result<(), Error> {
        self.check(repo)?;
        self.comments
            .lock()
            .unwrap()
            .push((repo.to_string(), number, text.to_string()));
        Ok(())
    }
}
