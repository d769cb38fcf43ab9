use super::fakes::{temp_store, FakeSourceHost, FakeTracker, FakeWarehouse, MemoryObjectStore};
use crate::aggregates::{self, Maintained, Maintainer};
use crate::connectors;
use crate::context::Context;
use crate::error::Error;
use crate::loaders::ownership::OWNERSHIP_QUERY;
use crate::loaders::releases::{RELEASE_PULL_REQUESTS_QUERY, RELEASE_TAGS_QUERY};
use crate::loaders::{
    issue_links, job_runs::CATEGORY, BugLoader, BugLoaderConfig, Commenter, IssueLinkLoader, IssueLinkLoaderConfig,
    JobRunLoader, JobRunLoaderConfig, Loader, ReleaseLoader, ReleaseLoaderConfig, TestOwnershipLoader,
};
use crate::schema::{
    bug_tests, bugs, issue_links as issue_links_table, job_runs, pull_requests, release_tags, test_ownerships,
    test_results, tests,
};
use crate::store::Store;
use crate::synthetic::NoSyntheticTests;
use crate::variants::JobNameVariants;

use tally_types::records::{BugRecord, IssueRecord, PullRequestInfo};

use diesel::prelude::*;
use diesel::sql_types::BigInt;
use serde_json::json;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use std::sync::Arc;

const JOB: &str = "periodic-ci-openshift-release-master-ci-4.14-e2e-aws";
const NOW: OffsetDateTime = datetime!(2024-03-10 12:00 UTC);

fn context() -> Context {
    let (ctx, canceler) = Context::with_timeout(std::time::Duration::from_secs(60));
    // Nothing cancels these runs.
    drop(canceler);
    ctx
}

fn artifact(id: &str, outcome: &str, tests: &[(&str, &str)]) -> serde_json::Value {
    json!({
        "id": id,
        "job": JOB,
        "started_at": (NOW - Duration::days(1)).unix_timestamp(),
        "outcome": outcome,
        "url": format!("https://prow.example.com/view/{}", id),
        "tests": tests
            .iter()
            .map(|(name, status)| json!({ "name": name, "status": status }))
            .collect::<Vec<_>>(),
    })
}

fn job_run_loader(store: &Arc<Store>, objects: &Arc<MemoryObjectStore>) -> JobRunLoader {
    JobRunLoader::new(
        store.clone(),
        objects.clone(),
        Arc::new(JobNameVariants::new()),
        Arc::new(NoSyntheticTests),
        JobRunLoaderConfig {
            prefix: "runs/".to_string(),
            releases: vec![],
        },
    )
}

#[derive(QueryableByName)]
struct Total {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

fn current_runs(store: &Store) -> i64 {
    let mut conn = store.conn().unwrap();
    diesel::sql_query("SELECT COALESCE(SUM(current_runs), 0) AS total FROM test_report_7d")
        .get_result::<Total>(&mut conn)
        .unwrap()
        .total
}

#[tokio::test]
async fn ingests_runs_and_builds_aggregates() {
    let (_dir, store) = temp_store(64);
    let objects = Arc::new(MemoryObjectStore::default());
    objects.put_json(
        "runs/1001.json",
        NOW - Duration::hours(20),
        artifact("1001", "success", &[("openshift-tests.[sig-network] pods should start", "success")]),
    );
    objects.put_json(
        "runs/1002.json",
        NOW - Duration::hours(19),
        artifact(
            "1002",
            "failure",
            &[("openshift-tests-upgrade.[sig-cluster-lifecycle] cluster upgrade should complete", "failure")],
        ),
    );
    objects.put("runs/1003.json", NOW - Duration::hours(18), "{ not json");

    let maintainer = Maintainer::new(store.clone(), aggregates::catalog());
    let loaders: Vec<Box<dyn Loader>> = vec![Box::new(job_run_loader(&store, &objects))];
    let outcome = crate::load(loaders, &maintainer, &context(), NOW).await.unwrap();

    assert!(!outcome.failed());
    assert_eq!(outcome.summaries[0].item_errors, 1);
    assert!(outcome
        .aggregates
        .iter()
        .all(|(_, maintained)| *maintained == Maintained::Created));

    let mut conn = store.conn().unwrap();
    let names: Vec<String> = tests::table
        .select(tests::name)
        .order(tests::name.asc())
        .load(&mut conn)
        .unwrap();
    assert_eq!(
        names,
        vec![
            "[sig-cluster-lifecycle] cluster upgrade should complete",
            "[sig-network] pods should start"
        ]
    );
    let unsuited: i64 = test_results::table
        .filter(test_results::suite_id.is_null())
        .count()
        .get_result(&mut conn)
        .unwrap();
    assert_eq!(unsuited, 0);
    assert_eq!(
        Store::high_water_mark(&mut conn, CATEGORY).unwrap(),
        Some((NOW - Duration::hours(18)).unix_timestamp())
    );
    drop(conn);

    assert_eq!(current_runs(&store), 2);
}

#[tokio::test]
async fn reloading_the_same_artifacts_inserts_nothing() {
    let (_dir, store) = temp_store(2);
    let objects = Arc::new(MemoryObjectStore::default());
    for (i, id) in ["1001", "1002", "1003"].iter().enumerate() {
        objects.put_json(
            &format!("runs/{}.json", id),
            NOW - Duration::hours(10 - i as i64),
            artifact(id, "success", &[("openshift-tests.a", "success"), ("openshift-tests.b", "flake")]),
        );
    }

    let ctx = context();
    let first = job_run_loader(&store, &objects).load(&ctx).await.unwrap();
    // Three runs, two tests and six results.
    assert_eq!(first.inserted, 11);
    assert!(first.item_errors.is_empty());

    let second = job_run_loader(&store, &objects).load(&ctx).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 1);

    let mut conn = store.conn().unwrap();
    let runs: i64 = job_runs::table.count().get_result(&mut conn).unwrap();
    let results: i64 = test_results::table.count().get_result(&mut conn).unwrap();
    assert_eq!((runs, results), (3, 6));
}

#[tokio::test]
async fn a_malformed_newest_artifact_is_reported_once() {
    let (_dir, store) = temp_store(16);
    let objects = Arc::new(MemoryObjectStore::default());
    objects.put_json(
        "runs/1001.json",
        NOW - Duration::hours(4),
        artifact("1001", "success", &[("openshift-tests.a", "success")]),
    );
    objects.put("runs/1002.json", NOW - Duration::hours(2), "{ not json");

    let ctx = context();
    let first = job_run_loader(&store, &objects).load(&ctx).await.unwrap();
    assert_eq!(first.item_errors.len(), 1);

    for _ in 0..2 {
        let again = job_run_loader(&store, &objects).load(&ctx).await.unwrap();
        assert!(again.item_errors.is_empty());
        assert_eq!((again.inserted, again.skipped), (0, 1));
    }

    // Another artifact updated in the mark second is still picked up.
    objects.put_json(
        "runs/1003.json",
        NOW - Duration::hours(2),
        artifact("1003", "success", &[("openshift-tests.a", "success")]),
    );
    let newer = job_run_loader(&store, &objects).load(&ctx).await.unwrap();
    assert!(newer.item_errors.is_empty());
    assert_eq!(newer.skipped, 1);

    let mut conn = store.conn().unwrap();
    let runs: i64 = job_runs::table.count().get_result(&mut conn).unwrap();
    assert_eq!(runs, 2);
}

#[tokio::test]
async fn runs_of_other_releases_are_skipped() {
    let (_dir, store) = temp_store(16);
    let objects = Arc::new(MemoryObjectStore::default());
    objects.put_json("runs/1001.json", NOW, artifact("1001", "success", &[("openshift-tests.a", "success")]));

    let loader = JobRunLoader::new(
        store.clone(),
        objects.clone(),
        Arc::new(JobNameVariants::new()),
        Arc::new(NoSyntheticTests),
        JobRunLoaderConfig {
            prefix: "runs/".to_string(),
            releases: vec!["4.13".to_string()],
        },
    );
    let report = loader.load(&context()).await.unwrap();
    assert_eq!((report.inserted, report.skipped), (0, 1));

    let mut conn = store.conn().unwrap();
    let runs: i64 = job_runs::table.count().get_result(&mut conn).unwrap();
    assert_eq!(runs, 0);
}

#[tokio::test]
async fn failing_runs_are_reported_on_their_pull_requests_once() {
    let (_dir, store) = temp_store(16);
    let objects = Arc::new(MemoryObjectStore::default());
    let mut failed = artifact("1001", "failure", &[("openshift-tests.[sig-storage] volumes should mount", "failure")]);
    failed["pull_requests"] = json!([
        { "org": "openshift", "repo": "origin", "number": 42, "sha": "abc" },
        { "org": "openshift", "repo": "excluded", "number": 7, "sha": "def" },
    ]);
    let mut passed = artifact("1002", "success", &[("openshift-tests.[sig-storage] volumes should mount", "success")]);
    passed["pull_requests"] = json!([{ "org": "openshift", "repo": "origin", "number": 43, "sha": "123" }]);
    objects.put_json("runs/1001.json", NOW - Duration::hours(2), failed);
    objects.put_json("runs/1002.json", NOW - Duration::hours(1), passed);

    let host = Arc::new(FakeSourceHost::default());
    let commenter = Commenter::new(host.clone(), vec![], vec!["openshift/excluded".to_string()]);
    let ctx = context();
    for _ in 0..2 {
        job_run_loader(&store, &objects)
            .with_commenter(commenter.clone())
            .load(&ctx)
            .await
            .unwrap();
    }

    let comments = host.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!((comments[0].0.as_str(), comments[0].1), ("openshift/origin", 42));
    assert!(comments[0].2.contains("[sig-storage] volumes should mount"));
}

#[tokio::test]
async fn cancelled_runs_stop_before_touching_the_store() {
    let (_dir, store) = temp_store(16);
    let objects = Arc::new(MemoryObjectStore::default());
    objects.put_json("runs/1001.json", NOW, artifact("1001", "success", &[]));

    let (ctx, canceler) = Context::with_timeout(std::time::Duration::from_secs(60));
    canceler.cancel();
    let res = job_run_loader(&store, &objects).load(&ctx).await;
    assert!(matches!(res, Err(Error::Cancelled)));
}

fn release_warehouse() -> FakeWarehouse {
    let warehouse = FakeWarehouse::default();
    warehouse.respond(
        RELEASE_TAGS_QUERY,
        vec![json!({
            "release_tag": "4.14.0-0.nightly-2024-03-09-000000",
            "release": "4.14",
            "architecture": "amd64",
            "phase": "Accepted",
            "release_time": 1709942400.0,
            "forced": "false",
        })],
    );
    warehouse.respond(
        RELEASE_PULL_REQUESTS_QUERY,
        vec![json!({
            "release_tag": "4.14.0-0.nightly-2024-03-09-000000",
            "url": "https://github.com/openshift/origin/pull/42",
            "org": "openshift",
            "repo": "origin",
            "number": "42",
            "sha": "abc",
        })],
    );
    warehouse
}

fn release_loader(store: &Arc<Store>, warehouse: Arc<FakeWarehouse>) -> ReleaseLoader {
    ReleaseLoader::new(
        store.clone(),
        warehouse,
        ReleaseLoaderConfig {
            releases: vec!["4.14".to_string()],
            architectures: vec!["amd64".to_string()],
        },
    )
}

#[tokio::test]
async fn an_unreachable_tracker_does_not_stop_the_other_loaders() {
    let (_dir, store) = temp_store(16);
    // Loaders start together, so the bug loader only sees tests stored
    // before the load.
    {
        let mut conn = store.conn().unwrap();
        store.ensure_tests(&mut conn, &["a"]).unwrap();
    }
    let objects = Arc::new(MemoryObjectStore::default());
    objects.put_json(
        "runs/1001.json",
        NOW - Duration::hours(3),
        artifact("1001", "success", &[("openshift-tests.a", "success")]),
    );
    let warehouse = Arc::new(release_warehouse());
    let tracker = Arc::new(FakeTracker::failing(connectors::Error::Unauthorized(
        "token expired".to_string(),
    )));

    let maintainer = Maintainer::new(store.clone(), aggregates::catalog());
    let loaders = |store: &Arc<Store>| -> Vec<Box<dyn Loader>> {
        vec![
            Box::new(job_run_loader(store, &objects)),
            Box::new(release_loader(store, warehouse.clone())),
            Box::new(BugLoader::new(store.clone(), tracker.clone(), BugLoaderConfig::default())),
        ]
    };

    let first = crate::load(loaders(&store), &maintainer, &context(), NOW).await.unwrap();
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].loader, "bugs");
    assert!(first.summaries[1].failure.is_none());
    assert_eq!(current_runs(&store), 1);

    {
        let mut conn = store.conn().unwrap();
        let tags: i64 = release_tags::table.count().get_result(&mut conn).unwrap();
        let pulls: i64 = pull_requests::table.count().get_result(&mut conn).unwrap();
        assert_eq!((tags, pulls), (1, 1));
    }

    // Aggregates are refreshed on every load, failures or not.
    objects.put_json(
        "runs/1002.json",
        NOW - Duration::hours(2),
        artifact("1002", "failure", &[("openshift-tests.a", "failure")]),
    );
    let second = crate::load(loaders(&store), &maintainer, &context(), NOW).await.unwrap();
    assert!(second.failed());
    assert!(second
        .aggregates
        .iter()
        .all(|(_, maintained)| *maintained == Maintained::Refreshed));
    assert_eq!(current_runs(&store), 2);
}

#[tokio::test]
async fn release_pull_requests_are_enriched_from_the_source_host() {
    let (_dir, store) = temp_store(16);
    let warehouse = release_warehouse();
    warehouse.respond(
        RELEASE_PULL_REQUESTS_QUERY,
        vec![
            json!({
                "release_tag": "4.14.0-0.nightly-2024-03-09-000000",
                "url": "https://github.com/openshift/origin/pull/42",
                "org": "openshift",
                "repo": "origin",
                "number": "42",
                "sha": "abc",
            }),
            json!({
                "release_tag": "4.14.0-0.nightly-2024-03-09-000000",
                "url": "https://github.com/openshift/broken/pull/9",
                "org": "openshift",
                "repo": "broken",
                "number": 9,
                "sha": "def",
            }),
        ],
    );
    let warehouse = Arc::new(warehouse);
    let host = Arc::new(FakeSourceHost::default());
    host.add_pull(
        "openshift/origin",
        PullRequestInfo {
            number: 42,
            title: "Fix pod startup".to_string(),
            url: "https://github.com/openshift/origin/pull/42".to_string(),
            sha: "abc".to_string(),
            merged_at: Some(NOW - Duration::days(2)),
        },
    );
    host.fail_calls_on("openshift/broken");

    let report = release_loader(&store, warehouse.clone())
        .with_source_host(host)
        .load(&context())
        .await
        .unwrap();
    assert_eq!(report.item_errors.len(), 1);
    assert_eq!(report.item_errors[0].item, "openshift/broken");

    let queries = warehouse.queries();
    let queried: Vec<(&str, &str, &str)> = queries
        .iter()
        .map(|(sql, params)| (sql.as_str(), params["release"].as_str(), params["architecture"].as_str()))
        .collect();
    assert_eq!(
        queried,
        vec![
            (RELEASE_TAGS_QUERY, "4.14", "amd64"),
            (RELEASE_PULL_REQUESTS_QUERY, "4.14", "amd64")
        ]
    );

    let mut conn = store.conn().unwrap();
    let stored: Vec<(String, Option<String>, Option<i64>)> = pull_requests::table
        .select((pull_requests::repo, pull_requests::title, pull_requests::merged_at))
        .order(pull_requests::repo.asc())
        .load(&mut conn)
        .unwrap();
    assert_eq!(
        stored,
        vec![
            ("broken".to_string(), None, None),
            (
                "origin".to_string(),
                Some("Fix pod startup".to_string()),
                Some((NOW - Duration::days(2)).unix_timestamp())
            ),
        ]
    );
}

fn incident(id: &str, opened_at: OffsetDateTime, resolved_at: Option<OffsetDateTime>) -> IssueRecord {
    IssueRecord {
        id: id.to_string(),
        key: format!("TRT-{}", id),
        summary: format!("Incident {}", id),
        status: if resolved_at.is_some() { "Closed" } else { "New" }.to_string(),
        url: format!("https://issues.example.com/browse/TRT-{}", id),
        labels: vec!["trt-incident".to_string()],
        opened_at,
        resolved_at,
        last_change_time: resolved_at.unwrap_or(opened_at),
    }
}

#[tokio::test]
async fn issue_links_resume_from_the_last_update() {
    let (_dir, store) = temp_store(16);
    let tracker = Arc::new(FakeTracker::with_issues(vec![
        incident("1", NOW - Duration::days(3), Some(NOW - Duration::days(2))),
        incident("2", NOW - Duration::hours(6), None),
    ]));
    let loader = IssueLinkLoader::new(store.clone(), tracker.clone(), IssueLinkLoaderConfig::default());

    let first = loader.load(&context()).await.unwrap();
    assert_eq!(first.updated, 2);
    let second = loader.load(&context()).await.unwrap();
    assert_eq!(second.updated, 1);

    let searches = tracker.searches();
    assert_eq!(searches[0], ("labels = trt-incident".to_string(), None));
    assert_eq!(searches[1].1, Some(NOW - Duration::hours(6)));

    let mut conn = store.conn().unwrap();
    let open: Vec<String> = issue_links_table::table
        .filter(issue_links_table::resolved_at.is_null())
        .select(issue_links_table::key)
        .load(&mut conn)
        .unwrap();
    assert_eq!(open, vec!["TRT-2"]);
    assert_eq!(
        Store::high_water_mark(&mut conn, issue_links::CATEGORY).unwrap(),
        Some((NOW - Duration::hours(6)).unix_timestamp())
    );
}

#[tokio::test]
async fn an_unauthorized_tracker_fails_the_issue_link_load() {
    let (_dir, store) = temp_store(16);
    let tracker = Arc::new(FakeTracker::failing(connectors::Error::Unauthorized("jira".to_string())));
    let res = IssueLinkLoader::new(store, tracker, IssueLinkLoaderConfig::default())
        .load(&context())
        .await;
    assert!(matches!(res, Err(Error::Connector(connectors::Error::Unauthorized(_)))));
}

fn bug(id: &str, tests: &[&str]) -> BugRecord {
    BugRecord {
        id: id.to_string(),
        key: format!("OCPBUGS-{}", id),
        summary: format!("{} is failing", tests.join(", ")),
        status: "New".to_string(),
        url: format!("https://issues.example.com/browse/OCPBUGS-{}", id),
        components: vec!["Networking".to_string()],
        affects_versions: vec!["4.14".to_string()],
        fix_versions: vec![],
        last_change_time: NOW,
        tests: tests.iter().map(|t| t.to_string()).collect(),
    }
}

#[tokio::test]
async fn bugs_are_linked_to_the_tests_they_mention() {
    let (_dir, store) = temp_store(16);
    {
        let mut conn = store.conn().unwrap();
        store.ensure_tests(&mut conn, &["a", "b", "c"]).unwrap();
    }

    let tracker = Arc::new(FakeTracker::with_bugs(vec![bug("1", &["a", "b"]), bug("2", &["z"])]));
    let loader = BugLoader::new(store.clone(), tracker, BugLoaderConfig { chunk_size: 2 });
    let report = loader.load(&context()).await.unwrap();
    assert_eq!(report.updated, 1);

    let tracker = Arc::new(FakeTracker::with_bugs(vec![bug("1", &["c"])]));
    BugLoader::new(store.clone(), tracker, BugLoaderConfig::default())
        .load(&context())
        .await
        .unwrap();

    let mut conn = store.conn().unwrap();
    let stored: i64 = bugs::table.count().get_result(&mut conn).unwrap();
    let linked: Vec<String> = bug_tests::table
        .inner_join(tests::table)
        .select(tests::name)
        .load(&mut conn)
        .unwrap();
    assert_eq!(stored, 1);
    assert_eq!(linked, vec!["c"]);
}

#[tokio::test]
async fn ownership_rows_resolve_known_tests() {
    let (_dir, store) = temp_store(16);
    {
        let mut conn = store.conn().unwrap();
        store.ensure_tests(&mut conn, &["[sig-network] pods should start"]).unwrap();
    }
    let warehouse = Arc::new(FakeWarehouse::default());
    warehouse.respond(
        OWNERSHIP_QUERY,
        vec![
            json!({ "name": "[sig-network] pods should start", "suite": "openshift-tests", "component": "Networking" }),
            json!({ "name": "[sig-storage] volumes should mount", "component": "Storage", "staff_approved_obsolete": "true" }),
            json!({ "component": "Unnamed" }),
        ],
    );

    let report = TestOwnershipLoader::new(store.clone(), warehouse)
        .load(&context())
        .await
        .unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(report.item_errors.len(), 1);

    let mut conn = store.conn().unwrap();
    let resolved: Vec<(String, Option<i32>)> = test_ownerships::table
        .select((test_ownerships::test_name, test_ownerships::test_id))
        .order(test_ownerships::test_name.asc())
        .load(&mut conn)
        .unwrap();
    assert!(resolved[0].1.is_some());
    assert!(resolved[1].1.is_none());
}

#[tokio::test]
async fn an_unreachable_warehouse_fails_the_ownership_load() {
    let (_dir, store) = temp_store(16);
    let warehouse = Arc::new(FakeWarehouse::default());
    warehouse.fail(OWNERSHIP_QUERY, connectors::Error::Unreachable("warehouse".to_string()));
    let res = TestOwnershipLoader::new(store, warehouse).load(&context()).await;
    assert!(matches!(res, Err(Error::Connector(connectors::Error::Unreachable(_)))));
}
