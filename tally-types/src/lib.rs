mod status;

pub mod helpers;

pub use status::{RunOutcome, TestStatus};

/// The job-run artifact format, as written next to each CI run in the
/// artifact bucket.
pub mod artifacts {
    use crate::{RunOutcome, TestStatus};

    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClusterData {
        #[serde(default)]
        pub platform: Option<String>,
        #[serde(default)]
        pub architecture: Option<String>,
        #[serde(default)]
        pub network: Option<String>,
        #[serde(default)]
        pub topology: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RawTestResult {
        pub name: String,
        pub status: TestStatus,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PullRequestRef {
        pub org: String,
        pub repo: String,
        pub number: u64,
        pub sha: String,
        #[serde(default)]
        pub link: Option<String>,
    }
    impl PullRequestRef {
        /// `org/repo`, the form source hosts address repositories with.
        pub fn slug(&self) -> String {
            format!("{}/{}", self.org, self.repo)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RawJobRun {
        pub id: String,
        pub job: String,
        #[serde(default)]
        pub release: Option<String>,
        #[serde(with = "time::serde::timestamp")]
        pub started_at: OffsetDateTime,
        #[serde(default)]
        pub outcome: RunOutcome,
        #[serde(default)]
        pub url: Option<String>,
        #[serde(default)]
        pub cluster_data: ClusterData,
        #[serde(default)]
        pub artifacts: Vec<String>,
        #[serde(default)]
        pub pull_requests: Vec<PullRequestRef>,
        #[serde(default)]
        pub tests: Vec<RawTestResult>,
    }
}

/// Records returned by the source connectors.
pub mod records {
    use serde::{Deserialize, Serialize};
    use serde_with::{serde_as, DisplayFromStr, PickFirst};
    use time::OffsetDateTime;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BugRecord {
        /// Tracker-side identifier, the upsert key.
        pub id: String,
        pub key: String,
        pub summary: String,
        pub status: String,
        pub url: String,
        #[serde(default)]
        pub components: Vec<String>,
        #[serde(default)]
        pub affects_versions: Vec<String>,
        #[serde(default)]
        pub fix_versions: Vec<String>,
        #[serde(with = "time::serde::timestamp")]
        pub last_change_time: OffsetDateTime,
        /// Canonical names of the queried tests this bug mentions.
        #[serde(default)]
        pub tests: Vec<String>,
    }

    /// An issue picked by a standing tracker filter, such as an incident
    /// label, and linked to the dashboard by when it was open.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct IssueRecord {
        pub id: String,
        pub key: String,
        pub summary: String,
        pub status: String,
        pub url: String,
        #[serde(default)]
        pub labels: Vec<String>,
        #[serde(with = "time::serde::timestamp")]
        pub opened_at: OffsetDateTime,
        #[serde(with = "time::serde::timestamp::option")]
        pub resolved_at: Option<OffsetDateTime>,
        #[serde(with = "time::serde::timestamp")]
        pub last_change_time: OffsetDateTime,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PullRequestInfo {
        pub number: u64,
        pub title: String,
        pub url: String,
        pub sha: String,
        #[serde(with = "time::serde::timestamp::option")]
        pub merged_at: Option<OffsetDateTime>,
    }

    #[serde_as]
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReleaseTagRecord {
        pub release_tag: String,
        pub release: String,
        pub architecture: String,
        pub phase: String,
        #[serde(default)]
        pub reject_reason: Option<String>,
        #[serde(with = "crate::helpers::float_timestamp")]
        pub release_time: OffsetDateTime,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        #[serde(default)]
        pub forced: bool,
    }

    #[serde_as]
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReleasePullRequestRecord {
        pub release_tag: String,
        pub url: String,
        pub org: String,
        pub repo: String,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub number: u64,
        pub sha: String,
    }

    #[serde_as]
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OwnershipRecord {
        pub name: String,
        #[serde(default)]
        pub suite: Option<String>,
        pub component: String,
        #[serde(default)]
        pub jira_component: Option<String>,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        #[serde(default)]
        pub staff_approved_obsolete: bool,
    }
}

#[cfg(test)]
mod tests {
    use super::artifacts::RawJobRun;
    use super::records::{OwnershipRecord, ReleaseTagRecord};
    use super::{RunOutcome, TestStatus};

    #[test]
    fn raw_job_run_fills_optional_fields() {
        let run: RawJobRun = serde_json::from_str(
            r#"{
                "id": "1001",
                "job": "periodic-ci-openshift-release-master-ci-4.14-e2e-aws",
                "started_at": 1697000000,
                "outcome": "failure",
                "tests": [{"name": "openshift-tests.[sig-network] works", "status": "failure"}]
            }"#,
        )
        .unwrap();
        assert_eq!(run.outcome, RunOutcome::Failure);
        assert_eq!(run.release, None);
        assert!(run.pull_requests.is_empty());
        assert_eq!(run.cluster_data.platform, None);
        assert_eq!(run.tests[0].status, TestStatus::Failure);
    }

    #[test]
    fn warehouse_records_accept_stringly_typed_columns() {
        let tag: ReleaseTagRecord = serde_json::from_str(
            r#"{
                "release_tag": "4.14.0-0.nightly-2023-10-11-000000",
                "release": "4.14",
                "architecture": "amd64",
                "phase": "Accepted",
                "release_time": "1.697E9",
                "forced": "false"
            }"#,
        )
        .unwrap();
        assert!(!tag.forced);
        assert_eq!(tag.release_time.unix_timestamp(), 1_697_000_000);

        let owner: OwnershipRecord = serde_json::from_str(
            r#"{"name": "a test", "component": "Networking", "staff_approved_obsolete": true}"#,
        )
        .unwrap();
        assert!(owner.staff_approved_obsolete);
        assert_eq!(owner.suite, None);
    }
}
