use super::{check_status, Error, IssueTracker};

use tally_types::records::{BugRecord, IssueRecord};

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::json;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use std::time::Duration;

const TIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory][offset_minute]"
);
/// JQL compares dates at minute granularity.
const JQL_TIME_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day] [hour]:[minute]");

const BUG_FIELDS: &[&str] = &["summary", "description", "status", "components", "versions", "fixVersions", "updated"];
const ISSUE_FIELDS: &[&str] = &["summary", "status", "labels", "created", "resolutiondate", "updated"];

/// Finds issues mentioning test names with a JQL full-text search.
#[derive(Clone, Debug)]
pub struct JiraTracker {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    page_size: u32,
}

impl JiraTracker {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::BadResponse(e.to_string()))?;
        Ok(JiraTracker {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            page_size: 500,
        })
    }

    /// Runs a search to the end, one page at a time.
    async fn search(&self, jql: &str, fields: &[&str]) -> Result<Vec<Issue>, Error> {
        let mut issues = Vec::new();
        let mut start = 0;
        loop {
            let mut request = self
                .client
                .post(format!("{}/rest/api/2/search", self.base_url))
                .json(&json!({
                    "jql": jql,
                    "startAt": start,
                    "maxResults": self.page_size,
                    "fields": fields,
                }));
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let page: SearchResponse = check_status(request.send().await?).await?.json().await?;
            let page_len = page.issues.len() as u32;
            issues.extend(page.issues);
            match next_start(page.start_at, page_len, page.total) {
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(issues)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    id: String,
    key: String,
    fields: Fields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fields {
    summary: String,
    #[serde(default)]
    description: Option<String>,
    status: Named,
    #[serde(default)]
    components: Vec<Named>,
    #[serde(default)]
    versions: Vec<Named>,
    #[serde(default)]
    fix_versions: Vec<Named>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    resolutiondate: Option<String>,
    updated: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

/// Where the page after `[start, start + page_len)` begins, if any.
fn next_start(start: u32, page_len: u32, total: u32) -> Option<u32> {
    let next = start.saturating_add(page_len);
    (page_len > 0 && next < total).then_some(next)
}

fn quote(name: &str) -> String {
    // The name is a phrase inside a JQL string literal.
    let escaped = name.replace('\\', "\\\\\\\\").replace('"', "\\\\\\\"");
    format!("text ~ \"\\\"{}\\\"\"", escaped)
}

fn jql(names: &[String]) -> String {
    names.iter().map(|name| quote(name)).join(" OR ")
}

fn filter_jql(filter: &str, since: Option<OffsetDateTime>) -> Result<String, Error> {
    let mut jql = format!("({})", filter);
    if let Some(since) = since {
        let since = since
            .to_offset(time::UtcOffset::UTC)
            .format(JQL_TIME_FORMAT)
            .map_err(|e| Error::BadResponse(e.to_string()))?;
        jql.push_str(&format!(" AND updated >= \"{}\"", since));
    }
    jql.push_str(" ORDER BY updated ASC");
    Ok(jql)
}

fn parse_time(key: &str, what: &str, value: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(value, TIME_FORMAT)
        .map_err(|e| Error::BadResponse(format!("issue {}: bad {} time: {}", key, what, e)))
}

fn record(base_url: &str, issue: Issue, names: &[String]) -> Result<BugRecord, Error> {
    let Issue { id, key, fields } = issue;
    let last_change_time = parse_time(&key, "update", &fields.updated)?;
    let description = fields.description.unwrap_or_default();
    let tests = names
        .iter()
        .filter(|name| fields.summary.contains(name.as_str()) || description.contains(name.as_str()))
        .cloned()
        .collect();
    let names_of = |named: Vec<Named>| named.into_iter().map(|n| n.name).collect();
    Ok(BugRecord {
        id,
        url: format!("{}/browse/{}", base_url, key),
        key,
        summary: fields.summary,
        status: fields.status.name,
        components: names_of(fields.components),
        affects_versions: names_of(fields.versions),
        fix_versions: names_of(fields.fix_versions),
        last_change_time,
        tests,
    })
}

/// Maps every issue it can; an issue with unreadable fields is logged and
/// left out.
fn records(base_url: &str, issues: Vec<Issue>, names: &[String]) -> Vec<BugRecord> {
    issues
        .into_iter()
        .filter_map(|issue| match record(base_url, issue, names) {
            Ok(bug) => Some(bug),
            Err(e) => {
                tracing::warn!("skipping tracker issue: {}", e);
                None
            }
        })
        .collect()
}

fn issue_record(base_url: &str, issue: Issue) -> Result<IssueRecord, Error> {
    let Issue { id, key, fields } = issue;
    let last_change_time = parse_time(&key, "update", &fields.updated)?;
    let opened_at = match &fields.created {
        Some(created) => parse_time(&key, "creation", created)?,
        None => last_change_time,
    };
    let resolved_at = fields
        .resolutiondate
        .as_deref()
        .map(|resolved| parse_time(&key, "resolution", resolved))
        .transpose()?;
    Ok(IssueRecord {
        id,
        url: format!("{}/browse/{}", base_url, key),
        key,
        summary: fields.summary,
        status: fields.status.name,
        labels: fields.labels,
        opened_at,
        resolved_at,
        last_change_time,
    })
}

#[async_trait]
impl IssueTracker for JiraTracker {
    async fn find_issues_for_tests(&self, names: &[String]) -> Result<Vec<BugRecord>, Error> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let issues = self.search(&jql(names), BUG_FIELDS).await?;
        tracing::debug!("tracker returned {} issue(s) for {} test(s)", issues.len(), names.len());
        Ok(records(&self.base_url, issues, names))
    }

    async fn search_issues(&self, filter: &str, since: Option<OffsetDateTime>) -> Result<Vec<IssueRecord>, Error> {
        let issues = self.search(&filter_jql(filter, since)?, ISSUE_FIELDS).await?;
        tracing::debug!("tracker filter {:?} returned {} issue(s)", filter, issues.len());
        Ok(issues
            .into_iter()
            .filter_map(|issue| match issue_record(&self.base_url, issue) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("skipping tracker issue: {}", e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use time::macros::datetime;

    fn issue(key: &str, summary: &str, updated: &str) -> Issue {
        serde_json::from_value(json!({
            "id": key.trim_start_matches("OCPBUGS-"),
            "key": key,
            "fields": {
                "summary": summary,
                "status": { "name": "New" },
                "updated": updated
            }
        }))
        .unwrap()
    }

    #[test]
    fn builds_phrase_query() {
        let names = vec!["[sig-network] pods".to_string(), "say \"hi\"".to_string()];
        assert_eq!(
            jql(&names),
            r#"text ~ "\"[sig-network] pods\"" OR text ~ "\"say \\\"hi\\\"\"""#
        );
    }

    #[test]
    fn maps_issue_fields() {
        let issue: Issue = serde_json::from_value(json!({
            "id": "10042",
            "key": "OCPBUGS-42",
            "fields": {
                "summary": "[sig-network] pods fail on metal",
                "status": { "name": "New" },
                "components": [{ "name": "Networking" }],
                "fixVersions": [{ "name": "4.15" }],
                "updated": "2023-10-11T08:15:30.000+0000"
            }
        }))
        .unwrap();
        let names = vec!["[sig-network] pods".to_string(), "unrelated".to_string()];
        let bug = record("https://issues.example.com", issue, &names).unwrap();
        assert_eq!(bug.id, "10042");
        assert_eq!(bug.url, "https://issues.example.com/browse/OCPBUGS-42");
        assert_eq!(bug.components, vec!["Networking"]);
        assert_eq!(bug.fix_versions, vec!["4.15"]);
        assert!(bug.affects_versions.is_empty());
        assert_eq!(bug.tests, vec!["[sig-network] pods"]);
        assert_eq!(bug.last_change_time.unix_timestamp(), 1_697_012_130);
    }

    #[test]
    fn an_unreadable_issue_does_not_spoil_the_others() {
        let names = vec!["[sig-network] pods".to_string()];
        let issues = vec![
            issue("OCPBUGS-1", "[sig-network] pods fail", "yesterday"),
            issue("OCPBUGS-2", "[sig-network] pods flake", "2023-10-11T08:15:30.000+0000"),
        ];
        let bugs = records("https://issues.example.com", issues, &names);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].key, "OCPBUGS-2");
    }

    #[test]
    fn pages_until_the_total_is_reached() {
        assert_eq!(next_start(0, 500, 1200), Some(500));
        assert_eq!(next_start(500, 500, 1200), Some(1000));
        assert_eq!(next_start(1000, 200, 1200), None);
        assert_eq!(next_start(0, 0, 1200), None);
        assert_eq!(next_start(0, 3, 3), None);
    }

    #[test]
    fn filter_search_starts_at_the_last_update() {
        assert_eq!(
            filter_jql("labels = trt-incident", None).unwrap(),
            "(labels = trt-incident) ORDER BY updated ASC"
        );
        assert_eq!(
            filter_jql("labels = trt-incident", Some(datetime!(2024-03-10 12:34:56 UTC))).unwrap(),
            "(labels = trt-incident) AND updated >= \"2024-03-10 12:34\" ORDER BY updated ASC"
        );
    }

    #[test]
    fn maps_open_and_resolved_issues() {
        let issue: Issue = serde_json::from_value(json!({
            "id": "7",
            "key": "TRT-7",
            "fields": {
                "summary": "Registry outage",
                "status": { "name": "Closed" },
                "labels": ["trt-incident"],
                "created": "2023-10-11T08:00:00.000+0000",
                "resolutiondate": "2023-10-11T10:00:00.000+0000",
                "updated": "2023-10-11T10:05:00.000+0000"
            }
        }))
        .unwrap();
        let record = issue_record("https://issues.example.com", issue).unwrap();
        assert_eq!(record.url, "https://issues.example.com/browse/TRT-7");
        assert_eq!(record.labels, vec!["trt-incident"]);
        assert_eq!(record.opened_at, datetime!(2023-10-11 08:00 UTC));
        assert_eq!(record.resolved_at, Some(datetime!(2023-10-11 10:00 UTC)));
    }
}
