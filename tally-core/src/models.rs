use crate::schema::aggregate_definitions;
use crate::schema::bug_tests;
use crate::schema::bugs;
use crate::schema::high_water_items;
use crate::schema::high_water_marks;
use crate::schema::issue_links;
use crate::schema::job_runs;
use crate::schema::jobs;
use crate::schema::pull_requests;
use crate::schema::release_tag_pull_requests;
use crate::schema::release_tags;
use crate::schema::suites;
use crate::schema::test_ownerships;
use crate::schema::test_results;
use crate::schema::tests;

use diesel::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = suites)]
pub struct Suite {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = suites)]
pub struct NewSuite<'a> {
    pub name: &'a str,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = jobs)]
pub struct NewJob<'a> {
    pub name: &'a str,
    pub never_stable: bool,
    pub release: &'a str,
    pub time_updated: i64,
    pub variants: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = job_runs)]
pub struct NewJobRun<'a> {
    pub artifacts: &'a str,
    pub external_id: &'a str,
    pub job_id: i32,
    pub outcome: i32,
    pub started_at: i64,
    pub url: Option<&'a str>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tests)]
pub struct NewTest<'a> {
    pub name: &'a str,
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable)]
#[diesel(table_name = test_results)]
pub struct TestResult {
    pub id: i32,
    pub invocation: i32,
    pub job_run_id: i32,
    pub status: i32,
    pub suite_id: Option<i32>,
    pub test_id: i32,
    pub timestamp: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = test_results)]
pub struct NewTestResult {
    pub invocation: i32,
    pub job_run_id: i32,
    pub status: i32,
    pub suite_id: Option<i32>,
    pub test_id: i32,
    pub timestamp: i64,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = bugs)]
pub struct NewBug<'a> {
    pub affects_versions: &'a str,
    pub components: &'a str,
    pub external_id: &'a str,
    pub fix_versions: &'a str,
    pub key: &'a str,
    pub last_change_time: i64,
    pub status: &'a str,
    pub summary: &'a str,
    pub url: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bug_tests)]
pub struct NewBugTest {
    pub bug_id: i32,
    pub test_id: i32,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = release_tags)]
#[diesel(treat_none_as_null = true)]
pub struct NewReleaseTag<'a> {
    pub architecture: &'a str,
    pub forced: bool,
    pub phase: &'a str,
    pub reject_reason: Option<&'a str>,
    pub release: &'a str,
    pub release_time: i64,
    pub tag: &'a str,
}

/// Title and merge time are only known when the source host was asked,
/// so an upsert without them keeps whatever is already stored.
#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = pull_requests)]
pub struct NewPullRequest<'a> {
    pub merged_at: Option<i64>,
    pub number: i64,
    pub org: &'a str,
    pub repo: &'a str,
    pub sha: &'a str,
    pub title: Option<&'a str>,
    pub url: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = release_tag_pull_requests)]
pub struct NewReleaseTagPullRequest {
    pub pull_request_id: i32,
    pub release_tag_id: i32,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = test_ownerships)]
#[diesel(treat_none_as_null = true)]
pub struct NewTestOwnership {
    pub component: String,
    pub jira_component: Option<String>,
    pub staff_approved_obsolete: bool,
    pub suite: Option<String>,
    pub test_name: String,
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable)]
#[diesel(table_name = high_water_marks)]
#[diesel(primary_key(category))]
pub struct HighWaterMark {
    pub category: String,
    pub value: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = high_water_items)]
pub struct NewHighWaterItem<'a> {
    pub category: &'a str,
    pub item: &'a str,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = issue_links)]
#[diesel(treat_none_as_null = true)]
pub struct NewIssueLink<'a> {
    pub external_id: &'a str,
    pub key: &'a str,
    pub labels: &'a str,
    pub last_change_time: i64,
    pub opened_at: i64,
    pub resolved_at: Option<i64>,
    pub status: &'a str,
    pub summary: &'a str,
    pub url: &'a str,
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable)]
#[diesel(table_name = aggregate_definitions)]
#[diesel(primary_key(name))]
pub struct AggregateDefinition {
    pub name: String,
    pub params: String,
    pub template: String,
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = aggregate_definitions)]
pub struct NewAggregateDefinition<'a> {
    pub name: &'a str,
    pub params: &'a str,
    pub template: &'a str,
}
