//! Rolling-window aggregates, kept as plain tables rebuilt from a query
//! template after every load.
//!
//! Templates refer to window boundaries with `{{name}}` placeholders; each
//! definition binds its placeholders to a [`Boundary`], resolved to unix
//! seconds whenever the aggregate is created or refreshed.

use crate::error::Error;
use crate::models::{AggregateDefinition, NewAggregateDefinition};
use crate::schema::aggregate_definitions;
use crate::store::Store;
use crate::Conn;

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Name under which maintenance failures are reported.
pub const MAINTAINER_NAME: &str = "aggregates";

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new("^[a-z_][a-z0-9_]*$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Now,
    DaysAgo(u32),
}

impl Boundary {
    pub fn resolve(self, now: OffsetDateTime) -> i64 {
        match self {
            Boundary::Now => now.unix_timestamp(),
            Boundary::DaysAgo(days) => (now - time::Duration::days(days.into())).unix_timestamp(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub template: String,
    pub params: BTreeMap<String, Boundary>,
}

impl Definition {
    pub fn new(name: &str, template: &str, params: &[(&str, Boundary)]) -> Self {
        Definition {
            name: name.to_string(),
            template: template.to_string(),
            params: params
                .iter()
                .map(|(placeholder, boundary)| (placeholder.to_string(), *boundary))
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if IDENTIFIER.is_match(&self.name) {
            Ok(())
        } else {
            Err(Error::AggregateName(self.name.clone()))
        }
    }

    /// The template with every placeholder replaced by its boundary.
    pub fn render(&self, now: OffsetDateTime) -> Result<String, Error> {
        self.validate()?;
        let mut sql = self.template.clone();
        for (placeholder, boundary) in &self.params {
            sql = sql.replace(&format!("{{{{{}}}}}", placeholder), &boundary.resolve(now).to_string());
        }
        if let Some(start) = sql.find("{{") {
            let placeholder = sql[start..]
                .split_inclusive("}}")
                .next()
                .unwrap_or(&sql[start..])
                .to_string();
            return Err(Error::AggregateTemplate {
                name: self.name.clone(),
                placeholder,
            });
        }
        Ok(sql)
    }
}

const TEST_REPORT: &str = r#"SELECT
    tests.name AS name,
    jobs."release" AS "release",
    jobs.variants AS variants,
    COUNT(CASE WHEN test_results."timestamp" BETWEEN {{start}} AND {{boundary}} THEN 1 END) AS previous_runs,
    COUNT(CASE WHEN test_results.status = 1 AND test_results."timestamp" BETWEEN {{start}} AND {{boundary}} THEN 1 END) AS previous_successes,
    COUNT(CASE WHEN test_results.status = 12 AND test_results."timestamp" BETWEEN {{start}} AND {{boundary}} THEN 1 END) AS previous_failures,
    COUNT(CASE WHEN test_results.status = 13 AND test_results."timestamp" BETWEEN {{start}} AND {{boundary}} THEN 1 END) AS previous_flakes,
    COUNT(CASE WHEN test_results."timestamp" BETWEEN {{boundary}} AND {{end}} THEN 1 END) AS current_runs,
    COUNT(CASE WHEN test_results.status = 1 AND test_results."timestamp" BETWEEN {{boundary}} AND {{end}} THEN 1 END) AS current_successes,
    COUNT(CASE WHEN test_results.status = 12 AND test_results."timestamp" BETWEEN {{boundary}} AND {{end}} THEN 1 END) AS current_failures,
    COUNT(CASE WHEN test_results.status = 13 AND test_results."timestamp" BETWEEN {{boundary}} AND {{end}} THEN 1 END) AS current_flakes
FROM test_results
    JOIN tests ON tests.id = test_results.test_id
    JOIN job_runs ON job_runs.id = test_results.job_run_id
    JOIN jobs ON jobs.id = job_runs.job_id
WHERE test_results."timestamp" BETWEEN {{start}} AND {{end}}
GROUP BY tests.name, jobs."release", jobs.variants"#;

const TEST_ANALYSIS_BY_VARIANT: &str = r#"SELECT
    tests.id AS test_id,
    tests.name AS test_name,
    date(test_results."timestamp", 'unixepoch') AS day,
    variant.value AS variant,
    jobs."release" AS "release",
    COUNT(*) AS runs,
    COUNT(CASE WHEN test_results.status = 1 THEN 1 END) AS passes,
    COUNT(CASE WHEN test_results.status = 12 THEN 1 END) AS failures,
    COUNT(CASE WHEN test_results.status = 13 THEN 1 END) AS flakes
FROM test_results
    JOIN tests ON tests.id = test_results.test_id
    JOIN job_runs ON job_runs.id = test_results.job_run_id
    JOIN jobs ON jobs.id = job_runs.job_id
    JOIN json_each(jobs.variants) AS variant
WHERE test_results."timestamp" BETWEEN {{start}} AND {{end}}
GROUP BY tests.id, tests.name, day, variant.value, jobs."release""#;

const TEST_ANALYSIS_BY_JOB: &str = r#"SELECT
    tests.id AS test_id,
    tests.name AS test_name,
    date(test_results."timestamp", 'unixepoch') AS day,
    jobs.name AS job_name,
    jobs."release" AS "release",
    COUNT(*) AS runs,
    COUNT(CASE WHEN test_results.status = 1 THEN 1 END) AS passes,
    COUNT(CASE WHEN test_results.status = 12 THEN 1 END) AS failures,
    COUNT(CASE WHEN test_results.status = 13 THEN 1 END) AS flakes
FROM test_results
    JOIN tests ON tests.id = test_results.test_id
    JOIN job_runs ON job_runs.id = test_results.job_run_id
    JOIN jobs ON jobs.id = job_runs.job_id
WHERE test_results."timestamp" BETWEEN {{start}} AND {{end}}
GROUP BY tests.id, tests.name, day, jobs.name, jobs."release""#;

/// The aggregates maintained after every load.
pub fn catalog() -> Vec<Definition> {
    use Boundary::*;
    vec![
        Definition::new(
            "test_report_7d",
            TEST_REPORT,
            &[("start", DaysAgo(14)), ("boundary", DaysAgo(7)), ("end", Now)],
        ),
        Definition::new(
            "test_report_2d",
            TEST_REPORT,
            &[("start", DaysAgo(9)), ("boundary", DaysAgo(2)), ("end", Now)],
        ),
        Definition::new(
            "test_analysis_by_variant_14d",
            TEST_ANALYSIS_BY_VARIANT,
            &[("start", DaysAgo(14)), ("end", Now)],
        ),
        Definition::new(
            "test_analysis_by_job_14d",
            TEST_ANALYSIS_BY_JOB,
            &[("start", DaysAgo(14)), ("end", Now)],
        ),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Maintained {
    Created,
    AlreadyExists,
    Refreshed,
    Rebuilt,
}

#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Persists the definitions, replacing stored ones with the same name.
pub fn sync_definitions(conn: &mut Conn, definitions: &[Definition]) -> Result<(), Error> {
    for definition in definitions {
        definition.validate()?;
        let params = serde_json::to_string(&definition.params)?;
        let row = NewAggregateDefinition {
            name: &definition.name,
            params: &params,
            template: &definition.template,
        };
        diesel::insert_into(aggregate_definitions::table)
            .values(&row)
            .on_conflict(aggregate_definitions::name)
            .do_update()
            .set(&row)
            .execute(conn)?;
    }
    Ok(())
}

/// Names of the stored definitions whose template differs from the one
/// in `definitions`.
pub fn changed_definitions(conn: &mut Conn, definitions: &[Definition]) -> Result<Vec<String>, Error> {
    let stored: BTreeMap<String, String> = aggregate_definitions::table
        .select((aggregate_definitions::name, aggregate_definitions::template))
        .load::<(String, String)>(conn)?
        .into_iter()
        .collect();
    Ok(definitions
        .iter()
        .filter(|definition| {
            stored
                .get(&definition.name)
                .is_some_and(|template| *template != definition.template)
        })
        .map(|definition| definition.name.clone())
        .collect())
}

pub fn definitions(conn: &mut Conn) -> Result<Vec<Definition>, Error> {
    aggregate_definitions::table
        .select(AggregateDefinition::as_select())
        .order(aggregate_definitions::name.asc())
        .load(conn)?
        .into_iter()
        .map(|row| -> Result<Definition, Error> {
            Ok(Definition {
                params: serde_json::from_str(&row.params)?,
                name: row.name,
                template: row.template,
            })
        })
        .collect()
}

pub fn exists(conn: &mut Conn, name: &str) -> Result<bool, Error> {
    let found = diesel::sql_query("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind::<Text, _>(name)
        .get_result::<Count>(conn)?;
    Ok(found.count > 0)
}

/// Creates the aggregate unless it exists; creating an existing aggregate
/// succeeds without touching it.
pub fn create(conn: &mut Conn, definition: &Definition, now: OffsetDateTime) -> Result<Maintained, Error> {
    let sql = definition.render(now)?;
    if exists(conn, &definition.name)? {
        return Ok(Maintained::AlreadyExists);
    }
    diesel::sql_query(format!("CREATE TABLE IF NOT EXISTS {} AS {}", definition.name, sql)).execute(conn)?;
    tracing::info!("created aggregate {}", definition.name);
    Ok(Maintained::Created)
}

/// Replaces the contents of the aggregate in one transaction.
pub fn refresh(conn: &mut Conn, definition: &Definition, now: OffsetDateTime) -> Result<(), Error> {
    let sql = definition.render(now)?;
    conn.transaction::<_, Error, _>(|conn| {
        diesel::sql_query(format!("DELETE FROM {}", definition.name)).execute(conn)?;
        let rows = diesel::sql_query(format!("INSERT INTO {} {}", definition.name, sql)).execute(conn)?;
        tracing::debug!("refreshed aggregate {} with {} row(s)", definition.name, rows);
        Ok(())
    })
}

/// Drops the aggregate and creates it again from its current template.
pub fn rebuild(conn: &mut Conn, definition: &Definition, now: OffsetDateTime) -> Result<(), Error> {
    let sql = definition.render(now)?;
    conn.transaction::<_, Error, _>(|conn| {
        diesel::sql_query(format!("DROP TABLE IF EXISTS {}", definition.name)).execute(conn)?;
        diesel::sql_query(format!("CREATE TABLE {} AS {}", definition.name, sql)).execute(conn)?;
        tracing::info!("rebuilt aggregate {} for its new template", definition.name);
        Ok(())
    })
}

/// Keeps the aggregate catalog in the store and every aggregate current.
#[derive(Clone, Debug)]
pub struct Maintainer {
    store: Arc<Store>,
    catalog: Vec<Definition>,
}

impl Maintainer {
    pub fn new(store: Arc<Store>, catalog: Vec<Definition>) -> Self {
        Maintainer { store, catalog }
    }

    /// Syncs the catalog, then creates every missing aggregate and
    /// refreshes the others. An aggregate whose template changed is rebuilt
    /// in the transaction that stores the new template.
    pub async fn maintain(&self, now: OffsetDateTime) -> Result<Vec<(String, Maintained)>, Error> {
        let catalog = self.catalog.clone();
        self.store
            .run(move |_, conn| {
                let changed = changed_definitions(conn, &catalog)?;
                let mut rebuilt = Vec::new();
                for definition in catalog.iter().filter(|definition| changed.contains(&definition.name)) {
                    if !exists(conn, &definition.name)? {
                        continue;
                    }
                    conn.transaction::<_, Error, _>(|conn| {
                        sync_definitions(conn, std::slice::from_ref(definition))?;
                        rebuild(conn, definition, now)
                    })?;
                    rebuilt.push(definition.name.clone());
                }
                sync_definitions(conn, &catalog)?;

                let mut maintained = Vec::new();
                for definition in definitions(conn)? {
                    if rebuilt.contains(&definition.name) {
                        maintained.push((definition.name, Maintained::Rebuilt));
                        continue;
                    }
                    let outcome = match create(conn, &definition, now)? {
                        Maintained::AlreadyExists => {
                            refresh(conn, &definition, now)?;
                            Maintained::Refreshed
                        }
                        outcome => outcome,
                    };
                    maintained.push((definition.name, outcome));
                }
                Ok(maintained)
            })
            .await
    }
}
