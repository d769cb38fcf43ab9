use crate::error::Error;
use crate::models::{NewBugTest, NewSuite, NewTest, Suite, TestResult};
use crate::schema::{bug_tests, suites, test_ownerships, test_results, tests};
use crate::Conn;

use diesel::prelude::*;

/// Suites every store starts with.
pub const KNOWN_SUITES: &[&str] = &["openshift-tests", "openshift-tests-upgrade", "sippy"];

pub fn seed(conn: &mut Conn) -> Result<(), Error> {
    for name in KNOWN_SUITES {
        let created = diesel::insert_into(suites::table)
            .values(NewSuite { name })
            .on_conflict(suites::name)
            .do_nothing()
            .execute(conn)?;
        if created > 0 {
            tracing::debug!("seeded test suite {}", name);
        }
    }
    Ok(())
}

/// Adds a suite prefix to the registry. Registering an existing suite is a
/// no-op.
pub fn register_suite(conn: &mut Conn, name: &str) -> Result<Suite, Error> {
    if name.is_empty() || name.ends_with('.') {
        return Err(Error::InvalidConfig(format!("invalid suite name {:?}", name)));
    }
    let created = diesel::insert_into(suites::table)
        .values(NewSuite { name })
        .on_conflict(suites::name)
        .do_nothing()
        .execute(conn)?;
    if created > 0 {
        tracing::info!("registered test suite {}", name);
    }
    Ok(suites::table
        .filter(suites::name.eq(name))
        .select(Suite::as_select())
        .first(conn)?)
}

/// The outcome of splitting a raw test name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Normalized<'a> {
    pub suite: Option<&'a Suite>,
    pub name: &'a str,
}

/// In-memory copy of the suite registry, longest names first so that the
/// most specific prefix wins.
#[derive(Clone, Debug)]
pub struct SuiteRegistry {
    suites: Vec<Suite>,
}

impl SuiteRegistry {
    pub fn new(mut suites: Vec<Suite>) -> Self {
        suites.sort_by(|a, b| b.name.len().cmp(&a.name.len()).then_with(|| a.name.cmp(&b.name)));
        SuiteRegistry { suites }
    }

    /// Loads the registry; an empty registry means the store was never
    /// seeded and is reported as unavailable.
    pub fn load(conn: &mut Conn) -> Result<Self, Error> {
        let suites = suites::table
            .select(Suite::as_select())
            .load(conn)
            .map_err(|e| {
                tracing::error!("cannot read the suite registry: {}", e);
                Error::SuiteRegistryUnavailable
            })?;
        if suites.is_empty() {
            return Err(Error::SuiteRegistryUnavailable);
        }
        Ok(Self::new(suites))
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Suite> {
        self.suites.iter().find(|suite| suite.name == name)
    }

    /// Splits `raw` into its suite and canonical name. `raw` belongs to
    /// suite `S` when it reads `S.<rest>` with a non-empty rest.
    pub fn split<'a>(&'a self, raw: &'a str) -> Normalized<'a> {
        for suite in &self.suites {
            if let Some(rest) = strip_suite(raw, &suite.name) {
                return Normalized {
                    suite: Some(suite),
                    name: rest,
                };
            }
        }
        Normalized {
            suite: None,
            name: raw,
        }
    }
}

fn strip_suite<'a>(raw: &'a str, suite: &str) -> Option<&'a str> {
    raw.strip_prefix(suite)?
        .strip_prefix('.')
        .filter(|rest| !rest.is_empty())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub tests_merged: usize,
    pub results_moved: usize,
    pub bug_links_moved: usize,
}

/// Folds every test stored as `<suite>.<rest>` into the canonical test
/// `<rest>`, in one transaction. Results move over with the suite set and
/// the next free invocation, bug links follow, and ownership rows are
/// detached until the ownership loader resolves them again.
pub fn backfill_suite(conn: &mut Conn, name: &str) -> Result<BackfillReport, Error> {
    conn.transaction::<_, Error, _>(|conn| {
        let suite = suites::table
            .filter(suites::name.eq(name))
            .select(Suite::as_select())
            .first(conn)
            .optional()?
            .ok_or_else(|| Error::SuiteNotFound(name.to_string()))?;

        // '/' is the byte after '.', so this range holds exactly the names
        // starting with "<suite>."
        let lower = format!("{}.", suite.name);
        let upper = format!("{}/", suite.name);
        let prefixed: Vec<(i32, String)> = tests::table
            .filter(tests::name.ge(&lower))
            .filter(tests::name.lt(&upper))
            .select((tests::id, tests::name))
            .order(tests::id.asc())
            .load(conn)?;

        let mut report = BackfillReport::default();
        for (prefixed_id, prefixed_name) in prefixed {
            let Some(canonical) = strip_suite(&prefixed_name, &suite.name) else {
                continue;
            };
            diesel::insert_into(tests::table)
                .values(NewTest { name: canonical })
                .on_conflict(tests::name)
                .do_nothing()
                .execute(conn)?;
            let canonical_id: i32 = tests::table
                .filter(tests::name.eq(canonical))
                .select(tests::id)
                .first(conn)?;

            let results: Vec<TestResult> = test_results::table
                .filter(test_results::test_id.eq(prefixed_id))
                .select(TestResult::as_select())
                .order(test_results::id.asc())
                .load(conn)?;
            for result in results {
                let taken: Option<i32> = test_results::table
                    .filter(test_results::job_run_id.eq(result.job_run_id))
                    .filter(test_results::test_id.eq(canonical_id))
                    .select(diesel::dsl::max(test_results::invocation))
                    .first(conn)?;
                let invocation = taken.map_or(result.invocation, |max| max + 1);
                diesel::update(test_results::table.find(result.id))
                    .set((
                        test_results::test_id.eq(canonical_id),
                        test_results::suite_id.eq(Some(suite.id)),
                        test_results::invocation.eq(invocation),
                    ))
                    .execute(conn)?;
                report.results_moved += 1;
            }

            let bug_ids: Vec<i32> = bug_tests::table
                .filter(bug_tests::test_id.eq(prefixed_id))
                .select(bug_tests::bug_id)
                .load(conn)?;
            for bug_id in bug_ids {
                report.bug_links_moved += diesel::insert_into(bug_tests::table)
                    .values(NewBugTest {
                        bug_id,
                        test_id: canonical_id,
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)?;
            }
            diesel::delete(bug_tests::table.filter(bug_tests::test_id.eq(prefixed_id))).execute(conn)?;
            diesel::update(test_ownerships::table.filter(test_ownerships::test_id.eq(prefixed_id)))
                .set(test_ownerships::test_id.eq(None::<i32>))
                .execute(conn)?;
            diesel::delete(tests::table.find(prefixed_id)).execute(conn)?;

            tracing::debug!("merged test {:?} into {:?}", prefixed_name, canonical);
            report.tests_merged += 1;
        }

        tracing::info!(
            "backfilled suite {}: {} test(s) merged, {} result(s) moved",
            suite.name,
            report.tests_merged,
            report.results_moved
        );
        Ok(report)
    })
}
