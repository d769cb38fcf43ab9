use crate::context::Context;
use crate::error::Error;
use crate::loaders::{LoadReport, Loader};

use futures::future::join_all;
use time::OffsetDateTime;

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum State {
    Pending,
    Running,
    Done,
}

/// A loader that gave up.
#[derive(Debug, derive_more::Display)]
#[display("{loader}: {error}")]
pub struct LoaderFailure {
    pub loader: &'static str,
    pub error: Error,
}

/// What one loader did during the run.
#[derive(Clone, Debug)]
pub struct LoaderSummary {
    pub loader: &'static str,
    pub started: OffsetDateTime,
    pub elapsed: Duration,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub item_errors: usize,
    /// The fatal error, rendered.
    pub failure: Option<String>,
}

/// Runs a set of loaders once, concurrently, and keeps track of how each
/// of them went. A failing loader never stops the others.
pub struct Coordinator {
    loaders: Vec<Box<dyn Loader>>,
    state: State,
    summaries: Vec<LoaderSummary>,
    failures: Vec<LoaderFailure>,
}

impl Coordinator {
    pub fn new(loaders: Vec<Box<dyn Loader>>) -> Self {
        Coordinator {
            loaders,
            state: State::Pending,
            summaries: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub async fn run(&mut self, ctx: &Context) -> Result<(), Error> {
        if self.state != State::Pending {
            return Err(Error::AlreadyRun);
        }
        self.state = State::Running;
        tracing::info!("running {} loader(s)", self.loaders.len());

        let outcomes = join_all(self.loaders.iter().map(|loader| timed(loader.as_ref(), ctx))).await;
        for (summary, res) in outcomes {
            if let Err(error) = res {
                self.failures.push(LoaderFailure {
                    loader: summary.loader,
                    error,
                });
            }
            self.summaries.push(summary);
        }

        self.state = State::Done;
        Ok(())
    }

    pub fn summaries(&self) -> &[LoaderSummary] {
        &self.summaries
    }

    /// Fatal errors, in loader order.
    pub fn errors(&self) -> &[LoaderFailure] {
        &self.failures
    }

    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn into_parts(self) -> (Vec<LoaderSummary>, Vec<LoaderFailure>) {
        (self.summaries, self.failures)
    }
}

async fn timed(loader: &dyn Loader, ctx: &Context) -> (LoaderSummary, Result<(), Error>) {
    let name = loader.name();
    let started = OffsetDateTime::now_utc();
    let clock = Instant::now();
    tracing::info!("loader {} started", name);

    let res = loader.load(ctx).await;
    let elapsed = clock.elapsed();
    let mut summary = LoaderSummary {
        loader: name,
        started,
        elapsed,
        inserted: 0,
        updated: 0,
        skipped: 0,
        item_errors: 0,
        failure: None,
    };
    let res = match res {
        Ok(LoadReport {
            inserted,
            updated,
            skipped,
            item_errors,
        }) => {
            summary.inserted = inserted;
            summary.updated = updated;
            summary.skipped = skipped;
            summary.item_errors = item_errors.len();
            tracing::info!(
                "loader {} finished in {:.1?}: {} inserted, {} updated, {} skipped, {} item error(s)",
                name,
                elapsed,
                inserted,
                updated,
                skipped,
                item_errors.len()
            );
            Ok(())
        }
        Err(e) => {
            if e.is_internal() {
                tracing::error!("loader {} failed after {:.1?}: {:?}", name, elapsed, e);
            } else {
                tracing::error!("loader {} failed after {:.1?}: {}", name, elapsed, e);
            }
            summary.failure = Some(e.to_string());
            Err(e)
        }
    };
    (summary, res)
}
