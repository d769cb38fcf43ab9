mod models;
mod schema;

pub mod aggregates;
pub mod connectors;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod loaders;
pub mod store;
pub mod suites;
pub mod synthetic;
pub mod variants;

#[cfg(test)]
mod tests;

pub use tally_types::{artifacts, records, RunOutcome, TestStatus};

pub use crate::aggregates::{Maintained, Maintainer};
pub use crate::context::{Canceler, Context};
pub use crate::coordinator::{Coordinator, LoaderFailure, LoaderSummary};
pub use crate::error::Error;
pub use crate::loaders::{ItemError, LoadReport, Loader, LoaderKind};
pub use crate::store::Store;

use diesel::r2d2;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use time::OffsetDateTime;

pub type DbPool = r2d2::Pool<r2d2::ConnectionManager<SqliteConnection>>;
pub type Conn = r2d2::PooledConnection<r2d2::ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[derive(Debug)]
pub struct ConnectionCustomizer {}

impl r2d2::CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        use diesel::connection::SimpleConnection;
        (|| {
            conn.batch_execute("PRAGMA foreign_keys = ON;")?;
            conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            conn.batch_execute("PRAGMA busy_timeout = 10000;")?;
            Ok(())
        })()
        .map_err(r2d2::Error::QueryError)
    }
}

/// Store-wide settings, shared by every loader of an invocation.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    /// Upper bound on the rows written by one statement or one batch.
    pub batch_size: usize,
    /// How many times a sub-batch is retried when the database is locked.
    pub write_retries: u32,
    pub pool_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "tally.sqlite".to_string(),
            batch_size: 1024,
            write_retries: 3,
            pool_size: 8,
        }
    }
}

/// What one load invocation did.
#[derive(Debug)]
pub struct LoadOutcome {
    pub summaries: Vec<LoaderSummary>,
    pub failures: Vec<LoaderFailure>,
    pub aggregates: Vec<(String, Maintained)>,
}

impl LoadOutcome {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Runs the loaders once, then brings the aggregates up to date. The
/// aggregates are maintained even when some loaders failed; a maintenance
/// failure is reported alongside the loader failures.
pub async fn load(
    loaders: Vec<Box<dyn Loader>>,
    maintainer: &Maintainer,
    ctx: &Context,
    now: OffsetDateTime,
) -> Result<LoadOutcome, Error> {
    let mut coordinator = Coordinator::new(loaders);
    coordinator.run(ctx).await?;
    let (summaries, mut failures) = coordinator.into_parts();

    let aggregates = match maintainer.maintain(now).await {
        Ok(aggregates) => aggregates,
        Err(error) => {
            tracing::error!("aggregate maintenance failed: {}", error);
            failures.push(LoaderFailure {
                loader: aggregates::MAINTAINER_NAME,
                error,
            });
            Vec::new()
        }
    };

    Ok(LoadOutcome {
        summaries,
        failures,
        aggregates,
    })
}
