use crate::error::Error;
use crate::models::{HighWaterMark, NewHighWaterItem, NewTest};
use crate::schema::{high_water_items, high_water_marks, tests};
use crate::suites;
use crate::{Conn, ConnectionCustomizer, DbPool, Settings, MIGRATIONS};

use diesel::prelude::*;
use diesel::r2d2;
use diesel_migrations::MigrationHarness;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// The canonical store. Cloning is cheap, clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    batch_size: usize,
    write_retries: u32,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("batch_size", &self.batch_size)
            .field("write_retries", &self.write_retries)
            .finish()
    }
}

impl Store {
    /// Opens the pool, applies pending migrations and seeds the suite
    /// registry.
    pub fn open(settings: &Settings) -> Result<Self, Error> {
        if settings.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".to_string()));
        }
        let manager = r2d2::ConnectionManager::<SqliteConnection>::new(&settings.database_url);
        let pool = r2d2::Pool::builder()
            .max_size(settings.pool_size.max(1))
            .connection_customizer(Box::new(ConnectionCustomizer {}))
            .build(manager)?;

        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| Error::Migration(e.to_string()))?;
        if !applied.is_empty() {
            tracing::info!("applied {} migration(s) to {}", applied.len(), settings.database_url);
        }
        suites::seed(&mut conn)?;

        Ok(Store {
            pool,
            batch_size: settings.batch_size,
            write_retries: settings.write_retries,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn conn(&self) -> Result<Conn, Error> {
        Ok(self.pool.get()?)
    }

    /// Runs blocking store work on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Store, &mut Conn) -> Result<T, Error> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.conn()?;
            f(&store, &mut conn)
        })
        .await?
    }

    /// Writes `rows` in sub-batches of at most `batch_size`, each in its own
    /// transaction. A sub-batch that hits lock contention is retried; one
    /// that fails for good stops the write, and the sub-batches before it
    /// stay committed.
    pub fn write_chunked<T, F>(&self, conn: &mut Conn, rows: &[T], mut write: F) -> Result<usize, Error>
    where
        F: FnMut(&mut Conn, &[T]) -> Result<usize, Error>,
    {
        let mut committed = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut attempt = 0;
            loop {
                match conn.transaction::<_, Error, _>(|conn| write(conn, chunk)) {
                    Ok(written) => {
                        committed += written;
                        break;
                    }
                    Err(e) if e.is_busy() && attempt < self.write_retries => {
                        attempt += 1;
                        tracing::debug!("database is locked, retrying sub-batch (attempt {})", attempt);
                        std::thread::sleep(Duration::from_millis(50 << attempt));
                    }
                    Err(e) => {
                        return Err(Error::Batch {
                            committed,
                            source: Box::new(e),
                        })
                    }
                }
            }
        }
        Ok(committed)
    }

    /// Creates the missing tests and returns the id of every name, along
    /// with how many tests were created.
    pub fn ensure_tests(&self, conn: &mut Conn, names: &[&str]) -> Result<(HashMap<String, i32>, usize), Error> {
        let mut created = 0;
        for name in names {
            created += diesel::insert_into(tests::table)
                .values(NewTest { name })
                .on_conflict(tests::name)
                .do_nothing()
                .execute(conn)?;
        }
        let mut ids = HashMap::with_capacity(names.len());
        for chunk in names.chunks(self.batch_size) {
            let chunk: Vec<String> = chunk.iter().map(|name| name.to_string()).collect();
            ids.extend(
                tests::table
                    .filter(tests::name.eq_any(chunk))
                    .select((tests::name, tests::id))
                    .load::<(String, i32)>(conn)?,
            );
        }
        Ok((ids, created))
    }

    pub fn high_water_mark(conn: &mut Conn, category: &str) -> Result<Option<i64>, Error> {
        Ok(high_water_marks::table
            .find(category)
            .select(HighWaterMark::as_select())
            .first(conn)
            .optional()?
            .map(|mark| mark.value))
    }

    /// Items already processed at exactly the current mark of `category`.
    pub fn high_water_items(conn: &mut Conn, category: &str) -> Result<HashSet<String>, Error> {
        Ok(high_water_items::table
            .filter(high_water_items::category.eq(category))
            .select(high_water_items::item)
            .load::<String>(conn)?
            .into_iter()
            .collect())
    }

    /// Advances the mark of `category`; a mark never moves backwards.
    /// `items` were processed at exactly `value`: they replace the items of
    /// an older mark and join those of an equal one.
    pub fn set_high_water_mark(conn: &mut Conn, category: &str, value: i64, items: &[String]) -> Result<(), Error> {
        match Self::high_water_mark(conn, category)? {
            Some(current) if current > value => return Ok(()),
            Some(current) if current == value => {}
            _ => {
                diesel::insert_into(high_water_marks::table)
                    .values((
                        high_water_marks::category.eq(category),
                        high_water_marks::value.eq(value),
                    ))
                    .on_conflict(high_water_marks::category)
                    .do_update()
                    .set(high_water_marks::value.eq(value))
                    .execute(conn)?;
                diesel::delete(high_water_items::table.filter(high_water_items::category.eq(category)))
                    .execute(conn)?;
            }
        }
        for item in items {
            diesel::insert_into(high_water_items::table)
                .values(NewHighWaterItem { category, item })
                .on_conflict_do_nothing()
                .execute(conn)?;
        }
        Ok(())
    }
}
