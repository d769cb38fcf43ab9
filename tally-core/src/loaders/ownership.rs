use super::{LoadReport, Loader};
use crate::connectors::{Params, Warehouse};
use crate::context::Context;
use crate::error::Error;
use crate::models::NewTestOwnership;
use crate::schema::test_ownerships;
use crate::store::Store;
use crate::Conn;

use tally_types::records::OwnershipRecord;

use async_trait::async_trait;
use diesel::prelude::*;

use std::collections::BTreeMap;
use std::sync::Arc;

pub const OWNERSHIP_QUERY: &str = "SELECT name, suite, component, jira_component, staff_approved_obsolete \
     FROM component_mapping \
     ORDER BY name";

const RESOLVE_TEST_IDS: &str = "UPDATE test_ownerships \
     SET test_id = (SELECT tests.id FROM tests WHERE tests.name = test_ownerships.test_name)";

/// Loads which component owns each test.
pub struct TestOwnershipLoader {
    store: Arc<Store>,
    warehouse: Arc<dyn Warehouse>,
}

impl TestOwnershipLoader {
    pub fn new(store: Arc<Store>, warehouse: Arc<dyn Warehouse>) -> Self {
        TestOwnershipLoader { store, warehouse }
    }
}

fn write_ownerships(conn: &mut Conn, chunk: &[NewTestOwnership]) -> Result<usize, Error> {
    for ownership in chunk {
        diesel::insert_into(test_ownerships::table)
            .values(ownership)
            .on_conflict(test_ownerships::test_name)
            .do_update()
            .set(ownership)
            .execute(conn)?;
    }
    Ok(chunk.len())
}

#[async_trait]
impl Loader for TestOwnershipLoader {
    fn name(&self) -> &'static str {
        "test-ownership"
    }

    async fn load(&self, ctx: &Context) -> Result<LoadReport, Error> {
        let mut report = LoadReport::default();
        // The whole mapping comes from one query, so any failure is fatal.
        let rows = ctx.run(self.warehouse.query(OWNERSHIP_QUERY, &Params::new())).await??;
        let records: Vec<OwnershipRecord> = report.decode_rows("component mapping", rows);

        // Later rows for the same test win.
        let ownerships: Vec<NewTestOwnership> = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .map(|record| NewTestOwnership {
                component: record.component,
                jira_component: record.jira_component,
                staff_approved_obsolete: record.staff_approved_obsolete,
                suite: record.suite,
                test_name: record.name,
            })
            .collect();
        tracing::info!("upserting ownership of {} test(s)", ownerships.len());

        let (written, resolved) = ctx
            .run(self.store.run(move |store, conn| {
                let written = store.write_chunked(conn, &ownerships, write_ownerships)?;
                let resolved = diesel::sql_query(RESOLVE_TEST_IDS).execute(conn)?;
                Ok((written, resolved))
            }))
            .await??;
        tracing::debug!("resolved test ids of {} ownership row(s)", resolved);
        report.updated += written;
        Ok(report)
    }
}
