use super::{check_status, Error, Params, Row, Warehouse};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// How long the service may hold each request while the query runs.
const WAIT_MS: u32 = 240_000;
/// Waits on an unfinished query before giving up on it.
const MAX_POLLS: u32 = 5;

/// Runs standard-SQL queries through the BigQuery REST `queries` endpoint.
/// Parameters are bound by name as strings (`@release` in the query).
#[derive(Clone, Debug)]
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    token: String,
}

impl BigQueryWarehouse {
    pub fn new(project: &str, token: &str) -> Result<Self, Error> {
        Self::with_endpoint(DEFAULT_ENDPOINT, project, token)
    }

    pub fn with_endpoint(endpoint: &str, project: &str, token: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::BadResponse(e.to_string()))?;
        Ok(BigQueryWarehouse {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project: project.to_string(),
            token: token.to_string(),
        })
    }

    /// Fetches the results of a query job, one page at a time.
    async fn results(&self, job: &JobReference, page_token: Option<&str>) -> Result<QueryResponse, Error> {
        let url = format!("{}/projects/{}/queries/{}", self.endpoint, self.project, job.job_id);
        let mut query = vec![("timeoutMs", WAIT_MS.to_string())];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token.to_string()));
        }
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<RowCells>,
    page_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Schema {
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
struct Field {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RowCells {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: Value,
}

fn body(sql: &str, params: &Params) -> Value {
    let parameters: Vec<Value> = params
        .iter()
        .map(|(name, value)| {
            json!({
                "name": name,
                "parameterType": { "type": "STRING" },
                "parameterValue": { "value": value },
            })
        })
        .collect();
    json!({
        "query": sql,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "queryParameters": parameters,
        "timeoutMs": WAIT_MS,
    })
}

/// What to ask the service for after a response.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Done,
    /// The query is still running.
    Poll,
    Page(String),
}

/// Gathers the rows of every page of a result set. Only the first complete
/// page is guaranteed to carry the schema.
#[derive(Debug, Default)]
struct Collector {
    schema: Option<Schema>,
    rows: Vec<Row>,
}

impl Collector {
    /// BigQuery returns rows as positional cells; scalar values arrive as
    /// strings and are left for the record types to coerce.
    fn absorb(&mut self, response: QueryResponse) -> Result<Next, Error> {
        if !response.job_complete {
            return Ok(Next::Poll);
        }
        if let Some(schema) = response.schema {
            self.schema = Some(schema);
        }
        if !response.rows.is_empty() {
            let Some(schema) = &self.schema else {
                return Err(Error::BadResponse("rows arrived without a schema".to_string()));
            };
            for row in response.rows {
                if row.f.len() != schema.fields.len() {
                    return Err(Error::BadResponse(format!(
                        "row has {} cells, schema has {} fields",
                        row.f.len(),
                        schema.fields.len()
                    )));
                }
                self.rows.push(
                    schema
                        .fields
                        .iter()
                        .zip(row.f)
                        .map(|(field, cell)| (field.name.clone(), cell.v))
                        .collect(),
                );
            }
        }
        Ok(match response.page_token {
            Some(token) => Next::Page(token),
            None => Next::Done,
        })
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, Error> {
        let url = format!("{}/projects/{}/queries", self.endpoint, self.project);
        tracing::debug!("running warehouse query with {} parameter(s)", params.len());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body(sql, params))
            .send()
            .await?;
        let response: QueryResponse = check_status(response).await?.json().await?;
        let job = response.job_reference.clone();

        let mut collector = Collector::default();
        let mut next = collector.absorb(response)?;
        let mut polls = 0;
        let mut pages = 1;
        loop {
            let page_token = match next {
                Next::Done => break,
                Next::Poll if polls >= MAX_POLLS => {
                    return Err(Error::BadResponse("query did not complete in time".to_string()));
                }
                Next::Poll => {
                    polls += 1;
                    None
                }
                Next::Page(token) => {
                    pages += 1;
                    Some(token)
                }
            };
            let job = job
                .as_ref()
                .ok_or_else(|| Error::BadResponse("query response has no job reference".to_string()))?;
            let response = self.results(job, page_token.as_deref()).await?;
            next = collector.absorb(response)?;
        }
        tracing::debug!("warehouse returned {} row(s) in {} page(s)", collector.rows.len(), pages);
        Ok(collector.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: Value) -> QueryResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn binds_named_string_parameters() {
        let params = Params::from([("release".to_string(), "4.14".to_string())]);
        let body = body("SELECT 1 WHERE r = @release", &params);
        assert_eq!(body["parameterMode"], "NAMED");
        assert_eq!(body["queryParameters"][0]["name"], "release");
        assert_eq!(body["queryParameters"][0]["parameterValue"]["value"], "4.14");
    }

    #[test]
    fn zips_cells_with_schema_fields() {
        let mut collector = Collector::default();
        let next = collector
            .absorb(response(json!({
                "jobComplete": true,
                "schema": { "fields": [{ "name": "name" }, { "name": "component" }] },
                "rows": [
                    { "f": [{ "v": "test a" }, { "v": "Networking" }] },
                    { "f": [{ "v": "test b" }, { "v": null }] }
                ]
            })))
            .unwrap();
        assert_eq!(next, Next::Done);
        assert_eq!(collector.rows.len(), 2);
        assert_eq!(collector.rows[0]["component"], "Networking");
        assert_eq!(collector.rows[1]["component"], Value::Null);
    }

    #[test]
    fn follows_page_tokens_across_pages() {
        let mut collector = Collector::default();
        let first = collector
            .absorb(response(json!({
                "jobComplete": true,
                "jobReference": { "jobId": "job_1", "location": "US" },
                "schema": { "fields": [{ "name": "name" }] },
                "rows": [{ "f": [{ "v": "test a" }] }],
                "pageToken": "page-2"
            })))
            .unwrap();
        assert_eq!(first, Next::Page("page-2".to_string()));

        let second = collector
            .absorb(response(json!({
                "jobComplete": true,
                "rows": [{ "f": [{ "v": "test b" }] }]
            })))
            .unwrap();
        assert_eq!(second, Next::Done);
        let names: Vec<&str> = collector.rows.iter().filter_map(|row| row["name"].as_str()).collect();
        assert_eq!(names, vec!["test a", "test b"]);
    }

    #[test]
    fn unfinished_jobs_are_polled() {
        let mut collector = Collector::default();
        let next = collector.absorb(response(json!({ "jobComplete": false }))).unwrap();
        assert_eq!(next, Next::Poll);
        assert!(collector.rows.is_empty());
    }

    #[test]
    fn rows_without_a_schema_are_bad_responses() {
        let mut collector = Collector::default();
        let res = collector.absorb(response(json!({
            "jobComplete": true,
            "rows": [{ "f": [{ "v": "test a" }] }]
        })));
        assert!(matches!(res, Err(Error::BadResponse(_))));
    }
}
