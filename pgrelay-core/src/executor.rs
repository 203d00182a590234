//! Parameterized query execution over the shared pool.

use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::postgres::PgTypeInfo;
use sqlx::{Either, Executor, PgConnection, Statement};
use tracing::instrument;

use crate::error::{DbResult, Result, ValidationError};
use crate::params::{bind_all, decode_params, summary, QueryParam};
use crate::pool::ConnectionPool;
use crate::rows::{command_tag, row_to_json};

/// Caller-supplied query and its raw, undecoded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    pub params: Vec<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.query.trim().is_empty() {
            return Err(ValidationError::Empty { field: "query" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Map<String, Value>>,
    /// Rows affected or returned, summed over the statement's results
    pub row_count: u64,
    pub command_tag: String,
}

impl QueryResult {
    /// Rows as a JSON array string.
    pub fn rows_json(&self) -> String {
        Value::Array(self.rows.iter().cloned().map(Value::Object).collect()).to_string()
    }
}

/// Runs caller queries on pooled connections
pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Validate, decode parameters, run the query and marshal the rows.
    ///
    /// Parameters are encoded as the types the server infers for their
    /// placeholders, so `WHERE id = $1` takes a uuid string as-is.
    ///
    /// The connection goes back to the pool on every exit path; one that
    /// failed at the transport level is destroyed instead.
    #[instrument(skip_all, fields(command = %command_tag(&request.query)))]
    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResult> {
        request.validate()?;

        let params = decode_params(&request.params);
        tracing::debug!(query = %request.query, params = %summary(&params), "executing query");

        let mut conn = self.pool.acquire().await?;
        let outcome = run(&mut conn, &request.query, params).await;

        match &outcome {
            Err(e) if e.is_connection_fault() => self.pool.discard(conn).await,
            _ => self.pool.release(conn),
        }

        match outcome {
            Ok(result) => {
                tracing::debug!(row_count = result.row_count, "query executed");
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, "query failed");
                Err(e.into())
            }
        }
    }
}

async fn run(conn: &mut PgConnection, sql: &str, params: Vec<QueryParam>) -> DbResult<QueryResult> {
    // Preparing first lets the server infer each placeholder's type.
    let statement = if params.is_empty() {
        None
    } else {
        Some((&mut *conn).prepare(sql).await?)
    };

    let query = match &statement {
        Some(statement) => {
            let types: &[PgTypeInfo] = match statement.parameters() {
                Some(Either::Left(types)) => types,
                _ => &[],
            };
            bind_all(statement.query(), params, types)?
        }
        None => sqlx::query(sql),
    };

    let mut rows = Vec::new();
    let mut row_count = 0u64;

    let mut results = conn.fetch_many(query);
    while let Some(step) = results.try_next().await? {
        match step {
            Either::Left(done) => row_count += done.rows_affected(),
            Either::Right(row) => rows.push(row_to_json(&row)),
        }
    }

    Ok(QueryResult {
        rows,
        row_count,
        command_tag: command_tag(sql),
    })
}
