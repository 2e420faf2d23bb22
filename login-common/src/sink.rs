use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::info;

use crate::record::RunBatch;

/// Postgres rejects statements with more bind parameters than this.
const MAX_BIND_PARAMETERS: usize = 65_535;
/// Postgres silently truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Enumeration of errors for writing a batch to the store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("field {column:?} cannot be used as a column name")]
    InvalidColumn { column: String },
}

/// Destination for the records of one run.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Replace whatever the destination holds with exactly `batch`.
    async fn write(&self, batch: &RunBatch) -> Result<(), SinkError>;
}

/// Writes each run's batch into a Postgres table, dropping and recreating it every time.
///
/// Columns are derived from the batch itself and typed `TEXT`, so the table shape follows
/// whatever fields upstream currently sends.
pub struct PgTableSink {
    table: String,
    pool: PgPool,
}

impl PgTableSink {
    pub async fn new(table: &str, url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| SinkError::Connection { error })?;

        Ok(Self::new_from_pool(table, pool))
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl BatchSink for PgTableSink {
    async fn write(&self, batch: &RunBatch) -> Result<(), SinkError> {
        let columns = batch.columns();
        validate_columns(&columns)?;
        let table = quote_identifier(&self.table);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| SinkError::Connection { error })?;

        sqlx::query(&drop_table_statement(&table))
            .execute(&mut *tx)
            .await
            .map_err(|error| SinkError::Query {
                command: "DROP".to_owned(),
                error,
            })?;

        sqlx::query(&create_table_statement(&table, &columns))
            .execute(&mut *tx)
            .await
            .map_err(|error| SinkError::Query {
                command: "CREATE".to_owned(),
                error,
            })?;

        if !batch.is_empty() {
            let rows_per_insert = (MAX_BIND_PARAMETERS / columns.len()).max(1);
            let column_list = columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");

            for chunk in batch.records().chunks(rows_per_insert) {
                let mut query =
                    QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} ({column_list}) "));
                query.push_values(chunk, |mut row, record| {
                    for column in &columns {
                        row.push_bind(record.column_value(column));
                    }
                });

                query
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| SinkError::Query {
                        command: "INSERT".to_owned(),
                        error,
                    })?;
            }
        }

        tx.commit()
            .await
            .map_err(|error| SinkError::Query {
                command: "COMMIT".to_owned(),
                error,
            })?;

        info!(
            table = %self.table,
            rows = batch.len(),
            columns = columns.len(),
            "replaced table contents"
        );

        Ok(())
    }
}

/// Quote an identifier for Postgres, doubling any embedded quotes.
///
/// Quoting does not make every string a valid name: `""` is rejected by Postgres and names over
/// `MAX_IDENTIFIER_LEN` bytes are truncated, see `validate_columns`.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column names come straight from event field names, so reject the ones Postgres cannot hold
/// as distinct columns: the empty name, and names long enough to be truncated into a collision.
pub fn validate_columns(columns: &[String]) -> Result<(), SinkError> {
    match columns
        .iter()
        .find(|c| c.is_empty() || c.len() > MAX_IDENTIFIER_LEN)
    {
        Some(column) => Err(SinkError::InvalidColumn {
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

fn drop_table_statement(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

fn create_table_statement(table: &str, columns: &[String]) -> String {
    let definitions = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!("CREATE TABLE {table} ({definitions})")
}

/// A stored row: `(column, value)` pairs in table column order.
pub type Row = Vec<(String, Option<String>)>;

/// A destructive-replace table held in memory, for tests.
#[derive(Default)]
pub struct MemoryTableSink {
    table: Mutex<(Vec<String>, Vec<Row>)>,
    writes: AtomicUsize,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> Vec<String> {
        self.table.lock().expect("poisoned table lock").0.clone()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.table.lock().expect("poisoned table lock").1.clone()
    }

    /// Value of `column` in every row, in insertion order.
    pub fn column(&self, column: &str) -> Vec<Option<String>> {
        self.rows()
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .find(|(name, _)| name == column)
                    .and_then(|(_, value)| value)
            })
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BatchSink for MemoryTableSink {
    async fn write(&self, batch: &RunBatch) -> Result<(), SinkError> {
        let columns = batch.columns();
        validate_columns(&columns)?;
        let rows: Vec<Row> = batch
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| (c.clone(), record.column_value(c)))
                    .collect()
            })
            .collect();

        *self.table.lock().expect("poisoned table lock") = (columns, rows);
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }
}
