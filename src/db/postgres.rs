//! PostgreSQL implementation of the connection provider

use crate::db::queries::{self, SqlBuilder};
use crate::db::{BackfillRow, ColumnInfo, ColumnSpec, Database, DbError, ForeignKey};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio_postgres::types::ToSql;
use tracing::debug;

/// One pooled connection bound to the schema the registrar tables live in
pub struct PgDatabase {
    client: Object,
    schema: String,
}

fn stmt_err(statement: &str, e: tokio_postgres::Error) -> DbError {
    let reason = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    let err = DbError::new(statement.trim(), reason);
    match e.code() {
        Some(code) => err.with_code(code.code()),
        None => err,
    }
}

impl PgDatabase {
    /// Check a connection out of the pool for the duration of a run
    pub async fn connect(pool: &Pool, schema: &str) -> Result<Self, DbError> {
        let client = pool
            .get()
            .await
            .map_err(|e| DbError::new("<connect>", e.to_string()))?;
        Ok(Self {
            client,
            schema: schema.to_string(),
        })
    }

    async fn batch(&mut self, sql: &str) -> Result<(), DbError> {
        debug!("{}", sql);
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| stmt_err(sql, e))
    }

    async fn exists(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<bool, DbError> {
        let row = self
            .client
            .query_one(sql, params)
            .await
            .map_err(|e| stmt_err(sql, e))?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        let schema = self.schema.clone();
        self.exists(queries::TABLE_EXISTS, &[&schema, &table]).await
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError> {
        let schema = self.schema.clone();
        self.exists(queries::COLUMN_EXISTS, &[&schema, &table, &column])
            .await
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let rows = self
            .client
            .query(queries::GET_COLUMNS, &[&self.schema, &table])
            .await
            .map_err(|e| stmt_err(queries::GET_COLUMNS, e))?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get("nullable"),
                default_value: row.get("column_default"),
                is_identity: row.get("is_identity"),
            })
            .collect())
    }

    async fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError> {
        let rows = self
            .client
            .query(queries::TABLES_WITH_PREFIX, &[&self.schema, &prefix])
            .await
            .map_err(|e| stmt_err(queries::TABLES_WITH_PREFIX, e))?;
        Ok(rows.iter().map(|r| r.get("table_name")).collect())
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        let rows = self
            .client
            .query(queries::GET_PRIMARY_KEYS, &[&self.schema, &table])
            .await
            .map_err(|e| stmt_err(queries::GET_PRIMARY_KEYS, e))?;
        Ok(rows.iter().map(|r| r.get("column_name")).collect())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64, DbError> {
        let sql = SqlBuilder::row_count(&self.schema, table);
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .map_err(|e| stmt_err(&sql, e))?;
        Ok(row.get(0))
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.batch(queries::BEGIN).await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.batch(queries::COMMIT).await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.batch(queries::ROLLBACK).await
    }

    async fn set_constraint_checks(&mut self, enabled: bool) -> Result<(), DbError> {
        if enabled {
            self.batch(queries::ENABLE_CONSTRAINT_CHECKS).await
        } else {
            self.batch(queries::DISABLE_CONSTRAINT_CHECKS).await
        }
    }

    async fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), DbError> {
        if let Some(ref after) = column.after {
            debug!(
                "PostgreSQL has no column placement; {}.{} is appended instead of following {}",
                table, column.name, after
            );
        }
        let sql = SqlBuilder::add_column(&self.schema, table, column);
        self.batch(&sql).await
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<(), DbError> {
        let sql = SqlBuilder::rename_table(&self.schema, from, to);
        self.batch(&sql).await
    }

    async fn copy_table(&mut self, source: &str, target: &str) -> Result<(), DbError> {
        let sql = SqlBuilder::copy_table(&self.schema, source, target);
        self.batch(&sql).await
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        let sql = SqlBuilder::drop_table(&self.schema, table);
        self.batch(&sql).await
    }

    async fn foreign_keys(&mut self, table: &str) -> Result<Vec<ForeignKey>, DbError> {
        let rows = self
            .client
            .query(queries::GET_FOREIGN_KEYS, &[&self.schema, &table])
            .await
            .map_err(|e| stmt_err(queries::GET_FOREIGN_KEYS, e))?;
        Ok(rows
            .iter()
            .map(|r| ForeignKey {
                name: r.get("constraint_name"),
                table: r.get("table_name"),
                referenced_table: r.get("referenced_table"),
                definition: r.get("definition"),
            })
            .collect())
    }

    async fn drop_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError> {
        let sql = SqlBuilder::drop_constraint(&self.schema, &fk.table, &fk.name);
        self.batch(&sql).await
    }

    async fn add_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError> {
        let sql = SqlBuilder::add_constraint(&self.schema, &fk.table, &fk.name, &fk.definition);
        self.batch(&sql).await
    }

    async fn drop_columns(&mut self, table: &str, columns: &[String]) -> Result<(), DbError> {
        let sql = SqlBuilder::drop_columns(&self.schema, table, columns);
        self.batch(&sql).await
    }

    async fn restore_primary_key(
        &mut self,
        table: &str,
        keys: &[String],
        identity: Option<&str>,
    ) -> Result<(), DbError> {
        let sql = SqlBuilder::add_primary_key(&self.schema, table, keys);
        self.batch(&sql).await?;

        if let Some(column) = identity {
            let sql = SqlBuilder::add_identity(&self.schema, table, column);
            self.batch(&sql).await?;

            let sql = SqlBuilder::sync_identity(&self.schema, table, column);
            self.client
                .query_one(&sql, &[])
                .await
                .map_err(|e| stmt_err(&sql, e))?;
        }
        Ok(())
    }

    async fn backfill_candidates(
        &mut self,
        table: &str,
        key: &str,
        source: &str,
        targets: &[String],
    ) -> Result<Vec<BackfillRow>, DbError> {
        let sql = SqlBuilder::backfill_candidates(&self.schema, table, key, source, targets);
        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| stmt_err(&sql, e))?;
        Ok(rows
            .iter()
            .map(|r| BackfillRow {
                id: r.get(0),
                value: r.get(1),
            })
            .collect())
    }

    async fn update_row(
        &mut self,
        table: &str,
        key: &str,
        id: i64,
        values: &[(String, String)],
    ) -> Result<u64, DbError> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
        let sql = SqlBuilder::update_row(&self.schema, table, key, &columns);

        let mut params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|(_, v)| v as &(dyn ToSql + Sync))
            .collect();
        params.push(&id);

        self.client
            .execute(&sql, &params)
            .await
            .map_err(|e| stmt_err(&sql, e))
    }
}
