//! In-memory database used by the migrator tests.
//!
//! Models just enough of a relational store to observe what steps do:
//! ordered columns, rows of optional text, a primary key, identity
//! counters, single-column foreign keys, whole-store transactions, and a
//! constraint-check flag.
//! Fail points make chosen operations error (or panic) on demand.

use crate::db::{BackfillRow, ColumnInfo, ColumnSpec, Database, DbError, ForeignKey};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

static FK_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^FOREIGN KEY \((\w+)\) REFERENCES (\w+)\((\w+)\)$").expect("definition pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AddColumn(String),
    RenameTable(String),
    PanicOnRename(String),
    CopyTable(String),
    DropTable(String),
    DropColumns(String),
    RestorePrimaryKey(String),
    UpdateRow(i64),
    Rollback,
    EnableConstraintChecks,
}

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
    pub primary_key: Vec<String>,
    next_id: i64,
}

impl MemTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemForeignKey {
    pub table: String,
    pub column: String,
    pub references: String,
    pub referenced_column: String,
}

impl MemForeignKey {
    fn definition(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            self.column, self.references, self.referenced_column
        )
    }
}

type Store = (BTreeMap<String, MemTable>, BTreeMap<String, MemForeignKey>);

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: BTreeMap<String, MemTable>,
    foreign_keys: BTreeMap<String, MemForeignKey>,
    snapshot: Option<Store>,
    constraint_checks: bool,
    fail_points: HashSet<FailPoint>,
    /// Every mutating call, in order
    pub log: Vec<String>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            constraint_checks: true,
            ..Default::default()
        }
    }

    /// Create a table; `key` becomes an auto-incrementing primary key.
    pub fn create_table(&mut self, name: &str, columns: &[&str], key: Option<&str>) {
        let columns = columns
            .iter()
            .map(|c| ColumnInfo {
                name: c.to_string(),
                data_type: "text".to_string(),
                nullable: Some(*c) != key,
                default_value: None,
                is_identity: Some(*c) == key,
            })
            .collect();
        self.tables.insert(
            name.to_string(),
            MemTable {
                columns,
                rows: Vec::new(),
                primary_key: key.map(|k| vec![k.to_string()]).unwrap_or_default(),
                next_id: 1,
            },
        );
    }

    /// Insert a row; a `None` key on an identity column takes the next id.
    pub fn insert(&mut self, table: &str, values: &[Option<&str>]) -> i64 {
        let t = self.tables.get_mut(table).expect("table exists");
        let mut row: Vec<Option<String>> = values.iter().map(|v| v.map(String::from)).collect();
        row.resize(t.columns.len(), None);

        let mut id = 0;
        if let Some(key) = t.primary_key.first().cloned() {
            let idx = t.position(&key).expect("key column exists");
            match row[idx].as_deref().and_then(|v| v.parse::<i64>().ok()) {
                Some(given) => id = given,
                None if t.columns[idx].is_identity => {
                    id = t.next_id;
                    row[idx] = Some(id.to_string());
                }
                None => {}
            }
            t.next_id = t.next_id.max(id + 1);
        }
        t.rows.push(row);
        id
    }

    /// Declare `table.column REFERENCES references(referenced_column)`.
    pub fn add_reference(
        &mut self,
        name: &str,
        table: &str,
        column: &str,
        references: &str,
        referenced_column: &str,
    ) {
        self.foreign_keys.insert(
            name.to_string(),
            MemForeignKey {
                table: table.to_string(),
                column: column.to_string(),
                references: references.to_string(),
                referenced_column: referenced_column.to_string(),
            },
        );
    }

    pub fn foreign_key(&self, name: &str) -> Option<&MemForeignKey> {
        self.foreign_keys.get(name)
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn fail_on(&mut self, point: FailPoint) {
        self.fail_points.insert(point);
    }

    pub fn clear_fail_points(&mut self) {
        self.fail_points.clear();
    }

    pub fn table(&self, name: &str) -> Option<&MemTable> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn value(&self, table: &str, id: i64, column: &str) -> Option<String> {
        let t = self.tables.get(table)?;
        let key = t.primary_key.first().map(String::as_str).unwrap_or("id");
        let key_idx = t.position(key)?;
        let col_idx = t.position(column)?;
        t.rows
            .iter()
            .find(|r| r[key_idx].as_deref() == Some(id.to_string().as_str()))
            .and_then(|r| r[col_idx].clone())
    }

    pub fn constraint_checks_enabled(&self) -> bool {
        self.constraint_checks
    }

    fn check(&self, point: FailPoint, statement: &str) -> Result<(), DbError> {
        if self.fail_points.contains(&point) {
            return Err(DbError::new(statement, "injected failure"));
        }
        Ok(())
    }

    fn get_mut(&mut self, table: &str, statement: &str) -> Result<&mut MemTable, DbError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| DbError::new(statement, format!("relation \"{}\" does not exist", table)).with_code("42P01"))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        Ok(self.tables.contains_key(table))
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError> {
        Ok(self
            .tables
            .get(table)
            .is_some_and(|t| t.position(column).is_some()))
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError> {
        Ok(self
            .tables
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.primary_key.clone())
            .unwrap_or_default())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64, DbError> {
        let t = self.get_mut(table, "SELECT COUNT(*)")?;
        Ok(t.rows.len() as i64)
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        if self.snapshot.is_some() {
            return Err(DbError::new("BEGIN", "transaction already open"));
        }
        self.log.push("BEGIN".to_string());
        self.snapshot = Some((self.tables.clone(), self.foreign_keys.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.log.push("COMMIT".to_string());
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.check(FailPoint::Rollback, "ROLLBACK")?;
        self.log.push("ROLLBACK".to_string());
        if let Some((tables, foreign_keys)) = self.snapshot.take() {
            self.tables = tables;
            self.foreign_keys = foreign_keys;
        }
        Ok(())
    }

    async fn set_constraint_checks(&mut self, enabled: bool) -> Result<(), DbError> {
        if enabled {
            self.check(FailPoint::EnableConstraintChecks, "SET checks = on")?;
        }
        self.log.push(format!("CHECKS {}", if enabled { "ON" } else { "OFF" }));
        self.constraint_checks = enabled;
        Ok(())
    }

    async fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), DbError> {
        let statement = format!("ADD COLUMN {}.{}", table, column.name);
        self.check(FailPoint::AddColumn(column.name.clone()), &statement)?;
        let t = self.get_mut(table, &statement)?;
        if t.position(&column.name).is_some() {
            return Err(DbError::new(statement, "column already exists").with_code("42701"));
        }
        let info = ColumnInfo {
            name: column.name.clone(),
            data_type: column.data_type.clone(),
            nullable: column.nullable,
            default_value: column.default_value.clone(),
            is_identity: false,
        };
        let at = column
            .after
            .as_deref()
            .and_then(|a| t.position(a))
            .map(|i| i + 1)
            .unwrap_or(t.columns.len());
        t.columns.insert(at, info);
        let fill = column.default_value.clone();
        for row in &mut t.rows {
            row.insert(at, fill.clone());
        }
        self.log.push(statement);
        Ok(())
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<(), DbError> {
        let statement = format!("RENAME {} TO {}", from, to);
        if self.fail_points.contains(&FailPoint::PanicOnRename(from.to_string())) {
            panic!("injected panic during {}", statement);
        }
        self.check(FailPoint::RenameTable(from.to_string()), &statement)?;
        if self.tables.contains_key(to) {
            return Err(DbError::new(statement, format!("relation \"{}\" already exists", to)).with_code("42P07"));
        }
        let t = self
            .tables
            .remove(from)
            .ok_or_else(|| DbError::new(statement.clone(), "no such table").with_code("42P01"))?;
        self.tables.insert(to.to_string(), t);
        for fk in self.foreign_keys.values_mut() {
            if fk.table == from {
                fk.table = to.to_string();
            }
            if fk.references == from {
                fk.references = to.to_string();
            }
        }
        self.log.push(statement);
        Ok(())
    }

    async fn copy_table(&mut self, source: &str, target: &str) -> Result<(), DbError> {
        let statement = format!("COPY {} AS {}", source, target);
        self.check(FailPoint::CopyTable(target.to_string()), &statement)?;
        if self.tables.contains_key(target) {
            return Err(DbError::new(statement, "target exists").with_code("42P07"));
        }
        let src = self.get_mut(source, &statement)?.clone();
        let copy = MemTable {
            columns: src
                .columns
                .into_iter()
                .map(|c| ColumnInfo {
                    nullable: true,
                    default_value: None,
                    is_identity: false,
                    ..c
                })
                .collect(),
            rows: src.rows,
            primary_key: Vec::new(),
            next_id: 1,
        };
        self.tables.insert(target.to_string(), copy);
        self.log.push(statement);
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        let statement = format!("DROP TABLE {}", table);
        self.check(FailPoint::DropTable(table.to_string()), &statement)?;
        if let Some((name, _)) = self
            .foreign_keys
            .iter()
            .find(|(_, fk)| fk.references == table && fk.table != table)
        {
            return Err(DbError::new(
                statement,
                format!("cannot drop table {} because constraint {} depends on it", table, name),
            )
            .with_code("2BP01"));
        }
        self.tables
            .remove(table)
            .ok_or_else(|| DbError::new(statement.clone(), "no such table").with_code("42P01"))?;
        self.foreign_keys.retain(|_, fk| fk.table != table);
        self.log.push(statement);
        Ok(())
    }

    async fn foreign_keys(&mut self, table: &str) -> Result<Vec<ForeignKey>, DbError> {
        let mut keys: Vec<ForeignKey> = self
            .foreign_keys
            .iter()
            .filter(|(_, fk)| fk.table == table || fk.references == table)
            .map(|(name, fk)| ForeignKey {
                name: name.clone(),
                table: fk.table.clone(),
                referenced_table: fk.references.clone(),
                definition: fk.definition(),
            })
            .collect();
        keys.sort_by(|a, b| (&a.table, &a.name).cmp(&(&b.table, &b.name)));
        Ok(keys)
    }

    async fn drop_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError> {
        let statement = format!("DROP CONSTRAINT {}.{}", fk.table, fk.name);
        self.foreign_keys
            .remove(&fk.name)
            .ok_or_else(|| DbError::new(statement.clone(), "no such constraint").with_code("42704"))?;
        self.log.push(statement);
        Ok(())
    }

    async fn add_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError> {
        let statement = format!("ADD CONSTRAINT {}.{}", fk.table, fk.name);
        if self.foreign_keys.contains_key(&fk.name) {
            return Err(DbError::new(statement, "constraint already exists").with_code("42710"));
        }
        let caps = FK_DEFINITION
            .captures(&fk.definition)
            .ok_or_else(|| DbError::new(statement.clone(), "unsupported definition"))?;
        let key = MemForeignKey {
            table: fk.table.clone(),
            column: caps[1].to_string(),
            references: caps[2].to_string(),
            referenced_column: caps[3].to_string(),
        };

        let missing = |what: &str| DbError::new(statement.clone(), format!("{} does not exist", what));
        let source = self.tables.get(&key.table).ok_or_else(|| missing(&key.table))?;
        let target = self.tables.get(&key.references).ok_or_else(|| missing(&key.references))?;
        if target.primary_key != [key.referenced_column.clone()] {
            return Err(DbError::new(
                statement.clone(),
                format!("there is no unique constraint matching given keys for referenced table \"{}\"", key.references),
            )
            .with_code("42830"));
        }
        let src_idx = source.position(&key.column).ok_or_else(|| missing(&key.column))?;
        let tgt_idx = target
            .position(&key.referenced_column)
            .ok_or_else(|| missing(&key.referenced_column))?;

        let known: HashSet<&str> = target.rows.iter().filter_map(|r| r[tgt_idx].as_deref()).collect();
        if let Some(orphan) = source
            .rows
            .iter()
            .filter_map(|r| r[src_idx].as_deref())
            .find(|v| !known.contains(v))
        {
            return Err(DbError::new(
                statement.clone(),
                format!("key ({})=({}) is not present in table \"{}\"", key.column, orphan, key.references),
            )
            .with_code("23503"));
        }

        self.foreign_keys.insert(fk.name.clone(), key);
        self.log.push(statement);
        Ok(())
    }

    async fn drop_columns(&mut self, table: &str, columns: &[String]) -> Result<(), DbError> {
        let statement = format!("DROP COLUMNS {}.{}", table, columns.join(","));
        self.check(FailPoint::DropColumns(table.to_string()), &statement)?;
        let t = self.get_mut(table, &statement)?;
        let mut indexes = Vec::new();
        for c in columns {
            let idx = t
                .position(c)
                .ok_or_else(|| DbError::new(statement.clone(), format!("column \"{}\" does not exist", c)))?;
            indexes.push(idx);
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        for idx in indexes {
            t.columns.remove(idx);
            for row in &mut t.rows {
                row.remove(idx);
            }
        }
        self.log.push(statement);
        Ok(())
    }

    async fn restore_primary_key(
        &mut self,
        table: &str,
        keys: &[String],
        identity: Option<&str>,
    ) -> Result<(), DbError> {
        let statement = format!("PRIMARY KEY {}.{}", table, keys.join(","));
        self.check(FailPoint::RestorePrimaryKey(table.to_string()), &statement)?;
        let t = self.get_mut(table, &statement)?;
        for key in keys {
            let idx = t
                .position(key)
                .ok_or_else(|| DbError::new(statement.clone(), "key column missing"))?;
            t.columns[idx].nullable = false;
        }
        if let Some(column) = identity {
            let idx = t
                .position(column)
                .ok_or_else(|| DbError::new(statement.clone(), "identity column missing"))?;
            let max = t
                .rows
                .iter()
                .filter_map(|r| r[idx].as_deref().and_then(|v| v.parse::<i64>().ok()))
                .max()
                .unwrap_or(0);
            t.columns[idx].is_identity = true;
            t.next_id = max + 1;
        }
        t.primary_key = keys.to_vec();
        self.log.push(statement);
        Ok(())
    }

    async fn backfill_candidates(
        &mut self,
        table: &str,
        key: &str,
        source: &str,
        targets: &[String],
    ) -> Result<Vec<BackfillRow>, DbError> {
        let t = self.get_mut(table, "SELECT candidates")?;
        let key_idx = t.position(key).ok_or_else(|| DbError::new("SELECT candidates", "key missing"))?;
        let src_idx = t
            .position(source)
            .ok_or_else(|| DbError::new("SELECT candidates", "source missing"))?;
        let target_idx: Vec<usize> = targets.iter().filter_map(|c| t.position(c)).collect();

        Ok(t.rows
            .iter()
            .filter(|r| r[src_idx].as_deref().is_some_and(|v| !v.trim().is_empty()))
            .filter(|r| target_idx.iter().all(|&i| r[i].as_deref().unwrap_or("").is_empty()))
            .filter_map(|r| {
                Some(BackfillRow {
                    id: r[key_idx].as_deref()?.parse().ok()?,
                    value: r[src_idx].clone()?,
                })
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
        let statement = format!("UPDATE {} WHERE {} = {}", table, key, id);
        self.check(FailPoint::UpdateRow(id), &statement)?;
        let t = self.get_mut(table, &statement)?;
        let key_idx = t.position(key).ok_or_else(|| DbError::new(statement.clone(), "key missing"))?;
        let positions: Vec<(usize, String)> = values
            .iter()
            .map(|(c, v)| {
                t.position(c)
                    .map(|i| (i, v.clone()))
                    .ok_or_else(|| DbError::new(statement.clone(), format!("column \"{}\" does not exist", c)))
            })
            .collect::<Result<_, _>>()?;

        let mut touched = 0;
        for row in t.rows.iter_mut().filter(|r| r[key_idx].as_deref() == Some(id.to_string().as_str())) {
            for (i, v) in &positions {
                row[*i] = Some(v.clone());
            }
            touched += 1;
        }
        Ok(touched)
    }
}
