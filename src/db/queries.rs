//! SQL query constants and builders
//!
//! Contains all SQL issued by the PostgreSQL backend.

use crate::db::ColumnSpec;
use once_cell::sync::Lazy;
use regex::Regex;

/// Does a base table exist in the schema
pub const TABLE_EXISTS: &str = r#"
    SELECT EXISTS(
        SELECT 1
        FROM information_schema.tables
        WHERE table_schema = $1
            AND table_name = $2
            AND table_type = 'BASE TABLE'
    )
"#;

/// Does a column exist on a table
pub const COLUMN_EXISTS: &str = r#"
    SELECT EXISTS(
        SELECT 1
        FROM information_schema.columns
        WHERE table_schema = $1
            AND table_name = $2
            AND column_name = $3
    )
"#;

/// Get column information for a table
pub const GET_COLUMNS: &str = r#"
    SELECT
        c.column_name::text AS column_name,
        c.data_type::text AS data_type,
        c.is_nullable = 'YES' AS nullable,
        c.column_default::text AS column_default,
        c.is_identity = 'YES' AS is_identity
    FROM information_schema.columns c
    WHERE c.table_schema = $1
        AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// List base tables whose name starts with a prefix. `LIKE` is avoided
/// because `_` in table names is a wildcard there.
pub const TABLES_WITH_PREFIX: &str = r#"
    SELECT table_name::text AS table_name
    FROM information_schema.tables
    WHERE table_schema = $1
        AND table_type = 'BASE TABLE'
        AND left(table_name, length($2)) = $2
    ORDER BY table_name
"#;

/// Get primary keys for a table
pub const GET_PRIMARY_KEYS: &str = r#"
    SELECT kcu.column_name::text AS column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
        AND tc.table_schema = $1
        AND tc.table_name = $2
    ORDER BY kcu.ordinal_position
"#;

/// Foreign keys declared on a table or pointing at it, within one schema
pub const GET_FOREIGN_KEYS: &str = r#"
    SELECT
        c.conname::text AS constraint_name,
        src.relname::text AS table_name,
        tgt.relname::text AS referenced_table,
        pg_get_constraintdef(c.oid) AS definition
    FROM pg_constraint c
    JOIN pg_class src ON src.oid = c.conrelid
    JOIN pg_class tgt ON tgt.oid = c.confrelid
    JOIN pg_namespace ns ON ns.oid = src.relnamespace
    JOIN pg_namespace nt ON nt.oid = tgt.relnamespace
    WHERE c.contype = 'f'
        AND ns.nspname = $1
        AND nt.nspname = $1
        AND (src.relname = $2 OR tgt.relname = $2)
    ORDER BY src.relname, c.conname
"#;

/// Foreign-key triggers are skipped while the session acts as a replica.
pub const DISABLE_CONSTRAINT_CHECKS: &str = "SET session_replication_role = replica";
pub const ENABLE_CONSTRAINT_CHECKS: &str = "SET session_replication_role = DEFAULT";

pub const BEGIN: &str = "BEGIN";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid"));

/// Plain, unquoted-safe identifier: letter or underscore first, at most 63 bytes.
pub fn is_valid_identifier(ident: &str) -> bool {
    IDENTIFIER.is_match(ident)
}

/// SQL builder for safe identifier quoting
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (table/column name) safely
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Schema-qualified, quoted table name
    pub fn qualified(schema: &str, table: &str) -> String {
        format!("{}.{}", Self::quote_ident(schema), Self::quote_ident(table))
    }

    pub fn add_column(schema: &str, table: &str, column: &ColumnSpec) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            Self::qualified(schema, table),
            Self::quote_ident(&column.name),
            column.data_type
        );

        if !column.nullable {
            sql.push_str(" NOT NULL");
        }

        if let Some(ref default) = column.default_value {
            sql.push_str(&format!(" DEFAULT {}", default));
        }

        sql
    }

    pub fn rename_table(schema: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            Self::qualified(schema, from),
            Self::quote_ident(to)
        )
    }

    pub fn copy_table(schema: &str, source: &str, target: &str) -> String {
        format!(
            "CREATE TABLE {} AS TABLE {}",
            Self::qualified(schema, target),
            Self::qualified(schema, source)
        )
    }

    pub fn drop_table(schema: &str, table: &str) -> String {
        format!("DROP TABLE {}", Self::qualified(schema, table))
    }

    pub fn drop_constraint(schema: &str, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            Self::qualified(schema, table),
            Self::quote_ident(name)
        )
    }

    /// `definition` comes verbatim from `pg_get_constraintdef`.
    pub fn add_constraint(schema: &str, table: &str, name: &str, definition: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            Self::qualified(schema, table),
            Self::quote_ident(name),
            definition
        )
    }

    /// One statement for the whole set, so either all columns go or none do.
    pub fn drop_columns(schema: &str, table: &str, columns: &[String]) -> String {
        let drops: Vec<String> = columns
            .iter()
            .map(|c| format!("DROP COLUMN {}", Self::quote_ident(c)))
            .collect();
        format!("ALTER TABLE {} {}", Self::qualified(schema, table), drops.join(", "))
    }

    pub fn row_count(schema: &str, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", Self::qualified(schema, table))
    }

    pub fn add_primary_key(schema: &str, table: &str, keys: &[String]) -> String {
        let keys: Vec<String> = keys.iter().map(|k| Self::quote_ident(k)).collect();
        format!(
            "ALTER TABLE {} ADD PRIMARY KEY ({})",
            Self::qualified(schema, table),
            keys.join(", ")
        )
    }

    pub fn add_identity(schema: &str, table: &str, key: &str) -> String {
        format!(
            "ALTER TABLE {} ALTER COLUMN {} ADD GENERATED BY DEFAULT AS IDENTITY",
            Self::qualified(schema, table),
            Self::quote_ident(key)
        )
    }

    /// Move the identity sequence past the highest restored key.
    pub fn sync_identity(schema: &str, table: &str, key: &str) -> String {
        format!(
            "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE(MAX({}), 0) + 1, false) FROM {}",
            Self::qualified(schema, table).replace('\'', "''"),
            key.replace('\'', "''"),
            Self::quote_ident(key),
            Self::qualified(schema, table)
        )
    }

    pub fn backfill_candidates(
        schema: &str,
        table: &str,
        key: &str,
        source: &str,
        targets: &[String],
    ) -> String {
        let source = Self::quote_ident(source);
        let mut sql = format!(
            "SELECT {}::bigint, {}::text FROM {} WHERE {} IS NOT NULL AND TRIM({}::text) <> ''",
            Self::quote_ident(key),
            source,
            Self::qualified(schema, table),
            source,
            source
        );
        for target in targets {
            sql.push_str(&format!(
                " AND COALESCE({}::text, '') = ''",
                Self::quote_ident(target)
            ));
        }
        sql.push_str(&format!(" ORDER BY {}", Self::quote_ident(key)));
        sql
    }

    /// `UPDATE` with `$1..$n` for the values and `$n+1` for the key.
    pub fn update_row(schema: &str, table: &str, key: &str, columns: &[&str]) -> String {
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", Self::quote_ident(c), i + 1))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}::bigint = ${}",
            Self::qualified(schema, table),
            assignments.join(", "),
            Self::quote_ident(key),
            columns.len() + 1
        )
    }
}
