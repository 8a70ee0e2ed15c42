//! MySQL-protocol row source.
//!
//! Works against MySQL, TiDB and Vitess vtgate. All reads are prepared
//! statements over a shared `mysql_async` pool, so values arrive typed and
//! are decoded without going through their text form.

use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Column, Conn, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Value};
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::core::{Key, PkValue, Row, RowSource, SqlValue, Table};
use crate::error::{Result, VerifyError};

/// Character set id MySQL reports for binary columns.
const BINARY_CHARSET: u16 = 63;

/// Row source backed by a MySQL connection pool.
pub struct MysqlSource {
    name: String,
    pool: Pool,
}

impl MysqlSource {
    /// Create a pool from configuration and test one connection.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let max_conns = config.get_max_connections();
        let constraints = PoolConstraints::new(0, max_conns).ok_or_else(|| {
            VerifyError::Config(format!("invalid max_connections {}", max_conns))
        })?;

        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let source = Self {
            name: config.database.clone(),
            pool: Pool::new(opts),
        };
        source.ping().await?;

        info!(
            "Connected to MySQL: {}:{}/{} (max {} connections)",
            config.host, config.port, config.database, max_conns
        );
        Ok(source)
    }

    async fn conn(&self, context: &str) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| VerifyError::mysql(&self.name, context, e))
    }

    async fn exec_rows(
        &self,
        context: &str,
        sql: String,
        params: Vec<Value>,
    ) -> Result<Vec<mysql_async::Row>> {
        debug!("{}: {}", self.name, sql);
        let mut conn = self.conn(context).await?;
        conn.exec(sql, to_params(params))
            .await
            .map_err(|e| VerifyError::mysql(&self.name, context, e))
    }

    fn decode_key(&self, table: &Table, values: Vec<SqlValue>) -> Result<Key> {
        values
            .into_iter()
            .map(|v| {
                PkValue::from_sql_value(v).ok_or_else(|| {
                    VerifyError::query(
                        &self.name,
                        format!("decode key of {}", table.name),
                        "primary key column holds a value that cannot be ordered",
                        false,
                    )
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Key::new)
    }
}

#[async_trait]
impl RowSource for MysqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn("ping").await?;
        conn.ping()
            .await
            .map_err(|e| VerifyError::mysql(&self.name, "ping", e))
    }

    async fn key_at_offset(
        &self,
        table: &Table,
        from: Option<&Key>,
        offset: usize,
    ) -> Result<Option<Key>> {
        let sql = probe_query(table, from.is_some(), offset);
        let params = from.map(key_params).unwrap_or_default();
        let context = format!("key probe {}", table.name);
        let rows = self.exec_rows(&context, sql, params).await?;

        match rows.into_iter().next() {
            Some(row) => {
                let values = decode_row(row);
                Ok(Some(self.decode_key(table, values)?))
            }
            None => Ok(None),
        }
    }

    async fn read_range(
        &self,
        table: &Table,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> Result<Vec<Row>> {
        let sql = range_query(table, start.is_some(), end.is_some());
        let mut params = start.map(key_params).unwrap_or_default();
        params.extend(end.map(key_params).unwrap_or_default());
        let context = format!("read {}", table.name);
        let rows = self.exec_rows(&context, sql, params).await?;

        let key_len = table.key_columns.len();
        rows.into_iter()
            .map(|row| {
                let mut values = decode_row(row);
                let data = values.split_off(key_len.min(values.len()));
                Ok(Row::new(self.decode_key(table, values)?, data))
            })
            .collect()
    }

    async fn columns(&self, table: &Table) -> Result<Vec<String>> {
        let context = format!("columns of {}", table.name);
        let mut conn = self.conn(&context).await?;
        let names: Vec<String> = conn
            .exec(columns_query(), (table.name.clone(),))
            .await
            .map_err(|e| VerifyError::mysql(&self.name, &context, e))?;
        Ok(names
            .into_iter()
            .filter(|name| !table.key_columns.contains(name))
            .collect())
    }

    async fn estimate_rows(&self, table: &Table) -> Result<u64> {
        let context = format!("estimate {}", table.name);
        let mut conn = self.conn(&context).await?;
        let rows: Option<Option<u64>> = conn
            .exec_first(
                "SELECT table_rows FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                (table.name.clone(),),
            )
            .await
            .map_err(|e| VerifyError::mysql(&self.name, &context, e))?;
        Ok(rows.flatten().unwrap_or(0))
    }

    async fn list_tables(&self) -> Result<Vec<Table>> {
        let mut conn = self.conn("list tables").await?;
        let names: Vec<String> = conn
            .query("SHOW TABLES")
            .await
            .map_err(|e| VerifyError::mysql(&self.name, "list tables", e))?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let context = format!("primary key of {}", name);
            let keys: Vec<mysql_async::Row> = conn
                .query(format!(
                    "SHOW KEYS FROM {} WHERE Key_name = 'PRIMARY'",
                    quote_ident(&name)
                ))
                .await
                .map_err(|e| VerifyError::mysql(&self.name, &context, e))?;

            let mut columns: Vec<(u64, String)> = keys
                .iter()
                .filter_map(|row| {
                    let seq = row.get_opt::<u64, _>("Seq_in_index")?.ok()?;
                    let column = row.get_opt::<String, _>("Column_name")?.ok()?;
                    Some((seq, column))
                })
                .collect();
            if columns.is_empty() {
                warn!("{}: table {} has no primary key, skipping", self.name, name);
                continue;
            }
            columns.sort();

            tables.push(Table::new(name).with_key_columns(columns.into_iter().map(|(_, c)| c)));
        }
        Ok(tables)
    }
}

/// Quote an identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn key_columns(table: &Table) -> String {
    table
        .key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Key columns as a comparable expression: `k` or `(k1, k2)`.
fn key_tuple(table: &Table) -> String {
    if table.has_single_key() {
        key_columns(table)
    } else {
        format!("({})", key_columns(table))
    }
}

fn key_placeholders(table: &Table) -> String {
    if table.has_single_key() {
        "?".to_string()
    } else {
        format!("({})", vec!["?"; table.key_columns.len()].join(", "))
    }
}

/// Probe for the key `offset` rows past the (optional) lower bound.
pub fn probe_query(table: &Table, has_from: bool, offset: usize) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        key_columns(table),
        quote_ident(&table.name)
    );
    if has_from {
        sql.push_str(&format!(
            " WHERE {} >= {}",
            key_tuple(table),
            key_placeholders(table)
        ));
    }
    sql.push_str(&format!(
        " ORDER BY {} LIMIT 1 OFFSET {}",
        key_columns(table),
        offset
    ));
    sql
}

/// Column names of one table in the current schema, in definition order.
pub fn columns_query() -> &'static str {
    // CAST to CHAR to sidestep information_schema collation differences
    "SELECT CAST(COLUMN_NAME AS CHAR(255)) FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION"
}

/// Select key columns followed by data columns for a half-open key range.
///
/// Without configured columns this falls back to `t.*`, whose order is the
/// table's physical layout; callers resolve [`Table::columns`] first.
pub fn range_query(table: &Table, has_start: bool, has_end: bool) -> String {
    let data = if table.columns.is_empty() {
        format!("{}.*", quote_ident(&table.name))
    } else {
        table
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut sql = format!(
        "SELECT {}, {} FROM {}",
        key_columns(table),
        data,
        quote_ident(&table.name)
    );

    let mut predicates = Vec::new();
    if has_start {
        predicates.push(format!("{} >= {}", key_tuple(table), key_placeholders(table)));
    }
    if has_end {
        predicates.push(format!("{} < {}", key_tuple(table), key_placeholders(table)));
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {}", key_columns(table)));
    sql
}

fn key_params(key: &Key) -> Vec<Value> {
    key.values()
        .iter()
        .map(|v| match v {
            PkValue::Int(v) => Value::Int(*v),
            PkValue::UInt(v) => Value::UInt(*v),
            PkValue::Text(v) => Value::Bytes(v.as_bytes().to_vec()),
            PkValue::Bytes(v) => Value::Bytes(v.clone()),
        })
        .collect()
}

fn to_params(values: Vec<Value>) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values)
    }
}

fn decode_row(mut row: mysql_async::Row) -> Vec<SqlValue> {
    let columns = row.columns();
    (0..row.len())
        .map(|i| {
            let value = row.take::<Value, usize>(i).unwrap_or(Value::NULL);
            to_sql_value(value, &columns[i])
        })
        .collect()
}

/// Convert a binary-protocol value using its column metadata.
fn to_sql_value(value: Value, column: &Column) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(v) => SqlValue::Int(v),
        Value::UInt(v) => SqlValue::UInt(v),
        Value::Float(v) => SqlValue::Float(f64::from(v)),
        Value::Double(v) => SqlValue::Float(v),
        Value::Bytes(bytes) => {
            if column.character_set() == BINARY_CHARSET && !is_textual(column.column_type()) {
                SqlValue::Bytes(bytes)
            } else {
                match String::from_utf8(bytes) {
                    Ok(s) => SqlValue::Text(s),
                    Err(e) => SqlValue::Bytes(e.into_bytes()),
                }
            }
        }
        Value::Date(y, m, d, h, mi, s, us) => {
            let date = NaiveDate::from_ymd_opt(i32::from(y), u32::from(m), u32::from(d));
            let datetime = date.and_then(|date| {
                date.and_hms_micro_opt(u32::from(h), u32::from(mi), u32::from(s), us)
            });
            match (column.column_type(), date, datetime) {
                (ColumnType::MYSQL_TYPE_DATE, Some(date), _) => SqlValue::Date(date),
                (_, _, Some(datetime)) => SqlValue::DateTime(datetime),
                // Zero dates have no chrono representation
                _ => SqlValue::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    y, m, d, h, mi, s, us
                )),
            }
        }
        Value::Time(negative, days, h, m, s, us) => {
            let hours = i64::from(days) * 24 + i64::from(h);
            let secs = hours * 3600 + i64::from(m) * 60 + i64::from(s);
            let micros = secs * 1_000_000 + i64::from(us);
            SqlValue::Time(if negative { -micros } else { micros })
        }
    }
}

/// Column types reported with the binary charset that still hold text.
fn is_textual(column_type: ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_JSON
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("customers"), "`customers`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_probe_query_single_key() {
        let table = Table::new("customers");
        assert_eq!(
            probe_query(&table, false, 5),
            "SELECT `id` FROM `customers` ORDER BY `id` LIMIT 1 OFFSET 5"
        );
        assert_eq!(
            probe_query(&table, true, 5),
            "SELECT `id` FROM `customers` WHERE `id` >= ? ORDER BY `id` LIMIT 1 OFFSET 5"
        );
    }

    #[test]
    fn test_range_query_composite_key() {
        let table = Table::new("items").with_key_columns(["order_id", "line"]);
        assert_eq!(
            range_query(&table, true, true),
            "SELECT `order_id`, `line`, `items`.* FROM `items` \
             WHERE (`order_id`, `line`) >= (?, ?) AND (`order_id`, `line`) < (?, ?) \
             ORDER BY `order_id`, `line`"
        );
    }

    #[test]
    fn test_range_query_unbounded_with_columns() {
        let table = Table::new("customers").with_columns(["name", "email"]);
        assert_eq!(
            range_query(&table, false, false),
            "SELECT `id`, `name`, `email` FROM `customers` ORDER BY `id`"
        );
        assert_eq!(
            range_query(&table, false, true),
            "SELECT `id`, `name`, `email` FROM `customers` WHERE `id` < ? ORDER BY `id`"
        );
    }

    #[test]
    fn test_columns_query_orders_by_position() {
        let sql = columns_query();
        assert!(sql.contains("TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"));
        assert!(sql.ends_with("ORDER BY ORDINAL_POSITION"));
    }

    #[test]
    fn test_key_params() {
        let key = Key::new(vec![PkValue::Int(-3), PkValue::Text("a".into())]);
        assert_eq!(
            key_params(&key),
            vec![Value::Int(-3), Value::Bytes(b"a".to_vec())]
        );
    }

    /// Runs against a live server: RESHARD_VERIFY_MYSQL_HOST, _PORT, _USER,
    /// _PASSWORD and _DATABASE. The database must contain a `customers`
    /// table keyed on `id`.
    #[tokio::test]
    #[ignore]
    async fn test_live_probe_and_read() {
        let env = |k: &str| std::env::var(format!("RESHARD_VERIFY_MYSQL_{}", k)).ok();
        let mut config = DbConfig::mysql(
            env("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            env("PORT").and_then(|p| p.parse().ok()).unwrap_or(3306),
            env("DATABASE").unwrap_or_else(|| "customer".into()),
        );
        config.user = env("USER").unwrap_or_else(|| "root".into());
        config.password = env("PASSWORD").unwrap_or_default();

        let source = MysqlSource::connect(&config).await.unwrap();
        let table = Table::new("customers");
        let first = source.key_at_offset(&table, None, 0).await.unwrap();
        let rows = source.read_range(&table, first.as_ref(), None).await.unwrap();
        assert!(rows.windows(2).all(|w| w[0].key < w[1].key));
    }
}
