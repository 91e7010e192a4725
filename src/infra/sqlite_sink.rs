use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::app::ports::{InsertResult, Sink, SinkRow};
use crate::constants::{self, SINK_COLUMNS};
use crate::error::SinkError;

/// Local sink backed by a SQLite file. Each batch is one transaction.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SinkError::Unreachable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| SinkError::Unreachable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory().map_err(|e| SinkError::Unreachable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SinkError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| SinkError::Io("sqlite connection poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| SinkError::Io(e.to_string()))?
    }
}

fn check_table_name(table: &str) -> Result<(), SinkError> {
    if !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SinkError::Rejected(format!("invalid table name '{}'", table)))
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), SinkError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {city} TEXT,
            {time} TEXT,
            {pm10} REAL,
            {pm2_5} REAL,
            {co} REAL,
            {no2} REAL,
            {so2} REAL,
            {o3} REAL,
            {uv} REAL,
            {aqi} TEXT,
            {score} REAL,
            {risk} TEXT,
            {hour} INTEGER
        )",
        table = table,
        city = constants::COL_CITY,
        time = constants::COL_TIME,
        pm10 = constants::COL_PM10,
        pm2_5 = constants::COL_PM2_5,
        co = constants::COL_CO,
        no2 = constants::COL_NO2,
        so2 = constants::COL_SO2,
        o3 = constants::COL_O3,
        uv = constants::COL_UV_INDEX,
        aqi = constants::COL_AQI_CATEGORY,
        score = constants::COL_SEVERITY_SCORE,
        risk = constants::COL_RISK_FLAG,
        hour = constants::COL_HOUR,
    );
    conn.execute(&sql, []).map_err(|e| SinkError::Io(e.to_string()))?;
    Ok(())
}

fn to_sql_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn ping(&self) -> Result<(), SinkError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .map_err(|e| SinkError::Unreachable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, table: &str, rows: &[SinkRow]) -> Result<InsertResult, SinkError> {
        if let Err(e) = check_table_name(table) {
            return Ok(InsertResult::failed(0, e));
        }
        if let Some(col) = rows
            .iter()
            .flat_map(|r| r.keys())
            .find(|k| !SINK_COLUMNS.contains(&k.as_str()))
        {
            return Ok(InsertResult::failed(
                0,
                SinkError::Rejected(format!("column '{}' does not exist in {}", col, table)),
            ));
        }

        let table = table.to_string();
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            ensure_table(conn, &table)?;
            let placeholders: Vec<String> = (1..=SINK_COLUMNS.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                SINK_COLUMNS.join(", "),
                placeholders.join(", ")
            );

            let tx = conn.transaction().map_err(|e| SinkError::Io(e.to_string()))?;
            {
                let mut stmt = tx.prepare_cached(&sql).map_err(|e| SinkError::Io(e.to_string()))?;
                for row in &rows {
                    let values: Vec<SqlValue> = SINK_COLUMNS
                        .iter()
                        .map(|col| row.get(*col).map_or(SqlValue::Null, to_sql_value))
                        .collect();
                    stmt.execute(rusqlite::params_from_iter(values.iter()))
                        .map_err(|e| SinkError::Io(e.to_string()))?;
                }
            }
            tx.commit().map_err(|e| SinkError::Io(e.to_string()))?;
            debug!(table = %table, rows = rows.len(), "sqlite insert committed");
            Ok(InsertResult::ok(rows.len()))
        })
        .await
    }

    async fn count(&self, table: &str) -> Result<usize, SinkError> {
        check_table_name(table)?;
        let table = table.to_string();
        self.with_conn(move |conn| {
            ensure_table(conn, &table)?;
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .map_err(|e| SinkError::Io(e.to_string()))?;
            Ok(n.max(0) as usize)
        })
        .await
    }
}
