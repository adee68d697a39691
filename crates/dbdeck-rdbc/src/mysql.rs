//! MySQL backend implementation for dbdeck-rdbc
//!
//! Provides MySQL-specific implementations:
//! - Connection over `mysql_async`, with optional TLS
//! - Connection factory for pools and test probes
//! - Driver adapter registered under `mysql`
//! - Server/transport error mapping into the normalized taxonomy

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, SslOpts};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::adapter::{probe_connection, DriverAdapter, TestOutcome};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, DriverTimeouts,
};
use crate::error::{io_error_code, normalize, Error, ErrorContext, Result};
use crate::types::{Row, Value};

/// Symbolic name for a MySQL server error number
fn server_error_name(code: u16) -> Option<&'static str> {
    Some(match code {
        1044 => "ER_DBACCESS_DENIED_ERROR",
        1045 => "ER_ACCESS_DENIED_ERROR",
        1049 => "ER_BAD_DB_ERROR",
        1053 => "ER_SERVER_SHUTDOWN",
        1054 => "ER_BAD_FIELD_ERROR",
        1062 => "ER_DUP_ENTRY",
        1064 => "ER_PARSE_ERROR",
        1146 => "ER_NO_SUCH_TABLE",
        1205 => "ER_LOCK_WAIT_TIMEOUT",
        1213 => "ER_LOCK_DEADLOCK",
        1251 => "ER_NOT_SUPPORTED_AUTH_MODE",
        1451 => "ER_ROW_IS_REFERENCED_2",
        1452 => "ER_NO_REFERENCED_ROW_2",
        3024 => "ER_QUERY_TIMEOUT",
        _ => return None,
    })
}

/// Normalize a server-reported error number
pub(crate) fn map_server_error(code: u16, message: &str, ctx: &ErrorContext) -> Error {
    let name = server_error_name(code)
        .map(Cow::Borrowed)
        .unwrap_or_else(|| Cow::Owned(code.to_string()));
    normalize(DatabaseType::MySql, &name, message, ctx)
}

/// Normalize any `mysql_async` failure
pub fn map_error(err: mysql_async::Error, ctx: &ErrorContext) -> Error {
    match err {
        mysql_async::Error::Server(server) => map_server_error(server.code, &server.message, ctx),
        mysql_async::Error::Io(mysql_async::IoError::Io(io)) => {
            let code = io_error_code(io.kind()).unwrap_or("EIO");
            normalize(DatabaseType::MySql, code, &io.to_string(), ctx)
        }
        mysql_async::Error::Io(other) => {
            normalize(DatabaseType::MySql, "HANDSHAKE_SSL_ERROR", &other.to_string(), ctx)
        }
        mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => normalize(
            DatabaseType::MySql,
            "PROTOCOL_CONNECTION_LOST",
            "Connection closed by server",
            ctx,
        ),
        mysql_async::Error::Driver(driver) => {
            normalize(DatabaseType::MySql, "DRIVER_ERROR", &driver.to_string(), ctx)
        }
        other => normalize(DatabaseType::MySql, "UNKNOWN", &other.to_string(), ctx),
    }
}

/// Convert a dbdeck Value to a MySQL compatible parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int(n) => mysql_async::Value::from(*n),
        Value::UInt(n) => mysql_async::Value::from(*n),
        Value::Float(n) => mysql_async::Value::from(*n),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => mysql_async::Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1000,
        ),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

/// Convert a MySQL value to a dbdeck Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int(n),
        mysql_async::Value::UInt(n) => Value::UInt(n),
        mysql_async::Value::Float(f) => Value::Float(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Date(date)
            } else {
                chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                    .map(|time| Value::DateTime(date.and_time(time)))
                    .unwrap_or(Value::Null)
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if !neg && days == 0 {
                if let Some(time) =
                    chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                {
                    return Value::Time(time);
                }
            }
            // TIME columns span -838:59:59..838:59:59
            let hours = days * 24 + hour as u32;
            let sign = if neg { "-" } else { "" };
            Value::String(format!("{sign}{hours:02}:{min:02}:{sec:02}"))
        }
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values: Vec<Value> = (0..row.len())
        .map(|i| mysql_value_to_value(row.get(i).unwrap_or(mysql_async::Value::NULL)))
        .collect();
    Row::new(columns, values)
}

/// MySQL connection implementation
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    ctx: ErrorContext,
}

impl MySqlConnection {
    /// Wrap an established connection
    pub fn new(conn: Conn, ctx: ErrorContext) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            ctx,
        }
    }

    /// Open a connection with prepared options
    pub async fn connect(opts: OptsBuilder, ctx: ErrorContext) -> Result<Self> {
        let conn = Conn::new(opts).await.map_err(|e| map_error(e, &ctx))?;
        debug!(host = %ctx.host, port = ctx.port, "MySQL connection established");
        Ok(Self::new(conn, ctx))
    }

    fn closed(&self) -> Error {
        Error::connection_lost("connection already closed")
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.closed())?;

        let result: Vec<mysql_async::Row> = if params.is_empty() {
            conn.query::<mysql_async::Row, _>(sql).await
        } else {
            let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
            conn.exec::<mysql_async::Row, _, _>(sql, mysql_params).await
        }
        .map_err(|e| map_error(e, &self.ctx))?;

        Ok(result.into_iter().map(convert_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.closed())?;

        if params.is_empty() {
            conn.query_drop(sql).await
        } else {
            let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
            conn.exec_drop(sql, mysql_params).await
        }
        .map_err(|e| map_error(e, &self.ctx))?;

        Ok(conn.affected_rows())
    }

    async fn server_version(&self) -> Result<String> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.closed())?;

        conn.query_first::<String, _>("SELECT version() AS version")
            .await
            .map_err(|e| map_error(e, &self.ctx))?
            .ok_or_else(|| Error::internal("server returned no version row"))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.disconnect().await.map_err(|e| map_error(e, &self.ctx))?;
        }
        Ok(())
    }
}

/// MySQL connection factory
pub struct MySqlConnectionFactory {
    opts: OptsBuilder,
    ctx: ErrorContext,
}

impl MySqlConnectionFactory {
    /// Create a new MySQL connection factory
    pub fn new(config: &ConnectionConfig) -> Self {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(config.host())
            .tcp_port(config.port())
            .user(config.user.clone())
            .pass(
                config
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_string()),
            )
            .db_name(config.database.clone())
            .enable_cleartext_plugin(config.auth_plugin.is_some());

        if let Some(tls) = config.tls() {
            let ssl = SslOpts::default().with_danger_accept_invalid_certs(!tls.reject_unauthorized);
            opts = opts.ssl_opts(Some(ssl));
        }

        Self {
            opts,
            ctx: config.error_context(),
        }
    }

    /// Allow `mysql_clear_password` regardless of the configuration
    pub fn with_cleartext_plugin(mut self) -> Self {
        self.opts = self.opts.enable_cleartext_plugin(true);
        self
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = MySqlConnection::connect(self.opts.clone(), self.ctx.clone()).await?;
        Ok(Box::new(conn))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }
}

/// Adapter registered under `mysql`
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

#[async_trait]
impl DriverAdapter for MySqlAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    fn connection_factory(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionFactory>> {
        Ok(Arc::new(MySqlConnectionFactory::new(config)))
    }

    // servers that demand cleartext auth can still be tested without `authPlugin`
    async fn test_connection(
        &self,
        config: &ConnectionConfig,
        timeouts: &DriverTimeouts,
    ) -> TestOutcome {
        let factory = MySqlConnectionFactory::new(config).with_cleartext_plugin();
        probe_connection(&factory, timeouts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn ctx() -> ErrorContext {
        ErrorContext::new("localhost", 3306, "test")
    }

    fn cleartext(factory: &MySqlConnectionFactory) -> bool {
        mysql_async::Opts::from(factory.opts.clone()).enable_cleartext_plugin()
    }

    #[test]
    fn test_cleartext_plugin_follows_auth_plugin() {
        let config = ConnectionConfig::new("mysql").with_credentials("app", "secret");
        assert!(!cleartext(&MySqlConnectionFactory::new(&config)));

        let config = config.with_auth_plugin("mysql_clear_password");
        assert!(cleartext(&MySqlConnectionFactory::new(&config)));
    }

    #[test]
    fn test_test_connection_allows_cleartext() {
        let config = ConnectionConfig::new("mysql");
        let factory = MySqlConnectionFactory::new(&config).with_cleartext_plugin();
        assert!(cleartext(&factory));
    }

    #[test]
    fn test_server_error_mapping() {
        let err = map_server_error(1045, "Access denied for user 'root'@'localhost'", &ctx());
        assert_eq!(err.category(), ErrorCategory::AuthenticationFailed);
        assert_eq!(err.code(), Some("ER_ACCESS_DENIED_ERROR"));

        let err = map_server_error(1049, "Unknown database 'test'", &ctx());
        assert_eq!(err.to_string(), "Database not found: test");

        assert_eq!(
            map_server_error(1064, "You have an error", &ctx()).category(),
            ErrorCategory::SyntaxError
        );
        assert_eq!(
            map_server_error(1146, "Table 'test.t' doesn't exist", &ctx()).category(),
            ErrorCategory::ObjectNotFound
        );
        assert_eq!(
            map_server_error(1062, "Duplicate entry '1'", &ctx()).category(),
            ErrorCategory::ConstraintViolation
        );
    }

    #[test]
    fn test_unnamed_server_error_keeps_number() {
        let err = map_server_error(9999, "something odd", &ctx());
        assert_eq!(err.to_string(), "MySQL Error [9999]: something odd");
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = map_error(mysql_async::Error::Io(mysql_async::IoError::Io(io)), &ctx());
        assert_eq!(err.to_string(), "Connection refused: localhost:3306");
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Bytes(b"hello".to_vec())),
            Value::String("hello".into())
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Bytes(vec![0xff])),
            Value::Bytes(vec![0xff])
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Date(2024, 5, 17, 0, 0, 0, 0)),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 5, 17).unwrap())
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Time(true, 1, 2, 3, 4, 0)),
            Value::String("-26:03:04".into())
        );
        assert_eq!(value_to_sql(&Value::Int(5)), mysql_async::Value::Int(5));
        assert_eq!(value_to_sql(&Value::Null), mysql_async::Value::NULL);
    }
}
