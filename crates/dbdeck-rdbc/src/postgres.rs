//! PostgreSQL backend implementation for dbdeck-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection over `tokio-postgres`, plain or rustls TLS
//! - Parameter binding driven by the server-inferred statement types
//! - Connection factory and driver adapter registered under `postgres`
//! - SQLSTATE and transport error mapping into the normalized taxonomy

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error};

use crate::adapter::DriverAdapter;
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{io_error_code, normalize, Error, ErrorContext, Result};
use crate::tls;
use crate::types::{Row, Value};

/// Normalize any `tokio-postgres` failure
pub fn map_error(err: &tokio_postgres::Error, ctx: &ErrorContext) -> Error {
    if let Some(db) = err.as_db_error() {
        return normalize(DatabaseType::Postgres, db.code().code(), db.message(), ctx);
    }
    let io = std::error::Error::source(err).and_then(|s| s.downcast_ref::<std::io::Error>());
    if let Some(io) = io {
        let code = io_error_code(io.kind()).unwrap_or("EIO");
        return normalize(DatabaseType::Postgres, code, &io.to_string(), ctx);
    }
    if err.is_closed() {
        // connection_does_not_exist
        return normalize(DatabaseType::Postgres, "08003", &err.to_string(), ctx);
    }
    normalize(DatabaseType::Postgres, "UNKNOWN", &err.to_string(), ctx)
}

/// Typed SQL NULL accepted for any parameter type
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert a dbdeck Value to a parameter of the type the server expects
fn value_to_sql(value: &Value, ty: &Type) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(SqlNull),
        Value::Bool(b) => Box::new(*b),
        Value::Int(n) => int_to_sql(*n, ty),
        Value::UInt(n) => match i64::try_from(*n) {
            Ok(n) => int_to_sql(n, ty),
            Err(_) => Box::new(n.to_string()),
        },
        Value::Float(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            _ => Box::new(*f),
        },
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => match *ty {
            Type::TIMESTAMPTZ => Box::new(dt.and_utc()),
            _ => Box::new(*dt),
        },
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn int_to_sql(n: i64, ty: &Type) -> Box<dyn ToSql + Sync + Send> {
    match *ty {
        Type::INT2 => match i16::try_from(n) {
            Ok(v) => Box::new(v),
            Err(_) => Box::new(n),
        },
        Type::INT4 => match i32::try_from(n) {
            Ok(v) => Box::new(v),
            Err(_) => Box::new(n),
        },
        Type::OID => match u32::try_from(n) {
            Ok(v) => Box::new(v),
            Err(_) => Box::new(n),
        },
        Type::FLOAT4 => Box::new(n as f32),
        Type::FLOAT8 => Box::new(n as f64),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => Box::new(n.to_string()),
        _ => Box::new(n),
    }
}

/// Read column `idx` as `T`, mapping NULL and decode failures to `None`
fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL value to a dbdeck Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|n| Value::Int(n.into())),
        Type::INT4 => get::<i32>(row, idx).map(|n| Value::Int(n.into())),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int),
        Type::OID => get::<u32>(row, idx).map(|n| Value::UInt(n.into())),
        Type::FLOAT4 => get::<f32>(row, idx).map(|f| Value::Float(f.into())),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float),
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(Value::Bytes),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(Value::Date),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(Value::Time),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|dt| Value::DateTime(dt.naive_utc())),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::Json),
        // text-like and anything else with a text decoding
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns = pg_row.columns();
    let names: Vec<String> = columns.iter().map(|c| c.name().to_string()).collect();
    let values: Vec<Value> = columns
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();
    Row::new(names, values)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    /// `None` once closed; dropping the client ends the connection task
    client: RwLock<Option<Client>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    ctx: ErrorContext,
}

impl PgConnection {
    /// Wrap a client and the task driving its socket
    pub fn new(client: Client, task: JoinHandle<()>, ctx: ErrorContext) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            ctx,
        }
    }

    fn closed_error(&self) -> Error {
        Error::connection_lost("connection already closed")
    }

    /// Prepare `sql` and bind `params` to the inferred parameter types
    async fn bind(
        &self,
        client: &Client,
        sql: &str,
        params: &[Value],
    ) -> Result<(tokio_postgres::Statement, Vec<Box<dyn ToSql + Sync + Send>>)> {
        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| map_error(&e, &self.ctx))?;

        let types = stmt.params();
        if types.len() != params.len() {
            return Err(Error::Unknown {
                driver: DatabaseType::Postgres.display_name().to_string(),
                code: "08P01".to_string(),
                message: format!(
                    "statement expects {} parameters but {} were supplied",
                    types.len(),
                    params.len()
                ),
            });
        }

        let boxed = params
            .iter()
            .zip(types)
            .map(|(value, ty)| value_to_sql(value, ty))
            .collect();
        Ok((stmt, boxed))
    }
}

fn param_refs(boxed: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let (stmt, boxed) = self.bind(client, sql, params).await?;
        let pg_rows = client
            .query(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_error(&e, &self.ctx))?;

        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let (stmt, boxed) = self.bind(client, sql, params).await?;
        client
            .execute(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_error(&e, &self.ctx))
    }

    async fn server_version(&self) -> Result<String> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| self.closed_error())?;

        let row = client
            .query_one("SELECT version() AS version", &[])
            .await
            .map_err(|e| map_error(&e, &self.ctx))?;
        row.try_get::<_, String>(0)
            .map_err(|e| map_error(&e, &self.ctx))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.client.read().await.as_ref() {
            Some(client) if !client.is_closed() => client.simple_query("SELECT 1").await.is_ok(),
            _ => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the client sends Terminate and lets the task finish
        drop(self.client.write().await.take());
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| Error::internal(format!("connection task failed: {}", e)))?;
        }
        Ok(())
    }
}

/// PostgreSQL connection factory
pub struct PgConnectionFactory {
    config: tokio_postgres::Config,
    tls: Option<MakeRustlsConnect>,
    ctx: ErrorContext,
}

impl PgConnectionFactory {
    /// Create a factory from a profile
    pub fn new(config: &ConnectionConfig) -> Self {
        let mut pg = tokio_postgres::Config::new();
        pg.host(config.host())
            .port(config.port())
            .application_name("dbdeck");
        if let Some(user) = &config.user {
            pg.user(user.as_str());
        }
        if let Some(password) = &config.password {
            pg.password(password.expose_secret());
        }
        if let Some(database) = &config.database {
            pg.dbname(database.as_str());
        }

        let tls = config.tls().map(|policy| {
            pg.ssl_mode(SslMode::Require);
            MakeRustlsConnect::new(tls::client_config(policy))
        });

        Self {
            config: pg,
            tls,
            ctx: config.error_context(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (client, task) = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .config
                    .connect(tls.clone())
                    .await
                    .map_err(|e| map_error(&e, &self.ctx))?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("PostgreSQL connection error: {}", e);
                    }
                });
                (client, task)
            }
            None => {
                let (client, connection) = self
                    .config
                    .connect(NoTls)
                    .await
                    .map_err(|e| map_error(&e, &self.ctx))?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("PostgreSQL connection error: {}", e);
                    }
                });
                (client, task)
            }
        };

        debug!(
            host = %self.ctx.host,
            port = self.ctx.port,
            tls = self.tls.is_some(),
            "PostgreSQL connection established"
        );
        Ok(Box::new(PgConnection::new(client, task, self.ctx.clone())))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }
}

/// Adapter registered under `postgres`
#[derive(Debug, Clone, Copy, Default)]
pub struct PgAdapter;

#[async_trait]
impl DriverAdapter for PgAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn connection_factory(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionFactory>> {
        Ok(Arc::new(PgConnectionFactory::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_binding_follows_server_type() {
        // Each conversion must be accepted by the target type
        for ty in [Type::INT2, Type::INT4, Type::INT8, Type::FLOAT8, Type::TEXT] {
            let param = int_to_sql(42, &ty);
            let mut buf = BytesMut::new();
            assert!(param.to_sql_checked(&ty, &mut buf).is_ok(), "{:?}", ty);
        }
    }

    #[test]
    fn test_null_binds_to_any_type() {
        for ty in [Type::INT4, Type::TEXT, Type::JSONB, Type::TIMESTAMPTZ] {
            let param = value_to_sql(&Value::Null, &ty);
            let mut buf = BytesMut::new();
            assert!(matches!(
                param.to_sql_checked(&ty, &mut buf),
                Ok(IsNull::Yes)
            ));
        }
    }

    #[test]
    fn test_factory_applies_profile() {
        let config = ConnectionConfig::new("postgres")
            .with_host("pg.internal")
            .with_credentials("app", "pw")
            .with_database("orders");
        let factory = PgConnectionFactory::new(&config);

        assert_eq!(factory.config.get_user(), Some("app"));
        assert_eq!(factory.config.get_dbname(), Some("orders"));
        assert_eq!(factory.config.get_ports(), &[5432]);
        assert!(factory.tls.is_none());
        assert_eq!(factory.database_type(), DatabaseType::Postgres);
    }
}
