//! Operation surface
//!
//! Name-addressed operations with JSON arguments and JSON results. The
//! transport (IPC, stdin/stdout, HTTP) is somebody else's problem; this module
//! only maps `(op, args)` onto the [`ConnectionManager`] and guarantees that
//! every call yields a value.

use dbdeck_rdbc::connection::ConnectionConfig;
use dbdeck_rdbc::types::Value;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ManagerError, Result};
use crate::manager::ConnectionManager;

/// Operations understood by [`dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `db:connect`
    Connect,
    /// `db:disconnect`
    Disconnect,
    /// `db:test-connection`
    TestConnection,
    /// `db:list-connections`
    ListConnections,
    /// `db:query`
    Query,
    /// `db:pool-status`
    PoolStatus,
}

impl Operation {
    /// Every operation, in surface order
    pub const ALL: [Operation; 6] = [
        Self::Connect,
        Self::Disconnect,
        Self::TestConnection,
        Self::ListConnections,
        Self::Query,
        Self::PoolStatus,
    ];

    /// Wire name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "db:connect",
            Self::Disconnect => "db:disconnect",
            Self::TestConnection => "db:test-connection",
            Self::ListConnections => "db:list-connections",
            Self::Query => "db:query",
            Self::PoolStatus => "db:pool-status",
        }
    }
}

impl FromStr for Operation {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| ManagerError::UnknownOperation(s.to_string()))
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One request on a framed transport
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Echoed back on the response
    #[serde(default)]
    pub request_id: Option<serde_json::Value>,
    /// Operation name
    pub op: String,
    /// Operation arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Response to an [`OperationRequest`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    /// Copied from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<serde_json::Value>,
    /// Operation name
    pub op: String,
    /// Operation result
    pub result: serde_json::Value,
}

/// Identifier argument: either a bare string or `{"id": ...}`
#[derive(Deserialize)]
#[serde(untagged)]
enum IdArg {
    Bare(String),
    Object { id: String },
}

impl IdArg {
    fn into_id(self) -> String {
        match self {
            Self::Bare(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct QueryArgs {
    id: String,
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

fn parse_args<T: serde::de::DeserializeOwned>(op: Operation, args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| ManagerError::invalid_arguments(op.name(), e))
}

fn failure(err: &ManagerError) -> serde_json::Value {
    json!({ "success": false, "message": err.to_string() })
}

/// Run one operation by name. Never fails: errors come back as
/// `{"success": false, "message": ...}`.
pub async fn dispatch(manager: &ConnectionManager, op: &str, args: serde_json::Value) -> serde_json::Value {
    dispatch_cancellable(manager, op, args, &CancellationToken::new()).await
}

/// [`dispatch`] with a cancellation token for `db:connect` and `db:query`
pub async fn dispatch_cancellable(
    manager: &ConnectionManager,
    op: &str,
    args: serde_json::Value,
    cancel: &CancellationToken,
) -> serde_json::Value {
    let result = match op.parse::<Operation>() {
        Ok(op) => run(manager, op, args, cancel).await,
        Err(e) => Err(e),
    };

    result.unwrap_or_else(|e| {
        debug!(op = %op, error = %e, "Operation rejected");
        failure(&e)
    })
}

/// Handle a framed request
pub async fn handle_request(
    manager: &ConnectionManager,
    request: OperationRequest,
    cancel: &CancellationToken,
) -> OperationResponse {
    let result = dispatch_cancellable(manager, &request.op, request.args, cancel).await;
    OperationResponse {
        request_id: request.request_id,
        op: request.op,
        result,
    }
}

async fn run(
    manager: &ConnectionManager,
    op: Operation,
    args: serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    match op {
        Operation::Connect => {
            let config: ConnectionConfig = parse_args(op, args)?;
            let outcome = manager.connect_cancellable(config, cancel).await;
            Ok(serde_json::to_value(outcome)?)
        }
        Operation::Disconnect => {
            let id = parse_args::<IdArg>(op, args)?.into_id();
            Ok(serde_json::Value::Bool(manager.disconnect(&id).await))
        }
        Operation::TestConnection => {
            let config: ConnectionConfig = parse_args(op, args)?;
            let outcome = manager.test_connection(&config).await;
            Ok(serde_json::to_value(outcome)?)
        }
        Operation::ListConnections => Ok(serde_json::to_value(manager.list_connections())?),
        Operation::Query => {
            let query: QueryArgs = parse_args(op, args)?;
            let outcome = manager
                .query_cancellable(&query.id, &query.sql, &query.params, cancel)
                .await;
            Ok(serde_json::to_value(outcome)?)
        }
        Operation::PoolStatus => {
            let id = parse_args::<IdArg>(op, args)?.into_id();
            Ok(serde_json::to_value(manager.pool_report(&id))?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
        assert!(matches!(
            "db:drop-everything".parse::<Operation>(),
            Err(ManagerError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_id_arg_shapes() {
        let bare: IdArg = serde_json::from_value(json!("conn_1")).unwrap();
        assert_eq!(bare.into_id(), "conn_1");
        let object: IdArg = serde_json::from_value(json!({"id": "conn_2"})).unwrap();
        assert_eq!(object.into_id(), "conn_2");
    }

    #[tokio::test]
    async fn test_unknown_operation_is_a_result() {
        let manager = ConnectionManager::default();
        let result = dispatch(&manager, "db:nope", serde_json::Value::Null).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["message"], "Unknown operation: db:nope");
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_a_result() {
        let manager = ConnectionManager::default();
        let result = dispatch(&manager, "db:connect", json!({"host": "localhost"})).await;
        assert_eq!(result["success"], false);
        assert!(result["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid arguments for db:connect"));
    }

    #[tokio::test]
    async fn test_fresh_surface() {
        let manager = ConnectionManager::default();
        assert_eq!(
            dispatch(&manager, "db:list-connections", serde_json::Value::Null).await,
            json!([])
        );
        assert_eq!(
            dispatch(&manager, "db:disconnect", json!("nonexistent")).await,
            json!(false)
        );
        assert_eq!(
            dispatch(&manager, "db:pool-status", json!({"id": "conn_1"})).await,
            serde_json::Value::Null
        );
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let manager = ConnectionManager::default();
        let request: OperationRequest = serde_json::from_value(json!({
            "requestId": 7,
            "op": "db:list-connections"
        }))
        .unwrap();
        let response = handle_request(&manager, request, &CancellationToken::new()).await;
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({"requestId": 7, "op": "db:list-connections", "result": []})
        );
    }
}
