//! Built-in methods served by the standalone host.

use rpcbridge::{RequestContext, RpcDispatch, RpcError};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Protocol revision advertised when the client does not ask for one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Minimal method table: enough for a client to connect and list tools.
pub struct BuiltinMethods;

#[async_trait::async_trait]
impl RpcDispatch for BuiltinMethods {
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        debug!("Dispatching {} (id {})", method, ctx.id);

        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_PROTOCOL_VERSION);
                Ok(json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }))
            }
            "ping" => Ok(json!("pong")),
            "echo" => Ok(params),
            "tools/list" => Ok(json!({ "tools": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn notify(&self, method: &str, _params: Value) {
        info!("Client notification: {}", method);
    }
}
