//! JSON-RPC dispatch for the `rpc` channel.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use vmedia_proto::error::VmError;
use vmedia_proto::media::VirtualMediaMode;
use vmedia_proto::rpc::{
    JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
};

use crate::controller::MountController;
use crate::session::Session;

/// Why a call did not produce a result.
enum CallError {
    MethodNotFound(String),
    InvalidParams(String),
    Failed(VmError),
}

impl From<VmError> for CallError {
    fn from(e: VmError) -> Self {
        CallError::Failed(e)
    }
}

type CallResult = Result<Value, CallError>;

/// Handle one text message from the `rpc` channel.
///
/// Returns the serialized response, or `None` for notifications.
pub async fn handle_message(controller: &MountController, session: &Session, text: &str) -> Option<String> {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("failed to parse rpc request: {}", e);
            let response = JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error", Some(e.to_string()));
            return serde_json::to_string(&response).ok();
        }
    };
    debug!("rpc request: {} (session {})", request.method, session.id());

    let params = request.params.unwrap_or_default();
    let result = dispatch(controller, session, &request.method, &params).await;

    let id = request.id?;
    let response = match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(CallError::MethodNotFound(method)) => {
            JsonRpcResponse::failure(id, METHOD_NOT_FOUND, "Method not found", Some(method))
        }
        Err(CallError::InvalidParams(msg)) => {
            JsonRpcResponse::failure(id, INVALID_PARAMS, "Invalid params", Some(msg))
        }
        Err(CallError::Failed(e)) => {
            if e.is_user_error() {
                debug!("rpc {} rejected: {}", request.method, e);
            } else {
                warn!("rpc {} failed: {}", request.method, e);
            }
            JsonRpcResponse::failure(id, e.rpc_code(), "Internal error", Some(e.to_string()))
        }
    };
    serde_json::to_string(&response).ok()
}

async fn dispatch(
    controller: &MountController,
    session: &Session,
    method: &str,
    params: &Map<String, Value>,
) -> CallResult {
    match method {
        "ping" => Ok(Value::from("pong")),
        "getVirtualMediaState" => to_value(&controller.get_state().await),
        "mountWithWebRTC" => {
            let filename = param_str(params, "filename")?;
            let size = param_u64(params, "size")?;
            let mode = param_mode(params)?;
            controller
                .mount_with_webrtc(Some(session.id()), filename, size, mode)
                .await?;
            Ok(Value::Null)
        }
        "mountWithHTTP" => {
            let url = param_str(params, "url")?;
            let mode = param_mode(params)?;
            controller.mount_with_http(url, mode).await?;
            Ok(Value::Null)
        }
        "mountWithStorage" => {
            let filename = param_str(params, "filename")?;
            let mode = param_mode(params)?;
            controller.mount_with_storage(filename, mode).await?;
            Ok(Value::Null)
        }
        "unmountImage" => {
            controller.unmount().await?;
            Ok(Value::Null)
        }
        "checkMountUrl" => {
            let url = param_str(params, "url")?;
            to_value(&controller.check_url(url).await)
        }
        "getMassStorageMode" => Ok(Value::from(controller.get_mass_storage_mode().await?)),
        "setMassStorageMode" => {
            let mode = param_str(params, "mode")?;
            Ok(Value::from(controller.set_mass_storage_mode(mode).await?))
        }
        "listStorageFiles" => to_value(&controller.list_storage_files().await?),
        "deleteStorageFile" => {
            let filename = param_str(params, "filename")?;
            controller.delete_storage_file(filename).await?;
            Ok(Value::Null)
        }
        "getStorageSpace" => to_value(&controller.storage_space().await?),
        "startStorageFileUpload" => {
            let filename = param_str(params, "filename")?;
            let size = param_u64(params, "size")?;
            to_value(&controller.start_storage_file_upload(filename, size).await?)
        }
        other => Err(CallError::MethodNotFound(other.to_string())),
    }
}

fn to_value<T: Serialize>(value: &T) -> CallResult {
    serde_json::to_value(value).map_err(|e| CallError::Failed(e.into()))
}

fn param_str<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str, CallError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::InvalidParams(format!("missing string parameter '{}'", name)))
}

fn param_u64(params: &Map<String, Value>, name: &str) -> Result<u64, CallError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| CallError::InvalidParams(format!("missing integer parameter '{}'", name)))
}

fn param_mode(params: &Map<String, Value>) -> Result<VirtualMediaMode, CallError> {
    param_str(params, "mode")?
        .parse()
        .map_err(|e: VmError| CallError::InvalidParams(e.to_string()))
}
