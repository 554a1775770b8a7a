use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::record::NodeRecord;

/// `action` tag on a successful key-operation response. Grounded on the
/// `ActionType` constants in
/// `examples/original_source/distributed_store/rafty/http/response_objects.go`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Created,
    Modified,
    Deleted,
    Requested,
    SetAdded,
    SetRequested,
    ListPush,
    ListLength,
    ListRemove,
    ListRange,
    ZsetAdd,
    ZsetRangeByScore,
    ZsetRemrangebyscore,
}

/// Response body for a successful key operation, per `spec.md` §6:
/// `{action, node:{...}, meta?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueResponse {
    pub action: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRecord>,
    #[serde(rename = "meta", skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<String>,
}

impl KeyValueResponse {
    pub fn new(action: ActionType) -> Self {
        Self {
            action,
            node: None,
            meta_data: None,
        }
    }

    pub fn with_node(mut self, node: NodeRecord) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta_data = Some(meta.into());
        self
    }
}

/// `{code, reason}` pair. Reserved codes per `spec.md` §6: `100 Key not
/// found`, `101 Application error`, `102 Key Exists`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: String,
}

/// Error body per `spec.md` §6/§7: `{cause, errorCode:{code,reason},
/// metaData?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub cause: String,
    #[serde(rename = "errorCode")]
    pub error_code: ErrorCode,
    #[serde(rename = "metaData", skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<String>,
}

impl From<&KvError> for ErrorBody {
    fn from(err: &KvError) -> Self {
        let (code, reason) = err.error_code();
        ErrorBody {
            cause: err.to_string(),
            error_code: ErrorCode {
                code,
                reason: reason.to_string(),
            },
            meta_data: None,
        }
    }
}
