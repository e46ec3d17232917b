//! Uniform envelope returned by every host operation a plugin invokes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

/// Stable machine-readable failure codes. Hosts may render these
/// however they like, but the wire names never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    PermissionPending,
    PermissionPromptCancelled,
    InvalidArgument,
    OperationUnavailable,
    RouteNotFound,
    NavigationNotFound,
    SettingsUnavailable,
    SubscriptionNotFound,
    FileNotFound,
    OperationFailed,
    PageUnavailable,
}

/// Outcome of a single host operation.
///
/// Successful results may carry a payload; failures always carry a
/// code and usually a message. Permission-related failures also name
/// the permission so a host UI can offer to re-prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            message: None,
            permission: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok()
        }
    }

    pub fn failed(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            message: Some(message.into()),
            permission: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::failed(ErrorCode::InvalidArgument, message)
    }

    /// The user (or a persisted decision) refused the permission.
    pub fn denied(permission: impl Into<String>) -> Self {
        let permission = permission.into();
        Self {
            permission: Some(permission.clone()),
            ..Self::failed(
                ErrorCode::PermissionDenied,
                format!("permission '{permission}' was denied"),
            )
        }
    }

    /// The permission is still awaiting a decision.
    pub fn pending(permission: impl Into<String>) -> Self {
        let permission = permission.into();
        Self {
            permission: Some(permission.clone()),
            ..Self::failed(
                ErrorCode::PermissionPending,
                format!("permission '{permission}' is awaiting a decision"),
            )
        }
    }

    /// The prompt queue was drained before the user decided.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::failed(ErrorCode::PermissionPromptCancelled, reason)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}
