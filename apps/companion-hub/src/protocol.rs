use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::target::TargetInfo;

/// Frames sent by a device over its channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceMessage {
    /// Identity handshake; the first meaningful frame on every connection
    #[serde(rename_all = "camelCase")]
    ClientInfo {
        #[serde(default)]
        identity: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Keep-alive
    Ping,
}

/// Frames sent to a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceCommand {
    /// Launch a built app on the target
    #[serde(rename_all = "camelCase")]
    Run { app_path: String },
    /// Stop whatever the target is running
    Stop,
    /// Response to ping
    Pong,
    /// Protocol-level error report
    Error { code: String, message: String },
}

/// Events streamed to registered observers, at most once per status change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    TargetUpdated { target: TargetInfo, is_new: bool },
    TargetRemoved { identity: String },
}

/// Fatal handshake failures; these terminate the offending connection only
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandshakeError {
    #[error("clientInfo requires an identity")]
    MissingIdentity,
    #[error("identity already bound to a live connection: {0}")]
    IdentityCollision(String),
}

impl HandshakeError {
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeError::MissingIdentity => "missing_identity",
            HandshakeError::IdentityCollision(_) => "identity_collision",
        }
    }
}

/// Failures of `run`/`stop` and other target-addressed operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("run target not available")]
    NotAvailable,
    #[error("run target not found")]
    NotFound,
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::NotAvailable => "run_target_not_available",
            CommandError::NotFound => "run_target_not_found",
        }
    }
}

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_parses_with_both_fields() {
        let frame: DeviceMessage =
            serde_json::from_str(r#"{"type":"clientInfo","identity":"X","displayName":"Phone1"}"#)
                .unwrap();
        assert_eq!(
            frame,
            DeviceMessage::ClientInfo {
                identity: Some("X".to_string()),
                display_name: Some("Phone1".to_string()),
            }
        );
    }

    #[test]
    fn client_info_fields_default_to_none() {
        let frame: DeviceMessage = serde_json::from_str(r#"{"type":"clientInfo"}"#).unwrap();
        assert_eq!(
            frame,
            DeviceMessage::ClientInfo {
                identity: None,
                display_name: None,
            }
        );
    }

    #[test]
    fn run_command_uses_app_path_key() {
        let json = serde_json::to_string(&DeviceCommand::Run {
            app_path: "/apps/demo".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"run","appPath":"/apps/demo"}"#);
    }

    #[test]
    fn stop_command_is_bare() {
        let json = serde_json::to_string(&DeviceCommand::Stop).unwrap();
        assert_eq!(json, r#"{"type":"stop"}"#);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HandshakeError::MissingIdentity.code(), "missing_identity");
        assert_eq!(
            HandshakeError::IdentityCollision("X".into()).code(),
            "identity_collision"
        );
        assert_eq!(CommandError::NotAvailable.code(), "run_target_not_available");
        assert_eq!(CommandError::NotFound.code(), "run_target_not_found");
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(generate_connection_id(), generate_connection_id());
    }
}
