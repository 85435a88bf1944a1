//! Request/response messages between the popup, the host and capture
//! contexts.

use serde::{Deserialize, Serialize};

pub type StreamId = u64;

/// Popup to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    #[serde(rename_all = "camelCase")]
    StartRoom { room_id: String, auth_token: String },
    StopRoom,
    QueryRoom,
}

/// Host to popup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "description", rename_all = "kebab-case")]
pub enum ControlResponse {
    ActionResponse { success: bool },
    #[serde(rename_all = "camelCase")]
    RoomInfo { room_id: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayStatus {
    Playing,
    Paused,
}

/// Popup to capture context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ContentCommand {
    #[serde(rename_all = "camelCase")]
    ChooseElement {
        #[serde(default)]
        tab_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    StopStream { stream_id: StreamId },
    StopAll,
    GetAll,
}

/// Capture context to popup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "description", rename_all = "kebab-case")]
pub enum ContentReply {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        stream_id: StreamId,
        status: PlayStatus,
    },
    StatusAll {
        statuses: Vec<(StreamId, PlayStatus)>,
    },
}
