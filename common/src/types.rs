use serde::{Deserialize, Serialize};

use crate::{
    coordinator::Outcome,
    error::{ErrorKind, UpdateError},
    partition::PartitionInfo,
    plan::CompletionState,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UpdateError> for ErrorReport {
    fn from(err: &UpdateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub url: String,
    pub partition: PartitionInfo,
    pub state: CompletionState,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
}

/// Snapshot of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub outcome: Outcome,
    #[serde(rename = "currentItem")]
    pub current_item: Option<usize>,
    #[serde(rename = "targetSlot")]
    pub target_slot: Option<u8>,
    pub items: Vec<ItemStatus>,
    #[serde(rename = "lastError")]
    pub last_error: Option<ErrorReport>,
    #[serde(rename = "restartRequested")]
    pub restart_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootStatus {
    pub running: u8,
    #[serde(rename = "nextBoot")]
    pub next_boot: u8,
    pub slots: Vec<PartitionInfo>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::TransportError;

    #[test]
    fn status_serialises_with_api_field_names() {
        let status = UpdateStatus {
            outcome: Outcome::Failed,
            current_item: None,
            target_slot: Some(1),
            items: vec![ItemStatus {
                url: "http://h/a".to_string(),
                partition: PartitionInfo::new("rom1", 0x202000, 0xF8000),
                state: CompletionState::Failed,
                bytes_written: 12,
            }],
            last_error: Some(ErrorReport::from(&UpdateError::Transport {
                item: 0,
                source: TransportError::Status(404),
            })),
            restart_requested: false,
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["outcome"], json!("FAILED"));
        assert_eq!(value["targetSlot"], json!(1));
        assert_eq!(value["items"][0]["bytesWritten"], json!(12));
        assert_eq!(value["items"][0]["state"], json!("FAILED"));
        assert_eq!(value["lastError"]["kind"], json!("transport"));
        assert_eq!(
            value["lastError"]["message"],
            json!("item 0 transfer failed: http status 404")
        );
    }
}
