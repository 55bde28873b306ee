use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Request settings shared by every item of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            timeout_ms: 30_000,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub item: usize,
    pub url: String,
    pub template: Arc<RequestTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failure(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Chunk { item: usize, data: Vec<u8> },
    Finished { item: usize, outcome: ItemOutcome },
}

impl TransferEvent {
    pub fn item(&self) -> usize {
        match self {
            Self::Chunk { item, .. } | Self::Finished { item, .. } => *item,
        }
    }
}

/// Source of item bytes. `issue` only schedules the transfer; chunks and the
/// terminal result come back later as [`TransferEvent`]s through whatever
/// queue the implementation was built with.
pub trait FetchTransport {
    fn issue(&mut self, request: FetchRequest) -> Result<(), TransportError>;

    fn cancel(&mut self, item: usize);
}

impl<T: FetchTransport + ?Sized> FetchTransport for Box<T> {
    fn issue(&mut self, request: FetchRequest) -> Result<(), TransportError> {
        (**self).issue(request)
    }

    fn cancel(&mut self, item: usize) {
        (**self).cancel(item)
    }
}
