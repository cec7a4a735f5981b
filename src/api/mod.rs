//! Task server API.
//!
//! The server is an external collaborator; only its contracts live here:
//!
//! - `GET  ?action=auth_check` -> `{ success, auth: { authenticated, user, csrf_token } }`
//! - `GET  ?action=tasks&type=all&limit=&offset=` -> `{ success, tasks }`
//! - `POST ?action=move_task|create_task|update_task` -> `{ success, task?, error? }`
//!
//! Mutations carry the CSRF token from `auth_check` and an idempotency key.

pub mod http;
pub mod transport;

pub use http::HttpApi;
pub use transport::{
    Destination, HttpRequest, HttpResponse, Method, NetworkError, ReqwestTransport,
    SOURCE_HEADER, Transport,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Mutation, Task};

/// Errors from talking to the task server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response at all (offline, DNS, timeout)
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The server answered with a 5xx
    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("not authorized (HTTP {status})")]
    Unauthorized { status: u16 },

    /// The server understood the request and refused it
    #[error("{0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether this failure means "try again later" rather than "no".
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Server { .. })
    }
}

/// Authenticated-user descriptor returned by `auth_check`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub authenticated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
}

/// Server acknowledgement of a mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationAck {
    /// Authoritative task record, when the server returns one
    pub task: Option<Task>,
}

/// Contract of the task server.
#[async_trait]
pub trait TaskApi: Send + Sync + 'static {
    /// Check the session and obtain a CSRF token.
    async fn auth_check(&self) -> Result<AuthInfo, ApiError>;

    /// Fetch one page of tasks.
    async fn fetch_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, ApiError>;

    /// Deliver a mutation. `idempotency_key` is stable across retries.
    async fn send(&self, mutation: &Mutation, idempotency_key: Uuid)
    -> Result<MutationAck, ApiError>;

    /// Fetch every page of tasks.
    async fn fetch_all_tasks(&self, page_size: u32) -> Result<Vec<Task>, ApiError> {
        let page_size = page_size.max(1);
        let mut tasks = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch_tasks(page_size, offset).await?;
            let count = page.len() as u32;
            tasks.extend(page);
            if count < page_size {
                break;
            }
            offset += count;
        }
        Ok(tasks)
    }
}
