//! HTTP client for the task server.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::{HttpRequest, HttpResponse, NetworkError, SOURCE_HEADER, Transport};
use super::{ApiError, AuthInfo, MutationAck, TaskApi};
use crate::models::{Mutation, Task};

/// Header carrying the CSRF token on mutations.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Header carrying a queued action's idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

#[derive(Debug, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default)]
    auth: Option<AuthInfo>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TasksResponse {
    success: bool,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MutationResponse {
    success: bool,
    #[serde(default)]
    task: Option<Task>,
    #[serde(default)]
    error: Option<String>,
}

/// [`TaskApi`] over any [`Transport`].
pub struct HttpApi<T: Transport> {
    /// Endpoint URL without query, e.g. `https://host/api/mobile.php`
    base_url: String,
    transport: T,
    csrf_token: RwLock<Option<String>>,
}

impl<T: Transport> HttpApi<T> {
    pub fn new(base_url: impl Into<String>, transport: T) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            csrf_token: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn action_url(&self, action: &str) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}action={}", self.base_url, separator, action)
    }

    async fn csrf_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.csrf_token.read().await.clone() {
            return Ok(token);
        }
        let auth = self.auth_check().await?;
        auth.csrf_token
            .ok_or_else(|| ApiError::Unauthorized { status: 401 })
    }

    async fn post_mutation(
        &self,
        mutation: &Mutation,
        idempotency_key: Uuid,
    ) -> Result<HttpResponse, ApiError> {
        let url = self.action_url(mutation.action_type());
        let body = serde_json::to_value(mutation).map_err(|e| ApiError::Decode(e.to_string()))?;
        let token = self.csrf_token().await?;

        let request = HttpRequest::post_json(url, &body["payload"])
            .map_err(|e| ApiError::Decode(e.to_string()))?
            .with_header(CSRF_HEADER, token)
            .with_header(IDEMPOTENCY_HEADER, idempotency_key.to_string());

        Ok(self.transport.fetch(request).await?)
    }
}

/// Map HTTP status classes onto [`ApiError`].
fn check_status(response: &HttpResponse) -> Result<(), ApiError> {
    match response.status {
        200..=299 => Ok(()),
        401 | 403 => Err(ApiError::Unauthorized {
            status: response.status,
        }),
        500..=599 => Err(ApiError::Server {
            status: response.status,
        }),
        status => {
            let message = response
                .json::<serde_json::Value>()
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| format!("HTTP {}", status));
            Err(ApiError::Rejected(message))
        }
    }
}

/// Reads that stand for the server's current state must come from the
/// server; a cached copy counts as no answer.
fn require_live(response: &HttpResponse) -> Result<(), ApiError> {
    match response.header(SOURCE_HEADER) {
        Some(source) => Err(ApiError::Network(NetworkError::Cached(source.to_string()))),
        None => Ok(()),
    }
}

fn decode<R: serde::de::DeserializeOwned>(response: &HttpResponse) -> Result<R, ApiError> {
    response
        .json()
        .map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl<T: Transport> TaskApi for HttpApi<T> {
    async fn auth_check(&self) -> Result<AuthInfo, ApiError> {
        let response = self
            .transport
            .fetch(HttpRequest::get(self.action_url("auth_check")))
            .await?;
        require_live(&response)?;
        check_status(&response)?;

        let body: AuthResponse = decode(&response)?;
        if !body.success {
            return Err(ApiError::Rejected(
                body.error.unwrap_or_else(|| "auth check failed".to_string()),
            ));
        }
        let auth = body.auth.unwrap_or_default();
        *self.csrf_token.write().await = auth.csrf_token.clone();
        debug!(authenticated = auth.authenticated, "auth check complete");
        Ok(auth)
    }

    async fn fetch_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, ApiError> {
        let url = format!(
            "{}&type=all&limit={}&offset={}",
            self.action_url("tasks"),
            limit,
            offset
        );
        let response = self.transport.fetch(HttpRequest::get(url)).await?;
        require_live(&response)?;
        check_status(&response)?;

        let body: TasksResponse = decode(&response)?;
        if !body.success {
            return Err(ApiError::Rejected(
                body.error.unwrap_or_else(|| "task fetch failed".to_string()),
            ));
        }
        Ok(body.tasks)
    }

    async fn send(
        &self,
        mutation: &Mutation,
        idempotency_key: Uuid,
    ) -> Result<MutationAck, ApiError> {
        let mut response = self.post_mutation(mutation, idempotency_key).await?;

        // A stale CSRF token gets one refresh.
        if response.status == 403 {
            warn!("mutation refused with 403, refreshing CSRF token");
            *self.csrf_token.write().await = None;
            response = self.post_mutation(mutation, idempotency_key).await?;
        }
        check_status(&response)?;

        let body: MutationResponse = decode(&response)?;
        if !body.success {
            return Err(ApiError::Rejected(
                body.error
                    .unwrap_or_else(|| format!("{} refused", mutation.action_type())),
            ));
        }
        Ok(MutationAck { task: body.task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::Method;
    use std::sync::Mutex;

    /// Transport answering from a script and recording requests.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<HttpResponse, NetworkError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(mut responses: Vec<Result<HttpResponse, NetworkError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(NetworkError::Other("script exhausted".into())))
        }
    }

    fn json(status: u16, value: serde_json::Value) -> Result<HttpResponse, NetworkError> {
        Ok(HttpResponse::new(status, value.to_string()))
    }

    fn move_mutation() -> Mutation {
        use crate::models::{Column, MovePayload, TaskStatus, TaskType};
        Mutation::MoveTask(MovePayload {
            task_id: 42,
            task_type: TaskType::Regular,
            from_column: Column::Todo,
            to_column: Column::InProgress,
            new_status: TaskStatus::InProgress,
            position: 0,
        })
    }

    #[tokio::test]
    async fn test_send_fetches_csrf_token_first() {
        let transport = ScriptedTransport::new(vec![
            json(200, serde_json::json!({"success": true, "auth": {"authenticated": true, "csrf_token": "tok"}})),
            json(200, serde_json::json!({"success": true, "task": {"id": 42, "title": "T", "status": "in_progress"}})),
        ]);
        let api = HttpApi::new("https://example.com/api/mobile.php", transport);

        let ack = api.send(&move_mutation(), Uuid::nil()).await.unwrap();
        assert_eq!(ack.task.unwrap().id, 42);

        let seen = api.transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].url.ends_with("?action=auth_check"));
        assert_eq!(seen[1].method, Method::Post);
        assert!(seen[1].url.ends_with("?action=move_task"));
        assert_eq!(seen[1].header(CSRF_HEADER), Some("tok"));
        assert_eq!(
            seen[1].header(IDEMPOTENCY_HEADER),
            Some(Uuid::nil().to_string().as_str())
        );
        let body: serde_json::Value = serde_json::from_slice(seen[1].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["task_id"], 42);
        assert_eq!(body["new_status"], "in_progress");
    }

    #[tokio::test]
    async fn test_success_false_is_rejection() {
        let transport = ScriptedTransport::new(vec![
            json(200, serde_json::json!({"success": true, "auth": {"authenticated": true, "csrf_token": "tok"}})),
            json(200, serde_json::json!({"success": false, "error": "Task is locked"})),
        ]);
        let api = HttpApi::new("https://example.com/api/mobile.php", transport);

        let err = api.send(&move_mutation(), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, ApiError::Rejected("Task is locked".to_string()));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let transport = ScriptedTransport::new(vec![json(502, serde_json::json!({}))]);
        let api = HttpApi::new("https://example.com/api/mobile.php", transport);

        let err = api.fetch_tasks(10, 0).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cached_replies_do_not_count_as_the_server() {
        let cached = |value: serde_json::Value| {
            Ok(HttpResponse::new(200, value.to_string()).with_header(SOURCE_HEADER, "cache"))
        };
        let transport = ScriptedTransport::new(vec![
            cached(serde_json::json!({"success": true, "auth": {"authenticated": true, "csrf_token": "old"}})),
            cached(serde_json::json!({"success": true, "tasks": [{"id": 1, "title": "t1"}]})),
        ]);
        let api = HttpApi::new("https://example.com/api/mobile.php", transport);

        let err = api.auth_check().await.unwrap_err();
        assert_eq!(err, ApiError::Network(NetworkError::Cached("cache".to_string())));
        assert!(err.is_transient());
        assert!(api.csrf_token.read().await.is_none());

        let err = api.fetch_all_tasks(10).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_all_tasks_pages_until_short_page() {
        let page = |ids: &[i64]| {
            let tasks: Vec<_> = ids
                .iter()
                .map(|id| serde_json::json!({"id": id, "title": format!("t{}", id)}))
                .collect();
            json(200, serde_json::json!({"success": true, "tasks": tasks}))
        };
        let transport = ScriptedTransport::new(vec![page(&[1, 2]), page(&[3])]);
        let api = HttpApi::new("https://example.com/api/mobile.php", transport);

        let tasks = api.fetch_all_tasks(2).await.unwrap();
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let seen = api.transport.seen.lock().unwrap();
        assert!(seen[0].url.ends_with("action=tasks&type=all&limit=2&offset=0"));
        assert!(seen[1].url.ends_with("action=tasks&type=all&limit=2&offset=2"));
    }
}
