//! HTTP implementation of the users API.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::{FieldUpdate, ListPage, ListRequest, User, UserDraft, UserId};
use super::wire::{ApiDeleteRequest, ApiErrorBody, ApiListResponse, ApiUpdateFieldRequest, ApiUser};
use super::UsersApi;
use crate::error::{ListError, Result};

/// HTTP client for the users API
#[derive(Clone)]
pub struct HttpUsersApi {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpUsersApi {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    let mut base = Url::parse(base_url)
      .map_err(|e| ListError::validation("api.url", format!("{}: {}", base_url, e)))?;

    // Url::join drops the last segment unless the path ends with a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| ListError::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { http, base, token })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| ListError::validation("path", format!("{}: {}", path, e)))
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    let response = request.send().await.map_err(transport_error)?;
    check_status(response).await
  }
}

#[async_trait]
impl UsersApi for HttpUsersApi {
  async fn list(&self, request: &ListRequest) -> Result<ListPage> {
    let mut url = self.endpoint("users")?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("page", &request.page.to_string());
      query.append_pair("page_size", &request.page_size.to_string());
      for (name, value) in request.filters.canonical_pairs() {
        query.append_pair(name, &value);
      }
    }

    debug!(%url, "GET users");
    let response = self.send(self.http.get(url)).await?;
    let body: ApiListResponse = response
      .json()
      .await
      .map_err(|e| ListError::Network(format!("Failed to parse users page: {}", e)))?;

    body.into_page()
  }

  async fn update_field(&self, ids: &[UserId], update: FieldUpdate) -> Result<()> {
    let url = self.endpoint("users/bulk-update")?;
    let body = ApiUpdateFieldRequest {
      ids,
      field: update.field(),
      value: update.value(),
    };

    debug!(count = ids.len(), field = update.field(), "POST users/bulk-update");
    self.send(self.http.post(url).json(&body)).await?;
    Ok(())
  }

  async fn delete(&self, ids: &[UserId]) -> Result<()> {
    let url = self.endpoint("users/bulk-delete")?;

    debug!(count = ids.len(), "POST users/bulk-delete");
    self
      .send(self.http.post(url).json(&ApiDeleteRequest { ids }))
      .await?;
    Ok(())
  }

  async fn create(&self, draft: &UserDraft) -> Result<User> {
    let url = self.endpoint("users")?;
    let response = self.send(self.http.post(url).json(draft)).await?;
    parse_user(response).await
  }

  async fn update(&self, id: &str, draft: &UserDraft) -> Result<User> {
    let url = self.endpoint(&format!("users/{}", id))?;
    let response = self.send(self.http.put(url).json(draft)).await?;
    parse_user(response).await
  }
}

async fn parse_user(response: Response) -> Result<User> {
  let user: ApiUser = response
    .json()
    .await
    .map_err(|e| ListError::Network(format!("Failed to parse user: {}", e)))?;
  user.into_user()
}

fn transport_error(err: reqwest::Error) -> ListError {
  if err.is_timeout() {
    ListError::Network("request timed out".to_string())
  } else {
    ListError::Network(err.to_string())
  }
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let text = response.text().await.unwrap_or_default();
  let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
  let message = if body.message.is_empty() {
    text
  } else {
    body.message
  };

  Err(status_error(status, message, body.field))
}

fn status_error(status: StatusCode, message: String, field: Option<String>) -> ListError {
  match status {
    StatusCode::NOT_FOUND => ListError::NotFound(message),
    StatusCode::CONFLICT => ListError::Conflict(message),
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ListError::Validation {
      field: field.unwrap_or_else(|| "request".to_string()),
      reason: message,
    },
    other => ListError::Network(format!("HTTP {}: {}", other, message)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let api = HttpUsersApi::new("https://admin.example.com/api/v1", None, Duration::from_secs(5))
      .unwrap();
    assert_eq!(
      api.endpoint("users").unwrap().as_str(),
      "https://admin.example.com/api/v1/users"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let result = HttpUsersApi::new("not a url", None, Duration::from_secs(5));
    assert!(matches!(result, Err(ListError::Validation { .. })));
  }

  #[test]
  fn test_status_mapping() {
    assert!(matches!(
      status_error(StatusCode::NOT_FOUND, "gone".into(), None),
      ListError::NotFound(_)
    ));
    assert!(matches!(
      status_error(StatusCode::CONFLICT, "busy".into(), None),
      ListError::Conflict(_)
    ));
    assert_eq!(
      status_error(StatusCode::UNPROCESSABLE_ENTITY, "taken".into(), Some("email".into())),
      ListError::validation("email", "taken")
    );
    assert!(status_error(StatusCode::BAD_GATEWAY, "upstream".into(), None).is_retryable());
  }
}
