use crate::api::types::{
  BulkResult, CampaignLog, CampaignStats, EmailCampaign, LeadBatches, LeadFilter, LeadsPage,
  LoginRequest, LoginResponse, NewCampaign, NewTicket, Notification, PerformancePoint,
  SendCampaign, SendResult, Subscription, TaskStatus, Ticket, TicketUpdate, Usage, User,
};
use crate::cache::{QueryError, QueryResult};
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Notifications fetched per request
pub const NOTIFICATION_LIMIT: u32 = 20;

/// REST client for the outreach backend.
///
/// Every call maps transport failures to [`QueryError::Network`] and non-2xx
/// answers to [`QueryError::Server`], so the results plug straight into the
/// query cache's retry policy.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: Arc<RwLock<Option<String>>>,
  token_file: Option<PathBuf>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .user_agent(concat!("leadsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let base = parse_base_url(&config.api.url)?;
    let token = Config::get_access_token().ok();
    if token.is_none() {
      debug!("No access token found, requests are anonymous");
    }

    Ok(Self {
      http,
      base,
      token: Arc::new(RwLock::new(token)),
      token_file: Config::token_path(),
    })
  }

  /// Client against `base_url` with an explicit token and no token file.
  pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self> {
    Ok(Self {
      http: reqwest::Client::new(),
      base: parse_base_url(base_url)?,
      token: Arc::new(RwLock::new(token)),
      token_file: None,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  pub fn has_token(&self) -> bool {
    self.token.read().map(|t| t.is_some()).unwrap_or(false)
  }

  fn set_token(&self, token: Option<String>) {
    if let Ok(mut guard) = self.token.write() {
      *guard = token;
    }
  }

  fn url(&self, path: &str) -> QueryResult<Url> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| QueryError::InvalidUrl(format!("{}: {}", path, e)))
  }

  fn request(&self, method: Method, path: &str) -> QueryResult<RequestBuilder> {
    let url = self.url(path)?;
    let mut builder = self.http.request(method, url);
    if let Ok(guard) = self.token.read() {
      if let Some(token) = guard.as_deref() {
        builder = builder.bearer_auth(token);
      }
    }
    Ok(builder)
  }

  /// Send the request and turn any non-2xx status into a server error.
  async fn send(&self, builder: RequestBuilder) -> QueryResult<Response> {
    let response = builder
      .send()
      .await
      .map_err(|e| QueryError::network(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), "Request failed: {}", body);
    Err(QueryError::server(status.as_u16(), body))
  }

  async fn decode<T: DeserializeOwned>(response: Response) -> QueryResult<T> {
    let bytes = response
      .bytes()
      .await
      .map_err(|e| QueryError::network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(QueryError::from)
  }

  async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> QueryResult<T> {
    let builder = self.request(Method::GET, path)?.query(query);
    Self::decode(self.send(builder).await?).await
  }

  async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> QueryResult<T>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let builder = self.request(method, path)?.json(body);
    Self::decode(self.send(builder).await?).await
  }

  /// Like `send_json` but ignores the response body.
  async fn send_unit(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> QueryResult<()> {
    let mut builder = self.request(method, path)?;
    if let Some(body) = body {
      builder = builder.json(&body);
    }
    self.send(builder).await?;
    Ok(())
  }

  // ==========================================================================
  // Tickets
  // ==========================================================================

  pub async fn tickets(&self) -> QueryResult<Vec<Ticket>> {
    self.get("/api/tickets", &[]).await
  }

  pub async fn ticket(&self, id: u64) -> QueryResult<Ticket> {
    self.get(&format!("/api/tickets/{}", id), &[]).await
  }

  pub async fn create_ticket(&self, ticket: &NewTicket) -> QueryResult<Ticket> {
    self.send_json(Method::POST, "/api/tickets", ticket).await
  }

  pub async fn update_ticket(&self, id: u64, update: &TicketUpdate) -> QueryResult<Ticket> {
    self
      .send_json(Method::PUT, &format!("/api/tickets/{}", id), update)
      .await
  }

  pub async fn delete_ticket(&self, id: u64) -> QueryResult<()> {
    self
      .send_unit(Method::DELETE, &format!("/api/tickets/{}", id), None)
      .await
  }

  pub async fn add_comment(&self, id: u64, content: &str) -> QueryResult<()> {
    self
      .send_unit(
        Method::POST,
        &format!("/api/tickets/{}/comment", id),
        Some(json!({ "content": content })),
      )
      .await
  }

  // ==========================================================================
  // Notifications
  // ==========================================================================

  pub async fn notifications(&self) -> QueryResult<Vec<Notification>> {
    self
      .get(
        "/api/notifications",
        &[("limit", NOTIFICATION_LIMIT.to_string())],
      )
      .await
  }

  pub async fn mark_notification_read(&self, id: u64) -> QueryResult<()> {
    self
      .send_unit(
        Method::POST,
        &format!("/api/notifications/mark-read/{}", id),
        None,
      )
      .await
  }

  pub async fn mark_all_notifications_read(&self) -> QueryResult<()> {
    self
      .send_unit(Method::POST, "/api/notifications/mark-all-read", None)
      .await
  }

  // ==========================================================================
  // Leads
  // ==========================================================================

  pub async fn leads(&self, filter: &LeadFilter) -> QueryResult<LeadsPage> {
    self.get("/api/leads/list", &filter.query_params()).await
  }

  pub async fn lead_batches(&self) -> QueryResult<LeadBatches> {
    self.get("/api/leads/batches-stats", &[]).await
  }

  pub async fn delete_batch(&self, id: &str) -> QueryResult<()> {
    self
      .send_unit(Method::DELETE, &format!("/api/leads/batches/{}", id), None)
      .await
  }

  pub async fn bulk_update_leads(&self, lead_ids: &[String], status: &str) -> QueryResult<BulkResult> {
    let body = json!({ "leadIds": lead_ids, "updates": { "status": status } });
    self
      .send_json(Method::POST, "/api/leads/bulk-update", &body)
      .await
  }

  pub async fn bulk_delete_leads(&self, lead_ids: &[String]) -> QueryResult<BulkResult> {
    let body = json!({ "leadIds": lead_ids });
    self
      .send_json(Method::POST, "/api/leads/bulk-delete", &body)
      .await
  }

  pub async fn task_status(&self, task_id: &str) -> QueryResult<TaskStatus> {
    self
      .get(&format!("/api/leads/task-status/{}", task_id), &[])
      .await
  }

  pub async fn cancel_task(&self, task_id: &str) -> QueryResult<BulkResult> {
    self
      .send_json(
        Method::POST,
        &format!("/api/leads/cancel-task/{}", task_id),
        &json!({}),
      )
      .await
  }

  // ==========================================================================
  // Campaigns and usage
  // ==========================================================================

  pub async fn email_campaigns(&self) -> QueryResult<Vec<EmailCampaign>> {
    self.get("/api/email-campaigns", &[]).await
  }

  pub async fn create_campaign(&self, campaign: &NewCampaign) -> QueryResult<EmailCampaign> {
    self
      .send_json(Method::POST, "/api/email-campaigns", campaign)
      .await
  }

  pub async fn set_campaign_status(&self, id: u64, status: &str) -> QueryResult<EmailCampaign> {
    self
      .send_json(
        Method::PUT,
        &format!("/api/email-campaigns/{}", id),
        &json!({ "status": status }),
      )
      .await
  }

  pub async fn delete_campaign(&self, id: u64) -> QueryResult<()> {
    self
      .send_unit(
        Method::DELETE,
        &format!("/api/email-campaigns/{}", id),
        None,
      )
      .await
  }

  pub async fn send_campaign(&self, id: u64, request: &SendCampaign) -> QueryResult<SendResult> {
    self
      .send_json(
        Method::POST,
        &format!("/api/email-campaigns/{}/send", id),
        request,
      )
      .await
  }

  pub async fn campaign_logs(&self, id: u64) -> QueryResult<Vec<CampaignLog>> {
    self
      .get(&format!("/api/email-campaigns/{}/logs", id), &[])
      .await
  }

  /// Daily sends and responses across campaigns.
  pub async fn campaign_performance(&self) -> QueryResult<Vec<PerformancePoint>> {
    self.get("/api/email-campaigns/performance", &[]).await
  }

  pub async fn campaign_stats(&self) -> QueryResult<CampaignStats> {
    self.get("/api/campaigns/stats", &[]).await
  }

  pub async fn usage(&self) -> QueryResult<Usage> {
    self.get("/api/subscriptions/usage", &[]).await
  }

  pub async fn current_subscription(&self) -> QueryResult<Subscription> {
    self.get("/api/subscriptions/current", &[]).await
  }

  // ==========================================================================
  // Auth
  // ==========================================================================

  /// The logged-in user, or `None` when the backend answers 401.
  pub async fn current_user(&self) -> QueryResult<Option<User>> {
    match self.get::<User>("/user", &[]).await {
      Ok(user) => Ok(Some(user)),
      Err(QueryError::Server { status, .. }) if status == StatusCode::UNAUTHORIZED.as_u16() => {
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  /// Exchange credentials for an access token, keeping it for later requests
  /// and in the token file.
  pub async fn login(&self, credentials: &LoginRequest) -> QueryResult<bool> {
    let response: LoginResponse = self.send_json(Method::POST, "/login", credentials).await?;
    let Some(token) = response.access_token else {
      return Ok(false);
    };

    if let Some(path) = &self.token_file {
      if let Err(e) = Config::store_access_token(path, &token) {
        warn!("Failed to store access token: {}", e);
      }
    }
    self.set_token(Some(token));
    Ok(true)
  }

  /// Forget the access token locally. The backend keeps no session state.
  pub fn logout(&self) -> Result<()> {
    self.set_token(None);
    if let Some(path) = &self.token_file {
      Config::clear_access_token(path)?;
    }
    Ok(())
  }
}

impl std::fmt::Debug for ApiClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ApiClient")
      .field("base", &self.base.as_str())
      .field("authenticated", &self.has_token())
      .finish_non_exhaustive()
  }
}

/// Parse the configured base URL. A trailing slash is added so relative
/// joins keep any path prefix.
fn parse_base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid API url {}: {}", raw, e))?;
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::task::JoinHandle;

  /// Serve one canned response and hand back the raw request head.
  async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = Vec::new();
      let mut buf = [0u8; 1024];
      let head_end = loop {
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
          break pos + 4;
        }
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break request.len();
        }
        request.extend_from_slice(&buf[..n]);
      };
      let head = String::from_utf8_lossy(&request[..head_end]).to_lowercase();
      let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
      while request.len() < head_end + content_length {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        request.extend_from_slice(&buf[..n]);
      }
      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.ok();
      String::from_utf8_lossy(&request).into_owned()
    });
    (format!("http://{}", addr), handle)
  }

  #[test]
  fn test_base_url_keeps_prefix() {
    let client = ApiClient::with_base_url("https://example.com/backend", None).unwrap();
    assert_eq!(client.url("/api/tickets").unwrap().as_str(), "https://example.com/backend/api/tickets");

    let client = ApiClient::with_base_url("https://example.com/", None).unwrap();
    assert_eq!(client.url("user").unwrap().as_str(), "https://example.com/user");
  }

  #[tokio::test]
  async fn test_unjoinable_path_is_not_retried() {
    let client = ApiClient::with_base_url("https://example.com/", None).unwrap();
    let err = client.url("http://[::1").unwrap_err();
    assert!(matches!(err, QueryError::InvalidUrl(_)));
    assert!(!err.is_retryable());

    let err = client.get::<Usage>("http://[::1", &[]).await.unwrap_err();
    assert!(matches!(err, QueryError::InvalidUrl(_)));
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(ApiClient::with_base_url("not a url", None).is_err());
  }

  #[tokio::test]
  async fn test_get_sends_bearer_token() {
    let (base, server) = serve_once("200 OK", r#"{"tier":"pro","current_usage":3,"limit":10}"#).await;
    let client = ApiClient::with_base_url(&base, Some("secret".into())).unwrap();

    let usage = client.usage().await.unwrap();
    assert_eq!(usage.tier, "pro");
    assert_eq!(usage.remaining(), 7);

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/subscriptions/usage HTTP/1.1"));
    assert!(request.to_lowercase().contains("authorization: bearer secret"));
  }

  #[tokio::test]
  async fn test_leads_query_string() {
    let (base, server) = serve_once("200 OK", r#"{"leads":[],"total":0}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let filter = LeadFilter {
      page: 1,
      page_size: 20,
      status: Some("pending".into()),
      ..Default::default()
    };
    let page = client.leads(&filter).await.unwrap();
    assert_eq!(page.total(), 0);

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/leads/list?offset=20&limit=20&status=pending "));
    assert!(!request.to_lowercase().contains("authorization"));
  }

  #[tokio::test]
  async fn test_send_campaign_posts_pacing() {
    let (base, server) = serve_once("200 OK", r#"{"sent":2,"failed":1}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let request = SendCampaign {
      lead_ids: vec!["a".into(), "b".into(), "c".into()],
      personalization: Default::default(),
      config: crate::api::types::SendConfig::default(),
    };
    let result = client.send_campaign(4, &request).await.unwrap();
    assert_eq!(result, SendResult { sent: 2, failed: 1 });

    let raw = server.await.unwrap();
    assert!(raw.starts_with("POST /api/email-campaigns/4/send HTTP/1.1"));
    assert!(raw.contains(r#""batchSize":10"#));
    assert!(raw.contains(r#""leadIds":["a","b","c"]"#));
  }

  #[tokio::test]
  async fn test_task_status_path() {
    let (base, server) = serve_once("200 OK", r#"{"status":"pending","progress":40}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let status = client.task_status("t-17").await.unwrap();
    assert!(status.is_pending());
    assert_eq!(status.progress(), Some(40.0));
    assert!(server.await.unwrap().starts_with("GET /api/leads/task-status/t-17 HTTP/1.1"));
  }

  #[tokio::test]
  async fn test_server_error_mapping() {
    let (base, _server) = serve_once("503 Service Unavailable", "overloaded").await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let err = client.tickets().await.unwrap_err();
    assert_eq!(err, QueryError::server(503, "overloaded"));
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_unauthorized_user_is_none() {
    let (base, _server) = serve_once("401 Unauthorized", r#"{"detail":"no token"}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    assert_eq!(client.current_user().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_unauthorized_elsewhere_is_error() {
    let (base, _server) = serve_once("401 Unauthorized", "").await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let err = client.campaign_stats().await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn test_malformed_body_is_decode_error() {
    let (base, _server) = serve_once("200 OK", r#"{"sent": "many"}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();

    let err = client.campaign_stats().await.unwrap_err();
    assert!(matches!(err, QueryError::Decode(_)));
  }

  #[tokio::test]
  async fn test_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::with_base_url(&format!("http://{}", addr), None).unwrap();
    let err = client.notifications().await.unwrap_err();
    assert!(matches!(err, QueryError::Network(_)));
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_login_keeps_token() {
    let (base, server) = serve_once("200 OK", r#"{"access_token":"fresh"}"#).await;
    let client = ApiClient::with_base_url(&base, None).unwrap();
    assert!(!client.has_token());

    let credentials = LoginRequest {
      username: "ada".into(),
      password: "hunter2".into(),
    };
    assert!(client.login(&credentials).await.unwrap());
    assert!(client.has_token());
    assert!(server.await.unwrap().starts_with("POST /login HTTP/1.1"));

    client.logout().unwrap();
    assert!(!client.has_token());
  }
}
