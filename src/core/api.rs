use crate::domain::model::{
    Appointment, Assessment, AssessmentSubmission, Client, Coach, CoherenceSnapshot,
    NewAppointment, Tenant,
};
use crate::domain::ports::ConfigProvider;
use crate::utils::error::{PortalError, Result};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// 教練平台 REST API 用戶端 (bearer token 驗證)
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    tenant_id: Option<String>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| PortalError::InvalidConfigValueError {
            field: "api.base_url".to_string(),
            value: base_url.to_string(),
            reason: format!("Invalid URL format: {}", e),
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token: None,
            tenant_id: None,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn from_config<C: ConfigProvider>(config: &C) -> Result<Self> {
        let mut client = Self::new(config.api_base_url())?
            .with_retry(config.retry_attempts(), config.retry_delay());
        if let Some(tenant_id) = config.tenant_id() {
            client = client.with_tenant(tenant_id);
        }
        Ok(client)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PortalError::ConfigError {
                message: format!("API base URL cannot be a base: {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(tenant_id) = &self.tenant_id {
            builder = builder.header(TENANT_HEADER, tenant_id);
        }
        builder
    }

    /// GET 在 5xx 或連線錯誤時重試，4xx 不重試
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            tracing::debug!("📡 GET {} (attempt {})", url, attempt);

            let outcome = match self.request(Method::GET, url.clone()).query(query).send().await {
                Ok(response) => match check_status(response).await {
                    Ok(response) => response.json::<T>().await.map_err(PortalError::from),
                    Err(e) => Err(e),
                },
                Err(e) => Err(PortalError::from(e)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= self.retry_attempts => {
                    tracing::warn!(
                        "🔄 GET {} failed ({}), retrying in {:?} ({}/{})",
                        url.path(),
                        e,
                        self.retry_delay,
                        attempt,
                        self.retry_attempts
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!("❌ GET {} failed: {}", url.path(), e);
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        tracing::debug!("📡 {} {}", method, url);

        let response = self.request(method.clone(), url.clone()).json(body).send().await?;
        let response = check_status(response).await.inspect_err(|e| {
            tracing::error!("❌ {} {} failed: {}", method, url.path(), e);
        })?;
        Ok(response.json::<T>().await?)
    }

    pub async fn current_tenant(&self) -> Result<Tenant> {
        self.get_json(&["tenant"], &[]).await
    }

    pub async fn list_clients(&self, coach_id: Option<&str>) -> Result<Vec<Client>> {
        let query: Vec<(&str, String)> = coach_id
            .map(|id| vec![("coachId", id.to_string())])
            .unwrap_or_default();
        self.get_json(&["clients"], &query).await
    }

    pub async fn get_client(&self, client_id: &str) -> Result<Client> {
        self.get_json(&["clients", client_id], &[]).await
    }

    pub async fn client_coherence(&self, client_id: &str) -> Result<CoherenceSnapshot> {
        self.get_json(&["clients", client_id, "coherence"], &[]).await
    }

    pub async fn list_coaches(&self) -> Result<Vec<Coach>> {
        self.get_json(&["coaches"], &[]).await
    }

    pub async fn list_assessments(&self, client_id: &str) -> Result<Vec<Assessment>> {
        self.get_json(&["clients", client_id, "assessments"], &[]).await
    }

    pub async fn submit_assessment(&self, submission: &AssessmentSubmission) -> Result<Assessment> {
        self.send_json(Method::POST, &["assessments"], submission).await
    }

    pub async fn list_appointments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>> {
        let query = [("from", from.to_rfc3339()), ("to", to.to_rfc3339())];
        self.get_json(&["appointments"], &query).await
    }

    pub async fn create_appointment(&self, appointment: &NewAppointment) -> Result<Appointment> {
        self.send_json(Method::POST, &["appointments"], appointment).await
    }

    pub async fn cancel_appointment(&self, appointment_id: &str) -> Result<Appointment> {
        self.send_json(
            Method::POST,
            &["appointments", appointment_id, "cancel"],
            &serde_json::json!({}),
        )
        .await
    }
}

/// 將非 2xx 回應轉成分類後的錯誤
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let endpoint = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });

    Err(match status.as_u16() {
        401 => PortalError::AuthError { message },
        403 => PortalError::PermissionError { message },
        code => PortalError::HttpStatusError {
            status: code,
            endpoint,
            message,
        },
    })
}

fn extract_error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => ["message", "error", "detail"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string),
        Err(_) => Some(body.trim().to_string()),
    }
}
