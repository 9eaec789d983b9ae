//! REST collaborator used to create, end and reject calls, and to list call
//! history and counselor availability.

use crate::error::ApiError;
use crate::model::CallKind;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateCallRequest {
    #[serde(rename = "call_type")]
    pub kind: CallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<String>,
    pub language: String,
}

/// A call as recorded by the server. Timestamps are naive UTC.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub callee_id: Option<String>,
    #[serde(rename = "call_type")]
    pub kind: CallKind,
    pub status: String,
    pub language: String,
    #[serde(default)]
    pub started_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub ended_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Counselor {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub rating: f32,
    #[serde(default)]
    pub specializations: Vec<String>,
}

/// Defines the contract of the remote call service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallApi: Send + Sync {
    /// Creates a call and returns the server's record of it.
    async fn create_call(&self, request: &CreateCallRequest) -> Result<CallRecord, ApiError>;

    async fn end_call(&self, session_id: &str) -> Result<(), ApiError>;

    async fn reject_call(&self, session_id: &str) -> Result<(), ApiError>;

    /// Past calls of the current user, newest first.
    async fn call_history(&self, kind: Option<CallKind>) -> Result<Vec<CallRecord>, ApiError>;

    async fn available_counselors(&self, language: &str) -> Result<Vec<Counselor>, ApiError>;
}

#[derive(Deserialize)]
struct HistoryResponse {
    calls: Vec<CallRecord>,
}

#[derive(Deserialize)]
struct CounselorsResponse {
    counselors: Vec<Counselor>,
}

/// An implementation of [`CallApi`] over HTTP and JSON.
pub struct HttpCallApi {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
    history_limit: u32,
}

impl HttpCallApi {
    /// Creates a client for the call service rooted at `base_url`
    /// (for example `https://api.example.com/api/calls`).
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
            history_limit: 50,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    #[instrument(skip(self), fields(kind = %request.kind))]
    async fn create_call(&self, request: &CreateCallRequest) -> Result<CallRecord, ApiError> {
        let response = self
            .execute(self.client.post(self.url("create")).json(request))
            .await?;
        let record: CallRecord = response.json().await?;
        debug!(call_id = %record.call_id, status = %record.status, "Call created.");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn end_call(&self, session_id: &str) -> Result<(), ApiError> {
        self.execute(self.client.post(self.url(&format!("{session_id}/end"))))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reject_call(&self, session_id: &str) -> Result<(), ApiError> {
        self.execute(self.client.post(self.url(&format!("{session_id}/reject"))))
            .await?;
        Ok(())
    }

    async fn call_history(&self, kind: Option<CallKind>) -> Result<Vec<CallRecord>, ApiError> {
        let mut query = vec![("limit", self.history_limit.to_string())];
        if let Some(kind) = kind {
            query.push(("call_type", kind.as_str().to_owned()));
        }
        let response = self
            .execute(self.client.get(self.url("history")).query(&query))
            .await?;
        Ok(response.json::<HistoryResponse>().await?.calls)
    }

    async fn available_counselors(&self, language: &str) -> Result<Vec<Counselor>, ApiError> {
        let response = self
            .execute(
                self.client
                    .get(self.url("counselors/available"))
                    .query(&[("language", language)]),
            )
            .await?;
        Ok(response.json::<CounselorsResponse>().await?.counselors)
    }
}
