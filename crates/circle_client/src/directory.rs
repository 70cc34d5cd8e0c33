use async_trait::async_trait;
use circle_shared::{
    domain::{Circle, CircleId, UserId},
    error::ApiError,
    protocol::{HistoryQuery, JoinCircleRequest, JoinCircleResponse, MessagePayload},
};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{EngineError, JoinError};

const CIRCLES_PATH: &str = "/api/advanced/peer-circles";

/// REST side of the circles service: discovery, membership and backlog.
#[async_trait]
pub trait CircleDirectory: Send + Sync {
    async fn list_circles(&self, interest: Option<&str>) -> Result<Vec<Circle>, EngineError>;
    async fn join_circle(
        &self,
        circle_id: &CircleId,
        user_id: &UserId,
    ) -> Result<JoinCircleResponse, EngineError>;
    async fn fetch_history(
        &self,
        circle_id: &CircleId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, EngineError>;
}

pub struct MissingCircleDirectory;

#[async_trait]
impl CircleDirectory for MissingCircleDirectory {
    async fn list_circles(&self, _interest: Option<&str>) -> Result<Vec<Circle>, EngineError> {
        Err(unavailable())
    }

    async fn join_circle(
        &self,
        _circle_id: &CircleId,
        _user_id: &UserId,
    ) -> Result<JoinCircleResponse, EngineError> {
        Err(unavailable())
    }

    async fn fetch_history(
        &self,
        _circle_id: &CircleId,
        _limit: u32,
    ) -> Result<Vec<MessagePayload>, EngineError> {
        Err(unavailable())
    }
}

fn unavailable() -> EngineError {
    EngineError::Network("circle directory is unavailable".into())
}

pub struct HttpCircleDirectory {
    http: Client,
    server_url: String,
    token: Option<String>,
}

impl HttpCircleDirectory {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}{CIRCLES_PATH}{suffix}", self.server_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CircleDirectory for HttpCircleDirectory {
    async fn list_circles(&self, interest: Option<&str>) -> Result<Vec<Circle>, EngineError> {
        let mut request = self.authorized(self.http.get(self.endpoint("/list")));
        if let Some(interest) = interest.filter(|tag| !tag.eq_ignore_ascii_case("all")) {
            request = request.query(&[("interest", interest)]);
        }
        let circles: Vec<Circle> = request.send().await?.error_for_status()?.json().await?;
        debug!(count = circles.len(), ?interest, "directory: listed circles");
        Ok(circles)
    }

    async fn join_circle(
        &self,
        circle_id: &CircleId,
        user_id: &UserId,
    ) -> Result<JoinCircleResponse, EngineError> {
        let response = self
            .authorized(self.http.post(self.endpoint("/join")))
            .json(&JoinCircleRequest {
                circle_id: circle_id.clone(),
                user_id: user_id.clone(),
            })
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(EngineError::Auth(format!("join rejected with {status}")));
            }
            StatusCode::NOT_FOUND => {
                return Err(JoinError::NotFound {
                    circle_id: circle_id.clone(),
                }
                .into());
            }
            StatusCode::CONFLICT => {
                return Err(JoinError::CircleFull {
                    circle_id: circle_id.clone(),
                }
                .into());
            }
            _ => {}
        }

        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&raw)
                .map(|err| err.message)
                .unwrap_or(raw);
            if status.is_server_error() {
                return Err(EngineError::Network(format!("join failed with {status}: {message}")));
            }
            return Err(JoinError::from_server_message(circle_id.clone(), &message).into());
        }

        let body: JoinCircleResponse = response.json().await?;
        if let Some(error) = body.error.as_deref() {
            warn!(circle_id = %circle_id, %error, "directory: join rejected");
            return Err(JoinError::from_server_message(circle_id.clone(), error).into());
        }
        if let Some(message) = body.message.as_deref() {
            debug!(circle_id = %circle_id, %message, "directory: join acknowledged");
        }
        Ok(body)
    }

    async fn fetch_history(
        &self,
        circle_id: &CircleId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, EngineError> {
        let messages: Vec<MessagePayload> = self
            .authorized(self.http.get(self.endpoint(&format!("/{circle_id}/messages"))))
            .query(&HistoryQuery { limit })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(circle_id = %circle_id, count = messages.len(), "directory: fetched history");
        Ok(messages)
    }
}
