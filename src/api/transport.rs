use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::decoder::EventStream;
use super::{ChatError, ChatRequest, ChatResult};
use crate::config::ClientConfig;
use crate::identity::IdentityProvider;
use crate::pending::PendingRequest;

pub const STREAM_PATH: &str = "/api/chat/stream";
pub const CHAT_PATH: &str = "/api/chat";
pub const CANCEL_PATH: &str = "/api/chat/cancel";

pub type ResponseStream = EventStream<BoxStream<'static, Result<Bytes, reqwest::Error>>>;

#[derive(Serialize)]
struct JsonBody<'a> {
    message: &'a str,
    mode: &'static str,
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    pending_id: &'a str,
}

/// HTTP side of a chat turn. Cheap to clone.
#[derive(Clone)]
pub struct TransportClient {
    client: Client,
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
}

impl TransportClient {
    pub fn new(config: ClientConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            client: Client::new(),
            config,
            identity,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a streaming turn. The returned stream is bound to the pending
    /// request's token: cancelling it abandons the connect or the read in
    /// progress.
    pub async fn open(
        &self,
        request: &ChatRequest,
        pending: &PendingRequest,
    ) -> Result<ResponseStream, ChatError> {
        let req = self.build(STREAM_PATH, request, &pending.correlation_id)?;
        let resp = send_cancellable(req, &pending.token).await?;
        let resp = check_status(resp, &pending.token).await?;

        tracing::debug!(
            correlation_id = %pending.correlation_id,
            status = resp.status().as_u16(),
            "Response stream opened"
        );
        Ok(EventStream::new(
            resp.bytes_stream().boxed(),
            pending.token.clone(),
        ))
    }

    /// Non-streaming turn: one request, one JSON answer.
    pub async fn send_once(
        &self,
        request: &ChatRequest,
        pending: &PendingRequest,
    ) -> Result<ChatResult, ChatError> {
        let req = self.build(CHAT_PATH, request, &pending.correlation_id)?;
        let resp = send_cancellable(req, &pending.token).await?;
        let resp = check_status(resp, &pending.token).await?;

        let body = tokio::select! {
            biased;
            _ = pending.token.cancelled() => return Err(ChatError::Cancelled),
            body = resp.text() => body?,
        };
        let result: ChatResult =
            serde_json::from_str(&body).map_err(|e| ChatError::Decode(e.to_string()))?;
        match result.error {
            Some(message) if !message.is_empty() => Err(ChatError::Server(message)),
            _ => Ok(result),
        }
    }

    /// Ask the server to stop the generation tagged with `correlation_id`.
    /// The response body is ignored.
    pub async fn notify_cancel(&self, correlation_id: &str) -> Result<(), ChatError> {
        let url = self
            .config
            .endpoint(&format!("{}/{}", CANCEL_PATH, correlation_id));
        let resp = self.authorize(self.client.post(url)).send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn build(
        &self,
        path: &str,
        request: &ChatRequest,
        pending_id: &str,
    ) -> Result<RequestBuilder, ChatError> {
        let req = self.client.post(self.config.endpoint(path));
        let req = if request.attachments.is_empty() {
            req.json(&JsonBody {
                message: &request.message,
                mode: request.mode.as_str(),
                session_id: &request.session_id,
                user_id: self.identity.user_id(),
                conversation_id: request.conversation_id.as_deref(),
                pending_id,
            })
        } else {
            req.multipart(multipart_form(request, pending_id)?)
        };
        Ok(self.authorize(req))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.identity.bearer_token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn multipart_form(request: &ChatRequest, pending_id: &str) -> Result<Form, ChatError> {
    let mut form = Form::new()
        .text("message", request.message.clone())
        .text("mode", request.mode.as_str())
        .text("session_id", request.session_id.clone())
        .text("pending_id", pending_id.to_string());
    if let Some(conversation_id) = &request.conversation_id {
        form = form.text("conversation_id", conversation_id.clone());
    }
    for attachment in &request.attachments {
        let part = Part::bytes(attachment.bytes.clone())
            .file_name(attachment.file_name.clone())
            .mime_str(&attachment.mime_type)?;
        form = form.part("files", part);
    }
    Ok(form)
}

async fn send_cancellable(
    req: RequestBuilder,
    token: &CancellationToken,
) -> Result<Response, ChatError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ChatError::Cancelled),
        resp = req.send() => Ok(resp?),
    }
}

/// Non-success statuses become [`ChatError::Api`] carrying the body. Reading
/// that body still yields to cancellation.
async fn check_status(resp: Response, token: &CancellationToken) -> Result<Response, ChatError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(ChatError::Cancelled),
        text = resp.text() => text.unwrap_or_default(),
    };
    Err(ChatError::Api { status, message })
}
