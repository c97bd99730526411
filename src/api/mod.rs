pub mod decoder;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Tutor persona the server answers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    English,
    Chamorro,
    Learn,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::English => "english",
            Mode::Chamorro => "chamorro",
            Mode::Learn => "learn",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "english" => Ok(Mode::English),
            "chamorro" => Ok(Mode::Chamorro),
            "learn" => Ok(Mode::Learn),
            other => Err(format!("Unknown mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self, ChatError> {
        let bytes = tokio::fs::read(path).await.map_err(ChatError::Attachment)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = guess_mime(&file_name).to_string();
        Ok(Self {
            file_name,
            mime_type,
            bytes,
        })
    }
}

fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// One user turn as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub mode: Mode,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// A reference the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Source {
    Reference {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        page: Option<u32>,
    },
    Name(String),
}

/// Application-level events carried in the response stream, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Metadata {
        #[serde(default)]
        sources: Vec<Source>,
        #[serde(default)]
        used_rag: bool,
        #[serde(default)]
        used_web_search: bool,
    },
    Chunk {
        content: String,
    },
    Done {
        #[serde(default)]
        response_time: f64,
    },
    Cancelled {
        #[serde(default)]
        content: Option<String>,
    },
    Error {
        #[serde(default)]
        content: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done { .. } | StreamEvent::Cancelled { .. } | StreamEvent::Error { .. }
        )
    }
}

/// Body of a non-streaming answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub response: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub used_rag: bool,
    #[serde(default)]
    pub used_web_search: bool,
    #[serde(default)]
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Request cancelled")]
    Cancelled,
    #[error("Cancelled by server: {0}")]
    ServerCancelled(String),
    #[error("{0}")]
    Server(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Attachment error: {0}")]
    Attachment(std::io::Error),
}

impl ChatError {
    /// Cancellation takes its own path and is never shown as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled | ChatError::ServerCancelled(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Http(_) | ChatError::Api { .. } | ChatError::Server(_) | ChatError::Decode(_)
        )
    }
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
