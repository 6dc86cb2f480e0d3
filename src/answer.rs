//! Streaming consumer for the answer-generation endpoint.
//!
//! The response body is handed out chunk by chunk as it arrives; nothing is buffered
//! beyond the chunk being returned.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::base_url;
use crate::error::{AppError, AppResult};

pub const RETRIEVAL_PATH: &str = "/api/ai/retrieval";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user<S: Into<String>>(content: S) -> Self { Self { role: "user".into(), content: content.into() } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub messages: Vec<ChatMessage>,
}

type ChunkStream = Pin<Box<dyn Stream<Item = AppResult<Bytes>> + Send>>;

/// Single-consumer view of one in-progress answer.
///
/// `pull` yields each chunk, then `Ok(None)` once, then `Err(StreamExhausted)` on every
/// further call. After a transport error the stream is finished as well.
pub struct AnswerStream {
    inner: Option<ChunkStream>,
    delivered: usize,
}

impl fmt::Debug for AnswerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerStream").field("finished", &self.inner.is_none()).field("delivered", &self.delivered).finish()
    }
}

impl AnswerStream {
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        let mapped = stream.map(|item| item.map_err(|e| AppError::transport(e.to_string())));
        Self { inner: Some(Box::pin(mapped)), delivered: 0 }
    }

    pub async fn pull(&mut self) -> AppResult<Option<Bytes>> {
        let Some(stream) = self.inner.as_mut() else { return Err(AppError::StreamExhausted); };
        loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => {
                    self.delivered += chunk.len();
                    return Ok(Some(chunk));
                }
                Some(Err(e)) => {
                    warn!(target: "answer", delivered = self.delivered, error = %e, "answer stream interrupted");
                    self.inner = None;
                    return Err(e);
                }
                None => {
                    debug!(target: "answer", delivered = self.delivered, "answer stream complete");
                    self.inner = None;
                    return Ok(None);
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool { self.inner.is_none() }

    /// Bytes handed out so far.
    pub fn delivered(&self) -> usize { self.delivered }

    /// Release the underlying transport without draining it.
    pub fn close(&mut self) { self.inner = None; }

    /// Adapt into a body stream for proxying: chunks in order, ends after the first error.
    pub fn into_body_stream(self) -> impl Stream<Item = AppResult<Bytes>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut s = state?;
            match s.pull().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(s))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[derive(Clone)]
pub struct AnswerClient {
    endpoint: Url,
    client: reqwest::Client,
}

impl AnswerClient {
    pub fn new(base: &str, client: reqwest::Client) -> AppResult<Self> {
        let endpoint = base_url(base, "generation service")?
            .join(RETRIEVAL_PATH.trim_start_matches('/'))
            .map_err(|e| AppError::config(format!("invalid generation URL '{}': {}", base, e)))?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url { &self.endpoint }

    /// Issue the request and return as soon as response headers arrive.
    pub async fn open(&self, request: &AnswerRequest) -> AppResult<AnswerStream> {
        let resp = self.client.post(self.endpoint.clone()).json(request).send().await.map_err(|e| {
            warn!(target: "answer", error = %e, "answer request failed to send");
            AppError::transport(e.to_string())
        })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(target: "answer", status = status.as_u16(), "answer service rejected request");
            return Err(AppError::UpstreamError { status: status.as_u16() });
        }
        debug!(target: "answer", messages = request.messages.len(), "answer stream opened");
        Ok(AnswerStream::from_stream(resp.bytes_stream()))
    }
}
