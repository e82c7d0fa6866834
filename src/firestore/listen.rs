use super::models::{ListenRequest, ListenResponse, ListenStatus, TargetChangeType};
use super::snapshot::QuerySnapshot;
use super::DocumentError;
use crate::core::parse_error_response;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use reqwest::header;
use reqwest_middleware::ClientWithMiddleware;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) type SnapshotEvent = Result<QuerySnapshot, DocumentError>;

/// A standing query subscription.
///
/// Every event is the full result set at that point in time, never a delta.
/// Dropping the handle (or calling [`Subscription::cancel`]) stops the
/// background listener.
pub struct Subscription {
    receiver: mpsc::Receiver<SnapshotEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// A subscription fed by whoever holds the sender.
    pub fn from_receiver(receiver: mpsc::Receiver<SnapshotEvent>) -> Self {
        Self {
            receiver,
            task: None,
        }
    }

    /// A subscription fed by `task`, which is aborted along with the handle.
    pub fn with_task(receiver: mpsc::Receiver<SnapshotEvent>, task: JoinHandle<()>) -> Self {
        Self {
            receiver,
            task: Some(task),
        }
    }

    /// Waits for the next snapshot. `None` once the listener has stopped.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.receiver.recv().await
    }

    /// Stops the listener; same as dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A stream of `ListenResponse` messages decoded from the chunked HTTP body.
pub struct ListenStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: BytesMut,
}

impl ListenStream {
    pub fn new(inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl Stream for ListenStream {
    type Item = Result<ListenResponse, DocumentError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // 1. Try to cut a complete JSON object out of the buffer.
            if let Some((start, end)) = find_json_boundary(&self.buffer) {
                let bytes = self.buffer.split_to(end);
                match serde_json::from_slice::<ListenResponse>(&bytes[start..]) {
                    Ok(msg) => return Poll::Ready(Some(Ok(msg))),
                    Err(e) => return Poll::Ready(Some(Err(DocumentError::SerializationError(e)))),
                }
            }

            // 2. If no complete object, poll the underlying stream for more bytes.
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(DocumentError::RequestError(e))));
                }
                Poll::Ready(None) => {
                    let leftover = skip_separators(&self.buffer);
                    if leftover < self.buffer.len() {
                        return Poll::Ready(Some(Err(DocumentError::ApiError(
                            "Stream ended with incomplete JSON".into(),
                        ))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// The listen body is one long JSON array: `[{...},\n{...},\n...]`.
/// Brackets, commas and whitespace between elements are skipped.
fn skip_separators(buf: &[u8]) -> usize {
    buf.iter()
        .position(|&b| !(b.is_ascii_whitespace() || b == b',' || b == b'[' || b == b']'))
        .unwrap_or(buf.len())
}

/// Finds the byte range of the first complete JSON object in the buffer.
fn find_json_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let start = skip_separators(buf);
    if start == buf.len() || buf[start] != b'{' {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in buf.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1));
                }
            }
            _ => {}
        }
    }

    None
}

pub async fn listen_request(
    client: &ClientWithMiddleware,
    base_url: &str,
    request: &ListenRequest,
) -> Result<ListenStream, DocumentError> {
    let url = format!("{}:listen", base_url);

    let response = client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(request)?)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(DocumentError::from_failure(
            parse_error_response(response, "Listen failed").await,
        ));
    }

    let stream = stream::unfold(response, |mut resp| async move {
        match resp.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), resp)),
            Ok(None) => None,
            Err(e) => Some((Err(e), resp)),
        }
    });

    Ok(ListenStream::new(Box::pin(stream)))
}

/// Tracks whether the target's result set changed since the last emitted snapshot.
///
/// The first consistent point always emits, so subscribers get the initial
/// result set even when it is empty. The tracker outlives individual
/// streams: it keeps the latest resume token for reconnecting.
#[derive(Debug)]
pub(crate) struct ChangeTracker {
    dirty: bool,
    resume_token: Option<String>,
}

impl ChangeTracker {
    pub(crate) fn new() -> Self {
        Self {
            dirty: true,
            resume_token: None,
        }
    }

    pub(crate) fn resume_token(&self) -> Option<String> {
        self.resume_token.clone()
    }

    /// Changes may have been missed while disconnected, so the next
    /// consistent point re-reads.
    pub(crate) fn reconnected(&mut self) {
        self.dirty = true;
    }

    /// Feeds one listen event. Returns `Ok(true)` when a fresh snapshot should be read.
    pub(crate) fn observe(&mut self, response: &ListenResponse) -> Result<bool, DocumentError> {
        if response.touches_documents() {
            self.dirty = true;
        }

        let Some(change) = &response.target_change else {
            return Ok(false);
        };

        if let Some(token) = &change.resume_token {
            self.resume_token = Some(token.clone());
        }

        match change.target_change_type {
            TargetChangeType::Remove => Err(removal_error(change.cause.as_ref())),
            TargetChangeType::Reset => {
                self.dirty = true;
                Ok(false)
            }
            TargetChangeType::Current | TargetChangeType::NoChange if self.dirty => {
                self.dirty = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Maps the gRPC status of a removed target onto the document errors.
fn removal_error(cause: Option<&ListenStatus>) -> DocumentError {
    let Some(cause) = cause else {
        return DocumentError::ApiError("Listen target removed by server".into());
    };

    let message = format!("Listen target removed: {}", cause.message);
    match cause.code {
        5 => DocumentError::NotFound(message),
        7 => DocumentError::PermissionDenied(message),
        16 => DocumentError::Unauthenticated(message),
        code => DocumentError::ApiError(format!("{} (code: {})", message, code)),
    }
}
