use crate::backend::normalize_base_url;
use crate::protocol::{ChatRequest, ErrorBody, StreamData, STREAM_DATA_HEADER};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{status}: {message}")]
    Proxy {
        status: reqwest::StatusCode,
        message: String,
    },
}

type ClientResult<T> = Result<T, ClientError>;

/// Talks to the chat proxy's `/api/chat` route.
#[derive(Clone)]
pub struct ProxyClient {
    base_url: String,
    http: HttpClient,
}

/// A successful reply whose body has not been read yet.
pub struct ChatReply {
    stream_data: Option<StreamData>,
    event_stream: bool,
    response: reqwest::Response,
}

impl ProxyClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(),
        }
    }

    pub async fn send(&self, request: &ChatRequest) -> ClientResult<ChatReply> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Proxy {
                status,
                message: error_message(&body),
            });
        }

        let headers = response.headers();
        let stream_data = headers
            .get(STREAM_DATA_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| serde_json::from_str(value).ok());
        let event_stream = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        Ok(ChatReply {
            stream_data,
            event_stream,
            response,
        })
    }
}

impl ChatReply {
    pub fn stream_data(&self) -> Option<&StreamData> {
        self.stream_data.as_ref()
    }

    /// Feeds the reply text to `on_chunk` as it arrives; returns once the stream ends.
    pub async fn stream_text<F, Fut>(self, mut on_chunk: F) -> ClientResult<()>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut decoder = StreamDecoder::new(self.event_stream);
        let mut stream = self.response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for text in decoder.push(&chunk) {
                on_chunk(text).await;
            }
        }

        for text in decoder.finish() {
            on_chunk(text).await;
        }

        Ok(())
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error,
            details: Some(details),
        }) => format!("{} - {}", error, details),
        Ok(ErrorBody { error, .. }) => error,
        Err(_) => body.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undecided,
    EventStream,
    Raw,
}

/// Turns reply body chunks into display text.
///
/// Bodies not labelled `text/event-stream` are passed through as they
/// arrive. Labelled bodies yield their `data:` payloads once the first
/// non-blank line confirms the framing; if such a body ends without a
/// single event and carries non-SSE lines, its text is shown as is.
pub struct StreamDecoder {
    mode: Mode,
    pending: Vec<u8>,
    buffer: String,
    // Everything seen before the first event was yielded.
    unclaimed: Option<String>,
}

impl StreamDecoder {
    pub fn new(event_stream: bool) -> Self {
        Self {
            mode: if event_stream { Mode::Undecided } else { Mode::Raw },
            pending: Vec::new(),
            buffer: String::new(),
            unclaimed: Some(String::new()),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let text = take_utf8(&mut self.pending);
        self.push_text(&text)
    }

    /// Flushes whatever is left once the body ends.
    pub fn finish(&mut self) -> Vec<String> {
        let tail = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
        let mut out = self.push_text(&tail);

        let rest = std::mem::take(&mut self.buffer);
        match self.mode {
            Mode::EventStream => out.extend(extract_sse_data(&rest)),
            _ if rest.is_empty() => {}
            _ => out.push(rest),
        }

        if out.is_empty() && self.mode == Mode::EventStream {
            if let Some(seen) = self.unclaimed.take() {
                if has_foreign_line(&seen) {
                    out.push(seen);
                }
            }
        }
        out
    }

    fn push_text(&mut self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        self.buffer.push_str(text);
        if self.mode != Mode::Raw {
            if let Some(seen) = self.unclaimed.as_mut() {
                seen.push_str(text);
            }
            // Normalised on the whole buffer so a CRLF split across chunks still folds.
            if self.buffer.contains('\r') {
                self.buffer = self.buffer.replace("\r\n", "\n");
            }
        }

        if self.mode == Mode::Undecided {
            let head = self.buffer.trim_start();
            if head.is_empty() {
                return Vec::new();
            }
            match head.find('\n') {
                Some(end) => self.mode = detect_mode(&head[..end]),
                // Too short to tell; a prefix of "data:" may still be arriving.
                None if head.len() < 6 => return Vec::new(),
                None => self.mode = detect_mode(head),
            }
        }

        match self.mode {
            Mode::Raw => vec![std::mem::take(&mut self.buffer)],
            Mode::EventStream => {
                let mut out = Vec::new();
                while let Some(idx) = self.buffer.find("\n\n") {
                    let raw_event = self.buffer[..idx].to_string();
                    self.buffer = self.buffer[idx + 2..].to_string();
                    if let Some(data) = extract_sse_data(&raw_event) {
                        out.push(data);
                    }
                }
                if !out.is_empty() {
                    self.unclaimed = None;
                }
                out
            }
            Mode::Undecided => Vec::new(),
        }
    }
}

// Decodes the complete UTF-8 prefix and leaves a split trailing character in `pending`.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let rest = pending.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => String::from_utf8_lossy(&std::mem::take(pending)).into_owned(),
    }
}

fn detect_mode(line: &str) -> Mode {
    const FIELDS: [&str; 4] = ["data:", "event:", "id:", ":"];
    let line = line.trim_end_matches('\r');
    if FIELDS.iter().any(|field| line.starts_with(field)) {
        Mode::EventStream
    } else {
        Mode::Raw
    }
}

fn has_foreign_line(text: &str) -> bool {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .any(|line| !line.is_empty() && detect_mode(line) == Mode::Raw)
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    if data == "[DONE]" { None } else { Some(data) }
}
