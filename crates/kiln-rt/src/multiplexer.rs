//! ---
//! kiln_section: "01-core-functionality"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Fan-in of per-source log writers onto a single reader."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Log multiplexer.
//!
//! Every writer shares one hand-off channel with a single slot, so a writer
//! returns once its chunk is deposited and the next write from any source
//! waits until the reader has taken it. Nothing is dropped or reordered
//! within a source.
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors surfaced by the multiplexer and its writers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MultiplexerError {
    /// The reader side was dropped; writes can no longer be delivered.
    #[error("log reader for source '{0}' is gone")]
    ReaderGone(String),
    /// `seal` was called; new sources cannot be registered.
    #[error("log multiplexer is sealed")]
    Sealed,
}

/// One chunk of output tagged with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Id the source was registered under.
    pub source_id: String,
    /// Raw output, not necessarily line aligned.
    pub bytes: Bytes,
}

impl LogMessage {
    /// Lossy UTF-8 view of the payload.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Writer bound to a single source id.
#[derive(Debug, Clone)]
pub struct LogWriter {
    source_id: Arc<str>,
    tx: Option<mpsc::Sender<LogMessage>>,
}

impl LogWriter {
    /// Writer that accepts and drops every chunk.
    pub fn discard() -> Self {
        Self {
            source_id: Arc::from("discard"),
            tx: None,
        }
    }

    /// Id this writer tags its output with.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Hand `chunk` to the reader, waiting while the previous chunk is still
    /// unread. Returns the number of bytes accepted.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<usize, MultiplexerError> {
        let bytes = chunk.into();
        let len = bytes.len();
        if len == 0 {
            return Ok(0);
        }
        let Some(tx) = &self.tx else {
            return Ok(len);
        };
        tx.send(LogMessage {
            source_id: self.source_id.to_string(),
            bytes,
        })
        .await
        .map_err(|_| MultiplexerError::ReaderGone(self.source_id.to_string()))?;
        trace!(source = %self.source_id, len, "log chunk delivered");
        Ok(len)
    }

    /// Write `line` followed by a newline.
    pub async fn write_line(&self, line: &str) -> Result<usize, MultiplexerError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.write(buf).await
    }
}

/// Cloneable source registrar split off a [`LogMultiplexer`].
#[derive(Debug, Clone)]
pub struct LogSources {
    tx: mpsc::Sender<LogMessage>,
}

impl LogSources {
    /// Register a new source.
    pub fn create_source(&self, source_id: impl Into<String>) -> LogWriter {
        let source_id: String = source_id.into();
        LogWriter {
            source_id: Arc::from(source_id),
            tx: Some(self.tx.clone()),
        }
    }
}

/// Fan-in point for many [`LogWriter`]s and one reader.
#[derive(Debug)]
pub struct LogMultiplexer {
    tx: Option<mpsc::Sender<LogMessage>>,
    rx: mpsc::Receiver<LogMessage>,
}

impl Default for LogMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMultiplexer {
    /// Create an open multiplexer. Its channel holds a single message, so
    /// writers wait until the consumer keeps up.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx: Some(tx), rx }
    }

    /// Register a new source. Messages written through the returned writer
    /// carry `source_id`.
    pub fn create_source(&self, source_id: impl Into<String>) -> Result<LogWriter, MultiplexerError> {
        let tx = self.tx.clone().ok_or(MultiplexerError::Sealed)?;
        let source_id: String = source_id.into();
        Ok(LogWriter {
            source_id: Arc::from(source_id),
            tx: Some(tx),
        })
    }

    /// Detached handle for registering sources while the reader is borrowed
    /// elsewhere. The reader does not finish until every handle is dropped.
    pub fn sources(&self) -> Result<LogSources, MultiplexerError> {
        let tx = self.tx.clone().ok_or(MultiplexerError::Sealed)?;
        Ok(LogSources { tx })
    }

    /// Stop registering sources. Once every outstanding writer is dropped,
    /// [`next`](Self::next) returns `None`.
    pub fn seal(&mut self) {
        self.tx = None;
    }

    /// Next message from any source.
    pub async fn next(&mut self) -> Option<LogMessage> {
        self.rx.recv().await
    }

    /// Seal the multiplexer and expose it as a stream of messages.
    pub fn into_stream(mut self) -> impl Stream<Item = LogMessage> + Send + 'static {
        self.seal();
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
    }
}
