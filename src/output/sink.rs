use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};

use super::{JsonSerializer, Message};
use crate::Result;

/// Destination of the ordered message stream.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: Message) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON message per line to stdout.
///
/// Output is flushed after every STATE message so a consumer never sees a
/// checkpoint before the records it covers.
pub struct StdoutSink {
    out: BufWriter<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: BufWriter::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    async fn send(&mut self, message: Message) -> Result<()> {
        let mut line = JsonSerializer::serialize(&message)?;
        line.push('\n');
        self.out.write_all(line.as_bytes()).await?;
        if matches!(message, Message::State { .. }) {
            self.out.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Vec<Message>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn take(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Record bodies emitted for `stream`, in order.
    pub fn records(&self, stream: &str) -> Vec<&serde_json::Map<String, serde_json::Value>> {
        self.messages
            .iter()
            .filter_map(|message| match message {
                Message::Record {
                    stream: s, record, ..
                } if s == stream => Some(record),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.messages.push(message);
        Ok(())
    }
}
