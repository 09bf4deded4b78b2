//! Streaming submission sources
//!
//! One abstract async-sequence contract, [`InstructionSource`], with
//! explicit backpressure: the consumer pulls the next item only when it has
//! queue capacity for it, so a source is never asked to run ahead of the
//! device. File and in-memory sources are adapted to the contract here;
//! push-style producers go through [`ChannelSource`], whose bounded channel
//! transfers the backpressure to the sender.

use crate::error::{ControllerError, Result};
use crate::gcode::SendItem;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

/// An asynchronous sequence of submission items
///
/// `next_item` returns `Ok(None)` when the sequence is exhausted and an
/// error when the source itself fails (which aborts the stream submission).
#[async_trait]
pub trait InstructionSource: Send {
    /// Pull the next item, suspending until one is available
    async fn next_item(&mut self) -> Result<Option<SendItem>>;
}

/// In-memory source over a fixed list of items
pub struct LinesSource {
    items: VecDeque<SendItem>,
}

impl LinesSource {
    /// Source over raw textual lines
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: lines
                .into_iter()
                .map(|l| SendItem::Line(l.into()))
                .collect(),
        }
    }

    /// Source over pre-built submission items
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = SendItem>,
    {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl InstructionSource for LinesSource {
    async fn next_item(&mut self) -> Result<Option<SendItem>> {
        Ok(self.items.pop_front())
    }
}

/// Push-oriented source backed by a bounded channel
///
/// The producer holds the [`mpsc::Sender`]; `send().await` suspends once the
/// channel is full, which is how backpressure reaches push-style producers.
pub struct ChannelSource {
    rx: mpsc::Receiver<SendItem>,
}

impl ChannelSource {
    /// Create a channel source with the given buffer capacity
    pub fn channel(capacity: usize) -> (mpsc::Sender<SendItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl InstructionSource for ChannelSource {
    async fn next_item(&mut self) -> Result<Option<SendItem>> {
        Ok(self.rx.recv().await)
    }
}

/// Source reading a UTF-8 text file line by line
///
/// Lines are split on newline with the trailing newline stripped; a final
/// line without a trailing newline is still yielded, and empty lines pass
/// through unchanged.
pub struct FileSource {
    lines: Lines<BufReader<File>>,
}

impl FileSource {
    /// Open a file for streaming
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| {
            ControllerError::comm(format!("failed to open {}: {}", path.display(), e))
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

#[async_trait]
impl InstructionSource for FileSource {
    async fn next_item(&mut self) -> Result<Option<SendItem>> {
        let line = self.lines.next_line().await?;
        Ok(line.map(SendItem::Line))
    }
}
