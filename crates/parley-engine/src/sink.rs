use std::collections::{HashMap, HashSet};

use parley_core::events::{BracketRole, StreamEvent};
use parley_core::ids::BlockId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_SINK_CAPACITY: usize = 64;

/// The receiving side is gone; nothing written will be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Create a bounded event sink. `write` suspends once `capacity` events are
/// buffered and the transport has not caught up.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

/// Send-only half held by the producer of one request.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSender {
    pub async fn write(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receive-only half handed to the transport.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.rx)
    }

    /// Drain everything until the sender is dropped.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BracketKind {
    Reasoning,
    Text,
}

fn kind_of(event: &StreamEvent) -> Option<BracketKind> {
    match event {
        StreamEvent::ReasoningStart { .. }
        | StreamEvent::ReasoningDelta { .. }
        | StreamEvent::ReasoningEnd { .. } => Some(BracketKind::Reasoning),
        StreamEvent::TextStart { .. } | StreamEvent::TextDelta { .. } | StreamEvent::TextEnd { .. } => {
            Some(BracketKind::Text)
        }
        StreamEvent::ToolInputAvailable { .. }
        | StreamEvent::ToolOutputAvailable { .. }
        | StreamEvent::Metadata { .. } => None,
    }
}

/// Verifies the producer contract of an event stream: one bracket per id,
/// deltas only inside their bracket, nothing after `Metadata`.
#[derive(Debug, Default)]
pub struct BracketChecker {
    open: HashMap<BlockId, BracketKind>,
    closed: HashSet<BlockId>,
    finished: bool,
}

impl BracketChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, event: &StreamEvent) -> Result<(), String> {
        if self.finished {
            return Err(format!("{} after metadata", event.event_type()));
        }
        if let StreamEvent::Metadata { .. } = event {
            self.finished = true;
            return self.finish();
        }
        let (Some((id, role)), Some(kind)) = (event.bracket(), kind_of(event)) else {
            return Ok(());
        };
        match role {
            BracketRole::Open => {
                if self.open.contains_key(id) || self.closed.contains(id) {
                    return Err(format!("{} reopens {id}", event.event_type()));
                }
                self.open.insert(id.clone(), kind);
            }
            BracketRole::Inside => {
                if self.open.get(id) != Some(&kind) {
                    return Err(format!("{} outside its bracket for {id}", event.event_type()));
                }
            }
            BracketRole::Close => {
                if self.open.remove(id) != Some(kind) {
                    return Err(format!("{} without matching start for {id}", event.event_type()));
                }
                self.closed.insert(id.clone());
            }
        }
        Ok(())
    }

    /// Every bracket must be closed at the end of a stream.
    pub fn finish(&self) -> Result<(), String> {
        match self.open.keys().next() {
            Some(id) => Err(format!("bracket {id} left open")),
            None => Ok(()),
        }
    }

    /// Check a complete stream.
    pub fn validate(events: &[StreamEvent]) -> Result<(), String> {
        let mut checker = Self::new();
        for event in events {
            checker.check(event)?;
        }
        checker.finish()
    }
}
