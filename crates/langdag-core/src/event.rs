use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::workflow::WorkflowNodeKind;

/// Default capacity of the bounded event queue.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Events emitted while a prompt or continuation is in flight.
///
/// Exactly one `Start`, any number of `Delta`s, then exactly one terminal
/// `NodeSaved` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    Start {
        /// Id of the user node created for this turn.
        user_node_id: String,
    },
    Delta {
        text: String,
    },
    NodeSaved {
        node_id: String,
    },
    Error {
        error: String,
    },
}

impl ConversationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NodeSaved { .. } | Self::Error { .. })
    }
}

/// Events emitted while a workflow run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeStarted {
        node_id: String,
        kind: WorkflowNodeKind,
    },
    NodeDelta {
        node_id: String,
        text: String,
    },
    NodeComplete {
        node_id: String,
        output: serde_json::Value,
    },
    Error {
        node_id: Option<String>,
        error: String,
        root_id: String,
    },
    Done {
        output: serde_json::Value,
        root_id: String,
    },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}

/// Producer half of a bounded event queue.
///
/// `send` waits for capacity; events are never dropped. It returns `false`
/// once the consumer has gone away.
pub struct EventSender<E> {
    tx: mpsc::Sender<E>,
    cancel: CancellationToken,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E: Send> EventSender<E> {
    pub async fn send(&self, event: E) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the worker at each suspension point.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a bounded event queue, carrying the cancellation token
/// for the worker feeding it.
pub struct EventStream<E> {
    rx: mpsc::Receiver<E>,
    cancel: CancellationToken,
}

impl<E> EventStream<E> {
    /// Receive the next event. `None` once the worker has finished.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Ask the worker to stop. It will emit a terminal error and exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl<E> futures::Stream for EventStream<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Create a bounded event queue. `cancel` is usually a child of an
/// engine-wide token.
pub fn channel<E>(capacity: usize, cancel: CancellationToken) -> (EventSender<E>, EventStream<E>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            cancel: cancel.clone(),
        },
        EventStream { rx, cancel },
    )
}
