//! The consensus context: one task that owns the engine.
//!
//! Network and VM callbacks never touch the engine directly; they post
//! an [`EngineEvent`] onto the context's channel, and the runner task
//! applies events one at a time. Per-sender ordering of the channel
//! gives the engine its serialisation guarantee without any locking
//! inside the consensus state.

#[cfg(test)]
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Transitive;
use crate::sender::NodeId;
use crate::vertex::VertexId;

/// Default channel depth before senders feel backpressure.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default interval between gossip ticks.
pub const DEFAULT_GOSSIP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Everything the outside world can tell the engine.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    PushQuery {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
        bytes: Vec<u8>,
    },
    PullQuery {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    },
    Chits {
        peer: NodeId,
        request_id: u32,
        votes: Vec<VertexId>,
    },
    QueryFailed {
        peer: NodeId,
        request_id: u32,
    },
    Put {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
        bytes: Vec<u8>,
    },
    Get {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    },
    GetFailed {
        peer: NodeId,
        request_id: u32,
    },
    GetAncestors {
        peer: NodeId,
        request_id: u32,
        vertex_id: VertexId,
    },
    MultiPut {
        peer: NodeId,
        request_id: u32,
        vertices: Vec<Vec<u8>>,
    },
    GetAcceptedFrontier {
        peer: NodeId,
        request_id: u32,
    },
    GetAccepted {
        peer: NodeId,
        request_id: u32,
        vertex_ids: Vec<VertexId>,
    },
    /// The host's bootstrap decision: the network's accepted set.
    ForceAccepted {
        vertex_ids: Vec<VertexId>,
    },
    /// The VM has transactions waiting to be issued.
    PendingTxs,
}

/// Handle used by the network and VM layers to reach the context.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Post an event; awaits only when the context is backlogged.
    pub async fn send(&self, event: EngineEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Post an event without awaiting; fails when the context is
    /// backlogged or gone. Callers treat a failed send like a dropped
    /// network message.
    pub fn try_send(&self, event: EngineEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Owns the engine and drains its event channel until cancelled, the
/// channel closes, or the engine reports a fatal error.
pub struct Runner {
    engine: Transitive,
    events: mpsc::Receiver<EngineEvent>,
    shutdown: CancellationToken,
    gossip_interval: std::time::Duration,
}

impl Runner {
    pub fn new(engine: Transitive, shutdown: CancellationToken) -> (Self, EngineHandle) {
        let (tx, events) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        (
            Runner {
                engine,
                events,
                shutdown,
                gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            },
            EngineHandle { tx },
        )
    }

    pub fn with_gossip_interval(mut self, interval: std::time::Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Run until shutdown. Returns the engine (for inspection) and its
    /// fatal error, if one stopped it.
    pub async fn run(mut self) -> Transitive {
        let mut gossip = tokio::time::interval(self.gossip_interval);
        gossip.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("consensus context shutting down");
                    break;
                }
                _ = gossip.tick() => {
                    self.engine.gossip();
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.dispatch(event) {
                                tracing::error!(error = %e, "engine entered fatal state");
                                break;
                            }
                        }
                        None => {
                            tracing::info!("event channel closed; consensus context exiting");
                            break;
                        }
                    }
                }
            }
        }
        self.engine
    }

    fn dispatch(&mut self, event: EngineEvent) -> Result<(), crate::engine::EngineError> {
        match event {
            EngineEvent::PushQuery {
                peer,
                request_id,
                vertex_id,
                bytes,
            } => self.engine.push_query(peer, request_id, vertex_id, &bytes),
            EngineEvent::PullQuery {
                peer,
                request_id,
                vertex_id,
            } => self.engine.pull_query(peer, request_id, vertex_id),
            EngineEvent::Chits {
                peer,
                request_id,
                votes,
            } => self.engine.chits(peer, request_id, votes),
            EngineEvent::QueryFailed { peer, request_id } => {
                self.engine.query_failed(peer, request_id)
            }
            EngineEvent::Put {
                peer,
                request_id,
                vertex_id,
                bytes,
            } => self.engine.put(peer, request_id, vertex_id, &bytes),
            EngineEvent::Get {
                peer,
                request_id,
                vertex_id,
            } => {
                self.engine.get(peer, request_id, vertex_id);
                Ok(())
            }
            EngineEvent::GetFailed { peer, request_id } => {
                self.engine.get_failed(peer, request_id)
            }
            EngineEvent::GetAncestors {
                peer,
                request_id,
                vertex_id,
            } => {
                self.engine.get_ancestors(peer, request_id, vertex_id);
                Ok(())
            }
            EngineEvent::MultiPut {
                peer,
                request_id,
                vertices,
            } => self.engine.multi_put(peer, request_id, vertices),
            EngineEvent::GetAcceptedFrontier { peer, request_id } => {
                self.engine.get_accepted_frontier(peer, request_id);
                Ok(())
            }
            EngineEvent::GetAccepted {
                peer,
                request_id,
                vertex_ids,
            } => {
                self.engine.get_accepted(peer, request_id, vertex_ids);
                Ok(())
            }
            EngineEvent::ForceAccepted { vertex_ids } => self.engine.force_accepted(vertex_ids),
            EngineEvent::PendingTxs => self.engine.notify_pending_txs(),
        }
    }
}
