//! In-memory per-run event fan-out.
//!
//! Producers (the engine, via the coordinator) publish frames without ever
//! blocking: [`EventBroker::publish`] enqueues onto an unbounded channel and
//! returns. A single listener task drains the queue and routes each frame to
//! the `tokio::sync::broadcast` sender of the frame's run, which fans out to
//! however many subscribers that run currently has.
//!
//! Slow subscribers lag on their own receiver only. A lagged receiver has
//! its oldest pending frames dropped by the broadcast channel; the stream
//! records the drop count and flags itself lossy so the consumer can fall
//! back to repository polling. Publishing to a run nobody is watching is a
//! no-op; the execution log is the canonical replay source.
//!
//! [`EventBroker::close`] travels through the same queue as frames, so every
//! frame published before the close is routed before subscribers observe
//! end-of-stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::event_bus::event::RunEvent;

/// Default per-subscriber buffer size before lag kicks in.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

enum BrokerCommand {
    Publish(RunEvent),
    Close(String),
}

#[derive(Clone)]
struct RunChannel {
    sender: broadcast::Sender<RunEvent>,
    dropped: Arc<AtomicUsize>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-run publish/subscribe hub.
pub struct EventBroker {
    ingest: flume::Sender<BrokerCommand>,
    queue: flume::Receiver<BrokerCommand>,
    channels: Arc<RwLock<FxHashMap<String, RunChannel>>>,
    capacity: usize,
    listener: Mutex<Option<ListenerState>>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBroker {
    /// Create a broker whose subscribers buffer up to `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (ingest, queue) = flume::unbounded();
        Self {
            ingest,
            queue,
            channels: Arc::new(RwLock::new(FxHashMap::default())),
            capacity: capacity.max(1),
            listener: Mutex::new(None),
        }
    }

    /// Spawn the routing task. Idempotent; requires a tokio runtime.
    pub fn start(&self) {
        let mut guard = self.listener.lock();
        if guard.is_some() {
            return;
        }

        let queue = self.queue.clone();
        let channels = Arc::clone(&self.channels);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = queue.recv_async() => match recv {
                        Err(_) => break,
                        Ok(BrokerCommand::Publish(event)) => {
                            let Some(run_id) = event.run_id().map(str::to_string) else {
                                continue;
                            };
                            let sender = {
                                let guard = channels.read();
                                guard.get(&run_id).map(|c| c.sender.clone())
                            };
                            if let Some(sender) = sender {
                                // A send error only means no receiver is
                                // currently subscribed.
                                let _ = sender.send(event);
                            }
                        }
                        Ok(BrokerCommand::Close(run_id)) => {
                            channels.write().remove(&run_id);
                        }
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Subscribe to the live stream of a run.
    ///
    /// The channel is created on first touch, so subscribing before the run
    /// produces its first frame is race-free.
    #[must_use]
    pub fn subscribe(&self, run_id: &str) -> RunEventStream {
        let channel = {
            let mut guard = self.channels.write();
            guard
                .entry(run_id.to_string())
                .or_insert_with(|| {
                    let (sender, _) = broadcast::channel(self.capacity);
                    RunChannel {
                        sender,
                        dropped: Arc::new(AtomicUsize::new(0)),
                    }
                })
                .clone()
        };
        RunEventStream {
            inner: StreamInner::Live {
                receiver: channel.sender.subscribe(),
                dropped: channel.dropped,
            },
            lossy: false,
        }
    }

    /// Enqueue a frame for fan-out. Never blocks; a frame for a run with no
    /// channel or no subscribers is dropped silently.
    pub fn publish(&self, event: RunEvent) {
        if self.ingest.send(BrokerCommand::Publish(event)).is_err() {
            tracing::warn!("event broker queue closed; dropping frame");
        }
    }

    /// Enqueue stream closure for a run. Frames published before the close
    /// are delivered first; subscribers then observe end-of-stream.
    pub fn close(&self, run_id: &str) {
        if self
            .ingest
            .send(BrokerCommand::Close(run_id.to_string()))
            .is_err()
        {
            tracing::warn!(run_id, "event broker queue closed; close dropped");
        }
    }

    /// Total frames dropped for `run_id` due to subscriber lag.
    #[must_use]
    pub fn dropped(&self, run_id: &str) -> usize {
        self.channels
            .read()
            .get(run_id)
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of live subscribers for `run_id`.
    #[must_use]
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .read()
            .get(run_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Stop the routing task.
    pub async fn stop(&self) {
        let state = self.listener.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBroker {
    fn drop(&mut self) {
        if let Some(state) = self.listener.lock().take() {
            let _ = state.shutdown_tx.send(());
            state.handle.abort();
        }
    }
}

impl std::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker")
            .field("capacity", &self.capacity)
            .field("runs", &self.channels.read().len())
            .finish()
    }
}

enum StreamInner {
    Live {
        receiver: broadcast::Receiver<RunEvent>,
        dropped: Arc<AtomicUsize>,
    },
    /// Synthesized single-frame stream for subscribers joining after the
    /// run reached a terminal state.
    Replay { frame: Option<RunEvent> },
}

/// A subscriber's view of one run's event stream.
pub struct RunEventStream {
    inner: StreamInner,
    lossy: bool,
}

impl RunEventStream {
    /// A stream that yields exactly `frame` and then ends.
    #[must_use]
    pub fn replay(frame: RunEvent) -> Self {
        Self {
            inner: StreamInner::Replay { frame: Some(frame) },
            lossy: false,
        }
    }

    /// Receive the next frame; `None` is end-of-stream.
    ///
    /// Lag is absorbed here: dropped frames are counted against the run and
    /// the stream is flagged lossy, then delivery continues with the oldest
    /// retained frame.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        match &mut self.inner {
            StreamInner::Replay { frame } => frame.take(),
            StreamInner::Live { receiver, dropped } => loop {
                match receiver.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        dropped.fetch_add(missed as usize, Ordering::Relaxed);
                        self.lossy = true;
                        tracing::warn!(
                            missed,
                            "subscriber lagged; frames dropped, stream marked lossy"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Receive with a deadline; `None` on end-of-stream or timeout.
    pub async fn next_timeout(&mut self, duration: std::time::Duration) -> Option<RunEvent> {
        tokio::time::timeout(duration, self.recv()).await.ok()?
    }

    /// Whether frames have been dropped for this subscriber. Once lossy a
    /// stream stays lossy; consumers should switch to repository polling
    /// for anything they cannot afford to miss.
    #[must_use]
    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    /// Adapt into a `futures` stream for `StreamExt` composition.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, RunEvent> {
        stream::unfold(self, |mut s| async move {
            s.recv().await.map(|event| (event, s))
        })
        .boxed()
    }
}

impl std::fmt::Debug for RunEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            StreamInner::Live { .. } => "live",
            StreamInner::Replay { .. } => "replay",
        };
        f.debug_struct("RunEventStream")
            .field("kind", &kind)
            .field("lossy", &self.lossy)
            .finish()
    }
}
