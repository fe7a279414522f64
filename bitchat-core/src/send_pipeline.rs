//! Single-writer per-peer FIFO send queue.
//!
//! All outbound sends for a peer go through one queue so a user rapidly
//! tapping "send" can't produce duplicates, out-of-order delivery status,
//! or interleaved handshakes. One task per peer, spawned lazily on first
//! send and driven per conversation rather than per radio link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{Error, Result};
use crate::message::{fresh_message_id, DeliveryStatus, Message};
use crate::PeerAddress;

/// Called once the pipeline has produced and locally inserted a message,
/// with the seam into the encryption/transport layer. Returns without
/// awaiting delivery — later delivery/read updates arrive out of band.
pub type EmitCallback = Box<dyn FnOnce(&str, &str, Option<&str>, &str) + Send>;

/// A queued outbound send.
pub struct SendRequest {
    pub content: String,
    pub peer_addr: PeerAddress,
    pub recipient_nickname: Option<String>,
    pub sender_nickname: Option<String>,
    pub my_peer_addr: PeerAddress,
    pub emit_callback: EmitCallback,
}

/// Receives the message the pipeline produces, so it becomes visible to the
/// UI immediately rather than waiting on the emit callback. Implemented by
/// whatever owns the conversation state (normally [`crate::conversation::ConversationEngine`]).
pub trait ConversationSink: Send + Sync {
    fn insert_outbound(&self, peer_addr: &str, msg: Message);
}

struct PeerQueue {
    tx: mpsc::UnboundedSender<SendRequest>,
}

/// Per-peer FIFO send queue. Concurrent peers are served in parallel;
/// within one peer, sends are strictly sequential.
pub struct SendPipeline<C: ConversationSink + 'static> {
    queues: Mutex<HashMap<PeerAddress, PeerQueue>>,
    sink: Arc<C>,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl<C: ConversationSink + 'static> SendPipeline<C> {
    pub fn new(sink: Arc<C>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            sink,
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueues `req`, spawning a per-peer worker task on first use.
    /// Fails with `ShuttingDown` once `shutdown` has been called.
    pub async fn enqueue(&self, req: SendRequest) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(req.peer_addr.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            spawn_worker(rx, Arc::clone(&self.sink), Arc::clone(&self.shutdown_notify));
            PeerQueue { tx }
        });
        queue
            .tx
            .send(req)
            .map_err(|_| Error::PersistenceFailure("send worker gone".into()))
    }

    /// Stops accepting new sends. In-flight requests already taken off the
    /// queue are allowed to finish; their `emit_callback` still runs.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }
}

fn spawn_worker<C: ConversationSink + 'static>(
    mut rx: mpsc::UnboundedReceiver<SendRequest>,
    sink: Arc<C>,
    shutdown_notify: Arc<Notify>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                req = rx.recv() => {
                    match req {
                        Some(req) => process(req, &sink),
                        None => break,
                    }
                }
                _ = shutdown_notify.notified() => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(req) = rx.try_recv() {
                        process(req, &sink);
                    }
                    break;
                }
            }
        }
    });
}

fn process<C: ConversationSink>(req: SendRequest, sink: &Arc<C>) {
    let msg = Message {
        id: fresh_message_id(),
        sender_display: req.sender_nickname.clone().unwrap_or_else(|| req.my_peer_addr.clone()),
        content: req.content.clone(),
        timestamp: now_millis(),
        is_private: true,
        recipient_nickname: req.recipient_nickname.clone(),
        sender_peer_address: None,
        delivery_status: DeliveryStatus::Sending,
        encrypted_blob: None,
    };
    sink.insert_outbound(&req.peer_addr, msg.clone());
    (req.emit_callback)(&req.content, &req.peer_addr, req.recipient_nickname.as_deref(), &msg.id);
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        inserted: StdMutex<Vec<(String, String)>>,
    }
    impl ConversationSink for RecordingSink {
        fn insert_outbound(&self, peer_addr: &str, msg: Message) {
            self.inserted.lock().unwrap().push((peer_addr.to_string(), msg.id));
        }
    }

    #[tokio::test]
    async fn sends_to_one_peer_are_processed_in_order() {
        let sink = Arc::new(RecordingSink {
            inserted: StdMutex::new(Vec::new()),
        });
        let pipeline = SendPipeline::new(Arc::clone(&sink));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let done_tx = done_tx.clone();
            pipeline
                .enqueue(SendRequest {
                    content: format!("msg{i}"),
                    peer_addr: "A".to_string(),
                    recipient_nickname: None,
                    sender_nickname: None,
                    my_peer_addr: "me".to_string(),
                    emit_callback: Box::new(move |_, _, _, _| {
                        let _ = done_tx.send(());
                    }),
                })
                .await
                .unwrap();
        }
        drop(done_tx);
        for _ in 0..5 {
            done_rx.recv().await;
        }

        let inserted = sink.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 5);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let sink = Arc::new(RecordingSink {
            inserted: StdMutex::new(Vec::new()),
        });
        let pipeline = SendPipeline::new(sink);
        pipeline.shutdown();
        let result = pipeline
            .enqueue(SendRequest {
                content: "hi".to_string(),
                peer_addr: "A".to_string(),
                recipient_nickname: None,
                sender_nickname: None,
                my_peer_addr: "me".to_string(),
                emit_callback: Box::new(|_, _, _, _| {}),
            })
            .await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }
}
