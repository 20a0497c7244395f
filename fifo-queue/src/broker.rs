//! Queue broker: the single coordinating process
//!
//! Holds the ordered pending-task list in memory and a table of live
//! subscriber connections. `getTask` hands out the head to exactly one
//! caller, `submitTask` appends to the tail, `notify` fans out to every
//! connected subscriber. The broker is not replicated; the operation
//! store remains the durable queue of record and a restarted broker is
//! simply re-seeded from it.

use crate::message::{Frame, Method};
use crate::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared broker state
struct BrokerState {
    /// Ordered pending task ids (head = next to hand out)
    pending: Mutex<VecDeque<String>>,

    /// Live subscriber connections, keyed by connection id
    subscribers: DashMap<Uuid, mpsc::UnboundedSender<String>>,
}

/// Queue broker
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    /// Bind the broker, seeding the pending list
    ///
    /// `seed` is the set of already-pending task ids, in the order they
    /// should be handed out (callers query the operation store for
    /// unresolved operations sorted ascending by id).
    pub async fn bind(addr: &str, seed: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind {}: {}", addr, e)))?;

        info!(addr = %listener.local_addr()?, seeded = seed.len(), "Broker listening");

        Ok(Self {
            listener,
            state: Arc::new(BrokerState {
                pending: Mutex::new(seed.into()),
                subscribers: DashMap::new(),
            }),
        })
    }

    /// Actual listen address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of tasks currently pending
    pub fn pending_len(&self) -> usize {
        self.state.pending.lock().len()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "Subscriber connected");
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handle_connection(state, stream, peer).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Broker shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Serve one subscriber connection until it closes
async fn handle_connection(state: Arc<BrokerState>, stream: TcpStream, peer: SocketAddr) {
    let connection_id = Uuid::new_v4();
    let (read_half, mut write_half) = stream.into_split();

    // Writer task: drains the outbound channel so fan-out never blocks
    // on a slow peer's socket.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    state.subscribers.insert(connection_id, outbound_tx);

    let writer = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::from_line(&line) {
                    Ok(frame) => dispatch(&state, connection_id, frame),
                    Err(e) => warn!(%peer, error = %e, "Dropping malformed frame"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Subscriber read failed");
                break;
            }
        }
    }

    // A lost connection just leaves the fan-out set; no notification
    // redelivery is attempted.
    state.subscribers.remove(&connection_id);
    writer.abort();
    debug!(%peer, "Subscriber disconnected");
}

/// Handle one request frame
fn dispatch(state: &BrokerState, connection_id: Uuid, mut frame: Frame) {
    match frame.method {
        Method::GetTask => {
            let head = state.pending.lock().pop_front();
            if let Some(id) = &head {
                debug!(task_id = %id, "Task handed out");
            }
            frame.response = head.map(Value::String);
            respond(state, connection_id, &frame);
        }
        Method::SubmitTask => {
            let Some(task_id) = frame.request_data.as_ref().and_then(Value::as_str) else {
                warn!("submitTask without a task id");
                return;
            };
            state.pending.lock().push_back(task_id.to_string());
            debug!(%task_id, "Task submitted");
            frame.response = frame.request_data.clone();
            respond(state, connection_id, &frame);
        }
        Method::Notify => {
            // Pub/sub fan-out: every live subscriber gets the frame,
            // including the sender (whose pending request resolves on
            // its own copy).
            let Ok(line) = frame.to_line() else { return };
            for subscriber in state.subscribers.iter() {
                let _ = subscriber.value().send(line.clone());
            }
        }
    }
}

/// Send a response frame back to the requesting connection
fn respond(state: &BrokerState, connection_id: Uuid, frame: &Frame) {
    let Ok(line) = frame.to_line() else { return };
    if let Some(subscriber) = state.subscribers.get(&connection_id) {
        let _ = subscriber.value().send(line);
    }
}
