//! Queue client: submitter and worker roles over one connection
//!
//! A background read task routes every inbound frame: responses are
//! matched to in-flight requests by `requestId`, and `taskCompleted`
//! notifications resolve an explicit per-task wait-map so a submitter
//! can park on one operation without a global event bus.

use crate::message::{Frame, Method, EVENT_TASK_COMPLETED};
use crate::{Error, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Builds the apply future for a dequeued task id
///
/// The provider is the actual apply routine; a returned error marks a
/// rejected apply, never a queue fault.
pub type TaskProvider = Arc<
    dyn Fn(String) -> BoxFuture<'static, std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Frame routing state shared with the read task
struct ClientInner {
    /// In-flight requests awaiting a response, by correlation id
    responses: DashMap<String, oneshot::Sender<Frame>>,

    /// One-shot completion signals, by task id
    completions: DashMap<String, oneshot::Sender<String>>,
}

/// Queue client
#[derive(Clone)]
pub struct QueueClient {
    outbound: mpsc::UnboundedSender<String>,
    inner: Arc<ClientInner>,
}

impl QueueClient {
    /// Connect to the broker and spawn the read/write tasks
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("connect {}: {}", addr, e)))?;
        let (read_half, mut write_half) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let inner = Arc::new(ClientInner {
            responses: DashMap::new(),
            completions: DashMap::new(),
        });

        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Broker connection write failed");
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if !line.trim().is_empty() => match Frame::from_line(&line) {
                        Ok(frame) => route_frame(&reader_inner, frame),
                        Err(e) => warn!(error = %e, "Dropping malformed frame"),
                    },
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!("Broker connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Broker connection read failed");
                        break;
                    }
                }
            }
            // Fail any request still in flight so callers can retry.
            reader_inner.responses.clear();
        });

        Ok(Self { outbound, inner })
    }

    /// Submitter role: append a task id to the broker's pending list
    pub async fn submit_task(&self, task_id: &str) -> Result<()> {
        self.send_request(Method::SubmitTask, Some(Value::String(task_id.to_string())))
            .await?;
        Ok(())
    }

    /// Worker role: pop the next pending task id, if any
    pub async fn get_task(&self) -> Result<Option<String>> {
        let response = self.send_request(Method::GetTask, None).await?;
        Ok(response
            .response
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Fan an event out to every connected subscriber
    pub async fn notify(&self, event: &str, data: Value) -> Result<()> {
        // The broker broadcasts the notify frame to everyone including
        // the sender, so our own copy doubles as the acknowledgement.
        let frame = Frame::notification(event, data);
        self.send_frame(frame).await?;
        Ok(())
    }

    /// Register a one-shot completion signal for a task id
    ///
    /// The returned receiver resolves when a matching `taskCompleted`
    /// notification arrives. No timeout is applied here; callers that
    /// cannot wait indefinitely should race it against one and fall
    /// back to polling operation status.
    pub fn subscribe_completion(&self, task_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.inner.completions.insert(task_id.to_string(), tx);
        rx
    }

    /// Worker role: drain the queue forever
    ///
    /// Polls `getTask`, runs the provider for each returned id, then
    /// announces `taskCompleted`. An empty queue is a no-op; a failed
    /// task is logged and the loop continues.
    pub async fn clear_queue(
        &self,
        task_provider: TaskProvider,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            match self.get_task().await {
                Ok(Some(task_id)) => {
                    debug!(%task_id, "Task received");
                    if let Err(e) = task_provider(task_id.clone()).await {
                        warn!(%task_id, error = %e, "Task apply failed");
                    }
                    if let Err(e) = self
                        .notify(EVENT_TASK_COMPLETED, Value::String(task_id.clone()))
                        .await
                    {
                        warn!(%task_id, error = %e, "Completion notification failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "getTask failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Send a request frame and await the broker's response
    async fn send_request(&self, method: Method, data: Option<Value>) -> Result<Frame> {
        self.send_frame(Frame::request(method, data)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<Frame> {
        let request_id = frame.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.responses.insert(request_id.clone(), tx);

        let line = frame.to_line()?;
        if self.outbound.send(line).is_err() {
            self.inner.responses.remove(&request_id);
            return Err(Error::Connection("broker connection closed".to_string()));
        }

        rx.await.map_err(|_| Error::ResponseDropped(request_id))
    }
}

/// Route one inbound frame to its waiter
fn route_frame(inner: &ClientInner, frame: Frame) {
    if frame.method == Method::Notify {
        if frame.notify_event() == Some(EVENT_TASK_COMPLETED) {
            if let Some(task_id) = frame.notify_data().and_then(Value::as_str) {
                if let Some((_, waiter)) = inner.completions.remove(task_id) {
                    let _ = waiter.send(task_id.to_string());
                }
            }
        }
        // A notify we sent ourselves is echoed back with our requestId;
        // resolve the pending send as its acknowledgement.
    }
    if let Some((_, waiter)) = inner.responses.remove(&frame.request_id) {
        let _ = waiter.send(frame);
    }
}
