//! Single broker connection: a negotiated framed stream driven by an actor
//! task, with one in-flight request at a time.
//!
//! The protocol has no correlation ids, so a response frame always belongs to
//! the oldest unanswered command. Callers serialize through `call`, which
//! holds an async mutex for the duration of the exchange; fire-and-forget
//! commands bypass the mutex via `cast`.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::error::RiverqError;
use crate::negotiate::Transport;
use crate::protocol::{Command, Frame, FrameCodec, InboundMessage};

pub(crate) enum Outbound {
    Call(Command, oneshot::Sender<Result<Frame, RiverqError>>),
    Cast(Command),
    Ping(oneshot::Sender<()>),
}

/// Handle to a live broker connection
#[derive(Debug)]
pub struct Connection {
    address: String,
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Outbound>,
    in_flight: Mutex<()>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap a negotiated stream in an actor task. Message frames are forwarded
    /// to `delivery` when present; producer connections pass `None` and any
    /// stray message frame is logged and dropped.
    pub(crate) fn spawn(
        address: String,
        id: u64,
        framed: Framed<Transport, FrameCodec>,
        request_timeout: Duration,
        delivery: Option<mpsc::UnboundedSender<InboundMessage>>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            address: address.clone(),
            id,
            cmd_tx,
            in_flight: Mutex::new(()),
            request_timeout,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(connection_loop(address, id, framed, cmd_rx, delivery));
        conn
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a command and wait for the broker's frame
    pub async fn call(&self, command: Command) -> Result<Frame, RiverqError> {
        let _guard = self.in_flight.lock().await;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Outbound::Call(command, tx))
            .map_err(|_| RiverqError::connection(format!("{} is closed", self.address)))?;
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RiverqError::connection(format!(
                "{} closed mid-request",
                self.address
            ))),
            Err(_) => {
                // The response, if it ever arrives, would be misattributed to
                // the next command; this connection must not be reused.
                self.close();
                Err(RiverqError::timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }

    /// Send a command without waiting for a response
    pub fn cast(&self, command: Command) -> Result<(), RiverqError> {
        self.cmd_tx
            .send(Outbound::Cast(command))
            .map_err(|_| RiverqError::connection(format!("{} is closed", self.address)))
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cmd_tx.is_closed()
    }

    /// Liveness probe used by the pool before handing the connection out.
    /// The actor must flush a NOP onto the socket within the request timeout;
    /// an ack that never comes means the connection is wedged or gone.
    pub async fn validate(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Outbound::Ping(tx)).is_err() {
            return false;
        }
        matches!(timeout(self.request_timeout, rx).await, Ok(Ok(())))
    }

    /// Mark closed and let the actor drain out. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.cmd_tx.send(Outbound::Cast(Command::Close));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

async fn connection_loop(
    address: String,
    id: u64,
    mut framed: Framed<Transport, FrameCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<Outbound>,
    delivery: Option<mpsc::UnboundedSender<InboundMessage>>,
) {
    let mut pending: Option<oneshot::Sender<Result<Frame, RiverqError>>> = None;

    loop {
        tokio::select! {
            outbound = cmd_rx.recv() => {
                match outbound {
                    Some(Outbound::Call(command, reply)) => {
                        if let Err(e) = framed.send(command).await {
                            let _ = reply.send(Err(e));
                            break;
                        }
                        pending = Some(reply);
                    }
                    Some(Outbound::Cast(command)) => {
                        let closing = matches!(command, Command::Close);
                        if framed.send(command).await.is_err() {
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Outbound::Ping(ack)) => {
                        if framed.send(Command::Nop).await.is_err() {
                            break;
                        }
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) if frame.is_heartbeat() => {
                        debug!(address = %address, id, "heartbeat");
                        if framed.send(Command::Nop).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Message(msg))) => {
                        match &delivery {
                            Some(tx) => {
                                let inbound =
                                    InboundMessage::from_frame(msg, address.clone(), id);
                                if tx.send(inbound).is_err() {
                                    debug!(address = %address, id, "delivery channel closed");
                                    break;
                                }
                            }
                            None => {
                                warn!(address = %address, id, "message frame on non-subscribed connection");
                            }
                        }
                    }
                    Some(Ok(frame)) => {
                        match pending.take() {
                            Some(reply) => {
                                let _ = reply.send(Ok(frame));
                            }
                            None => {
                                warn!(address = %address, id, ?frame, "unsolicited frame");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(address = %address, id, error = %e, "read error");
                        if let Some(reply) = pending.take() {
                            let _ = reply.send(Err(e));
                        }
                        break;
                    }
                    None => {
                        debug!(address = %address, id, "stream closed by peer");
                        break;
                    }
                }
            }
        }
    }

    if let Some(reply) = pending.take() {
        let _ = reply.send(Err(RiverqError::connection(format!("{address} closed"))));
    }
    debug!(address = %address, id, "connection loop exited");
}
