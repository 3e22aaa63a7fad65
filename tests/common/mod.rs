//! Test doubles: a scriptable in-process broker speaking the wire protocol
//! and an in-memory lookup transport.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use riverq_client::{LookupResponse, LookupTransport, RiverqError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

/// Installs the test log subscriber; later calls are no-ops
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Error(String),
}

#[derive(Default)]
struct ReplyPlan {
    queue: VecDeque<Reply>,
    default: Option<Reply>,
}

impl ReplyPlan {
    fn next(&mut self) -> Reply {
        self.queue
            .pop_front()
            .or_else(|| self.default.clone())
            .unwrap_or(Reply::Ok)
    }
}

struct BrokerState {
    commands: Mutex<Vec<String>>,
    pub_plan: Mutex<ReplyPlan>,
    mpub_plan: Mutex<ReplyPlan>,
    /// Overrides the MPUB plan for batches of exactly this size
    mpub_fail_size: Mutex<Option<(usize, String)>>,
    sub_error: Mutex<Option<String>>,
    to_deliver: Mutex<VecDeque<Bytes>>,
    next_message_id: AtomicU64,
}

/// In-process broker: accepts real TCP connections, answers the handshake,
/// and replies to commands according to the scripted plans.
pub struct MockBroker {
    pub host: String,
    pub port: u16,
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub async fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState {
            commands: Mutex::new(Vec::new()),
            pub_plan: Mutex::new(ReplyPlan::default()),
            mpub_plan: Mutex::new(ReplyPlan::default()),
            mpub_fail_size: Mutex::new(None),
            sub_error: Mutex::new(None),
            to_deliver: Mutex::new(VecDeque::new()),
            next_message_id: AtomicU64::new(1),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(serve_connection(stream, state));
            }
        });

        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            state,
        }
    }

    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Every command line received, in arrival order across connections
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    pub fn commands_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Make every PUB fail with the given broker code
    pub fn always_fail_pub(&self, code: &str) {
        self.state.pub_plan.lock().default = Some(Reply::Error(code.to_string()));
    }

    /// Fail the next `n` PUBs, then succeed
    pub fn fail_next_pubs(&self, code: &str, n: usize) {
        let mut plan = self.state.pub_plan.lock();
        for _ in 0..n {
            plan.queue.push_back(Reply::Error(code.to_string()));
        }
    }

    /// Fail every MPUB whose batch holds exactly `size` payloads
    pub fn fail_mpub_of_size(&self, size: usize, code: &str) {
        *self.state.mpub_fail_size.lock() = Some((size, code.to_string()));
    }

    /// Reject subscriptions with the given broker code
    pub fn reject_sub(&self, code: &str) {
        *self.state.sub_error.lock() = Some(code.to_string());
    }

    /// Queue a message for delivery once a subscriber sends READY credit
    pub fn enqueue_message<B: Into<Bytes>>(&self, body: B) {
        self.state.to_deliver.lock().push_back(body.into());
    }

    pub async fn wait_for_command(&self, prefix: &str) -> bool {
        for _ in 0..100 {
            if self.commands().iter().any(|c| c.starts_with(prefix)) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        false
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, state: Arc<BrokerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).await.is_err() || &magic != b"  V2" {
        return;
    }

    let mut subscribed = false;
    loop {
        let mut line = Vec::new();
        match tokio::io::AsyncBufReadExt::read_until(&mut reader, b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).to_string();
        let verb = text.split(' ').next().unwrap_or("").to_string();

        match verb.as_str() {
            "IDENTIFY" => {
                if read_body(&mut reader).await.is_none() {
                    return;
                }
                state.commands.lock().push(text);
                if write_response(&mut write_half, b"OK").await.is_err() {
                    return;
                }
            }
            "PUB" => {
                if read_body(&mut reader).await.is_none() {
                    return;
                }
                state.commands.lock().push(text);
                let reply = state.pub_plan.lock().next();
                if write_reply(&mut write_half, reply).await.is_err() {
                    return;
                }
            }
            "MPUB" => {
                let Some(count) = read_mpub_body(&mut reader).await else {
                    return;
                };
                state.commands.lock().push(format!("{text} count={count}"));
                let reply = match *state.mpub_fail_size.lock() {
                    Some((size, ref code)) if size == count => Reply::Error(code.clone()),
                    _ => state.mpub_plan.lock().next(),
                };
                if write_reply(&mut write_half, reply).await.is_err() {
                    return;
                }
            }
            "SUB" => {
                state.commands.lock().push(text);
                let rejection = state.sub_error.lock().clone();
                match rejection {
                    Some(code) => {
                        if write_error(&mut write_half, &code).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        subscribed = true;
                        if write_response(&mut write_half, b"OK").await.is_err() {
                            return;
                        }
                    }
                }
            }
            "RDY" => {
                state.commands.lock().push(text.clone());
                let credit: u32 = text
                    .split(' ')
                    .nth(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if subscribed && credit > 0 {
                    loop {
                        let body = state.to_deliver.lock().pop_front();
                        match body {
                            Some(body) => {
                                let id = state.next_message_id.fetch_add(1, Ordering::Relaxed);
                                if write_message(&mut write_half, id, &body).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            "FIN" | "REQ" | "TOUCH" => {
                state.commands.lock().push(text);
            }
            "NOP" => {}
            "CLS" => {
                state.commands.lock().push(text);
                let _ = write_response(&mut write_half, b"CLOSE_WAIT").await;
                return;
            }
            _ => return,
        }
    }
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<u8>> {
    let len = reader.read_u32().await.ok()? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.ok()?;
    Some(body)
}

/// Reads an MPUB body and returns the payload count
async fn read_mpub_body(reader: &mut BufReader<OwnedReadHalf>) -> Option<usize> {
    let total = reader.read_u32().await.ok()? as usize;
    let mut body = vec![0u8; total];
    reader.read_exact(&mut body).await.ok()?;
    if body.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize)
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame_type: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_u32(4 + payload.len() as u32).await?;
    writer.write_u32(frame_type).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn write_response(writer: &mut OwnedWriteHalf, body: &[u8]) -> std::io::Result<()> {
    write_frame(writer, 0, body).await
}

async fn write_error(writer: &mut OwnedWriteHalf, code: &str) -> std::io::Result<()> {
    write_frame(writer, 1, format!("{code} rejected").as_bytes()).await
}

async fn write_message(writer: &mut OwnedWriteHalf, id: u64, body: &[u8]) -> std::io::Result<()> {
    let mut payload = Vec::with_capacity(26 + body.len());
    payload.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(format!("{id:016}").as_bytes());
    payload.extend_from_slice(body);
    write_frame(writer, 2, &payload).await
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: Reply) -> std::io::Result<()> {
    match reply {
        Reply::Ok => write_response(writer, b"OK").await,
        Reply::Error(code) => write_error(writer, &code).await,
    }
}

/// In-memory lookup transport. Each topic holds a sequence of documents; the
/// last one repeats once the sequence is exhausted.
pub struct MemoryLookup {
    topics: Mutex<HashMap<String, TopicPlan>>,
}

struct TopicPlan {
    responses: Vec<serde_json::Value>,
    next: usize,
}

impl MemoryLookup {
    pub fn new() -> Arc<Self> {
        init_logging();
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// One fixed document for a topic
    pub fn set_topic(&self, topic: &str, document: serde_json::Value) {
        self.set_topic_sequence(topic, vec![document]);
    }

    /// Documents returned in order across lookups, last one repeating
    pub fn set_topic_sequence(&self, topic: &str, documents: Vec<serde_json::Value>) {
        self.topics.lock().insert(
            topic.to_string(),
            TopicPlan {
                responses: documents,
                next: 0,
            },
        );
    }
}

#[async_trait]
impl LookupTransport for MemoryLookup {
    async fn lookup(
        &self,
        _endpoint: &str,
        topic: &str,
        _writable: bool,
    ) -> Result<LookupResponse, RiverqError> {
        let mut topics = self.topics.lock();
        let plan = topics.get_mut(topic).ok_or_else(|| RiverqError::TopicNotFound {
            topic: topic.to_string(),
        })?;
        let index = plan.next.min(plan.responses.len() - 1);
        plan.next += 1;
        let document = plan.responses[index].clone();
        serde_json::from_value(document).map_err(|e| RiverqError::lookup(e.to_string()))
    }
}

/// Lookup document with a numbered partition per broker
pub fn partitioned_doc(brokers: &[(String, u16)]) -> serde_json::Value {
    let partitions: serde_json::Map<String, serde_json::Value> = brokers
        .iter()
        .enumerate()
        .map(|(i, (host, port))| {
            (
                i.to_string(),
                serde_json::json!({
                    "broadcast_address": host,
                    "tcp_port": port,
                    "version": "1.0"
                }),
            )
        })
        .collect();
    serde_json::json!({
        "partitions": partitions,
        "producers": [],
        "meta": {"partition_num": brokers.len()}
    })
}

/// Lookup document with only a flat producers list
pub fn producers_doc(brokers: &[(String, u16)]) -> serde_json::Value {
    let producers: Vec<serde_json::Value> = brokers
        .iter()
        .map(|(host, port)| {
            serde_json::json!({
                "broadcast_address": host,
                "tcp_port": port,
                "version": "1.0"
            })
        })
        .collect();
    serde_json::json!({
        "partitions": {},
        "producers": producers
    })
}
