//! Interactive access to replicas: log streams, shells and tunnels
//!
//! Every session runs as its own task and talks to the caller through
//! channels. Dropping the session handle stops the task.

use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};

use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RuntimeError;
use crate::k8s::{resources, ResourceClient};

const CHANNEL_CAPACITY: usize = 256;

/// Subprotocol of the cluster's exec websocket
pub const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;
const ERROR: u8 = 3;
const RESIZE: u8 = 4;

// ============================================================================
// Logs
// ============================================================================

/// Lines of a followed log, fed by a background task
pub struct LogStream {
    lines: mpsc::Receiver<String>,
    task: JoinHandle<()>,
}

impl LogStream {
    /// Forward `source` into a channel until it ends or the receiver is
    /// dropped.
    pub fn spawn(mut source: BoxStream<'static, std::io::Result<String>>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(line) = source.next().await {
                match line {
                    Ok(line) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Log stream ended with error: {}", e);
                        break;
                    }
                }
            }
        });
        Self { lines: rx, task }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Shell
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Status or error reported by the cluster on the error channel
    Error(String),
    Closed,
}

#[derive(Serialize)]
struct TerminalSize {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

/// Encode one client frame of the channel protocol
pub fn encode_input(input: &ShellInput) -> Vec<u8> {
    match input {
        ShellInput::Data(data) => {
            let mut frame = Vec::with_capacity(data.len() + 1);
            frame.push(STDIN);
            frame.extend_from_slice(data);
            frame
        }
        ShellInput::Resize { cols, rows } => {
            let mut frame = vec![RESIZE];
            let size = TerminalSize {
                width: *cols,
                height: *rows,
            };
            frame.extend(serde_json::to_vec(&size).unwrap_or_default());
            frame
        }
    }
}

/// Decode one server frame of the channel protocol
pub fn decode_output(frame: &[u8]) -> Option<ShellOutput> {
    let (&channel, payload) = frame.split_first()?;
    match channel {
        STDOUT => Some(ShellOutput::Stdout(payload.to_vec())),
        STDERR => Some(ShellOutput::Stderr(payload.to_vec())),
        ERROR => Some(ShellOutput::Error(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        _ => None,
    }
}

/// An interactive shell inside a replica
pub struct ShellSession {
    pub id: Uuid,
    pub input: mpsc::Sender<ShellInput>,
    pub output: mpsc::Receiver<ShellOutput>,
    task: JoinHandle<()>,
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open an exec session in `container` of `pod`
pub async fn open_exec(
    client: &ResourceClient,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &[String],
) -> Result<ShellSession, RuntimeError> {
    let mut query: Vec<(&str, &str)> = vec![
        ("container", container),
        ("stdin", "true"),
        ("stdout", "true"),
        ("stderr", "true"),
        ("tty", "true"),
    ];
    for part in command {
        query.push(("command", part.as_str()));
    }

    let locator = resources::pods().with_name_and_namespace(pod, namespace);
    let url = client.websocket_url(&locator, Some("exec"), &query)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RuntimeError::Session(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(EXEC_PROTOCOL));
    if let Some(auth) = client.connection().auth.authorization_header() {
        let value = HeaderValue::from_str(&auth).map_err(|e| RuntimeError::Session(e.to_string()))?;
        request.headers_mut().insert("Authorization", value);
    }

    client
        .connection()
        .auth
        .prepare()
        .await
        .map_err(|e| RuntimeError::Session(e.to_string()))?;

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RuntimeError::Session(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let (input_tx, mut input_rx) = mpsc::channel::<ShellInput>(CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel::<ShellOutput>(CHANNEL_CAPACITY);
    let id = Uuid::new_v4();
    let pod_name = pod.to_string();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    let Some(input) = input else { break };
                    if let Err(e) = sink.send(Message::Binary(encode_input(&input).into())).await {
                        warn!("Shell {} on {}: send failed: {}", id, pod_name, e);
                        break;
                    }
                }
                message = stream.next() => {
                    let output = match message {
                        Some(Ok(Message::Binary(frame))) => decode_output(&frame),
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = output_tx.send(ShellOutput::Closed).await;
                            break;
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => {
                            let _ = output_tx.send(ShellOutput::Error(e.to_string())).await;
                            break;
                        }
                    };
                    if let Some(output) = output {
                        if output_tx.send(output).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        let _ = sink.close().await;
        debug!("Shell {} on {} closed", id, pod_name);
    });

    Ok(ShellSession {
        id,
        input: input_tx,
        output: output_rx,
        task,
    })
}

// ============================================================================
// Tunnels
// ============================================================================

/// A reachable endpoint for a port inside a replica
#[derive(Debug)]
pub struct Tunnel {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    forwarder: Option<Child>,
}

impl Tunnel {
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            forwarder: None,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarder.is_some()
    }

    pub async fn close(mut self) {
        if let Some(child) = self.forwarder.as_mut() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop port-forward for tunnel {}: {}", self.id, e);
            }
        }
    }
}

pub const TUNNEL_BASE_PORT: u16 = 30000;
const TUNNEL_PORT_RANGE: u16 = 1000;

/// Opens tunnels either straight to the pod IP or through a local
/// `kubectl port-forward`.
pub struct TunnelOpener {
    namespace: String,
    port_forward: bool,
    next_port: AtomicU16,
}

impl TunnelOpener {
    pub fn new(namespace: impl Into<String>, port_forward: bool) -> Self {
        Self {
            namespace: namespace.into(),
            port_forward,
            next_port: AtomicU16::new(0),
        }
    }

    pub fn next_local_port(&self) -> u16 {
        TUNNEL_BASE_PORT + self.next_port.fetch_add(1, Ordering::Relaxed) % TUNNEL_PORT_RANGE
    }

    pub async fn open(&self, pod: &str, pod_ip: Option<&str>, port: u16) -> Result<Tunnel, RuntimeError> {
        if !self.port_forward {
            let ip = pod_ip.ok_or_else(|| RuntimeError::Tunnel(format!("{pod} has no IP yet")))?;
            return Ok(Tunnel::direct(ip, port));
        }

        let local = self.next_local_port();
        info!("Forwarding 127.0.0.1:{} to {}:{}", local, pod, port);
        let child = Command::new("kubectl")
            .arg("port-forward")
            .arg("-n")
            .arg(&self.namespace)
            .arg(format!("pod/{pod}"))
            .arg(format!("{local}:{port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Tunnel(format!("failed to start port-forward: {e}")))?;

        Ok(Tunnel {
            id: Uuid::new_v4(),
            host: "127.0.0.1".to_string(),
            port: local,
            forwarder: Some(child),
        })
    }
}
