//! Command channel to the supervised game server.
//!
//! The game server answers in-band queries on its own port: one
//! line-delimited JSON request in, one line-delimited JSON response out,
//! per connection. The watchdog uses it for the startup handshake, health
//! probes, and in-band commands (graceful reboot and shutdown).
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "identify", "token": "..."}
//! {"command": "health", "token": "..."}
//! {"command": "reboot", "token": "..."}
//! {"command": "shutdown", "token": "..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "reboot_count": 3}
//! {"ok": false, "error": "bad token"}
//! ```
//!
//! Every exchange is bounded by a single timeout; no response within it,
//! or a malformed response, is a [`AppError::Topic`] — callers treat that
//! as "unhealthy", never as a watchdog crash.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{AppError, Result};

/// In-band command verbs the game server understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopicCommand {
    /// Startup handshake; confirms the process is serving and owns the
    /// session access token.
    Identify,
    /// Liveness probe; the reply carries the world reboot counter.
    Health,
    /// Ask the world to perform a graceful in-game reboot.
    Reboot,
    /// Ask the world to shut itself down cleanly.
    Shutdown,
}

/// Outbound command-channel request.
#[derive(Debug, Serialize)]
struct TopicRequest<'a> {
    /// Command verb.
    command: TopicCommand,
    /// Session access token.
    token: &'a str,
}

/// Inbound command-channel response.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicResponse {
    /// Whether the server accepted the command.
    pub ok: bool,
    /// Monotonic count of in-game reboots since process start.
    #[serde(default)]
    pub reboot_count: Option<u64>,
    /// Error detail when `ok` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// Synchronous, timeout-bounded request/response client for one session's
/// command channel.
#[derive(Debug, Clone)]
pub struct TopicClient {
    host: String,
    port: u16,
    token: String,
    timeout: Duration,
}

impl TopicClient {
    /// Create a client for the given endpoint and access token.
    #[must_use]
    pub fn new(host: String, port: u16, token: String, timeout: Duration) -> Self {
        Self {
            host,
            port,
            token,
            timeout,
        }
    }

    /// Host this client connects to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this client connects to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Access token this client authenticates with.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Perform one request/response exchange.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Topic` on connect failure, timeout, a malformed
    /// reply, or a reply with `ok: false`.
    pub async fn send(&self, command: TopicCommand) -> Result<TopicResponse> {
        let response = tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| {
                AppError::Topic(format!(
                    "no response to {command:?} within {:?}",
                    self.timeout
                ))
            })??;

        if response.ok {
            Ok(response)
        } else {
            Err(AppError::Topic(format!(
                "{command:?} rejected: {}",
                response.error.as_deref().unwrap_or("no detail")
            )))
        }
    }

    async fn exchange(&self, command: TopicCommand) -> Result<TopicResponse> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| AppError::Topic(format!("connect to {addr} failed: {err}")))?;

        let (read_half, mut write_half) = stream.into_split();

        let request = TopicRequest {
            command,
            token: &self.token,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|err| AppError::Topic(format!("request encode failed: {err}")))?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Topic(format!("request write failed: {err}")))?;

        let mut reply = String::new();
        let mut reader = BufReader::new(read_half);
        let read = reader
            .read_line(&mut reply)
            .await
            .map_err(|err| AppError::Topic(format!("response read failed: {err}")))?;
        if read == 0 {
            return Err(AppError::Topic("connection closed without response".into()));
        }

        debug!(?command, reply = reply.trim(), "topic exchange");
        serde_json::from_str(reply.trim())
            .map_err(|err| AppError::Topic(format!("malformed response: {err}")))
    }
}
