//! A minimal NETCONF 1.0 client, as spoken by Junos devices.
//!
//! [Channel] does the framing (every message ends with `]]>]]>`) over any pair of async byte
//! streams, so it works equally well over an ssh child process or an in-memory pipe. The [rpc]
//! module builds the request bodies, and the `parse_*` functions pick the interesting parts out of
//! the replies. [NetconfSession] puts the three together as a [DeviceSession], leaving only the
//! transport (see [Transport]) to the ssh modules.
//!
//! Replies are inspected with regular expressions rather than a full XML parser. Junos replies
//! are regular enough for this, and we only ever need a handful of elements.

use crate::config::ConfigFormat;
use crate::error::{ConnectionError, RpcError};
use crate::logger::Log;
use crate::session::{CommitMode, DeviceSession, Facts};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ends every NETCONF 1.0 message.
pub const DELIMITER: &str = "]]>]]>";

/// What we tell the server we can do. Base 1.0 only, which keeps the server on end-of-message
/// framing.
pub const CLIENT_HELLO: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">"#,
    "<capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities>",
    "</hello>",
);

/// Request bodies for the calls the workflow needs.
pub mod rpc {
    use super::*;

    pub const LOCK: &str = "<lock><target><candidate/></target></lock>";
    pub const UNLOCK: &str = "<unlock><target><candidate/></target></unlock>";
    pub const DIFF: &str =
        r#"<get-configuration compare="rollback" rollback="0" format="text"/>"#;
    pub const COMMIT_CHECK: &str = "<commit-configuration><check/></commit-configuration>";
    pub const COMMIT: &str = "<commit-configuration/>";
    pub const COMMIT_FULL: &str = "<commit-configuration><full/></commit-configuration>";
    pub const ROLLBACK: &str = r#"<load-configuration rollback="0"/>"#;
    pub const SOFTWARE_INFORMATION: &str = "<get-software-information/>";
    pub const CLOSE_SESSION: &str = "<close-session/>";

    /// Builds a `<load-configuration>` request that stages `text`.
    ///
    /// XML is embedded as-is, minus any XML declaration. Text and set formats are escaped and
    /// wrapped in the element Junos expects for them.
    pub fn load(text: &str, format: ConfigFormat) -> String {
        match format {
            ConfigFormat::Xml => format!(
                r#"<load-configuration action="merge" format="xml">{}</load-configuration>"#,
                strip_declaration(text),
            ),
            ConfigFormat::Text => format!(
                concat!(
                    r#"<load-configuration action="merge" format="text">"#,
                    "<configuration-text>{}</configuration-text></load-configuration>",
                ),
                escape(text),
            ),
            ConfigFormat::Set => format!(
                concat!(
                    r#"<load-configuration action="set" format="text">"#,
                    "<configuration-set>{}</configuration-set></load-configuration>",
                ),
                escape(text),
            ),
        }
    }

    fn strip_declaration(xml: &str) -> &str {
        let xml = xml.trim_start();
        if xml.starts_with("<?xml") {
            if let Some(end) = xml.find("?>") {
                return xml[end + 2..].trim_start();
            }
        }
        xml
    }
}

/// Escapes the characters that can't appear literally in XML character data.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Reverses [escape]. Only the predefined entities are handled; Junos doesn't send others.
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("hard-coded regex is invalid"))
        }
    };
}

regex!(reply_id_re, r#"<rpc-reply\b[^>]*\bmessage-id="(\d+)""#);
regex!(rpc_error_re, r"(?s)<rpc-error\b[^>]*>(.*?)</rpc-error>");
regex!(severity_re, r"(?s)<error-severity>\s*(.*?)\s*</error-severity>");
regex!(message_re, r"(?s)<error-message\b[^>]*>\s*(.*?)\s*</error-message>");
regex!(bad_element_re, r"(?s)<bad-element>\s*(.*?)\s*</bad-element>");
regex!(output_re, r"(?s)<configuration-output>(.*?)</configuration-output>");
regex!(host_name_re, r"(?s)<host-name>\s*(.*?)\s*</host-name>");
regex!(junos_version_re, r"(?s)<junos-version>\s*(.*?)\s*</junos-version>");
regex!(package_comment_re, r"(?s)<comment>[^<\[]*\[([^\]]+)\]\s*</comment>");

/// The `message-id` of an `<rpc-reply>`, if it carries one.
pub fn reply_id(reply: &str) -> Option<u64> {
    reply_id_re()
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Returns the message of every `<rpc-error>` with severity `error`. Warnings are dropped.
pub fn errors(reply: &str) -> Vec<String> {
    rpc_error_re()
        .captures_iter(reply)
        .filter_map(|caps| {
            let body = caps.get(1)?.as_str();
            let severity = severity_re()
                .captures(body)
                .and_then(|c| c.get(1))
                .map_or("error", |m| m.as_str());
            if severity != "error" {
                return None;
            }

            let mut message = message_re()
                .captures(body)
                .and_then(|c| c.get(1))
                .map_or_else(|| "unspecified error".to_owned(), |m| unescape(m.as_str()));
            if let Some(element) = bad_element_re().captures(body).and_then(|c| c.get(1)) {
                message.push_str(&format!(" (bad element: {})", unescape(element.as_str())));
            }
            Some(message)
        })
        .collect()
}

/// Extracts the diff text from a `<get-configuration compare=...>` reply. Returns `None` when the
/// device reports no differences.
pub fn parse_diff(reply: &str) -> Option<String> {
    let output = output_re().captures(reply)?.get(1)?.as_str();
    let output = unescape(output);
    match output.trim().is_empty() {
        true => None,
        false => Some(output.trim_matches('\n').to_owned()),
    }
}

/// Extracts identity facts from a `<get-software-information>` reply.
pub fn parse_facts(reply: &str) -> Facts {
    fn first(re: &Regex, reply: &str) -> Option<String> {
        re.captures(reply)
            .and_then(|c| c.get(1))
            .map(|m| unescape(m.as_str()))
    }

    let hostname = first(host_name_re(), reply).unwrap_or_else(|| "unknown".into());
    let version = first(junos_version_re(), reply)
        .or_else(|| first(package_comment_re(), reply))
        .unwrap_or_else(|| "unknown".into());
    Facts { hostname, version }
}

/// A NETCONF 1.0 message channel.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: R,
    writer: W,

    /// Bytes received but not yet returned as a message.
    buffer: Vec<u8>,

    next_message_id: u64,

    /// Applies to each [Channel::rpc] call.
    timeout: Duration,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Exchanges hello messages with the server and returns a ready channel along with the
    /// server's hello.
    pub async fn establish(
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Result<(Self, String), RpcError> {
        let mut channel = Channel {
            reader,
            writer,
            buffer: Vec::new(),
            next_message_id: 1,
            timeout,
        };

        let hello = tokio::time::timeout(timeout, async {
            channel.send(CLIENT_HELLO).await?;
            channel.receive().await
        })
        .await
        .map_err(|_| RpcError::Timeout(timeout))??;

        if !hello.contains("<hello") {
            let found = errors(&hello);
            return Err(match found.is_empty() {
                true => RpcError::Transport(format!("expected a hello message, got: {hello}")),
                false => RpcError::Remote(found.join("; ")),
            });
        }
        Ok((channel, hello))
    }

    /// Writes one framed message.
    pub async fn send(&mut self, message: &str) -> Result<(), RpcError> {
        let write = async {
            self.writer.write_all(message.as_bytes()).await?;
            self.writer.write_all(DELIMITER.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Reads up to the next delimiter and returns the message, without the delimiter.
    pub async fn receive(&mut self) -> Result<String, RpcError> {
        let mut chunk = [0u8; 8192];

        // Everything before this offset is known not to start a delimiter.
        let mut scanned = 0;
        loop {
            if let Some(offset) = find(&self.buffer[scanned..], DELIMITER.as_bytes()) {
                let end = scanned + offset;
                let message: Vec<u8> = self.buffer.drain(..end + DELIMITER.len()).collect();
                let message = String::from_utf8_lossy(&message[..end]);
                return Ok(message.trim().to_owned());
            }
            scanned = self.buffer.len().saturating_sub(DELIMITER.len() - 1);

            let read = self
                .reader
                .read(&mut chunk)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?;
            if read == 0 {
                return Err(RpcError::Transport("session closed by the device".into()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Sends `body` as an RPC and waits for the reply, using the channel's default timeout.
    ///
    /// Returns the raw reply. A reply carrying any error-severity `<rpc-error>` becomes
    /// [RpcError::Remote].
    pub async fn rpc(&mut self, body: &str) -> Result<String, RpcError> {
        let timeout = self.timeout;
        self.rpc_with_timeout(body, timeout).await
    }

    /// Like [Channel::rpc], but with an explicit timeout.
    ///
    /// Replies numbered below this request answer earlier requests that timed out. They are
    /// discarded, so a late reply is never taken as the answer to a later call.
    pub async fn rpc_with_timeout(
        &mut self,
        body: &str,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let id = self.next_message_id;
        self.next_message_id += 1;
        let message = format!(
            r#"<rpc xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="{id}">{body}</rpc>"#
        );

        let reply = tokio::time::timeout(timeout, async {
            self.send(&message).await?;
            loop {
                let reply = self.receive().await?;
                if reply_id(&reply).map_or(true, |answered| answered >= id) {
                    return Ok::<_, RpcError>(reply);
                }
            }
        })
        .await
        .map_err(|_| RpcError::Timeout(timeout))??;

        let found = errors(&reply);
        match found.is_empty() {
            true => Ok(reply),
            false => Err(RpcError::Remote(found.join("; "))),
        }
    }

    /// Returns the underlying streams.
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// Tears down whatever carries a [Channel], once the NETCONF session on it has ended.
#[async_trait]
pub trait Transport: Send {
    async fn shutdown(self) -> Result<(), RpcError>;
}

/// A [DeviceSession] that speaks NETCONF over a [Channel], whatever the transport underneath.
pub struct NetconfSession<R, W, T> {
    host: String,
    facts: Facts,
    channel: Channel<R, W>,
    transport: T,
}

impl<R, W, T> NetconfSession<R, W, T>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    T: Transport,
{
    /// Exchanges hellos over `reader` and `writer`, then asks the device who it is.
    ///
    /// If the device doesn't cooperate, `transport` is shut down before the error is returned.
    pub async fn start(
        host: &str,
        reader: R,
        writer: W,
        transport: T,
        timeout: Duration,
        log: &Log,
    ) -> Result<Self, ConnectionError> {
        match Self::handshake(host, reader, writer, timeout, log).await {
            Ok((channel, facts)) => Ok(NetconfSession {
                host: host.to_owned(),
                facts,
                channel,
                transport,
            }),
            Err(error) => {
                if let Err(shutdown_error) = transport.shutdown().await {
                    log.debug(format!("{host}: {shutdown_error}"));
                }
                Err(ConnectionError::Rejected {
                    host: host.to_owned(),
                    message: error.to_string(),
                })
            }
        }
    }

    async fn handshake(
        host: &str,
        reader: R,
        writer: W,
        timeout: Duration,
        log: &Log,
    ) -> Result<(Channel<R, W>, Facts), RpcError> {
        let (mut channel, hello) = Channel::establish(reader, writer, timeout).await?;
        log.debug(format!("{host} hello: {hello}"));
        let reply = channel.rpc(rpc::SOFTWARE_INFORMATION).await?;
        Ok((channel, parse_facts(&reply)))
    }
}

#[async_trait]
impl<R, W, T> DeviceSession for NetconfSession<R, W, T>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    T: Transport,
{
    fn host(&self) -> &str {
        &self.host
    }

    fn facts(&self) -> &Facts {
        &self.facts
    }

    async fn lock(&mut self) -> Result<(), RpcError> {
        self.channel.rpc(rpc::LOCK).await.map(drop)
    }

    async fn load(&mut self, text: &str, format: ConfigFormat) -> Result<(), RpcError> {
        self.channel.rpc(&rpc::load(text, format)).await.map(drop)
    }

    async fn diff(&mut self) -> Result<Option<String>, RpcError> {
        let reply = self.channel.rpc(rpc::DIFF).await?;
        Ok(parse_diff(&reply))
    }

    async fn commit_check(&mut self) -> Result<(), RpcError> {
        self.channel.rpc(rpc::COMMIT_CHECK).await.map(drop)
    }

    async fn commit(&mut self, mode: CommitMode) -> Result<(), RpcError> {
        let reply = match mode {
            CommitMode::Standard => self.channel.rpc(rpc::COMMIT).await,
            CommitMode::Full { timeout } => {
                self.channel.rpc_with_timeout(rpc::COMMIT_FULL, timeout).await
            }
        };
        reply.map(drop)
    }

    async fn rollback(&mut self) -> Result<(), RpcError> {
        self.channel.rpc(rpc::ROLLBACK).await.map(drop)
    }

    async fn unlock(&mut self) -> Result<(), RpcError> {
        self.channel.rpc(rpc::UNLOCK).await.map(drop)
    }

    async fn close(self) -> Result<(), RpcError> {
        let NetconfSession {
            mut channel,
            transport,
            ..
        } = self;

        // Junos answers <close-session/> and then hangs up its end of the channel.
        let said_goodbye = channel.rpc(rpc::CLOSE_SESSION).await;

        // Dropping the channel closes our end, in case the device didn't hang up.
        drop(channel);
        transport.shutdown().await?;
        said_goodbye.map(drop)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
