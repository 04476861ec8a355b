//! TCP transport for the remote metadata service
//!
//! Each message is one frame: `u32 length | u32 crc32c | JSON body`, both
//! integers little-endian. A request body is
//! `{"service": .., "event": .., "payload": ..}`; the response body is
//! `{"result": ..}` or `{"error": ".."}`. One request is in flight per
//! session at a time.

use crate::rpc::{Connector, Session};
use crc32c::crc32c;
use mastermind_common::{AddressFamily, RemoteEndpoint, RpcError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const FRAME_HEADER_LEN: usize = 8;

/// Default frame size limit (64 MB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {0}")]
    LengthInvalid(String),
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

/// Encode one frame around `payload`
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len())
        .map_err(|_| FrameError::LengthInvalid("frame length exceeds u32".to_string()))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame
pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_frame_bytes: usize,
) -> Result<(), FrameError> {
    let frame = encode_frame(payload, max_frame_bytes)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and verify its checksum
pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length == 0 {
        return Err(FrameError::LengthInvalid(
            "frame length cannot be zero".to_string(),
        ));
    }
    if length > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: length,
        });
    }
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let got = crc32c(&body);
    if got != expected {
        return Err(FrameError::CrcMismatch { expected, got });
    }
    Ok(body)
}

/// Request body sent to the remote
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response body sent back by the remote
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Result(Value),
    Error(String),
}

/// Connects to remotes over TCP
#[derive(Clone, Debug)]
pub struct TcpConnector {
    service: String,
    max_frame_bytes: usize,
}

impl TcpConnector {
    /// Connector addressing the remote application `service`
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// Resolve an endpoint, keeping only addresses of its family
pub fn resolve(endpoint: &RemoteEndpoint) -> Result<Vec<SocketAddr>, RpcError> {
    let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| RpcError::Connection(format!("cannot resolve {endpoint}: {e}")))?
        .filter(|addr| match endpoint.family {
            AddressFamily::Inet => addr.is_ipv4(),
            AddressFamily::Inet6 => addr.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(RpcError::Connection(format!(
            "{endpoint} has no address of family {}",
            endpoint.family
        )));
    }
    Ok(addrs)
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, RpcError> {
        let mut last_error = None;
        for addr in resolve(endpoint)? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| RpcError::Connection(e.to_string()))?;
                    debug!("Opened TCP session to {} ({})", endpoint, addr);
                    return Ok(Arc::new(TcpSession {
                        stream: Mutex::new(stream),
                        alive: AtomicBool::new(true),
                        service: self.service.clone(),
                        max_frame_bytes: self.max_frame_bytes,
                    }));
                }
                Err(e) => last_error = Some(format!("{addr}: {e}")),
            }
        }
        Err(RpcError::Connection(
            last_error.unwrap_or_else(|| format!("cannot connect to {endpoint}")),
        ))
    }
}

/// One TCP connection to a remote
pub struct TcpSession {
    stream: Mutex<TcpStream>,
    alive: AtomicBool,
    service: String,
    max_frame_bytes: usize,
}

/// Stream view that spends one deadline across every read and write
///
/// Each operation gets the time left until `deadline` as its socket
/// timeout, so a remote trickling bytes cannot stretch the exchange.
struct DeadlineStream<'a> {
    stream: &'a mut TcpStream,
    deadline: Instant,
}

impl DeadlineStream<'_> {
    fn remaining(&self) -> std::io::Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(std::io::Error::new(
                ErrorKind::TimedOut,
                "call deadline elapsed",
            ));
        }
        Ok(left)
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let left = self.remaining()?;
        self.stream.set_read_timeout(Some(left))?;
        self.stream.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let left = self.remaining()?;
        self.stream.set_write_timeout(Some(left))?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl TcpSession {
    fn exchange(
        &self,
        stream: &mut TcpStream,
        event: &str,
        payload: &Value,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Response, RpcError> {
        let request = Request {
            service: self.service.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        let body =
            serde_json::to_vec(&request).map_err(|e| RpcError::Transport(e.to_string()))?;

        let mut bounded = DeadlineStream { stream, deadline };
        write_frame(&mut bounded, &body, self.max_frame_bytes)
            .and_then(|()| read_frame(&mut bounded, self.max_frame_bytes))
            .map_err(|e| frame_error(event, timeout, e))
            .and_then(|body| {
                serde_json::from_slice(&body)
                    .map_err(|e| RpcError::Transport(format!("malformed response: {e}")))
            })
    }
}

impl Session for TcpSession {
    fn call(&self, event: &str, payload: &Value, timeout: Duration) -> Result<Value, RpcError> {
        if !self.is_alive() {
            return Err(RpcError::Transport("session is closed".into()));
        }
        let deadline = Instant::now() + timeout;
        let Some(mut stream) = self.stream.try_lock_until(deadline) else {
            return Err(RpcError::Timeout {
                event: event.to_string(),
                timeout,
            });
        };
        match self.exchange(&mut stream, event, payload, deadline, timeout) {
            Ok(Response::Result(value)) => Ok(value),
            Ok(Response::Error(message)) => Err(RpcError::Remote(message)),
            Err(e) => {
                // A late response would desynchronize the stream
                self.alive.store(false, Ordering::SeqCst);
                let _ = stream.shutdown(std::net::Shutdown::Both);
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn frame_error(event: &str, timeout: Duration, e: FrameError) -> RpcError {
    match e {
        FrameError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            RpcError::Timeout {
                event: event.to_string(),
                timeout,
            }
        }
        other => RpcError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    /// Serve `replies` in order on one accepted connection, echoing the
    /// request event back for inspection
    fn serve(replies: Vec<Option<Response>>) -> (SocketAddr, thread::JoinHandle<Vec<Request>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for reply in replies {
                let body = read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap();
                seen.push(serde_json::from_slice::<Request>(&body).unwrap());
                match reply {
                    Some(response) => {
                        let body = serde_json::to_vec(&response).unwrap();
                        write_frame(&mut stream, &body, DEFAULT_MAX_FRAME_BYTES).unwrap();
                    }
                    // Stay silent so the client times out
                    None => thread::sleep(Duration::from_millis(300)),
                }
            }
            seen
        });
        (addr, handle)
    }

    fn endpoint(addr: SocketAddr) -> RemoteEndpoint {
        RemoteEndpoint::new(addr.ip().to_string(), addr.port())
    }

    #[test]
    fn test_frame_roundtrip_validates_crc() {
        let frame = encode_frame(b"{\"result\":1}", 1024).unwrap();
        let body = read_frame(&mut Cursor::new(frame.clone()), 1024).unwrap();
        assert_eq!(body, b"{\"result\":1}");

        let mut corrupted = frame;
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let err = read_frame(&mut Cursor::new(corrupted), 1024).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
    }

    #[test]
    fn test_frame_limits() {
        let err = encode_frame(&[0u8; 10], 5).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));

        let frame = encode_frame(&[0u8; 10], 1024).unwrap();
        let err = read_frame(&mut Cursor::new(frame), 5).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));

        let err = read_frame(&mut Cursor::new(vec![0u8; 8]), 1024).unwrap_err();
        assert!(matches!(err, FrameError::LengthInvalid(_)));
    }

    #[test]
    fn test_call_over_tcp() {
        let (addr, server) = serve(vec![
            Some(Response::Result(json!([[1, 2, 3]]))),
            Some(Response::Error("unknown event".into())),
        ]);

        let connector = TcpConnector::new("mastermind2");
        let session = connector
            .connect(&endpoint(addr), Duration::from_secs(1))
            .unwrap();

        let value = session
            .call("fetch-bad-groups", &Value::Null, Duration::from_secs(1))
            .unwrap();
        assert_eq!(value, json!([[1, 2, 3]]));

        let err = session
            .call("fetch-nothing", &json!({"x": 1}), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
        assert!(session.is_alive());

        let seen = server.join().unwrap();
        assert_eq!(seen[0].service, "mastermind2");
        assert_eq!(seen[0].event, "fetch-bad-groups");
        assert_eq!(seen[1].payload, json!({"x": 1}));
    }

    #[test]
    fn test_timeout_closes_session() {
        let (addr, server) = serve(vec![None]);

        let connector = TcpConnector::new("mastermind2");
        let session = connector
            .connect(&endpoint(addr), Duration::from_secs(1))
            .unwrap();

        let err = session
            .call("fetch-bad-groups", &Value::Null, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(!session.is_alive());

        let err = session
            .call("fetch-bad-groups", &Value::Null, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        server.join().unwrap();
    }

    #[test]
    fn test_trickling_response_hits_call_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).unwrap();
            let body = serde_json::to_vec(&Response::Result(json!([[1, 2, 3]]))).unwrap();
            let frame = encode_frame(&body, DEFAULT_MAX_FRAME_BYTES).unwrap();
            // One byte per interval, each well inside the call timeout
            for byte in frame {
                if stream.write_all(&[byte]).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        });

        let session = TcpConnector::new("mastermind2")
            .connect(&endpoint(addr), Duration::from_secs(1))
            .unwrap();
        let started = Instant::now();
        let err = session
            .call("fetch-bad-groups", &Value::Null, Duration::from_millis(300))
            .unwrap_err();

        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.is_alive());
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::new("mastermind2")
            .connect(&endpoint(addr), Duration::from_millis(200))
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[test]
    fn test_resolve_filters_family() {
        let ep = RemoteEndpoint::with_family("127.0.0.1", 80, AddressFamily::Inet6);
        assert!(resolve(&ep).is_err());
        let ep = RemoteEndpoint::new("127.0.0.1", 80);
        assert_eq!(resolve(&ep).unwrap().len(), 1);
    }
}
