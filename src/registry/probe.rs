use crate::model::format_endpoint;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HEALTH_PATH: &str = "/minio/health/live";
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Bounded-timeout reachability check against `address:port`.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, address: &str, port: u16) -> Result<(), ProbeError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not resolve {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("probe of {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("{endpoint} answered HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

impl ProbeError {
    pub fn endpoint(&self) -> &str {
        match self {
            ProbeError::Resolve { endpoint, .. }
            | ProbeError::Connect { endpoint, .. }
            | ProbeError::Timeout { endpoint, .. }
            | ProbeError::Status { endpoint, .. }
            | ProbeError::Malformed { endpoint, .. } => endpoint,
        }
    }
}

fn connect(address: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let endpoint = format_endpoint(address, port);
    let addrs: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|err| ProbeError::Resolve {
            endpoint: endpoint.clone(),
            reason: err.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ProbeError::Resolve {
            endpoint,
            reason: "no addresses".into(),
        });
    }
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) if err.kind() == io::ErrorKind::TimedOut => {
            Err(ProbeError::Timeout { endpoint, timeout })
        }
        Some(source) => Err(ProbeError::Connect { endpoint, source }),
        None => Err(ProbeError::Timeout { endpoint, timeout }),
    }
}

/// Plain TCP connect check.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HealthProbe for TcpProbe {
    fn probe(&self, address: &str, port: u16) -> Result<(), ProbeError> {
        connect(address, port, self.timeout).map(|_| ())
    }
}

/// `GET <path>` liveness check; only a 200 response counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpLivenessProbe {
    timeout: Duration,
    path: String,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { timeout, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for HttpLivenessProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, DEFAULT_HEALTH_PATH)
    }
}

impl HealthProbe for HttpLivenessProbe {
    fn probe(&self, address: &str, port: u16) -> Result<(), ProbeError> {
        let started = Instant::now();
        let endpoint = format_endpoint(address, port);
        let mut stream = connect(address, port, self.timeout)?;
        let remaining = self
            .timeout
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| ProbeError::Timeout {
                endpoint: endpoint.clone(),
                timeout: self.timeout,
            })?;
        let io_err = |source: io::Error| {
            if matches!(
                source.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) {
                ProbeError::Timeout {
                    endpoint: endpoint.clone(),
                    timeout: self.timeout,
                }
            } else {
                ProbeError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                }
            }
        };
        stream.set_read_timeout(Some(remaining)).map_err(io_err)?;
        stream.set_write_timeout(Some(remaining)).map_err(io_err)?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: bloomnet-probe\r\nConnection: close\r\n\r\n",
            self.path, endpoint
        );
        stream.write_all(request.as_bytes()).map_err(io_err)?;
        let status = read_status(&mut stream, &endpoint).map_err(|err| match err {
            StatusReadError::Io(source) => io_err(source),
            StatusReadError::Probe(err) => err,
        })?;
        if status == 200 {
            Ok(())
        } else {
            Err(ProbeError::Status { endpoint, status })
        }
    }
}

enum StatusReadError {
    Io(io::Error),
    Probe(ProbeError),
}

fn read_status<R: Read>(reader: &mut R, endpoint: &str) -> Result<u16, StatusReadError> {
    let malformed = |reason: String| {
        StatusReadError::Probe(ProbeError::Malformed {
            endpoint: endpoint.to_string(),
            reason,
        })
    };
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = reader.read(&mut chunk).map_err(StatusReadError::Io)?;
        if read == 0 {
            return Err(malformed("connection closed before response head".into()));
        }
        buf.extend_from_slice(&chunk[..read]);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                return response
                    .code
                    .ok_or_else(|| malformed("missing status code".into()));
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Err(malformed("response head too large".into()));
            }
            Err(err) => return Err(malformed(err.to_string())),
        }
    }
}
