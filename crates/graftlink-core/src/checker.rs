use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::upstream::{Destination, Upstream, UpstreamError};

/// Result of an upstream connectivity/latency check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub upstream: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Split `http://host[:port]/path` into its parts.
fn parse_http_url(url: &str) -> Result<(Destination, String, String), UpstreamError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| UpstreamError::InvalidTarget(format!("only http:// probes are supported: {}", url)))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let target = if authority.contains(':') {
        authority.parse::<Destination>()?
    } else {
        Destination::Domain(authority.to_string(), 80)
    };
    Ok((target, authority.to_string(), path.to_string()))
}

/// Status codes that count as success for `path`. Pages named like
/// `generate_204` must return exactly that code.
fn status_accepted(path: &str, status: u16) -> bool {
    let last = path.rsplit('/').next().unwrap_or("");
    if let Some(code) = last.strip_prefix("generate_") {
        if let Ok(expected) = code.parse::<u16>() {
            return status == expected;
        }
    }
    (200..400).contains(&status)
}

async fn fetch_status<U: Upstream + ?Sized>(upstream: &U, url: &str) -> Result<(u16, String), UpstreamError> {
    let (target, host, path) = parse_http_url(url)?;
    let mut stream = upstream.dial_tcp(&target).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: graftlink\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    // Only the status line is needed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while head.len() < 1024 && !head.ends_with(b"\r\n") {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        head.push(byte[0]);
    }

    let line = String::from_utf8_lossy(&head);
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| UpstreamError::ProtocolError(format!("bad HTTP status line: {:?}", line.trim_end())))?;
    Ok((status, path))
}

/// Fetch `url` through `upstream` and report whether it answered as expected.
pub async fn probe<U: Upstream + ?Sized>(upstream: &U, url: &str, timeout: Duration) -> CheckResult {
    let start = Instant::now();

    match tokio::time::timeout(timeout, fetch_status(upstream, url)).await {
        Ok(Ok((status, path))) => {
            let latency = start.elapsed().as_millis() as u64;
            let reachable = status_accepted(&path, status);
            CheckResult {
                upstream: upstream.name().to_string(),
                reachable,
                latency_ms: Some(latency),
                status: Some(status),
                error: if reachable {
                    None
                } else {
                    Some(format!("unexpected status {}", status))
                },
            }
        }
        Ok(Err(e)) => CheckResult {
            upstream: upstream.name().to_string(),
            reachable: false,
            latency_ms: None,
            status: None,
            error: Some(format!("connection failed: {}", e)),
        },
        Err(_) => CheckResult {
            upstream: upstream.name().to_string(),
            reachable: false,
            latency_ms: None,
            status: None,
            error: Some("connection timed out".to_string()),
        },
    }
}
