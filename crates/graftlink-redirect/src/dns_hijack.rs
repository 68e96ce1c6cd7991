use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use graftlink_core::mapping::AddressTable;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

/// Answer produced for a hijacked query.
#[derive(Debug)]
pub struct Hijacked {
    pub response: Vec<u8>,
    /// Domain and fake address whose real address should be looked up.
    pub resolve: Option<(String, Ipv4Addr)>,
}

/// Parse `payload` as a standard DNS query carrying at least one question.
pub fn parse_query(payload: &[u8]) -> Option<Message> {
    let message = Message::from_bytes(payload).ok()?;
    if message.message_type() != MessageType::Query
        || message.op_code() != OpCode::Query
        || message.queries().is_empty()
    {
        return None;
    }
    Some(message)
}

pub fn is_dns_query(payload: &[u8]) -> bool {
    parse_query(payload).is_some()
}

fn domain_of(name: &Name) -> String {
    name.to_ascii().trim_end_matches('.').to_ascii_lowercase()
}

fn response_for(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::NoError);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// Answer A and AAAA queries locally with reserved-range addresses.
///
/// A queries get the fake address with a short TTL; AAAA queries get an
/// empty NOERROR answer so clients fall back to A. Any other query type is
/// left alone (`None`).
pub fn hijack(payload: &[u8], table: &AddressTable, ttl: u32) -> Option<Hijacked> {
    let request = parse_query(payload)?;
    let query = request.queries().first()?;
    let domain = domain_of(query.name());
    if domain.is_empty() {
        return None;
    }

    let mut response = response_for(&request);
    let resolve = match query.query_type() {
        RecordType::A => {
            let fake = table.alloc_projection(&domain);
            response.add_answer(Record::from_rdata(
                query.name().clone(),
                ttl,
                RData::A(hickory_proto::rr::rdata::A(fake)),
            ));
            Some((domain, fake))
        }
        RecordType::AAAA => {
            table.alloc_projection(&domain);
            None
        }
        _ => return None,
    };

    match response.to_bytes() {
        Ok(response) => Some(Hijacked { response, resolve }),
        Err(e) => {
            tracing::debug!(error = %e, "failed to encode hijacked DNS response");
            None
        }
    }
}

static QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Look up the first A record for `domain` at `resolver`.
pub async fn resolve_a(domain: &str, resolver: SocketAddr, timeout: Duration) -> std::io::Result<Option<Ipv4Addr>> {
    let name = Name::from_ascii(domain)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut message = Message::new();
    let id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));
    let data = message
        .to_bytes()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let bind: SocketAddr = match resolver {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(resolver).await?;
    socket.send(&data).await?;

    let mut buf = vec![0u8; 4096];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let n = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "DNS query timed out"))??;
        let Ok(reply) = Message::from_bytes(&buf[..n]) else {
            continue;
        };
        if reply.id() != id {
            continue;
        }
        return Ok(reply.answers().iter().find_map(|answer| match answer.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        }));
    }
}

/// Resolve `domain` for real and remember the address behind `fake`.
pub async fn learn_real_ip(
    table: &AddressTable,
    domain: &str,
    fake: Ipv4Addr,
    resolver: SocketAddr,
    timeout: Duration,
) {
    match resolve_a(domain, resolver, timeout).await {
        Ok(Some(real)) => {
            tracing::trace!(domain, fake = %fake, real = %real, "learned real address");
            table.set_real_ip(fake, IpAddr::V4(real));
        }
        Ok(None) => tracing::debug!(domain, "resolver returned no A record"),
        Err(e) => tracing::debug!(domain, error = %e, "real address lookup failed"),
    }
}
