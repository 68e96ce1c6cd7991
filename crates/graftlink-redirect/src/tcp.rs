use std::io;
use std::time::Duration;

use graftlink_core::upstream::Destination;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::RedirectError;
use crate::redirector::Context;

/// Handle one redirected TCP connection: recover its target from the
/// synthetic local address, dial the upstream and relay until both sides close.
pub(crate) async fn handle_connection(stream: TcpStream, ctx: &Context) -> Result<(), RedirectError> {
    let local = stream.local_addr()?;
    if !local.ip().is_loopback() {
        return Err(RedirectError::NotLoopback(local));
    }

    let target = ctx
        .table
        .get_projection(local.ip())
        .ok_or(RedirectError::TargetNotFound(local))?;
    let dest: Destination = target.parse()?;

    let outbound = tokio::time::timeout(ctx.settings.redirect.dial_timeout(), ctx.upstream.dial_tcp(&dest))
        .await
        .map_err(|_| RedirectError::DialTimeout(dest.to_string()))??;
    tracing::debug!(dest = %dest, upstream = ctx.upstream.name(), "relaying TCP connection");

    stream.set_nodelay(true)?;
    relay(stream, outbound, ctx.settings.redirect.tcp_linger()).await?;
    Ok(())
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let n = tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(n)
}

/// Copy both directions between `a` and `b`.
///
/// When one direction reaches EOF its writer is shut down, propagating the
/// half-close, and the other direction gets `linger` to finish. Running out
/// of linger time is not an error.
pub async fn relay<A, B>(a: A, b: B, linger: Duration) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = copy_then_shutdown(&mut a_read, &mut b_write);
    let b_to_a = copy_then_shutdown(&mut b_read, &mut a_write);
    tokio::pin!(a_to_b, b_to_a);

    let rest = tokio::select! {
        res = &mut a_to_b => {
            res?;
            tokio::time::timeout(linger, &mut b_to_a).await
        }
        res = &mut b_to_a => {
            res?;
            tokio::time::timeout(linger, &mut a_to_b).await
        }
    };

    match rest {
        Ok(res) => res.map(|_| ()),
        Err(_) => {
            tracing::trace!("relay linger expired");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_relay_delivers_all_bytes_before_half_close() {
        let (client, client_side) = tokio::io::duplex(64);
        let (server_side, server) = tokio::io::duplex(64);

        let relay = tokio::spawn(relay(client_side, server_side, Duration::from_secs(5)));

        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, expected);
            // the reverse direction still works after the half-close
            server.write_all(b"done").await.unwrap();
            server.shutdown().await.unwrap();
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&payload).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"done");

        server_task.await.unwrap();
        relay.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_expiry_ends_relay() {
        let (mut client, client_side) = tokio::io::duplex(64);
        let (server_side, _server) = tokio::io::duplex(64);

        let relay = tokio::spawn(relay(client_side, server_side, Duration::from_secs(10)));

        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        // the server never answers; the relay must still finish after the linger
        let result = tokio::time::timeout(Duration::from_secs(30), relay).await;
        assert!(result.expect("relay should end after linger").unwrap().is_ok());
    }
}
