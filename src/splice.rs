//! The per-connection bidirectional byte-copy loop shared by the inner
//! bridge and the outer bridge's Assuan forwarder.
//!
//! No framing is interpreted beyond the 16-byte nonce prefix consumed
//! once at connection setup by the caller. Bytes within one direction are
//! delivered strictly FIFO; no ordering is promised between directions.

use log::{debug, trace};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type PinAsyncRead<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;
pub type PinAsyncWrite<'a> = Pin<Box<dyn AsyncWrite + Send + 'a>>;

/// Anything that can be split into an owned-lifetime read half and write
/// half, so the splicer can drive both directions concurrently.
pub trait SplitStream {
    fn split_rw(&mut self) -> (PinAsyncRead<'_>, PinAsyncWrite<'_>);
}

impl SplitStream for tokio::net::TcpStream {
    fn split_rw(&mut self) -> (PinAsyncRead<'_>, PinAsyncWrite<'_>) {
        let (read_half, write_half) = tokio::net::TcpStream::split(self);
        (Box::pin(read_half), Box::pin(write_half))
    }
}

#[cfg(unix)]
impl SplitStream for tokio::net::UnixStream {
    fn split_rw(&mut self) -> (PinAsyncRead<'_>, PinAsyncWrite<'_>) {
        let (read_half, write_half) = tokio::net::UnixStream::split(self);
        (Box::pin(read_half), Box::pin(write_half))
    }
}

/// One bounded-read, one write-all. An empty read is end-of-stream: the
/// peer's write half is shut down cleanly and copying stops. A reset
/// error propagates to terminate the whole splice.
async fn copy_one_direction<'a>(
    tag: &str,
    from: &mut PinAsyncRead<'a>,
    to: &mut PinAsyncWrite<'a>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            to.shutdown().await?;
            return Ok(total);
        }
        total += n as u64;
        trace!("{tag} {} bytes", n);
        to.write_all(&buf[..n]).await?;
    }
}

/// Splices `a` and `b` bidirectionally until both directions reach
/// end-of-stream or either side resets. Returns the byte counts
/// `(a_to_b, b_to_a)`.
pub async fn splice(a: &mut impl SplitStream, b: &mut impl SplitStream) -> std::io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = a.split_rw();
    let (mut b_read, mut b_write) = b.split_rw();
    let a_to_b = copy_one_direction("-->", &mut a_read, &mut b_write);
    let b_to_a = copy_one_direction("<--", &mut b_read, &mut a_write);
    let (sent, received) = tokio::join!(a_to_b, b_to_a);
    let (sent, received) = (sent?, received?);
    debug!("connection finished, sent {sent}, received {received}");
    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn splices_bytes_in_both_directions_without_loss() {
        let (mut left_near, mut left_far) = loopback_pair().await;
        let (mut right_near, mut right_far) = loopback_pair().await;

        let splicer = tokio::spawn(async move { splice(&mut left_far, &mut right_far).await });

        left_near.write_all(b"hello from client").await.unwrap();
        left_near.shutdown().await.unwrap();
        right_near.write_all(b"hello from agent").await.unwrap();
        right_near.shutdown().await.unwrap();

        let mut got_on_right = Vec::new();
        right_near.read_to_end(&mut got_on_right).await.unwrap();
        let mut got_on_left = Vec::new();
        left_near.read_to_end(&mut got_on_left).await.unwrap();

        splicer.await.unwrap().unwrap();

        assert_eq!(got_on_right, b"hello from client");
        assert_eq!(got_on_left, b"hello from agent");
    }

    #[tokio::test]
    async fn empty_read_ends_splice_cleanly() {
        let (mut left_near, mut left_far) = loopback_pair().await;
        let (right_near, mut right_far) = loopback_pair().await;
        drop(right_near);

        left_near.shutdown().await.unwrap();
        let result = splice(&mut left_far, &mut right_far).await;
        assert!(result.is_ok());
    }
}
