//! End-to-end scenarios from spec.md §8: the pairing nonce gates
//! forwarding, and a mismatched prefix never reaches the "agent" side.

use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wsl_gpg_bridge::{nonce, outer, splice};

/// Stands in for the outer bridge's accept path: authenticate the 16-byte
/// prefix, then splice to whatever "agent" stream the caller supplies.
async fn serve_one_authenticated_connection(
    listener: TcpListener,
    expected_nonce: [u8; 16],
    mut agent_side: TcpStream,
) -> std::io::Result<()> {
    let (mut client, _addr) = listener.accept().await?;
    match outer::authenticate(&mut client, &expected_nonce).await {
        Ok(()) => {
            let _ = splice::splice(&mut client, &mut agent_side).await;
        }
        Err(_) => {
            // Per spec.md §4.2/§8: close without forwarding on mismatch.
            drop(client);
        }
    }
    Ok(())
}

async fn agent_echo_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

#[tokio::test]
async fn correct_nonce_prefix_forwards_bytes_end_to_end() {
    let dir = tempdir().unwrap();
    let noncefile = dir.path().join("nonce");
    let pairing_nonce = nonce::generate_and_persist(&noncefile).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let outer_addr = listener.local_addr().unwrap();

    // `agent_near` plays the role of the native agent: whatever the
    // splicer forwards to `agent_far` shows up for `agent_near` to read
    // and echo back.
    let (agent_far, mut agent_near) = agent_echo_pair().await;

    let server = tokio::spawn(async move {
        serve_one_authenticated_connection(listener, pairing_nonce, agent_far).await
    });

    let echo = tokio::spawn(async move {
        let mut buf = vec![0u8; 5];
        agent_near.read_exact(&mut buf).await.unwrap();
        agent_near.write_all(&buf).await.unwrap();
        agent_near.shutdown().await.unwrap();
    });

    let read_back_nonce = nonce::read(&noncefile).await.unwrap();
    assert_eq!(read_back_nonce, pairing_nonce);

    let mut inner_to_outer = TcpStream::connect(outer_addr).await.unwrap();
    inner_to_outer.write_all(&read_back_nonce).await.unwrap();
    inner_to_outer.write_all(b"hello").await.unwrap();
    inner_to_outer.shutdown().await.unwrap();

    let mut reply = Vec::new();
    inner_to_outer.read_to_end(&mut reply).await.unwrap();

    echo.await.unwrap();
    server.await.unwrap().unwrap();

    assert_eq!(reply, b"hello");
}

#[tokio::test]
async fn mismatched_nonce_prefix_forwards_nothing() {
    let dir = tempdir().unwrap();
    let noncefile = dir.path().join("nonce");
    let pairing_nonce = nonce::generate_and_persist(&noncefile).await.unwrap();
    let mut wrong_nonce = pairing_nonce;
    wrong_nonce[0] ^= 0xFF;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let outer_addr = listener.local_addr().unwrap();
    let (agent_far, mut agent_near) = agent_echo_pair().await;

    let server = tokio::spawn(async move {
        serve_one_authenticated_connection(listener, pairing_nonce, agent_far).await
    });

    let mut inner_to_outer = TcpStream::connect(outer_addr).await.unwrap();
    inner_to_outer.write_all(&wrong_nonce).await.unwrap();
    let _ = inner_to_outer.write_all(b"should not arrive").await;
    drop(inner_to_outer);

    server.await.unwrap().unwrap();

    // The agent side never receives anything: reading from it should see
    // end-of-stream (the server dropped `client` without ever splicing),
    // not the payload the inner side tried to send.
    let mut buf = [0u8; 1];
    let n = agent_near.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "no payload should have reached the agent side");
}
