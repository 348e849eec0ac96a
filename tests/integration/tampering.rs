use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shuttle_transfer::{FailureReason, Fault};

use crate::*;

/// Relay that forwards both directions but flips one bit of the
/// sender→receiver stream at `offset`.
async fn flipping_relay(upstream: SocketAddr, offset: usize) -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((downstream, _)) = listener.accept().await else {
            return;
        };
        let Ok(upstream) = TcpStream::connect(upstream).await else {
            return;
        };
        let (mut down_rd, mut down_wr) = downstream.into_split();
        let (mut up_rd, mut up_wr) = upstream.into_split();

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut down_rd, &mut up_wr).await;
            let _ = up_wr.shutdown().await;
        });

        let mut seen = 0usize;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match up_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if (seen..seen + n).contains(&offset) {
                buf[offset - seen] ^= 0x01;
            }
            seen += n;
            if down_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = down_wr.shutdown().await;
    });
    Ok(addr)
}

/// A bit flipped inside an attachment frame is caught by the frame checksum
/// and the partial attachment never reaches the store.
#[tokio::test]
async fn test_corrupted_stream_is_detected() -> Result<()> {
    let key = test_key();
    let id = Uuid::new_v4();
    let source = MemorySource::new(vec![Item::Attachment(id, pattern(256 * 1024, 9))]);

    let sink = MemorySink::default();
    let outcome = run_session_via(
        Side::new(&key),
        Side::new(&key),
        source,
        sink.clone(),
        |addr| flipping_relay(addr, 100 * 1024),
    )
    .await?;

    assert!(outcome.client.is_err());
    assert_eq!(
        outcome.client_state,
        TransferState::Failed(FailureReason::Exception(Fault::Corrupted))
    );
    assert!(matches!(outcome.server_state, TransferState::Failed(_)));

    let received = sink.0.lock();
    assert!(received.committed.is_empty());
    assert!(!received.finished);
    Ok(())
}
