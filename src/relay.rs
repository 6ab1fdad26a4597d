use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};

/// Pump bytes between two connected duplex endpoints until both directions
/// finish. EOF in one direction half-closes the other side; an error tears
/// the pair down when it is dropped by the caller. A relay is one-shot and
/// holds no shared state, so any number can run concurrently.
///
/// Returns (origin→destination, destination→origin) byte counts.
pub async fn relay<A, B>(mut origin: A, mut destination: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut origin, &mut destination).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (a_near, mut a_far) = tokio::io::duplex(64);
        let (b_near, mut b_far) = tokio::io::duplex(64);

        let handle = tokio::spawn(relay(a_near, b_near));

        a_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_far.write_all(b"pongs").await.unwrap();
        let mut buf = [0u8; 5];
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pongs");

        drop(a_far);
        drop(b_far);

        let (up, down) = handle.await.unwrap().unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 5);
    }

    #[tokio::test]
    async fn test_relay_propagates_eof() {
        let (a_near, mut a_far) = tokio::io::duplex(64);
        let (b_near, mut b_far) = tokio::io::duplex(64);

        let handle = tokio::spawn(relay(a_near, b_near));

        a_far.write_all(b"done").await.unwrap();
        drop(a_far);

        // The far side sees the payload and then EOF
        let mut received = Vec::new();
        b_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"done");

        drop(b_far);
        let (up, _down) = handle.await.unwrap().unwrap();
        assert_eq!(up, 4);
    }
}
