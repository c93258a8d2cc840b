//! Bidirectional byte splice between two streams.
//!
//! Used on both peers: the server splices a public TCP connection into a
//! tunnel stream, the agent splices a tunnel stream into its local backend
//! dial. A naive pair of copies deadlocks when only one direction closes
//! cleanly, so whichever copier finishes first forces both write halves
//! shut, which unblocks the other side.

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Copy bytes in both directions between `a` and `b` until either side
/// reaches EOF or errors, then close both.
///
/// Returns the result of the direction that terminated first; the other
/// copier is cancelled and unwinds as the closes propagate.
pub async fn splice<A, B>(a: A, b: B) -> io::Result<u64>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let result = tokio::select! {
        r = io::copy(&mut a_read, &mut b_write) => r,
        r = io::copy(&mut b_read, &mut a_write) => r,
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_pass_through_in_order() {
        let (left_near, left_far) = io::duplex(256);
        let (right_near, right_far) = io::duplex(256);

        let worker = tokio::spawn(splice(left_far, right_far));

        let (mut left, mut right) = (left_near, right_near);
        left.write_all(b"hello across").await.unwrap();
        left.shutdown().await.unwrap();

        let mut out = Vec::new();
        right.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello across");

        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn both_directions_carry_data() {
        let (left_near, left_far) = io::duplex(256);
        let (right_near, right_far) = io::duplex(256);

        let worker = tokio::spawn(splice(left_far, right_far));

        let (mut left, mut right) = (left_near, right_near);
        left.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(left);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_one_side_unblocks_the_other() {
        let (left_near, left_far) = io::duplex(256);
        let (right_near, right_far) = io::duplex(256);

        let worker = tokio::spawn(splice(left_far, right_far));

        // Close the left end without writing. The right reader, which would
        // otherwise block forever, must observe EOF.
        drop(left_near);

        let mut right = right_near;
        let mut out = Vec::new();
        right.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());

        worker.await.unwrap().unwrap();
    }
}
