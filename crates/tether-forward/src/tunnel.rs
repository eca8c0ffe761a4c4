//! Bidirectional, bounded-buffer byte copy between a tunnel's two legs.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction copy buffer. Fixed size: a full buffer parks the producing
/// side until the consumer drains it, so a slow peer throttles its producer
/// instead of growing memory.
pub const SPOOL_BUFFER_LEN: usize = 8 * 1024;

/// Copy bytes in both directions between `left` and `right` until either
/// side reaches EOF or fails.
///
/// Each direction drains its source in a read/write loop with one
/// [`SPOOL_BUFFER_LEN`] buffer, so bursts are moved without a wakeup per
/// read while the opposite direction keeps making progress. When one
/// direction ends (EOF after its buffered bytes are flushed, or an I/O
/// error), the whole tunnel ends and both legs are closed on drop;
/// half-open tunnels are not kept alive.
///
/// Returns `(left_to_right, right_to_left)` byte counts.
pub async fn spool<L, R>(left: L, right: R) -> io::Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_rx, mut left_tx) = tokio::io::split(left);
    let (mut right_rx, mut right_tx) = tokio::io::split(right);

    let mut left_to_right = 0u64;
    let mut right_to_left = 0u64;

    let result = tokio::select! {
        res = copy_direction(&mut left_rx, &mut right_tx, &mut left_to_right) => res,
        res = copy_direction(&mut right_rx, &mut left_tx, &mut right_to_left) => res,
    };

    result.map(|()| (left_to_right, right_to_left))
}

async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPOOL_BUFFER_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
