// ABOUTME: FIFO rope of byte chunks with independent read/write cursors over the pooled chunk layer
// ABOUTME: The zero-copy substrate the pipeline and both wire codecs read and write through

use crate::pool::{ChunkPool, PooledChunk};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("buffer is closed")]
    ObjectDisposed,
    #[error("buffer has no pool, write operations are not permitted")]
    ReadOnly,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed mid-drain")]
    Closed,
}

enum ChunkSource {
    Pooled(PooledChunk),
    Raw(Bytes),
}

/// One link in the chunk chain: an optional pooled chunk or a raw byte
/// view, plus the offset/length window actually in use.
///
/// Ordering of the chain is provided by a `VecDeque` rather than a literal
/// `next` pointer: the buffer only ever appends at the tail and removes
/// from the head, so a deque gives the same FIFO-rope semantics without
/// the unsafe bookkeeping a raw tail pointer would need (see DESIGN.md).
struct ChunkNode {
    source: ChunkSource,
    offset: usize,
    length: usize,
}

impl ChunkNode {
    fn bytes(&self) -> &[u8] {
        let full = match &self.source {
            ChunkSource::Pooled(p) => p.as_slice(),
            ChunkSource::Raw(b) => b.as_ref(),
        };
        &full[self.offset..self.offset + self.length]
    }

    fn release(&self) {
        if let ChunkSource::Pooled(p) = &self.source {
            p.release();
        }
    }
}

struct Inner {
    chain: VecDeque<ChunkNode>,
    write_pos: u64,
    read_pos: u64,
    closed: bool,
}

/// A FIFO chain of byte chunks with independent read and write cursors.
///
/// `write`/`offer_chunk` require a pool (`read_only()` is false); buffers
/// built from [`ChunkedBuffer::wrap`] without a pool are read-only.
pub struct ChunkedBuffer {
    inner: Mutex<Inner>,
    pool: Option<ChunkPool>,
}

impl ChunkedBuffer {
    pub fn new(pool: ChunkPool) -> Self {
        ChunkedBuffer {
            inner: Mutex::new(Inner {
                chain: VecDeque::new(),
                write_pos: 0,
                read_pos: 0,
                closed: false,
            }),
            pool: Some(pool),
        }
    }

    /// Constructs a buffer backed by a single raw chunk view over `bytes`.
    /// Read-only with respect to `write`/`offer_chunk` unless `pool` is
    /// supplied.
    pub fn wrap(bytes: Bytes, offset: usize, length: usize, pool: Option<ChunkPool>) -> Self {
        let mut chain = VecDeque::new();
        if length > 0 {
            chain.push_back(ChunkNode {
                source: ChunkSource::Raw(bytes),
                offset,
                length,
            });
        }
        ChunkedBuffer {
            inner: Mutex::new(Inner {
                chain,
                write_pos: length as u64,
                read_pos: 0,
                closed: false,
            }),
            pool,
        }
    }

    pub fn read_only(&self) -> bool {
        self.pool.is_none()
    }

    pub fn pool(&self) -> Option<&ChunkPool> {
        self.pool.as_ref()
    }

    pub fn write_position(&self) -> u64 {
        self.inner.lock().write_pos
    }

    pub fn read_position(&self) -> u64 {
        self.inner.lock().read_pos
    }

    pub fn available(&self) -> u64 {
        let g = self.inner.lock();
        g.write_pos - g.read_pos
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Snapshot of the read cursor used by codecs to rewind on an
    /// incomplete parse.
    pub fn snapshot(&self) -> BufferSnapshot {
        let g = self.inner.lock();
        BufferSnapshot {
            read_pos: g.read_pos,
        }
    }

    /// Rewinds the read cursor to a previously captured snapshot. Never
    /// fails: restoring to an earlier read position is always valid
    /// because flush only ever removes chunks strictly before read_pos.
    pub fn restore(&self, snapshot: BufferSnapshot) {
        let mut g = self.inner.lock();
        g.read_pos = snapshot.read_pos;
    }

    /// Copies `length` bytes from `src[offset..offset+length]` into one or
    /// more freshly borrowed pooled chunks, appending them to the chain.
    pub fn write(&self, src: &[u8], offset: usize, length: usize) -> Result<(), BufferError> {
        let pool = self.pool.as_ref().ok_or(BufferError::ReadOnly)?;
        if offset.checked_add(length).map(|end| end > src.len()).unwrap_or(true) {
            return Err(BufferError::InvalidArgument("offset/length out of range"));
        }
        let mut g = self.inner.lock();
        if g.closed {
            return Err(BufferError::ObjectDisposed);
        }
        let mut i = 0usize;
        while i < length {
            let mut chunk = pool.borrow();
            let cap = chunk.capacity();
            let take = cap.min(length - i);
            chunk.as_mut_slice()[..take].copy_from_slice(&src[offset + i..offset + i + take]);
            chunk.retain();
            g.chain.push_back(ChunkNode {
                source: ChunkSource::Pooled(chunk),
                offset: 0,
                length: take,
            });
            i += take;
        }
        g.write_pos += length as u64;
        Ok(())
    }

    /// Appends a chunk node referencing the caller's byte range directly,
    /// with no copy and no pool tracking.
    pub fn offer_raw(&self, bytes: Bytes, offset: usize, length: usize) -> Result<(), BufferError> {
        if offset.checked_add(length).map(|end| end > bytes.len()).unwrap_or(true) {
            return Err(BufferError::InvalidArgument("offset/length out of range"));
        }
        let mut g = self.inner.lock();
        if g.closed {
            return Err(BufferError::ObjectDisposed);
        }
        g.chain.push_back(ChunkNode {
            source: ChunkSource::Raw(bytes),
            offset,
            length,
        });
        g.write_pos += length as u64;
        Ok(())
    }

    /// Appends a chunk node referencing a pooled chunk belonging to this
    /// buffer's pool, incrementing its reference count exactly once.
    pub fn offer_chunk(
        &self,
        chunk: PooledChunk,
        offset: usize,
        length: usize,
    ) -> Result<(), BufferError> {
        let pool = self.pool.as_ref().ok_or(BufferError::ReadOnly)?;
        if chunk.pool_id() != Some(pool.id()) {
            return Err(BufferError::InvalidArgument("chunk belongs to a different pool"));
        }
        if chunk.state() != crate::pool::ChunkState::Used {
            return Err(BufferError::InvalidArgument("chunk is not in USED state"));
        }
        if offset.checked_add(length).map(|end| end > chunk.capacity()).unwrap_or(true) {
            return Err(BufferError::InvalidArgument("offset/length out of range"));
        }
        let mut g = self.inner.lock();
        if g.closed {
            return Err(BufferError::ObjectDisposed);
        }
        chunk.retain();
        g.write_pos += length as u64;
        g.chain.push_back(ChunkNode {
            source: ChunkSource::Pooled(chunk),
            offset,
            length,
        });
        Ok(())
    }

    /// Copies up to `length` bytes starting at the read cursor into `dst`,
    /// advancing the read cursor by the number of bytes copied. Never
    /// mutates the chain.
    pub fn read(&self, dst: &mut [u8], offset: usize, length: usize) -> Result<usize, BufferError> {
        if offset.checked_add(length).map(|end| end > dst.len()).unwrap_or(true) {
            return Err(BufferError::InvalidArgument("offset/length out of range"));
        }
        let mut g = self.inner.lock();
        if g.closed {
            return Err(BufferError::ObjectDisposed);
        }
        if g.write_pos == g.read_pos || length == 0 {
            return Ok(0);
        }

        let mut copied = 0usize;
        let mut cursor = 0u64; // cumulative start offset of the node currently being examined
        let read_pos = g.read_pos;
        for node in g.chain.iter() {
            if copied == length {
                break;
            }
            let node_len = node.length as u64;
            let node_start = cursor;
            let node_end = cursor + node_len;
            cursor = node_end;
            if node_end <= read_pos {
                continue; // strictly before the read cursor
            }
            let skip = read_pos.saturating_sub(node_start) as usize;
            let available_here = node.length - skip;
            let want = (length - copied).min(available_here);
            let src = node.bytes();
            dst[offset + copied..offset + copied + want].copy_from_slice(&src[skip..skip + want]);
            copied += want;
        }
        g.read_pos += copied as u64;
        Ok(copied)
    }

    /// Borrows chunks and reads from `src` into them until it returns
    /// `Ok(0)`, appending each full chunk via `offer_chunk`. The final
    /// partially-filled (or entirely unfilled) borrowed chunk is returned
    /// to the pool rather than appended.
    pub fn read_from_stream<R: Read>(&self, src: &mut R) -> Result<(), BufferError> {
        let pool = self.pool.as_ref().ok_or(BufferError::ReadOnly)?.clone();
        loop {
            let mut chunk = pool.borrow();
            let cap = chunk.capacity();
            let n = {
                let buf = chunk.as_mut_slice();
                let mut total = 0usize;
                loop {
                    match src.read(&mut buf[total..cap]) {
                        Ok(0) => break total,
                        Ok(k) => {
                            total += k;
                            if total == cap {
                                break total;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(BufferError::Io(e)),
                    }
                }
            };
            if n == 0 {
                pool.return_chunk(&chunk).ok();
                return Ok(());
            }
            self.offer_chunk(chunk, 0, n)?;
            if n < cap {
                return Ok(());
            }
        }
    }

    /// Async counterpart of [`ChunkedBuffer::read_from_stream`].
    pub async fn read_from_async<R: AsyncRead + Unpin>(&self, src: &mut R) -> Result<(), BufferError> {
        let pool = self.pool.as_ref().ok_or(BufferError::ReadOnly)?.clone();
        loop {
            let mut chunk = pool.borrow();
            let cap = chunk.capacity();
            let n = {
                let buf = chunk.as_mut_slice();
                src.read(&mut buf[..cap]).await?
            };
            if n == 0 {
                pool.return_chunk(&chunk).ok();
                return Ok(());
            }
            self.offer_chunk(chunk, 0, n)?;
            if n < cap {
                return Ok(());
            }
        }
    }

    /// Writes each chunk's bytes to `dst` in order, releasing each chunk's
    /// reference as it is written. The chain is empty on completion.
    pub fn drain_sync<W: Write>(&self, dst: &mut W) -> Result<(), BufferError> {
        let nodes = {
            let mut g = self.inner.lock();
            std::mem::take(&mut g.chain)
        };
        for node in &nodes {
            dst.write_all(node.bytes())?;
            node.release();
        }
        Ok(())
    }

    /// Async counterpart of [`ChunkedBuffer::drain_sync`]: writes then
    /// continues, releasing a chunk's reference only after its write
    /// completes. Each chunk's write is raced against `closed`, which a
    /// channel's close signal drives to `true`; a close observed either
    /// before or during a chunk's write ends the drain early with
    /// [`BufferError::Closed`], releasing every chunk that didn't get
    /// written rather than leaving them to be logged as abandoned.
    pub async fn drain_async<W: AsyncWrite + Unpin>(
        &self,
        dst: &mut W,
        mut closed: watch::Receiver<bool>,
    ) -> Result<(), BufferError> {
        let nodes = {
            let mut g = self.inner.lock();
            std::mem::take(&mut g.chain)
        };
        let mut iter = nodes.into_iter();
        while let Some(node) = iter.next() {
            if *closed.borrow() {
                node.release();
                iter.for_each(|n| n.release());
                return Err(BufferError::Closed);
            }
            tokio::select! {
                result = dst.write_all(node.bytes()) => {
                    result?;
                    node.release();
                }
                _ = closed.changed() => {
                    node.release();
                    iter.for_each(|n| n.release());
                    return Err(BufferError::Closed);
                }
            }
        }
        Ok(())
    }

    /// Advances the root past any chunk entirely consumed by the current
    /// read position, decrementing each released chunk's refcount and
    /// shrinking both cursors by the number of bytes released so that
    /// `available = write - read` is preserved across the call.
    pub fn flush(&self) -> Result<(), BufferError> {
        let mut g = self.inner.lock();
        let read_pos = g.read_pos;
        let mut released = 0u64;
        while let Some(front) = g.chain.front() {
            let front_len = front.length as u64;
            if released + front_len > read_pos {
                break;
            }
            released += front_len;
            let node = g.chain.pop_front().unwrap();
            node.release();
        }
        g.read_pos -= released;
        g.write_pos -= released;
        Ok(())
    }

    /// Idempotent: advances the read cursor to the write cursor, flushes,
    /// then marks the buffer closed.
    pub fn close(&self) -> Result<(), BufferError> {
        {
            let mut g = self.inner.lock();
            if g.closed {
                return Ok(());
            }
            g.read_pos = g.write_pos;
        }
        self.flush()?;
        self.inner.lock().closed = true;
        Ok(())
    }

    /// Like `close`, but additionally releases every remaining chunk
    /// regardless of read position.
    pub fn dispose(&self) -> Result<(), BufferError> {
        let mut g = self.inner.lock();
        if g.closed {
            return Ok(());
        }
        for node in g.chain.drain(..) {
            node.release();
        }
        g.read_pos = 0;
        g.write_pos = 0;
        g.closed = true;
        Ok(())
    }

    /// Reads all currently available bytes and decodes them as UTF-8.
    pub fn to_utf8_string(&self) -> Result<String, BufferError> {
        let avail = self.available() as usize;
        let mut buf = vec![0u8; avail];
        let n = self.read(&mut buf, 0, avail)?;
        buf.truncate(n);
        String::from_utf8(buf).map_err(|_| BufferError::InvalidArgument("not valid utf-8"))
    }

    /// Constructs a buffer then immediately reads `src` to exhaustion.
    pub fn read_fully<R: Read>(src: &mut R, pool: ChunkPool) -> Result<Self, BufferError> {
        let buf = ChunkedBuffer::new(pool);
        buf.read_from_stream(src)?;
        Ok(buf)
    }

    pub async fn read_fully_async<R: AsyncRead + Unpin>(
        src: &mut R,
        pool: ChunkPool,
    ) -> Result<Self, BufferError> {
        let buf = ChunkedBuffer::new(pool);
        buf.read_from_async(src).await?;
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferSnapshot {
    read_pos: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips_in_order() {
        let pool = ChunkPool::new(4);
        let buf = ChunkedBuffer::new(pool);
        let data = b"hello world, this spans several chunks";
        buf.write(data, 0, data.len()).unwrap();
        assert_eq!(buf.write_position(), data.len() as u64);

        let mut out = vec![0u8; data.len()];
        let n = buf.read(&mut out, 0, data.len()).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(&out[..], &data[..]);
        assert_eq!(buf.read_position(), data.len() as u64);
    }

    #[test]
    fn wrap_is_read_only_and_reports_available() {
        let bytes = Bytes::from_static(b"abcdef");
        let buf = ChunkedBuffer::wrap(bytes.clone(), 1, 4, None);
        assert!(buf.read_only());
        assert_eq!(buf.available(), 4);
        assert_eq!(buf.to_utf8_string().unwrap(), "bcde");
    }

    #[test]
    fn write_without_pool_is_read_only_error() {
        let buf = ChunkedBuffer::wrap(Bytes::from_static(b"x"), 0, 1, None);
        assert!(matches!(buf.write(b"y", 0, 1), Err(BufferError::ReadOnly)));
    }

    #[test]
    fn flush_releases_consumed_chunks_and_preserves_available() {
        let pool = ChunkPool::new(10);
        let buf = ChunkedBuffer::new(pool.clone());
        let data = vec![7u8; 35];
        buf.write(&data, 0, data.len()).unwrap();

        let mut out = vec![0u8; data.len()];
        buf.read(&mut out, 0, data.len()).unwrap();
        buf.flush().unwrap();

        assert_eq!(buf.read_position(), 0);
        assert_eq!(buf.write_position(), 0);
        assert_eq!(pool.in_pool(), data.len().div_ceil(10));
    }

    #[test]
    fn snapshot_restore_rewinds_read_cursor() {
        let pool = ChunkPool::new(8);
        let buf = ChunkedBuffer::new(pool);
        buf.write(b"0123456789", 0, 10).unwrap();
        let snap = buf.snapshot();
        let mut out = [0u8; 5];
        buf.read(&mut out, 0, 5).unwrap();
        assert_eq!(buf.read_position(), 5);
        buf.restore(snap);
        assert_eq!(buf.read_position(), 0);
    }

    #[test]
    fn offer_chunk_rejects_mismatched_pool() {
        let pool_a = ChunkPool::new(8);
        let pool_b = ChunkPool::new(8);
        let buf = ChunkedBuffer::new(pool_a);
        let foreign_chunk = pool_b.borrow();
        assert!(matches!(
            buf.offer_chunk(foreign_chunk, 0, 1),
            Err(BufferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn close_then_operations_fail_except_idempotent_close() {
        let pool = ChunkPool::new(8);
        let buf = ChunkedBuffer::new(pool);
        buf.write(b"abc", 0, 3).unwrap();
        buf.close().unwrap();
        assert!(buf.is_closed());
        assert!(matches!(buf.write(b"x", 0, 1), Err(BufferError::ObjectDisposed)));
        buf.close().unwrap(); // idempotent
    }

    #[test]
    fn dispose_releases_unread_chunks() {
        let pool = ChunkPool::new(4);
        let buf = ChunkedBuffer::new(pool.clone());
        buf.write(b"abcdefgh", 0, 8).unwrap();
        assert_eq!(pool.total_allocated(), 2);
        buf.dispose().unwrap();
        assert_eq!(pool.in_pool(), 2);
    }

    #[test]
    fn read_from_stream_then_drain_sync_roundtrips() {
        let pool = ChunkPool::new(4);
        let buf = ChunkedBuffer::new(pool);
        let mut src = std::io::Cursor::new(b"abcdefghij".to_vec());
        buf.read_from_stream(&mut src).unwrap();
        assert_eq!(buf.available(), 10);

        let mut out = Vec::new();
        buf.drain_sync(&mut out).unwrap();
        assert_eq!(out, b"abcdefghij");
    }

    #[tokio::test]
    async fn drain_async_roundtrips_when_channel_stays_open() {
        let pool = ChunkPool::new(4);
        let buf = ChunkedBuffer::new(pool);
        buf.write(b"abcdefgh", 0, 8).unwrap();

        let (_close_tx, close_rx) = watch::channel(false);
        let mut out = Vec::new();
        buf.drain_async(&mut out, close_rx).await.unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn drain_async_cancels_an_in_flight_write_when_the_channel_closes() {
        use std::pin::Pin;
        use std::sync::Arc;
        use std::task::{Context, Poll};
        use tokio::sync::Notify;

        struct StallingWriter {
            started: Arc<Notify>,
        }

        impl AsyncWrite for StallingWriter {
            fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
                self.started.notify_one();
                Poll::Pending
            }
            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let pool = ChunkPool::new(4);
        let buf = ChunkedBuffer::new(pool.clone());
        buf.write(&[1u8, 2, 3, 4, 5, 6, 7, 8], 0, 8).unwrap();
        assert_eq!(pool.total_allocated(), 2);

        let (close_tx, close_rx) = watch::channel(false);
        let started = Arc::new(Notify::new());
        let mut writer = StallingWriter {
            started: Arc::clone(&started),
        };

        let drain = tokio::spawn(async move { buf.drain_async(&mut writer, close_rx).await });
        started.notified().await;
        close_tx.send(true).unwrap();

        let result = drain.await.unwrap();
        assert!(matches!(result, Err(BufferError::Closed)));
        assert_eq!(pool.in_pool(), 2);
    }
}
