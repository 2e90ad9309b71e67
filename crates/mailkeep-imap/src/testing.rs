//! In-memory stream and DEFLATE helpers for tests

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use futures::io::{AsyncRead, AsyncWrite};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Replays scripted server bytes and records what the client wrote
pub struct MockStream {
    input: Vec<u8>,
    pos: usize,
    max_read: usize,
    output: Vec<u8>,
}

impl MockStream {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            pos: 0,
            max_read: usize::MAX,
            output: Vec::new(),
        }
    }

    /// Cap every read to `n` bytes to exercise partial reads
    pub fn with_max_read(mut self, n: usize) -> Self {
        self.max_read = n;
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.output
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let remaining = this.input.len() - this.pos;
        let n = remaining.min(buf.len()).min(this.max_read);
        buf[..n].copy_from_slice(&this.input[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().output.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Raw-DEFLATE `data` the way a COMPRESS=DEFLATE peer would, sync-flushed
pub fn deflate_stream(data: &[u8]) -> Vec<u8> {
    let mut compress = Compress::new(Compression::best(), false);
    let mut out = Vec::with_capacity(data.len() + 64);
    compress
        .compress_vec(data, &mut out, FlushCompress::Sync)
        .unwrap();
    out
}

/// Inflate a sync-flushed raw DEFLATE stream
pub fn inflate_stream(data: &[u8]) -> Vec<u8> {
    let mut decompress = Decompress::new(false);
    let mut out = Vec::with_capacity(data.len() * 8 + 1024);
    decompress
        .decompress_vec(data, &mut out, FlushDecompress::Sync)
        .unwrap();
    out
}
