//! Byte transport beneath the IMAP client, with optional RFC 4978
//! COMPRESS=DEFLATE.
//!
//! The transport wraps any async byte stream (normally a TLS stream) and
//! offers the three primitives the protocol layer needs: read a line, read an
//! exact number of bytes, and send a buffer. Once the server has acknowledged
//! `COMPRESS DEFLATE`, both directions switch to raw DEFLATE (15-bit window,
//! no zlib framing). Every `send` ends with a sync flush so the server sees a
//! complete command.
//!
//! Stream failures are returned as-is; retrying is the caller's business.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::io;

const READ_CHUNK: usize = 16 * 1024;
const DEFLATE_CHUNK: usize = 8 * 1024;

/// Byte counters per direction
///
/// `raw_*` counts bytes on the wire, `logical_*` counts protocol bytes before
/// compression / after decompression. Without compression they are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub raw_in: u64,
    pub logical_in: u64,
    pub raw_out: u64,
    pub logical_out: u64,
}

impl TransportStats {
    /// Percentage of traffic saved by compression, both directions combined
    pub fn savings_percent(&self) -> Option<u64> {
        let logical = self.logical_in + self.logical_out;
        let raw = self.raw_in + self.raw_out;
        if logical == 0 || raw > logical {
            return None;
        }
        Some(100 * (logical - raw) / logical)
    }
}

/// Stream decorator implementing the IMAP byte transport
pub struct CompressedTransport<S> {
    stream: S,
    /// Logical (decompressed) bytes received but not yet handed out
    buffered: Vec<u8>,
    buffered_pos: usize,
    /// Wire bytes not yet fed to the decompressor
    raw: Vec<u8>,
    raw_pos: usize,
    compress: Option<Compress>,
    decompress: Option<Decompress>,
    stats: TransportStats,
}

impl<S> CompressedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffered: Vec::new(),
            buffered_pos: 0,
            raw: Vec::new(),
            raw_pos: 0,
            compress: None,
            decompress: None,
            stats: TransportStats::default(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compress.is_some()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Switch both directions to raw DEFLATE
    ///
    /// Must only be called right after the server's tagged OK to
    /// `COMPRESS DEFLATE`. Anything already read past that line is
    /// compressed data and is handed back to the decompressor.
    pub fn enable_compression(&mut self) {
        if self.is_compressed() {
            return;
        }

        let leftover = self.buffered.split_off(self.buffered_pos);
        self.buffered.clear();
        self.buffered_pos = 0;
        self.stats.logical_in -= leftover.len() as u64;
        self.raw = leftover;
        self.raw_pos = 0;

        // `false`: no zlib header, i.e. raw DEFLATE with the default 15-bit window
        self.compress = Some(Compress::new(Compression::default(), false));
        self.decompress = Some(Decompress::new(false));
    }

    /// Read through the first `\n`, inclusive
    pub async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut searched = 0;
        loop {
            let pending = &self.buffered[self.buffered_pos..];
            if let Some(ix) = pending[searched..].iter().position(|&b| b == b'\n') {
                return Ok(self.take(searched + ix + 1));
            }
            searched = pending.len();
            self.fill().await?;
        }
    }

    /// Read exactly `size` bytes
    pub async fn read_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        while self.buffered.len() - self.buffered_pos < size {
            self.fill().await?;
        }
        Ok(self.take(size))
    }

    /// Send a buffer, compressing and sync-flushing when compression is on
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stats.logical_out += data.len() as u64;

        match self.compress.as_mut() {
            Some(compress) => {
                let wire = deflate_sync(compress, data)?;
                self.stats.raw_out += wire.len() as u64;
                self.stream.write_all(&wire).await?;
            }
            None => {
                self.stats.raw_out += data.len() as u64;
                self.stream.write_all(data).await?;
            }
        }

        self.stream.flush().await
    }

    /// Give up the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        let start = self.buffered_pos;
        let out = self.buffered[start..start + size].to_vec();
        self.buffered_pos += size;
        if self.buffered_pos == self.buffered.len() {
            self.buffered.clear();
            self.buffered_pos = 0;
        }
        out
    }

    /// Append at least one more logical byte to `buffered`
    async fn fill(&mut self) -> io::Result<()> {
        if self.buffered_pos > 0 {
            self.buffered.drain(..self.buffered_pos);
            self.buffered_pos = 0;
        }

        let mut chunk = vec![0u8; READ_CHUNK];

        if self.decompress.is_none() {
            let n = self.read_wire(&mut chunk).await?;
            self.stats.logical_in += n as u64;
            self.buffered.extend_from_slice(&chunk[..n]);
            return Ok(());
        }

        loop {
            // Squeeze the decompressor before asking the network for more; it
            // may still hold output from input it has already consumed.
            let (consumed, produced) = match self.decompress.as_mut() {
                Some(decompress) => {
                    inflate_step(decompress, &self.raw[self.raw_pos..], &mut chunk)?
                }
                None => (0, 0),
            };
            self.raw_pos += consumed;

            if produced > 0 {
                self.stats.logical_in += produced as u64;
                self.buffered.extend_from_slice(&chunk[..produced]);
                return Ok(());
            }

            if consumed > 0 && self.raw_pos < self.raw.len() {
                continue;
            }

            self.raw.drain(..self.raw_pos);
            self.raw_pos = 0;
            let mut wire = vec![0u8; READ_CHUNK];
            let n = self.read_wire(&mut wire).await?;
            self.raw.extend_from_slice(&wire[..n]);
        }
    }

    async fn read_wire(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ));
        }
        self.stats.raw_in += n as u64;
        Ok(n)
    }
}

/// Run one decompression pass, returning (input consumed, output produced)
fn inflate_step(
    decompress: &mut Decompress,
    input: &[u8],
    output: &mut [u8],
) -> io::Result<(usize, usize)> {
    let before_in = decompress.total_in();
    let before_out = decompress.total_out();
    decompress
        .decompress(input, output, FlushDecompress::Sync)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((
        (decompress.total_in() - before_in) as usize,
        (decompress.total_out() - before_out) as usize,
    ))
}

/// Compress `data` and terminate it with a sync flush
fn deflate_sync(compress: &mut Compress, mut data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut chunk = vec![0u8; DEFLATE_CHUNK];

    while !data.is_empty() {
        let before_in = compress.total_in();
        let before_out = compress.total_out();
        compress
            .compress(data, &mut chunk, FlushCompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        data = &data[(compress.total_in() - before_in) as usize..];
        out.extend_from_slice(&chunk[..(compress.total_out() - before_out) as usize]);
    }

    // A flush is complete once it leaves room in the output buffer.
    loop {
        let before_out = compress.total_out();
        compress
            .compress(&[], &mut chunk, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let produced = (compress.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);
        if produced < chunk.len() {
            break;
        }
    }

    Ok(out)
}
