//! Line-oriented TCP stream.
//!
//! Wraps a [`TcpStream`] split into a framed reader and a writer so the
//! listener can poll from one task while reading in another. The read buffer
//! lives in the [`LineReader`] and dies with it.
//!
//! Reading is cancel-safe: if a [`LineReader::read_line`] future is dropped
//! (for example by a timeout race), no received bytes are lost.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::ClientMessage;

use super::framer::LineFramer;

// ============================================================================
// Constants
// ============================================================================

/// Bytes requested from the socket per read.
const READ_CHUNK_BYTES: usize = 4096;

// ============================================================================
// LineReader
// ============================================================================

/// Framed read half.
#[derive(Debug)]
pub struct LineReader {
    half: OwnedReadHalf,
    framer: LineFramer,
}

impl LineReader {
    /// Returns the next line without its delimiter.
    ///
    /// A line already sitting in the buffer is returned without reading from
    /// the socket.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the peer closed the socket
    /// - [`Error::MessageTooLarge`] if the peer exceeded the line cap
    /// - [`Error::InvalidResponse`] if the line is not UTF-8
    /// - [`Error::Io`] on socket failure
    pub async fn read_line(&mut self) -> Result<String> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];

        loop {
            if let Some(line) = self.framer.next_line()? {
                let mut text = String::from_utf8(line)
                    .map_err(|e| Error::invalid_response(format!("line is not UTF-8: {e}")))?;
                while text.ends_with(['\n', '\r']) {
                    text.pop();
                }
                trace!(line = %text, "Line received");
                return Ok(text);
            }

            let read = self.half.read(&mut chunk).await?;
            if read == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.framer.push(&chunk[..read])?;
        }
    }

    /// Returns `true` if a complete line is already buffered.
    #[inline]
    #[must_use]
    pub fn has_buffered_line(&self) -> bool {
        self.framer.has_line()
    }

    /// Number of bytes buffered but not yet returned.
    #[inline]
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.framer.buffered_len()
    }
}

// ============================================================================
// LineWriter
// ============================================================================

/// Write half.
#[derive(Debug)]
pub struct LineWriter {
    half: OwnedWriteHalf,
}

impl LineWriter {
    /// Writes one message followed by the delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on socket failure.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let line = message.to_line()?;
        self.half.write_all(line.as_bytes()).await?;
        self.half.flush().await?;
        trace!(kind = message.kind(), request_id = %message.request_id(), "Message sent");
        Ok(())
    }

    /// Shuts down the write direction.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.half.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}

// ============================================================================
// LineStream
// ============================================================================

/// Connected, framed TCP stream.
#[derive(Debug)]
pub struct LineStream {
    reader: LineReader,
    writer: LineWriter,
    peer: SocketAddr,
}

impl LineStream {
    /// Connects to the engine.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the connect does not finish in time
    /// - [`Error::Connection`] if the connect is refused or fails
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        max_line_bytes: usize,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout))?
            .map_err(|e| Error::connection(format!("{addr}: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(%addr, "Connected to engine");
        Ok(Self::from_stream(stream, addr, max_line_bytes))
    }

    /// Wraps an already connected stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, max_line_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: LineReader {
                half: read_half,
                framer: LineFramer::new(max_line_bytes),
            },
            writer: LineWriter { half: write_half },
            peer,
        }
    }

    /// Returns the engine address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one message.
    ///
    /// # Errors
    ///
    /// See [`LineWriter::send`].
    #[inline]
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.writer.send(message).await
    }

    /// Reads one line.
    ///
    /// # Errors
    ///
    /// See [`LineReader::read_line`].
    #[inline]
    pub async fn read_line(&mut self) -> Result<String> {
        self.reader.read_line().await
    }

    /// Returns the framed reader.
    #[inline]
    #[must_use]
    pub fn reader(&self) -> &LineReader {
        &self.reader
    }

    /// Splits into independently owned halves.
    #[must_use]
    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }

    /// Shuts down the connection.
    pub async fn shutdown(mut self) {
        self.writer.shutdown().await;
        debug!(peer = %self.peer, "Connection closed");
    }
}

// ============================================================================
// Tests
// ============================================================================
