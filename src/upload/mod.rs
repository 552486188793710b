// Client for the recorder's media-upload service.
//
// A session is one TCP connection per destination file. Commands are
// CRLF-terminated ASCII; WRITEC is followed by the binary payload. Only the
// SIZE handshake and CLOSE have replies.
//
//   SIZE <filename> <uploadID>      -> OK        open / resume a session
//   WRITEC <size> <offset>  <bytes>              write at explicit offset
//   CLOSE                           -> OK        end the session
//
// The client tracks an auto-incrementing offset so a broken connection can
// be resumed exactly where it left off.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("i/o error talking to the media server: {0}")]
    Io(#[from] std::io::Error),

    #[error("media server refused {verb}: {reply}")]
    Refused { verb: &'static str, reply: String },

    #[error("no active upload session")]
    NotConnected,
}

/// TCP client for one upload destination.
pub struct MediaUploadClient {
    addr: SocketAddr,
    stream: Option<BufStream<TcpStream>>,
    filename: String,
    upload_id: i32,
    auto_offset: u64,
}

impl MediaUploadClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            filename: String::new(),
            upload_id: -1,
            auto_offset: 0,
        }
    }

    /// Offset the next auto-incrementing write will use. Recorded by the
    /// caller so a session can be reopened with `start_offset` after a
    /// reconnect.
    pub fn auto_offset(&self) -> u64 {
        self.auto_offset
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens (or reopens) the session. `start_offset` is where writing
    /// resumes; 0 for a fresh file.
    pub async fn start_session(
        &mut self,
        filename: &str,
        upload_id: i32,
        start_offset: u64,
    ) -> Result<(), UploadError> {
        self.disconnect().await;

        let tcp = TcpStream::connect(self.addr).await?;
        let mut stream = BufStream::new(tcp);
        let command = format!("SIZE {filename} {upload_id}\r\n");
        stream.write_all(command.as_bytes()).await?;
        stream.flush().await?;

        let reply = read_reply_line(&mut stream).await?;
        if !reply.starts_with("OK") {
            return Err(UploadError::Refused {
                verb: "SIZE",
                reply,
            });
        }

        self.stream = Some(stream);
        self.filename = filename.to_string();
        self.upload_id = upload_id;
        self.auto_offset = start_offset;
        debug!(filename, upload_id, start_offset, "upload session opened");
        Ok(())
    }

    /// Writes `data` at the auto-incrementing offset.
    pub async fn upload_auto_increment(&mut self, data: &[u8]) -> Result<(), UploadError> {
        self.upload_with_wrap(0, data).await
    }

    /// Writes `data` into a circular window of `cap` bytes: when the
    /// auto-offset would pass `cap` it wraps back to 0. This backs the
    /// recorder's time-shift buffer semantics.
    pub async fn upload_auto_buffered(&mut self, cap: u64, data: &[u8]) -> Result<(), UploadError> {
        self.upload_with_wrap(cap, data).await
    }

    async fn upload_with_wrap(&mut self, cap: u64, data: &[u8]) -> Result<(), UploadError> {
        if cap > 0 && self.auto_offset >= cap {
            self.auto_offset = 0;
        }
        let offset = self.auto_offset;
        match self.write_at(offset, data).await {
            Ok(()) => {
                self.auto_offset = offset + data.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Reconnect-and-resume: reopen at the current offset and
                // retry this write exactly once. A second failure is the
                // engine's problem.
                warn!(
                    filename = %self.filename,
                    upload_id = self.upload_id,
                    offset,
                    "upload write failed, reconnecting: {e}"
                );
                self.disconnect().await;
                let (filename, upload_id) = (self.filename.clone(), self.upload_id);
                self.start_session(&filename, upload_id, offset).await?;
                self.write_at(offset, data).await?;
                self.auto_offset = offset + data.len() as u64;
                Ok(())
            }
        }
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), UploadError> {
        let stream = self.stream.as_mut().ok_or(UploadError::NotConnected)?;
        let header = format!("WRITEC {} {}\r\n", data.len(), offset);
        stream.write_all(header.as_bytes()).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Ends the session cleanly. Safe to call without an open session.
    pub async fn end_session(&mut self) -> Result<(), UploadError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream.write_all(b"CLOSE\r\n").await?;
        stream.flush().await?;
        let reply = read_reply_line(&mut stream).await?;
        if !reply.starts_with("OK") {
            return Err(UploadError::Refused {
                verb: "CLOSE",
                reply,
            });
        }
        stream.get_mut().shutdown().await.ok();
        Ok(())
    }

    /// Drops the connection without protocol, keeping the offset.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.get_mut().shutdown().await.ok();
        }
    }
}

async fn read_reply_line(stream: &mut BufStream<TcpStream>) -> Result<String, UploadError> {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(UploadError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "media server closed the connection",
        )));
    }
    Ok(line.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts one connection and records everything after answering the
    /// SIZE handshake with OK.
    async fn oneshot_server(listener: TcpListener) -> (String, Vec<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut handshake = Vec::new();
        let mut byte = [0u8; 1];
        while !handshake.ends_with(b"\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            handshake.push(byte[0]);
        }
        socket.write_all(b"OK\r\n").await.unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        (String::from_utf8(handshake).unwrap(), rest)
    }

    #[tokio::test]
    async fn handshake_and_auto_increment_offsets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(oneshot_server(listener));

        let mut client = MediaUploadClient::new(addr);
        client.start_session("show.mpg", 42, 0).await.unwrap();
        client.upload_auto_increment(b"aaaa").await.unwrap();
        client.upload_auto_increment(b"bb").await.unwrap();
        assert_eq!(client.auto_offset(), 6);
        client.disconnect().await;

        let (handshake, rest) = server.await.unwrap();
        assert_eq!(handshake, "SIZE show.mpg 42\r\n");
        let expected: Vec<u8> = b"WRITEC 4 0\r\naaaaWRITEC 2 4\r\nbb".to_vec();
        assert_eq!(rest, expected);
    }

    #[tokio::test]
    async fn buffered_writes_wrap_at_the_cap() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(oneshot_server(listener));

        let mut client = MediaUploadClient::new(addr);
        client.start_session("shift.mpg", 7, 0).await.unwrap();
        client.upload_auto_buffered(6, b"aaaa").await.unwrap();
        client.upload_auto_buffered(6, b"bb").await.unwrap();
        // Offset reached the cap; the next write wraps to 0.
        client.upload_auto_buffered(6, b"cc").await.unwrap();
        assert_eq!(client.auto_offset(), 2);
        client.disconnect().await;

        let (_, rest) = server.await.unwrap();
        let expected: Vec<u8> =
            b"WRITEC 4 0\r\naaaaWRITEC 2 4\r\nbbWRITEC 2 0\r\ncc".to_vec();
        assert_eq!(rest, expected);
    }

    #[tokio::test]
    async fn refused_handshake_surfaces_the_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"ERROR no such upload id\r\n").await.unwrap();
        });

        let mut client = MediaUploadClient::new(addr);
        let err = client.start_session("x.mpg", 1, 0).await.unwrap_err();
        assert!(matches!(err, UploadError::Refused { verb: "SIZE", .. }));
    }
}
