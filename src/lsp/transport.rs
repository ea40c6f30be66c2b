//! Message transport
//!
//! A transport is a pair of string channels: bodies queued on `outgoing` reach
//! the server in order, bodies from the server arrive on `incoming`. The
//! channel closes when the server goes away. Over stdio every body is framed
//! with a `Content-Length` header:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! <JSON payload>
//! ```

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Client end of a transport
pub struct TransportChannels {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Server end of an in-memory transport
pub struct PeerChannels {
    /// Messages sent by the client
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Messages delivered to the client; dropping it closes the connection
    pub outgoing: mpsc::UnboundedSender<String>,
}

impl TransportChannels {
    /// Create a connected in-memory transport
    pub fn memory_pair() -> (TransportChannels, PeerChannels) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        (
            TransportChannels {
                outgoing: client_tx,
                incoming: client_rx,
            },
            PeerChannels {
                incoming: server_rx,
                outgoing: server_tx,
            },
        )
    }
}

/// Frame one message body
pub fn encode_message(body: &str) -> Vec<u8> {
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(body.as_bytes());
    framed
}

/// Read one framed message; `Ok(None)` means the stream ended cleanly
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }

            let line = line.trim();
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }

            saw_header = true;
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }

        let Some(len) = content_length else {
            warn!("Language server message missing Content-Length header");
            continue;
        };

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;

        return String::from_utf8(body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
    }
}

/// Run a framed transport over any reader/writer pair (usually child stdio)
pub fn spawn_framed<R, W>(reader: R, writer: W) -> TransportChannels
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
    let (read_tx, read_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(body) = write_rx.recv().await {
            trace!("LSP TX: {}", body);
            if let Err(e) = writer.write_all(&encode_message(&body)).await {
                error!("Failed to write to language server: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush language server stdin: {}", e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_message(&mut reader).await {
                Ok(Some(body)) => {
                    trace!("LSP RX: {}", body);
                    if read_tx.send(body).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Language server closed its output");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from language server: {}", e);
                    break;
                }
            }
        }
    });

    TransportChannels {
        outgoing: write_tx,
        incoming: read_rx,
    }
}

/// Forward a server's stderr to the log
pub fn forward_stderr<R>(stderr: R, label: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %label, "stderr: {}", line);
        }
    });
}
