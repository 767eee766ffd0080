//! Byte-stream plumbing: identification line, serialized writer.
//!
//! One writer task per session owns the outbound cipher and compressor and
//! drains an unbounded queue of [`Outbound`] commands. Every packet is fully
//! written before the next one is encoded, so ciphertext never interleaves.
//! Cipher and compression switches travel through the same queue and take
//! effect exactly between two packets.
//!
//! The read side is driven by the session's reader task; this module only
//! provides [`read_version_line`], which hands any bytes that arrived after
//! the identification line to the packet decoder.

use crate::ssh1::cipher::Cipher;
use crate::ssh1::codec::{PacketDecoder, PacketEncoder};
use crate::ssh1::compress::Compressor;
use crate::ssh1::logging;
use crate::ssh1::packet::Packet;
use crate::ssh1::version::MAX_VERSION_LENGTH;
use std::io;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Lines a server may send before its identification line.
const MAX_BANNER_LINES: usize = 20;

/// Commands for the writer task.
pub enum Outbound {
    /// Unframed bytes (the identification line).
    Raw(Vec<u8>),
    /// A packet to encode and write.
    Packet(Packet),
    /// Encrypt every following packet with this cipher.
    ActivateCipher(Box<dyn Cipher>),
    /// Compress every following packet.
    ActivateCompression(Compressor),
    /// Acknowledged once everything queued before it is on the wire.
    Flush(oneshot::Sender<()>),
    /// Flush, shut the stream down and stop.
    Close,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Raw(bytes) => write!(f, "Raw({} bytes)", bytes.len()),
            Outbound::Packet(packet) => write!(f, "Packet({})", packet),
            Outbound::ActivateCipher(cipher) => write!(f, "ActivateCipher({})", cipher.kind()),
            Outbound::ActivateCompression(c) => write!(f, "ActivateCompression({})", c.level()),
            Outbound::Flush(_) => f.write_str("Flush"),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

/// Cloneable handle to the writer queue.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

fn writer_gone() -> TernError {
    TernError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "Connection writer has stopped",
    ))
}

impl PacketSender {
    fn push(&self, command: Outbound) -> TernResult<()> {
        self.tx.send(command).map_err(|_| writer_gone())
    }

    /// Queues a packet.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Io`] if the writer has stopped.
    pub fn send(&self, packet: Packet) -> TernResult<()> {
        logging::log_packet_sent(packet.msg_type(), packet.payload().len());
        self.push(Outbound::Packet(packet))
    }

    /// Queues unframed bytes.
    pub fn send_raw(&self, bytes: Vec<u8>) -> TernResult<()> {
        self.push(Outbound::Raw(bytes))
    }

    /// Switches the outbound cipher after everything queued so far.
    pub fn activate_cipher(&self, cipher: Box<dyn Cipher>) -> TernResult<()> {
        self.push(Outbound::ActivateCipher(cipher))
    }

    /// Switches on outbound compression after everything queued so far.
    pub fn activate_compression(&self, compressor: Compressor) -> TernResult<()> {
        self.push(Outbound::ActivateCompression(compressor))
    }

    /// Waits until everything queued so far has been written.
    pub async fn flush(&self) -> TernResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push(Outbound::Flush(ack_tx))?;
        ack_rx.await.map_err(|_| writer_gone())
    }

    /// Asks the writer to finish. Already queued packets are still sent.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Whether the writer is still accepting commands.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Creates a queue without a writer task, for driving the handshake or the
/// channel controller directly.
pub fn queue() -> (PacketSender, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketSender { tx }, rx)
}

/// Starts the writer task for `writer`.
pub fn spawn_writer<W>(writer: W) -> (PacketSender, JoinHandle<TernResult<()>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (sender, rx) = queue();
    let handle = tokio::spawn(run_writer(writer, rx));
    (sender, handle)
}

async fn run_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>) -> TernResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoder = PacketEncoder::new();
    while let Some(command) = rx.recv().await {
        match command {
            Outbound::Raw(bytes) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Outbound::Packet(packet) => {
                let wire = encoder.encode(&packet)?;
                trace!(bytes = wire.len(), "Writing packet");
                writer.write_all(&wire).await?;
                writer.flush().await?;
            }
            Outbound::ActivateCipher(cipher) => {
                debug!(cipher = %cipher.kind(), "Outbound cipher active");
                encoder.set_cipher(cipher);
            }
            Outbound::ActivateCompression(compressor) => {
                debug!(level = compressor.level(), "Outbound compression active");
                encoder.enable_compression(compressor);
            }
            Outbound::Flush(ack) => {
                writer.flush().await?;
                let _ = ack.send(());
            }
            Outbound::Close => {
                writer.flush().await?;
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    debug!("Writer stopped");
    Ok(())
}

/// Reads the server identification line.
///
/// Lines before it that do not start with `SSH-` are skipped. Bytes received
/// after the line are fed to `decoder`. The returned line has its line
/// terminator removed.
///
/// # Errors
///
/// - [`TernError::Io`] if the stream ends first
/// - [`TernError::Protocol`] if a line is too long or too many banner
///   lines arrive
pub async fn read_version_line<R>(reader: &mut R, decoder: &mut PacketDecoder) -> TernResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::with_capacity(256);
    let mut skipped = 0;
    let mut chunk = [0u8; 512];

    loop {
        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(|c: char| c == '\r' || c == '\n')
                .to_string();
            if text.starts_with("SSH-") {
                decoder.feed(&pending);
                return Ok(text);
            }
            skipped += 1;
            debug!(line = %text, "Skipping pre-identification line");
            if skipped > MAX_BANNER_LINES {
                return Err(TernError::Protocol(
                    "Too many lines before the server identification".to_string(),
                ));
            }
        }
        if pending.len() > MAX_VERSION_LENGTH {
            return Err(TernError::Protocol(format!(
                "Identification line longer than {} bytes",
                MAX_VERSION_LENGTH
            )));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(TernError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed before server identification",
            )));
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh1::cipher::{CipherKind, Direction};
    use crate::ssh1::codec::Decoded;
    use crate::ssh1::message::MessageType;

    #[tokio::test]
    async fn test_version_line_with_banner_and_leftover() {
        let mut packet = Packet::new(MessageType::Ignore);
        packet.put_string(b"x");
        let mut wire = b"Welcome\r\nSSH-1.5-Test\r\n".to_vec();
        wire.extend_from_slice(&PacketEncoder::new().encode(&packet).unwrap());

        let mut decoder = PacketDecoder::new();
        let mut reader = &wire[..];
        let line = read_version_line(&mut reader, &mut decoder).await.unwrap();
        assert_eq!(line, "SSH-1.5-Test");
        assert!(decoder.buffered() > 0);
        assert_eq!(decoder.next_raw().unwrap(), Decoded::Complete(packet));
    }

    #[tokio::test]
    async fn test_version_line_eof() {
        let mut decoder = PacketDecoder::new();
        let mut reader: &[u8] = b"SSH-1.5-no-newline";
        let err = read_version_line(&mut reader, &mut decoder).await.unwrap_err();
        assert!(matches!(err, TernError::Io(_)));
    }

    #[tokio::test]
    async fn test_version_line_too_long() {
        let mut decoder = PacketDecoder::new();
        let long = vec![b'a'; 1024];
        let mut reader = &long[..];
        let err = read_version_line(&mut reader, &mut decoder).await.unwrap_err();
        assert!(err.to_string().contains("longer than"));
    }

    #[tokio::test]
    async fn test_writer_applies_cipher_between_packets() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (sender, handle) = spawn_writer(client);

        let key = [3u8; 32];
        let mut send_cipher = CipherKind::Des.create();
        send_cipher.set_key(Direction::Encrypt, &key).unwrap();

        let mut first = Packet::new(MessageType::User);
        first.put_string(b"plain");
        let mut second = Packet::new(MessageType::User);
        second.put_string(b"secret");

        sender.send_raw(b"SSH-1.5-x\n".to_vec()).unwrap();
        sender.send(first.clone()).unwrap();
        sender.activate_cipher(send_cipher).unwrap();
        sender.send(second.clone()).unwrap();
        sender.flush().await.unwrap();
        sender.close();
        handle.await.unwrap().unwrap();

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert!(wire.starts_with(b"SSH-1.5-x\n"));

        let mut decoder = PacketDecoder::new();
        decoder.feed(&wire[10..]);
        assert_eq!(decoder.next().unwrap(), Decoded::Complete(first));

        let mut recv_cipher = CipherKind::Des.create();
        recv_cipher.set_key(Direction::Decrypt, &key).unwrap();
        decoder.set_cipher(recv_cipher);
        assert_eq!(decoder.next().unwrap(), Decoded::Complete(second));
    }

    #[tokio::test]
    async fn test_sender_after_close() {
        let (client, _server) = tokio::io::duplex(64);
        let (sender, handle) = spawn_writer(client);
        sender.close();
        handle.await.unwrap().unwrap();
        assert!(sender.send(Packet::new(MessageType::Eof)).is_err());
        assert!(!sender.is_open());
    }
}
