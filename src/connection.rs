//! The per-connection state machine.
//!
//! A connection starts in a role-specific handshake, negotiates a session
//! key over Diffie-Hellman, and then settles into the encrypted steady
//! state where every frame is decrypted in place and decomposed into
//! commands that are enqueued for the workers. Any error is fatal to the
//! connection only: one error line is logged with the remote address, the
//! socket is shut down, the outgoing queue is discarded, and the key
//! agreement state is dropped. The listener and the shared parameters
//! survive.
//!
//! Each state's packet handler is a variant of a sum type rather than a
//! function pointer, so a torn-down connection cannot dispatch into a
//! stale handler. Once the steady state is reached the parser never
//! reverts to a handshake variant.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::codec::Encoding;
use crate::diffie_hellman::{self, DhContext, DhParams};
use crate::encryption::{self, BlowfishKey, NET_KEY_BYTE_SIZE};
use crate::error::{CryptoError, Error, FramingError, PacketError};
use crate::message::{Message, MessageQueue};
use crate::packet::Packet;
use crate::read_only_packet::{PacketRead, ReadOnlyPacket};

/// Time until an idle client is expected to have timed out and
/// disconnected.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time until the server closes a socket with no clean close observed.
/// Slightly longer than [`CLIENT_TIMEOUT`] so a client that still can
/// disconnect cleanly gets to do so first.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(17);

const SIZE_FIELDS: u32 = 2 * std::mem::size_of::<u32>() as u32;
const COMMAND_HEADER_SIZE: u32 = 3 * std::mem::size_of::<u16>() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    WaitingEncryption,
    Encrypted,
}

/// The current state's packet handler.
enum PacketParser {
    ClientEncryptionStart,
    ServerEncryptionStart,
    ServerEncryptionFinish,
    Steady,
}

pub struct Connection {
    self_ref: Weak<Connection>,
    role: Role,
    remote_address: String,
    status: watch::Sender<ConnectionStatus>,
    encryption_key: Mutex<Option<BlowfishKey>>,
    outgoing: Mutex<VecDeque<ReadOnlyPacket>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    message_queue: Arc<MessageQueue<Message>>,
}

impl Connection {
    /// Wrap an accepted socket. The connection gets its own copy of the
    /// shared Diffie-Hellman parameters and starts waiting for the client
    /// greeting.
    pub fn accepted(
        stream: TcpStream,
        diffie_hellman: DhParams,
        message_queue: Arc<MessageQueue<Message>>,
    ) -> Arc<Connection> {
        let remote_address = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        debug!("client connection: {}", remote_address);

        let (read_half, write_half) = stream.into_split();

        let (status, _) = watch::channel(ConnectionStatus::Connected);
        let connection = Arc::new_cyclic(|self_ref| Connection {
            self_ref: self_ref.clone(),
            role: Role::Server,
            remote_address,
            status,
            encryption_key: Mutex::new(None),
            outgoing: Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            message_queue,
        });

        tokio::spawn(receive_loop(
            connection.clone(),
            read_half,
            PacketParser::ServerEncryptionStart,
            Some(diffie_hellman.create_context()),
        ));

        connection
    }

    /// Dial a server and initiate the handshake.
    pub async fn connect(
        host: &str,
        port: u16,
        message_queue: Arc<MessageQueue<Message>>,
    ) -> anyhow::Result<Arc<Connection>> {
        // The status channel outlives the dial so the connection moves
        // through Connecting before Connected.
        let (status, _) = watch::channel(ConnectionStatus::Connecting);

        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;

        let remote_address = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        debug!("connected to server: {}", remote_address);
        status.send_replace(ConnectionStatus::Connected);

        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new_cyclic(|self_ref| Connection {
            self_ref: self_ref.clone(),
            role: Role::Client,
            remote_address,
            status,
            encryption_key: Mutex::new(None),
            outgoing: Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            message_queue,
        });

        let mut greeting = Packet::new();
        greeting.write_u32_be(1)?;
        greeting.write_u32_be(8)?;
        connection.send_packet(greeting);

        tokio::spawn(receive_loop(
            connection.clone(),
            read_half,
            PacketParser::ClientEncryptionStart,
            None,
        ));

        Ok(connection)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn message_queue(&self) -> &Arc<MessageQueue<Message>> {
        &self.message_queue
    }

    /// Wait until the handshake settles. Returns `true` when the
    /// connection reached the encrypted steady state, `false` when it was
    /// torn down first.
    pub async fn encrypted(&self) -> bool {
        let mut status = self.status.subscribe();

        let result = match status
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionStatus::Encrypted | ConnectionStatus::NotConnected
                )
            })
            .await
        {
            Ok(status) => *status == ConnectionStatus::Encrypted,
            Err(_) => false,
        };
        result
    }

    /// Wait until the connection is torn down.
    pub async fn disconnected(&self) {
        let mut status = self.status.subscribe();

        let _ = status
            .wait_for(|s| *s == ConnectionStatus::NotConnected)
            .await;
    }

    /// Queue a frame for sending. Frames go out in call order with at
    /// most one write in flight; the first frame on an empty queue kicks
    /// off the drain task.
    pub fn send_packet(&self, packet: impl Into<ReadOnlyPacket>) {
        let packet = packet.into();

        let first_packet = {
            let mut outgoing = self.outgoing.lock().expect("outgoing queue poisoned");
            let first_packet = outgoing.is_empty();
            outgoing.push_back(packet);
            first_packet
        };

        if first_packet {
            // The drain task keeps the connection alive until the queue
            // empties; a connection already being dropped has nobody left
            // to send to.
            if let Some(connection) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    connection.send_next_packet().await;
                });
            }
        }
    }

    /// Wrap `body` in the frame envelope, encrypt it with the session
    /// key, and queue it.
    pub fn send_encrypted(&self, body: &impl PacketRead) -> Result<(), Error> {
        let key = self
            .encryption_key
            .lock()
            .expect("encryption key poisoned")
            .clone()
            .ok_or(CryptoError::NotEncrypted)?;

        let mut frame = Packet::new();
        frame.write_blank(SIZE_FIELDS)?;
        frame.write_array(body.data())?;
        encryption::encrypt_packet(&key, &mut frame)?;

        self.send_packet(frame);
        Ok(())
    }

    async fn send_next_packet(&self) {
        loop {
            let frame = {
                self.outgoing
                    .lock()
                    .expect("outgoing queue poisoned")
                    .front()
                    .cloned()
            };

            let Some(frame) = frame else {
                return;
            };

            let result = {
                let mut writer = self.writer.lock().await;

                match writer.as_mut() {
                    Some(writer) => writer.write_all(frame.const_data()).await,
                    // Already torn down; the queue was discarded with it.
                    None => return,
                }
            };

            if let Err(e) = result {
                self.socket_error(&format!("send failed: {e}")).await;
                return;
            }

            let more = {
                let mut outgoing = self.outgoing.lock().expect("outgoing queue poisoned");
                outgoing.pop_front();
                !outgoing.is_empty()
            };

            if !more {
                return;
            }
        }
    }

    fn set_encryption_key(&self, shared: &[u8]) -> Result<(), CryptoError> {
        if shared.len() < NET_KEY_BYTE_SIZE {
            return Err(CryptoError::InvalidKeyLength(shared.len()));
        }

        let key = BlowfishKey::new(&shared[..NET_KEY_BYTE_SIZE])?;
        *self.encryption_key.lock().expect("encryption key poisoned") = Some(key);
        Ok(())
    }

    /// Tear the connection down. Logs one error line with the remote
    /// address, unless the connection is already gone.
    pub(crate) async fn socket_error(&self, message: &str) {
        if self.status() != ConnectionStatus::NotConnected {
            error!(
                "socket error for client from {}: {}",
                self.remote_address, message
            );
        }

        self.teardown().await;
    }

    /// Close without logging an error.
    pub async fn close(&self) {
        if self.status() != ConnectionStatus::NotConnected {
            debug!("client disconnect: {}", self.remote_address);
        }

        self.teardown().await;
    }

    async fn teardown(&self) {
        self.status.send_replace(ConnectionStatus::NotConnected);
        self.outgoing
            .lock()
            .expect("outgoing queue poisoned")
            .clear();
        // Dropping the write half shuts the socket down; the receive loop
        // observes the close and exits.
        self.writer.lock().await.take();
    }
}

/// Send the same frame to every connection. The frame's backing bytes are
/// shared, not copied.
pub fn broadcast(connections: &[Arc<Connection>], packet: &ReadOnlyPacket) {
    for connection in connections {
        connection.send_packet(packet.clone());
    }
}

/// Serialise one command into `packet`: advisory big-endian size, then
/// the authoritative little-endian size and code, then the body.
pub fn write_command(
    packet: &mut Packet,
    command_code: u16,
    body: &[u8],
) -> Result<(), PacketError> {
    let total = body.len() + 2 * std::mem::size_of::<u16>();

    if total > u16::MAX as usize {
        return Err(packet.bounds_error(format!(
            "command body of {} bytes does not fit a u16 size field",
            body.len()
        )));
    }

    packet.write_u16_be(total as u16)?;
    packet.write_u16_le(total as u16)?;
    packet.write_u16_le(command_code)?;
    packet.write_array(body)?;
    Ok(())
}

/// Decompose a decrypted frame into `(command_code, body)` pairs.
///
/// Each command carries a 2-byte big-endian size that is advisory only
/// (logged when it disagrees, never enforced), then the authoritative
/// little-endian size and code. The trailing `padded - real` bytes are
/// padding; a command running off the end, or leftover data that is not
/// exactly the padding, is a framing error.
pub fn extract_commands(
    frame: &ReadOnlyPacket,
    padded_size: u32,
    real_size: u32,
) -> Result<Vec<(u16, ReadOnlyPacket)>, Error> {
    if real_size > padded_size {
        return Err(FramingError::BadSizes {
            padded: padded_size,
            real: real_size,
        }
        .into());
    }

    let padding = padded_size - real_size;
    let mut view = frame.clone();
    view.seek(SIZE_FIELDS)?;

    let mut commands = Vec::new();

    while view.left() > padding {
        if view.left() < COMMAND_HEADER_SIZE {
            return Err(FramingError::CommandHeaderTruncated { left: view.left() }.into());
        }

        let advisory_size = view.read_u16_be()?;
        let command_start = view.tell();
        let command_size = view.read_u16_le()?;
        let command_code = view.read_u16_le()?;

        if advisory_size != command_size {
            debug!(
                "command {:#06x} advisory size {} disagrees with authoritative size {}",
                command_code, advisory_size, command_size
            );
        }

        // With no body, a command is exactly the size and code fields.
        if command_size < 2 * std::mem::size_of::<u16>() as u16 {
            return Err(FramingError::CommandTooShort { size: command_size }.into());
        }

        let body_size = u32::from(command_size) - 2 * std::mem::size_of::<u16>() as u32;

        if view.left() < body_size {
            debug!("corrupt frame:\n{}", frame.dump());
            return Err(FramingError::CommandOverrun {
                size: command_size,
                left: view.left(),
            }
            .into());
        }

        let body = frame.view(command_start + 2 * std::mem::size_of::<u16>() as u32, body_size)?;
        commands.push((command_code, body));

        view.seek(command_start + u32::from(command_size))?;
    }

    // Advancing past the last command must leave exactly the padding.
    if view.left() != padding {
        return Err(FramingError::TrailingData { left: view.left() }.into());
    }

    view.skip(padding)?;
    Ok(commands)
}

/// Append exactly `count` bytes from the socket to `packet`.
async fn request_packet(
    packet: &mut Packet,
    read_half: &mut OwnedReadHalf,
    count: u32,
    deadline: Duration,
) -> anyhow::Result<()> {
    let start = packet.size() as usize;
    let total = packet.size() + count;
    let data = packet.direct(total)?;

    tokio::time::timeout(deadline, read_half.read_exact(&mut data[start..]))
        .await
        .map_err(|_| anyhow!("timed out waiting for packet data"))?
        .context("socket read failed")?;

    Ok(())
}

/// Drive one connection from handshake to teardown.
async fn receive_loop(
    connection: Arc<Connection>,
    mut read_half: OwnedReadHalf,
    mut parser: PacketParser,
    mut dh_context: Option<DhContext>,
) {
    let deadline = match connection.role {
        Role::Client => CLIENT_TIMEOUT,
        Role::Server => SOCKET_TIMEOUT,
    };

    let mut packet = Packet::new();

    loop {
        let step = match parser {
            PacketParser::ClientEncryptionStart => {
                client_encryption_start(&connection, &mut read_half, &mut packet, deadline).await
            }
            PacketParser::ServerEncryptionStart => {
                server_encryption_start(
                    &connection,
                    &mut read_half,
                    &mut packet,
                    deadline,
                    &dh_context,
                )
                .await
            }
            PacketParser::ServerEncryptionFinish => {
                server_encryption_finish(
                    &connection,
                    &mut read_half,
                    &mut packet,
                    deadline,
                    &mut dh_context,
                )
                .await
            }
            PacketParser::Steady => {
                parse_frame(&connection, &mut read_half, &mut packet, deadline).await
            }
        };

        match step {
            Ok(next) => parser = next,
            Err(e) => {
                // Fatal to this connection only. Returning drops the read
                // half and any remaining key agreement state.
                connection.socket_error(&format!("{e:#}")).await;
                return;
            }
        }
    }
}

/// Client role: parse the server's `0 || base || prime || server public`
/// reply, complete the key agreement, and send our public back.
async fn client_encryption_start(
    connection: &Arc<Connection>,
    read_half: &mut OwnedReadHalf,
    packet: &mut Packet,
    deadline: Duration,
) -> anyhow::Result<PacketParser> {
    let expected = (diffie_hellman::BASE_STRING.len()
        + 2 * diffie_hellman::KEY_HEX_SIZE
        + 4 * std::mem::size_of::<u32>()) as u32;
    request_packet(packet, read_half, expected - packet.size(), deadline).await?;
    packet.rewind();

    if packet.read_u32_be()? != 0 {
        bail!("failed to parse encryption data");
    }

    if packet.peek_u32_be()? as usize != diffie_hellman::BASE_STRING.len() {
        bail!("failed to parse encryption base");
    }

    let base = packet.read_string32_be(Encoding::Utf8)?;

    if base != diffie_hellman::BASE_STRING {
        bail!(
            "failed to parse encryption base (not {})",
            diffie_hellman::BASE_STRING
        );
    }

    if packet.peek_u32_be()? as usize != diffie_hellman::KEY_HEX_SIZE {
        bail!("failed to parse encryption prime");
    }

    let prime = packet.read_string32_be(Encoding::Utf8)?;

    if packet.peek_u32_be()? as usize != diffie_hellman::KEY_HEX_SIZE {
        bail!("failed to parse encryption server public");
    }

    let server_public = packet.read_string32_be(Encoding::Utf8)?;

    if packet.left() != 0 {
        bail!("read too much data for packet");
    }

    connection
        .status
        .send_replace(ConnectionStatus::WaitingEncryption);

    let context = DhParams::load_hex(&prime)?.create_context();
    let client_public = context.public_hex();
    let shared = context.shared_secret(&server_public)?;

    let mut reply = Packet::new();
    reply.write_string32_be(Encoding::Utf8, &client_public, false)?;
    connection.send_packet(reply);

    connection.set_encryption_key(&shared)?;
    connection.status.send_replace(ConnectionStatus::Encrypted);
    debug!("connection encrypted: {}", connection.remote_address);

    packet.clear();
    Ok(PacketParser::Steady)
}

/// Server role: await the client greeting, then send
/// `0 || base || prime || server public`.
async fn server_encryption_start(
    connection: &Arc<Connection>,
    read_half: &mut OwnedReadHalf,
    packet: &mut Packet,
    deadline: Duration,
    dh_context: &Option<DhContext>,
) -> anyhow::Result<PacketParser> {
    request_packet(packet, read_half, SIZE_FIELDS - packet.size(), deadline).await?;
    packet.rewind();

    let first = packet.read_u32_be()?;
    let second = packet.read_u32_be()?;

    if packet.left() != 0 || first != 1 || second != 8 {
        bail!("unexpected client greeting");
    }

    connection
        .status
        .send_replace(ConnectionStatus::WaitingEncryption);

    let context = dh_context
        .as_ref()
        .ok_or_else(|| anyhow!("server connection without key agreement state"))?;

    let mut reply = Packet::new();
    reply.write_blank(4)?;
    reply.write_string32_be(Encoding::Utf8, diffie_hellman::BASE_STRING, false)?;
    reply.write_string32_be(Encoding::Utf8, &context.params().prime_hex(), false)?;
    reply.write_string32_be(Encoding::Utf8, &context.public_hex(), false)?;
    connection.send_packet(reply);

    packet.clear();
    Ok(PacketParser::ServerEncryptionFinish)
}

/// Server role: receive the client public and complete the agreement.
async fn server_encryption_finish(
    connection: &Arc<Connection>,
    read_half: &mut OwnedReadHalf,
    packet: &mut Packet,
    deadline: Duration,
    dh_context: &mut Option<DhContext>,
) -> anyhow::Result<PacketParser> {
    let expected = (diffie_hellman::KEY_HEX_SIZE + std::mem::size_of::<u32>()) as u32;
    request_packet(packet, read_half, expected - packet.size(), deadline).await?;
    packet.rewind();

    if packet.peek_u32_be()? as usize != diffie_hellman::KEY_HEX_SIZE {
        bail!("failed to parse encryption client public");
    }

    let client_public = packet.read_string32_be(Encoding::Utf8)?;

    if packet.left() != 0 {
        bail!("read too much data for packet");
    }

    // The agreement state is no longer needed once the key is set.
    let context = dh_context
        .take()
        .ok_or_else(|| anyhow!("server connection without key agreement state"))?;
    let shared = context.shared_secret(&client_public)?;

    connection.set_encryption_key(&shared)?;
    connection.status.send_replace(ConnectionStatus::Encrypted);
    debug!("connection encrypted: {}", connection.remote_address);

    packet.clear();
    Ok(PacketParser::Steady)
}

/// Encrypted steady state: buffer one frame, decrypt it in place, and
/// enqueue every embedded command.
async fn parse_frame(
    connection: &Arc<Connection>,
    read_half: &mut OwnedReadHalf,
    packet: &mut Packet,
    deadline: Duration,
) -> anyhow::Result<PacketParser> {
    if connection.status() != ConnectionStatus::Encrypted {
        bail!("connection should be encrypted but isn't");
    }

    request_packet(packet, read_half, SIZE_FIELDS - packet.size(), deadline).await?;
    packet.rewind();

    let padded_size = packet.read_u32_be()?;
    let real_size = packet.read_u32_be()?;

    request_packet(packet, read_half, padded_size, deadline).await?;

    let key = connection
        .encryption_key
        .lock()
        .expect("encryption key poisoned")
        .clone()
        .ok_or_else(|| anyhow!("connection should be encrypted but isn't"))?;

    encryption::decrypt_packet(&key, packet)?;

    let frame = packet.take_read_only();

    for (command_code, body) in extract_commands(&frame, padded_size, real_size)? {
        connection.message_queue.enqueue(Message {
            connection: connection.clone(),
            command_code,
            packet: body,
        });
    }

    Ok(PacketParser::Steady)
}
