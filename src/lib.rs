//! Networking foundation of a game lobby server.
//!
//! Clients open a TCP connection, negotiate a per-session symmetric key
//! via Diffie-Hellman, and then exchange length-prefixed,
//! Blowfish-encrypted frames carrying one or more application-level
//! commands. This crate is the encrypted framed-packet transport between
//! a raw socket and the command handlers; dispatch, persistence and the
//! rest of the application live elsewhere and consume decoded commands
//! from a [`message::MessageQueue`].
//!
//! ## Handshake
//!
//! The client greets with `u32_be(1) || u32_be(8)`. The server replies
//! with
//!
//! ```ascii
//! 0: u32_be 0
//! 4: base string    (u32_be length || UTF-8, always "2")
//! *: prime          (u32_be length || 256 hex digits)
//! *: server public  (u32_be length || 256 hex digits)
//! ```
//!
//! and the client answers with its own length-prefixed public value. Both
//! sides derive a 128-byte shared secret; its first 8 bytes become the
//! session Blowfish key.
//!
//! ## Steady state
//!
//! Every frame on an established connection is
//!
//! ```ascii
//! 0: padded size (u32 BE)  - ciphertext length, a multiple of 8
//! 4: real size   (u32 BE)  - plaintext length inside
//! 8: Blowfish-ECB ciphertext
//! ```
//!
//! The decrypted body holds zero or more commands, each
//!
//! ```ascii
//! 0: advisory size (u16 BE, logged but never enforced)
//! 2: size          (u16 LE, counts itself, the code and the body)
//! 4: command code  (u16 LE)
//! 6: body          (size - 4 bytes)
//! ```
//!
//! followed by `padded - real` bytes of zero padding.

pub mod codec;
pub mod config;
pub mod connection;
pub mod diffie_hellman;
pub mod encryption;
pub mod error;
pub mod message;
pub mod packet;
pub mod read_only_packet;
pub mod ring_buffer;
pub mod server;

pub use connection::{Connection, ConnectionStatus, Role};
pub use message::{Message, MessageQueue};
pub use packet::Packet;
pub use read_only_packet::{PacketRead, ReadOnlyPacket, MAX_PACKET_SIZE};
pub use server::TcpServer;
