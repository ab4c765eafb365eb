//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::bail;

use crate::diffie_hellman::KEY_HEX_SIZE;

/// 4-byte magic at the beginning of an encrypted file.
pub const DEFAULT_FILE_MAGIC: [u8; 4] = *b"CHED";

/// Blowfish key used by the file encryption.
pub const DEFAULT_FILE_KEY: [u8; 16] = *b"}]#Su?Y}q!^f*S5O";

/// Blowfish initialization vector used by the file encryption.
pub const DEFAULT_FILE_IV: [u8; 8] = *b"P[?jd6c4";

pub struct ServerConfig {
    /// Address to listen on. Empty or `"any"` binds 0.0.0.0.
    pub listen_address: String,

    pub port: u16,

    /// Persisted Diffie-Hellman prime, 256 hex digits. When absent, the
    /// server generates a parameter set on the first accept and logs the
    /// prime so it can be persisted here.
    pub dh_prime: Option<String>,

    pub file_magic: [u8; 4],
    pub file_key: [u8; 16],
    pub file_iv: [u8; 8],
}

impl ServerConfig {
    pub fn default_lobby(port: u16) -> ServerConfig {
        ServerConfig {
            listen_address: "any".to_string(),
            port,
            dh_prime: None,
            file_magic: DEFAULT_FILE_MAGIC,
            file_key: DEFAULT_FILE_KEY,
            file_iv: DEFAULT_FILE_IV,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(prime) = &self.dh_prime {
            if prime.len() != KEY_HEX_SIZE {
                bail!(
                    "configured DH prime must be {} hex digits, got {}",
                    KEY_HEX_SIZE,
                    prime.len()
                );
            }

            if !prime.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("configured DH prime is not a hex string");
            }
        }

        Ok(())
    }

    /// The socket address to bind the listener to.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let address = if self.listen_address.is_empty()
            || self.listen_address.eq_ignore_ascii_case("any")
        {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            self.listen_address.parse()?
        };

        Ok(SocketAddr::new(address, self.port))
    }
}
