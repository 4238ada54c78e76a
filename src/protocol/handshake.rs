use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::lenenc::{ensure, get_u8};
use super::packet::{capabilities::*, Packet};
use super::ProtocolError;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Initial handshake sent by a backend server after accept
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Full scramble (part 1 followed by part 2)
    pub scramble: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Build a handshake for a server advertising `scramble`
    pub fn new(server_version: &str, connection_id: u32, scramble: [u8; 20]) -> Self {
        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            capability_flags: DEFAULT_CAPABILITIES | CLIENT_CONNECT_WITH_DB,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            scramble: scramble.to_vec(),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();
        let (part1, part2) = self.scramble.split_at(self.scramble.len().min(8));

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(part1);
        buf.put_u8(0);
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capability_flags >> 16) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.scramble.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }
        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(part2);
            buf.put_u8(0);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut buf = payload.clone();

        let protocol_version = get_u8(&mut buf)?;
        if protocol_version != 10 {
            return Err(ProtocolError::Malformed(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }
        let server_version = take_null_terminated(&mut buf)?;

        ensure(&buf, 4 + 8 + 1 + 2)?;
        let connection_id = buf.get_u32_le();
        let mut scramble = buf.split_to(8).to_vec();
        buf.advance(1);
        let mut capability_flags = buf.get_u16_le() as u32;

        let mut character_set = 0;
        let mut status_flags = 0;
        let mut auth_plugin_name = NATIVE_PASSWORD_PLUGIN.to_string();

        // Servers may stop after the lower capability flags
        if buf.remaining() >= 16 {
            character_set = buf.get_u8();
            status_flags = buf.get_u16_le();
            capability_flags |= (buf.get_u16_le() as u32) << 16;
            let auth_data_len = buf.get_u8() as usize;
            buf.advance(10);

            if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
                let len = auth_data_len.saturating_sub(8).max(13).min(buf.remaining());
                let part2 = buf.split_to(len);
                let data_len = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
                scramble.extend_from_slice(&part2[..data_len]);
            }
            if capability_flags & CLIENT_PLUGIN_AUTH != 0 && buf.has_remaining() {
                auth_plugin_name = take_null_terminated(&mut buf)?;
            }
        }

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            scramble,
            auth_plugin_name,
        })
    }
}

/// Handshake response sent by the proxy to a backend
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Answer `handshake` with native password credentials
    pub fn for_backend(
        handshake: &InitialHandshake,
        username: &str,
        password: &str,
        database: Option<&str>,
    ) -> Self {
        let mut capability_flags = DEFAULT_CAPABILITIES & handshake.capability_flags;
        if database.is_some() {
            capability_flags |= CLIENT_CONNECT_WITH_DB;
        }
        Self {
            capability_flags,
            max_packet_size: super::packet::MAX_PACKET_SIZE as u32,
            character_set: handshake.character_set,
            username: username.to_string(),
            auth_response: compute_auth_response(password, &handshake.scramble),
            database: database.map(str::to_string),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Parse from packet payload
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut buf = payload.clone();

        ensure(&buf, 32)?;
        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23);

        let username = take_null_terminated(&mut buf)?;

        let auth_response = if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = get_u8(&mut buf)? as usize;
            ensure(&buf, len)?;
            buf.split_to(len).to_vec()
        } else {
            take_null_terminated(&mut buf)?.into_bytes()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && buf.has_remaining() {
            Some(take_null_terminated(&mut buf)?).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && buf.has_remaining() {
            take_null_terminated(&mut buf)?
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute mysql_native_password auth response
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = Sha1::digest(password.as_bytes());
    // SHA1(SHA1(password))
    let stage2 = Sha1::digest(stage1);

    // SHA1(scramble + stage2)
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let token = hasher.finalize();

    stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect()
}

fn take_null_terminated(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::Malformed("missing string terminator".into()))?;
    let value = String::from_utf8_lossy(&buf[..end]).to_string();
    buf.advance(end + 1);
    Ok(value)
}
