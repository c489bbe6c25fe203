//! Fixed-size handshake message layouts.
//!
//! ```text
//! Initiation (145): type | sender u32 LE | ephemeral 32 | static 32+16
//!                   | timestamp 12+16 | mac1 16 | mac2 16
//! Response    (89): type | sender | receiver | ephemeral 32 | empty 0+16
//!                   | mac1 16 | mac2 16
//! CookieReply (61): type | receiver | nonce 24 | cookie 16+16
//! ```

use super::{NoiseError, MAC_SIZE, PUBKEY_SIZE, TAG_SIZE, TIMESTAMP_SIZE};
use crate::protocol::Usage;

pub const INITIATION_SIZE: usize =
    1 + 4 + PUBKEY_SIZE + (PUBKEY_SIZE + TAG_SIZE) + (TIMESTAMP_SIZE + TAG_SIZE) + 2 * MAC_SIZE;
pub const RESPONSE_SIZE: usize = 1 + 4 + 4 + PUBKEY_SIZE + TAG_SIZE + 2 * MAC_SIZE;
pub const COOKIE_REPLY_SIZE: usize = 1 + 4 + COOKIE_NONCE_SIZE + MAC_SIZE + TAG_SIZE;

pub(crate) const COOKIE_NONCE_SIZE: usize = 24;

fn check_header(buf: &[u8], usage: Usage, size: usize) -> Result<(), NoiseError> {
    if buf.len() != size {
        return Err(NoiseError::MessageTooShort {
            expected: size,
            got: buf.len(),
        });
    }
    if buf[0] != usage as u8 {
        return Err(NoiseError::InvalidMessageType(buf[0]));
    }
    Ok(())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Handshake initiation (`-> e, es, s, ss, {timestamp}`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInitiation {
    pub sender: u32,
    pub ephemeral: [u8; PUBKEY_SIZE],
    pub encrypted_static: [u8; PUBKEY_SIZE + TAG_SIZE],
    pub encrypted_timestamp: [u8; TIMESTAMP_SIZE + TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

impl MessageInitiation {
    pub fn to_bytes(&self) -> [u8; INITIATION_SIZE] {
        let mut out = [0u8; INITIATION_SIZE];
        out[0] = Usage::Initiation as u8;
        out[1..5].copy_from_slice(&self.sender.to_le_bytes());
        out[5..37].copy_from_slice(&self.ephemeral);
        out[37..85].copy_from_slice(&self.encrypted_static);
        out[85..113].copy_from_slice(&self.encrypted_timestamp);
        out[113..129].copy_from_slice(&self.mac1);
        out[129..145].copy_from_slice(&self.mac2);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, NoiseError> {
        check_header(buf, Usage::Initiation, INITIATION_SIZE)?;
        Ok(Self {
            sender: read_u32(buf, 1),
            ephemeral: array(buf, 5),
            encrypted_static: array(buf, 37),
            encrypted_timestamp: array(buf, 85),
            mac1: array(buf, 113),
            mac2: array(buf, 129),
        })
    }
}

/// Handshake response (`<- e, ee, se, psk, {}`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageResponse {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; PUBKEY_SIZE],
    pub encrypted_nothing: [u8; TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

impl MessageResponse {
    pub fn to_bytes(&self) -> [u8; RESPONSE_SIZE] {
        let mut out = [0u8; RESPONSE_SIZE];
        out[0] = Usage::Response as u8;
        out[1..5].copy_from_slice(&self.sender.to_le_bytes());
        out[5..9].copy_from_slice(&self.receiver.to_le_bytes());
        out[9..41].copy_from_slice(&self.ephemeral);
        out[41..57].copy_from_slice(&self.encrypted_nothing);
        out[57..73].copy_from_slice(&self.mac1);
        out[73..89].copy_from_slice(&self.mac2);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, NoiseError> {
        check_header(buf, Usage::Response, RESPONSE_SIZE)?;
        Ok(Self {
            sender: read_u32(buf, 1),
            receiver: read_u32(buf, 5),
            ephemeral: array(buf, 9),
            encrypted_nothing: array(buf, 41),
            mac1: array(buf, 57),
            mac2: array(buf, 73),
        })
    }
}

/// Cookie reply sent instead of a response while under load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageCookieReply {
    pub receiver: u32,
    pub nonce: [u8; COOKIE_NONCE_SIZE],
    pub encrypted_cookie: [u8; MAC_SIZE + TAG_SIZE],
}

impl MessageCookieReply {
    pub fn to_bytes(&self) -> [u8; COOKIE_REPLY_SIZE] {
        let mut out = [0u8; COOKIE_REPLY_SIZE];
        out[0] = Usage::CookieReply as u8;
        out[1..5].copy_from_slice(&self.receiver.to_le_bytes());
        out[5..29].copy_from_slice(&self.nonce);
        out[29..61].copy_from_slice(&self.encrypted_cookie);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, NoiseError> {
        check_header(buf, Usage::CookieReply, COOKIE_REPLY_SIZE)?;
        Ok(Self {
            receiver: read_u32(buf, 1),
            nonce: array(buf, 5),
            encrypted_cookie: array(buf, 29),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(INITIATION_SIZE, 145);
        assert_eq!(RESPONSE_SIZE, 89);
        assert_eq!(COOKIE_REPLY_SIZE, 61);
    }

    #[test]
    fn test_initiation_layout() {
        let msg = MessageInitiation {
            sender: 0x0102_0304,
            ephemeral: [7u8; 32],
            encrypted_static: [8u8; 48],
            encrypted_timestamp: [9u8; 28],
            mac1: [10u8; 16],
            mac2: [11u8; 16],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[4, 3, 2, 1]);
        assert_eq!(MessageInitiation::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut bytes = [0u8; RESPONSE_SIZE];
        bytes[0] = Usage::Initiation as u8;
        assert!(matches!(
            MessageResponse::from_bytes(&bytes),
            Err(NoiseError::InvalidMessageType(1))
        ));
    }

    #[test]
    fn test_wrong_size_rejected() {
        let bytes = [3u8; COOKIE_REPLY_SIZE - 1];
        assert!(MessageCookieReply::from_bytes(&bytes).is_err());
    }
}
