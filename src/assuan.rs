//! Reads the Assuan-style descriptor the Windows GPG agent writes to
//! advertise its loopback port and per-connection nonce.
//!
//! Format: ASCII decimal port, `0x0A`, exactly 16 bytes of nonce. Any
//! deviation is fatal for that connection (`BridgeError::Descriptor`).
//! A Cygwin-style `!<socket >port s uuid` framing is also accepted as a
//! fallback, matching what MSYS/Cygwin builds of gpg-agent write.

use std::path::Path;
use std::{mem, str};

use tokio::io::AsyncReadExt;

use crate::error::{BridgeError, Result};
use crate::nonce::{Nonce, NONCE_LEN};

const CYGWIN_PREFIX: &[u8] = b"!<socket >";

fn descriptor_err(msg: impl Into<String>) -> BridgeError {
    BridgeError::Descriptor(msg.into())
}

/// Reads and parses the descriptor at `path`. The file is re-read on
/// every connection since the agent may rotate ports.
pub async fn read_descriptor(path: &Path) -> Result<(u16, Nonce)> {
    let mut f = tokio::fs::File::open(path)
        .await
        .map_err(|e| descriptor_err(format!("cannot open {}: {e}", path.display())))?;
    let mut buffer = Vec::with_capacity(64);
    f.read_to_end(&mut buffer).await?;
    parse_descriptor(&buffer)
}

fn parse_descriptor(buffer: &[u8]) -> Result<(u16, Nonce)> {
    if buffer.starts_with(CYGWIN_PREFIX) {
        return parse_cygwin(&buffer[CYGWIN_PREFIX.len()..]);
    }
    parse_plain(buffer)
}

/// `port\n` + exactly 16 raw nonce bytes.
fn parse_plain(buffer: &[u8]) -> Result<(u16, Nonce)> {
    let newline = buffer
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| descriptor_err("missing newline between port and nonce"))?;
    let port_bytes = &buffer[..newline];
    let nonce_bytes = &buffer[newline + 1..];
    if nonce_bytes.len() != NONCE_LEN {
        return Err(descriptor_err(format!(
            "nonce is {} bytes, expected {NONCE_LEN}",
            nonce_bytes.len()
        )));
    }
    let port: u16 = str::from_utf8(port_bytes)
        .map_err(|e| descriptor_err(format!("port is not UTF-8: {e}")))?
        .trim()
        .parse()
        .map_err(|e| descriptor_err(format!("port is not a valid number: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    Ok((port, nonce))
}

/// `<port> s <uuid>` where `<uuid>` is four `-`-separated 8-hex-digit
/// groups (the teacher's `load_cygwin_port_nounce`, generalized).
fn parse_cygwin(buffer: &[u8]) -> Result<(u16, Nonce)> {
    let space = buffer
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| descriptor_err("cygwin descriptor missing port separator"))?;
    let port: u16 = str::from_utf8(&buffer[..space])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| descriptor_err("cygwin descriptor has invalid port"))?;

    let rest = &buffer[space..];
    if !rest.starts_with(b" s ") || rest.len() < 3 + 35 {
        return Err(descriptor_err("cygwin descriptor has wrong format"));
    }
    let mut start = 3;
    let mut groups = [0u32; 4];
    for (i, group) in groups.iter_mut().enumerate() {
        let hex = str::from_utf8(&rest[start..start + 8])
            .map_err(|e| descriptor_err(format!("cygwin nonce group not UTF-8: {e}")))?;
        *group =
            u32::from_str_radix(hex, 16).map_err(|e| descriptor_err(format!("bad hex: {e}")))?;
        let sep = rest[start + 8];
        let expected = if i < 3 { b'-' } else { b'x' };
        if sep != expected {
            return Err(descriptor_err("cygwin nonce groups malformed"));
        }
        start += 9;
    }
    // Endianness of the packed groups is intentionally not normalized:
    // both sides of this bridge run little-endian, and the source this
    // is ported from makes the same assumption.
    let nonce: Nonce = unsafe { mem::transmute(groups) };
    Ok((port, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_descriptor() {
        let mut buf = b"51234\n".to_vec();
        buf.extend_from_slice(&[7u8; 16]);
        let (port, nonce) = parse_plain(&buf).unwrap();
        assert_eq!(port, 51234);
        assert_eq!(nonce, [7u8; 16]);
    }

    #[test]
    fn rejects_short_nonce() {
        let mut buf = b"51234\n".to_vec();
        buf.extend_from_slice(&[7u8; 15]);
        let err = parse_plain(&buf).unwrap_err();
        assert!(matches!(err, BridgeError::Descriptor(_)));
    }

    #[test]
    fn rejects_missing_newline() {
        let buf = b"51234".to_vec();
        let err = parse_plain(&buf).unwrap_err();
        assert!(matches!(err, BridgeError::Descriptor(_)));
    }

    #[test]
    fn parses_cygwin_descriptor() {
        let mut buf = CYGWIN_PREFIX.to_vec();
        buf.extend_from_slice(b"51234 s deadbeef-cafebabe-01234567-89abcdef");
        let (port, _nonce) = parse_descriptor(&buf).unwrap();
        assert_eq!(port, 51234);
    }
}
