//! Persisted fsmonitor state: the index-file extension payload.
//!
//! The extension stores the last token a client was answered with plus an
//! EWAH bitmap of index positions known dirty at that point. Two header
//! versions exist on disk: v1 carries a nanosecond timestamp (pre-token
//! daemons), v2 an opaque UTF-8 token. Loading a v1 payload mints the token
//! string from the stored epoch value.

use std::error;
use std::fmt;

use super::ewah::EwahBitmap;
use super::ewah::EwahError;

const VERSION_TIMESTAMP: u32 = 1;
const VERSION_TOKEN: u32 = 2;

/// A malformed extension payload.
#[derive(Debug, PartialEq, Eq)]
pub enum ExtError {
    /// Payload too short for the declared layout.
    Truncated,
    /// Unknown version header.
    BadVersion(u32),
    /// The v2 token is not NUL-terminated UTF-8.
    BadToken,
    /// The bitmap did not parse.
    Bitmap(EwahError),
}

impl fmt::Display for ExtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtError::Truncated => write!(f, "extension payload truncated"),
            ExtError::BadVersion(v) => write!(f, "unknown fsmonitor extension version {v}"),
            ExtError::BadToken => write!(f, "malformed fsmonitor token"),
            ExtError::Bitmap(err) => write!(f, "dirty bitmap: {err}"),
        }
    }
}

impl error::Error for ExtError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ExtError::Bitmap(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EwahError> for ExtError {
    fn from(err: EwahError) -> Self {
        ExtError::Bitmap(err)
    }
}

/// Decoded extension contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexExt {
    /// Token to hand to the daemon on the next query.
    pub token: String,
    /// Index positions whose worktree state is already known dirty.
    pub dirty: EwahBitmap,
}

/// Encode a v2 payload.
pub fn encode(token: &str, dirty: &EwahBitmap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&VERSION_TOKEN.to_be_bytes());
    out.extend_from_slice(token.as_bytes());
    out.push(0);

    let mut bitmap = Vec::new();
    dirty.serialize(&mut bitmap);
    out.extend_from_slice(&(bitmap.len() as u32).to_be_bytes());
    out.extend_from_slice(&bitmap);
    out
}

/// Encode a v1 payload; only old writers produce these, kept for tests.
pub fn encode_v1(nanos: u64, dirty: &EwahBitmap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&VERSION_TIMESTAMP.to_be_bytes());
    out.extend_from_slice(&nanos.to_be_bytes());

    let mut bitmap = Vec::new();
    dirty.serialize(&mut bitmap);
    out.extend_from_slice(&(bitmap.len() as u32).to_be_bytes());
    out.extend_from_slice(&bitmap);
    out
}

/// Decode either payload version.
pub fn decode(data: &[u8]) -> Result<IndexExt, ExtError> {
    let version = read_u32(data, 0)?;
    let (token, bitmap_at) = match version {
        VERSION_TIMESTAMP => {
            let chunk = data.get(4..12).ok_or(ExtError::Truncated)?;
            let nanos = u64::from_be_bytes(chunk.try_into().map_err(|_| ExtError::Truncated)?);
            (nanos.to_string(), 12)
        }
        VERSION_TOKEN => {
            let rest = data.get(4..).ok_or(ExtError::Truncated)?;
            let nul = memchr::memchr(0, rest).ok_or(ExtError::BadToken)?;
            let token = std::str::from_utf8(&rest[..nul])
                .map_err(|_| ExtError::BadToken)?
                .to_string();
            (token, 4 + nul + 1)
        }
        other => return Err(ExtError::BadVersion(other)),
    };

    let bitmap_len = read_u32(data, bitmap_at)? as usize;
    let bitmap_data = data
        .get(bitmap_at + 4..bitmap_at + 4 + bitmap_len)
        .ok_or(ExtError::Truncated)?;
    let (dirty, _) = EwahBitmap::deserialize(bitmap_data)?;

    Ok(IndexExt { token, dirty })
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ExtError> {
    let chunk = data.get(offset..offset + 4).ok_or(ExtError::Truncated)?;
    Ok(u32::from_be_bytes(
        chunk.try_into().map_err(|_| ExtError::Truncated)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty(positions: &[u64]) -> EwahBitmap {
        let mut bitmap = EwahBitmap::new();
        for &pos in positions {
            bitmap.set(pos);
        }
        bitmap
    }

    #[test]
    fn v2_round_trip() {
        let bitmap = dirty(&[3, 4, 90]);
        let bytes = encode(":internal:abc:7", &bitmap);

        let ext = decode(&bytes).unwrap();
        assert_eq!(ext.token, ":internal:abc:7");
        assert_eq!(ext.dirty.to_positions(), vec![3, 4, 90]);
    }

    #[test]
    fn v1_mints_token_from_epoch() {
        let bytes = encode_v1(1_234_567_890, &dirty(&[0]));
        let ext = decode(&bytes).unwrap();
        assert_eq!(ext.token, "1234567890");
        assert_eq!(ext.dirty.to_positions(), vec![0]);
    }

    #[test]
    fn rejects_unknown_version_and_short_payloads() {
        let bytes = encode(":internal:s:0", &dirty(&[]));
        assert_eq!(decode(&bytes[..3]), Err(ExtError::Truncated));

        let mut bad = bytes.clone();
        bad[3] = 9;
        assert_eq!(decode(&bad), Err(ExtError::BadVersion(9)));
    }

    #[test]
    fn rejects_unterminated_token() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"no-nul-here");
        assert_eq!(decode(&bytes), Err(ExtError::BadToken));
    }
}
