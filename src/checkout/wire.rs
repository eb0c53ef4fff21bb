//! Helper wire protocol.
//!
//! The foreground and each helper subprocess speak packet-line frames over
//! the helper's stdin/stdout. After a banner-and-version handshake the
//! foreground issues `queue`, `write`, `get1` and `mget` commands; item and
//! result records are fixed-width binary structs with trailing byte strings,
//! decoded by copy so frame buffers need no particular alignment.

use std::error;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::convert::AttrAction;
use crate::convert::ConvertAttrs;
use crate::convert::CrlfAction;
use crate::odb::OID_RAW_MAX;
use crate::odb::ObjectId;
use crate::pkt;
use crate::pkt::Frame;

use super::item::ErrorClass;
use super::item::Item;
use super::item::ItemResult;
use super::item::Watermark;
use super::item::WireStat;

/// Only protocol version both sides currently speak.
pub const PROTOCOL_VERSION: u32 = 1;

/// Banner the foreground sends first.
pub const CLIENT_BANNER: &str = "gitwt-checkout-helper-client";

/// Banner the helper answers with.
pub const SERVER_BANNER: &str = "gitwt-checkout-helper-server";

/// Capabilities a helper can honor.
pub const CAPABILITIES: &[&str] = &["queue", "write", "get1", "mget"];

/// Sentinel accepted by `write end=` for the unbounded watermark.
pub const WRITE_END_AUTO: &str = "auto";

/// Fixed part of one queued-item record. Trailing bytes carry the
/// working-tree encoding (may be empty) followed by the path.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct QueueRecord {
    /// Position in the foreground's eligible-items vector.
    pub pc_nr: u32,
    /// Position inside this helper's item vector.
    pub helper_nr: u32,
    /// Index entry mode bits.
    pub mode: u32,
    /// [`AttrAction`] wire code.
    pub attr_action: u8,
    /// [`CrlfAction`] wire code.
    pub crlf_action: u8,
    /// Non-zero when `$Id$` expansion applies.
    pub ident: u8,
    /// Significant bytes in `oid`.
    pub oid_len: u8,
    /// Byte length of the trailing path string.
    pub len_name: u32,
    /// Byte length of the trailing encoding string.
    pub len_encoding: u32,
    /// Padded raw object id.
    pub oid: [u8; OID_RAW_MAX],
}

/// One item result record.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ResultRecord {
    /// Position in the foreground's eligible-items vector.
    pub pc_nr: u32,
    /// Position inside the helper's item vector.
    pub helper_nr: u32,
    /// [`ErrorClass`] wire code.
    pub error_class: u32,
    /// Raw OS error code, zero when not applicable.
    pub errno: i32,
    /// Stat of the written file; zeroed unless `error_class` is `Ok`.
    pub stat: WireStat,
}

impl ResultRecord {
    pub(crate) fn from_result(pc_nr: u32, helper_nr: u32, result: &ItemResult) -> Self {
        ResultRecord {
            pc_nr,
            helper_nr,
            error_class: result.class.into(),
            errno: result.errno,
            stat: result.stat,
        }
    }

    /// Decode the error class, surfacing unknown codes as a protocol error.
    pub fn class(&self) -> Result<ErrorClass, ProtocolError> {
        ErrorClass::try_from(self.error_class)
            .map_err(|_| ProtocolError::BadField("error_class", self.error_class.to_string()))
    }
}

/// Protocol-level failure. Unlike per-item errors these are fatal: the
/// foreground stops parallel checkout and the helper exits non-zero.
#[derive(Debug)]
pub enum ProtocolError {
    /// A binary record frame was shorter than its fixed part or trailing
    /// strings.
    ShortRecord(usize, usize),
    /// The peer sent a command this side does not recognize.
    UnknownCommand(String),
    /// Banner or version exchange went wrong.
    BadHandshake(String),
    /// A field failed to parse.
    BadField(&'static str, String),
    /// A flush arrived where a payload frame was required.
    UnexpectedFlush,
    /// Underlying transport failure.
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ShortRecord(got, want) => {
                write!(f, "short record ({got} < {want})")
            }
            ProtocolError::UnknownCommand(name) => write!(f, "unknown command {name:?}"),
            ProtocolError::BadHandshake(why) => write!(f, "handshake failed: {why}"),
            ProtocolError::BadField(field, value) => {
                write!(f, "bad value {value:?} for field {field}")
            }
            ProtocolError::UnexpectedFlush => write!(f, "flush where a payload was expected"),
            ProtocolError::Io(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ProtocolError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

/// Commands a helper accepts after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Append the records that follow, up to a flush.
    Queue,
    /// Set the authorization watermark.
    Write(Watermark),
    /// Report one item once it is done.
    Get1(usize),
    /// Report a half-open range of items as they finish.
    Mget(usize, usize),
}

/// Parse one `command=<name>` frame plus its argument frames. The caller has
/// already consumed frames up to and including the flush for commands that
/// need it; this parses the textual part.
pub fn parse_command(name: &str, args: &[String]) -> Result<Command, ProtocolError> {
    match name {
        "queue" => Ok(Command::Queue),
        "write" => {
            let end = lookup(args, "end")?;
            if end == WRITE_END_AUTO {
                Ok(Command::Write(Watermark::Auto))
            } else {
                Ok(Command::Write(Watermark::At(parse_nr("end", end)?)))
            }
        }
        "get1" => Ok(Command::Get1(parse_nr("nr", lookup(args, "nr")?)?)),
        "mget" => {
            let begin = parse_nr("begin", lookup(args, "begin")?)?;
            let end = parse_nr("end", lookup(args, "end")?)?;
            Ok(Command::Mget(begin, end))
        }
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

fn lookup<'a>(args: &'a [String], key: &'static str) -> Result<&'a str, ProtocolError> {
    args.iter()
        .find_map(|arg| arg.strip_prefix(key)?.strip_prefix('='))
        .ok_or_else(|| ProtocolError::BadField(key, "missing".to_string()))
}

fn parse_nr(key: &'static str, value: &str) -> Result<usize, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::BadField(key, value.to_string()))
}

/// Encode one item into a queue-record frame payload.
pub fn encode_queue_item(
    pc_nr: u32,
    helper_nr: u32,
    oid: &ObjectId,
    mode: u32,
    path: &std::path::Path,
    attrs: &ConvertAttrs,
) -> Vec<u8> {
    let (oid_bytes, oid_len) = oid.to_wire();
    let encoding = attrs.working_tree_encoding.as_deref().unwrap_or("");
    let name = path_bytes(path);
    let record = QueueRecord {
        pc_nr,
        helper_nr,
        mode,
        attr_action: attrs.attr_action.into(),
        crlf_action: attrs.crlf_action.into(),
        ident: attrs.ident.into(),
        oid_len,
        len_name: name.len() as u32,
        len_encoding: encoding.len() as u32,
        oid: oid_bytes,
    };
    let mut payload = Vec::with_capacity(size_of::<QueueRecord>() + encoding.len() + name.len());
    payload.extend_from_slice(record.as_bytes());
    payload.extend_from_slice(encoding.as_bytes());
    payload.extend_from_slice(&name);
    payload
}

/// Decode a queue-record frame payload into an [`Item`].
pub fn decode_queue_item(payload: &[u8]) -> Result<Item, ProtocolError> {
    let (record, rest) = QueueRecord::read_from_prefix(payload)
        .map_err(|_| ProtocolError::ShortRecord(payload.len(), size_of::<QueueRecord>()))?;

    let len_encoding = record.len_encoding as usize;
    let len_name = record.len_name as usize;
    if rest.len() != len_encoding + len_name {
        return Err(ProtocolError::ShortRecord(
            payload.len(),
            size_of::<QueueRecord>() + len_encoding + len_name,
        ));
    }
    let (encoding, name) = rest.split_at(len_encoding);

    let oid = ObjectId::from_wire(record.oid, record.oid_len)
        .ok_or_else(|| ProtocolError::BadField("oid_len", record.oid_len.to_string()))?;
    let attrs = ConvertAttrs {
        attr_action: AttrAction::try_from(record.attr_action)
            .map_err(|_| ProtocolError::BadField("attr_action", record.attr_action.to_string()))?,
        crlf_action: CrlfAction::try_from(record.crlf_action)
            .map_err(|_| ProtocolError::BadField("crlf_action", record.crlf_action.to_string()))?,
        ident: record.ident != 0,
        working_tree_encoding: if encoding.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(encoding)
                    .map_err(|_| ProtocolError::BadField("encoding", String::new()))?
                    .to_string(),
            )
        },
    };

    Ok(Item::new(
        record.pc_nr,
        record.helper_nr,
        oid,
        record.mode,
        bytes_path(name),
        attrs,
    ))
}

/// Read one result record frame.
pub fn read_result<R: Read>(r: &mut R) -> Result<ResultRecord, ProtocolError> {
    match pkt::expect_frame(r)? {
        Frame::Flush => Err(ProtocolError::UnexpectedFlush),
        Frame::Data(payload) => {
            let (record, rest) = ResultRecord::read_from_prefix(&payload)
                .map_err(|_| ProtocolError::ShortRecord(payload.len(), size_of::<ResultRecord>()))?;
            if !rest.is_empty() {
                return Err(ProtocolError::ShortRecord(
                    payload.len(),
                    size_of::<ResultRecord>(),
                ));
            }
            Ok(record)
        }
    }
}

/// Foreground side of the handshake. Returns the capabilities the helper
/// agreed to honor.
pub fn client_handshake<R: Read, W: Write>(
    r: &mut R,
    w: &mut W,
) -> Result<Vec<String>, ProtocolError> {
    pkt::write_text(w, CLIENT_BANNER)?;
    pkt::write_text(w, &format!("version={PROTOCOL_VERSION}"))?;
    pkt::write_flush(w)?;
    w.flush()?;

    let banner = read_text(r)?;
    if banner != SERVER_BANNER {
        return Err(ProtocolError::BadHandshake(format!(
            "unexpected banner {banner:?}"
        )));
    }
    let versions = read_section(r)?;
    if !versions.iter().any(|v| v == "version=1") {
        return Err(ProtocolError::BadHandshake(
            "helper does not speak version 1".to_string(),
        ));
    }

    for cap in CAPABILITIES {
        pkt::write_text(w, &format!("capability={cap}"))?;
    }
    pkt::write_flush(w)?;
    w.flush()?;

    let caps = read_section(r)?
        .iter()
        .filter_map(|line| Some(line.strip_prefix("capability=")?.to_string()))
        .collect();
    Ok(caps)
}

/// Helper side of the handshake. Returns the capabilities to honor.
pub fn server_handshake<R: Read, W: Write>(
    r: &mut R,
    w: &mut W,
) -> Result<Vec<String>, ProtocolError> {
    let banner = read_text(r)?;
    if banner != CLIENT_BANNER {
        return Err(ProtocolError::BadHandshake(format!(
            "unexpected banner {banner:?}"
        )));
    }
    let versions = read_section(r)?;
    if !versions.iter().any(|v| v == "version=1") {
        return Err(ProtocolError::BadHandshake(
            "client does not offer version 1".to_string(),
        ));
    }

    pkt::write_text(w, SERVER_BANNER)?;
    pkt::write_text(w, &format!("version={PROTOCOL_VERSION}"))?;
    pkt::write_flush(w)?;
    w.flush()?;

    let mut caps = Vec::new();
    for line in read_section(r)? {
        if let Some(cap) = line.strip_prefix("capability=") {
            if CAPABILITIES.contains(&cap) {
                pkt::write_text(w, &format!("capability={cap}"))?;
                caps.push(cap.to_string());
            }
        }
    }
    pkt::write_flush(w)?;
    w.flush()?;
    Ok(caps)
}

fn read_text<R: Read>(r: &mut R) -> Result<String, ProtocolError> {
    match pkt::expect_frame(r)? {
        Frame::Flush => Err(ProtocolError::UnexpectedFlush),
        frame => frame
            .text()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::BadHandshake("non-text frame".to_string())),
    }
}

/// Read text frames up to the next flush.
pub(crate) fn read_section<R: Read>(r: &mut R) -> Result<Vec<String>, ProtocolError> {
    let mut lines = Vec::new();
    loop {
        match pkt::expect_frame(r)? {
            Frame::Flush => return Ok(lines),
            frame => {
                let text = frame
                    .text()
                    .ok_or_else(|| ProtocolError::BadHandshake("non-text frame".to_string()))?;
                lines.push(text.to_string());
            }
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &std::path::Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn bytes_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_bytes(path: &std::path::Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(unix))]
fn bytes_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ConvertAttrs;
    use std::path::Path;

    #[test]
    fn record_layouts_are_stable() {
        assert_eq!(size_of::<QueueRecord>(), 56);
        assert_eq!(size_of::<ResultRecord>(), 80);
    }

    #[test]
    fn queue_item_round_trip() {
        let oid = ObjectId::from_hex(&"3".repeat(40)).unwrap();
        let attrs = ConvertAttrs {
            crlf_action: CrlfAction::Text,
            ident: true,
            working_tree_encoding: Some("UTF-16".to_string()),
            ..ConvertAttrs::default()
        };
        let payload = encode_queue_item(7, 2, &oid, 0o100755, Path::new("dir/a.txt"), &attrs);

        let item = decode_queue_item(&payload).unwrap();
        assert_eq!(item.pc_nr, 7);
        assert_eq!(item.helper_nr, 2);
        assert_eq!(item.oid, oid);
        assert_eq!(item.mode, 0o100755);
        assert_eq!(item.path, Path::new("dir/a.txt"));
        assert_eq!(item.attrs, attrs);
    }

    #[test]
    fn short_record_is_rejected() {
        let oid = ObjectId::from_hex(&"3".repeat(40)).unwrap();
        let payload =
            encode_queue_item(0, 0, &oid, 0o100644, Path::new("x"), &ConvertAttrs::default());
        for cut in [1, size_of::<QueueRecord>() - 1, payload.len() - 1] {
            assert!(matches!(
                decode_queue_item(&payload[..cut]),
                Err(ProtocolError::ShortRecord(..))
            ));
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("queue", &[]).unwrap(), Command::Queue);
        assert_eq!(
            parse_command("write", &["end=5".to_string()]).unwrap(),
            Command::Write(Watermark::At(5))
        );
        assert_eq!(
            parse_command("write", &["end=auto".to_string()]).unwrap(),
            Command::Write(Watermark::Auto)
        );
        assert_eq!(
            parse_command("get1", &["nr=3".to_string()]).unwrap(),
            Command::Get1(3)
        );
        assert_eq!(
            parse_command("mget", &["begin=0".to_string(), "end=9".to_string()]).unwrap(),
            Command::Mget(0, 9)
        );
        assert!(matches!(
            parse_command("expunge", &[]),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            parse_command("write", &["end=sideways".to_string()]),
            Err(ProtocolError::BadField("end", _))
        ));
    }

    #[test]
    fn handshake_round_trip() {
        use std::os::unix::net::UnixStream;

        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let server = std::thread::spawn(move || {
            let mut r = std::io::BufReader::new(server_sock.try_clone().unwrap());
            let mut w = server_sock;
            server_handshake(&mut r, &mut w)
        });

        let mut r = std::io::BufReader::new(client_sock.try_clone().unwrap());
        let mut w = client_sock;
        let caps = client_handshake(&mut r, &mut w).unwrap();
        assert_eq!(caps, CAPABILITIES);
        assert_eq!(server.join().unwrap().unwrap(), CAPABILITIES);
    }

    #[test]
    fn result_record_round_trip() {
        let result = ItemResult::error(ErrorClass::Open, libc::EEXIST);
        let record = ResultRecord::from_result(4, 1, &result);
        let mut buf = Vec::new();
        pkt::write_frame(&mut buf, record.as_bytes()).unwrap();

        let read = read_result(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(read.pc_nr, 4);
        assert_eq!(read.class().unwrap(), ErrorClass::Open);
        assert_eq!(read.errno, libc::EEXIST);
    }
}
