//! Smudge-and-write for loaded items.
//!
//! Writers call in here with blob bytes already in memory. Failures never
//! abort the helper; they are folded into the item result and classified by
//! the foreground.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::debug;

use crate::convert::ConvertAttrs;
use crate::convert::Converter;

use super::item::ErrorClass;
use super::item::ItemResult;
use super::item::WireStat;

/// Platforms where an `fstat` on the just-written descriptor reflects the
/// final inode. Elsewhere the file is closed first and `lstat`ed by path.
const FSTAT_IS_RELIABLE: bool = cfg!(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd"
));

/// Smudge `content` and write it to `path`, returning the item result.
pub(crate) fn populate_file<C: Converter + ?Sized>(
    path: &Path,
    exec_bit: bool,
    attrs: &ConvertAttrs,
    content: &[u8],
    convert: &C,
) -> ItemResult {
    let mut file = match open_excl(path, exec_bit) {
        Ok(file) => file,
        Err(err) => {
            debug!("open {:?} failed: {}", path, err);
            return ItemResult::error(ErrorClass::Open, raw_errno(&err));
        }
    };

    let smudged = match convert.smudge(attrs, path, content) {
        Ok(smudged) => smudged,
        Err(err) => {
            // A conversion failure means nothing usable can be written.
            return ItemResult::error(ErrorClass::Write, raw_errno(&err));
        }
    };
    let bytes = smudged.as_deref().unwrap_or(content);

    if let Err(err) = file.write_all(bytes) {
        return ItemResult::error(ErrorClass::Write, raw_errno(&err));
    }

    let stat = if FSTAT_IS_RELIABLE {
        fstat_file(&file)
    } else {
        drop(file);
        lstat_path(path)
    };
    match stat {
        Ok(stat) => ItemResult {
            class: ErrorClass::Ok,
            errno: 0,
            stat,
        },
        Err(err) => ItemResult::error(ErrorClass::Lstat, raw_errno(&err)),
    }
}

/// Create `path` with `O_WRONLY|O_CREAT|O_EXCL`, retrying once after creating
/// leading directories. Subject to the process umask.
fn open_excl(path: &Path, exec_bit: bool) -> io::Result<File> {
    let mode = if exec_bit { 0o777 } else { 0o666 };
    let open = || {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
    };
    match open() {
        Ok(file) => Ok(file),
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            open()
        }
        Err(err) => Err(err),
    }
}

fn fstat_file(file: &File) -> io::Result<WireStat> {
    let st = nix::sys::stat::fstat(file.as_fd())?;
    Ok(WireStat::from_stat(&st))
}

fn lstat_path(path: &Path) -> io::Result<WireStat> {
    let st = nix::sys::stat::lstat(path)?;
    Ok(WireStat::from_stat(&st))
}

fn raw_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}
