//! Work items for the parallel populator.

use std::path::PathBuf;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::convert::ConvertAttrs;
use crate::odb::ObjectId;

/// Life cycle of one item inside a helper.
///
/// Transitions only ever move forward; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemState {
    /// Constructed, not yet appended to the item vector.
    New,
    /// Appended; waiting for the preload thread.
    Queued,
    /// The preload thread is reading the blob.
    Loading,
    /// Blob bytes are resident in the preload window.
    Loaded,
    /// A writer thread claimed the item.
    Writing,
    /// Result recorded; visible to `get1`/`mget`.
    Done,
}

/// Failure category attached to an item result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ErrorClass {
    /// The item was written and statted.
    Ok = 0,
    /// No result is available for the requested slot.
    NoResult = 1,
    /// The requested slot does not exist.
    InvalidItem = 2,
    /// Reading the blob from the object store failed.
    Load = 3,
    /// Creating the worktree file failed.
    Open = 4,
    /// Writing the file contents failed.
    Write = 5,
    /// Statting the written file failed.
    Lstat = 6,
}

impl ErrorClass {
    /// `Open` failures whose cause can be a path collision on a case-folding
    /// filesystem. The foreground re-runs these through the sequential path.
    pub fn is_collision_candidate(self, errno: i32) -> bool {
        self == ErrorClass::Open
            && matches!(
                errno,
                libc::EEXIST | libc::EISDIR | libc::ENOTDIR | libc::ENOENT
            )
    }
}

/// Fixed-width stat record carried back over the wire.
///
/// Field widths are explicit so the record has the same layout on every
/// platform; eight-byte fields lead to keep the struct self-aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WireStat {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, seconds part.
    pub mtime_sec: i64,
    /// Status-change time, seconds part.
    pub ctime_sec: i64,
    /// Device number.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Modification time, nanoseconds part.
    pub mtime_nsec: u32,
    /// Status-change time, nanoseconds part.
    pub ctime_nsec: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// File mode bits.
    pub mode: u32,
    /// Layout padding; always zero.
    pub pad: u32,
}

#[cfg(unix)]
impl WireStat {
    pub(crate) fn from_stat(st: &libc::stat) -> Self {
        WireStat {
            size: st.st_size as u64,
            mtime_sec: st.st_mtime as i64,
            ctime_sec: st.st_ctime as i64,
            dev: st.st_dev as u64,
            ino: st.st_ino,
            mtime_nsec: st.st_mtime_nsec as u32,
            ctime_nsec: st.st_ctime_nsec as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            mode: st.st_mode as u32,
            pad: 0,
        }
    }
}

/// Result of one item as reported to the foreground.
#[derive(Debug, Clone, Copy)]
pub struct ItemResult {
    /// Failure category; `Ok` for a successful write.
    pub class: ErrorClass,
    /// Raw OS error code accompanying a failure, zero otherwise.
    pub errno: i32,
    /// Stat of the written file; meaningful only when `class` is `Ok`.
    pub stat: WireStat,
}

impl ItemResult {
    pub(crate) fn pending() -> Self {
        ItemResult {
            class: ErrorClass::NoResult,
            errno: 0,
            stat: WireStat::default(),
        }
    }

    pub(crate) fn error(class: ErrorClass, errno: i32) -> Self {
        ItemResult {
            class,
            errno,
            stat: WireStat::default(),
        }
    }
}

/// Upper bound on which items a writer thread may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Items `[0, n)` are authorized.
    At(usize),
    /// Unbounded: write every item as soon as it is loaded.
    Auto,
}

impl Watermark {
    /// Whether item `nr` may currently be written.
    pub fn allows(self, nr: usize) -> bool {
        match self {
            Watermark::Auto => true,
            Watermark::At(end) => nr < end,
        }
    }

    /// Widen towards `new`. `Auto` is sticky and a bounded watermark never
    /// shrinks. Returns how many additional items became writable, with
    /// `usize::MAX` standing in for "all of them".
    pub fn widen(&mut self, new: Watermark) -> usize {
        match (*self, new) {
            (Watermark::Auto, _) => 0,
            (Watermark::At(_), Watermark::Auto) => {
                *self = Watermark::Auto;
                usize::MAX
            }
            (Watermark::At(old), Watermark::At(end)) if end > old => {
                *self = Watermark::At(end);
                end - old
            }
            (Watermark::At(_), Watermark::At(_)) => 0,
        }
    }
}

/// One unit of parallel population work inside a helper.
#[derive(Debug)]
pub struct Item {
    /// Position in the foreground's eligible-items vector.
    pub pc_nr: u32,
    /// Position inside this helper's item vector.
    pub helper_nr: u32,
    /// Blob to populate the file from.
    pub oid: ObjectId,
    /// Index entry mode bits.
    pub mode: u32,
    /// Worktree-relative destination, base-dir prefix already applied.
    pub path: PathBuf,
    /// Conversion attributes evaluated by the foreground.
    pub attrs: ConvertAttrs,
    state: ItemState,
    pub(crate) result: ItemResult,
    pub(crate) content: Option<Vec<u8>>,
}

impl Item {
    /// Build a fresh item in state `New`.
    pub fn new(
        pc_nr: u32,
        helper_nr: u32,
        oid: ObjectId,
        mode: u32,
        path: PathBuf,
        attrs: ConvertAttrs,
    ) -> Self {
        Item {
            pc_nr,
            helper_nr,
            oid,
            mode,
            path,
            attrs,
            state: ItemState::New,
            result: ItemResult::pending(),
            content: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Whether the entry's mode carries the executable bit.
    pub fn wants_exec_bit(&self) -> bool {
        self.mode & 0o111 != 0
    }

    pub(crate) fn advance(&mut self, next: ItemState) {
        debug_assert!(
            next >= self.state,
            "item {} state may not move backwards ({:?} -> {:?})",
            self.helper_nr,
            self.state,
            next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ConvertAttrs;

    fn item() -> Item {
        let oid = ObjectId::from_hex(&"a".repeat(40)).unwrap();
        Item::new(0, 0, oid, 0o100644, PathBuf::from("a"), ConvertAttrs::default())
    }

    #[test]
    fn states_are_ordered() {
        assert!(ItemState::New < ItemState::Queued);
        assert!(ItemState::Loaded < ItemState::Writing);
        assert!(ItemState::Writing < ItemState::Done);
    }

    #[test]
    fn advance_walks_the_machine() {
        let mut it = item();
        for next in [
            ItemState::Queued,
            ItemState::Loading,
            ItemState::Loaded,
            ItemState::Writing,
            ItemState::Done,
        ] {
            it.advance(next);
            assert_eq!(it.state(), next);
        }
    }

    #[test]
    #[should_panic(expected = "state may not move backwards")]
    fn advance_rejects_regression() {
        let mut it = item();
        it.advance(ItemState::Loaded);
        it.advance(ItemState::Queued);
    }

    #[test]
    fn exec_bit_detection() {
        let mut it = item();
        assert!(!it.wants_exec_bit());
        it.mode = 0o100755;
        assert!(it.wants_exec_bit());
    }

    #[test]
    fn watermark_only_widens() {
        let mut w = Watermark::At(2);
        assert_eq!(w.widen(Watermark::At(1)), 0);
        assert_eq!(w, Watermark::At(2));
        assert_eq!(w.widen(Watermark::At(5)), 3);
        assert_eq!(w.widen(Watermark::Auto), usize::MAX);
        assert_eq!(w.widen(Watermark::At(100)), 0);
        assert_eq!(w, Watermark::Auto);
    }

    #[test]
    fn watermark_allows() {
        assert!(Watermark::Auto.allows(1 << 40));
        assert!(Watermark::At(3).allows(2));
        assert!(!Watermark::At(3).allows(3));
        assert!(!Watermark::At(0).allows(0));
    }

    #[test]
    fn collision_candidates() {
        assert!(ErrorClass::Open.is_collision_candidate(libc::EEXIST));
        assert!(ErrorClass::Open.is_collision_candidate(libc::EISDIR));
        assert!(ErrorClass::Open.is_collision_candidate(libc::ENOTDIR));
        assert!(ErrorClass::Open.is_collision_candidate(libc::ENOENT));
        assert!(!ErrorClass::Open.is_collision_candidate(libc::EACCES));
        assert!(!ErrorClass::Write.is_collision_candidate(libc::EEXIST));
    }

    #[test]
    fn error_class_wire_codes() {
        assert_eq!(ErrorClass::try_from(4u32), Ok(ErrorClass::Open));
        assert_eq!(u32::from(ErrorClass::Lstat), 6);
        assert!(ErrorClass::try_from(42u32).is_err());
    }

    #[test]
    fn wire_stat_layout_is_stable() {
        assert_eq!(std::mem::size_of::<WireStat>(), 64);
        assert_eq!(std::mem::align_of::<WireStat>(), 8);
    }
}
