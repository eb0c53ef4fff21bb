//! Foreground coordinator for parallel checkout.
//!
//! The coordinator owns the index walk: it decides which entries are
//! eligible for parallel population, spreads them across helper
//! subprocesses, drains results, and re-runs the classic sequential path for
//! entries the helpers could not place (filter-driven conversions and
//! create-time collisions).

use std::collections::HashMap;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command as ProcessCommand;
use std::process::Stdio;

use log::debug;
use log::error;
use log::warn;

use crate::convert::ConvertAttrs;
use crate::convert::Converter;
use crate::odb::ObjectId;
use crate::odb::ObjectKind;
use crate::odb::ObjectStore;
use crate::pkt;
use crate::pkt::Frame;

use super::item::ErrorClass;
use super::item::WireStat;
use super::wire;
use super::wire::ProtocolError;
use super::write::populate_file;

/// Tuning for the foreground coordinator.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Number of helper subprocesses to spawn.
    pub helpers: usize,
    /// Preload window per helper (`--preload`).
    pub preload: usize,
    /// Writer threads per helper (`--writers`).
    pub writers: usize,
    /// Minimum updatable regular files before helpers are worth spawning
    /// (`core.parallelCheckoutThreshold`).
    pub threshold: usize,
    /// Path of the helper executable.
    pub helper_program: PathBuf,
    /// Blob directory handed to helpers via `--odb`.
    pub odb_dir: PathBuf,
}

impl CheckoutSettings {
    /// Sensible defaults for `helper_program` reading blobs from `odb_dir`.
    pub fn new(helper_program: impl Into<PathBuf>, odb_dir: impl Into<PathBuf>) -> Self {
        CheckoutSettings {
            helpers: std::thread::available_parallelism().map_or(2, |n| n.get().min(8)),
            preload: 16,
            writers: 2,
            threshold: 100,
            helper_program: helper_program.into(),
            odb_dir: odb_dir.into(),
        }
    }
}

/// How results are drained from the helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// One authorize-and-wait per entry, in index order. Used during branch
    /// switch, where safety checks precede each write.
    Sync,
    /// Bulk authorize, drain at the end. Used during clone.
    Async,
}

/// One index entry, as seen by the populator. The index proper is an
/// external collaborator; this carries just the fields population needs.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Blob to populate from.
    pub oid: ObjectId,
    /// Entry mode bits.
    pub mode: u32,
    /// Worktree-relative path.
    pub path: PathBuf,
    /// Conversion attributes, evaluated in index order.
    pub attrs: ConvertAttrs,
    /// Set by the index walk for entries that must be (re)written.
    pub needs_update: bool,
}

impl IndexEntry {
    /// Whether the mode names a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & 0o170000 == 0o100000
    }

    fn exec_bit(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// One failed entry in the final report.
#[derive(Debug, Clone)]
pub struct EntryError {
    /// Worktree-relative path of the entry.
    pub path: PathBuf,
    /// Failure category.
    pub class: ErrorClass,
    /// Raw OS error code.
    pub errno: i32,
}

/// Outcome of a population run.
#[derive(Debug, Default)]
pub struct PopulateReport {
    /// `(entry position, stat)` for every file written, parallel or not.
    pub updated: Vec<(usize, WireStat)>,
    /// Entries that could not be written.
    pub errors: Vec<EntryError>,
    /// Paths involved in create-time collisions, in discovery order.
    pub collided: Vec<PathBuf>,
    /// Whether helper subprocesses were actually used.
    pub parallel: bool,
}

/// Populate every `needs_update` regular file under `worktree`.
pub fn populate_worktree<S, C>(
    settings: &CheckoutSettings,
    mode: CheckoutMode,
    worktree: &Path,
    entries: &[IndexEntry],
    store: &S,
    convert: &C,
) -> io::Result<PopulateReport>
where
    S: ObjectStore,
    C: Converter,
{
    let mut report = PopulateReport::default();

    let updatable: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.needs_update && e.is_regular())
        .map(|(pos, _)| pos)
        .collect();

    // Helpers only pay off past the threshold.
    if updatable.len() <= settings.threshold || settings.helpers == 0 {
        debug!(
            "sequential population: {} updatable entries, threshold {}",
            updatable.len(),
            settings.threshold
        );
        let mut written = WrittenPaths::default();
        for pos in updatable {
            populate_sequential(worktree, entries, pos, store, convert, &mut written, &mut report);
        }
        return Ok(report);
    }

    // Conversion attributes are evaluated in index order (the attribute
    // stack is stateful), splitting eligible from filter-driven entries.
    let mut eligible = Vec::new();
    let mut sequential_only = Vec::new();
    for &pos in &updatable {
        if convert.classify(&entries[pos].attrs).parallel_eligible() {
            eligible.push(pos);
        } else {
            sequential_only.push(pos);
        }
    }

    let mut written = WrittenPaths::default();
    let mut retry = Vec::new();
    let mut applied = vec![false; eligible.len()];

    if eligible.is_empty() {
        report.parallel = false;
    } else {
        report.parallel = true;
        if let Err(err) = run_helpers(
            settings,
            mode,
            worktree,
            entries,
            &eligible,
            &mut applied,
            &mut written,
            &mut retry,
            &mut report,
        ) {
            // A protocol failure stops parallel checkout; anything not yet
            // applied goes through the sequential path instead.
            error!("parallel checkout failed, falling back to sequential: {err}");
            report.parallel = false;
        }
    }

    // Sequential tail: filter-driven entries, collision-retry candidates,
    // and (after a protocol failure) every eligible entry still unapplied.
    let mut tail: Vec<usize> = sequential_only;
    tail.extend(retry);
    tail.extend(
        eligible
            .iter()
            .zip(&applied)
            .filter(|&(_, &done)| !done)
            .map(|(&pos, _)| pos),
    );
    tail.sort_unstable();
    for pos in tail {
        populate_sequential(worktree, entries, pos, store, convert, &mut written, &mut report);
    }

    if !report.collided.is_empty() {
        warn!(
            "the following paths have collided and only one from each group survived: {}",
            report
                .collided
                .iter()
                .map(|p| format!("{:?}", p))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Ok(report)
}

/// Pool of live helper subprocesses.
struct HelperPool {
    helpers: Vec<HelperHandle>,
}

struct HelperHandle {
    child: Child,
    to: Option<BufWriter<ChildStdin>>,
    from: BufReader<ChildStdout>,
    /// Items assigned to this helper so far; doubles as the next
    /// `helper_nr`.
    queued: u32,
}

impl HelperPool {
    fn spawn(settings: &CheckoutSettings, worktree: &Path, count: usize) -> Result<Self, ProtocolError> {
        let mut helpers = Vec::with_capacity(count);
        for child_nr in 0..count {
            helpers.push(HelperHandle::spawn(settings, worktree, child_nr)?);
        }
        Ok(HelperPool { helpers })
    }

    fn len(&self) -> usize {
        self.helpers.len()
    }
}

impl Drop for HelperPool {
    fn drop(&mut self) {
        // Closing stdin ends each helper's read loop; reap afterwards.
        for helper in &mut self.helpers {
            helper.to = None;
        }
        for helper in &mut self.helpers {
            if let Err(err) = helper.child.wait() {
                warn!("waiting for checkout helper failed: {err}");
            }
        }
    }
}

impl HelperHandle {
    fn spawn(
        settings: &CheckoutSettings,
        worktree: &Path,
        child_nr: usize,
    ) -> Result<Self, ProtocolError> {
        let mut child = ProcessCommand::new(&settings.helper_program)
            .arg(format!("--child={child_nr}"))
            .arg(format!("--preload={}", settings.preload))
            .arg(format!("--writers={}", settings.writers))
            .arg("--odb")
            .arg(&settings.odb_dir)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ProtocolError::BadHandshake("helper stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProtocolError::BadHandshake("helper stdout not captured".to_string())
        })?;
        let mut handle = HelperHandle {
            child,
            to: Some(BufWriter::new(stdin)),
            from: BufReader::new(stdout),
            queued: 0,
        };

        let caps = {
            let writer = handle.to.as_mut().ok_or_else(|| {
                ProtocolError::BadHandshake("helper stdin already closed".to_string())
            })?;
            wire::client_handshake(&mut handle.from, writer)?
        };
        for required in wire::CAPABILITIES {
            if !caps.iter().any(|c| c == required) {
                return Err(ProtocolError::BadHandshake(format!(
                    "helper lacks the {required} capability"
                )));
            }
        }
        Ok(handle)
    }

    fn writer(&mut self) -> Result<&mut BufWriter<ChildStdin>, ProtocolError> {
        self.to.as_mut().ok_or_else(|| {
            ProtocolError::BadHandshake("helper stdin already closed".to_string())
        })
    }

    fn send_queue(&mut self, records: &[Vec<u8>]) -> Result<(), ProtocolError> {
        let w = self.writer()?;
        pkt::write_text(w, "command=queue")?;
        for record in records {
            pkt::write_frame(w, record)?;
        }
        pkt::write_flush(w)?;
        w.flush()?;
        Ok(())
    }

    fn send_write(&mut self, end: &str) -> Result<(), ProtocolError> {
        let w = self.writer()?;
        pkt::write_text(w, "command=write")?;
        pkt::write_text(w, &format!("end={end}"))?;
        pkt::write_flush(w)?;
        w.flush()?;
        Ok(())
    }

    fn get1(&mut self, nr: u32) -> Result<wire::ResultRecord, ProtocolError> {
        let w = self.writer()?;
        pkt::write_text(w, "command=get1")?;
        pkt::write_text(w, &format!("nr={nr}"))?;
        pkt::write_flush(w)?;
        w.flush()?;

        let record = wire::read_result(&mut self.from)?;
        match pkt::expect_frame(&mut self.from)? {
            Frame::Flush => Ok(record),
            Frame::Data(_) => Err(ProtocolError::BadHandshake(
                "get1 reply not followed by flush".to_string(),
            )),
        }
    }

    fn mget(&mut self, begin: u32, end: u32) -> Result<Vec<wire::ResultRecord>, ProtocolError> {
        let w = self.writer()?;
        pkt::write_text(w, "command=mget")?;
        pkt::write_text(w, &format!("begin={begin}"))?;
        pkt::write_text(w, &format!("end={end}"))?;
        pkt::write_flush(w)?;
        w.flush()?;

        let mut records = Vec::with_capacity((end - begin) as usize);
        for _ in begin..end {
            records.push(wire::read_result(&mut self.from)?);
        }
        match pkt::expect_frame(&mut self.from)? {
            Frame::Flush => Ok(records),
            Frame::Data(_) => Err(ProtocolError::BadHandshake(
                "mget reply not followed by flush".to_string(),
            )),
        }
    }
}

/// Distribute eligible entries, drain results, classify failures.
#[allow(clippy::too_many_arguments)]
fn run_helpers(
    settings: &CheckoutSettings,
    mode: CheckoutMode,
    worktree: &Path,
    entries: &[IndexEntry],
    eligible: &[usize],
    applied: &mut [bool],
    written: &mut WrittenPaths,
    retry: &mut Vec<usize>,
    report: &mut PopulateReport,
) -> Result<(), ProtocolError> {
    let count = settings.helpers.min(eligible.len());
    let mut pool = HelperPool::spawn(settings, worktree, count)?;

    // Item j goes to helper j mod H; remember the back-reference so results
    // can be applied by eligible position alone.
    let mut assignment = Vec::with_capacity(eligible.len());
    let mut batches: Vec<Vec<Vec<u8>>> = vec![Vec::new(); pool.len()];
    for (j, &pos) in eligible.iter().enumerate() {
        let helper_idx = j % pool.len();
        let helper = &mut pool.helpers[helper_idx];
        let helper_nr = helper.queued;
        helper.queued += 1;
        assignment.push((helper_idx, helper_nr));

        let entry = &entries[pos];
        batches[helper_idx].push(wire::encode_queue_item(
            j as u32,
            helper_nr,
            &entry.oid,
            entry.mode,
            &entry.path,
            &entry.attrs,
        ));
    }
    for (helper, batch) in pool.helpers.iter_mut().zip(&batches) {
        helper.send_queue(batch)?;
    }

    let mut apply = |record: &wire::ResultRecord| -> Result<(), ProtocolError> {
        let j = record.pc_nr as usize;
        let pos = *eligible.get(j).ok_or_else(|| {
            ProtocolError::BadField("pc_nr", record.pc_nr.to_string())
        })?;
        applied[j] = true;
        let entry = &entries[pos];
        match record.class()? {
            ErrorClass::Ok => {
                written.record(&entry.path, record.stat.ino);
                report.updated.push((pos, record.stat));
            }
            class if class.is_collision_candidate(record.errno) => {
                debug!(
                    "collision-retry candidate {:?} (errno {})",
                    entry.path, record.errno
                );
                retry.push(pos);
            }
            class => {
                report.errors.push(EntryError {
                    path: entry.path.clone(),
                    class,
                    errno: record.errno,
                });
            }
        }
        Ok(())
    };

    match mode {
        CheckoutMode::Sync => {
            for (j, _) in eligible.iter().enumerate() {
                let (helper_idx, helper_nr) = assignment[j];
                let helper = &mut pool.helpers[helper_idx];
                helper.send_write(&(helper_nr + 1).to_string())?;
                let record = helper.get1(helper_nr)?;
                apply(&record)?;
            }
        }
        CheckoutMode::Async => {
            for helper in &mut pool.helpers {
                helper.send_write(wire::WRITE_END_AUTO)?;
            }
            for helper_idx in 0..pool.len() {
                let helper = &mut pool.helpers[helper_idx];
                let records = helper.mget(0, helper.queued)?;
                for record in &records {
                    apply(record)?;
                }
            }
        }
    }

    drop(pool);
    Ok(())
}

/// Book-keeping over files this run has already written, for collision
/// detection during the sequential retry.
#[derive(Debug, Default)]
struct WrittenPaths {
    by_ino: HashMap<u64, PathBuf>,
    paths: Vec<PathBuf>,
}

impl WrittenPaths {
    fn record(&mut self, path: &Path, ino: u64) {
        self.by_ino.insert(ino, path.to_path_buf());
        self.paths.push(path.to_path_buf());
    }

    /// Find the already-written paths a failed create collided with.
    ///
    /// A regular file in the way is resolved through its inode (case-folding
    /// collisions land here); a directory in the way is a directory/file
    /// collision resolved by name prefix; `ENOTDIR`/`ENOENT` mean a leading
    /// component is one of our files.
    fn collision_partners(&self, worktree: &Path, path: &Path, errno: i32) -> Vec<PathBuf> {
        match errno {
            // O_CREAT|O_EXCL reports EEXIST for directories too; tell the
            // cases apart by looking at the occupant. EEXIST with no
            // occupant comes from creating leading directories over one of
            // our files, which the ancestor scan below resolves.
            libc::EEXIST | libc::EISDIR => {
                let Ok(st) = nix::sys::stat::lstat(&worktree.join(path)) else {
                    return self.ancestor_partners(path);
                };
                if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
                    self.paths
                        .iter()
                        .filter(|written| written.starts_with(path) && written.as_path() != path)
                        .cloned()
                        .collect()
                } else {
                    match self.by_ino.get(&st.st_ino) {
                        Some(partner) if partner != path => vec![partner.clone()],
                        _ => Vec::new(),
                    }
                }
            }
            libc::ENOTDIR | libc::ENOENT => self.ancestor_partners(path),
            _ => Vec::new(),
        }
    }

    /// Written paths that are strict ancestors of `path`.
    fn ancestor_partners(&self, path: &Path) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|written| path.starts_with(written) && written.as_path() != path)
            .cloned()
            .collect()
    }
}

/// Classic single-threaded population of one entry, with collision
/// detection and last-writer-wins clobbering on `EEXIST`.
fn populate_sequential<S, C>(
    worktree: &Path,
    entries: &[IndexEntry],
    pos: usize,
    store: &S,
    convert: &C,
    written: &mut WrittenPaths,
    report: &mut PopulateReport,
) where
    S: ObjectStore,
    C: Converter,
{
    let entry = &entries[pos];
    let target = worktree.join(&entry.path);

    let content = match store.read_object(&entry.oid) {
        Ok(obj) if obj.kind == ObjectKind::Blob => obj.data,
        Ok(_) => {
            report.errors.push(EntryError {
                path: entry.path.clone(),
                class: ErrorClass::Load,
                errno: libc::EINVAL,
            });
            return;
        }
        Err(err) => {
            report.errors.push(EntryError {
                path: entry.path.clone(),
                class: ErrorClass::Load,
                errno: err.raw_os_error().unwrap_or(libc::EIO),
            });
            return;
        }
    };

    let mut result = populate_file(&target, entry.exec_bit(), &entry.attrs, &content, convert);

    if result.class == ErrorClass::Open {
        let partners = written.collision_partners(worktree, &entry.path, result.errno);
        if !partners.is_empty() {
            note_collision(report, &entry.path, &partners);
        }
        let occupant_is_file = nix::sys::stat::lstat(&target)
            .map(|st| st.st_mode & libc::S_IFMT != libc::S_IFDIR)
            .unwrap_or(false);
        if result.errno == libc::EEXIST && occupant_is_file {
            // The classic path replaces whatever occupies the slot.
            match std::fs::remove_file(&target) {
                Ok(()) => {
                    result =
                        populate_file(&target, entry.exec_bit(), &entry.attrs, &content, convert);
                }
                Err(err) => {
                    result.errno = err.raw_os_error().unwrap_or(result.errno);
                }
            }
        }
    }

    if result.class == ErrorClass::Ok {
        written.record(&entry.path, result.stat.ino);
        report.updated.push((pos, result.stat));
    } else {
        report.errors.push(EntryError {
            path: entry.path.clone(),
            class: result.class,
            errno: result.errno,
        });
    }
}

fn note_collision(report: &mut PopulateReport, path: &Path, partners: &[PathBuf]) {
    for candidate in partners.iter().chain(std::iter::once(&path.to_path_buf())) {
        if !report.collided.contains(candidate) {
            report.collided.push(candidate.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::AttrAction;
    use crate::convert::DefaultConverter;
    use crate::odb::BlobDir;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_hex(&format!("{n:02x}").repeat(20)).unwrap()
    }

    fn entry(path: &str, n: u8) -> IndexEntry {
        IndexEntry {
            oid: oid(n),
            mode: 0o100644,
            path: PathBuf::from(path),
            attrs: ConvertAttrs::default(),
            needs_update: true,
        }
    }

    fn fixture(blobs: u8) -> (tempfile::TempDir, BlobDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobDir::new(dir.path().join("odb"));
        for n in 0..blobs {
            store.insert(&oid(n), format!("blob {n}\n").as_bytes()).unwrap();
        }
        let worktree = dir.path().join("wt");
        std::fs::create_dir(&worktree).unwrap();
        (dir, store, worktree)
    }

    fn settings(dir: &Path, threshold: usize) -> CheckoutSettings {
        // Helper program is never spawned in these tests; the threshold
        // keeps everything on the sequential path.
        let mut s = CheckoutSettings::new(dir.join("no-helper"), dir.join("odb"));
        s.threshold = threshold;
        s
    }

    #[test]
    fn below_threshold_populates_sequentially() {
        let (dir, store, worktree) = fixture(3);
        let entries = vec![entry("a", 0), entry("b/c", 1), entry("d", 2)];

        let report = populate_worktree(
            &settings(dir.path(), 100),
            CheckoutMode::Async,
            &worktree,
            &entries,
            &store,
            &DefaultConverter,
        )
        .unwrap();

        assert!(!report.parallel);
        assert_eq!(report.updated.len(), 3);
        assert!(report.errors.is_empty());
        assert_eq!(std::fs::read(worktree.join("b/c")).unwrap(), b"blob 1\n");
    }

    #[test]
    fn skips_entries_not_needing_update() {
        let (dir, store, worktree) = fixture(2);
        let mut keep = entry("keep", 0);
        keep.needs_update = false;
        let entries = vec![keep, entry("write", 1)];

        let report = populate_worktree(
            &settings(dir.path(), 100),
            CheckoutMode::Sync,
            &worktree,
            &entries,
            &store,
            &DefaultConverter,
        )
        .unwrap();

        assert_eq!(report.updated.len(), 1);
        assert!(!worktree.join("keep").exists());
        assert!(worktree.join("write").exists());
    }

    #[test]
    fn sequential_clobbers_duplicate_paths() {
        let (dir, store, worktree) = fixture(2);
        // The second create fails with EEXIST; the classic path replaces
        // the file, last writer wins, and no collision is reported.
        let entries = vec![entry("same", 0), entry("same", 1)];

        let report = populate_worktree(
            &settings(dir.path(), 100),
            CheckoutMode::Async,
            &worktree,
            &entries,
            &store,
            &DefaultConverter,
        )
        .unwrap();

        assert_eq!(report.updated.len(), 2);
        assert!(report.collided.is_empty());
        assert_eq!(std::fs::read(worktree.join("same")).unwrap(), b"blob 1\n");
    }

    #[test]
    fn directory_file_collision_is_reported() {
        let (dir, store, worktree) = fixture(2);
        let entries = vec![entry("name/inner", 0), entry("name", 1)];

        let report = populate_worktree(
            &settings(dir.path(), 100),
            CheckoutMode::Async,
            &worktree,
            &entries,
            &store,
            &DefaultConverter,
        )
        .unwrap();

        // "name" cannot be created over the directory; the clash is
        // surfaced as a collision plus an error for the loser.
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].class, ErrorClass::Open);
        assert!(report.collided.contains(&PathBuf::from("name")));
        assert!(report.collided.contains(&PathBuf::from("name/inner")));
    }

    #[test]
    fn filter_entries_never_reach_helpers() {
        let (dir, store, worktree) = fixture(2);
        let mut filtered = entry("filtered", 0);
        filtered.attrs.attr_action = AttrAction::Filter;
        let entries = vec![filtered, entry("plain", 1)];

        // Threshold zero would normally force helpers, but the helper
        // program does not exist; only the filtered entry must stay out of
        // the eligible set, so a single eligible entry still spawns a pool
        // and the spawn failure falls back to sequential.
        let report = populate_worktree(
            &settings(dir.path(), 0),
            CheckoutMode::Async,
            &worktree,
            &entries,
            &store,
            &DefaultConverter,
        )
        .unwrap();

        assert!(!report.parallel);
        assert_eq!(report.updated.len(), 2);
        assert!(worktree.join("filtered").exists());
        assert!(worktree.join("plain").exists());
    }

    #[test]
    fn collision_partner_lookup_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path();
        std::fs::write(worktree.join("winner"), b"x").unwrap();
        let ino = nix::sys::stat::lstat(&worktree.join("winner")).unwrap().st_ino;

        let mut written = WrittenPaths::default();
        written.record(Path::new("Winner"), ino);

        // A case-folding filesystem resolves "winner" to the same inode the
        // run already produced under the name "Winner".
        let partners =
            written.collision_partners(worktree, Path::new("winner"), libc::EEXIST);
        assert_eq!(partners, vec![PathBuf::from("Winner")]);

        // Same path is not a collision with itself.
        let mut same = WrittenPaths::default();
        same.record(Path::new("winner"), ino);
        assert!(
            same.collision_partners(worktree, Path::new("winner"), libc::EEXIST)
                .is_empty()
        );
    }
}
