//! Concurrent tar extraction: a single thread walks the archive's entries in
//! the order they appear on the wire (tar is an inherently sequential
//! format) while regular-file bodies are handed off to a small fixed pool of
//! writer threads so disk I/O for one file doesn't stall the read of the
//! next entry's header. Hard links are a barrier: every outstanding write
//! must land before we can safely link against it, since the tar format
//! lets a link entry point at a file that appeared earlier in the stream.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};

use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ExtractError;

enum Job {
    Write { path: PathBuf, data: Vec<u8>, mode: u32, uid: u32, gid: u32 },
}

/// Tracks how many writer jobs are in flight so a hard-link barrier (or the
/// end of extraction) can wait for the pool to fully drain.
struct Inflight {
    count: Mutex<u64>,
    cv: Condvar,
}

struct WriterPool {
    tx: SyncSender<Job>,
    inflight: Arc<Inflight>,
    error: Arc<Mutex<Option<std::io::Error>>>,
}

impl WriterPool {
    fn new(workers: usize, overwrite: bool) -> Self {
        let (tx, rx) = sync_channel::<Job>(workers.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let inflight = Arc::new(Inflight {
            count: Mutex::new(0),
            cv: Condvar::new(),
        });
        let error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let inflight = inflight.clone();
            let error = error.clone();
            std::thread::spawn(move || loop {
                let job = {
                    let guard = rx.lock().unwrap();
                    guard.recv()
                };
                match job {
                    Ok(Job::Write { path, data, mode, uid, gid }) => {
                        if let Err(err) = write_file(&path, &data, mode, uid, gid, overwrite) {
                            tracing::warn!(?path, %err, "failed to write extracted file");
                            let mut slot = error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        }
                        let mut count = inflight.count.lock().unwrap();
                        *count -= 1;
                        if *count == 0 {
                            inflight.cv.notify_all();
                        }
                    }
                    Err(_) => return,
                }
            });
        }

        Self { tx, inflight, error }
    }

    fn dispatch(&self, job: Job) {
        *self.inflight.count.lock().unwrap() += 1;
        // Blocks once `workers` jobs are already queued, bounding how far
        // ahead of disk the archive reader can get.
        self.tx.send(job).expect("writer pool outlives dispatch calls");
    }

    fn barrier(&self) {
        let mut count = self.inflight.count.lock().unwrap();
        while *count > 0 {
            count = self.inflight.cv.wait(count).unwrap();
        }
    }

    /// Take the first write failure observed so far, if any, clearing it.
    fn check_error(&self) -> Result<(), ExtractError> {
        if let Some(err) = self.error.lock().unwrap().take() {
            return Err(ExtractError::Io(err));
        }
        Ok(())
    }
}

pub struct TarExtractor {
    dest: PathBuf,
    cfg: Arc<Config>,
}

impl TarExtractor {
    pub fn new(dest: impl Into<PathBuf>, cfg: Arc<Config>) -> Self {
        Self { dest: dest.into(), cfg }
    }

    /// Extract every entry of `reader` (an already-decompressed tar stream)
    /// under the destination directory.
    pub fn extract(&self, reader: impl Read) -> Result<(), ExtractError> {
        mkdir_p(&self.dest)?;
        let pool = WriterPool::new(self.cfg.write_workers, self.cfg.overwrite);
        let mut archive = Archive::new(reader);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw_path = entry.path()?.into_owned();
            let Some(relative) = strip_components(&raw_path, self.cfg.strip_components) else {
                continue;
            };
            let dest_path = self.dest.join(&relative);
            let entry_type = entry.header().entry_type();

            match entry_type {
                EntryType::Directory => {
                    let mode = entry.header().mode().unwrap_or(0o755);
                    fs::create_dir_all(&dest_path)?;
                    set_owner(&dest_path, entry.header().uid().ok(), entry.header().gid().ok());
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))?;
                    }
                }
                EntryType::Regular | EntryType::Continuous => {
                    let mode = entry.header().mode().unwrap_or(0o644);
                    let uid = entry.header().uid().unwrap_or(0) as u32;
                    let gid = entry.header().gid().unwrap_or(0) as u32;
                    let size = entry.header().size().unwrap_or(0) as usize;
                    let mut data = Vec::with_capacity(size);
                    entry.read_to_end(&mut data)?;
                    pool.dispatch(Job::Write {
                        path: dest_path,
                        data,
                        mode,
                        uid,
                        gid,
                    });
                }
                EntryType::Link => {
                    // The target may have been queued on a writer thread
                    // moments ago; wait for every pending write before
                    // creating the link.
                    pool.barrier();
                    pool.check_error()?;
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| ExtractError::UnsupportedEntry {
                            path: raw_path.display().to_string(),
                        })?
                        .into_owned();
                    let Some(target_rel) = strip_components(&target, self.cfg.strip_components) else {
                        continue;
                    };
                    let target_path = self.dest.join(target_rel);
                    if self.cfg.overwrite {
                        let _ = fs::remove_file(&dest_path);
                    }
                    fs::hard_link(&target_path, &dest_path)?;
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| ExtractError::UnsupportedEntry {
                            path: raw_path.display().to_string(),
                        })?
                        .into_owned();
                    if self.cfg.overwrite {
                        let _ = fs::remove_file(&dest_path);
                    }
                    #[cfg(unix)]
                    {
                        std::os::unix::fs::symlink(&target, &dest_path)?;
                        let uid = entry.header().uid().ok();
                        let gid = entry.header().gid().ok();
                        let _ = lchown(&dest_path, uid, gid);
                    }
                    #[cfg(not(unix))]
                    fs::write(&dest_path, target.display().to_string())?;
                }
                other => {
                    if self.cfg.ignore_node_files {
                        warn!(path = %raw_path.display(), ?other, "skipping unsupported tar entry");
                    } else {
                        return Err(ExtractError::UnsupportedEntry {
                            path: raw_path.display().to_string(),
                        });
                    }
                }
            }
        }

        debug!("draining outstanding extraction writes");
        pool.barrier();
        pool.check_error()?;
        Ok(())
    }
}

/// Drop the first `n` path components, returning `None` if that consumes the
/// whole path (nothing left to extract at this level).
fn strip_components(path: &Path, n: usize) -> Option<PathBuf> {
    let mut components = path.components();
    for _ in 0..n {
        components.next()?;
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// `mkdir -p` with mode 0755, explicit rather than left to the process
/// umask, for directories implied by an entry's path but never listed in
/// the archive themselves. Skips the chmod if the directory already
/// existed, so it never clobbers a mode a preceding `Directory` entry set
/// deliberately.
fn mkdir_p(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8], mode: u32, uid: u32, gid: u32, overwrite: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        mkdir_p(parent)?;
    }
    if !overwrite && path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        ));
    }
    fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    set_owner(path, Some(uid as u64), Some(gid as u64));
    Ok(())
}

/// Best-effort `chown`; ignored on failure since the extracting process is
/// usually unprivileged and can't change ownership away from itself.
fn set_owner(path: &Path, uid: Option<u64>, gid: Option<u64>) {
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::chown(path, uid.map(|u| u as u32), gid.map(|g| g as u32));
    }
    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
    }
}

/// `chown` follows symlinks, which would set ownership on the link's target
/// rather than the link itself; std has no `lchown`, so call the syscall
/// directly via `libc`, matching the spec's "set uid, gid on the link
/// itself (not the target)" requirement for symlink entries. Best-effort
/// like [`set_owner`]: ignored on failure by the caller.
#[cfg(unix)]
fn lchown(path: &Path, uid: Option<u64>, gid: Option<u64>) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
    let gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);

    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of
    // this call; `-1` as uid/gid (cast from `u32::MAX`) tells `lchown` to
    // leave that half of the ownership unchanged.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_regular_files() {
        let dir = temp_dir::TempDir::new().unwrap();
        let tar_bytes = build_tar(&[("a.txt", b"hello"), ("nested/b.txt", b"world")]);
        let cfg = Arc::new(Config::default());
        let extractor = TarExtractor::new(dir.path().to_path_buf(), cfg);
        extractor.extract(&tar_bytes[..]).unwrap();

        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dir.path().join("nested/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn strip_components_drops_leading_segments() {
        let path = Path::new("archive/dir/file.txt");
        assert_eq!(strip_components(path, 1), Some(PathBuf::from("dir/file.txt")));
        assert_eq!(strip_components(path, 3), None);
    }

    #[test]
    fn refuses_overwrite_by_default() {
        let dir = temp_dir::TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"old").unwrap();
        let tar_bytes = build_tar(&[("a.txt", b"new")]);
        let mut cfg = Config::default();
        cfg.overwrite = false;
        let extractor = TarExtractor::new(dir.path().to_path_buf(), Arc::new(cfg));
        assert!(extractor.extract(&tar_bytes[..]).is_err());
    }
}
