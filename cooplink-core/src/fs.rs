//! Filesystem helpers shared by the transfer engine.
//!
//! - batch inspection, including folders walked recursively
//! - sanitising of relative paths offered by a peer
//! - collision naming (`file (1).ext`)
//! - [`PartialFile`]: write to a sibling part file, verify, then rename into
//!   place; an unfinished part file is removed on drop
//! - save-location validation and free-space probing

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ErrorCode;

const PART_SUFFIX: &str = ".cooplink-part";

/// One file of a batch, as inspected on the sending side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    /// Name offered to the receiver: the file name, or for files found in
    /// a folder the path from that folder down, joined with `/`.
    pub name: String,
    pub size: u64,
}

/// Inspects a batch of files and folders before a transfer is created.
///
/// Folders are walked recursively; symlinks are not followed and empty
/// files inside a folder are skipped.
///
/// # Errors
///
/// Returns [`ErrorCode::InvalidFileSet`] if the batch is empty, a folder
/// holds nothing to send, or any file is unreadable. A file named directly
/// must be non-empty.
pub async fn inspect_files(paths: &[PathBuf]) -> Result<Vec<FileDescriptor>, ErrorCode> {
    if paths.is_empty() {
        return Err(ErrorCode::InvalidFileSet);
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            debug!(path = %path.display(), error = %e, "File not accessible");
            ErrorCode::InvalidFileSet
        })?;
        if metadata.is_dir() {
            let root = tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.clone());
            let found = tokio::task::spawn_blocking(move || walk_folder(&root))
                .await
                .map_err(|_| ErrorCode::InvalidFileSet)??;
            if found.is_empty() {
                debug!(path = %path.display(), "Folder has no files to send");
                return Err(ErrorCode::InvalidFileSet);
            }
            files.extend(found);
            continue;
        }
        if !metadata.is_file() || metadata.len() == 0 {
            debug!(path = %path.display(), "Not a non-empty regular file");
            return Err(ErrorCode::InvalidFileSet);
        }
        // Opening proves readability; metadata alone does not.
        File::open(path).await.map_err(|e| {
            debug!(path = %path.display(), error = %e, "File not readable");
            ErrorCode::InvalidFileSet
        })?;

        files.push(FileDescriptor {
            path: path.clone(),
            name: file_name(path),
            size: metadata.len(),
        });
    }
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "unnamed".into(), |n| n.to_string_lossy().to_string())
}

/// Lists the regular files under `root` in a stable order, each named from
/// `root`'s own name down.
fn walk_folder(root: &Path) -> Result<Vec<FileDescriptor>, ErrorCode> {
    let top = file_name(root);
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            debug!(root = %root.display(), error = %e, "Folder not readable");
            ErrorCode::InvalidFileSet
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let size = entry.metadata().map_err(|_| ErrorCode::InvalidFileSet)?.len();
        if size == 0 {
            debug!(path = %path.display(), "Skipping empty file");
            continue;
        }
        std::fs::File::open(path).map_err(|e| {
            debug!(path = %path.display(), error = %e, "File not readable");
            ErrorCode::InvalidFileSet
        })?;

        let relative = path.strip_prefix(root).map_err(|_| ErrorCode::InvalidFileSet)?;
        let mut name = top.clone();
        for part in relative.components() {
            name.push('/');
            name.push_str(&part.as_os_str().to_string_lossy());
        }
        files.push(FileDescriptor {
            path: path.to_path_buf(),
            name,
            size,
        });
    }
    Ok(files)
}

/// Reduces a peer-supplied relative path to safe components joined by `/`.
///
/// Both `/` and `\` separate components. Empty, `.` and `..` components
/// are dropped, as are control characters and `:`, so the result always
/// stays below the directory it is joined onto.
#[must_use]
pub fn sanitize_relative_path(name: &str) -> String {
    let parts: Vec<String> = name.split(['/', '\\']).filter_map(clean_component).collect();
    if parts.is_empty() {
        "unnamed".into()
    } else {
        parts.join("/")
    }
}

fn clean_component(part: &str) -> Option<String> {
    let cleaned: String = part.chars().filter(|c| !c.is_control() && *c != ':').collect();
    let cleaned = cleaned.trim();
    (!cleaned.is_empty() && cleaned != "." && cleaned != "..").then(|| cleaned.to_string())
}

/// Finds a path that neither exists nor is `taken`, appending ` (N)` before
/// the extension on collision. Returns `path` unchanged when it is free.
pub fn find_available_path(path: PathBuf, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let free = |p: &Path| !p.exists() && !taken(p);
    if free(&path) {
        return path;
    }

    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let parent = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let (base, ext) = match filename.find('.') {
        Some(0) | None => (filename.clone(), String::new()),
        Some(dot) => (filename[..dot].to_string(), filename[dot..].to_string()),
    };

    // "report (2).pdf" continues from 3 rather than nesting suffixes.
    let (stem, mut counter) = base
        .rfind(" (")
        .filter(|_| base.ends_with(')'))
        .and_then(|open| {
            base[open + 2..base.len() - 1]
                .parse::<u32>()
                .ok()
                .map(|n| (base[..open].to_string(), n + 1))
        })
        .unwrap_or((base, 1));

    loop {
        let candidate = parent.join(format!("{stem} ({counter}){ext}"));
        if free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Checks that `dir` is an existing directory this process can write to.
///
/// # Errors
///
/// Returns [`ErrorCode::InvalidSaveLocation`] otherwise.
pub fn validate_save_dir(dir: &Path) -> Result<(), ErrorCode> {
    let metadata = std::fs::metadata(dir).map_err(|_| ErrorCode::InvalidSaveLocation)?;
    if !metadata.is_dir() || metadata.permissions().readonly() {
        return Err(ErrorCode::InvalidSaveLocation);
    }

    let probe = dir.join(format!(".cooplink-probe-{}", uuid::Uuid::new_v4()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Save location not writable");
            Err(ErrorCode::InvalidSaveLocation)
        }
    }
}

/// Maps a write-side I/O error to the reason code surfaced to the user.
#[must_use]
pub fn io_error_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => ErrorCode::InsufficientStorage,
        _ => ErrorCode::Corrupted,
    }
}

/// Free-space lookup for a destination directory.
pub trait StorageProbe: Send + Sync + 'static {
    /// Bytes available to unprivileged writers under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem holding `dir` cannot be determined.
    fn available_bytes(&self, dir: &Path) -> anyhow::Result<u64>;
}

/// [`StorageProbe`] backed by the system disk table: the disk whose mount
/// point is the longest prefix of `dir` wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpace;

impl StorageProbe for DiskSpace {
    fn available_bytes(&self, dir: &Path) -> anyhow::Result<u64> {
        use sysinfo::Disks;

        let disks = Disks::new_with_refreshed_list();
        let abs = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());

        disks
            .list()
            .iter()
            .filter(|disk| abs.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
            .ok_or_else(|| anyhow::anyhow!("no disk found for {}", dir.display()))
    }
}

/// A destination file being received.
///
/// Bytes go to `<dest>.cooplink-part`; [`finish`](Self::finish) verifies the
/// SHA-256 digest and renames the part file onto `dest`. If the value is
/// dropped before a successful finish, the part file is deleted so no
/// truncated artifact is left behind.
pub struct PartialFile {
    file: Option<File>,
    dest: PathBuf,
    part: PathBuf,
    hasher: Sha256,
    written: u64,
    finished: bool,
}

impl PartialFile {
    /// Creates the part file next to `dest`, and any missing parent
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns the reason code for the I/O failure.
    pub async fn create(dest: PathBuf) -> Result<Self, ErrorCode> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                warn!(path = %parent.display(), error = %e, "Failed to create directory");
                io_error_code(&e)
            })?;
        }
        let mut part = dest.clone().into_os_string();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part)
            .await
            .map_err(|e| {
                warn!(path = %part.display(), error = %e, "Failed to create part file");
                io_error_code(&e)
            })?;

        Ok(Self {
            file: Some(file),
            dest,
            part,
            hasher: Sha256::new(),
            written: 0,
            finished: false,
        })
    }

    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends `data` at the current end of file.
    ///
    /// # Errors
    ///
    /// Returns the reason code for the I/O failure.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ErrorCode> {
        let Some(file) = self.file.as_mut() else {
            return Err(ErrorCode::Corrupted);
        };
        file.write_all(data).await.map_err(|e| {
            warn!(path = %self.part.display(), error = %e, "Write failed");
            io_error_code(&e)
        })?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Verifies the received bytes against the sender's declared size and
    /// digest and moves the file into place.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Corrupted`] on size or digest mismatch (the part file is
    /// removed), or the reason code of an I/O failure.
    pub async fn finish(mut self, expected_size: u64, expected_sha256: &str) -> Result<PathBuf, ErrorCode> {
        let mut file = self.file.take().ok_or(ErrorCode::Corrupted)?;
        file.flush().await.map_err(|e| io_error_code(&e))?;
        file.sync_all().await.map_err(|e| io_error_code(&e))?;
        drop(file);

        let digest = hex::encode(std::mem::take(&mut self.hasher).finalize());
        if self.written != expected_size || !digest.eq_ignore_ascii_case(expected_sha256) {
            warn!(
                path = %self.dest.display(),
                written = self.written,
                expected_size,
                "Integrity check failed"
            );
            return Err(ErrorCode::Corrupted);
        }

        tokio::fs::rename(&self.part, &self.dest).await.map_err(|e| {
            warn!(path = %self.dest.display(), error = %e, "Failed to move file into place");
            io_error_code(&e)
        })?;
        self.finished = true;
        Ok(self.dest.clone())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.part)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.part.display(), error = %e, "Failed to remove partial file");
        }
    }
}
