//! Payload packing, format sniffing and unpacking
//!
//! A directory is stored as a tar archive rooted at its own basename and
//! compressed with zstd in one pass. A regular file is compressed directly,
//! without a tar header. On restore the decompressed bytes are sniffed for the
//! tar magic, so the payload describes itself and no upload-time flag is
//! needed.
//!
//! Everything here is blocking; async callers use `spawn_blocking`.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use walkdir::WalkDir;

/// Number of decompressed bytes inspected by [`sniff_format`]
pub const SNIFF_LEN: usize = 512;

/// Offset of the magic field in a tar header
const USTAR_MAGIC_OFFSET: usize = 257;

/// Shared prefix of the POSIX (`ustar\0`) and GNU (`ustar `) magic fields
const USTAR_MAGIC: &[u8] = b"ustar";

/// What was packed into a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A single compressed file
    File,
    /// A compressed tar archive of a directory
    Directory,
}

/// A compressed artifact in a private temporary file
///
/// The file is deleted when the payload is dropped.
#[derive(Debug)]
pub struct Payload {
    path: TempPath,
    kind: PayloadKind,
    size: u64,
}

impl Payload {
    /// Location of the compressed bytes
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the payload holds a file or a packed directory
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Compressed size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Format of a decompressed payload, decided by [`sniff_format`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// The original single file
    PlainFile,
    /// A tar archive that must be unpacked
    PackedArchive,
}

impl PayloadFormat {
    /// Materialize a decompressed payload of this format at `destination`
    pub fn restore(
        self,
        decompressed: NamedTempFile,
        destination: &Path,
    ) -> Result<RestoredArtifact> {
        match self {
            Self::PackedArchive => unpack_archive(decompressed.path(), destination),
            Self::PlainFile => persist_file(decompressed, destination),
        }
    }
}

/// What a restore wrote to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoredArtifact {
    /// A single file written at the destination
    File(PathBuf),
    /// A directory tree unpacked at the destination
    Directory(PathBuf),
}

impl RestoredArtifact {
    /// The restored destination path
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::Directory(p) => p,
        }
    }
}

/// Compress `local_path` into a new temporary payload inside `temp_dir`
pub fn pack(local_path: &Path, temp_dir: &Path, level: i32) -> Result<Payload> {
    let metadata = match fs::metadata(local_path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::path_not_found(local_path));
        }
        Err(e) => return Err(Error::io(e, local_path, "stat")),
    };

    fs::create_dir_all(temp_dir).map_err(|e| Error::io(e, temp_dir, "create_dir_all"))?;
    let temp = tempfile::Builder::new()
        .prefix("cistash-")
        .suffix(".zst")
        .tempfile_in(temp_dir)
        .map_err(|e| Error::io(e, temp_dir, "create temporary payload"))?;
    let (file, path) = temp.into_parts();

    let kind = if metadata.is_dir() {
        pack_directory(local_path, file, level)?;
        PayloadKind::Directory
    } else {
        compress_file(local_path, file, level)?;
        PayloadKind::File
    };

    let size = fs::metadata(&path)
        .map_err(|e| Error::io(e, &path, "stat"))?
        .len();

    tracing::debug!(
        path = %local_path.display(),
        kind = ?kind,
        size,
        "Packed payload"
    );

    Ok(Payload { path, kind, size })
}

/// Archive a directory rooted at its basename and compress it
fn pack_directory(src_root: &Path, dst: File, level: i32) -> Result<()> {
    let root_name = archive_root_name(src_root)?;
    let enc = zstd::Encoder::new(dst, level)
        .map_err(|e| Error::io_no_path(e, "create zstd encoder"))?;
    let mut builder = tar::Builder::new(enc);
    builder.follow_symlinks(false);

    // Sorted walk keeps archives byte-identical for identical trees
    for entry in WalkDir::new(src_root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::io_no_path(e.into(), "walk directory"))?;
        let rel = entry.path().strip_prefix(src_root).map_err(|_| {
            Error::configuration(format!(
                "path {} is not under {}",
                entry.path().display(),
                src_root.display()
            ))
        })?;
        let name = root_name.join(rel);
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| Error::io(e, entry.path(), "append to archive"))?;
    }

    let enc = builder
        .into_inner()
        .map_err(|e| Error::io_no_path(e, "finalize archive"))?;
    enc.finish()
        .map_err(|e| Error::io_no_path(e, "finish zstd stream"))?;
    Ok(())
}

/// Compress a single file without an archive header
fn compress_file(src: &Path, dst: File, level: i32) -> Result<()> {
    let mut input = File::open(src).map_err(|e| Error::io(e, src, "open"))?;
    let mut enc = zstd::Encoder::new(dst, level)
        .map_err(|e| Error::io_no_path(e, "create zstd encoder"))?;
    std::io::copy(&mut input, &mut enc).map_err(|e| Error::io(e, src, "compress"))?;
    enc.finish()
        .map_err(|e| Error::io_no_path(e, "finish zstd stream"))?;
    Ok(())
}

/// Name of the top-level archive entry for a directory
fn archive_root_name(dir: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(dir).map_err(|e| Error::io(e, dir, "resolve"))?;
    absolute
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::validation(format!(
                "Cannot archive {}: the path has no directory name",
                dir.display()
            ))
        })
}

/// Directory the payload for `destination` is restored into
///
/// Archives carry their root directory name, so they unpack one level up.
pub(crate) fn restore_parent(destination: &Path) -> Result<PathBuf> {
    let absolute =
        std::path::absolute(destination).map_err(|e| Error::io(e, destination, "resolve"))?;
    Ok(absolute
        .parent()
        .map_or_else(|| absolute.clone(), Path::to_path_buf))
}

/// Decompress a zstd stream from `src` into `dst`
pub fn decompress(src: &Path, dst: &mut File) -> Result<()> {
    let input = File::open(src).map_err(|e| Error::io(e, src, "open"))?;
    zstd::stream::copy_decode(input, dst)
        .map_err(|e| Error::format(format!("zstd decode of {} failed: {e}", src.display())))
}

/// Classify decompressed bytes by the tar magic at its fixed offset
#[must_use]
pub fn sniff_format(prefix: &[u8]) -> PayloadFormat {
    match prefix.get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()) {
        Some(magic) if magic == USTAR_MAGIC => PayloadFormat::PackedArchive,
        _ => PayloadFormat::PlainFile,
    }
}

/// Read the first [`SNIFF_LEN`] bytes of a file and classify them
pub fn sniff_file(path: &Path) -> Result<PayloadFormat> {
    let file = File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut prefix)
        .map_err(|e| Error::io(e, path, "read"))?;
    Ok(sniff_format(&prefix))
}

/// Sniff a decompressed payload and restore it at `destination`
pub fn unpack(decompressed: NamedTempFile, destination: &Path) -> Result<RestoredArtifact> {
    let format = sniff_file(decompressed.path())?;
    tracing::debug!(
        destination = %destination.display(),
        format = ?format,
        "Sniffed payload format"
    );
    format.restore(decompressed, destination)
}

fn unpack_archive(archive_path: &Path, destination: &Path) -> Result<RestoredArtifact> {
    let parent = restore_parent(destination)?;
    fs::create_dir_all(&parent).map_err(|e| Error::io(e, &parent, "create_dir_all"))?;

    let file = File::open(archive_path).map_err(|e| Error::io(e, archive_path, "open"))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive
        .unpack(&parent)
        .map_err(|e| Error::format(format!("unpacking archive into {} failed: {e}", parent.display())))?;

    Ok(RestoredArtifact::Directory(destination.to_path_buf()))
}

fn persist_file(decompressed: NamedTempFile, destination: &Path) -> Result<RestoredArtifact> {
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    decompressed
        .persist(destination)
        .map_err(|e| Error::io(e.error, destination, "persist"))?;
    Ok(RestoredArtifact::File(destination.to_path_buf()))
}

/// Move a staged entry to `destination`
///
/// Directories present on both sides are merged entry by entry. Any other
/// existing entry is replaced by the staged one.
pub fn move_into_place(staged: &Path, destination: &Path) -> Result<()> {
    let staged_meta = fs::symlink_metadata(staged).map_err(|e| Error::io(e, staged, "stat"))?;
    match fs::symlink_metadata(destination) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(e, destination, "stat")),
        Ok(existing) if existing.is_dir() && staged_meta.is_dir() => {
            let entries = fs::read_dir(staged).map_err(|e| Error::io(e, staged, "read_dir"))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io(e, staged, "read_dir"))?;
                move_into_place(&entry.path(), &destination.join(entry.file_name()))?;
            }
            return fs::set_permissions(destination, staged_meta.permissions())
                .map_err(|e| Error::io(e, destination, "set_permissions"));
        }
        Ok(existing) if existing.is_dir() => {
            fs::remove_dir_all(destination)
                .map_err(|e| Error::io(e, destination, "remove_dir_all"))?;
        }
        Ok(_) => {
            fs::remove_file(destination).map_err(|e| Error::io(e, destination, "remove_file"))?;
        }
    }

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    fs::rename(staged, destination).map_err(|e| Error::io(e, destination, "rename"))
}
