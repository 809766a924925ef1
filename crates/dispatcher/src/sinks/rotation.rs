//! Size-based rotation of a file destination
//!
//! Backups follow the `app.log.1` (newest) .. `app.log.N` (oldest) scheme,
//! with a `.gz` suffix when compressed.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Path of backup `index` (1-based)
pub fn backup_path(path: &Path, index: usize, compressed: bool) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    if compressed {
        name.push(".gz");
    }
    PathBuf::from(name)
}

/// Move the active file into the backup sequence
///
/// The oldest backup beyond `backup_count` is deleted. With a backup count of
/// zero the active file is simply removed. The caller reopens the active
/// path afterwards.
pub fn rotate(path: &Path, backup_count: usize, compress: bool) -> io::Result<()> {
    if backup_count == 0 {
        return remove_if_exists(path);
    }

    remove_if_exists(&backup_path(path, backup_count, false))?;
    remove_if_exists(&backup_path(path, backup_count, true))?;

    for index in (1..backup_count).rev() {
        for compressed in [false, true] {
            let from = backup_path(path, index, compressed);
            if from.exists() {
                fs::rename(&from, backup_path(path, index + 1, compressed))?;
            }
        }
    }

    let first = backup_path(path, 1, false);
    fs::rename(path, &first)?;

    if compress {
        gzip_in_place(&first, &backup_path(path, 1, true))?;
    }
    Ok(())
}

fn gzip_in_place(source: &Path, target: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(target)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::remove_file(source)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
