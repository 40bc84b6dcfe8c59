//! Extraction of gzip-compressed tarballs.
use std::{
    fs::File,
    io::Read,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::{Error, Result};

/// Maximum number of entries allowed in an archive.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (100 MB).
const MAX_EXTRACTED_SIZE: u64 = 100_000_000;

/// Extract the gzip tarball at `archive` into `output_dir`, returning the extracted file paths.
///
/// Every entry is validated before anything is written: absolute paths, `..` components, links
/// and device entries fail the whole extraction with [`Error::PathEscape`] and leave
/// `output_dir` untouched.
pub fn extract(archive: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let archive = archive.as_ref();
    validate(File::open(archive)?)?;

    std::fs::create_dir_all(output_dir.as_ref())?;
    let dest = output_dir.as_ref().canonicalize()?;

    let mut extracted = Vec::new();
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !matches!(
            entry.header().entry_type(),
            EntryType::Regular | EntryType::Directory
        ) {
            // Metadata headers only; anything else was rejected by validation.
            continue;
        }
        let entry_path = entry.path()?.into_owned();
        let target = dest.join(&entry_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        if entry.header().entry_type() == EntryType::Regular {
            extracted.push(target);
        }
    }

    log::debug!(target: "eventhub",
                archive:debug = archive,
                files = extracted.len();
                "extracted archive");
    Ok(extracted)
}

fn validate(reader: impl Read) -> Result<()> {
    let mut tar = Archive::new(GzDecoder::new(reader));
    let mut entry_count = 0usize;
    let mut total_size: u64 = 0;

    for entry in tar.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();

        entry_count += 1;
        total_size = total_size.saturating_add(entry.header().size()?);
        if entry_count > MAX_ENTRY_COUNT || total_size > MAX_EXTRACTED_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "archive exceeds extraction limits",
            )
            .into());
        }

        if !is_safe_entry_type(entry.header().entry_type()) || !is_safe_path(&path) {
            log::warn!(target: "eventhub", entry:debug = path; "rejected unsafe archive entry");
            return Err(Error::PathEscape { path });
        }
    }
    Ok(())
}

fn is_safe_entry_type(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::Regular
            | EntryType::Directory
            | EntryType::GNULongName
            | EntryType::XHeader
            | EntryType::XGlobalHeader
    )
}

fn is_safe_path(path: &Path) -> bool {
    !path.is_absolute()
        && !path.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::Prefix(_) | Component::RootDir
            )
        })
}
