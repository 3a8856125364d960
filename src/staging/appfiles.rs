//! Materialising application bits into the droplet `app/` directory.
use std::path::Path;

use anyhow::{Context as _, Result};

use crate::error::ConfigError;

/// Copy application bits into `appdir`.
///
/// A regular file is treated as a zip archive: when every entry shares the
/// first entry as a common top-level prefix, that prefix is stripped (the
/// archive is unpacked into a scratch directory under `contextdir` and the
/// prefixed tree is overlaid into `appdir`); otherwise the archive is
/// extracted as-is. A directory is overlaid file by file, overwriting
/// duplicates. Anything else is an error.
///
/// # Errors
///
/// Returns an error if the source does not exist, the archive cannot be
/// read, or any copy fails.
pub fn materialize(source: &Path, appdir: &Path, contextdir: &Path) -> Result<()> {
    if source.is_file() {
        extract_zip(source, appdir, contextdir)
    } else if source.is_dir() {
        recursive_overwrite(source, appdir)
    } else {
        Err(ConfigError::AppPathNotFound(source.display().to_string()).into())
    }
}

/// Extract a zip archive into `appdir`, stripping a shared top-level
/// prefix when present.
fn extract_zip(source: &Path, appdir: &Path, contextdir: &Path) -> Result<()> {
    let file = std::fs::File::open(source)
        .with_context(|| format!("cannot open application archive {}", source.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("cannot read application archive {}", source.display()))?;

    // The first entry is taken as the candidate root path.
    let base = archive.file_names().next().map(ToOwned::to_owned);
    let strip_base = base.as_ref().is_some_and(|base| {
        archive.file_names().all(|name| name.starts_with(base.as_str()))
    });

    if let Some(base) = base.filter(|_| strip_base) {
        let scratch = tempfile::tempdir_in(contextdir)
            .context("cannot create scratch directory for archive extraction")?;
        archive
            .extract(scratch.path())
            .with_context(|| format!("cannot extract {}", source.display()))?;
        recursive_overwrite(&scratch.path().join(base.trim_end_matches('/')), appdir)?;
    } else {
        archive
            .extract(appdir)
            .with_context(|| format!("cannot extract {}", source.display()))?;
    }
    Ok(())
}

/// Recursively copy `src` into `dest`, creating directories as needed and
/// overwriting files that already exist.
pub fn recursive_overwrite(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        if !dest.is_dir() {
            std::fs::create_dir_all(dest)
                .with_context(|| format!("cannot create {}", dest.display()))?;
        }
        for entry in std::fs::read_dir(src)
            .with_context(|| format!("cannot list {}", src.display()))?
        {
            let entry = entry?;
            recursive_overwrite(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        // Copying a file onto an existing directory drops it inside, the
        // way `cp` into a directory behaves.
        let target = if dest.is_dir() {
            src.file_name()
                .map_or_else(|| dest.to_path_buf(), |name| dest.join(name))
        } else {
            dest.to_path_buf()
        };
        std::fs::copy(src, &target).with_context(|| {
            format!("cannot copy {} to {}", src.display(), target.display())
        })?;
    }
    Ok(())
}
