//! Write-to-temp-then-rename file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Marker present in the name of every in-flight temporary file.
pub(crate) const TEMP_MARKER: &str = ".tmp.";

/// Replaces a file atomically.
///
/// Bytes go to a uniquely named sibling temp file; [`AtomicFile::commit`]
/// flushes, fsyncs, and renames it over the target. Readers therefore see
/// either the previous file or the complete new one. Dropping an uncommitted
/// writer removes the temp file.
pub(crate) struct AtomicFile {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    pub(crate) fn create(final_path: &Path) -> IoResult<Self> {
        let mut temp_name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(format!("{TEMP_MARKER}{}", Uuid::new_v4()));
        let temp_path = final_path.with_file_name(temp_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path: final_path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    pub(crate) fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("writer already consumed"))
    }

    /// Flushes, fsyncs, and renames the temp file over the target.
    pub(crate) fn commit(mut self) -> IoResult<PathBuf> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| std::io::Error::other("writer already consumed"))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| std::io::Error::other("temp_path already consumed"))?;
        if let Err(err) = fs::rename(&temp_path, &self.final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        Ok(self.final_path.clone())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TEMP_MARKER))
}
