//! Staged in-place rewrites.
//!
//! [`AtomicRewriter`] copies the source into a temporary file that lives
//! next to the destination. Callers mutate the staged copy and publish it
//! with [`AtomicRewriter::commit`], which renames it over the destination.
//! Dropping the rewriter without committing deletes the staged copy, so the
//! destination only ever holds the old bytes or the fully written new ones.
use std::{
    fs::{self, File},
    io::{self, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::error::{ApplyStage, Error, Result};

pub struct AtomicRewriter {
    staged: Option<NamedTempFile>,
    dest: PathBuf,
}

impl AtomicRewriter {
    /// Stage a copy of `src` for `dest`. `dest` may be the path `src` was
    /// opened from.
    pub fn write_in_place(src: &mut File, dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let staged = tempfile::Builder::new()
            .prefix(".artisign-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| Error::apply(ApplyStage::Open, e))?;
        let mut rewriter = Self {
            staged: Some(staged),
            dest: dest.to_path_buf(),
        };
        rewriter
            .copy_from(src)
            .map_err(|e| Error::apply(ApplyStage::Copy, e))?;
        log::debug!(
            "staged rewrite of {} at {}",
            rewriter.dest.display(),
            rewriter.staged_path().display()
        );
        Ok(rewriter)
    }

    fn copy_from(&mut self, src: &mut File) -> io::Result<()> {
        let permissions = src.metadata()?.permissions();
        let staged = self.staged_mut()?;
        src.seek(SeekFrom::Start(0))?;
        staged.as_file_mut().set_len(0)?;
        io::copy(src, staged.as_file_mut())?;
        staged.as_file_mut().seek(SeekFrom::Start(0))?;
        fs::set_permissions(staged.path(), permissions)?;
        Ok(())
    }

    fn staged_mut(&mut self) -> io::Result<&mut NamedTempFile> {
        self.staged
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already released"))
    }

    /// The staged copy. Only the holder of the rewriter can reach it.
    pub fn file(&mut self) -> Result<&mut File> {
        Ok(self.staged_mut()?.as_file_mut())
    }

    pub fn staged_path(&self) -> &Path {
        self.staged.as_ref().map_or(self.dest.as_path(), |s| s.path())
    }

    /// Flush the staged copy to disk and rename it over the destination.
    /// On failure the staged copy is removed and the destination is left
    /// as it was.
    pub fn commit(mut self) -> Result<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::apply(ApplyStage::Commit, "staged file already released"))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| Error::apply(ApplyStage::Commit, e))?;
        staged
            .persist(&self.dest)
            .map_err(|e| Error::apply(ApplyStage::Commit, e.error))?;
        log::debug!("committed rewrite of {}", self.dest.display());
        Ok(())
    }
}

impl Drop for AtomicRewriter {
    fn drop(&mut self) {
        if let Some(staged) = self.staged.take() {
            log::warn!(
                "discarding staged rewrite of {} at {}",
                self.dest.display(),
                staged.path().display()
            );
        }
    }
}
