use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::StorageResult,
    io::{check_page_buffer, page_offset, PageHandle},
    page::PAGE_SIZE,
    PageId,
};

/// Page handle over a single file using positional reads and writes, so
/// concurrent calls never share a seek cursor.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: File,
}

impl FileHandle {
    /// Opens the page file at `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        tracing::debug!(path = %path.display(), "opened page file");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        std::os::unix::fs::FileExt::read_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::FileExt::seek_read(file, buf, offset)
    }
}

fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        std::os::unix::fs::FileExt::write_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::FileExt::seek_write(file, buf, offset)
    }
}

/// Fills `buf` from `offset`, stopping early at end of file. Returns the
/// number of bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match write_at(file, &buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write at offset {offset}"),
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Flushes file data (not metadata) to stable storage.
#[cfg(target_os = "linux")]
pub(crate) fn sync_data(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the
    // duration of the call.
    let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sync_data(file: &File) -> io::Result<()> {
    file.sync_data()
}

impl PageHandle for FileHandle {
    fn read(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        let filled = read_full_at(&self.file, buf, page_offset(page))?;
        // Past the end of the file.
        buf[filled..].fill(0);
        Ok(())
    }

    fn write(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        write_all_at(&self.file, buf, page_offset(page))?;
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        sync_data(&self.file)?;
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u64> {
        let len = self.file.metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64))
    }

    fn close(&self) -> StorageResult<()> {
        self.force()?;
        tracing::debug!(path = %self.path.display(), "closed page file");
        Ok(())
    }
}
