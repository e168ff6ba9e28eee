use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use crate::{
    error::{StorageError, StorageResult},
    io::{read_full_at, sync_data, write_all_at},
    log::{entry::checksum, storage::LogStorage},
    Lsn,
};

const MAGIC: &[u8; 4] = b"TXLG";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 20;
const COPY_CHUNK: usize = 1 << 20;

/// Log backend over a single file.
///
/// ```text
/// | "TXLG" | version u16 | reserved u16 | base_lsn u64 | crc32 u32 | frames.. |
/// ```
#[derive(Debug)]
pub struct FileLogStorage {
    path: PathBuf,
    file: File,
    base: Lsn,
    end: Lsn,
    read_only: bool,
}

fn encode_header(base: Lsn) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_be_bytes());
    header[8..16].copy_from_slice(&base.get().to_be_bytes());
    let crc = checksum(&header[..16]);
    header[16..20].copy_from_slice(&crc.to_be_bytes());
    header
}

fn decode_header(header: &[u8]) -> StorageResult<Lsn> {
    if &header[..4] != MAGIC {
        return Err(StorageError::log_corrupted(Lsn::ZERO, "bad log file magic"));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(StorageError::log_corrupted(
            Lsn::ZERO,
            format!("unsupported log version {version}"),
        ));
    }
    let stored = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    if stored != checksum(&header[..16]) {
        return Err(StorageError::log_corrupted(Lsn::ZERO, "log header checksum mismatch"));
    }
    let mut base = [0u8; 8];
    base.copy_from_slice(&header[8..16]);
    Ok(Lsn::new(u64::from_be_bytes(base)))
}

fn open_rw(path: &Path) -> StorageResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn sync_parent(path: &Path) -> StorageResult<()> {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

impl FileLogStorage {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_rw(&path)?;
        let len = file.metadata()?.len();

        let base = if len < HEADER_LEN {
            // Fresh log, or a crash before the header reached the disk.
            file.set_len(0)?;
            write_all_at(&file, &encode_header(Lsn::FIRST), 0)?;
            sync_data(&file)?;
            sync_parent(&path)?;
            Lsn::FIRST
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            read_full_at(&file, &mut header, 0)?;
            decode_header(&header)?
        };
        let stored = file.metadata()?.len() - HEADER_LEN;
        tracing::debug!(path = %path.display(), %base, bytes = stored, "opened log file");
        Ok(Self {
            path,
            file,
            base,
            end: base.advance(stored),
            read_only: false,
        })
    }

    /// Opens an existing log for reading only. Nothing is created, repaired
    /// or synced; every write fails.
    pub fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let (base, stored) = if len < HEADER_LEN {
            (Lsn::FIRST, 0)
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            read_full_at(&file, &mut header, 0)?;
            (decode_header(&header)?, len - HEADER_LEN)
        };
        Ok(Self {
            path,
            file,
            base,
            end: base.advance(stored),
            read_only: true,
        })
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::internal(format!(
                "log {} is open read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_offset(&self, lsn: Lsn) -> u64 {
        HEADER_LEN + lsn.distance_from(self.base)
    }
}

impl LogStorage for FileLogStorage {
    fn base_lsn(&self) -> Lsn {
        self.base
    }

    fn end_lsn(&self) -> Lsn {
        self.end
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        write_all_at(&self.file, bytes, self.file_offset(self.end))?;
        self.end = self.end.advance(bytes.len() as u64);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        sync_data(&self.file)?;
        Ok(())
    }

    fn read_at(&self, lsn: Lsn, buf: &mut [u8]) -> StorageResult<usize> {
        if lsn < self.base {
            return Err(StorageError::log_corrupted(
                lsn,
                format!("read before the truncation point {}", self.base),
            ));
        }
        let available = self.end.distance_from(lsn) as usize;
        let len = buf.len().min(available);
        Ok(read_full_at(&self.file, &mut buf[..len], self.file_offset(lsn))?)
    }

    /// Rewrites the retained suffix into a fresh file and renames it over
    /// the old one. Costs one copy of everything from `new_base` to the end.
    fn truncate(&mut self, new_base: Lsn) -> StorageResult<()> {
        if new_base <= self.base {
            return Ok(());
        }
        self.check_writable()?;
        if new_base > self.end {
            return Err(StorageError::internal(format!(
                "cannot truncate to {new_base}: log ends at {}",
                self.end
            )));
        }
        let tmp_path = self.path.with_extension("truncating");
        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_all_at(&tmp, &encode_header(new_base), 0)?;

        let mut chunk = vec![0u8; COPY_CHUNK];
        let mut from = new_base;
        let mut out = HEADER_LEN;
        while from < self.end {
            let n = self.read_at(from, &mut chunk)?;
            if n == 0 {
                break;
            }
            write_all_at(&tmp, &chunk[..n], out)?;
            from = from.advance(n as u64);
            out += n as u64;
        }
        sync_data(&tmp)?;
        fs::rename(&tmp_path, &self.path)?;
        sync_parent(&self.path)?;

        tracing::debug!(old_base = %self.base, %new_base, "rewrote log file");
        self.file = tmp;
        self.base = new_base;
        Ok(())
    }

    fn cut_tail(&mut self, end: Lsn) -> StorageResult<()> {
        self.check_writable()?;
        self.file.set_len(self.file_offset(end))?;
        self.end = end;
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.sync()
    }
}
