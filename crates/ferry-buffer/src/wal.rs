use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BufferError, BufferResult};

/// When appended entries are forced to stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryWrite,
    /// Flush to the OS after every append and leave syncing to the page cache.
    #[default]
    OsDefault,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalConfig {
    #[serde(default)]
    pub sync_mode: SyncMode,
}

/// Frame layout: `[len: u32 LE][crc32: u32 LE][payload]`.
const HEADER_SIZE: u64 = 8;

struct WalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Append-only log of bincode-encoded entries.
///
/// Each entry is framed with its length and a CRC32 of the payload. Recovery
/// reads front to back, skips entries whose checksum does not match, and
/// stops at the first torn tail.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    config: WalConfig,
}

impl WriteAheadLog {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path, config: WalConfig) -> BufferResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            config,
        })
    }

    /// Append one entry. Returns the byte offset the entry starts at.
    pub fn append<E: Serialize>(&self, entry: &E) -> BufferResult<u64> {
        let frame = encode_frame(entry)?;

        let mut w = self.writer.lock().expect("WAL mutex poisoned");
        let entry_offset = w.offset;

        w.writer.write_all(&frame)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }

        w.offset += frame.len() as u64;
        debug!(offset = entry_offset, len = frame.len(), "log append");
        Ok(entry_offset)
    }

    /// Replace the whole log with `entries`.
    ///
    /// The new contents go to a sibling staging file that is synced and then
    /// renamed over the log. If any step fails the old log is left as it was.
    pub fn rewrite<E: Serialize>(&self, entries: &[E]) -> BufferResult<()> {
        let staging = self.staging_path();
        let mut w = self.writer.lock().expect("WAL mutex poisoned");
        w.writer.flush()?;

        let offset = match write_staged(&staging, entries) {
            Ok(offset) => offset,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };
        fs::rename(&staging, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = offset;
        debug!(path = %self.path.display(), entries = entries.len(), offset, "log rewritten");
        Ok(())
    }

    /// Read back every intact entry in append order.
    pub fn recover<E: DeserializeOwned>(&self) -> BufferResult<Vec<E>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset + HEADER_SIZE <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE as usize];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || offset + HEADER_SIZE + length > file_len {
                warn!(offset, length, file_len, "torn log entry; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            file.read_exact(&mut payload)?;
            offset += HEADER_SIZE + length;

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "log entry checksum mismatch; skipping"
                );
                continue;
            }

            match bincode::deserialize::<E>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(offset, error = %e, "undecodable log entry; skipping"),
            }
        }

        debug!(recovered = entries.len(), path = %self.path.display(), "log recovery complete");
        Ok(entries)
    }

    /// Discard every entry, but only if nothing was appended since `offset`
    /// was observed. Returns `true` if the log was truncated.
    pub fn truncate_if_offset(&self, offset: u64) -> BufferResult<bool> {
        let mut w = self.writer.lock().expect("WAL mutex poisoned");
        if w.offset != offset {
            return Ok(false);
        }
        self.truncate_locked(&mut w)?;
        Ok(true)
    }

    /// Current end of the log in bytes.
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("WAL mutex poisoned").offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".compact");
        self.path.with_file_name(name)
    }

    fn truncate_locked(&self, w: &mut WalWriter) -> BufferResult<()> {
        w.writer.flush()?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = 0;
        debug!(path = %self.path.display(), "log truncated");
        Ok(())
    }
}

fn encode_frame<E: Serialize>(entry: &E) -> BufferResult<Vec<u8>> {
    let payload =
        bincode::serialize(entry).map_err(|e| BufferError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        BufferError::Serialization(format!("log entry of {} bytes is too large", payload.len()))
    })?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write `entries` to a fresh file at `path` and sync it. Returns its length.
fn write_staged<E: Serialize>(path: &Path, entries: &[E]) -> BufferResult<u64> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut offset = 0u64;
    for entry in entries {
        let frame = encode_frame(entry)?;
        out.write_all(&frame)?;
        offset += frame.len() as u64;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(offset)
}
