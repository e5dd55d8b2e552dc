use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

fn frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// What came back from disk on startup.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes after the last good record: a crash mid-write or a corrupt record.
    pub discarded_bytes: u64,
}

/// Append-only log of allocation-state events.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little-endian. A torn or corrupt
/// record ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    /// Write a snapshot of the current state next to the log. Slow; runs outside the writer.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appends. Fast; runs inside the writer.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.flush_sync()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_snapshot(&self.path, events)?;
        self.install_snapshot()
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        let mut consumed: u64 = 0;

        loop {
            let mut len_buf = [0u8; HEADER_LEN];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if (len as u64) > total.saturating_sub(consumed) {
                break;
            }

            let mut payload = vec![0u8; len];
            if !read_frame_part(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; TRAILER_LEN];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            let Ok(event) = bincode::deserialize::<Event>(&payload) else {
                break;
            };
            replay.events.push(event);
            consumed += (HEADER_LEN + len + TRAILER_LEN) as u64;
        }

        replay.discarded_bytes = total - consumed;
        Ok(replay)
    }
}
