use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// One framed record: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "event too large for a WAL record"))?;
    let mut record = Vec::with_capacity(LEN_BYTES + payload.len() + CRC_BYTES);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(record)
}

/// Why reading stopped short of a clean end of file.
#[derive(Debug)]
enum Damage {
    Torn,
    Checksum,
    Undecodable(bincode::Error),
}

impl std::fmt::Display for Damage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Damage::Torn => write!(f, "torn record"),
            Damage::Checksum => write!(f, "checksum mismatch"),
            Damage::Undecodable(e) => write!(f, "undecodable record: {e}"),
        }
    }
}

enum Record {
    Event(Event),
    End,
    Damaged(Damage),
}

/// Fill `buf` completely. `Ok(false)` when the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len = [0u8; LEN_BYTES];
    match reader.read(&mut len[..1])? {
        0 => return Ok(Record::End),
        _ if !read_full(reader, &mut len[1..])? => return Ok(Record::Damaged(Damage::Torn)),
        _ => {}
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    let mut crc = [0u8; CRC_BYTES];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut crc)? {
        return Ok(Record::Damaged(Damage::Torn));
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged(Damage::Checksum));
    }
    Ok(match bincode::deserialize(&payload) {
        Ok(event) => Record::Event(event),
        Err(e) => Record::Damaged(Damage::Undecodable(e)),
    })
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Append-only event log behind the engine.
///
/// Records are buffered by [`Wal::append_buffered`] and made durable together
/// by [`Wal::flush_sync`]. A crash can only damage the tail, so replay keeps
/// every record before the first damaged one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.writer.write_all(&frame(event)?)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` to the staging file next to `path` and fsync it. The
    /// live log is untouched until [`Wal::swap_compact_file`].
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut staged = BufWriter::new(File::create(Self::staging_path(path))?);
        for event in events {
            staged.write_all(&frame(event)?)?;
        }
        staged.flush()?;
        staged.get_ref().sync_all()
    }

    /// Move the staging file over the live log and append to it from now on.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::staging_path(&self.path), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record of the log at `path`, oldest first. A missing file
    /// is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let mut reader = match File::open(path) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Damaged(damage) => {
                    warn!(path = %path.display(), kept = events.len(), "dropping WAL tail: {damage}");
                    break;
                }
            }
        }
        Ok(events)
    }
}
