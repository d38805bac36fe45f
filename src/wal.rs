use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Upper bound on one encoded event. A larger length prefix can only come
/// from a corrupt frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame.
enum Frame {
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Short or corrupt frame; everything from here on is discarded.
    Torn(&'static str),
}

fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    let mut first = [0u8; 1];
    // Distinguish a clean EOF from a frame cut inside its length prefix.
    if reader.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    len_buf[0] = first[0];
    if !fill(reader, &mut len_buf[1..])? {
        return Ok(Frame::Torn("truncated length"));
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(Frame::Torn("oversized frame"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(Frame::Torn("truncated payload"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize(&payload) {
        Ok(event) => Ok(Frame::Event(event, (len + 8) as u64)),
        Err(_) => Ok(Frame::Torn("undecodable event")),
    }
}

/// Read every intact frame of `path`. Returns the events and the byte length
/// of the intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid = 0u64;
    loop {
        match read_frame(&mut reader)? {
            Frame::Event(event, size) => {
                events.push(event);
                valid += size;
            }
            Frame::End => break,
            Frame::Torn(why) => {
                tracing::warn!("{}: {why} at byte {valid}, discarding tail", path.display());
                break;
            }
        }
    }
    Ok((events, valid))
}

/// Append-only write-ahead log of one space.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little-endian.
/// A crash can leave a partial last record; `open` cuts it off so that
/// later appends stay readable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log, returning it with the events it holds.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: events.len() as u64,
        };
        Ok((wal, events))
    }

    /// Events currently on disk, without opening for writes.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
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

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted log over the live one and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        if let Some(dir) = self.path.parent()
            && let Ok(dir) = File::open(dir)
        {
            let _ = dir.sync_all();
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Records appended since the last compaction (or since open, counting
    /// replayed records).
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Member, Resource, ResourceKind};
    use ulid::Ulid;

    fn tmp(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("coworkd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(Wal::compact_path(&path));
        path
    }

    fn member(name: &str) -> Event {
        Event::MemberCreated {
            member: Member {
                id: Ulid::new(),
                name: name.into(),
                email: format!("{name}@example.com"),
                active: true,
            },
        }
    }

    fn desk(name: &str) -> Event {
        Event::ResourceCreated {
            resource: Resource {
                id: Ulid::new(),
                name: name.into(),
                kind: ResourceKind::Desk,
                capacity: 1,
                active: true,
            },
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn append_and_reopen() {
        let path = tmp("reopen.wal");
        let events = vec![desk("A1"), member("amira"), member("youssef")];
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 3);
        }
        let (wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(wal.appends_since_compact(), 3);
    }

    #[test]
    fn torn_tail_is_cut_and_later_appends_survive() {
        let path = tmp("torn.wal");
        let first = desk("A1");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Simulate a crash halfway through the next record.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        let second = member("amira");
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = tmp("crc.wal");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&desk("A1")).unwrap();
            wal.append(&desk("A2")).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp("oversized.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        let (_, replayed) = Wal::open(&path).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn compaction_replaces_contents() {
        let path = tmp("compact.wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        for i in 0..10 {
            wal.append(&member(&format!("m{i}"))).unwrap();
        }
        let kept = vec![desk("A1")];
        wal.compact(&kept).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let extra = member("late");
        wal.append(&extra).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept[0].clone(), extra]);
        assert!(!Wal::compact_path(&path).exists());
    }
}
