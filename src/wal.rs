use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bytes of framing around each payload: u32 length prefix + u32 crc32 suffix.
const FRAME_OVERHEAD: u64 = 8;

/// Writes one frame and returns its size in bytes.
fn write_frame<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(len as u64 + FRAME_OVERHEAD)
}

/// Counts bytes accepted by `inner`, including those of a frame that fails
/// partway through.
struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Outcome of reading one frame.
enum Frame<R> {
    Record(R, u64),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is discarded.
    Damaged,
}

fn read_frame<R: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Frame<R>> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Damaged),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Ok(Frame::Damaged);
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? != 4 {
        return Ok(Frame::Damaged);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged);
    }
    match bincode::deserialize::<R>(&payload) {
        Ok(record) => Ok(Frame::Record(record, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Damaged),
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Everything recovered from a log file.
#[derive(Debug)]
pub struct Replay<R> {
    pub records: Vec<R>,
    /// Length of the valid prefix of the file.
    pub valid_len: u64,
    /// Bytes after `valid_len` that could not be decoded.
    pub discarded: u64,
}

/// Append-only write-ahead log of `R` records.
///
/// Each entry is framed as `[u32 len][bincode payload][u32 crc32]`, all little endian.
/// A torn final entry (crash mid-write) fails its length or CRC check and is
/// cut off by [`Wal::recover`] before new appends land behind it.
///
/// A batch that fails to reach disk is cut off the same way by
/// [`Wal::rollback`], so the file only ever holds acknowledged records.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    /// Bytes and records buffered or written since then.
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
    /// Set when a rollback could not restore `durable_len`. Every later
    /// append fails until the log is reopened.
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Replay `path`, truncate any damaged tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<R>)> {
        let replay = Self::replay(path)?;
        if replay.discarded > 0 {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = replay.discarded,
                "truncating damaged WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, replay.records))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
            _record: PhantomData,
        })
    }

    /// Buffer a record without syncing. Follow a batch with [`Wal::flush_sync`],
    /// or [`Wal::rollback`] if anything in the batch failed.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback; reopen required"));
        }
        // A frame that fails halfway still counts, so rollback cuts it off too.
        let mut counted = CountingWriter {
            inner: &mut self.writer,
            written: 0,
        };
        let result = write_frame(&mut counted, record);
        self.pending_len += counted.written;
        result?;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Make every buffered record durable. On error the caller must
    /// [`Wal::rollback`] before appending again.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Discard everything appended since the last successful
    /// [`Wal::flush_sync`]: unflushed buffer contents are dropped and bytes
    /// that already reached the file are truncated away.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_durable();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_len = 0;
        self.pending_appends = 0;
        if let Err(e) = &result {
            tracing::error!(error = %e, path = %self.path.display(), "WAL rollback failed");
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (_, _unwritten) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `records` via a synced temp file and an atomic rename.
    pub fn rewrite(&mut self, records: &[R]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                write_frame(&mut tmp, record)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent()
            && let Ok(d) = File::open(dir)
        {
            let _ = d.sync_all();
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.pending_len = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record from `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    records: Vec::new(),
                    valid_len: 0,
                    discarded: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            match read_frame::<R>(&mut reader)? {
                Frame::Record(record, size) => {
                    records.push(record);
                    valid_len += size;
                }
                Frame::End | Frame::Damaged => break,
            }
        }

        Ok(Replay {
            records,
            valid_len,
            discarded: total.saturating_sub(valid_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("curbside_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn day_created(label: &str) -> Event {
        Event::ResourceDayCreated {
            id: Ulid::new(),
            label: label.into(),
            capacity: 7,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            day_created("Monday"),
            Event::ReservationMoved {
                id: Ulid::new(),
                resource_day_id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            },
        ];
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, events);
        assert_eq!(replay.discarded, 0);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn recover_truncates_torn_tail_so_later_appends_survive() {
        let path = tmp_path("torn_tail.wal");
        let first = day_created("Monday");
        let second = day_created("Tuesday");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // half-written length prefix plus junk
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let (mut wal, records) = Wal::<Event>::recover(&path).unwrap();
            assert_eq!(records, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![first, second]);
        assert_eq!(replay.discarded, 0);
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::ReservationCancelled { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert!(replay.discarded > 0);
    }

    #[test]
    fn rewrite_shrinks_log_and_accepts_appends() {
        let path = tmp_path("rewrite.wal");
        let keep = day_created("Monday");
        let mut wal = Wal::<Event>::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for _ in 0..20 {
            let id = Ulid::new();
            wal.append(&Event::ReservationCancelled { id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        wal.rewrite(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewritten log should be smaller: {after} < {before}");

        let extra = day_created("Friday");
        wal.append(&extra).unwrap();
        drop(wal);

        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![keep, extra]);
    }

    #[test]
    fn rollback_drops_unflushed_buffer() {
        let path = tmp_path("rollback_buffer.wal");
        let kept = day_created("Monday");
        let dropped = day_created("Tuesday");
        let later = day_created("Wednesday");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&dropped).unwrap();
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap().records, vec![kept, later]);
    }

    #[test]
    fn rollback_truncates_bytes_that_reached_the_file() {
        let path = tmp_path("rollback_synced.wal");
        let kept = day_created("Monday");
        let failed = day_created("Tuesday");
        let later = day_created("Wednesday");
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            wal.append(&kept).unwrap();
            let durable = fs::metadata(&path).unwrap().len();

            wal.append_buffered(&failed).unwrap();
            wal.fail_next_sync();
            assert!(wal.flush_sync().is_err());
            assert!(fs::metadata(&path).unwrap().len() > durable);

            wal.rollback().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), durable);
            wal.append(&later).unwrap();
        }
        let replay = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replay.records, vec![kept, later]);
        assert_eq!(replay.discarded, 0);
    }

    #[test]
    fn reopen_resumes_from_existing_length() {
        let path = tmp_path("reopen_len.wal");
        let first = day_created("Monday");
        let second = day_created("Tuesday");
        Wal::<Event>::open(&path).unwrap().append(&first).unwrap();

        let mut wal = Wal::<Event>::open(&path).unwrap();
        wal.append_buffered(&second).unwrap();
        wal.rollback().unwrap();
        drop(wal);
        assert_eq!(Wal::<Event>::replay(&path).unwrap().records, vec![first]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| day_created(&format!("day{i}"))).collect();
        {
            let mut wal = Wal::<Event>::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap().records, events);
    }
}
