//! Append-only log of store mutations.
//!
//! A frame is `[u32 len][bincode Record][u32 crc32]`, little-endian. Opening a
//! journal replays it and cuts the file back to the last intact frame, so new
//! appends never land behind a torn or corrupt tail where replay could not
//! reach them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Record;

/// Largest payload a frame may claim. A bigger length prefix is damage, not
/// an allocation request.
const MAX_FRAME_PAYLOAD: usize = 64 << 20;

const FRAME_OVERHEAD: u64 = 8;

/// What was recovered from disk when the journal was opened.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<Record>,
    /// Bytes cut from the end of the file because they did not form a frame.
    pub discarded_bytes: u64,
}

enum Frame {
    Intact(Record, u64),
    End,
    Damaged(&'static str),
}

fn encode_frame(record: &Record) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Read up to `buf.len()` bytes, stopping early only at end of file.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match input.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match fill(input, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Damaged("torn length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Ok(Frame::Damaged("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if fill(input, &mut payload)? < len || fill(input, &mut crc_buf)? < 4 {
        return Ok(Frame::Damaged("torn frame"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Record>(&payload) {
        Ok(record) => Ok(Frame::Intact(record, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Damaged("undecodable record")),
    }
}

/// Intact records of `path` and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Record>, u64, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0, 0)),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    loop {
        match read_frame(&mut reader)? {
            Frame::Intact(record, frame_len) => {
                records.push(record);
                valid_len += frame_len;
            }
            Frame::End => break,
            Frame::Damaged(reason) => {
                warn!(
                    path = %path.display(),
                    offset = valid_len,
                    reason,
                    "journal damaged, replay stops here"
                );
                break;
            }
        }
    }
    Ok((records, valid_len, file_len))
}

/// Writer half of the journal. Appends are staged in memory and become
/// durable together on [`Journal::commit`].
///
/// After any failed write the journal refuses further appends until a
/// successful [`Journal::rewrite`], so a half-written frame is never followed
/// by records that replay would silently drop.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appended: u64,
    poisoned: bool,
}

impl Journal {
    /// Replay `path`, trim any damaged tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Replay)> {
        let (records, valid_len, file_len) = scan(path)?;
        let discarded_bytes = file_len - valid_len;
        if discarded_bytes > 0 {
            warn!(path = %path.display(), discarded_bytes, "trimming journal tail");
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let journal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appended: 0,
            poisoned: false,
        };
        Ok((journal, Replay { records, discarded_bytes }))
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("journal unusable after a failed write"));
        }
        Ok(())
    }

    /// Stage one record. Nothing is durable until `commit`.
    pub fn stage(&mut self, record: &Record) -> io::Result<()> {
        self.check_usable()?;
        // Encoding failures happen before any byte reaches the file.
        let frame = encode_frame(record)?;
        if let Err(e) = self.writer.write_all(&frame) {
            self.poisoned = true;
            return Err(e);
        }
        self.appended += 1;
        Ok(())
    }

    pub fn commit(&mut self) -> io::Result<()> {
        self.check_usable()?;
        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data());
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Replace the whole journal with `records`, e.g. a snapshot of live items.
    /// The new file is written beside the old one and renamed over it.
    pub fn rewrite(&mut self, records: &[Record]) -> io::Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                out.write_all(&encode_frame(record)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appended = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Records staged since open or the last rewrite.
    pub fn appended(&self) -> u64 {
        self.appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictStatus, TimelineItem};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("timeline_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn written(project: &str, id: &str) -> Record {
        Record::ItemWritten {
            project_id: project.into(),
            item: TimelineItem {
                id: id.into(),
                name: format!("item {id}"),
                start_date: "2024-01-01".into(),
                end_date: "2024-01-05T12:00:00Z".into(),
                dependencies: vec!["z".into()],
                assigned_resource_ids: vec!["R1".into()],
                conflict: Some(ConflictStatus::clear()),
                ..Default::default()
            },
        }
    }

    fn append_all(path: &Path, records: &[Record]) {
        let (mut journal, _) = Journal::open(path).unwrap();
        for r in records {
            journal.stage(r).unwrap();
        }
        journal.commit().unwrap();
    }

    #[test]
    fn committed_records_replay_in_order() {
        let path = tmp_path("replay_order.journal");
        let records = vec![
            written("p1", "a"),
            Record::ItemPatched {
                project_id: "p1".into(),
                item_id: "a".into(),
                validation_error: Some(None),
                conflict: None,
            },
            Record::ItemDeleted {
                project_id: "p1".into(),
                item_id: "a".into(),
            },
        ];
        append_all(&path, &records);

        let (journal, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.records, records);
        assert_eq!(replay.discarded_bytes, 0);
        assert_eq!(journal.appended(), 0);
    }

    #[test]
    fn missing_file_opens_empty() {
        let path = tmp_path("fresh.journal");
        let (_, replay) = Journal::open(&path).unwrap();
        assert!(replay.records.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn damaged_tail_is_trimmed_so_later_appends_replay() {
        let path = tmp_path("torn_then_append.journal");
        append_all(&path, &[written("p1", "a")]);
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let (mut journal, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.records, vec![written("p1", "a")]);
        assert_eq!(replay.discarded_bytes, 6);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        journal.stage(&written("p1", "b")).unwrap();
        journal.commit().unwrap();
        drop(journal);

        let (_, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.records, vec![written("p1", "a"), written("p1", "b")]);
    }

    #[test]
    fn checksum_mismatch_ends_replay() {
        let path = tmp_path("bad_crc.journal");
        let mut frame = encode_frame(&written("p1", "a")).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        fs::write(&path, &frame).unwrap();

        let (_, replay) = Journal::open(&path).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.discarded_bytes, frame.len() as u64);
    }

    #[test]
    fn oversized_length_prefix_is_damage() {
        let path = tmp_path("huge_len.journal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        let (_, replay) = Journal::open(&path).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.discarded_bytes, 4);
    }

    #[test]
    fn rewrite_replaces_history() {
        let path = tmp_path("rewrite.journal");
        append_all(&path, &vec![written("p1", "a"); 20]);
        let before = fs::metadata(&path).unwrap().len();

        let (mut journal, _) = Journal::open(&path).unwrap();
        journal.stage(&written("p1", "x")).unwrap();
        journal.commit().unwrap();
        assert_eq!(journal.appended(), 1);
        journal.rewrite(&[written("p1", "a")]).unwrap();
        assert_eq!(journal.appended(), 0);
        journal.stage(&written("p1", "b")).unwrap();
        journal.commit().unwrap();
        drop(journal);

        assert!(fs::metadata(&path).unwrap().len() < before);
        let (_, replay) = Journal::open(&path).unwrap();
        assert_eq!(replay.records, vec![written("p1", "a"), written("p1", "b")]);
    }
}
