//! Directory-backed snapshot source and sink.
//!
//! A served directory becomes one `message` record per file, each followed
//! by the file itself as an attachment keyed by the record's `message_id`.
//! An optional `records.jsonl` at the root is sent first, one typed record
//! per line.
//!
//! On the receiving side every record is appended to `records.jsonl` in the
//! output directory. Attachments land in `attachments/<id>.part` and are
//! moved to `files/<name>` once verified.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use serde_json::json;
use uuid::Uuid;

use shuttle_core::{ContentDigest, RecordType, TypedRecord};
use shuttle_transfer::{TransferItem, TransferSink, TransferSource};

pub const RECORDS_FILE: &str = "records.jsonl";
const ATTACHMENTS_DIR: &str = "attachments";
const FILES_DIR: &str = "files";

// ── Source ────────────────────────────────────────────────────────────────────

struct FileEntry {
    path: PathBuf,
    /// Path relative to the served root, `/`-separated.
    name: String,
    size: u64,
}

pub struct DirectorySource {
    records: VecDeque<TypedRecord>,
    files: VecDeque<FileEntry>,
    /// Attachment announced by the last `message` record, not yet yielded.
    pending: Option<(Uuid, FileEntry)>,
    total: u64,
}

impl DirectorySource {
    pub fn open(root: &Path) -> io::Result<Self> {
        let records = read_records(&root.join(RECORDS_FILE))?;

        let mut files = Vec::new();
        collect_files(root, root, &mut files)?;
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let total = records.len() as u64 + 2 * files.len() as u64;
        tracing::info!(
            root = %root.display(),
            records = records.len(),
            files = files.len(),
            "snapshot indexed"
        );
        Ok(Self {
            records,
            files: files.into(),
            pending: None,
            total,
        })
    }
}

impl TransferSource for DirectorySource {
    fn total_count(&self) -> u64 {
        self.total
    }

    fn next_item(&mut self) -> io::Result<Option<TransferItem>> {
        if let Some(record) = self.records.pop_front() {
            return Ok(Some(TransferItem::Record(record)));
        }
        if let Some((id, entry)) = self.pending.take() {
            let reader = BufReader::new(File::open(&entry.path)?);
            return Ok(Some(TransferItem::Attachment {
                id,
                length: entry.size,
                reader: Box::new(reader),
            }));
        }
        let Some(entry) = self.files.pop_front() else {
            return Ok(None);
        };
        let id = Uuid::new_v4();
        let record = TypedRecord::new(
            RecordType::Message,
            json!({
                "message_id": id,
                "name": entry.name,
                "size": entry.size,
            }),
        );
        self.pending = Some((id, entry));
        Ok(Some(TransferItem::Record(record)))
    }
}

fn read_records(path: &Path) -> io::Result<VecDeque<TypedRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e),
    };
    let mut records = VecDeque::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}:{}: {e}", path.display(), n + 1),
            )
        })?;
        records.push_back(record);
    }
    Ok(records)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let kind = entry.file_type()?;
        if kind.is_dir() {
            collect_files(root, &path, out)?;
        } else if kind.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if rel == Path::new(RECORDS_FILE) {
                continue;
            }
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(FileEntry {
                size: entry.metadata()?.len(),
                path,
                name,
            });
        }
    }
    Ok(())
}

// ── Sink ──────────────────────────────────────────────────────────────────────

pub struct DirectorySink {
    root: PathBuf,
    records: BufWriter<File>,
    /// `message_id` → file name, from `message` records seen so far.
    names: HashMap<Uuid, String>,
}

impl DirectorySink {
    pub fn create(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root.join(ATTACHMENTS_DIR))?;
        fs::create_dir_all(root.join(FILES_DIR))?;
        let records = BufWriter::new(File::create(root.join(RECORDS_FILE))?);
        Ok(Self {
            root: root.to_path_buf(),
            records,
            names: HashMap::new(),
        })
    }

    fn part_path(&self, id: Uuid) -> PathBuf {
        self.root.join(ATTACHMENTS_DIR).join(format!("{id}.part"))
    }

    /// Where a verified attachment ends up. Names that would escape the
    /// output directory fall back to `attachments/<id>`.
    fn final_path(&self, id: Uuid) -> PathBuf {
        self.names
            .get(&id)
            .and_then(|name| safe_relative(name))
            .map(|rel| self.root.join(FILES_DIR).join(rel))
            .unwrap_or_else(|| self.root.join(ATTACHMENTS_DIR).join(id.to_string()))
    }
}

impl TransferSink for DirectorySink {
    fn import_record(&mut self, record: TypedRecord) -> io::Result<()> {
        if record.record_type == RecordType::Message {
            let id = record.data.get("message_id").and_then(|v| v.as_str());
            let name = record.data.get("name").and_then(|v| v.as_str());
            if let (Some(id), Some(name)) = (id.and_then(|s| s.parse().ok()), name) {
                self.names.insert(id, name.to_string());
            }
        }
        serde_json::to_writer(&mut self.records, &record)?;
        self.records.write_all(b"\n")
    }

    fn create_attachment(&mut self, id: Uuid, length: u64) -> io::Result<Box<dyn Write + Send>> {
        let path = self.part_path(id);
        tracing::debug!(id = %id, length, path = %path.display(), "receiving attachment");
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn commit_attachment(&mut self, id: Uuid, digest: &ContentDigest) -> io::Result<()> {
        let dest = self.final_path(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.part_path(id), &dest)?;
        tracing::info!(id = %id, digest = %digest, path = %dest.display(), "attachment restored");
        Ok(())
    }

    fn discard_attachment(&mut self, id: Uuid) {
        if let Err(e) = fs::remove_file(self.part_path(id)) {
            tracing::warn!(id = %id, error = %e, "failed to remove partial attachment");
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.records.flush()
    }
}

fn safe_relative(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => out.push(part),
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
