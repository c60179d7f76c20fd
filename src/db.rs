//! On-disk persistence for the memo engine: a snapshot of the trace trie
//! and its side tables, followed by appended records for everything learned
//! since the snapshot was written.
//!
//! The format is a hand-rolled little-endian binary codec.  There is no
//! versioned migration story: a file whose magic or structure does not
//! parse is discarded wholesale and the engine starts empty.  A truncated
//! record at the tail (crash mid-append) is dropped silently.

use crate::digest::{Digest, DIGEST_LEN};
use crate::value::{Value, ValueSet};
use anyhow::bail;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const MAGIC: &[u8] = b"retracedb1\n";

const TAG_BRANCH: u8 = 1;
const TAG_PRUNE: u8 = 2;
const TAG_FILE_DIGEST: u8 = 3;
const TAG_ART: u8 = 4;
const TAG_IMPORT: u8 = 5;

const NODE_BRANCH: u8 = 0;
const NODE_SUCCESS: u8 = 2;

const TRACER_PATH: u8 = 0;
const TRACER_FACT: u8 = 1;
const TRACER_ENV: u8 = 2;
const TRACER_USER: u8 = 3;

const VAL_UNIT: u8 = 0;
const VAL_BOOL: u8 = 1;
const VAL_INT: u8 = 2;
const VAL_FLOAT: u8 = 3;
const VAL_STR: u8 = 4;
const VAL_BYTES: u8 = 5;
const VAL_LIST: u8 = 6;
const VAL_MAP: u8 = 7;
const VAL_NAMED: u8 = 8;

/// Which tracer a branch re-runs during replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TracerRec {
    Path,
    Fact,
    Env,
    User { name: String, meat: Digest },
}

/// A dependency call as persisted: the tracer plus the two argument slots
/// it was invoked with.  Enough to re-run the tracer during replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRec {
    pub tracer: TracerRec,
    pub arg1: Value,
    pub arg2: Value,
}

/// One step of a recorded execution: the call that was made and the
/// name/full digest pair it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRec {
    pub call: CallRec,
    pub name: Digest,
    pub full: Digest,
}

/// A persisted trie node.  Children are keyed by name digest.  Pending and
/// failed nodes never reach disk.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRec {
    Branch {
        full: Digest,
        call: CallRec,
        children: Vec<(Digest, NodeRec)>,
    },
    Success {
        full: Digest,
        values: ValueSet,
        arts: Vec<u64>,
    },
}

/// An incremental record appended after the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A finished execution: the root identity digest, the chain of
    /// dependency steps walked, and the successful result.
    Branch {
        root: Digest,
        steps: Vec<LogRec>,
        values: ValueSet,
        arts: Vec<u64>,
    },
    /// Remove the subtree at the end of this name-digest path.
    Prune { names: Vec<Digest> },
    /// Mtime-keyed digests of a dependency file.
    FileDigest {
        path: String,
        mtime: i64,
        name: Digest,
        full: Digest,
    },
    /// An artifact id was allocated with this suffix.
    Art { id: u64, suffix: String },
    /// A rule file was imported by the embedder.
    Import { path: String },
}

/// Everything the engine persists besides the incremental tail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Root trie level, keyed by identity digest.
    pub roots: Vec<(Digest, NodeRec)>,
    /// (path, mtime, name digest, full digest)
    pub file_digests: Vec<(String, i64, Digest, Digest)>,
    /// (id, suffix, refcount)
    pub artifacts: Vec<(u64, String, u32)>,
    pub next_art: u64,
    pub imports: Vec<String>,
}

// Encoding: records and snapshots are built in a Vec first so the writer
// can track the file length without re-statting.

fn put_u32(buf: &mut Vec<u8>, n: u32) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, n: i64) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_digest(buf: &mut Vec<u8>, d: &Digest) {
    buf.extend_from_slice(&d.0);
}

fn put_value(buf: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Unit => buf.push(VAL_UNIT),
        Value::Bool(b) => {
            buf.push(VAL_BOOL);
            buf.push(*b as u8);
        }
        Value::Int(n) => {
            buf.push(VAL_INT);
            put_i64(buf, *n);
        }
        Value::Float(f) => {
            buf.push(VAL_FLOAT);
            put_u64(buf, f.to_bits());
        }
        Value::Str(s) => {
            buf.push(VAL_STR);
            put_str(buf, s);
        }
        Value::Bytes(b) => {
            buf.push(VAL_BYTES);
            put_u32(buf, b.len() as u32);
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.push(VAL_LIST);
            put_u32(buf, items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        Value::Map(entries) => {
            buf.push(VAL_MAP);
            put_u32(buf, entries.len() as u32);
            for (k, v) in entries {
                put_str(buf, k);
                put_value(buf, v);
            }
        }
        Value::Named { value, name } => {
            buf.push(VAL_NAMED);
            put_value(buf, value);
            put_value(buf, name);
        }
    }
}

fn put_vset(buf: &mut Vec<u8>, vs: &ValueSet) {
    put_u32(buf, vs.pos.len() as u32);
    for v in &vs.pos {
        put_value(buf, v);
    }
    put_u32(buf, vs.named.len() as u32);
    for (k, v) in &vs.named {
        put_str(buf, k);
        put_value(buf, v);
    }
}

fn put_call(buf: &mut Vec<u8>, call: &CallRec) {
    match &call.tracer {
        TracerRec::Path => buf.push(TRACER_PATH),
        TracerRec::Fact => buf.push(TRACER_FACT),
        TracerRec::Env => buf.push(TRACER_ENV),
        TracerRec::User { name, meat } => {
            buf.push(TRACER_USER);
            put_str(buf, name);
            put_digest(buf, meat);
        }
    }
    put_value(buf, &call.arg1);
    put_value(buf, &call.arg2);
}

fn put_node(buf: &mut Vec<u8>, node: &NodeRec) {
    match node {
        NodeRec::Branch {
            full,
            call,
            children,
        } => {
            buf.push(NODE_BRANCH);
            put_digest(buf, full);
            put_call(buf, call);
            put_u32(buf, children.len() as u32);
            for (name, child) in children {
                put_digest(buf, name);
                put_node(buf, child);
            }
        }
        NodeRec::Success { full, values, arts } => {
            buf.push(NODE_SUCCESS);
            put_digest(buf, full);
            put_vset(buf, values);
            put_u32(buf, arts.len() as u32);
            for id in arts {
                put_u64(buf, *id);
            }
        }
    }
}

fn put_record(buf: &mut Vec<u8>, rec: &Record) {
    match rec {
        Record::Branch {
            root,
            steps,
            values,
            arts,
        } => {
            buf.push(TAG_BRANCH);
            put_digest(buf, root);
            put_u32(buf, steps.len() as u32);
            for step in steps {
                put_call(buf, &step.call);
                put_digest(buf, &step.name);
                put_digest(buf, &step.full);
            }
            put_vset(buf, values);
            put_u32(buf, arts.len() as u32);
            for id in arts {
                put_u64(buf, *id);
            }
        }
        Record::Prune { names } => {
            buf.push(TAG_PRUNE);
            put_u32(buf, names.len() as u32);
            for d in names {
                put_digest(buf, d);
            }
        }
        Record::FileDigest {
            path,
            mtime,
            name,
            full,
        } => {
            buf.push(TAG_FILE_DIGEST);
            put_str(buf, path);
            put_i64(buf, *mtime);
            put_digest(buf, name);
            put_digest(buf, full);
        }
        Record::Art { id, suffix } => {
            buf.push(TAG_ART);
            put_u64(buf, *id);
            put_str(buf, suffix);
        }
        Record::Import { path } => {
            buf.push(TAG_IMPORT);
            put_str(buf, path);
        }
    }
}

fn put_snapshot(buf: &mut Vec<u8>, snap: &Snapshot) {
    put_u32(buf, snap.roots.len() as u32);
    for (key, node) in &snap.roots {
        put_digest(buf, key);
        put_node(buf, node);
    }
    put_u32(buf, snap.file_digests.len() as u32);
    for (path, mtime, name, full) in &snap.file_digests {
        put_str(buf, path);
        put_i64(buf, *mtime);
        put_digest(buf, name);
        put_digest(buf, full);
    }
    put_u32(buf, snap.artifacts.len() as u32);
    for (id, suffix, refs) in &snap.artifacts {
        put_u64(buf, *id);
        put_str(buf, suffix);
        put_u32(buf, *refs);
    }
    put_u64(buf, snap.next_art);
    put_u32(buf, snap.imports.len() as u32);
    for path in &snap.imports {
        put_str(buf, path);
    }
}

struct Dec<R: Read> {
    r: R,
}

impl<R: Read> Dec<R> {
    fn u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.r.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.r.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.r.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn i64(&mut self) -> io::Result<i64> {
        let mut b = [0u8; 8];
        self.r.read_exact(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    fn bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn str(&mut self) -> io::Result<String> {
        let len = self.u32()? as usize;
        let buf = self.bytes(len)?;
        String::from_utf8(buf).map_err(|_| corrupt("non-utf8 string"))
    }

    fn digest(&mut self) -> io::Result<Digest> {
        let mut b = [0u8; DIGEST_LEN];
        self.r.read_exact(&mut b)?;
        Ok(Digest(b))
    }

    fn value(&mut self) -> io::Result<Value> {
        Ok(match self.u8()? {
            VAL_UNIT => Value::Unit,
            VAL_BOOL => Value::Bool(self.u8()? != 0),
            VAL_INT => Value::Int(self.i64()?),
            VAL_FLOAT => Value::Float(f64::from_bits(self.u64()?)),
            VAL_STR => Value::Str(self.str()?),
            VAL_BYTES => {
                let len = self.u32()? as usize;
                Value::Bytes(self.bytes(len)?)
            }
            VAL_LIST => {
                let n = self.u32()?;
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.value()?);
                }
                Value::List(items)
            }
            VAL_MAP => {
                let n = self.u32()?;
                let mut entries = BTreeMap::new();
                for _ in 0..n {
                    let k = self.str()?;
                    entries.insert(k, self.value()?);
                }
                Value::Map(entries)
            }
            VAL_NAMED => {
                let value = Box::new(self.value()?);
                let name = Box::new(self.value()?);
                Value::Named { value, name }
            }
            _ => return Err(corrupt("bad value tag")),
        })
    }

    fn vset(&mut self) -> io::Result<ValueSet> {
        let n = self.u32()?;
        let mut pos = Vec::with_capacity(n as usize);
        for _ in 0..n {
            pos.push(self.value()?);
        }
        let n = self.u32()?;
        let mut named = BTreeMap::new();
        for _ in 0..n {
            let k = self.str()?;
            named.insert(k, self.value()?);
        }
        Ok(ValueSet { pos, named })
    }

    fn call(&mut self) -> io::Result<CallRec> {
        let tracer = match self.u8()? {
            TRACER_PATH => TracerRec::Path,
            TRACER_FACT => TracerRec::Fact,
            TRACER_ENV => TracerRec::Env,
            TRACER_USER => TracerRec::User {
                name: self.str()?,
                meat: self.digest()?,
            },
            _ => return Err(corrupt("bad tracer tag")),
        };
        Ok(CallRec {
            tracer,
            arg1: self.value()?,
            arg2: self.value()?,
        })
    }

    fn node(&mut self) -> io::Result<NodeRec> {
        Ok(match self.u8()? {
            NODE_BRANCH => {
                let full = self.digest()?;
                let call = self.call()?;
                let n = self.u32()?;
                let mut children = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = self.digest()?;
                    children.push((name, self.node()?));
                }
                NodeRec::Branch {
                    full,
                    call,
                    children,
                }
            }
            NODE_SUCCESS => {
                let full = self.digest()?;
                let values = self.vset()?;
                let n = self.u32()?;
                let mut arts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    arts.push(self.u64()?);
                }
                NodeRec::Success { full, values, arts }
            }
            _ => return Err(corrupt("bad node tag")),
        })
    }

    fn record(&mut self, tag: u8) -> io::Result<Record> {
        Ok(match tag {
            TAG_BRANCH => {
                let root = self.digest()?;
                let n = self.u32()?;
                let mut steps = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let call = self.call()?;
                    let name = self.digest()?;
                    steps.push(LogRec {
                        call,
                        name,
                        full: self.digest()?,
                    });
                }
                let values = self.vset()?;
                let n = self.u32()?;
                let mut arts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    arts.push(self.u64()?);
                }
                Record::Branch {
                    root,
                    steps,
                    values,
                    arts,
                }
            }
            TAG_PRUNE => {
                let n = self.u32()?;
                let mut names = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    names.push(self.digest()?);
                }
                Record::Prune { names }
            }
            TAG_FILE_DIGEST => Record::FileDigest {
                path: self.str()?,
                mtime: self.i64()?,
                name: self.digest()?,
                full: self.digest()?,
            },
            TAG_ART => Record::Art {
                id: self.u64()?,
                suffix: self.str()?,
            },
            TAG_IMPORT => Record::Import { path: self.str()? },
            _ => return Err(corrupt("bad record tag")),
        })
    }

    fn snapshot(&mut self) -> io::Result<Snapshot> {
        let n = self.u32()?;
        let mut roots = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let key = self.digest()?;
            roots.push((key, self.node()?));
        }
        let n = self.u32()?;
        let mut file_digests = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let path = self.str()?;
            let mtime = self.i64()?;
            let name = self.digest()?;
            file_digests.push((path, mtime, name, self.digest()?));
        }
        let n = self.u32()?;
        let mut artifacts = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = self.u64()?;
            let suffix = self.str()?;
            artifacts.push((id, suffix, self.u32()?));
        }
        let next_art = self.u64()?;
        let n = self.u32()?;
        let mut imports = Vec::with_capacity(n as usize);
        for _ in 0..n {
            imports.push(self.str()?);
        }
        Ok(Snapshot {
            roots,
            file_digests,
            artifacts,
            next_art,
            imports,
        })
    }
}

fn corrupt(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// The parsed contents of a db file: the snapshot plus every whole record
/// appended after it.
pub struct Loaded {
    pub snapshot: Snapshot,
    pub records: Vec<Record>,
    /// Byte length of the snapshot section, including the magic.
    pub snapshot_len: u64,
    /// Total bytes consumed (excludes a truncated trailing record).
    pub len: u64,
}

/// Read a db file.  `Ok(None)` means no file; `Err` means the file exists
/// but cannot be trusted, in which case callers discard it and rebuild.
pub fn load(path: &Path) -> anyhow::Result<Option<Loaded>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut dec = Dec {
        r: Counting {
            r: BufReader::new(file),
            n: 0,
        },
    };

    let mut magic = [0u8; MAGIC.len()];
    dec.r.read_exact(&mut magic)?;
    if magic != MAGIC {
        bail!("bad magic");
    }
    let snapshot = dec.snapshot()?;
    let snapshot_len = dec.r.n;

    let mut records = Vec::new();
    let mut len = snapshot_len;
    loop {
        let tag = match dec.u8() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        match dec.record(tag) {
            Ok(rec) => {
                records.push(rec);
                len = dec.r.n;
            }
            // Crash mid-append: keep everything before the torn record.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Some(Loaded {
        snapshot,
        records,
        snapshot_len,
        len,
    }))
}

struct Counting<R: Read> {
    r: R,
    n: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.r.read(buf)?;
        self.n += n as u64;
        Ok(n)
    }
}

/// Appends records to an open db file, tracking its length so the engine
/// can decide when the tail has outgrown the snapshot.
pub struct Writer {
    file: File,
    snapshot_len: u64,
    len: u64,
}

impl Writer {
    /// Write a fresh file containing only `snapshot`, atomically replacing
    /// whatever was at `path`.
    pub fn create(path: &Path, snapshot: &Snapshot) -> anyhow::Result<Writer> {
        let tmp = path.with_extension("tmp");
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        put_snapshot(&mut buf, snapshot);
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        let len = buf.len() as u64;
        Ok(Writer {
            file,
            snapshot_len: len,
            len,
        })
    }

    /// Reopen an existing file for appending.  `loaded.len` may be shorter
    /// than the file when the tail held a torn record; the file is truncated
    /// back to the last whole record first.
    pub fn append_to(path: &Path, loaded: &Loaded) -> anyhow::Result<Writer> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(loaded.len)?;
        Ok(Writer {
            file,
            snapshot_len: loaded.snapshot_len,
            len: loaded.len,
        })
    }

    pub fn append(&mut self, rec: &Record) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        put_record(&mut buf, rec);
        use std::io::Seek;
        self.file.seek(io::SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Bytes appended since the snapshot, and the snapshot's own size.
    /// Compaction triggers on their ratio.
    pub fn growth(&self) -> (u64, u64) {
        (self.len - self.snapshot_len, self.snapshot_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest([n; DIGEST_LEN])
    }

    fn sample_call() -> CallRec {
        CallRec {
            tracer: TracerRec::Path,
            arg1: Value::str("/src/main.c"),
            arg2: Value::Unit,
        }
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            roots: vec![(
                digest(1),
                NodeRec::Branch {
                    full: digest(1),
                    call: sample_call(),
                    children: vec![(
                        digest(2),
                        NodeRec::Success {
                            full: digest(3),
                            values: ValueSet::of(Value::Int(42)),
                            arts: vec![7],
                        },
                    )],
                },
            )],
            file_digests: vec![("/src/main.c".to_string(), 12345, digest(4), digest(5))],
            artifacts: vec![(7, "main.o".to_string(), 1)],
            next_art: 8,
            imports: vec!["rules.conf".to_string()],
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let snap = sample_snapshot();
        Writer::create(&path, &snap).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.snapshot, snap);
        assert!(loaded.records.is_empty());
        assert_eq!(loaded.len, loaded.snapshot_len);
    }

    #[test]
    fn records_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut w = Writer::create(&path, &Snapshot::default()).unwrap();
        let recs = vec![
            Record::Art {
                id: 1,
                suffix: "out.txt".to_string(),
            },
            Record::FileDigest {
                path: "/input".to_string(),
                mtime: -5,
                name: digest(8),
                full: digest(9),
            },
            Record::Branch {
                root: digest(1),
                steps: vec![
                    LogRec {
                        call: sample_call(),
                        name: digest(2),
                        full: digest(3),
                    },
                    LogRec {
                        call: CallRec {
                            tracer: TracerRec::User {
                                name: "compile".to_string(),
                                meat: digest(6),
                            },
                            arg1: Value::list(vec![Value::str("x")]),
                            arg2: Value::map(vec![]),
                        },
                        name: digest(4),
                        full: digest(5),
                    },
                ],
                values: ValueSet::of(Value::str("ok")),
                arts: vec![1],
            },
            Record::Prune {
                names: vec![digest(1), digest(2)],
            },
            Record::Import {
                path: "rules.conf".to_string(),
            },
        ];
        for rec in &recs {
            w.append(rec).unwrap();
        }
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.records, recs);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut w = Writer::create(&path, &Snapshot::default()).unwrap();
        w.append(&Record::Import {
            path: "a".to_string(),
        })
        .unwrap();
        // Simulate a crash partway through the next append.
        let mut buf = Vec::new();
        put_record(
            &mut buf,
            &Record::Import {
                path: "bbbb".to_string(),
            },
        );
        use std::io::Seek;
        w.file.seek(io::SeekFrom::End(0)).unwrap();
        w.file.write_all(&buf[..buf.len() - 2]).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(
            loaded.records,
            vec![Record::Import {
                path: "a".to_string()
            }]
        );

        // Reopening for append truncates the torn bytes.
        let w = Writer::append_to(&path, &loaded).unwrap();
        assert_eq!(w.len, loaded.len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), loaded.len);
    }

    #[test]
    fn corrupt_magic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        std::fs::write(&path, b"not a database").unwrap();
        assert!(load(&path).is_err());
        assert!(load(&dir.path().join("absent")).unwrap().is_none());
    }
}
