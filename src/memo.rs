//! The memoization engine: a persistent trie of past invocations, replayed
//! instead of re-executed whenever every recorded dependency still digests
//! identically.
//!
//! Two layers of wrapping exist.  A *traced* function is cheap and re-runs
//! in every process, but its dependencies are recorded so its invocations
//! become replayable trie edges.  A *memoized* function is the expensive
//! kind: its executions are stored durably, keyed by the chain of traced
//! dependency calls observed during the last real execution.
//!
//! The trie and its side tables are guarded by one critical section held
//! across every replay and commit step but released around each await.
//! The trie-extending effect listener runs synchronously inside an emit on
//! the single task thread, so it mutates the frontier without re-acquiring
//! the lock.

use crate::artifact::ArtStore;
use crate::db::{self, CallRec, LogRec, NodeRec, Record, Snapshot, TracerRec};
use crate::digest::{digest_values, Chain, Digest};
use crate::flow::{
    effect, Condition, CriticalSection, Effect, Future, Promise, Runtime, Shadow, Step,
};
use crate::pool;
use crate::process;
use crate::trace::Trace;
use crate::value::{Outcome, TaskError, Value, ValueSet};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

/// A dependency observation broadcast on the trace shadow.  `key` is the
/// dedup key; `cname`/`cfull` fingerprint what the call computed, while
/// `ename`/`efull` carry the non-replayable environment contribution that
/// must propagate into enclosing traced summaries.
#[derive(Debug, Clone)]
pub(crate) struct TraceRec {
    pub call: CallRec,
    pub key: Digest,
    pub cname: Digest,
    pub cfull: Digest,
    pub ename: Digest,
    pub efull: Digest,
}

/// What a tracer delivers: the outcome plus the four digest columns.
#[derive(Debug, Clone)]
pub(crate) struct TraceReply {
    pub outcome: Outcome<ValueSet>,
    pub cname: Digest,
    pub cfull: Digest,
    pub ename: Digest,
    pub efull: Digest,
}

/// The (name, full) digest pair of a trie edge, chained so that `full`
/// commits to everything `name` does and more.
pub(crate) fn tree_digests(
    cname: Digest,
    cfull: Digest,
    ename: Digest,
    efull: Digest,
) -> (Digest, Digest) {
    let mut c = Chain::new();
    c.update(&cname.0).update(&ename.0);
    let name = c.digest();
    c.update(&cfull.0).update(&efull.0);
    let full = c.digest();
    (name, full)
}

/// Identity digest of one invocation: who is being called and with what.
fn identity_digest(name: &str, meat: Digest, args: &ValueSet) -> Digest {
    digest_values(&[
        &Value::str(name),
        &Value::Bytes(meat.0.to_vec()),
        &Value::List(args.pos.clone()),
        &Value::Map(args.named.clone()),
    ])
}

/// Fold the deduplicated (ename, efull) pairs of captured records into one
/// combined environment digest pair.
fn combine_env(elog: &BTreeSet<(Digest, Digest)>) -> (Digest, Digest) {
    match elog.len() {
        0 => (Digest::ZERO, Digest::ZERO),
        1 => *elog.iter().next().unwrap(),
        n => {
            let mut c = Chain::new();
            c.update(format!("{:x}.", n).as_bytes());
            for (ename, _) in elog {
                c.update(&ename.0);
            }
            let ename = c.digest();
            for (_, efull) in elog {
                c.update(&efull.0);
            }
            (ename, c.digest())
        }
    }
}

type Level = Rc<RefCell<FxHashMap<Digest, TrieNode>>>;

fn new_level() -> Level {
    Rc::new(RefCell::new(FxHashMap::default()))
}

enum TrieNode {
    Branch {
        full: Digest,
        call: CallRec,
        children: Level,
    },
    Pending {
        full: Digest,
        changed: Promise<()>,
    },
    Success {
        full: Digest,
        values: ValueSet,
        arts: Vec<u64>,
    },
    Failed {
        full: Digest,
        error: TaskError,
    },
}

impl TrieNode {
    fn full(&self) -> Digest {
        match self {
            TrieNode::Branch { full, .. }
            | TrieNode::Pending { full, .. }
            | TrieNode::Success { full, .. }
            | TrieNode::Failed { full, .. } => *full,
        }
    }
}

/// Drop one reference from every artifact named in a subtree being pruned.
fn prune_arts(arts: &ArtStore, node: &TrieNode) {
    match node {
        TrieNode::Branch { children, .. } => {
            for (_, child) in children.borrow().iter() {
                prune_arts(arts, child);
            }
        }
        TrieNode::Pending { .. } => {
            panic!("same trace and instance generated different full digests")
        }
        TrieNode::Success { arts: ids, .. } => {
            for id in ids {
                arts.decref(*id);
            }
        }
        TrieNode::Failed { .. } => {}
    }
}

/// A cheap re-runnable function whose invocations become trie edges.
#[derive(Clone)]
pub struct TracedFn(Rc<TracedInner>);

struct TracedInner {
    name: String,
    meat: Digest,
    body: Box<dyn Fn(&Engine, ValueSet) -> Future<Value>>,
    /// Per-process memo keyed by identity digest.
    memo: RefCell<FxHashMap<Digest, Future<TraceReply>>>,
}

/// An expensive function whose executions are stored durably.
#[derive(Clone)]
pub struct MemoFn(Rc<MemoInner>);

struct MemoInner {
    name: String,
    meat: Digest,
    body: Box<dyn Fn(&Engine, ValueSet) -> Future<ValueSet>>,
}

pub struct EngineOptions {
    /// Root for the `.retrace` state directory.  Defaults to `RETRACE_SITE`,
    /// else the current directory.
    pub site: Option<PathBuf>,
    /// Background pool size.  Defaults to the environment-resolved limit.
    pub threads: Option<usize>,
    /// Where to write a chrome-trace performance log, if anywhere.
    pub trace_path: Option<PathBuf>,
    /// Invoked for every rule-file import replayed from the db at startup.
    pub on_import: Option<Box<dyn Fn(&str)>>,
    /// Keep temp files at shutdown.  Defaults to `RETRACE_DEBUG`.
    pub keep_temps: Option<bool>,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            site: None,
            threads: None,
            trace_path: None,
            on_import: None,
            keep_temps: None,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) rt: Runtime,
    db_path: PathBuf,
    writer: RefCell<db::Writer>,
    tree: Level,
    /// path -> (mtime, name digest, full digest)
    pub(crate) files: RefCell<FxHashMap<String, (crate::fs::MTime, Digest, Digest)>>,
    pub(crate) arts: ArtStore,
    pending_n: Rc<Cell<usize>>,
    lock: CriticalSection,
    quiesced: Condition,
    failed_logs: RefCell<Vec<Vec<Digest>>>,
    imports: RefCell<Vec<String>>,
    imports_seen: RefCell<FxHashSet<String>>,
    user_traces: RefCell<FxHashMap<String, FxHashMap<Digest, TracedFn>>>,
    pub(crate) env_memo: RefCell<FxHashMap<Digest, (Value, Digest)>>,
    pub(crate) trace_shadow: Shadow,
    pub(crate) arts_shadow: Shadow,
    pub(crate) perf: Option<Trace>,
}

/// The engine context: all state that the original design kept in process
/// globals, owned explicitly and passed around by handle.
#[derive(Clone)]
pub struct Engine(pub(crate) Rc<EngineInner>);

impl Engine {
    pub fn create(opts: EngineOptions) -> anyhow::Result<Engine> {
        let site = match opts.site {
            Some(p) => p,
            None => match std::env::var("RETRACE_SITE") {
                Ok(s) if !s.is_empty() => PathBuf::from(s),
                _ => std::env::current_dir()?,
            },
        };
        let root = site.join(".retrace");
        std::fs::create_dir_all(&root)?;
        let db_path = root.join("db");

        let keep_temps = opts
            .keep_temps
            .unwrap_or_else(|| std::env::var_os("RETRACE_DEBUG").is_some());
        let arts = ArtStore::new(&root, keep_temps)?;

        let limit = opts.threads.unwrap_or_else(pool::concurrency_limit);
        let rt = Runtime::with_limit(limit);

        let loaded = match db::load(&db_path) {
            Ok(l) => l,
            Err(err) => {
                eprintln!("retrace: discarding unreadable db: {}", err);
                None
            }
        };
        let writer = match &loaded {
            Some(l) => db::Writer::append_to(&db_path, l)?,
            None => db::Writer::create(&db_path, &Snapshot::default())?,
        };

        let pending_n = Rc::new(Cell::new(0usize));
        let lock = CriticalSection::new();
        let p2 = pending_n.clone();
        let quiesced = lock.condition(move || p2.get() == 0);

        let perf = match &opts.trace_path {
            Some(p) => Some(Trace::open(p)?),
            None => None,
        };

        let engine = Engine(Rc::new(EngineInner {
            rt: rt.clone(),
            db_path,
            writer: RefCell::new(writer),
            tree: new_level(),
            files: RefCell::new(FxHashMap::default()),
            arts,
            pending_n,
            lock,
            quiesced,
            failed_logs: RefCell::new(Vec::new()),
            imports: RefCell::new(Vec::new()),
            imports_seen: RefCell::new(FxHashSet::default()),
            user_traces: RefCell::new(FxHashMap::default()),
            env_memo: RefCell::new(FxHashMap::default()),
            trace_shadow: Shadow::keyed("trace", |v| {
                v.downcast_ref::<TraceRec>().unwrap().key.0.to_vec()
            }),
            arts_shadow: Shadow::keyed("arts", |v| {
                v.downcast_ref::<u64>().unwrap().to_le_bytes().to_vec()
            }),
            perf,
        }));

        if let Some(loaded) = loaded {
            engine.restore(loaded, opts.on_import.as_deref());
        }

        // Compaction runs as a shutdown hook; Weak keeps the hook from
        // cycling the runtime back to the engine.
        let weak: Weak<EngineInner> = Rc::downgrade(&engine.0);
        rt.at_shutdown(move |_rt| match weak.upgrade() {
            Some(inner) => Engine(inner).save(),
            None => Future::ready(false),
        });

        Ok(engine)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.0.rt
    }

    pub fn wait<T: 'static>(&self, fut: &Future<T>) -> Rc<Outcome<T>> {
        self.0.rt.wait(fut)
    }

    /// Tear the engine down: cancel background work, compact, remove temps.
    pub fn shutdown(&self) {
        self.0.rt.shutdown();
        self.0.arts.cleanup_temps();
        if let Some(perf) = &self.0.perf {
            let _ = perf.close();
        }
    }

    pub(crate) fn append(&self, rec: &Record) {
        if let Err(err) = self.0.writer.borrow_mut().append(rec) {
            // The db can no longer be trusted to match memory.
            panic!("retrace: db append failed: {}", err);
        }
    }

    // -- loading ----------------------------------------------------------

    fn restore(&self, loaded: db::Loaded, on_import: Option<&dyn Fn(&str)>) {
        let snap = loaded.snapshot;
        for path in &snap.imports {
            self.0.imports.borrow_mut().push(path.clone());
            self.0.imports_seen.borrow_mut().insert(path.clone());
            if let Some(cb) = on_import {
                cb(path);
            }
        }
        {
            let mut tree = self.0.tree.borrow_mut();
            for (key, node) in snap.roots {
                tree.insert(key, restore_node(node));
            }
        }
        for (path, mtime, name, full) in snap.file_digests {
            self.0
                .files
                .borrow_mut()
                .insert(path, (crate::fs::MTime::Stamp(mtime), name, full));
        }
        self.0.arts.restore(&snap.artifacts, snap.next_art);

        for rec in loaded.records {
            match rec {
                Record::Branch {
                    root,
                    steps,
                    values,
                    arts,
                } => self.restore_branch(root, steps, values, arts),
                Record::Prune { names } => self.prune_path(&names),
                Record::FileDigest {
                    path,
                    mtime,
                    name,
                    full,
                } => {
                    self.0
                        .files
                        .borrow_mut()
                        .insert(path, (crate::fs::MTime::Stamp(mtime), name, full));
                }
                Record::Art { id, suffix } => self.0.arts.restore_alloc(id, &suffix),
                Record::Import { path } => {
                    if self.0.imports_seen.borrow_mut().insert(path.clone()) {
                        self.0.imports.borrow_mut().push(path.clone());
                        if let Some(cb) = on_import {
                            cb(&path);
                        }
                    }
                }
            }
        }
    }

    fn restore_branch(&self, root: Digest, steps: Vec<LogRec>, values: ValueSet, arts: Vec<u64>) {
        let mut tip = self.0.tree.clone();
        let mut name = root;
        let mut full = root;
        for step in steps {
            let next = {
                let mut level = tip.borrow_mut();
                match level.get(&name) {
                    Some(TrieNode::Branch {
                        full: f, children, ..
                    }) if *f == full => children.clone(),
                    _ => {
                        let children = new_level();
                        level.insert(
                            name,
                            TrieNode::Branch {
                                full,
                                call: step.call,
                                children: children.clone(),
                            },
                        );
                        children
                    }
                }
            };
            tip = next;
            name = step.name;
            full = step.full;
        }
        for id in &arts {
            self.0.arts.incref(*id);
        }
        tip.borrow_mut()
            .insert(name, TrieNode::Success { full, values, arts });
    }

    /// Remove the subtree at the end of `names`, dropping artifact
    /// references.  Deleting at the fan point drops the whole single-child
    /// chain leading to the doomed node, not just its last link.
    fn prune_path(&self, names: &[Digest]) {
        let mut tip = self.0.tree.clone();
        let mut fan_tip = tip.clone();
        let mut fan_name = names[0];
        for (i, name) in names.iter().enumerate() {
            if tip.borrow().len() > 1 {
                fan_tip = tip.clone();
                fan_name = *name;
            }
            if i + 1 == names.len() {
                break;
            }
            let next = match tip.borrow().get(name) {
                Some(TrieNode::Branch { children, .. }) => children.clone(),
                _ => return,
            };
            tip = next;
        }
        if let Some(node) = tip.borrow().get(names.last().unwrap()) {
            prune_arts(&self.0.arts, node);
        }
        fan_tip.borrow_mut().remove(&fan_name);
    }

    // -- registration -----------------------------------------------------

    /// Register a traced function.  `meat` is a version marker digested
    /// into the function's identity; bump it when the body changes
    /// meaningfully.
    pub fn traced(
        &self,
        name: impl Into<String>,
        meat: &Value,
        body: impl Fn(&Engine, ValueSet) -> Future<Value> + 'static,
    ) -> TracedFn {
        let name = name.into();
        let tf = TracedFn(Rc::new(TracedInner {
            name: name.clone(),
            meat: meat.digest(),
            body: Box::new(body),
            memo: RefCell::new(FxHashMap::default()),
        }));
        self.0
            .user_traces
            .borrow_mut()
            .entry(name)
            .or_insert_with(FxHashMap::default)
            .insert(tf.0.meat, tf.clone());
        tf
    }

    pub fn memoized(
        &self,
        name: impl Into<String>,
        meat: &Value,
        body: impl Fn(&Engine, ValueSet) -> Future<ValueSet> + 'static,
    ) -> MemoFn {
        MemoFn(Rc::new(MemoInner {
            name: name.into(),
            meat: meat.digest(),
            body: Box::new(body),
        }))
    }

    // -- traced invocation ------------------------------------------------

    /// Call a traced function: returns its value and records the call as a
    /// dependency in the enclosing scope.
    pub fn call_traced(&self, tf: &TracedFn, args: ValueSet) -> Future<ValueSet> {
        let rt = self.0.rt.clone();
        tf.trace(self, args).then(&rt, |_, reply| match &reply.outcome {
            Ok(vs) => Step::Done(vs.clone()),
            Err(e) => Step::Fail(e.clone()),
        })
    }

    /// Call a memoized function: replays from the trie when every recorded
    /// dependency still digests identically, executes otherwise.
    pub fn call(&self, mf: &MemoFn, args: ValueSet) -> Future<ValueSet> {
        let eng = self.clone();
        let mf = mf.clone();
        self.0.rt.spawn(move |rt| {
            let root = identity_digest(&mf.0.name, mf.0.meat, &args);
            let st = WalkState {
                root,
                tip: eng.0.tree.clone(),
                name: root,
                full: root,
                steps: Vec::new(),
                do_prune: false,
            };
            let eng2 = eng.clone();
            Step::Fut(
                eng.0
                    .lock
                    .acquire(rt)
                    .then(rt, move |_, _| walk(eng2, mf, args, st)),
            )
        })
    }

    fn tracer_known(&self, call: &CallRec) -> bool {
        match &call.tracer {
            TracerRec::Path | TracerRec::Fact | TracerRec::Env => true,
            TracerRec::User { name, meat } => {
                let traces = self.0.user_traces.borrow();
                match traces.get(name) {
                    Some(by_meat) => by_meat.len() == 1 || by_meat.contains_key(meat),
                    None => false,
                }
            }
        }
    }

    fn invoke_tracer(&self, call: &CallRec) -> Future<TraceReply> {
        match &call.tracer {
            TracerRec::Path => {
                let path = match &call.arg1 {
                    Value::Str(s) => s.clone(),
                    other => panic!("malformed path dependency record {:?}", other),
                };
                self.trace_path(path)
            }
            TracerRec::Fact => {
                let facts = match &call.arg1 {
                    Value::Map(m) => m.clone(),
                    other => panic!("malformed fact dependency record {:?}", other),
                };
                self.trace_fact(facts)
            }
            TracerRec::Env => {
                let name = match &call.arg1 {
                    Value::Str(s) => s.clone(),
                    other => panic!("malformed env dependency record {:?}", other),
                };
                self.trace_env(name, call.arg2.clone())
            }
            TracerRec::User { name, meat } => {
                let tf = {
                    let traces = self.0.user_traces.borrow();
                    let by_meat = &traces[name];
                    if by_meat.len() == 1 {
                        by_meat.values().next().unwrap().clone()
                    } else {
                        by_meat[meat].clone()
                    }
                };
                let args = call_args(call);
                tf.trace(self, args)
            }
        }
    }

    // -- compaction -------------------------------------------------------

    /// Wait for quiescence, then compact the db if the appended tail has
    /// outgrown a third of the snapshot.  Returns false: compaction never
    /// leaves pending work behind.
    pub fn save(&self) -> Future<bool> {
        let eng = self.clone();
        let rt = self.0.rt.clone();
        self.0
            .lock
            .acquire_when(&rt, &self.0.quiesced)
            .then(&rt, move |rt, _| {
                let (tail, head) = eng.0.writer.borrow().growth();
                if (head as f64) * 0.33 < tail as f64 {
                    eng.prune_failed();
                    let snap = eng.snapshot();
                    match db::Writer::create(&eng.0.db_path, &snap) {
                        Ok(w) => *eng.0.writer.borrow_mut() = w,
                        Err(err) => eprintln!("retrace: compaction failed: {}", err),
                    }
                }
                eng.0.lock.release(rt);
                Step::Done(false)
            })
    }

    fn prune_failed(&self) {
        let logs: Vec<Vec<Digest>> = self.0.failed_logs.borrow_mut().drain(..).collect();
        for names in logs {
            self.prune_failed_path(&names);
        }
    }

    fn prune_failed_path(&self, names: &[Digest]) {
        let mut tip = self.0.tree.clone();
        let mut fan_tip = tip.clone();
        let mut fan_name = names[0];
        for (i, name) in names.iter().enumerate() {
            if tip.borrow().len() > 1 {
                fan_tip = tip.clone();
                fan_name = *name;
            }
            let next = {
                let level = tip.borrow();
                match level.get(name) {
                    Some(TrieNode::Branch { children, .. }) => Some(children.clone()),
                    Some(TrieNode::Failed { .. }) if i + 1 == names.len() => None,
                    // The path was already displaced by a later execution.
                    _ => return,
                }
            };
            match next {
                Some(level) => tip = level,
                None => break,
            }
        }
        fan_tip.borrow_mut().remove(&fan_name);
    }

    fn snapshot(&self) -> Snapshot {
        let mut roots = Vec::new();
        for (key, node) in self.0.tree.borrow().iter() {
            if let Some(rec) = node_rec(node) {
                roots.push((*key, rec));
            }
        }
        roots.sort_by_key(|(k, _)| *k);

        let mut file_digests = Vec::new();
        for (path, (mtime, name, full)) in self.0.files.borrow().iter() {
            if let crate::fs::MTime::Stamp(stamp) = mtime {
                file_digests.push((path.clone(), *stamp, *name, *full));
            }
        }
        file_digests.sort();

        let (artifacts, next_art) = self.0.arts.snapshot();
        Snapshot {
            roots,
            file_digests,
            artifacts,
            next_art,
            imports: self.0.imports.borrow().clone(),
        }
    }

    /// Record a rule-file import so a later process can replay it through
    /// `EngineOptions::on_import` before any rule runs.
    pub fn note_import(&self, path: impl Into<String>) {
        let path = path.into();
        if self.0.imports_seen.borrow_mut().insert(path.clone()) {
            self.0.imports.borrow_mut().push(path.clone());
            self.append(&Record::Import { path });
        }
    }

    // -- conveniences over the other modules ------------------------------

    /// Run a subprocess on the background pool.
    pub fn run(&self, cmd: process::Command) -> Future<String> {
        process::run(&self.0.rt, cmd)
    }

    /// Allocate a durable artifact path.  The artifact is referenced by
    /// whichever memoized execution is in flight when this is called.
    pub fn mkpath(&self, suffix: &str) -> PathBuf {
        let (id, path) = self.0.arts.alloc(suffix);
        self.append(&Record::Art {
            id,
            suffix: suffix.to_string(),
        });
        self.0.arts_shadow.emit(&self.0.rt, Rc::new(id));
        path
    }

    pub fn mktemp(&self, suffix: &str) -> anyhow::Result<PathBuf> {
        self.0.arts.mktemp(suffix)
    }

    pub fn mkdtemp(&self) -> anyhow::Result<PathBuf> {
        self.0.arts.mkdtemp()
    }
}

fn call_args(call: &CallRec) -> ValueSet {
    let pos = match &call.arg1 {
        Value::List(v) => v.clone(),
        other => vec![other.clone()],
    };
    let named = match &call.arg2 {
        Value::Map(m) => m.clone(),
        _ => BTreeMap::new(),
    };
    ValueSet { pos, named }
}

fn node_rec(node: &TrieNode) -> Option<NodeRec> {
    match node {
        TrieNode::Branch {
            full,
            call,
            children,
        } => {
            let mut recs = Vec::new();
            for (name, child) in children.borrow().iter() {
                if let Some(rec) = node_rec(child) {
                    recs.push((*name, rec));
                }
            }
            recs.sort_by_key(|(name, _)| *name);
            Some(NodeRec::Branch {
                full: *full,
                call: call.clone(),
                children: recs,
            })
        }
        TrieNode::Success { full, values, arts } => Some(NodeRec::Success {
            full: *full,
            values: values.clone(),
            arts: arts.clone(),
        }),
        // In-flight and failed outcomes are process-local.
        TrieNode::Pending { .. } | TrieNode::Failed { .. } => None,
    }
}

fn restore_node(rec: NodeRec) -> TrieNode {
    match rec {
        NodeRec::Branch {
            full,
            call,
            children,
        } => {
            let level = new_level();
            {
                let mut map = level.borrow_mut();
                for (name, child) in children {
                    map.insert(name, restore_node(child));
                }
            }
            TrieNode::Branch {
                full,
                call,
                children: level,
            }
        }
        NodeRec::Success { full, values, arts } => TrieNode::Success { full, values, arts },
    }
}

impl TracedFn {
    /// Deliver the reply for `args`, computing it at most once per process,
    /// and re-broadcast the summary record to the enclosing scope on every
    /// delivery.
    pub(crate) fn trace(&self, eng: &Engine, args: ValueSet) -> Future<TraceReply> {
        let rt = eng.0.rt.clone();
        let key = identity_digest(&self.0.name, self.0.meat, &args);
        let cached = self.0.memo.borrow().get(&key).cloned();
        let reply_fut = match cached {
            Some(f) => f,
            None => {
                let f = self.compute(eng, args.clone());
                self.0.memo.borrow_mut().insert(key, f.clone());
                f
            }
        };

        let call = CallRec {
            tracer: TracerRec::User {
                name: self.0.name.clone(),
                meat: self.0.meat,
            },
            arg1: Value::List(args.pos),
            arg2: Value::Map(args.named),
        };
        let eng2 = eng.clone();
        reply_fut.then(&rt, move |rt, reply| {
            eng2.0.trace_shadow.emit(
                rt,
                Rc::new(TraceRec {
                    call,
                    key,
                    cname: reply.cname,
                    cfull: reply.cfull,
                    ename: reply.ename,
                    efull: reply.efull,
                }),
            );
            Step::Done(reply.clone())
        })
    }

    fn compute(&self, eng: &Engine, args: ValueSet) -> Future<TraceReply> {
        let rt = eng.0.rt.clone();
        let log: Rc<RefCell<BTreeSet<(Digest, Digest)>>> = Rc::new(RefCell::new(BTreeSet::new()));
        let l2 = log.clone();
        let collector: Rc<Effect> = effect(&eng.0.trace_shadow, move |_, v| {
            let rec = v.downcast_ref::<TraceRec>().unwrap();
            l2.borrow_mut().insert((rec.ename, rec.efull));
        });

        let eng2 = eng.clone();
        let body = self.0.clone();
        let body_fut = rt.capture_effects(vec![(collector, false)], move |_rt| {
            Step::Fut((body.body)(&eng2, args))
        });

        body_fut.then_outcome(&rt, move |_, o| {
            let (outcome, cname, cfull) = match o {
                Ok(value) => {
                    let (value_name, value_full) = match value {
                        Value::Named { value, name } => ((**name).clone(), (**value).clone()),
                        other => (other.clone(), other.clone()),
                    };
                    // Chained like a digest run: the full digest commits to
                    // the name encoding as well.
                    let mut c = Chain::new();
                    let mut buf = Vec::new();
                    value_name.encode_into(&mut buf);
                    c.update(&buf);
                    let cname = c.digest();
                    buf.clear();
                    value_full.encode_into(&mut buf);
                    c.update(&buf);
                    (Ok(ValueSet::of(value_full)), cname, c.digest())
                }
                Err(e) => {
                    let d = e.0.digest();
                    (Err(e.clone()), d, d)
                }
            };
            let (ename, efull) = combine_env(&log.borrow());
            Step::Done(TraceReply {
                outcome,
                cname,
                cfull,
                ename,
                efull,
            })
        })
    }
}

struct WalkState {
    root: Digest,
    tip: Level,
    name: Digest,
    full: Digest,
    steps: Vec<LogRec>,
    do_prune: bool,
}

/// One pass of the replay loop, entered holding the lock.  Synchronous trie
/// steps loop in place; anything that must await returns a future that
/// re-enters `walk` once the lock is re-acquired.
fn walk(eng: Engine, mf: MemoFn, args: ValueSet, mut st: WalkState) -> Step<ValueSet> {
    let rt = eng.0.rt.clone();

    enum Act {
        Execute,
        Await(Future<()>),
        Hit(ValueSet),
        HitFailure(TaskError),
        Descend { call: CallRec, children: Level },
    }

    let act = {
        let level = st.tip.borrow();
        match level.get(&st.name) {
            None => Act::Execute,
            Some(node) if node.full() != st.full => {
                if matches!(node, TrieNode::Pending { .. }) {
                    panic!("same trace and instance generated different full digests");
                }
                st.do_prune = true;
                Act::Execute
            }
            Some(TrieNode::Pending { changed, .. }) => Act::Await(changed.future()),
            Some(TrieNode::Success { values, .. }) => Act::Hit(values.clone()),
            Some(TrieNode::Failed { error, .. }) => Act::HitFailure(error.clone()),
            Some(TrieNode::Branch { call, children, .. }) => {
                if eng.tracer_known(call) {
                    Act::Descend {
                        call: call.clone(),
                        children: children.clone(),
                    }
                } else {
                    st.do_prune = true;
                    Act::Execute
                }
            }
        }
    };

    match act {
        Act::Execute => execute(eng, mf, args, st),
        Act::Hit(values) => {
            eng.0.lock.release(&rt);
            Step::Done(values)
        }
        Act::HitFailure(error) => {
            eng.0.lock.release(&rt);
            Step::Fail(error)
        }
        Act::Await(changed) => {
            eng.0.lock.release(&rt);
            let eng2 = eng.clone();
            Step::Fut(changed.then(&rt, move |rt, _| {
                let eng3 = eng2.clone();
                Step::Fut(
                    eng2.0
                        .lock
                        .acquire(rt)
                        .then(rt, move |_, _| walk(eng3, mf, args, st)),
                )
            }))
        }
        Act::Descend { call, children } => {
            eng.0.lock.release(&rt);
            let reply_fut = eng.invoke_tracer(&call);
            let eng2 = eng.clone();
            Step::Fut(reply_fut.then(&rt, move |rt, reply| {
                let (name, full) = tree_digests(reply.cname, reply.cfull, reply.ename, reply.efull);
                st.steps.push(LogRec { call, name, full });
                st.name = name;
                st.full = full;
                st.tip = children;
                let eng3 = eng2.clone();
                Step::Fut(
                    eng2.0
                        .lock
                        .acquire(rt)
                        .then(rt, move |_, _| walk(eng3, mf, args, st)),
                )
            }))
        }
    }
}

/// Cache miss: mark the frontier pending and run the body with the
/// trie-extending listener installed.  Entered holding the lock.
fn execute(eng: Engine, mf: MemoFn, args: ValueSet, st: WalkState) -> Step<ValueSet> {
    let rt = eng.0.rt.clone();
    let WalkState {
        root,
        tip,
        name,
        full,
        steps,
        do_prune,
    } = st;

    let stale = tip.borrow_mut().remove(&name);
    if do_prune {
        let mut names = vec![root];
        names.extend(steps.iter().map(|s| s.name));
        eng.append(&Record::Prune { names });
        if let Some(node) = &stale {
            prune_arts(&eng.0.arts, node);
        }
    }

    tip.borrow_mut().insert(
        name,
        TrieNode::Pending {
            full,
            changed: Promise::new(),
        },
    );
    eng.0.pending_n.set(eng.0.pending_n.get() + 1);
    eng.0.lock.release(&rt);

    // Frontier state shared with the listener: the level holding the
    // current pending node, and that node's (name, full).
    let frontier = Rc::new(RefCell::new((tip, name, full)));
    let steps = Rc::new(RefCell::new(steps));

    let inserter = {
        let frontier = frontier.clone();
        let steps = steps.clone();
        effect(&eng.0.trace_shadow, move |rt, v| {
            let rec = v.downcast_ref::<TraceRec>().unwrap();
            if matches!(rec.call.tracer, TracerRec::Fact) {
                panic!("depend_fact can only be called within a traced function");
            }
            let (name1, full1) = tree_digests(rec.cname, rec.cfull, rec.ename, rec.efull);
            steps.borrow_mut().push(LogRec {
                call: rec.call.clone(),
                name: name1,
                full: full1,
            });

            let (tip0, name0, full0) = frontier.borrow().clone();
            let tip1 = new_level();
            tip1.borrow_mut().insert(
                name1,
                TrieNode::Pending {
                    full: full1,
                    changed: Promise::new(),
                },
            );
            let old = tip0.borrow_mut().insert(
                name0,
                TrieNode::Branch {
                    full: full0,
                    call: rec.call.clone(),
                    children: tip1.clone(),
                },
            );
            match old {
                Some(TrieNode::Pending { changed, .. }) => changed.satisfy(rt, Ok(())),
                _ => panic!("memo frontier lost its pending node"),
            }
            *frontier.borrow_mut() = (tip1, name1, full1);
        })
    };

    let art_acc: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let arts_eff = {
        let acc = art_acc.clone();
        effect(&eng.0.arts_shadow, move |_, v| {
            acc.borrow_mut().push(*v.downcast_ref::<u64>().unwrap());
        })
    };

    let started = std::time::Instant::now();
    let body_fut = {
        let eng2 = eng.clone();
        let mf2 = mf.clone();
        rt.capture_effects(vec![(inserter, true), (arts_eff, false)], move |_rt| {
            Step::Fut((mf2.0.body)(&eng2, args))
        })
    };

    let eng2 = eng.clone();
    Step::Fut(body_fut.then_outcome(&rt, move |rt, o| {
        if let Some(perf) = &eng2.0.perf {
            perf.complete(&mf.0.name, started);
        }
        let o = o.clone();
        let eng3 = eng2.clone();
        Step::Fut(eng2.0.lock.acquire(rt).then(rt, move |rt, _| {
            finish(eng3, root, frontier, steps, art_acc, o)
        }))
    }))
}

/// Commit the outcome at the frontier.  Entered holding the lock.
fn finish(
    eng: Engine,
    root: Digest,
    frontier: Rc<RefCell<(Level, Digest, Digest)>>,
    steps: Rc<RefCell<Vec<LogRec>>>,
    art_acc: Rc<RefCell<Vec<u64>>>,
    o: Outcome<ValueSet>,
) -> Step<ValueSet> {
    let rt = eng.0.rt.clone();
    eng.0.pending_n.set(eng.0.pending_n.get() - 1);

    let (tip, name, full) = frontier.borrow().clone();
    let steps: Vec<LogRec> = std::mem::take(&mut *steps.borrow_mut());

    let node = match &o {
        Ok(values) => {
            let mut arts: Vec<u64> = std::mem::take(&mut *art_acc.borrow_mut());
            arts.sort_unstable();
            arts.dedup();
            for id in &arts {
                eng.0.arts.incref(*id);
            }
            eng.append(&Record::Branch {
                root,
                steps: steps.clone(),
                values: values.clone(),
                arts: arts.clone(),
            });
            TrieNode::Success {
                full,
                values: values.clone(),
                arts,
            }
        }
        Err(error) => {
            let mut names = vec![root];
            names.extend(steps.iter().map(|s| s.name));
            eng.0.failed_logs.borrow_mut().push(names);
            TrieNode::Failed {
                full,
                error: error.clone(),
            }
        }
    };

    let old = tip.borrow_mut().insert(name, node);
    eng.0.lock.release(&rt);
    match old {
        Some(TrieNode::Pending { changed, .. }) => changed.satisfy(&rt, Ok(())),
        _ => panic!("memo frontier lost its pending node"),
    }

    match o {
        Ok(values) => Step::Done(values),
        Err(error) => Step::Fail(error),
    }
}
