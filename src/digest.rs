//! Structural content digests: a stable 20-byte fingerprint for arbitrary,
//! possibly cyclic value graphs.
//!
//! Two structurally equal values (including cycle topology) produce the same
//! digest.  Cyclic graphs are expressed through an arena of nodes addressed
//! by integer id; traversal uses an explicit work stack plus a stack of open
//! frames, tracking the minimum open level reachable from each frame the way
//! Tarjan's SCC algorithm tracks low-links.  A whole strongly connected
//! component closes and hashes atomically, so isomorphic cyclic shapes
//! always digest identically.

use crate::value::Value;
use rustc_hash::FxHashMap;
use std::fmt;

pub const DIGEST_LEN: usize = 20;

/// A fixed-length opaque content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub const ZERO: Digest = Digest([0; DIGEST_LEN]);

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_LEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A blake3 hasher that yields successive 20-byte digests: each digest
/// covers everything fed since construction, so later digests are chained
/// onto earlier ones.
pub(crate) struct Chain(blake3::Hasher);

impl Chain {
    pub fn new() -> Chain {
        Chain(blake3::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Chain {
        self.0.update(bytes);
        self
    }

    pub fn digest(&self) -> Digest {
        let mut out = [0; DIGEST_LEN];
        self.0.finalize_xof().fill(&mut out);
        Digest(out)
    }
}

pub(crate) fn hash_bytes(parts: &[&[u8]]) -> Digest {
    let mut c = Chain::new();
    for p in parts {
        c.update(p);
    }
    c.digest()
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// The value kind was explicitly marked unrepresentable.
    #[error("cannot digest opaque value of kind {0:?}")]
    Indigestible(String),

    /// Map keys and set elements must be scalar leaves so they can be
    /// sorted into a canonical order.
    #[error("map key or set element is not a scalar value")]
    UnorderableKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of a digestable value graph.
#[derive(Debug, Clone)]
pub enum Node {
    /// A plain (acyclic) value, encoded as a unit.
    Leaf(Value),
    List(Vec<NodeId>),
    /// Entries are sorted by scalar key order before hashing, so digests
    /// never depend on entry order.  Keys must be scalar leaves.
    Map(Vec<(NodeId, NodeId)>),
    /// Elements are sorted before hashing; must be scalar leaves.
    Set(Vec<NodeId>),
    /// A long-lived value digested by an explicit name annotation instead
    /// of structural content (compiled rules, foreign objects with stable
    /// identity).
    Named(String),
    /// Explicitly indigestible; digesting it reports the kind name.
    Opaque(String),
}

/// Arena of digestable nodes.  Cycles are expressed only through node ids,
/// never through language-level back references.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Replace a node, typically a placeholder added to close a cycle.
    pub fn set(&mut self, id: NodeId, node: Node) {
        self.nodes[id.index()] = node;
    }

    pub fn leaf(&mut self, v: Value) -> NodeId {
        self.add(Node::Leaf(v))
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

/// Memoized encoding of a closed, non-cyclic subgraph: either a span of the
/// run's shared buffer (short encodings) or the 21-byte `H`+digest form the
/// span was replaced with.
enum Memo {
    Span(usize, usize),
    Repl([u8; DIGEST_LEN + 1]),
}

/// Threshold above which a closed encoding is replaced by its hash.
const MEMO_INLINE_MAX: usize = 256;

/// Defensive cap on traversal steps; exceeding it means a runaway or
/// malformed structure and is an unconditional internal fault.
const MAX_STEPS: usize = 1 << 26;

struct Frame {
    node: NodeId,
    buf_ix: usize,
    memo_ix: usize,
    /// Minimum open level reachable from this frame (Tarjan low-link);
    /// starts one past our own level, i.e. "no back edge seen".
    cycle_lev: usize,
    /// Accumulated strongly-connected-component members, once a back edge
    /// lands on this frame.
    scc: Option<Vec<NodeId>>,
    /// Work stack length at which all of this frame's children are done.
    close_at: usize,
}

/// A batch of digest computations sharing one memo table and encode buffer,
/// so repeated references to common substructure reuse the cached encoding.
/// Digests produced by one run are chained: each covers all values digested
/// so far.
pub struct DigestRun<'g> {
    graph: &'g Graph,
    chain: Chain,
    buf: Vec<u8>,
    memo: FxHashMap<NodeId, Memo>,
}

impl<'g> DigestRun<'g> {
    pub fn new(graph: &'g Graph) -> DigestRun<'g> {
        DigestRun {
            graph,
            chain: Chain::new(),
            buf: Vec::new(),
            memo: FxHashMap::default(),
        }
    }

    pub fn digest(&mut self, root: NodeId) -> Result<Digest, DigestError> {
        let origin = self.buf.len();
        ingest(self.graph, &mut self.buf, &mut self.memo, root)?;
        self.chain.update(&self.buf[origin..]);
        Ok(self.chain.digest())
    }
}

/// Digest several roots as one unit, with a fresh memo table.
pub fn digest_of(graph: &Graph, roots: &[NodeId]) -> Result<Digest, DigestError> {
    let mut buf = Vec::new();
    let mut memo = FxHashMap::default();
    for &root in roots {
        ingest(graph, &mut buf, &mut memo, root)?;
    }
    Ok(hash_bytes(&[&buf]))
}

impl Value {
    /// Digest of a plain value.  Plain values are acyclic and contain no
    /// opaque kinds, so this cannot fail.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        hash_bytes(&[&buf])
    }
}

/// Digest several plain values as one unit.
pub fn digest_values(vals: &[&Value]) -> Digest {
    let mut buf = Vec::new();
    for v in vals {
        v.encode_into(&mut buf);
    }
    hash_bytes(&[&buf])
}

fn named_encoding(name: &str) -> [u8; DIGEST_LEN + 1] {
    let d = hash_bytes(&[b"named(", name.as_bytes(), b")"]);
    let mut out = [0; DIGEST_LEN + 1];
    out[0] = b'H';
    out[1..].copy_from_slice(&d.0);
    out
}

/// Append the canonical encoding of `root` to `buf`.  This is the core
/// traversal: depth-first with an explicit work stack, open-frame tracking
/// for cycles, and memoization of closed subencodings.
fn ingest(
    graph: &Graph,
    buf: &mut Vec<u8>,
    memo: &mut FxHashMap<NodeId, Memo>,
    root: NodeId,
) -> Result<(), DigestError> {
    let mut work: Vec<NodeId> = vec![root];
    let mut frames: Vec<Frame> = Vec::new();
    let mut open: FxHashMap<NodeId, usize> = FxHashMap::default();
    // Ids opened since the run began, in order; an entry is cleared when its
    // frame closed as part of a cycle and was not memoized.
    let mut memo_log: Vec<Option<NodeId>> = Vec::new();
    let mut steps = 0usize;

    while let Some(id) = work.pop() {
        steps += 1;
        if steps > MAX_STEPS {
            panic!("digest traversal exceeded {} steps: runaway structure", MAX_STEPS);
        }

        if let Some(&open_lev) = open.get(&id) {
            // Back edge into an active component: fold every component
            // between here and the target into one, then emit a structural
            // reference (depth delta, position within the component).
            let mut scc = frames[open_lev]
                .scc
                .take()
                .unwrap_or_else(|| vec![frames[open_lev].node]);
            for lev in (open_lev + 1..frames.len()).rev() {
                let lev_id = frames[lev].node;
                if open[&lev_id] == lev {
                    let scc1 = frames[lev].scc.take().unwrap_or_else(|| vec![lev_id]);
                    for &x in &scc1 {
                        open.insert(x, open_lev);
                    }
                    scc.extend(scc1);
                }
            }
            let pos = scc.iter().position(|&x| x == id).unwrap();
            buf.extend_from_slice(
                format!("scc({:x},{:x})", frames.len() - open_lev, pos).as_bytes(),
            );
            frames[open_lev].scc = Some(scc);

            let top = frames.last_mut().unwrap();
            if open_lev < top.cycle_lev {
                top.cycle_lev = open_lev;
            }
        } else if let Some(m) = memo.get(&id) {
            match m {
                Memo::Span(begin, end) => {
                    let (begin, end) = (*begin, *end);
                    buf.extend_from_within(begin..end);
                }
                Memo::Repl(bytes) => buf.extend_from_slice(bytes),
            }
        } else {
            match graph.node(id) {
                // Leaves and named nodes have no children; encode in place.
                Node::Leaf(v) => v.encode_into(buf),
                Node::Named(name) => buf.extend_from_slice(&named_encoding(name)),
                Node::Opaque(kind) => return Err(DigestError::Indigestible(kind.clone())),
                composite => {
                    let lev = frames.len();
                    open.insert(id, lev);
                    frames.push(Frame {
                        node: id,
                        buf_ix: buf.len(),
                        memo_ix: memo_log.len(),
                        cycle_lev: lev + 1,
                        scc: None,
                        close_at: work.len(),
                    });
                    memo_log.push(Some(id));
                    match composite {
                        Node::List(items) => {
                            if items.is_empty() {
                                buf.push(b'L');
                            } else {
                                buf.extend_from_slice(
                                    format!("l({:x})", items.len()).as_bytes(),
                                );
                                work.extend(items.iter().rev());
                            }
                        }
                        Node::Map(entries) => {
                            let mut sorted: Vec<&(NodeId, NodeId)> = entries.iter().collect();
                            sort_by_scalar(graph, &mut sorted, |e| e.0)?;
                            buf.extend_from_slice(format!("d({:x})", sorted.len()).as_bytes());
                            for &&(k, v) in sorted.iter().rev() {
                                work.push(v);
                                work.push(k);
                            }
                        }
                        Node::Set(elems) => {
                            let mut sorted: Vec<&NodeId> = elems.iter().collect();
                            sort_by_scalar(graph, &mut sorted, |&e| e)?;
                            buf.extend_from_slice(
                                format!("set({:x})", sorted.len()).as_bytes(),
                            );
                            for &&e in sorted.iter().rev() {
                                work.push(e);
                            }
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }

        // Close every frame whose children are all consumed.
        while let Some(top) = frames.last() {
            if work.len() != top.close_at {
                break;
            }
            let f = frames.pop().unwrap();
            let lev = frames.len();

            let scc = match f.scc {
                Some(scc) => scc,
                None if open[&f.node] == lev => vec![f.node],
                None => Vec::new(), // member of a component headed below us
            };
            for x in &scc {
                open.remove(x);
            }

            if lev <= f.cycle_lev {
                // Closed cleanly, together with any component it headed:
                // memoize the finished encoding.
                if buf.len() - f.buf_ix < MEMO_INLINE_MAX {
                    memo.insert(f.node, Memo::Span(f.buf_ix, buf.len()));
                } else {
                    let d = hash_bytes(&[&buf[f.buf_ix..]]);
                    let mut repl = [0; DIGEST_LEN + 1];
                    repl[0] = b'H';
                    repl[1..].copy_from_slice(&d.0);
                    memo.insert(f.node, Memo::Repl(repl));
                    buf.truncate(f.buf_ix);
                    buf.extend_from_slice(&repl);
                    // Spans memoized inside the replaced region no longer
                    // point at live bytes; forget them.
                    for entry in memo_log.drain(f.memo_ix + 1..) {
                        if let Some(x) = entry {
                            memo.remove(&x);
                        }
                    }
                    memo_log.pop();
                }
            } else {
                // Still inside an open component; no memoization, and the
                // parent inherits our low-link.
                memo_log[f.memo_ix] = None;
                if let Some(parent) = frames.last_mut() {
                    if parent.cycle_lev > f.cycle_lev {
                        parent.cycle_lev = f.cycle_lev;
                    }
                }
            }
        }
    }

    debug_assert!(frames.is_empty() && open.is_empty());
    Ok(())
}

fn sort_by_scalar<T>(
    graph: &Graph,
    items: &mut Vec<&T>,
    key: impl Fn(&T) -> NodeId,
) -> Result<(), DigestError> {
    for item in items.iter() {
        match graph.node(key(item)) {
            Node::Leaf(v) if v.is_scalar() => {}
            _ => return Err(DigestError::UnorderableKey),
        }
    }
    items.sort_by(|a, b| {
        let (ka, kb) = (graph.node(key(a)), graph.node(key(b)));
        match (ka, kb) {
            (Node::Leaf(a), Node::Leaf(b)) => a.cmp_scalar(b),
            _ => unreachable!(),
        }
    });
    Ok(())
}
