//! Built-in dependency tracers: files, facts, and environment variables.
//!
//! Each tracer broadcasts a record on the trace shadow when invoked, and
//! can be re-invoked from a stored call record during replay to decide
//! whether the dependency still digests identically.
//!
//! Files are fingerprinted with an mtime-keyed content digest cache.
//! Facts are caller-asserted key/value observations that cannot be
//! re-derived, so they travel in the environment digest columns and
//! propagate up through traced summaries.  Environment variables are read
//! once per process and coerced by the shape of their default.

use crate::db::{CallRec, Record, TracerRec};
use crate::digest::{digest_values, Chain, Digest};
use crate::flow::{Future, Step};
use crate::fs::MTime;
use crate::memo::{Engine, TraceRec, TraceReply};
use crate::value::{TaskError, Value, ValueSet};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("cannot read ${name}={got:?} as {want}")]
    Coerce {
        name: String,
        got: String,
        want: &'static str,
    },
    #[error("${name} is {got}, not one of the allowed values")]
    NotAllowed { name: String, got: String },
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

/// (name, full) digests of one file: the name commits to the path, the
/// full additionally to existence and content.
fn file_digests(apath: &str) -> std::io::Result<(Digest, Digest)> {
    let mut c = Chain::new();
    c.update(apath.as_bytes());
    let fname = c.digest();
    match File::open(apath) {
        Ok(mut f) => {
            c.update(b"y");
            let mut buf = [0u8; 65536];
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                c.update(&buf[..n]);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            c.update(b"n");
        }
        Err(e) => return Err(e),
    }
    Ok((fname, c.digest()))
}

/// Parse one whitespace token the way list and map defaults want it: an
/// integer if it looks like one, then a float, then a plain string.
fn parse_token(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    Value::str(s)
}

fn coerce(name: &str, default: &Value, s: &str) -> Result<Value, EnvError> {
    let fail = |want: &'static str| EnvError::Coerce {
        name: name.to_string(),
        got: s.to_string(),
        want,
    };
    match default {
        Value::Bool(_) => match s.to_ascii_lowercase().as_str() {
            "0" | "false" => Ok(Value::Bool(false)),
            "1" | "true" => Ok(Value::Bool(true)),
            _ => Err(fail("bool")),
        },
        Value::Int(_) => s.parse::<i64>().map(Value::Int).map_err(|_| fail("int")),
        Value::Float(_) => s
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| fail("float")),
        Value::List(_) => Ok(Value::List(s.split_whitespace().map(parse_token).collect())),
        Value::Map(_) => {
            let mut map = BTreeMap::new();
            for tok in s.split_whitespace() {
                let (k, v) = match tok.split_once('=').or_else(|| tok.split_once(':')) {
                    Some(kv) => kv,
                    None => return Err(fail("map")),
                };
                map.insert(k.to_string(), parse_token(v));
            }
            Ok(Value::Map(map))
        }
        _ => Ok(Value::str(s)),
    }
}

impl Engine {
    /// Declare that the current computation read the given files.  The
    /// returned future resolves once every file is fingerprinted; content
    /// hashing of cold files runs on the background pool.
    pub fn depend_file<I, P>(&self, paths: I) -> Future<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let rt = self.0.rt.clone();
        let mut futs = Vec::new();
        for p in paths {
            let apath = absolutize(p.as_ref());
            // Artifacts never change once written, so depending on one is
            // a no-op.
            if apath.starts_with(self.0.arts.dir()) {
                continue;
            }
            futs.push(self.trace_path(apath.to_string_lossy().into_owned()));
        }
        let mut acc = Future::ready(());
        for f in futs {
            acc = acc.then(&rt, move |rt, _| {
                Step::Fut(f.then(rt, |_, _| Step::Done(())))
            });
        }
        acc
    }

    pub(crate) fn trace_path(&self, apath: String) -> Future<TraceReply> {
        let rt = self.0.rt.clone();
        let key = digest_values(&[&Value::str("#apath"), &Value::str(&apath)]);

        let mtime = match crate::fs::stat(Path::new(&apath)) {
            Ok(m) => m,
            Err(e) => {
                return Future::failed(TaskError::msg(format!("stat {}: {}", apath, e)));
            }
        };

        let cached = self.0.files.borrow().get(&apath).cloned();
        if let Some((m, fname, ffull)) = cached {
            if m == mtime {
                let reply = self.emit_path(&apath, key, fname, ffull);
                return Future::ready(reply);
            }
        }

        let apath2 = apath.clone();
        let hashed = rt.submit(move || {
            file_digests(&apath2)
                .map_err(|e| TaskError::msg(format!("read {}: {}", apath2, e)))
        });
        let eng = self.clone();
        hashed.then(&rt, move |_, digests| {
            let (fname, ffull) = *digests;
            eng.0
                .files
                .borrow_mut()
                .insert(apath.clone(), (mtime, fname, ffull));
            if let MTime::Stamp(stamp) = mtime {
                eng.append(&Record::FileDigest {
                    path: apath.clone(),
                    mtime: stamp,
                    name: fname,
                    full: ffull,
                });
            }
            Step::Done(eng.emit_path(&apath, key, fname, ffull))
        })
    }

    fn emit_path(&self, apath: &str, key: Digest, fname: Digest, ffull: Digest) -> TraceReply {
        let rec = TraceRec {
            call: CallRec {
                tracer: TracerRec::Path,
                arg1: Value::str(apath),
                arg2: Value::Unit,
            },
            key,
            cname: fname,
            cfull: ffull,
            ename: Digest::ZERO,
            efull: Digest::ZERO,
        };
        let reply = TraceReply {
            outcome: Ok(ValueSet::empty()),
            cname: rec.cname,
            cfull: rec.cfull,
            ename: rec.ename,
            efull: rec.efull,
        };
        self.0.trace_shadow.emit(&self.0.rt, Rc::new(rec));
        reply
    }

    /// Assert an observation about the world that the engine cannot
    /// re-derive.  Facts are only meaningful inside a traced function,
    /// where they fold into the summary environment digest.
    pub fn depend_fact(&self, facts: BTreeMap<String, Value>) {
        let _ = self.trace_fact(facts);
    }

    pub(crate) fn trace_fact(&self, facts: BTreeMap<String, Value>) -> Future<TraceReply> {
        let map = Value::Map(facts);
        let efull = map.digest();
        let key = digest_values(&[&Value::str("#fact"), &map]);
        let rec = TraceRec {
            call: CallRec {
                tracer: TracerRec::Fact,
                arg1: map,
                arg2: Value::Unit,
            },
            key,
            cname: Digest::ZERO,
            cfull: Digest::ZERO,
            ename: efull,
            efull,
        };
        let reply = TraceReply {
            outcome: Ok(ValueSet::empty()),
            cname: Digest::ZERO,
            cfull: Digest::ZERO,
            ename: efull,
            efull,
        };
        self.0.trace_shadow.emit(&self.0.rt, Rc::new(rec));
        Future::ready(reply)
    }

    /// Read an environment variable, coerced to the shape of `default`.
    /// The value is captured once per process; the read is recorded as a
    /// dependency of the enclosing computation.
    pub fn env(&self, name: &str, default: Value) -> Result<Value, EnvError> {
        self.env_allowed(name, default, None)
    }

    pub fn env_allowed(
        &self,
        name: &str,
        default: Value,
        allowed: Option<&[Value]>,
    ) -> Result<Value, EnvError> {
        let (val, full) = self.env_core(name, &default)?;
        if let Some(allowed) = allowed {
            if !allowed.contains(&val) {
                return Err(EnvError::NotAllowed {
                    name: name.to_string(),
                    got: format!("{:?}", val),
                });
            }
        }
        self.emit_env(name, default, full);
        Ok(val)
    }

    /// Coerce and memoize, keyed by (name, default).  No emission.
    fn env_core(&self, name: &str, default: &Value) -> Result<(Value, Digest), EnvError> {
        let key = digest_values(&[&Value::str(name), default]);
        if let Some(hit) = self.0.env_memo.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let val = match std::env::var(name) {
            Ok(s) => coerce(name, default, &s)?,
            Err(_) => default.clone(),
        };
        let full = digest_values(&[&Value::str(name), default, &val]);
        self.0
            .env_memo
            .borrow_mut()
            .insert(key, (val.clone(), full));
        Ok((val, full))
    }

    fn emit_env(&self, name: &str, default: Value, full: Digest) {
        let key = digest_values(&[&Value::str("#env"), &Value::str(name), &default]);
        self.0.trace_shadow.emit(
            &self.0.rt,
            Rc::new(TraceRec {
                call: CallRec {
                    tracer: TracerRec::Env,
                    arg1: Value::str(name),
                    arg2: default,
                },
                key,
                cname: full,
                cfull: full,
                ename: Digest::ZERO,
                efull: Digest::ZERO,
            }),
        );
    }

    pub(crate) fn trace_env(&self, name: String, default: Value) -> Future<TraceReply> {
        match self.env_core(&name, &default) {
            Ok((val, full)) => {
                self.emit_env(&name, default, full);
                Future::ready(TraceReply {
                    outcome: Ok(ValueSet::of(val)),
                    cname: full,
                    cfull: full,
                    ename: Digest::ZERO,
                    efull: Digest::ZERO,
                })
            }
            Err(err) => {
                // A variable that no longer coerces must not replay as a
                // hit; give it a full digest no success could have written.
                let msg = err.to_string();
                let full = digest_values(&[&Value::str(&name), &default, &Value::str(&msg)]);
                Future::ready(TraceReply {
                    outcome: Err(TaskError::msg(msg)),
                    cname: full,
                    cfull: full,
                    ename: Digest::ZERO,
                    efull: Digest::ZERO,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_parsing_prefers_numbers() {
        assert_eq!(parse_token("3"), Value::Int(3));
        assert_eq!(parse_token("2.5"), Value::Float(2.5));
        assert_eq!(parse_token("three"), Value::str("three"));
    }

    #[test]
    fn coercion_follows_default_shape() {
        assert_eq!(
            coerce("V", &Value::Bool(false), "TRUE").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(coerce("V", &Value::Int(0), "42").unwrap(), Value::Int(42));
        assert_eq!(
            coerce("V", &Value::List(vec![]), "a 1 2.5").unwrap(),
            Value::list(vec![Value::str("a"), Value::Int(1), Value::Float(2.5)])
        );
        assert_eq!(
            coerce("V", &Value::Map(BTreeMap::new()), "opt=3 mode=fast").unwrap(),
            Value::map(vec![
                ("opt".to_string(), Value::Int(3)),
                ("mode".to_string(), Value::str("fast")),
            ])
        );
        assert_eq!(coerce("V", &Value::str(""), "raw").unwrap(), Value::str("raw"));
    }

    #[test]
    fn coercion_failures_name_the_variable() {
        let err = coerce("OPT", &Value::Int(0), "high").unwrap_err();
        assert!(err.to_string().contains("OPT"));
        assert!(err.to_string().contains("int"));
    }

    #[test]
    fn missing_files_digest_differently_from_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let apath = path.to_string_lossy().into_owned();
        let (name_missing, full_missing) = file_digests(&apath).unwrap();
        std::fs::write(&path, b"").unwrap();
        let (name_empty, full_empty) = file_digests(&apath).unwrap();
        assert_eq!(name_missing, name_empty);
        assert_ne!(full_missing, full_empty);
    }

    #[test]
    fn content_changes_the_full_digest_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let apath = path.to_string_lossy().into_owned();
        std::fs::write(&path, b"one").unwrap();
        let (name1, full1) = file_digests(&apath).unwrap();
        std::fs::write(&path, b"two").unwrap();
        let (name2, full2) = file_digests(&apath).unwrap();
        assert_eq!(name1, name2);
        assert_ne!(full1, full2);
    }
}
