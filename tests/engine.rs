//! End-to-end engine tests: memoization, replay across engine instances,
//! dependency invalidation, and artifact lifetime.

use filetime::FileTime;
use retrace::flow::{Future, Step};
use retrace::{Engine, EngineOptions, Value, ValueSet};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

struct Space {
    dir: tempfile::TempDir,
}

impl Space {
    fn new() -> anyhow::Result<Space> {
        Ok(Space {
            dir: tempfile::tempdir()?,
        })
    }

    fn engine(&self) -> anyhow::Result<Engine> {
        Engine::create(EngineOptions {
            site: Some(self.dir.path().to_path_buf()),
            threads: Some(2),
            ..EngineOptions::default()
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a file with an explicit mtime, so content changes always look
    /// changed to the mtime-keyed digest cache.
    fn write(&self, name: &str, data: &str, stamp: i64) -> anyhow::Result<PathBuf> {
        let path = self.path(name);
        std::fs::write(&path, data)?;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(stamp, 0))?;
        Ok(path)
    }
}

/// A memoized rule that counts its executions: reads `dep` and returns its
/// uppercased content.
fn upper_rule(eng: &Engine, counter: Rc<Cell<u32>>, dep: PathBuf) -> retrace::MemoFn {
    eng.memoized("upper", &Value::Int(1), move |eng, _args| {
        counter.set(counter.get() + 1);
        let rt = eng.runtime().clone();
        let dep2 = dep.clone();
        eng.depend_file(vec![dep.clone()]).then(&rt, move |_, _| {
            let text = std::fs::read_to_string(&dep2).unwrap_or_default();
            Step::Done(ValueSet::of(Value::str(text.to_uppercase())))
        })
    })
}

fn call_value(eng: &Engine, mf: &retrace::MemoFn) -> Value {
    let fut = eng.call(mf, ValueSet::empty());
    let out = eng.wait(&fut);
    out.as_ref().as_ref().unwrap().value().clone()
}

#[test]
fn memoized_body_runs_once_per_process() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "hi", 1)?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));

    assert_eq!(call_value(&eng, &mf), Value::str("HI"));
    assert_eq!(call_value(&eng, &mf), Value::str("HI"));
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn concurrent_calls_share_one_execution() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "hi", 1)?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));

    let f1 = eng.call(&mf, ValueSet::empty());
    let f2 = eng.call(&mf, ValueSet::empty());
    assert!(eng.wait(&f1).is_ok());
    assert!(eng.wait(&f2).is_ok());
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn unchanged_deps_replay_without_execution() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "hi", 1)?;
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
        assert_eq!(call_value(&eng, &mf), Value::str("HI"));
        assert_eq!(counter.get(), 1);
        eng.shutdown();
    }

    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
    assert_eq!(call_value(&eng, &mf), Value::str("HI"));
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn changed_file_invalidates() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "one", 1)?;
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
        assert_eq!(call_value(&eng, &mf), Value::str("ONE"));
        eng.shutdown();
    }

    space.write("dep", "two", 2)?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
    assert_eq!(call_value(&eng, &mf), Value::str("TWO"));
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn touched_but_identical_file_still_replays() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "same", 1)?;
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
        call_value(&eng, &mf);
        eng.shutdown();
    }

    // New mtime, same bytes: the cache misses but the digests agree.
    space.write("dep", "same", 9)?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
    assert_eq!(call_value(&eng, &mf), Value::str("SAME"));
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn distinct_args_execute_separately() -> anyhow::Result<()> {
    let space = Space::new()?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let c2 = counter.clone();
    let mf = eng.memoized("double", &Value::Int(1), move |_, args| {
        c2.set(c2.get() + 1);
        let n = match args.value() {
            Value::Int(n) => *n,
            _ => 0,
        };
        Future::ready(ValueSet::of(Value::Int(n * 2)))
    });

    let f1 = eng.call(&mf, ValueSet::of(Value::Int(3)));
    let f2 = eng.call(&mf, ValueSet::of(Value::Int(4)));
    assert_eq!(eng.wait(&f1).as_ref().as_ref().unwrap().value(), &Value::Int(6));
    assert_eq!(eng.wait(&f2).as_ref().as_ref().unwrap().value(), &Value::Int(8));
    assert_eq!(counter.get(), 2);
    Ok(())
}

#[test]
fn failures_replay_in_process_but_not_across() -> anyhow::Result<()> {
    let space = Space::new()?;

    fn failing(eng: &Engine, counter: Rc<Cell<u32>>) -> retrace::MemoFn {
        eng.memoized("broken", &Value::Int(1), move |_, _| {
            counter.set(counter.get() + 1);
            Future::failed(retrace::TaskError::msg("nope"))
        })
    }

    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = failing(&eng, counter.clone());
        let f1 = eng.call(&mf, ValueSet::empty());
        assert!(eng.wait(&f1).is_err());
        let f2 = eng.call(&mf, ValueSet::empty());
        assert!(eng.wait(&f2).is_err());
        assert_eq!(counter.get(), 1);
        eng.shutdown();
    }

    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = failing(&eng, counter.clone());
    let fut = eng.call(&mf, ValueSet::empty());
    assert!(eng.wait(&fut).is_err());
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn traced_functions_run_once_per_args() -> anyhow::Result<()> {
    let space = Space::new()?;
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let c2 = counter.clone();
    let tf = eng.traced("probe", &Value::Int(1), move |_, args| {
        c2.set(c2.get() + 1);
        Future::ready(args.value().clone())
    });

    let f1 = eng.call_traced(&tf, ValueSet::of(Value::str("a")));
    let f2 = eng.call_traced(&tf, ValueSet::of(Value::str("a")));
    let f3 = eng.call_traced(&tf, ValueSet::of(Value::str("b")));
    assert_eq!(eng.wait(&f1).as_ref().as_ref().unwrap().value(), &Value::str("a"));
    assert_eq!(eng.wait(&f2).as_ref().as_ref().unwrap().value(), &Value::str("a"));
    assert_eq!(eng.wait(&f3).as_ref().as_ref().unwrap().value(), &Value::str("b"));
    assert_eq!(counter.get(), 2);
    Ok(())
}

#[test]
fn named_results_unwrap_to_their_value() -> anyhow::Result<()> {
    let space = Space::new()?;
    let eng = space.engine()?;
    let tf = eng.traced("stat", &Value::Int(1), |_, _| {
        Future::ready(Value::named(Value::str("content"), Value::str("path")))
    });
    let fut = eng.call_traced(&tf, ValueSet::empty());
    let out = eng.wait(&fut);
    assert_eq!(out.as_ref().as_ref().unwrap().value(), &Value::str("content"));
    Ok(())
}

/// A memoized rule whose dependency tracking goes through a traced reader.
/// Replay re-runs the cheap traced body but not the memoized one.
#[test]
fn replay_reruns_traced_not_memoized() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "v1", 1)?;

    fn rules(
        eng: &Engine,
        traced_n: Rc<Cell<u32>>,
        memo_n: Rc<Cell<u32>>,
        dep: PathBuf,
    ) -> retrace::MemoFn {
        let tf = eng.traced("read", &Value::Int(1), move |eng, _| {
            traced_n.set(traced_n.get() + 1);
            let rt = eng.runtime().clone();
            let dep2 = dep.clone();
            eng.depend_file(vec![dep.clone()]).then(&rt, move |_, _| {
                let text = std::fs::read_to_string(&dep2).unwrap_or_default();
                Step::Done(Value::str(text))
            })
        });
        eng.memoized("compile", &Value::Int(1), move |eng, _| {
            memo_n.set(memo_n.get() + 1);
            let rt = eng.runtime().clone();
            let tf2 = tf.clone();
            let inner = eng.call_traced(&tf2, ValueSet::empty());
            inner.then(&rt, |_, vs| Step::Done(vs.clone()))
        })
    }

    {
        let eng = space.engine()?;
        let (tn, mn) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
        let mf = rules(&eng, tn.clone(), mn.clone(), space.path("dep"));
        assert_eq!(call_value(&eng, &mf), Value::str("v1"));
        assert_eq!((tn.get(), mn.get()), (1, 1));
        eng.shutdown();
    }

    let eng = space.engine()?;
    let (tn, mn) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
    let mf = rules(&eng, tn.clone(), mn.clone(), space.path("dep"));
    assert_eq!(call_value(&eng, &mf), Value::str("v1"));
    assert_eq!((tn.get(), mn.get()), (1, 0));
    Ok(())
}

#[test]
fn env_values_coerce_and_invalidate() -> anyhow::Result<()> {
    let space = Space::new()?;
    let var = "RETRACE_TEST_OPT_LEVEL";

    fn rule(eng: &Engine, counter: Rc<Cell<u32>>, var: &'static str) -> retrace::MemoFn {
        eng.memoized("optbuild", &Value::Int(1), move |eng, _| {
            counter.set(counter.get() + 1);
            let opt = eng.env(var, Value::Int(3)).unwrap();
            Future::ready(ValueSet::of(opt))
        })
    }

    std::env::set_var(var, "7");
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = rule(&eng, counter.clone(), var);
        assert_eq!(call_value(&eng, &mf), Value::Int(7));
        eng.shutdown();
    }

    // Same value: replays.
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = rule(&eng, counter.clone(), var);
        assert_eq!(call_value(&eng, &mf), Value::Int(7));
        assert_eq!(counter.get(), 0);
        eng.shutdown();
    }

    // Unset: falls back to the default and re-executes.
    std::env::remove_var(var);
    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = rule(&eng, counter.clone(), var);
    assert_eq!(call_value(&eng, &mf), Value::Int(3));
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn env_allowed_rejects_other_values() -> anyhow::Result<()> {
    let space = Space::new()?;
    let eng = space.engine()?;
    let var = "RETRACE_TEST_MODE";
    std::env::set_var(var, "weird");
    let err = eng
        .env_allowed(
            var,
            Value::str("fast"),
            Some(&[Value::str("fast"), Value::str("small")]),
        )
        .unwrap_err();
    assert!(err.to_string().contains(var));
    std::env::remove_var(var);
    Ok(())
}

#[test]
fn pruned_artifacts_are_deleted() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("src", "v1", 1)?;

    fn rule(eng: &Engine, dep: PathBuf) -> retrace::MemoFn {
        eng.memoized("emit", &Value::Int(1), move |eng, _| {
            let rt = eng.runtime().clone();
            let eng2 = eng.clone();
            let dep2 = dep.clone();
            eng.depend_file(vec![dep.clone()]).then(&rt, move |_, _| {
                let out = eng2.mkpath("out.txt");
                let text = std::fs::read_to_string(&dep2).unwrap_or_default();
                std::fs::write(&out, &text).unwrap();
                Step::Done(ValueSet::of(Value::str(out.to_string_lossy())))
            })
        })
    }

    let first_out;
    {
        let eng = space.engine()?;
        let mf = rule(&eng, space.path("src"));
        first_out = match call_value(&eng, &mf) {
            Value::Str(s) => PathBuf::from(s),
            other => panic!("unexpected result {:?}", other),
        };
        assert_eq!(std::fs::read_to_string(&first_out)?, "v1");
        eng.shutdown();
    }

    space.write("src", "v2", 2)?;
    let eng = space.engine()?;
    let mf = rule(&eng, space.path("src"));
    let second_out = match call_value(&eng, &mf) {
        Value::Str(s) => PathBuf::from(s),
        other => panic!("unexpected result {:?}", other),
    };
    assert_ne!(first_out, second_out);
    assert!(!first_out.exists());
    assert_eq!(std::fs::read_to_string(&second_out)?, "v2");
    Ok(())
}

#[test]
fn replay_survives_compaction() -> anyhow::Result<()> {
    let space = Space::new()?;
    space.write("dep", "hi", 1)?;
    {
        let eng = space.engine()?;
        let counter = Rc::new(Cell::new(0));
        let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
        call_value(&eng, &mf);
        let saved = eng.save();
        assert!(matches!(&*eng.wait(&saved), Ok(false)));
        eng.shutdown();
    }

    let eng = space.engine()?;
    let counter = Rc::new(Cell::new(0));
    let mf = upper_rule(&eng, counter.clone(), space.path("dep"));
    assert_eq!(call_value(&eng, &mf), Value::str("HI"));
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn imports_replay_through_callback() -> anyhow::Result<()> {
    let space = Space::new()?;
    {
        let eng = space.engine()?;
        eng.note_import("rules/main");
        eng.note_import("rules/extra");
        eng.note_import("rules/main");
        eng.shutdown();
    }

    let seen: Rc<std::cell::RefCell<Vec<String>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let eng = Engine::create(EngineOptions {
        site: Some(space.dir.path().to_path_buf()),
        threads: Some(2),
        on_import: Some(Box::new(move |path| seen2.borrow_mut().push(path.to_string()))),
        ..EngineOptions::default()
    })?;
    assert_eq!(&*seen.borrow(), &["rules/main", "rules/extra"]);
    drop(eng);
    Ok(())
}

#[test]
#[should_panic(expected = "depend_fact")]
fn fact_at_the_memoized_frontier_panics() {
    let space = Space::new().unwrap();
    let eng = space.engine().unwrap();
    let mf = eng.memoized("bad", &Value::Int(1), |eng, _| {
        let mut facts = BTreeMap::new();
        facts.insert("os".to_string(), Value::str("linux"));
        eng.depend_fact(facts);
        Future::ready(ValueSet::empty())
    });
    let fut = eng.call(&mf, ValueSet::empty());
    let _ = eng.wait(&fut);
}

#[test]
fn facts_fold_into_traced_summaries() -> anyhow::Result<()> {
    let space = Space::new()?;
    let eng = space.engine()?;
    let tf = eng.traced("platform", &Value::Int(1), |eng, _| {
        let mut facts = BTreeMap::new();
        facts.insert("os".to_string(), Value::str("linux"));
        eng.depend_fact(facts);
        Future::ready(Value::str("linux"))
    });
    let tf2 = tf.clone();
    let mf = eng.memoized("uses-platform", &Value::Int(1), move |eng, _| {
        let rt = eng.runtime().clone();
        let inner = eng.call_traced(&tf2, ValueSet::empty());
        inner.then(&rt, |_, vs| Step::Done(vs.clone()))
    });
    assert_eq!(call_value(&eng, &mf), Value::str("linux"));
    Ok(())
}
