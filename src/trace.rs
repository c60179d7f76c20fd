//! Chrome trace output.
//!
//! A performance log in the chrome://tracing JSON format, owned by the
//! engine that opened it rather than hanging off a process global.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

struct Inner {
    start: Instant,
    w: BufWriter<File>,
}

#[derive(Clone)]
pub struct Trace(Rc<RefCell<Inner>>);

impl Inner {
    fn write_complete(&mut self, name: &str, start: Instant, end: Instant) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }},\n",
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        )
    }
}

impl Trace {
    pub fn open(path: &Path) -> std::io::Result<Trace> {
        let mut w = BufWriter::new(File::create(path)?);
        write!(w, "[\n")?;
        Ok(Trace(Rc::new(RefCell::new(Inner {
            start: Instant::now(),
            w,
        }))))
    }

    /// Record `f` as a complete event.
    pub fn scope<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let _ = self
            .0
            .borrow_mut()
            .write_complete(name, start, Instant::now());
        result
    }

    /// Record an event that started earlier and just finished, for work
    /// whose extent spans suspension points.
    pub fn complete(&self, name: &str, start: Instant) {
        let _ = self
            .0
            .borrow_mut()
            .write_complete(name, start, Instant::now());
    }

    pub fn close(&self) -> std::io::Result<()> {
        let mut inner = self.0.borrow_mut();
        let start = inner.start;
        inner.write_complete("main", start, Instant::now())?;
        write!(inner.w, "]\n")?;
        inner.w.flush()
    }
}
