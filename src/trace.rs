//! Chrome trace output.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = parking_lot::const_mutex(None);
static ENABLED: AtomicBool = AtomicBool::new(false);
static NEXT_TID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static TID: usize = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

struct Event<'a> {
    name: &'a str,
    tid: usize,
    start: Instant,
    end: Instant,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: &Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }}",
            event.tid,
            event.name,
            event.start.duration_since(self.start).as_micros(),
            event.end.duration_since(event.start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_event(&Event {
            name: "main",
            tid: 0,
            start,
            end: Instant::now(),
        })?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock() = Some(trace);
    ENABLED.store(true, Ordering::Release);
    Ok(())
}

#[inline]
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    if !ENABLED.load(Ordering::Acquire) {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let event = Event {
        name,
        tid: TID.with(|tid| *tid),
        start,
        end: Instant::now(),
    };
    if let Some(t) = TRACE.lock().as_mut() {
        // Write errors disable tracing rather than failing the build.
        if t.write_event(&event).and_then(|_| writeln!(t.w, ",")).is_err() {
            ENABLED.store(false, Ordering::Release);
        }
    }
    result
}

pub fn close() -> std::io::Result<()> {
    ENABLED.store(false, Ordering::Release);
    if let Some(mut t) = TRACE.lock().take() {
        return t.close();
    }
    Ok(())
}
