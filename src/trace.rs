//! Chrome Tracing collector for step visualization.
//!
//! Records subtask run spans into thread-local buffers with zero
//! contention; buffers are folded into a global list and exported as a
//! JSON file loadable by chrome://tracing or ui.perfetto.dev. Also owns
//! the global microsecond epoch every timestamp in the crate is measured
//! against.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A single trace event in Chrome Tracing "complete event" form.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: String,
    pub tid: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = RefCell::new(Vec::with_capacity(4096));
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64;
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

/// Microseconds since the process-wide epoch.
pub fn now_micros() -> u64 {
    GLOBAL_START.elapsed().as_micros() as u64 + *EPOCH_START_US
}

/// Records a span of work on the calling thread's buffer.
pub fn record_event(name: &str, tid: usize, start_us: u64, end_us: u64) {
    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name: name.to_string(),
            tid,
            start_us,
            duration_us: end_us.saturating_sub(start_us),
        });
    });
}

/// Folds the calling thread's buffer into the global list. Each scheduler
/// thread does this at shutdown.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            let mut global = ALL_BUFFERS.lock().unwrap();
            global.push(std::mem::take(&mut *local));
        }
    });
}

/// Exports all collected trace events to a JSON file.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let buffers = ALL_BUFFERS.lock().unwrap();

    writeln!(writer, "[")?;
    let mut first = true;
    for buffer in buffers.iter() {
        for event in buffer {
            if !first {
                writeln!(writer, ",")?;
            }
            first = false;
            write!(
                writer,
                "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
                event.name, event.start_us, event.duration_us, event.tid
            )?;
        }
    }
    writeln!(writer, "\n]")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_micros_monotone() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_record_and_collect() {
        let t = now_micros();
        record_event("unit", 0, t, t + 5);
        collect_local_trace();
        let global = ALL_BUFFERS.lock().unwrap();
        assert!(global.iter().flatten().any(|e| e.name == "unit"));
    }
}
