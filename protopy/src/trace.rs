use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use log::warn;
use parking_lot::Mutex;

use crate::{GarbageCollectionStats, ObjectKind};

/// Environment variable naming the GC trace file.
pub const GC_TRACE_ENV: &str = "PROTOPY_GC_TRACE";

/// Append-only log of allocation and collection events, one per line,
/// prefixed with microseconds since the heap was created.
#[derive(Debug)]
pub struct GcTrace {
    out: Mutex<BufWriter<File>>,
    start: Instant,
    failed: AtomicBool,
}

impl GcTrace {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
            start: Instant::now(),
            failed: AtomicBool::new(false),
        })
    }

    pub fn allocation(&self, kind: ObjectKind, addr: usize) {
        self.line(format_args!("alloc {} {addr:#x}", kind.name()));
    }

    pub fn collection_started(&self, epoch: usize) {
        self.line(format_args!("gc-start epoch={epoch}"));
    }

    pub fn collection_finished(&self, stats: &GarbageCollectionStats) {
        self.line(format_args!(
            "gc-end epoch={} tracked={} collected={} micros={}",
            stats.epoch,
            stats.tracked,
            stats.collected,
            stats.duration.as_micros()
        ));
        self.flush();
    }

    fn line(&self, event: fmt::Arguments<'_>) {
        let micros = self.start.elapsed().as_micros();
        let result = writeln!(self.out.lock(), "{micros} {event}");
        if let Err(err) = result {
            self.report(err);
        }
    }

    pub fn flush(&self) {
        if let Err(err) = self.out.lock().flush() {
            self.report(err);
        }
    }

    fn report(&self, err: io::Error) {
        if !self.failed.swap(true, Ordering::Relaxed) {
            warn!("gc trace write failed: {err}");
        }
    }
}

impl Drop for GcTrace {
    fn drop(&mut self) {
        let _ = self.out.get_mut().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};

    #[test]
    fn writes_one_line_per_event() {
        let path = std::env::temp_dir()
            .join(format!("protopy-trace-{}.log", std::process::id()));
        let _ = fs::remove_file(&path);
        {
            let trace = GcTrace::open(&path).unwrap();
            trace.allocation(ObjectKind::List, 0x10);
            trace.collection_started(0);
            trace.collection_finished(&GarbageCollectionStats {
                epoch: 0,
                tracked: 1,
                collected: 1,
                duration: Duration::from_micros(5),
            });
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("alloc list 0x10"));
        assert!(lines[2].contains("collected=1"));
        let _ = fs::remove_file(&path);
    }
}
