//! Logging setup: console subscriber, or a rolling file sink.
//!
//! The file sink stays out of the workers' way: formatted events go into a
//! bounded channel and a single writer thread owns the file, rolling it by
//! calendar date and by line count. When the channel is full the line is
//! dropped and counted instead of stalling the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

enum SinkMessage {
    Line(Vec<u8>),
    Shutdown,
}

/// Install the global subscriber. With a log directory configured, events
/// go to the rolling file sink; otherwise they go to the console. The
/// returned guard owns the sink thread; keep it alive until exit.
pub fn init(config: &Config) -> io::Result<Option<LogGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_dir {
        Some(dir) => {
            let file = RollingFile::open(dir, config.log_max_lines)?;
            let (tx, rx) = mpsc::sync_channel(config.log_queue_depth);
            let lost = Arc::new(AtomicUsize::new(0));
            let handle = SinkHandle {
                tx: tx.clone(),
                lost: Arc::clone(&lost),
            };
            let thread = thread::Builder::new()
                .name("log-writer".into())
                .spawn(move || writer_loop(rx, file))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(handle)
                .init();
            Ok(Some(LogGuard {
                tx: Some(tx),
                thread: Some(thread),
                lost,
            }))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            Ok(None)
        }
    }
}

/// Keeps the sink thread alive. Dropping it flushes what is queued, stops
/// the thread, and reports lines lost to backpressure.
pub struct LogGuard {
    tx: Option<SyncSender<SinkMessage>>,
    thread: Option<JoinHandle<()>>,
    lost: Arc<AtomicUsize>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send(SinkMessage::Shutdown).ok();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
        let lost = self.lost.load(Ordering::Relaxed);
        if lost > 0 {
            eprintln!("log sink dropped {} lines under pressure", lost);
        }
    }
}

/// Cloned into the subscriber; hands out one `SinkWriter` per event.
#[derive(Clone)]
struct SinkHandle {
    tx: SyncSender<SinkMessage>,
    lost: Arc<AtomicUsize>,
}

impl<'a> MakeWriter<'a> for SinkHandle {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> SinkWriter {
        SinkWriter {
            tx: self.tx.clone(),
            lost: Arc::clone(&self.lost),
            line: Vec::new(),
        }
    }
}

/// Accumulates one formatted event, enqueueing it on drop.
struct SinkWriter {
    tx: SyncSender<SinkMessage>,
    lost: Arc<AtomicUsize>,
    line: Vec<u8>,
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line);
        if let Err(TrySendError::Full(_)) = self.tx.try_send(SinkMessage::Line(line)) {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn writer_loop(rx: Receiver<SinkMessage>, mut file: RollingFile) {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            SinkMessage::Line(line) => {
                if let Err(e) = file.write_line(&line) {
                    eprintln!("log sink write failed: {}", e);
                }
                // Drain the burst before flushing once.
                let mut shutdown = false;
                loop {
                    match rx.try_recv() {
                        Ok(SinkMessage::Line(line)) => {
                            if let Err(e) = file.write_line(&line) {
                                eprintln!("log sink write failed: {}", e);
                            }
                        }
                        Ok(SinkMessage::Shutdown) => {
                            shutdown = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if let Err(e) = file.flush() {
                    eprintln!("log sink flush failed: {}", e);
                }
                if shutdown {
                    return;
                }
            }
            SinkMessage::Shutdown => {
                while let Ok(SinkMessage::Line(line)) = rx.try_recv() {
                    file.write_line(&line).ok();
                }
                file.flush().ok();
                return;
            }
        }
    }
    file.flush().ok();
}

/// The file behind the sink: `YYYY_MM_DD.log`, rolling to `YYYY_MM_DD-N.log`
/// when full, starting over on a new calendar date.
struct RollingFile {
    dir: PathBuf,
    max_lines: usize,
    date: NaiveDate,
    sequence: u32,
    lines: usize,
    out: BufWriter<File>,
}

impl RollingFile {
    fn open(dir: &Path, max_lines: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let date = Local::now().date_naive();
        let out = Self::open_file(dir, date, 0)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_lines,
            date,
            sequence: 0,
            lines: 0,
            out,
        })
    }

    fn file_name(date: NaiveDate, sequence: u32) -> String {
        if sequence == 0 {
            format!("{}.log", date.format("%Y_%m_%d"))
        } else {
            format!("{}-{}.log", date.format("%Y_%m_%d"), sequence)
        }
    }

    fn open_file(dir: &Path, date: NaiveDate, sequence: u32) -> io::Result<BufWriter<File>> {
        let path = dir.join(Self::file_name(date, sequence));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    /// Append one formatted line, rolling first when the date turned over
    /// or the current file is full.
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let today = Local::now().date_naive();
        if today != self.date {
            self.date = today;
            self.sequence = 0;
            self.lines = 0;
            self.roll()?;
        } else if self.lines >= self.max_lines {
            self.sequence += 1;
            self.lines = 0;
            self.roll()?;
        }
        self.out.write_all(line)?;
        self.lines += 1;
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out = Self::open_file(&self.dir, self.date, self.sequence)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
