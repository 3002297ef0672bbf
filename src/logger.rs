/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io::{self, Write};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use flexi_logger::{
    writers::LogWriter, DeferredNow, FileSpec, Level, LogSpecification, Logger, LoggerHandle,
    Record,
};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::stats;

#[derive(Default)]
struct LevelCounts {
    error: AtomicU64,
    warning: AtomicU64,
}

/// A writer calculating log count by level without actually writing log
pub struct LogLevelWriter(Arc<LevelCounts>);

impl LogLevelWriter {
    pub fn new() -> (Self, LogLevelCounter) {
        let counts = Arc::new(LevelCounts::default());
        (Self(counts.clone()), LogLevelCounter(Arc::downgrade(&counts)))
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, _: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => &self.0.error,
            Level::Warn => &self.0.warning,
            _ => return Ok(()),
        }
        .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LogLevelCounter(Weak<LevelCounts>);

impl stats::OwnedCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        match self.0.upgrade() {
            Some(counts) => vec![
                (
                    "error",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counts.error.swap(0, Ordering::Relaxed)),
                ),
                (
                    "warning",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counts.warning.swap(0, Ordering::Relaxed)),
                ),
            ],
            None => vec![],
        }
    }

    fn closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

struct StderrWriter;

impl LogWriter for StderrWriter {
    fn write(&self, now: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        writeln!(
            io::stderr(),
            "{} {} [{}] {}",
            now.now().format("%Y-%m-%d %H:%M:%S%.6f"),
            record.level(),
            record.module_path().unwrap_or("-"),
            record.args()
        )
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

pub struct LogWriterAdapter(Vec<Box<dyn LogWriter>>);

impl LogWriterAdapter {
    pub fn new(writers: Vec<Box<dyn LogWriter>>) -> Self {
        Self(writers)
    }
}

impl LogWriter for LogWriterAdapter {
    fn write(&self, now: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        self.0
            .iter()
            .fold(Ok(()), |r, w| r.or(w.write(now, record)))
    }

    fn flush(&self) -> io::Result<()> {
        self.0.iter().fold(Ok(()), |r, w| r.or(w.flush()))
    }
}

/// Initializes logging for the binaries and returns the handle together
/// with a countable for error/warning rates. Library code never calls this.
pub fn init(config: &LogConfig) -> Result<(LoggerHandle, LogLevelCounter)> {
    let spec = LogSpecification::parse(&config.level)
        .map_err(|e| Error::Config(format!("log level {:?}: {}", config.level, e)))?;
    let (level_writer, level_counter) = LogLevelWriter::new();
    let writers: Vec<Box<dyn LogWriter>> = vec![Box::new(StderrWriter), Box::new(level_writer)];
    let adapter = Box::new(LogWriterAdapter::new(writers));
    let logger = match &config.dir {
        Some(dir) => Logger::with(spec)
            .log_to_file_and_writer(FileSpec::default().directory(dir), adapter),
        None => Logger::with(spec).log_to_writer(adapter),
    };
    let handle = logger
        .start()
        .map_err(|e| Error::Config(format!("logger init: {}", e)))?;
    Ok((handle, level_counter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use public::counter::OwnedCountable;

    #[test]
    fn level_writer_counts_only_errors_and_warnings() {
        let (writer, counter) = LogLevelWriter::new();
        let mut now = DeferredNow::new();
        for (level, times) in [(Level::Error, 3), (Level::Warn, 2), (Level::Info, 5)] {
            for _ in 0..times {
                writer
                    .write(
                        &mut now,
                        &Record::builder()
                            .level(level)
                            .args(format_args!("x"))
                            .build(),
                    )
                    .unwrap();
            }
        }
        let counters = counter.get_counters();
        assert_eq!(counters[0].2, stats::CounterValue::Unsigned(3));
        assert_eq!(counters[1].2, stats::CounterValue::Unsigned(2));
        // swap-on-read semantics
        assert_eq!(
            counter.get_counters()[0].2,
            stats::CounterValue::Unsigned(0)
        );
    }

    #[test]
    fn counter_closes_with_writer() {
        let (writer, counter) = LogLevelWriter::new();
        assert!(!counter.closed());
        drop(writer);
        assert!(counter.closed());
    }
}
