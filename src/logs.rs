// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log capture for the unit tests.

use std::{
    io,
    sync::{Arc, Mutex},
};
use tracing::{subscriber::DefaultGuard, Level};
use tracing_subscriber::fmt::MakeWriter;

/// Formatted log lines written while the capture is installed on the
/// current thread.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Installs a plain-text subscriber for the current thread until the
    /// guard is dropped.
    pub(crate) fn install() -> (CapturedLogs, DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(Level::DEBUG)
            .finish();

        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub(crate) fn lines_containing(&self, needle: &str) -> Vec<String> {
        let buffer = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buffer)
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
