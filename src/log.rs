//! Leveled diagnostic log with a pluggable sink.

use std::ffi::CString;
use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::Local;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Where to put the diagnostic log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    fn write(&mut self, message: &str) {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = match CString::new(message) {
                    Ok(message) => message,
                    Err(_) => return,
                };
                unsafe { libc::syslog(libc::LOG_INFO, message.as_c_str().as_ptr()) };
            }
            Self::File(file) => {
                // A full disk is not worth killing the server over.
                write!(file, "{}", message).ok();
                file.flush().ok();
            }
        }
    }
}

#[derive(Debug)]
pub struct Logger {
    sink: LogSink,
    level: Level,
}

impl Logger {
    pub fn new(sink: LogSink, level: Level) -> Self {
        Self { sink, level }
    }

    pub fn log(&mut self, level: Level, message: &str) {
        if level < self.level {
            return;
        }
        let entry = format!(
            "[{}] {}: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level.label(),
            message
        );
        self.sink.write(&entry);
    }

    pub fn debug(&mut self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&mut self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warning(&mut self, message: &str) {
        self.log(Level::Warning, message);
    }

    pub fn error(&mut self, message: &str) {
        self.log(Level::Error, message);
    }
}
