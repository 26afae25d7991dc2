use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let f: Box<dyn Write + Send> = match env::var("RETRACE_LOG_FILE") {
            Ok(filename) => Box::new(File::create(&filename).unwrap()),
            Err(_) => match env::var("RETRACE_APPEND_LOG_FILE") {
                Ok(filename) => Box::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .unwrap(),
                ),
                Err(_) => Box::new(io::stderr()),
            },
        };

        let mut default_level = LogWarn;
        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        if let Ok(spec) = env::var("RETRACE_LOG") {
            for clause in spec.split(',') {
                match clause.find('=') {
                    Some(pos) => {
                        let (module, level) = clause.split_at(pos);
                        level_map.insert(module.to_owned(), level_from_name(&level[1..]));
                    }
                    None => default_level = level_from_name(clause),
                }
            }
        }

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn level_from_name(name: &str) -> LogLevel {
    match name {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Filenames are case sensitive on Linux; don't lowercase.
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    match l.log_modules_cache.get(filename) {
        Some(m) => m.to_owned(),
        None => {
            let name = filename_to_module_name(filename);
            let level = get_log_level(&name, l);
            let m = LogModule { level, name };
            l.log_modules_cache.insert(filename.to_owned(), m.clone());
            m
        }
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// A log line under construction. The line is flushed, newline-terminated,
/// when this is dropped.
pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        func_name: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, func_name);
            }
        }

        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend the bytes were written even when disabled, otherwise
        // write! reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    func_name: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }

    write!(stream, "{}()", func_name).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Write one log line to the log file (stderr if no log file was specified).
/// The program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at LogFatal, dump a backtrace to stderr, and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Write to stderr always; no backtrace, just exit(1). For configuration
/// errors where a backtrace would only obscure the message.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::Write;
            use std::io::stderr;
            crate::log::write_prefix(
                &mut stderr(),
                crate::log::LogLevel::LogFatal,
                file!(),
                line!(),
                module_path!(),
            );
            write!(stderr(), $($args)+).unwrap();
            write!(stderr(), "\n").unwrap();
            std::process::exit(1)
        }
    };
}

/// Dump the backtrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_backtrace(bt);
    std::process::abort();
}

fn dump_backtrace(bt: Backtrace) {
    write!(io::stderr(), "=== Start retrace backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End retrace backtrace\n").unwrap();
}

/// Assert a condition about tracee state. On failure, logs the tid and
/// last wait status of the task involved, then aborts with a backtrace.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        {
            let t_: &crate::task::Task = $task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "(task {} (rec:{}) at status {}) Assertion `{}' failed to hold. ",
                        t_.tid, t_.rec_tid, t_.status(), stringify!($cond)
                    ).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            let t_: &crate::task::Task = $task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "(task {} (rec:{}) at status {}) Assertion `{}' failed to hold. ",
                        t_.tid, t_.rec_tid, t_.status(), stringify!($cond)
                    ).unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
}
