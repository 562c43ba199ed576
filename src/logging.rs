//! Logging backend which writes to a file from a background thread and, when the `debug`
//! feature is enabled, mirrors messages over UDP for live capture during development.

use chrono::Local;
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Write, path::Path, path::PathBuf, sync::Mutex};

#[derive(Clone, Copy, Serialize, Deserialize)]
enum Severity {
    Info,
    Error,
    Warning,
    Debug,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Debug => "debug",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Entry {
    module: String,
    severity: Severity,
    text: String,
    time: String,
}

impl Entry {
    /// Serialises the entry as a length-prefixed bincode frame for the UDP mirror.
    #[cfg(feature = "debug")]
    fn pack(&self) -> Option<Vec<u8>> {
        let serialized = bincode::serialize::<Entry>(self).ok()?;

        let mut frame = Vec::from(u32::to_le_bytes(serialized.len() as u32 + 4));
        frame.extend(&serialized);

        Some(frame)
    }

    fn write_to_file(&self, file: &mut File) {
        //      [date time] [module] [level] Text
        let _ = file.write_fmt(format_args!(
            "[{}] [{}] [{}] {}\n",
            self.time,
            self.module,
            self.severity.as_str(),
            self.text
        ));
    }
}

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let severity = match record.level() {
            Level::Error => Severity::Error,
            Level::Warn => Severity::Warning,
            Level::Info => Severity::Info,
            Level::Debug | Level::Trace => Severity::Debug,
        };

        let module = match record.module_path() {
            Some(path) => path.split("::").last().unwrap_or("unknown").to_string(),
            None => return,
        };

        let entry = Entry {
            module,
            severity,
            text: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(Ok(sender)) = SENDER.get().map(Mutex::lock) {
            let _ = sender.send(entry);
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static SENDER: OnceCell<Mutex<std::sync::mpsc::Sender<Entry>>> = OnceCell::new();
static LOG_PATH: OnceCell<PathBuf> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicInfo) {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let time = Local::now();

    let report = format!("Panicked at {time}: {info}\n\n{backtrace}");

    log::error!("{report}");

    // The crash report lands next to the log file so it survives the process.
    if let Some(log_path) = LOG_PATH.get() {
        let _ = std::fs::write(log_path.with_extension("crash.txt"), report);
    }
}

/// Sets up the `log` facade to write to `log_path`. Call before anything else so that
/// load-time patching failures end up somewhere visible.
pub fn init(log_path: &Path) {
    std::panic::set_hook(Box::new(panic_hook));

    let _ = LOG_PATH.set(log_path.to_path_buf());

    static LOGGER: Logger = Logger;

    if log::set_logger(&LOGGER).is_err() {
        // Somebody (probably a test harness) beat us to it; keep theirs.
        return;
    }

    log::set_max_level(log::LevelFilter::max());

    let (sender, receiver) = std::sync::mpsc::channel();

    if SENDER.set(Mutex::new(sender)).is_err() {
        log::warn!("Log sender already exists.");
        return;
    }

    // The UDP mirror only exists in debug builds, and only when an address to send to
    // has been given.
    #[cfg(feature = "debug")]
    let socket = std::env::var("GRAFT_LOG_ADDR").ok().and_then(|addr| {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .ok()
            .map(|socket| (socket, addr))
    });

    let mut file = match File::create(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Unable to create log file: {err}");
            return;
        }
    };

    // Receive entries on a background thread so normal engine code never blocks on
    // file or socket writes.
    std::thread::spawn(move || loop {
        let entry = match receiver.recv() {
            Ok(entry) => entry,
            Err(_) => break,
        };

        entry.write_to_file(&mut file);

        #[cfg(feature = "debug")]
        if let Some((socket, addr)) = &socket {
            if let Some(frame) = entry.pack() {
                let _ = socket.send_to(&frame, addr.as_str());
            }
        }
    });
}
