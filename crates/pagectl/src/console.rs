//! Defines the console that logs to stderr.

use std::io::{self, Write};

use log::LevelFilter;
use spin::{Mutex, Once};

pub struct Console {
    sink: Mutex<Box<dyn Write + Send>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Installs the default console as the global logger, `verbose` levels above and
    /// `quiet` levels below the build's default.
    pub fn init(verbose: u8, quiet: u8) -> &'static Self {
        let console = Self::default();
        let level = adjust_level(default_level(), verbose, quiet);
        if let Err(err) = console.install(level) {
            eprintln!("pagectl: logging unavailable: {err}");
        }
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            sink: Mutex::new(Box::new(io::stderr())),
        })
    }

    pub fn install(&'static self, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut sink = self.sink.lock();
        // Nowhere left to report a failing stderr.
        let _ = write_log_entry_to(&mut *sink, record);
    }

    fn flush(&self) {
        let _ = self.sink.lock().flush();
    }
}

fn default_level() -> LevelFilter {
    #[cfg(debug_assertions)]
    return LevelFilter::Trace;

    #[cfg(not(debug_assertions))]
    return LevelFilter::Info;
}

const LEVELS: [LevelFilter; 6] = [
    LevelFilter::Off,
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

fn adjust_level(base: LevelFilter, verbose: u8, quiet: u8) -> LevelFilter {
    let index = base as usize + usize::from(verbose);
    let index = index.saturating_sub(usize::from(quiet));
    LEVELS[index.min(LEVELS.len() - 1)]
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> io::Result<()> {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
