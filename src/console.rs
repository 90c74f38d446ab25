//! Debug terminal and diagnostic logging.
//!
//! Nothing in here is allowed to fail the proxy: a host that can't get a
//! console or a log file still gets its genuine library.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

static CONSOLE_ALLOCATED: AtomicBool = AtomicBool::new(false);

/// Allocate a Windows console.
#[cfg(all(windows, feature = "console"))]
pub fn alloc_console() -> Result<(), windows::core::Error> {
    use windows::Win32::System::Console::AllocConsole;

    if !CONSOLE_ALLOCATED.swap(true, Ordering::SeqCst) {
        if let Err(e) = unsafe { AllocConsole() } {
            CONSOLE_ALLOCATED.store(false, Ordering::SeqCst);
            return Err(e);
        }
    }

    Ok(())
}

/// Enable ANSI colors if the console is allocated.
#[cfg(all(windows, feature = "console"))]
pub fn enable_console_colors() -> Result<(), windows::core::Error> {
    use windows::Win32::System::Console::{
        GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_OUTPUT_HANDLE,
    };

    if CONSOLE_ALLOCATED.load(Ordering::SeqCst) {
        unsafe {
            let stdout_handle = GetStdHandle(STD_OUTPUT_HANDLE)?;

            let mut current_console_mode = CONSOLE_MODE(0);
            GetConsoleMode(stdout_handle, &mut current_console_mode)?;

            // ANSI escape sequences
            current_console_mode.0 |= ENABLE_VIRTUAL_TERMINAL_PROCESSING.0;

            SetConsoleMode(stdout_handle, current_console_mode)?;
        }
    }

    Ok(())
}

/// Free the previously allocated Windows console.
#[cfg(all(windows, feature = "console"))]
pub fn free_console() -> Result<(), windows::core::Error> {
    use windows::Win32::System::Console::FreeConsole;

    if CONSOLE_ALLOCATED.swap(false, Ordering::SeqCst) {
        unsafe { FreeConsole()? };
    }

    Ok(())
}

/// Whether this module allocated a console.
pub fn console_allocated() -> bool {
    CONSOLE_ALLOCATED.load(Ordering::SeqCst)
}

/// Install the global `tracing` subscriber: stdout, plus `log_file` if any.
///
/// The filter comes from [`Config::log_filter`]. Returns `false` if a
/// subscriber was already installed.
pub fn init_tracing(config: &Config, log_file: Option<PathBuf>) -> bool {
    let log_file = log_file.and_then(|path| match File::create(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("couldn't create log file {path:?}: {e}");
            None
        },
    });

    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?}: {e}", config.log_filter);
        EnvFilter::new("info")
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer().event_format(
                fmt::format()
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_names(true),
            ),
        )
        .with(log_file.map(|log_file| {
            fmt::layer()
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
        }))
        .with(filter)
        .try_init()
        .is_ok()
}

/// Attach a console and start logging to it and to `log_file`.
///
/// Failures are reported and swallowed.
pub fn open_debug_terminal(config: &Config, log_file: Option<PathBuf>) {
    #[cfg(all(windows, feature = "console"))]
    {
        if let Err(e) = alloc_console() {
            eprintln!("couldn't allocate console: {e:?}");
        } else if let Err(e) = enable_console_colors() {
            eprintln!("couldn't enable console colors: {e:?}");
        }
    }

    if !init_tracing(config, log_file) {
        error!("a tracing subscriber is already installed, keeping it");
    }
}
