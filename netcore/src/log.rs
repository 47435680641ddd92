// Driver Logging Front-End
//
// Origin-tagged, multi-level logging for the packet core. Every module
// declares a `LOG_ORIGIN` tag and logs through the `log_*!` macros below,
// which forward to the `log` facade. The embedding kernel installs the
// actual sink (serial port, VGA console, ring buffer) as a `log::Log`.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error)
// - Attach the subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Map the runtime level filter onto `log::set_max_level`
//
// Correctness and safety notes:
// - Interrupt-context entry points never log; a sink may take locks or
//   poll a UART, neither of which belongs in a top half
// - Filtering happens before formatting, so disabled levels cost one load

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }

    const fn to_facade(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

pub fn set_level(level: LogLevel) {
    log::set_max_level(level.to_facade().to_level_filter());
}

pub fn get_level() -> LogLevel {
    match log::max_level() {
        log::LevelFilter::Off | log::LevelFilter::Error => LogLevel::Error,
        log::LevelFilter::Warn => LogLevel::Warn,
        log::LevelFilter::Info => LogLevel::Info,
        log::LevelFilter::Debug | log::LevelFilter::Trace => LogLevel::Debug,
    }
}

#[doc(hidden)]
pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    let facade = level.to_facade();
    if facade > log::max_level() {
        return;
    }

    if level == LogLevel::Debug {
        log::log!(target: origin, facade, "[{}] {} ({}:{})", origin, args, file, line);
    } else {
        log::log!(target: origin, facade, "[{}] {}", origin, args);
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}
