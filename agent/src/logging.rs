//! Diagnostic log sink: `env_logger` writing to a file, the debugger output
//! stream (Windows) or stderr.

use std::fs::OpenOptions;
#[cfg(windows)]
use std::io::{self, Write};

use env_logger::{Builder, Target};
use log::warn;

use crate::config::ShimConfig;

/// Install the global logger. Later calls, or a logger set up by the host,
/// win silently.
pub fn init(config: &ShimConfig) {
    let (target, file_error) = match &config.log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => (Target::Pipe(Box::new(file)), None),
            Err(e) => (default_target(), Some((path.display().to_string(), e))),
        },
        None => (default_target(), None),
    };

    let _ = Builder::new()
        .parse_filters(&config.log_filter)
        .target(target)
        .format_timestamp_millis()
        .try_init();

    if let Some((path, e)) = file_error {
        warn!("cannot open log file {}: {}", path, e);
    }
}

#[cfg(windows)]
fn default_target() -> Target {
    Target::Pipe(Box::new(DebugOutput))
}

#[cfg(not(windows))]
fn default_target() -> Target {
    Target::Stderr
}

/// Writes each record to the attached debugger via `OutputDebugStringA`.
#[cfg(windows)]
struct DebugOutput;

#[cfg(windows)]
impl Write for DebugOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let message = nul_terminated(buf);
        unsafe {
            windows_sys::Win32::System::Diagnostics::Debug::OutputDebugStringA(message.as_ptr());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy `buf` into a C string, replacing interior NULs.
#[cfg_attr(not(windows), allow(dead_code))]
fn nul_terminated(buf: &[u8]) -> Vec<u8> {
    buf.iter()
        .map(|&b| if b == 0 { b'?' } else { b })
        .chain(std::iter::once(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_strings_are_terminated() {
        assert_eq!(nul_terminated(b"hi\n"), b"hi\n\0".to_vec());
        assert_eq!(nul_terminated(b"a\0b"), b"a?b\0".to_vec());
    }

    #[test]
    fn logs_reach_the_configured_file() {
        let path = std::env::temp_dir().join(format!("dxshim-log-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = ShimConfig {
            log_filter: "debug".to_string(),
            log_file: Some(path.clone()),
            ..ShimConfig::default()
        };

        init(&config);
        log::info!("logging test line");
        log::logger().flush();

        // Nothing else in this test binary installs a logger.
        let contents = std::fs::read_to_string(&path).expect("log file");
        assert!(contents.contains("logging test line"));
        let _ = std::fs::remove_file(&path);
    }
}
