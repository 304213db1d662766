//! Process-wide diagnostic sink.
//!
//! The engine reports everything through the `log` facade. An embedding
//! application that wants those diagnostics installs a single function with
//! [`setup_logging_function`]; without one, the records go nowhere.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Forwards formatted log records to a caller-supplied function.
struct SinkLogger<F> {
    sink: F,
    level: LevelFilter,
}

impl<F> Log for SinkLogger<F>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        (self.sink)(&format_record(record));
    }

    fn flush(&self) {}
}

fn format_record(record: &Record<'_>) -> String {
    format!(
        "[{:<5}] [{}] - {}",
        record.level(),
        record.target(),
        record.args()
    )
}

/// Install the process-wide logging function at `Debug` level.
///
/// Can only succeed once per process; later calls (or a logger installed by
/// someone else) return an error and leave the existing sink in place.
pub fn setup_logging_function<F>(sink: F) -> Result<(), SetLoggerError>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    install_sink(sink, LevelFilter::Debug)
}

fn install_sink<F>(
    sink: F,
    level: LevelFilter,
) -> Result<(), SetLoggerError>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    log::set_boxed_logger(Box::new(SinkLogger { sink, level }))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_sink_receives_formatted_records_once_installed() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = lines.clone();

        setup_logging_function(move |line| captured.lock().unwrap().push(line.to_string()))
            .expect("first install succeeds");

        log::info!(target: "Call/Test", "negotiated path {}", 3);
        log::trace!(target: "Call/Test", "below the sink level");

        // Only one sink per process.
        assert!(setup_logging_function(|_| {}).is_err());

        let lines = lines.lock().unwrap();
        let ours: Vec<&String> = lines.iter().filter(|l| l.contains("Call/Test")).collect();
        assert_eq!(ours.len(), 1);
        assert!(ours[0].contains("INFO"));
        assert!(ours[0].ends_with("negotiated path 3"));
    }
}
