//! JSONL telemetry logger

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::events::GatewayEvent;

const FILE_PREFIX: &str = "telemetry_";
const FILE_SUFFIX: &str = ".jsonl";

/// One line of the log
#[derive(Serialize)]
struct Line<'a, T> {
    logged_at: chrono::DateTime<Utc>,
    #[serde(flatten)]
    record: &'a T,
}

/// Rotating JSONL writer
pub struct TelemetryLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    file_index: u64,
}

impl TelemetryLogger {
    /// Create the log directory and prepare the first file lazily
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        fs::create_dir_all(&config.log_dir)?;
        Ok(Self {
            dir: PathBuf::from(&config.log_dir),
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            file_index: 0,
        })
    }

    /// Append one record as a JSON line, rotating when the file is full
    pub fn log<T: Serialize>(&mut self, record: &T) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let line = Line {
            logged_at: Utc::now(),
            record,
        };

        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &line)?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Consume events until the bus closes
    pub async fn run(mut self, mut events: broadcast::Receiver<GatewayEvent>) {
        info!("Recording telemetry to {}", self.dir.display());

        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.log(&event).and_then(|_| self.flush()) {
                        warn!("Failed to write telemetry: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Telemetry logger fell behind, {} events lost", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }

        let _ = self.flush();
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let name = format!(
            "{}{}_{:04}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.file_index,
            FILE_SUFFIX
        );
        self.file_index += 1;

        let path = self.dir.join(name);
        debug!("Opening telemetry file {}", path.display());
        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.records_in_file = 0;

        self.prune()
    }

    /// Delete the oldest files beyond the retention limit
    fn prune(&self) -> Result<()> {
        let mut files = log_files(&self.dir)?;
        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in files.into_iter().take(excess) {
            debug!("Removing old telemetry file {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
        if is_log {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::imei::Imei;
    use tempfile::TempDir;

    fn config(dir: &TempDir, per_file: usize, keep: usize) -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            log_dir: dir.path().to_string_lossy().into_owned(),
            max_records_per_file: per_file,
            max_files_to_keep: keep,
        }
    }

    fn event(n: usize) -> GatewayEvent {
        GatewayEvent::TransferProgress {
            imei: Imei::parse("356307042441013").unwrap(),
            bytes_acked: n,
            total: 100,
        }
    }

    fn read_lines(dir: &TempDir) -> Vec<serde_json::Value> {
        let mut files = log_files(dir.path()).unwrap();
        files.sort();
        files
            .iter()
            .flat_map(|f| {
                fs::read_to_string(f)
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str(l).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut logger = TelemetryLogger::new(&config(&dir, 100, 10)).unwrap();

        logger.log(&event(1)).unwrap();
        logger.log(&event(2)).unwrap();
        logger.flush().unwrap();

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "transfer_progress");
        assert_eq!(lines[1]["bytes_acked"], 2);
        assert!(lines[0]["logged_at"].is_string());
    }

    #[test]
    fn test_rotation_by_record_count() {
        let dir = TempDir::new().unwrap();
        let mut logger = TelemetryLogger::new(&config(&dir, 2, 10)).unwrap();

        for n in 0..5 {
            logger.log(&event(n)).unwrap();
        }
        logger.flush().unwrap();

        assert_eq!(log_files(dir.path()).unwrap().len(), 3);
        assert_eq!(read_lines(&dir).len(), 5);
    }

    #[test]
    fn test_retention_keeps_newest_files() {
        let dir = TempDir::new().unwrap();
        let mut logger = TelemetryLogger::new(&config(&dir, 1, 2)).unwrap();

        for n in 0..5 {
            logger.log(&event(n)).unwrap();
        }
        logger.flush().unwrap();

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["bytes_acked"], 3);
        assert_eq!(lines[1]["bytes_acked"], 4);
    }

    #[test]
    fn test_foreign_files_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        let mut logger = TelemetryLogger::new(&config(&dir, 1, 1)).unwrap();

        for n in 0..3 {
            logger.log(&event(n)).unwrap();
        }

        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_run_drains_event_bus() {
        let dir = TempDir::new().unwrap();
        let logger = TelemetryLogger::new(&config(&dir, 100, 10)).unwrap();
        let bus = EventBus::new(16);
        let rx = bus.subscribe();

        bus.emit(event(7));
        drop(bus);
        logger.run(rx).await;

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["bytes_acked"], 7);
    }
}
