//! # Export Pipeline Module
//!
//! Persists flushed exercise data as CSV and bundles a finished test into a
//! single zip archive.
//!
//! ## Architecture
//! - **ExportPipeline**: handle owned by the lifecycle controller
//! - **Writer Thread**: dedicated thread doing all blocking file I/O
//! - **Jobs**: each job carries a completion channel, so callers await the
//!   outcome of every write instead of firing and forgetting
//!
//! ## Layout
//! ```text
//! <data_dir>/
//! └── <test_id>/
//!     ├── <exercise_type>_<exercise_name>.csv
//!     ├── ...
//!     └── test_data.zip
//! ```
//!
//! Files are written to a `.tmp` sibling and renamed into place, so a path is
//! only ever observed complete. A failed write removes its `.tmp` file.

use crate::error::ExportError;
use crate::session::Exercise;
use crate::units::ConvertedRow;
use chrono::SecondsFormat;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::oneshot;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARCHIVE_FILE_NAME: &str = "test_data.zip";

type Reply = oneshot::Sender<Result<PathBuf, ExportError>>;

/// Job sent from async callers to the writer thread
#[derive(Debug)]
enum ExportCommand {
    /// Write one exercise's converted rows to its CSV
    WriteExercise {
        test_id: String,
        exercise: Exercise,
        rows: Vec<ConvertedRow>,
        reply: Reply,
    },
    /// Zip the listed CSVs into the test's archive
    BuildArchive {
        test_id: String,
        files: Vec<PathBuf>,
        reply: Reply,
    },
    Stop,
}

/// Escape `raw` into a single path component.
///
/// Separators, `%` and control characters are percent-encoded and the names
/// `""`, `.` and `..` get fixed spellings, so distinct ids never share a file.
pub fn safe_file_stem(raw: &str) -> String {
    match raw {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }

    let mut stem = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '/' | '\\' | '%') || c.is_control() {
            stem.push_str(&format!("%{:02X}", c as u32));
        } else {
            stem.push(c);
        }
    }
    stem
}

pub fn test_dir(data_dir: &Path, test_id: &str) -> PathBuf {
    data_dir.join(safe_file_stem(test_id))
}

pub fn exercise_csv_path(data_dir: &Path, test_id: &str, exercise: &Exercise) -> PathBuf {
    test_dir(data_dir, test_id).join(format!("{}.csv", safe_file_stem(&exercise.key())))
}

pub fn archive_file_path(data_dir: &Path, test_id: &str) -> PathBuf {
    test_dir(data_dir, test_id).join(ARCHIVE_FILE_NAME)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Run `write` against the `.tmp` sibling of `path`, then rename it into place.
fn publish<T>(path: &Path, write: impl FnOnce(&Path) -> Result<T, ExportError>) -> Result<T, ExportError> {
    let tmp = tmp_sibling(path);
    let result = write(&tmp).and_then(|value| {
        fs::rename(&tmp, path)?;
        Ok(value)
    });

    if result.is_err() && tmp.is_file() {
        if let Err(e) = fs::remove_file(&tmp) {
            log::warn!("Could not remove {}: {}", tmp.display(), e);
        }
    }
    result
}

/// Write `rows` to `path`, replacing any earlier export of the same exercise.
///
/// Columns: accelerometer, gyroscope, magnetometer (only when some row has
/// one), battery, timestamp, then the exercise metadata.
pub fn write_csv(rows: &[ConvertedRow], exercise: &Exercise, path: &Path) -> Result<(), ExportError> {
    publish(path, |tmp| write_rows(rows, exercise, tmp))
}

fn write_rows(rows: &[ConvertedRow], exercise: &Exercise, tmp: &Path) -> Result<(), ExportError> {
    let with_mag = rows.iter().any(|r| r.mag.is_some());
    let mut writer = csv::Writer::from_path(tmp)?;

    let mut header = vec!["accX", "accY", "accZ", "gyrX", "gyrY", "gyrZ"];
    if with_mag {
        header.extend(["magX", "magY", "magZ"]);
    }
    header.extend(["battery", "timestamp", "exercise_type", "exercise_name"]);
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.acc.x.to_string(),
            row.acc.y.to_string(),
            row.acc.z.to_string(),
            row.gyr.x.to_string(),
            row.gyr.y.to_string(),
            row.gyr.z.to_string(),
        ];
        if with_mag {
            let mag = row.mag.unwrap_or_default();
            record.extend([mag.x.to_string(), mag.y.to_string(), mag.z.to_string()]);
        }
        record.push(row.battery.to_string());
        record.push(row.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));
        record.push(exercise.kind.clone());
        record.push(exercise.name.clone());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Bundle `files` into a zip at `archive_path`, one flat entry per file.
///
/// Files missing on disk are skipped with a warning. Returns the number of
/// entries written.
pub fn build_archive(files: &[PathBuf], archive_path: &Path) -> Result<usize, ExportError> {
    publish(archive_path, |tmp| write_archive(files, tmp))
}

fn write_archive(files: &[PathBuf], tmp: &Path) -> Result<usize, ExportError> {
    let mut zip = ZipWriter::new(File::create(tmp)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut seen = HashSet::new();
    for file in files {
        let Some(entry_name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        let mut source = match File::open(file) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Skipping missing export {} while archiving", file.display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if !seen.insert(entry_name.clone()) {
            log::warn!("Duplicate archive entry {}, keeping the first", entry_name);
            continue;
        }

        zip.start_file(entry_name, options)?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish()?;
    Ok(seen.len())
}

/// Handle to the background export writer
///
/// All blocking disk work runs on one writer thread so the async device and
/// request tasks never stall on file I/O.
pub struct ExportPipeline {
    data_dir: PathBuf,
    command_tx: Sender<ExportCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl ExportPipeline {
    /// Spawn the writer thread rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let (command_tx, command_rx) = unbounded();
        let writer_dir = data_dir.clone();

        let writer_thread = thread::spawn(move || {
            Self::writer_loop(command_rx, writer_dir);
        });

        Self {
            data_dir,
            command_tx,
            writer_thread: Some(writer_thread),
        }
    }

    /// Convert-and-persist step of a flush. Resolves once the CSV is in place.
    pub async fn write_exercise(
        &self,
        test_id: &str,
        exercise: &Exercise,
        rows: Vec<ConvertedRow>,
    ) -> Result<PathBuf, ExportError> {
        let (reply, done) = oneshot::channel();
        self.submit(ExportCommand::WriteExercise {
            test_id: test_id.to_string(),
            exercise: exercise.clone(),
            rows,
            reply,
        })?;
        done.await.map_err(|_| ExportError::WorkerUnavailable)?
    }

    /// Package the given CSVs into the test's archive.
    pub async fn build_archive(&self, test_id: &str, files: Vec<PathBuf>) -> Result<PathBuf, ExportError> {
        let (reply, done) = oneshot::channel();
        self.submit(ExportCommand::BuildArchive {
            test_id: test_id.to_string(),
            files,
            reply,
        })?;
        done.await.map_err(|_| ExportError::WorkerUnavailable)?
    }

    pub fn archive_ready(&self, test_id: &str) -> bool {
        archive_file_path(&self.data_dir, test_id).is_file()
    }

    pub fn archive_path(&self, test_id: &str) -> Option<PathBuf> {
        self.archive_ready(test_id)
            .then(|| archive_file_path(&self.data_dir, test_id))
    }

    fn submit(&self, command: ExportCommand) -> Result<(), ExportError> {
        self.command_tx
            .send(command)
            .map_err(|_| ExportError::WorkerUnavailable)
    }

    fn ensure_test_dir(data_dir: &Path, test_id: &str) -> Result<PathBuf, ExportError> {
        let dir = test_dir(data_dir, test_id);
        fs::create_dir_all(&dir).map_err(|source| ExportError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    fn handle_write(
        data_dir: &Path,
        test_id: &str,
        exercise: &Exercise,
        rows: &[ConvertedRow],
    ) -> Result<PathBuf, ExportError> {
        Self::ensure_test_dir(data_dir, test_id)?;
        let path = exercise_csv_path(data_dir, test_id, exercise);
        write_csv(rows, exercise, &path)?;
        log::info!("Wrote {} rows for {} to {}", rows.len(), exercise.key(), path.display());
        Ok(path)
    }

    fn handle_archive(data_dir: &Path, test_id: &str, files: &[PathBuf]) -> Result<PathBuf, ExportError> {
        Self::ensure_test_dir(data_dir, test_id)?;
        let path = archive_file_path(data_dir, test_id);
        let entries = build_archive(files, &path)?;
        log::info!("Archived {} exercise files for test {} at {}", entries, test_id, path.display());
        Ok(path)
    }

    /// Writer thread loop
    ///
    /// Processes jobs in submission order and reports each result back
    /// through the job's completion channel.
    fn writer_loop(command_rx: Receiver<ExportCommand>, data_dir: PathBuf) {
        loop {
            match command_rx.recv() {
                Ok(ExportCommand::WriteExercise {
                    test_id,
                    exercise,
                    rows,
                    reply,
                }) => {
                    let result = Self::handle_write(&data_dir, &test_id, &exercise, &rows);
                    if let Err(e) = &result {
                        log::error!("Failed to export {} for test {}: {}", exercise.key(), test_id, e);
                    }
                    let _ = reply.send(result);
                }
                Ok(ExportCommand::BuildArchive { test_id, files, reply }) => {
                    let result = Self::handle_archive(&data_dir, &test_id, &files);
                    if let Err(e) = &result {
                        log::error!("Failed to archive test {}: {}", test_id, e);
                    }
                    let _ = reply.send(result);
                }
                Ok(ExportCommand::Stop) => {
                    log::info!("Export writer stopped");
                    break;
                }
                Err(_) => {
                    log::info!("Export writer: command channel closed");
                    break;
                }
            }
        }
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        let _ = self.command_tx.send(ExportCommand::Stop);

        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Vector3;
    use chrono::{TimeZone, Utc};
    use std::io::Read;
    use tempfile::tempdir;

    fn row(acc_x: f64, mag: Option<Vector3>) -> ConvertedRow {
        ConvertedRow {
            acc: Vector3::new(acc_x, 0.0, 9.5),
            gyr: Vector3::new(0.0, 0.25, 0.0),
            mag,
            battery: 55,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn squat() -> Exercise {
        Exercise::new("strength", "squat")
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("balance_left"), "balance_left");
        assert_eq!(safe_file_stem("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_eq!(safe_file_stem("a\\b"), "a%5Cb");
        assert_eq!(safe_file_stem(".."), "%2E%2E");
        assert_eq!(safe_file_stem(""), "%");
    }

    #[test]
    fn test_distinct_ids_get_distinct_dirs() {
        let ids = ["a/b", "a_b", "a%2Fb", "a\\b", ".", "%2E", "", "%"];
        let stems: HashSet<String> = ids.iter().map(|id| safe_file_stem(id)).collect();
        assert_eq!(stems.len(), ids.len());
        assert!(stems.iter().all(|stem| !stem.contains('/') && !stem.contains('\\')));

        let root = Path::new("/data");
        assert_ne!(test_dir(root, "a/b"), test_dir(root, "a_b"));
        assert_eq!(test_dir(root, "a/b").parent(), Some(root));
    }

    #[test]
    fn test_write_csv_column_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strength_squat.csv");

        write_csv(&[row(1.5, None)], &squat(), &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "accX,accY,accZ,gyrX,gyrY,gyrZ,battery,timestamp,exercise_type,exercise_name"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1.5,0,9.5,0,0.25,0,55,2024-03-01T12:00:00.000000Z,strength,squat"
        );
        assert!(lines.next().is_none());
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_write_csv_magnetometer_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let rows = [row(1.0, Some(Vector3::new(20.0, -3.0, 1.0))), row(2.0, None)];
        write_csv(&rows, &squat(), &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("accX,accY,accZ,gyrX,gyrY,gyrZ,magX,magY,magZ,battery"));
        assert!(lines[1].starts_with("1,0,9.5,0,0.25,0,20,-3,1,55,"));
        assert!(lines[2].starts_with("2,0,9.5,0,0.25,0,0,0,0,55,"));
    }

    #[test]
    fn test_write_csv_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");

        write_csv(&[row(1.0, None), row(2.0, None)], &squat(), &path).unwrap();
        write_csv(&[row(3.0, None)], &squat(), &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\n3,"));
    }

    #[test]
    fn test_failed_csv_write_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        // A directory where the CSV should go makes the final rename fail
        let path = dir.path().join("strength_squat.csv");
        fs::create_dir(&path).unwrap();

        assert!(write_csv(&[row(1.0, None)], &squat(), &path).is_err());
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_failed_archive_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let unreadable = dir.path().join("not_a_csv");
        fs::create_dir(&unreadable).unwrap();

        let archive = dir.path().join(ARCHIVE_FILE_NAME);
        assert!(build_archive(&[unreadable], &archive).is_err());
        assert!(!archive.exists());
        assert!(!tmp_sibling(&archive).exists());
    }

    #[test]
    fn test_build_archive_skips_missing_files() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("a_one.csv");
        let missing = dir.path().join("b_two.csv");
        fs::write(&present, "accX\n1\n").unwrap();

        let archive = dir.path().join(ARCHIVE_FILE_NAME);
        let entries = build_archive(&[present, missing], &archive).unwrap();
        assert_eq!(entries, 1);

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut contents = String::new();
        zip.by_name("a_one.csv").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "accX\n1\n");
    }

    #[test]
    fn test_build_archive_flattens_entry_names() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("deep").join("inside");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("x_y.csv");
        fs::write(&file, "data").unwrap();

        let archive = dir.path().join("out.zip");
        build_archive(&[file], &archive).unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), "x_y.csv");
    }

    #[tokio::test]
    async fn test_pipeline_write_and_archive() {
        let dir = tempdir().unwrap();
        let pipeline = ExportPipeline::new(dir.path());

        assert!(!pipeline.archive_ready("t-1"));
        assert!(pipeline.archive_path("t-1").is_none());

        let csv = pipeline
            .write_exercise("t-1", &squat(), vec![row(1.0, None)])
            .await
            .unwrap();
        assert_eq!(csv, dir.path().join("t-1").join("strength_squat.csv"));
        assert!(csv.is_file());

        let archive = pipeline.build_archive("t-1", vec![csv]).await.unwrap();
        assert_eq!(archive, dir.path().join("t-1").join(ARCHIVE_FILE_NAME));
        assert!(pipeline.archive_ready("t-1"));
        assert_eq!(pipeline.archive_path("t-1"), Some(archive));
    }

    #[tokio::test]
    async fn test_pipeline_reports_write_failure() {
        let dir = tempdir().unwrap();
        // A plain file where the data directory should be
        let blocker = dir.path().join("data");
        fs::write(&blocker, "not a directory").unwrap();

        let pipeline = ExportPipeline::new(&blocker);
        let result = pipeline.write_exercise("t-1", &squat(), vec![row(1.0, None)]).await;
        assert!(matches!(result, Err(ExportError::CreateDir { .. })));
    }
}
