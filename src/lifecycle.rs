//! # Exercise Lifecycle Module
//!
//! Drives each test through start test → end exercise → … → end test.
//!
//! ## Flush
//! Both transitions flush the same way:
//! 1. snapshot the current exercise and its pending samples
//! 2. convert the snapshot to SI units
//! 3. write the CSV through the export pipeline and await the result
//! 4. only on success, drain exactly the snapshotted samples and record the
//!    file under the exercise key
//!
//! A failed write leaves the session as it was, so the caller can retry.
//! Samples that arrive while the write is in flight stay pending and belong
//! to the next exercise.
//!
//! `end test` commits nothing until the archive is built as well. A failure
//! at either step reopens the session with its whole buffer, including
//! whatever arrived during the attempt, and the retry rewrites the last CSV
//! from all of it.

use crate::error::SessionError;
use crate::export::ExportPipeline;
use crate::session::{
    CreateOutcome, Exercise, NewTest, SessionEntry, SessionSnapshot, SessionState, SessionStore, TestSession,
};
use crate::units::convert_samples;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartTestResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndExerciseResponse {
    pub status: &'static str,
    pub message: String,
    pub exercise_key: String,
    /// `None` when the exercise had no data and no file was written
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndTestResponse {
    pub status: &'static str,
    pub message: String,
    pub archive_path: PathBuf,
}

/// A written-but-not-yet-published flush
struct StagedFlush {
    exercise: Exercise,
    flushed: usize,
    path: Option<PathBuf>,
}

impl StagedFlush {
    fn commit(&self, session: &mut TestSession) {
        if let Some(path) = &self.path {
            session.commit_flush(self.flushed, self.exercise.key(), path.clone());
        }
    }
}

pub struct LifecycleController {
    store: Arc<SessionStore>,
    exporter: ExportPipeline,
}

impl LifecycleController {
    pub fn new(store: Arc<SessionStore>, exporter: ExportPipeline) -> Self {
        Self { store, exporter }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn start_test(&self, request: NewTest) -> StartTestResponse {
        let test_id = request.test_id.clone();

        match self.store.create_test(request) {
            CreateOutcome::Created(snapshot) => {
                log::info!(
                    "Started test {} with exercise {}",
                    test_id,
                    snapshot.current_exercise.key()
                );
                StartTestResponse {
                    status: "started",
                    message: format!("Test {} started", test_id),
                }
            }
            CreateOutcome::AlreadyExists(_) => {
                log::debug!("Test {} already started", test_id);
                StartTestResponse {
                    status: "already_started",
                    message: format!("Test {} already started", test_id),
                }
            }
        }
    }

    /// Close the current exercise and start recording `next`.
    pub async fn end_exercise(&self, test_id: &str, next: Exercise) -> Result<EndExerciseResponse, SessionError> {
        let entry = self.store.entry(test_id)?;
        let _transition = entry.transition.lock().await;

        let staged = self.stage_flush(test_id, &entry).await?;

        {
            let mut session = entry.lock();
            staged.commit(&mut session);
            session.current_exercise = next;
        }

        let closed = staged.exercise;
        log::info!("Test {}: exercise {} completed", test_id, closed.key());

        Ok(EndExerciseResponse {
            status: "exercise_completed",
            message: format!("Exercise {} completed", closed.name),
            exercise_key: closed.key(),
            csv_path: staged.path,
        })
    }

    /// Flush the last exercise, archive every exported CSV and close the test.
    pub async fn end_test(&self, test_id: &str) -> Result<EndTestResponse, SessionError> {
        let entry = self.store.entry(test_id)?;
        let _transition = entry.transition.lock().await;

        {
            let mut session = entry.lock();
            if !session.is_open() {
                return Err(SessionError::Closed(test_id.to_string()));
            }
            session.begin_close();
        }

        match self.finish(test_id, &entry).await {
            Ok(archive_path) => {
                log::info!("Test {} completed, archive at {}", test_id, archive_path.display());
                Ok(EndTestResponse {
                    status: "test_completed",
                    message: format!("Test {} completed", test_id),
                    archive_path,
                })
            }
            Err(e) => {
                entry.lock().reopen();
                log::warn!("Test {} reopened after failed end: {}", test_id, e);
                Err(e)
            }
        }
    }

    /// Final flush plus archive. The session is only touched once both succeed.
    async fn finish(&self, test_id: &str, entry: &SessionEntry) -> Result<PathBuf, SessionError> {
        let staged = self.stage_flush(test_id, entry).await?;

        let files: Vec<PathBuf> = {
            let session = entry.lock();
            let mut completed = session.completed.clone();
            if let Some(path) = &staged.path {
                completed.insert(staged.exercise.key(), path.clone());
            }
            completed.into_values().collect()
        };

        let archive_path = self.exporter.build_archive(test_id, files).await?;

        let late = {
            let mut session = entry.lock();
            staged.commit(&mut session);
            session.close(archive_path.clone())
        };
        if late > 0 {
            log::warn!("Test {}: dropped {} sample(s) received after the final flush", test_id, late);
        }

        Ok(archive_path)
    }

    /// Write the pending buffer for the current exercise without publishing it.
    async fn stage_flush(&self, test_id: &str, entry: &SessionEntry) -> Result<StagedFlush, SessionError> {
        let (exercise, samples) = {
            let session = entry.lock();
            if session.state == SessionState::Closed {
                return Err(SessionError::Closed(test_id.to_string()));
            }
            session.pending_snapshot()
        };

        if samples.is_empty() {
            log::debug!("Test {}: no data for {}, nothing to write", test_id, exercise.key());
            return Ok(StagedFlush {
                exercise,
                flushed: 0,
                path: None,
            });
        }

        let rows = convert_samples(&samples);
        let path = self.exporter.write_exercise(test_id, &exercise, rows).await?;

        Ok(StagedFlush {
            exercise,
            flushed: samples.len(),
            path: Some(path),
        })
    }

    /// Where the finished archive for `test_id` lives.
    ///
    /// Tests released from the store are still resolved from disk.
    pub fn archive_location(&self, test_id: &str) -> Result<PathBuf, SessionError> {
        let not_found = || SessionError::NotFound(test_id.to_string());

        let tracked = match self.store.entry(test_id) {
            Ok(entry) => {
                let archive_path = entry.lock().archive_path.clone();
                Some(archive_path)
            }
            Err(_) => None,
        };

        match tracked {
            Some(archive_path) => archive_path.ok_or_else(not_found),
            None => self.exporter.archive_path(test_id).ok_or_else(not_found),
        }
    }

    /// Whether `test_id` has a finished archive to hand out.
    pub fn archive_ready(&self, test_id: &str) -> bool {
        self.archive_location(test_id).is_ok_and(|path| path.is_file())
    }

    pub fn session_snapshot(&self, test_id: &str) -> Result<SessionSnapshot, SessionError> {
        self.store.get_session(test_id)
    }

    /// Forget a test once its archive has been handed off.
    pub fn release_test(&self, test_id: &str) -> Result<(), SessionError> {
        self.store.close_test(test_id)?;
        log::info!("Released test {}", test_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Sample, Vector3};
    use chrono::Utc;
    use std::fs::{self, File};
    use std::io::Read;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn controller() -> (TempDir, LifecycleController) {
        let dir = tempdir().unwrap();
        let controller = LifecycleController::new(
            Arc::new(SessionStore::new()),
            ExportPipeline::new(dir.path()),
        );
        (dir, controller)
    }

    fn new_test(test_id: &str, kind: &str, name: &str) -> NewTest {
        NewTest {
            test_id: test_id.to_string(),
            user_id: "user-7".to_string(),
            tester_id: "tester-3".to_string(),
            exercise: Exercise::new(kind, name),
            devices: Vec::new(),
        }
    }

    fn sample(acc_x: f64, gyr_x: f64) -> Sample {
        Sample {
            acc: Vector3::new(acc_x, 0.0, 0.0),
            gyr: Vector3::new(gyr_x, 0.0, 0.0),
            mag: None,
            battery: 90,
            timestamp: Utc::now(),
        }
    }

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.records().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_start_test_twice_is_idempotent() {
        let (_dir, controller) = controller();

        let first = controller.start_test(new_test("t1", "balance", "left"));
        let second = controller.start_test(new_test("t1", "gait", "walk"));

        assert_eq!(first.status, "started");
        assert_eq!(second.status, "already_started");
        assert_eq!(
            controller.session_snapshot("t1").unwrap().current_exercise,
            Exercise::new("balance", "left")
        );
    }

    #[tokio::test]
    async fn test_end_exercise_flushes_current_exercise() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "balance", "left"));
        controller.store().append_sample("AA", sample(1.0, 180.0));
        controller.store().append_sample("AA", sample(2.0, 90.0));

        let response = controller
            .end_exercise("t1", Exercise::new("balance", "right"))
            .await
            .unwrap();

        assert_eq!(response.status, "exercise_completed");
        assert_eq!(response.exercise_key, "balance_left");
        let csv_path = dir.path().join("t1").join("balance_left.csv");
        assert_eq!(response.csv_path, Some(csv_path.clone()));

        let rows = read_rows(&csv_path);
        assert_eq!(rows.len(), 2);
        let acc_x: f64 = rows[0][0].parse().unwrap();
        let gyr_x: f64 = rows[0][3].parse().unwrap();
        assert!((acc_x - 9.80665).abs() < 1e-9);
        assert!((gyr_x - std::f64::consts::PI).abs() < 1e-9);
        assert_eq!(&rows[1][8], "balance");
        assert_eq!(&rows[1][9], "left");

        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.pending_samples, 0);
        assert_eq!(snapshot.current_exercise, Exercise::new("balance", "right"));
        assert_eq!(snapshot.completed_exercises.get("balance_left"), Some(&csv_path));
    }

    #[tokio::test]
    async fn test_end_exercise_without_data_writes_nothing() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "balance", "left"));

        let response = controller
            .end_exercise("t1", Exercise::new("gait", "walk"))
            .await
            .unwrap();

        assert_eq!(response.exercise_key, "balance_left");
        assert_eq!(response.csv_path, None);
        assert!(!dir.path().join("t1").join("balance_left.csv").exists());

        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.current_exercise, Exercise::new("gait", "walk"));
        assert!(snapshot.completed_exercises.is_empty());
    }

    #[tokio::test]
    async fn test_end_test_archives_each_exercise() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        controller.store().append_sample("AA", sample(1.0, 0.0));

        controller.end_exercise("t1", Exercise::new("B", "two")).await.unwrap();
        controller.store().append_sample("AA", sample(2.0, 0.0));
        controller.store().append_sample("AA", sample(3.0, 0.0));

        let response = controller.end_test("t1").await.unwrap();
        assert_eq!(response.status, "test_completed");
        assert_eq!(response.archive_path, dir.path().join("t1").join("test_data.zip"));

        let mut zip = zip::ZipArchive::new(File::open(&response.archive_path).unwrap()).unwrap();
        let mut names: Vec<String> = zip.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(names, vec!["A_one.csv", "B_two.csv"]);

        let mut b = String::new();
        zip.by_name("B_two.csv").unwrap().read_to_string(&mut b).unwrap();
        let b_rows: Vec<&str> = b.lines().skip(1).collect();
        assert_eq!(b_rows.len(), 2);
        assert!(b_rows.iter().all(|line| line.ends_with(",B,two")));

        let mut a = String::new();
        zip.by_name("A_one.csv").unwrap().read_to_string(&mut a).unwrap();
        assert_eq!(a.lines().count(), 2);
        assert!(a.lines().nth(1).unwrap().ends_with(",A,one"));

        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.state, SessionState::Closed);
        assert_eq!(snapshot.archive_path, Some(response.archive_path.clone()));
        assert!(snapshot.end_time.is_some());
        assert_eq!(controller.archive_location("t1").unwrap(), response.archive_path);
    }

    #[tokio::test]
    async fn test_archive_skips_missing_exercise_file() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        controller.store().append_sample("AA", sample(1.0, 0.0));
        controller.end_exercise("t1", Exercise::new("B", "two")).await.unwrap();
        controller.store().append_sample("AA", sample(2.0, 0.0));

        fs::remove_file(dir.path().join("t1").join("A_one.csv")).unwrap();

        let response = controller.end_test("t1").await.unwrap();
        let zip = zip::ZipArchive::new(File::open(&response.archive_path).unwrap()).unwrap();
        let names: Vec<&str> = zip.file_names().collect();
        assert_eq!(names, vec!["B_two.csv"]);
    }

    #[tokio::test]
    async fn test_repeated_exercise_replaces_export() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        controller.store().append_sample("AA", sample(1.0, 0.0));
        controller.store().append_sample("AA", sample(1.0, 0.0));
        controller.end_exercise("t1", Exercise::new("B", "two")).await.unwrap();
        controller.store().append_sample("AA", sample(2.0, 0.0));
        controller.end_exercise("t1", Exercise::new("A", "one")).await.unwrap();
        controller.store().append_sample("AA", sample(5.0, 0.0));

        controller.end_test("t1").await.unwrap();

        let rows = read_rows(&dir.path().join("t1").join("A_one.csv"));
        assert_eq!(rows.len(), 1);
        let acc_x: f64 = rows[0][0].parse().unwrap();
        assert!((acc_x - 5.0 * 9.80665).abs() < 1e-9);
        assert_eq!(controller.session_snapshot("t1").unwrap().completed_exercises.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_test_reports_not_found() {
        let (_dir, controller) = controller();

        let end_exercise = controller.end_exercise("ghost", Exercise::new("a", "b")).await;
        assert!(matches!(end_exercise, Err(SessionError::NotFound(_))));
        assert!(matches!(controller.end_test("ghost").await, Err(SessionError::NotFound(_))));
        assert!(matches!(controller.archive_location("ghost"), Err(SessionError::NotFound(_))));
        assert!(matches!(controller.session_snapshot("ghost"), Err(SessionError::NotFound(_))));
        assert!(matches!(controller.release_test("ghost"), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_closed_test_rejects_transitions_and_samples() {
        let (_dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        controller.end_test("t1").await.unwrap();

        assert_eq!(controller.store().append_sample("AA", sample(1.0, 0.0)), 0);
        assert!(matches!(
            controller.end_exercise("t1", Exercise::new("B", "two")).await,
            Err(SessionError::Closed(_))
        ));
        assert!(matches!(controller.end_test("t1").await, Err(SessionError::Closed(_))));
        assert_eq!(controller.start_test(new_test("t1", "A", "one")).status, "already_started");
    }

    #[tokio::test]
    async fn test_archive_location_before_end_is_not_found() {
        let (_dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        assert!(!controller.archive_ready("t1"));
        assert!(matches!(controller.archive_location("t1"), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_released_test_archive_still_resolves() {
        let (_dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        controller.store().append_sample("AA", sample(1.0, 0.0));
        let archive = controller.end_test("t1").await.unwrap().archive_path;

        controller.release_test("t1").unwrap();
        assert!(controller.session_snapshot("t1").is_err());
        assert_eq!(controller.archive_location("t1").unwrap(), archive);
        assert!(controller.archive_ready("t1"));
    }

    #[tokio::test]
    async fn test_export_failure_keeps_buffer() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("data");
        fs::write(&blocker, "not a directory").unwrap();
        let controller = LifecycleController::new(Arc::new(SessionStore::new()), ExportPipeline::new(&blocker));

        controller.start_test(new_test("t1", "A", "one"));
        controller.store().append_sample("AA", sample(1.0, 0.0));

        let result = controller.end_exercise("t1", Exercise::new("B", "two")).await;
        assert!(matches!(result, Err(SessionError::Export(_))));

        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.pending_samples, 1);
        assert_eq!(snapshot.current_exercise, Exercise::new("A", "one"));
        assert!(snapshot.completed_exercises.is_empty());

        assert!(matches!(controller.end_test("t1").await, Err(SessionError::Export(_))));
        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.state, SessionState::Open);
        assert_eq!(snapshot.pending_samples, 1);
    }

    fn block_archive(dir: &Path, test_id: &str) -> std::path::PathBuf {
        let blocker = dir.join(test_id).join("test_data.zip.tmp");
        fs::create_dir_all(&blocker).unwrap();
        blocker
    }

    fn archived_rows(archive: &Path, entry: &str) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let mut contents = String::new();
        zip.by_name(entry).unwrap().read_to_string(&mut contents).unwrap();
        contents.lines().skip(1).map(String::from).collect()
    }

    #[tokio::test]
    async fn test_end_test_retry_after_archive_failure_keeps_every_sample() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        for i in 0..3 {
            controller.store().append_sample("AA", sample(i as f64, 0.0));
        }
        let blocker = block_archive(dir.path(), "t1");

        assert!(matches!(controller.end_test("t1").await, Err(SessionError::Export(_))));
        let snapshot = controller.session_snapshot("t1").unwrap();
        assert_eq!(snapshot.state, SessionState::Open);
        assert_eq!(snapshot.pending_samples, 3);
        assert!(snapshot.completed_exercises.is_empty());

        for i in 3..5 {
            controller.store().append_sample("AA", sample(i as f64, 0.0));
        }
        fs::remove_dir(&blocker).unwrap();

        let response = controller.end_test("t1").await.unwrap();
        let rows = archived_rows(&response.archive_path, "A_one.csv");
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            let acc_x: f64 = row.split(',').next().unwrap().parse().unwrap();
            assert!((acc_x - i as f64 * 9.80665).abs() < 1e-9);
        }
        assert_eq!(controller.session_snapshot("t1").unwrap().state, SessionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_samples_arriving_during_failed_end_test_are_kept() {
        let (dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        let blocker = block_archive(dir.path(), "t1");
        let store = controller.store().clone();

        let producer = std::thread::spawn(move || {
            (0..3000)
                .map(|i| store.append_sample("AA", sample(i as f64, 0.0)))
                .sum::<usize>()
        });

        for _ in 0..3 {
            assert!(matches!(controller.end_test("t1").await, Err(SessionError::Export(_))));
        }
        assert_eq!(producer.join().unwrap(), 3000);
        assert_eq!(controller.session_snapshot("t1").unwrap().pending_samples, 3000);

        fs::remove_dir(&blocker).unwrap();
        let response = controller.end_test("t1").await.unwrap();
        assert_eq!(archived_rows(&response.archive_path, "A_one.csv").len(), 3000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_appends_during_flush_are_not_lost() {
        let (_dir, controller) = controller();
        controller.start_test(new_test("t1", "A", "one"));
        let store = controller.store().clone();

        let producer = std::thread::spawn(move || {
            for i in 0..2000 {
                store.append_sample("AA", sample(i as f64, 0.0));
            }
        });

        let mut flushed = 0;
        for round in 0..5 {
            let response = controller
                .end_exercise("t1", Exercise::new("A", format!("r{}", round + 1)))
                .await
                .unwrap();
            if let Some(path) = response.csv_path {
                flushed += read_rows(&path).len();
            }
        }
        producer.join().unwrap();

        let pending = controller.session_snapshot("t1").unwrap().pending_samples;
        assert_eq!(flushed + pending, 2000);
    }
}
