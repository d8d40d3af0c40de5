//! # Session Store Module
//!
//! Process-wide registry of test sessions and their in-flight sample buffers.
//!
//! ## Locking
//! The registry map sits behind an `RwLock` that is only write-locked to add
//! or remove a session. Each session then carries two locks of its own:
//! - `data`: short critical sections (append one sample, snapshot, commit)
//! - `transition`: held across a whole lifecycle transition, including the
//!   awaited export, so two transitions on one test never interleave while
//!   appends keep flowing
//!
//! Unrelated tests never contend with each other beyond the registry read lock.
//!
//! ## Routing
//! A session started with device addresses only receives samples from those
//! devices. One started without any receives samples from every device,
//! which is how a single sensor stream fed all open tests historically.

use crate::error::SessionError;
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A typed, named segment within a test
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exercise {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

impl Exercise {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// `<type>_<name>`, also the stem of the exported CSV
    pub fn key(&self) -> String {
        format!("{}_{}", self.kind, self.name)
    }
}

/// Which device streams feed a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceBinding {
    Any,
    Devices(HashSet<String>),
}

impl DeviceBinding {
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let devices: HashSet<String> = addresses
            .into_iter()
            .map(|a| normalize_address(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();

        if devices.is_empty() {
            DeviceBinding::Any
        } else {
            DeviceBinding::Devices(devices)
        }
    }

    pub fn accepts(&self, address: &str) -> bool {
        match self {
            DeviceBinding::Any => true,
            DeviceBinding::Devices(devices) => devices.contains(&normalize_address(address)),
        }
    }
}

/// Device addresses compare case-insensitively
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    /// `end test` is flushing and archiving. Samples are still buffered so a
    /// failed attempt loses nothing.
    Closing,
    Closed,
}

/// Parameters for starting a test
#[derive(Debug, Clone)]
pub struct NewTest {
    pub test_id: String,
    pub user_id: String,
    pub tester_id: String,
    pub exercise: Exercise,
    pub devices: Vec<String>,
}

/// The aggregate for one supervised test
#[derive(Debug)]
pub struct TestSession {
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) tester_id: String,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) current_exercise: Exercise,
    pub(crate) pending: Vec<Sample>,
    pub(crate) completed: BTreeMap<String, PathBuf>,
    pub(crate) archive_path: Option<PathBuf>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) binding: DeviceBinding,
    pub(crate) state: SessionState,
}

impl TestSession {
    fn new(request: NewTest) -> Self {
        Self {
            binding: DeviceBinding::from_addresses(&request.devices),
            test_id: request.test_id,
            user_id: request.user_id,
            tester_id: request.tester_id,
            start_time: Utc::now(),
            current_exercise: request.exercise,
            pending: Vec::new(),
            completed: BTreeMap::new(),
            archive_path: None,
            end_time: None,
            state: SessionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn accepts_samples(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Copy of the exercise being recorded and everything buffered for it
    pub(crate) fn pending_snapshot(&self) -> (Exercise, Vec<Sample>) {
        (self.current_exercise.clone(), self.pending.clone())
    }

    /// Publish a successful flush of the first `flushed` pending samples.
    ///
    /// Samples appended after the snapshot stay buffered.
    pub(crate) fn commit_flush(&mut self, flushed: usize, key: String, path: PathBuf) {
        self.pending.drain(..flushed.min(self.pending.len()));
        self.completed.insert(key, path);
    }

    /// Mark the final flush as in progress.
    pub(crate) fn begin_close(&mut self) {
        self.state = SessionState::Closing;
    }

    /// Undo `begin_close` after a failed final flush or archive.
    pub(crate) fn reopen(&mut self) {
        self.state = SessionState::Open;
    }

    /// Seal the session. Returns how many samples arrived after the final
    /// snapshot; they postdate the end of the test and are dropped.
    pub(crate) fn close(&mut self, archive_path: PathBuf) -> usize {
        let late = self.pending.len();
        self.pending.clear();
        self.archive_path = Some(archive_path);
        self.end_time = Some(Utc::now());
        self.state = SessionState::Closed;
        late
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            test_id: self.test_id.clone(),
            user_id: self.user_id.clone(),
            tester_id: self.tester_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            current_exercise: self.current_exercise.clone(),
            pending_samples: self.pending.len(),
            completed_exercises: self.completed.clone(),
            archive_path: self.archive_path.clone(),
            bound_devices: match &self.binding {
                DeviceBinding::Any => None,
                DeviceBinding::Devices(devices) => {
                    let mut devices: Vec<String> = devices.iter().cloned().collect();
                    devices.sort();
                    Some(devices)
                }
            },
            state: self.state,
        }
    }
}

/// Read-only view of a session handed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub test_id: String,
    pub user_id: String,
    pub tester_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_exercise: Exercise,
    pub pending_samples: usize,
    pub completed_exercises: BTreeMap<String, PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub bound_devices: Option<Vec<String>>,
    pub state: SessionState,
}

#[derive(Debug)]
pub(crate) struct SessionEntry {
    data: Mutex<TestSession>,
    pub(crate) transition: tokio::sync::Mutex<()>,
}

impl SessionEntry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TestSession> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(SessionSnapshot),
    AlreadyExists(SessionSnapshot),
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new test. An id that is already tracked is left untouched.
    pub fn create_test(&self, request: NewTest) -> CreateOutcome {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = sessions.get(&request.test_id) {
            return CreateOutcome::AlreadyExists(existing.lock().snapshot());
        }

        let test_id = request.test_id.clone();
        let session = TestSession::new(request);
        let snapshot = session.snapshot();
        sessions.insert(
            test_id,
            Arc::new(SessionEntry {
                data: Mutex::new(session),
                transition: tokio::sync::Mutex::new(()),
            }),
        );

        CreateOutcome::Created(snapshot)
    }

    /// Append `sample` from device `source` to every unclosed session bound to it.
    ///
    /// Returns how many sessions received the sample.
    pub fn append_sample(&self, source: &str, sample: Sample) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;

        for entry in sessions.values() {
            let mut session = entry.lock();
            if session.accepts_samples() && session.binding.accepts(source) {
                session.pending.push(sample);
                delivered += 1;
            }
        }

        delivered
    }

    pub fn get_session(&self, test_id: &str) -> Result<SessionSnapshot, SessionError> {
        Ok(self.entry(test_id)?.lock().snapshot())
    }

    /// Drop all bookkeeping for a test.
    pub fn close_test(&self, test_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions
            .remove(test_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(test_id.to_string()))
    }

    pub(crate) fn entry(&self, test_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(test_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(test_id.to_string()))
    }
}
