//! On-disk layout of a resumable crawl.
//!
//! ```text
//! <job_dir>/
//!   requests.queue/        one store per active slot key
//!   requests.queue/active.json
//!   requests.seen/         disk dupefilter
//!   spider.state           spider key/value state (JSON)
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Component, Error, Result};
use crate::pqueue::ActiveSlots;

const QUEUE_DIR: &str = "requests.queue";
const ACTIVE_FILE: &str = "active.json";
const SEEN_DIR: &str = "requests.seen";
const STATE_FILE: &str = "spider.state";

/// Resumable key/value state owned by the spider. The scheduler never looks
/// inside it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpiderState(BTreeMap<String, serde_json::Value>);

impl SpiderState {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct JobDir {
    root: PathBuf,
    resuming: bool,
}

impl JobDir {
    /// Create the directory if needed. A directory that already holds crawl
    /// state makes this a resumed run.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let resuming = root.join(QUEUE_DIR).join(ACTIVE_FILE).exists()
            || root.join(SEEN_DIR).exists()
            || root.join(STATE_FILE).exists();
        fs::create_dir_all(root.join(QUEUE_DIR))?;
        Ok(Self { root, resuming })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join(QUEUE_DIR)
    }

    pub fn seen_path(&self) -> PathBuf {
        self.root.join(SEEN_DIR)
    }

    fn active_path(&self) -> PathBuf {
        self.queue_dir().join(ACTIVE_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn load_active(&self) -> Result<Option<ActiveSlots>> {
        load_json(&self.active_path())
    }

    pub fn save_active(&self, active: &ActiveSlots) -> Result<()> {
        save_json(&self.active_path(), active)
    }

    pub fn load_state(&self) -> Result<SpiderState> {
        Ok(load_json(&self.state_path())?.unwrap_or_default())
    }

    pub fn save_state(&self, state: &SpiderState) -> Result<()> {
        save_json(&self.state_path(), state)
    }
}

/// A missing file is `None`; an unreadable one is fatal, since resuming
/// without it would silently lose work.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::fatal(Component::JobDir, path.display().to_string(), e)),
    };
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| Error::fatal(Component::JobDir, path.display().to_string(), e))
}

// Write to a temp file first, then rename.
fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|e| Error::fatal(Component::JobDir, path.display().to_string(), e))
}
