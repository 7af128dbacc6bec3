/*!
 * Parameter persistence.
 *
 * One [`ParamDocument`] per motor, keyed by MAC. [`JsonFileStore`] writes
 * `motor_<MAC>.json` files into a directory; [`MemoryStore`] keeps documents
 * in memory.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use motorlink_core::types::{Attr, DeviceId, DeviceMac, Value};

use crate::error::{DeviceError, Result};

/// Persisted parameters of one motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDocument {
    /// Logical id at the time of saving
    pub device_id: DeviceId,
    /// Hardware address
    pub mac: DeviceMac,
    /// Confirmed table, one entry per attribute
    #[serde(default)]
    pub params: BTreeMap<Attr, Value>,
}

/// Storage boundary for parameter documents
pub trait ParamStore: Send + Sync + Debug {
    /// Load the document of a motor, `None` if nothing was saved
    fn load(&self, mac: DeviceMac) -> Result<Option<ParamDocument>>;

    /// Save the document of a motor
    fn save(&self, doc: &ParamDocument) -> Result<()>;
}

/// Store writing one JSON file per motor
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory the files live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding a motor's document
    pub fn path_for(&self, mac: DeviceMac) -> PathBuf {
        self.dir.join(format!("motor_{}.json", mac))
    }
}

impl ParamStore for JsonFileStore {
    fn load(&self, mac: DeviceMac) -> Result<Option<ParamDocument>> {
        let path = self.path_for(mac);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: ParamDocument = serde_json::from_str(&text).map_err(|e| {
            DeviceError::persistence(format!("{}: {}", path.display(), e))
        })?;
        if doc.mac != mac {
            return Err(DeviceError::persistence(format!(
                "{} belongs to {}",
                path.display(),
                doc.mac
            )));
        }
        debug!("Loaded {} params from {}", doc.params.len(), path.display());
        Ok(Some(doc))
    }

    fn save(&self, doc: &ParamDocument) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(doc.mac);
        let text = serde_json::to_string_pretty(doc)?;
        fs::write(&path, text)?;
        debug!("Saved {} params to {}", doc.params.len(), path.display());
        Ok(())
    }
}

/// Store keeping documents in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DeviceMac, ParamDocument>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ParamStore for MemoryStore {
    fn load(&self, mac: DeviceMac) -> Result<Option<ParamDocument>> {
        Ok(self
            .docs
            .lock()
            .map_err(|_| DeviceError::other("Failed to acquire lock on parameter store"))?
            .get(&mac)
            .cloned())
    }

    fn save(&self, doc: &ParamDocument) -> Result<()> {
        self.docs
            .lock()
            .map_err(|_| DeviceError::other("Failed to acquire lock on parameter store"))?
            .insert(doc.mac, doc.clone());
        Ok(())
    }
}
