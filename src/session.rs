//! Anonymous per-device session id, independent of sign-in state.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::db::Database;

const SESSION_KEY: &str = "session_id";

pub struct SessionStore {
    db: Option<Arc<Database>>,
    current: Mutex<Option<String>>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db: Some(db),
            current: Mutex::new(None),
        }
    }

    /// A store with no backing storage; the id lives as long as the process.
    pub fn in_memory() -> Self {
        Self {
            db: None,
            current: Mutex::new(None),
        }
    }

    pub fn get_or_create(&self) -> String {
        let mut current = self.current.lock();
        if let Some(id) = current.as_ref() {
            return id.clone();
        }

        let id = match self.load() {
            Some(id) => id,
            None => {
                let id = generate_session_id();
                self.persist(&id);
                tracing::info!(session_id = %id, "Created new session");
                id
            }
        };
        *current = Some(id.clone());
        id
    }

    /// Replace the session id. Server-side history tied to the old id is
    /// left alone.
    pub fn reset(&self) -> String {
        let mut current = self.current.lock();
        let id = generate_session_id();
        self.persist(&id);
        tracing::info!(session_id = %id, "Session reset");
        *current = Some(id.clone());
        id
    }

    fn load(&self) -> Option<String> {
        let db = self.db.as_ref()?;
        match db.get_setting(SESSION_KEY) {
            Ok(id) => id.filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stored session id");
                None
            }
        }
    }

    fn persist(&self, id: &str) {
        let Some(db) = self.db.as_ref() else {
            return;
        };
        if let Err(e) = db.set_setting(SESSION_KEY, id) {
            tracing::warn!(error = %e, "Failed to persist session id, keeping it in memory");
        }
    }
}

fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}
