//! Keyed collection of independent sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::FeedConfig;
use crate::session::Session;

/// Creates and hands out sessions by identity key.
///
/// Sessions are fully isolated from each other; the registry only maps keys
/// to them. The map lock is held for map operations alone, never while
/// touching a session.
pub struct SessionRegistry {
    config: FeedConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: FeedConfig) -> Self {
        SessionRegistry { config, sessions: Mutex::new(HashMap::new()) }
    }

    /// Returns the session for this key, creating it on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<Session> {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get(key) {
            return session.clone();
        }
        info!(session = key, "creating session");
        let session = Session::new(key, self.config.clone());
        sessions.insert(key.to_string(), session.clone());
        session
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.lock().get(key).cloned()
    }

    /// Detaches a session from the registry. The caller is responsible for
    /// stopping it; dropping the last handle cancels any active run.
    pub fn remove(&self, key: &str) -> Option<Arc<Session>> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            info!(session = key, "removed session");
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stops every session, removing them all.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
