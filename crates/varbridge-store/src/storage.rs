use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use varbridge_core::{SessionId, SessionSnapshot, SessionStorage, VarResult};

/// Session storage that keeps encoded snapshots in process memory.
///
/// Snapshots are stored as JSON so a restore goes through the same decoding
/// path as an external backend would.
#[derive(Debug, Default)]
pub struct InMemorySessionStorage {
    snapshots: RwLock<HashMap<SessionId, String>>,
}

impl InMemorySessionStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, snapshot: SessionSnapshot) -> VarResult<()> {
        let encoded = snapshot.to_json()?;
        debug!("Saving snapshot of session {} ({} bytes)", snapshot.session_id, encoded.len());
        self.snapshots.write().await.insert(snapshot.session_id, encoded);
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> VarResult<Option<SessionSnapshot>> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(session_id).map(|raw| SessionSnapshot::from_json(raw)).transpose()
    }

    async fn delete(&self, session_id: &SessionId) -> VarResult<bool> {
        Ok(self.snapshots.write().await.remove(session_id).is_some())
    }

    async fn list(&self) -> VarResult<Vec<SessionId>> {
        let mut sessions: Vec<SessionId> = self.snapshots.read().await.keys().cloned().collect();
        sessions.sort();
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_load_delete() {
        let storage = InMemorySessionStorage::new();
        let session = SessionId::from("s1");
        let snapshot = SessionSnapshot {
            session_id: session.clone(),
            variables: Vec::new(),
            dependencies: Vec::new(),
            exported_at: Utc::now(),
        };

        assert!(storage.load(&session).await.unwrap().is_none());
        storage.save(snapshot.clone()).await.unwrap();
        assert_eq!(storage.load(&session).await.unwrap(), Some(snapshot));
        assert_eq!(storage.list().await.unwrap(), vec![session.clone()]);

        assert!(storage.delete(&session).await.unwrap());
        assert!(!storage.delete(&session).await.unwrap());
    }
}
