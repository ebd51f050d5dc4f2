use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use stepflow_core::error::Result;
use stepflow_core::traits::SessionStorage;
use stepflow_core::types::WorkflowSession;

/// Process-local session storage. Contents are lost on exit.
#[derive(Default)]
pub struct InMemorySessionStorage {
    sessions: RwLock<HashMap<String, WorkflowSession>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl SessionStorage for InMemorySessionStorage {
    fn save<'a>(&'a self, session: &'a WorkflowSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.sessions
                .write()
                .await
                .insert(session.session_id.clone(), session.clone());
            Ok(())
        })
    }

    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<WorkflowSession>>> {
        Box::pin(async move { Ok(self.sessions.read().await.get(session_id).cloned()) })
    }

    fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.sessions.write().await.remove(session_id);
            Ok(())
        })
    }
}
