//! Registry of live calls, injected wherever calls are created or controlled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::CallDirection;

use crate::metrics;
use crate::orchestrator::{CallHandle, CallOrchestrator, CallServices};
use crate::screening::CallScreener;
use crate::types::{CallEvent, CallInfo, CallState};

/// Creates calls, screens incoming ones, and forgets calls once they end.
pub struct CallRegistry {
    services: CallServices,
    screener: CallScreener,
    calls: Arc<RwLock<HashMap<Uuid, CallHandle>>>,
}

impl CallRegistry {
    pub fn new(services: CallServices) -> Self {
        let screener = CallScreener::new(&services.config.call.screening);
        Self {
            services,
            screener,
            calls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Screen and create an incoming call.
    pub async fn incoming(
        &self,
        from: &str,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallEvent>)> {
        if let Err(e) = self.screener.screen(from) {
            metrics::record_call_blocked();
            return Err(e);
        }
        Ok(self.create(CallDirection::Incoming, from).await)
    }

    /// Create an outgoing call.
    pub async fn outgoing(&self, to: &str) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        self.create(CallDirection::Outgoing, to).await
    }

    async fn create(
        &self,
        direction: CallDirection,
        address: &str,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let (handle, events) = CallOrchestrator::start(self.services.clone(), direction, address);
        let id = handle.id();
        self.calls.write().await.insert(id, handle.clone());
        info!(%id, %direction, address, "Call registered");

        // Forget the call once it reaches Disconnected.
        let calls = self.calls.clone();
        let mut state = handle.subscribe_state();
        tokio::spawn(async move {
            let _ = state.wait_for(|s| *s == CallState::Disconnected).await;
            calls.write().await.remove(&id);
            debug!(%id, "Call removed from registry");
        });

        (handle, events)
    }

    pub async fn get(&self, id: Uuid) -> Option<CallHandle> {
        self.calls.read().await.get(&id).cloned()
    }

    /// Snapshots of every live call, oldest first.
    pub async fn list(&self) -> Vec<CallInfo> {
        let mut calls: Vec<CallInfo> = self
            .calls
            .read()
            .await
            .values()
            .map(CallHandle::info)
            .collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }

    pub async fn len(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.read().await.is_empty()
    }

    async fn with_call(&self, id: Uuid, f: impl FnOnce(&CallHandle) -> Result<()>) -> Result<()> {
        let calls = self.calls.read().await;
        let handle = calls
            .get(&id)
            .ok_or_else(|| VoxlineError::Call(format!("no such call: {id}")))?;
        f(handle)
    }

    pub async fn answer(&self, id: Uuid) -> Result<()> {
        self.with_call(id, CallHandle::answer).await
    }

    pub async fn reject(&self, id: Uuid) -> Result<()> {
        self.with_call(id, CallHandle::reject).await
    }

    pub async fn hangup(&self, id: Uuid) -> Result<()> {
        self.with_call(id, CallHandle::hangup).await
    }

    pub async fn hold(&self, id: Uuid) -> Result<()> {
        self.with_call(id, CallHandle::hold).await
    }

    pub async fn unhold(&self, id: Uuid) -> Result<()> {
        self.with_call(id, CallHandle::unhold).await
    }

    pub async fn mute(&self, id: Uuid, muted: bool) -> Result<()> {
        self.with_call(id, |call| call.mute(muted)).await
    }

    /// Hang up every live call.
    pub async fn hangup_all(&self) {
        for handle in self.calls.read().await.values() {
            let _ = handle.hangup();
        }
    }
}
