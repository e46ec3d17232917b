//! Blocking permission prompts.
//!
//! Guarded operations that hit an undecided permission enqueue a
//! prompt request and block on a one-shot channel until the user
//! resolves it (or the queue is force-drained). Exactly one prompt is
//! presented at a time; the rest wait in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use trellis_core::PermissionState;

use crate::config::PluginConfigStore;

/// Button the user pressed on the active prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDecision {
    Granted,
    Denied,
    /// Deny this call without persisting a decision; the next attempt
    /// prompts again.
    Later,
}

/// What the blocked caller receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Granted,
    Denied,
    Cancelled(String),
}

/// One queued question for the host UI to render.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub plugin_id: String,
    pub permission: String,
    pub message: Option<String>,
}

struct PendingPrompt {
    request: PromptRequest,
    responder: oneshot::Sender<PromptOutcome>,
}

#[derive(Default)]
struct PromptState {
    active: Option<PendingPrompt>,
    queue: VecDeque<PendingPrompt>,
}

type PromptListener = Box<dyn Fn(&PromptRequest) + Send + Sync>;

/// Owns the FIFO queue and the single in-flight slot. Decisions are
/// persisted to the config store before the blocked caller wakes, so
/// the caller always observes its own decision.
pub struct PromptCoordinator {
    config: Arc<PluginConfigStore>,
    state: Mutex<PromptState>,
    listener: Mutex<Option<PromptListener>>,
}

impl PromptCoordinator {
    pub fn new(config: Arc<PluginConfigStore>) -> Self {
        Self {
            config,
            state: Mutex::new(PromptState::default()),
            listener: Mutex::new(None),
        }
    }

    /// Installs the callback fired whenever a prompt becomes active.
    /// The host UI uses this to present the question.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&PromptRequest) + Send + Sync + 'static,
    {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(listener));
    }

    fn notify(&self, request: &PromptRequest) {
        let slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listener) = slot.as_ref() {
            listener(request);
        }
    }

    /// The prompt currently awaiting a decision, if any.
    pub fn active(&self) -> Option<PromptRequest> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.as_ref().map(|pending| pending.request.clone())
    }

    pub fn queued_len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.len()
    }

    /// Enqueues a prompt and blocks the calling thread until it is
    /// resolved. Must not be called from the thread that resolves
    /// prompts.
    pub fn request(
        &self,
        plugin_id: &str,
        permission: &str,
        message: Option<String>,
    ) -> PromptOutcome {
        let request = PromptRequest {
            plugin_id: plugin_id.to_string(),
            permission: permission.to_string(),
            message,
        };
        let (responder, receiver) = oneshot::channel();
        let became_active = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let pending = PendingPrompt {
                request: request.clone(),
                responder,
            };
            if state.active.is_none() {
                state.active = Some(pending);
                true
            } else {
                state.queue.push_back(pending);
                false
            }
        };
        if became_active {
            self.notify(&request);
        }

        match receiver.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => PromptOutcome::Cancelled("permission prompt was dismissed".to_string()),
        }
    }

    /// Resolves the active prompt, persists Granted/Denied decisions,
    /// wakes the blocked caller and promotes the next queued prompt.
    /// Returns false when no prompt is active.
    pub fn resolve_active(&self, decision: PromptDecision) -> bool {
        let (resolved, promoted) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(active) = state.active.take() else {
                return false;
            };
            state.active = state.queue.pop_front();
            let promoted = state.active.as_ref().map(|pending| pending.request.clone());
            (active, promoted)
        };

        match decision {
            PromptDecision::Granted => self.config.set_permission_state(
                &resolved.request.plugin_id,
                &resolved.request.permission,
                PermissionState::Granted,
            ),
            PromptDecision::Denied => self.config.set_permission_state(
                &resolved.request.plugin_id,
                &resolved.request.permission,
                PermissionState::Denied,
            ),
            PromptDecision::Later => {}
        }

        let outcome = match decision {
            PromptDecision::Granted => PromptOutcome::Granted,
            PromptDecision::Denied | PromptDecision::Later => PromptOutcome::Denied,
        };
        // The caller may have given up; a dropped receiver is fine.
        let _ = resolved.responder.send(outcome);

        if let Some(request) = promoted {
            self.notify(&request);
        }
        true
    }

    /// Force-drains the queue, resolving the active prompt and every
    /// queued one as cancelled. Used on session teardown so no caller
    /// stays blocked forever.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<PendingPrompt> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut drained: Vec<PendingPrompt> = state.active.take().into_iter().collect();
            drained.extend(state.queue.drain(..));
            drained
        };
        if !drained.is_empty() {
            tracing::info!(
                target: "plugin",
                "cancelling {} pending permission prompt(s): {reason}",
                drained.len()
            );
        }
        for pending in drained {
            let _ = pending
                .responder
                .send(PromptOutcome::Cancelled(reason.to_string()));
        }
    }
}
