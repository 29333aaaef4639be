//! Shared logical session.
//!
//! One backend connection is shared by every component of a run so that
//! working relations created by one stage stay visible to the next. The
//! session does not own relations (see [`crate::working`]); it owns the
//! connection and a reference-counted registry of the components using it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ResourceError, SuppressResult, ValidationError};
use crate::storage::SessionBackend;

#[derive(Debug, Default)]
struct SessionState {
    components: BTreeMap<String, usize>,
    closed: bool,
}

/// Point-in-time description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session-unique suffix used in relation names.
    pub session_id: String,
    /// Optional human label from configuration.
    pub label: Option<String>,
    /// Whether the backend answered a liveness probe.
    pub is_active: bool,
    /// Registered component names, ascending.
    pub active_components: Vec<String>,
    /// Number of distinct registered components.
    pub component_count: usize,
    /// Whether `teardown` has run.
    pub closed: bool,
}

/// A backend connection shared by the components of one run.
pub struct Session {
    id: String,
    label: Option<String>,
    backend: Arc<dyn SessionBackend>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self {
            id: simple[..8].to_string(),
            label: None,
            backend,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Creates a labelled session.
    #[must_use]
    pub fn with_label(backend: Arc<dyn SessionBackend>, label: impl Into<String>) -> Self {
        let mut session = Self::new(backend);
        session.label = Some(label.into());
        session
    }

    /// Session-unique suffix.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        // Registry bookkeeping stays usable after a panicking holder.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the backend, or `SessionClosed` after teardown.
    pub fn backend(&self) -> Result<&dyn SessionBackend, ResourceError> {
        if self.lock_state().closed {
            return Err(ResourceError::SessionClosed);
        }
        Ok(self.backend.as_ref())
    }

    /// Registers a component as a user of this session.
    ///
    /// Registering the same name twice requires two releases.
    pub fn register(&self, component: &str) -> SuppressResult<()> {
        let name = component.trim();
        if name.is_empty() {
            return Err(ValidationError::InvalidComponentName.into());
        }

        let mut state = self.lock_state();
        if state.closed {
            return Err(ResourceError::SessionClosed.into());
        }
        *state.components.entry(name.to_string()).or_insert(0) += 1;
        debug!(
            session = %self.id,
            component = name,
            active = ?state.components.keys().collect::<Vec<_>>(),
            "component registered"
        );
        Ok(())
    }

    /// Releases one registration of a component.
    pub fn release(&self, component: &str) {
        let name = component.trim();
        if name.is_empty() {
            warn!(session = %self.id, "attempted to release a component with an empty name");
            return;
        }

        let mut state = self.lock_state();
        match state.components.get_mut(name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.components.remove(name);
            }
            None => {
                warn!(session = %self.id, component = name, "release of unregistered component");
                return;
            }
        }
        debug!(
            session = %self.id,
            component = name,
            remaining = ?state.components.keys().collect::<Vec<_>>(),
            "component released"
        );
    }

    /// Registers a component for the lifetime of the returned guard.
    pub fn lease(self: &Arc<Self>, component: &str) -> SuppressResult<ComponentLease> {
        self.register(component)?;
        Ok(ComponentLease {
            session: Arc::clone(self),
            component: component.trim().to_string(),
        })
    }

    /// Registered component names, ascending.
    #[must_use]
    pub fn active_components(&self) -> Vec<String> {
        self.lock_state().components.keys().cloned().collect()
    }

    /// Registration count of one component.
    #[must_use]
    pub fn registrations(&self, component: &str) -> usize {
        self.lock_state()
            .components
            .get(component.trim())
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if the backend answers a liveness probe.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let Ok(backend) = self.backend() else {
            return false;
        };
        match backend.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %self.id, error = %e, "session health check failed");
                false
            }
        }
    }

    /// Snapshot of session state.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        let is_active = self.is_active();
        let state = self.lock_state();
        SessionInfo {
            session_id: self.id.clone(),
            label: self.label.clone(),
            is_active,
            active_components: state.components.keys().cloned().collect(),
            component_count: state.components.len(),
            closed: state.closed,
        }
    }

    /// Closes the backend connection.
    ///
    /// Proceeds even when components are still registered, logging them.
    /// Close failures are logged, never returned. Calling twice is a no-op.
    pub fn teardown(&self) {
        let mut state = self.lock_state();
        if state.closed {
            debug!(session = %self.id, "teardown called on closed session");
            return;
        }
        if !state.components.is_empty() {
            warn!(
                session = %self.id,
                active = ?state.components.keys().collect::<Vec<_>>(),
                "session teardown with components still registered"
            );
        }

        info!(session = %self.id, "closing session backend");
        if let Err(e) = self.backend.close() {
            error!(session = %self.id, error = %e, "failed to close session backend");
        }
        state.components.clear();
        state.closed = true;
    }
}

/// RAII registration of a component on a [`Session`].
#[derive(Debug)]
pub struct ComponentLease {
    session: Arc<Session>,
    component: String,
}

impl ComponentLease {
    /// Registered component name.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The leased session.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ComponentLease {
    fn drop(&mut self) {
        self.session.release(&self.component);
    }
}
