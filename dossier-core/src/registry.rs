//! Session-keyed projector arena
//!
//! Every session gets one [`Projector`] behind its own mutex, so events for a
//! session are applied one at a time while different sessions proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ProjectorConfig;
use crate::events::ChannelEvent;
use crate::projector::{ProjectionSnapshot, Projector};

type Shared = Arc<Mutex<Projector>>;

fn lock(projector: &Shared) -> MutexGuard<'_, Projector> {
    // a panic inside a fold leaves a usable projector; merges are per-field
    projector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner of all live projectors.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    config: ProjectorConfig,
    sessions: Mutex<HashMap<String, Shared>>,
}

impl SessionRegistry {
    pub fn new(config: &ProjectorConfig) -> Self {
        Self {
            config: config.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Shared>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_or_create(&self, session_id: &str) -> Shared {
        self.sessions()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(session_id = %session_id, "Creating projector");
                Arc::new(Mutex::new(Projector::for_session(session_id, &self.config)))
            })
            .clone()
    }

    /// Apply one event to the session's projector, creating it if needed.
    pub fn apply(&self, session_id: &str, event: ChannelEvent) {
        let projector = self.get_or_create(session_id);
        lock(&projector).apply(event);
    }

    /// Replace the session's projector, e.g. after hydration.
    pub fn install(&self, session_id: &str, projector: Projector) {
        self.sessions()
            .insert(session_id.to_string(), Arc::new(Mutex::new(projector)));
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ProjectionSnapshot> {
        let projector = self.sessions().get(session_id).cloned()?;
        let snapshot = lock(&projector).snapshot();
        Some(snapshot)
    }

    /// Run `f` with exclusive access to the session's projector.
    pub fn with_projector<R>(&self, session_id: &str, f: impl FnOnce(&mut Projector) -> R) -> Option<R> {
        let projector = self.sessions().get(session_id).cloned()?;
        let mut guard = lock(&projector);
        Some(f(&mut guard))
    }

    /// Switch the foreground stream of a session; never leaves the process.
    pub fn select_foreground(&self, session_id: &str, stream_id: &str) -> bool {
        self.with_projector(session_id, |p| p.select_foreground(stream_id))
            .unwrap_or(false)
    }

    /// Drop a session's projector on explicit request.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions().remove(session_id).is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GoalUpdate;

    fn goal(id: &str) -> ChannelEvent {
        ChannelEvent::GoalUpdate(GoalUpdate {
            id: id.to_string(),
            goal_text: Some(format!("goal {}", id)),
            ..Default::default()
        })
    }

    #[test]
    fn test_sessions_are_isolated() {
        let registry = SessionRegistry::default();
        registry.apply("a", goal("1"));
        registry.apply("b", goal("2"));
        registry.apply("b", goal("3"));

        assert_eq!(registry.snapshot("a").unwrap().goals.len(), 1);
        assert_eq!(registry.snapshot("b").unwrap().goals.len(), 2);
        assert_eq!(
            registry.snapshot("a").unwrap().session_id.as_deref(),
            Some("a")
        );
        assert!(registry.snapshot("c").is_none());
    }

    #[test]
    fn test_concurrent_application_is_serialized() {
        let registry = Arc::new(SessionRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        registry.apply("s", goal(&format!("{}-{}", worker, n)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.snapshot("s").unwrap().goals.len(), 200);
    }

    #[test]
    fn test_remove_is_explicit() {
        let registry = SessionRegistry::default();
        registry.apply("a", goal("1"));
        assert_eq!(registry.session_ids(), vec!["a".to_string()]);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
    }
}
