use std::sync::{Arc, RwLock};

/// Number of leading secret characters kept by [`redact`].
const REDACT_KEEP: usize = 10;

/// The single authoritative handshake secret.
///
/// One slot holding an `Arc<str>`: `set` swaps the whole value, so a reader
/// sees either the previous secret or the new one. Cloning the store clones
/// the handle, not the slot.
#[derive(Clone, Default)]
pub struct SecretStore {
    slot: Arc<RwLock<Option<Arc<str>>>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<Arc<str>>) -> Self {
        let store = Self::new();
        store.set(secret);
        store
    }

    /// Install a new secret, replacing any prior one. Returns whether a
    /// secret was already bound.
    pub fn set(&self, secret: impl Into<Arc<str>>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(secret.into()).is_some()
    }

    pub fn get(&self) -> Option<Arc<str>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Form of a secret that may be shown to observers or written to logs.
pub fn redact(secret: &str) -> String {
    let kept: String = secret.chars().take(REDACT_KEEP).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_then_bound_then_rebound() {
        let store = SecretStore::new();
        assert!(store.get().is_none());

        assert!(!store.set("first"));
        assert_eq!(store.get().as_deref(), Some("first"));

        assert!(store.set("second"));
        assert_eq!(store.get().as_deref(), Some("second"));
    }

    #[test]
    fn clones_share_the_slot() {
        let store = SecretStore::new();
        let handle = store.clone();
        handle.set("abc123");
        assert!(store.is_bound());
        assert_eq!(store.get().as_deref(), Some("abc123"));
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let store = SecretStore::with_secret("a".repeat(64));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let c = if i % 2 == 0 { "b" } else { "a" };
                    store.set(c.repeat(64));
                }
            })
        };
        for _ in 0..500 {
            let s = store.get().unwrap();
            assert!(&*s == "a".repeat(64) || &*s == "b".repeat(64));
        }
        writer.join().unwrap();
    }

    #[test]
    fn redact_never_leaks_the_tail() {
        assert_eq!(redact("0123456789abcdef"), "0123456789...");
        assert_eq!(redact("short"), "short...");
    }

    #[test]
    fn debug_hides_value() {
        let store = SecretStore::with_secret("hunter2");
        assert!(!format!("{store:?}").contains("hunter2"));
    }
}
