use crate::onboarding::Wizard;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub type SharedWizard = Arc<Mutex<Wizard>>;

/// How long a submitted session keeps answering with its property id.
const SUBMITTED_RETENTION: Duration = Duration::from_secs(60 * 60);

enum Entry {
    Live(SharedWizard),
    Submitted { property_id: String, at: Instant },
}

struct Session {
    owner: String,
    /// Snapshot key of the draft. At most one live session holds a key.
    key: String,
    entry: Entry,
}

/// What a session id resolves to.
pub enum Lookup {
    Live(SharedWizard),
    Submitted { property_id: String },
}

/// Live wizard sessions keyed by id. Each wizard sits behind its own lock so
/// sessions never contend with each other; a partner only sees its own.
/// Submitted sessions drop their wizard and keep only the property id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl SessionRegistry {
    /// The live session already editing `key`, if any.
    pub async fn find_live(&self, owner: &str, key: &str) -> Option<(Uuid, SharedWizard)> {
        let guard = self.sessions.lock().await;
        live_for_key(&guard, owner, key)
    }

    /// Register a wizard. When another live session already holds the same
    /// draft key, that session is returned and `wizard` is dropped unused.
    /// The flag reports whether a new session was opened.
    pub async fn open(&self, owner: &str, wizard: Wizard) -> (Uuid, SharedWizard, bool) {
        let key = wizard.draft_key().to_string();
        let mut guard = self.sessions.lock().await;
        guard.retain(|_, session| match session.entry {
            Entry::Submitted { at, .. } => at.elapsed() < SUBMITTED_RETENTION,
            Entry::Live(_) => true,
        });
        if let Some((id, existing)) = live_for_key(&guard, owner, &key) {
            info!(target = "onboarding.api", %id, %owner, %key, "session_reused");
            return (id, existing, false);
        }
        let id = Uuid::new_v4();
        let wizard = Arc::new(Mutex::new(wizard));
        guard.insert(
            id,
            Session {
                owner: owner.to_string(),
                key,
                entry: Entry::Live(wizard.clone()),
            },
        );
        info!(target = "onboarding.api", %id, %owner, live = guard.len(), "session_opened");
        (id, wizard, true)
    }

    pub async fn get(&self, id: Uuid, owner: &str) -> Option<Lookup> {
        let guard = self.sessions.lock().await;
        let session = guard.get(&id).filter(|session| session.owner == owner)?;
        Some(match &session.entry {
            Entry::Live(wizard) => Lookup::Live(wizard.clone()),
            Entry::Submitted { property_id, .. } => Lookup::Submitted {
                property_id: property_id.clone(),
            },
        })
    }

    /// Release the wizard of a submitted session. Its draft key is free for a
    /// new session from then on.
    pub async fn mark_submitted(&self, id: Uuid, owner: &str, property_id: &str) {
        let mut guard = self.sessions.lock().await;
        if let Some(session) = guard.get_mut(&id).filter(|session| session.owner == owner) {
            session.entry = Entry::Submitted {
                property_id: property_id.to_string(),
                at: Instant::now(),
            };
            info!(target = "onboarding.api", %id, %owner, %property_id, "session_submitted");
        }
    }

    /// Forget a session. Returns its wizard when it was still live.
    pub async fn remove(&self, id: Uuid, owner: &str) -> Option<Option<SharedWizard>> {
        let mut guard = self.sessions.lock().await;
        if guard.get(&id).is_none_or(|session| session.owner != owner) {
            return None;
        }
        let removed = guard.remove(&id).map(|session| match session.entry {
            Entry::Live(wizard) => Some(wizard),
            Entry::Submitted { .. } => None,
        });
        info!(target = "onboarding.api", %id, %owner, live = guard.len(), "session_closed");
        removed
    }
}

fn live_for_key(
    sessions: &HashMap<Uuid, Session>,
    owner: &str,
    key: &str,
) -> Option<(Uuid, SharedWizard)> {
    sessions.iter().find_map(|(id, session)| match &session.entry {
        Entry::Live(wizard) if session.owner == owner && session.key == key => {
            Some((*id, wizard.clone()))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::onboarding::OnboardingContext;
    use crate::onboarding::persistence::MemorySnapshotStore;
    use crate::remote::Remotes;
    use crate::remote::memory::{
        InMemoryAssetStore, InMemoryPropertyStore, StaticCategorySource,
    };

    fn context() -> OnboardingContext {
        OnboardingContext {
            remotes: Remotes {
                properties: Arc::new(InMemoryPropertyStore::default()),
                assets: Arc::new(InMemoryAssetStore::default()),
                geocoder: None,
                categories: Arc::new(StaticCategorySource::default()),
            },
            snapshots: Arc::new(MemorySnapshotStore::default()),
            config: Arc::new(EngineConfig::default()),
        }
    }

    async fn wizard(ctx: &OnboardingContext, category: &str) -> Wizard {
        Wizard::create(ctx, "partner-a", Some(category.into()), "Hotel".into()).await
    }

    #[tokio::test]
    async fn sessions_are_visible_only_to_their_owner() {
        let ctx = context();
        let registry = SessionRegistry::default();
        let (id, _, _) = registry.open("partner-a", wizard(&ctx, "cat-hotel").await).await;

        assert!(matches!(registry.get(id, "partner-a").await, Some(Lookup::Live(_))));
        assert!(registry.get(id, "partner-b").await.is_none());
        assert!(registry.remove(id, "partner-b").await.is_none());
        assert!(matches!(registry.remove(id, "partner-a").await, Some(Some(_))));
        assert!(registry.get(id, "partner-a").await.is_none());
    }

    #[tokio::test]
    async fn one_live_session_per_draft() {
        let ctx = context();
        let registry = SessionRegistry::default();
        let (first, _, opened) = registry.open("partner-a", wizard(&ctx, "cat-hotel").await).await;
        assert!(opened);

        let (again, _, opened) = registry.open("partner-a", wizard(&ctx, "cat-hotel").await).await;
        assert!(!opened);
        assert_eq!(again, first);
        let key = wizard(&ctx, "cat-hotel").await.draft_key().to_string();
        assert_eq!(registry.find_live("partner-a", &key).await.map(|(id, _)| id), Some(first));

        let (other, _, opened) = registry.open("partner-a", wizard(&ctx, "cat-tent").await).await;
        assert!(opened);
        assert_ne!(other, first);
    }

    #[tokio::test]
    async fn submitted_sessions_release_their_wizard_and_key() {
        let ctx = context();
        let registry = SessionRegistry::default();
        let (id, shared, _) = registry.open("partner-a", wizard(&ctx, "cat-hotel").await).await;
        let key = shared.lock().await.draft_key().to_string();

        registry.mark_submitted(id, "partner-a", "prop-1").await;
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!(matches!(
            registry.get(id, "partner-a").await,
            Some(Lookup::Submitted { ref property_id }) if property_id == "prop-1"
        ));
        assert!(registry.find_live("partner-a", &key).await.is_none());

        let (fresh, _, opened) = registry.open("partner-a", wizard(&ctx, "cat-hotel").await).await;
        assert!(opened);
        assert_ne!(fresh, id);
        assert!(matches!(registry.remove(id, "partner-a").await, Some(None)));
    }
}
