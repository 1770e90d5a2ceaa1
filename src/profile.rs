//! Local participant profile, for hosts without a central identity service.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::collaborator::IdentityProvider;
use crate::error::Result;
use crate::track::TrackStore;
use crate::Participant;

pub const PROFILE_STORAGE_KEY: &str = "territoryrun_profile";

/// The stored profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProfile {
    pub id: String,
    pub username: String,
}

impl LocalProfile {
    /// A new profile with a random id.
    pub fn create(username: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.trim().to_string(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.username.is_empty()
    }
}

impl From<LocalProfile> for Participant {
    fn from(p: LocalProfile) -> Self {
        Participant {
            id: p.id,
            display_name: p.username,
        }
    }
}

/// Profile record kept in a [`TrackStore`].
pub struct LocalProfileStore {
    store: Arc<dyn TrackStore>,
}

impl LocalProfileStore {
    pub fn new(store: Arc<dyn TrackStore>) -> Self {
        Self { store }
    }

    /// The stored profile, if present and complete. Unreadable or partial
    /// records count as absent.
    pub fn load(&self) -> Option<LocalProfile> {
        let bytes = match self.store.load(PROFILE_STORAGE_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("[LocalProfileStore] Load failed: {}", e);
                return None;
            }
        };
        serde_json::from_slice::<LocalProfile>(&bytes)
            .ok()
            .filter(LocalProfile::is_complete)
    }

    pub fn save(&self, profile: &LocalProfile) -> Result<()> {
        let bytes = serde_json::to_vec(profile)?;
        self.store.save(PROFILE_STORAGE_KEY, &bytes)
    }

    /// The stored profile, or a new one for `username` which is then saved.
    pub fn load_or_create(&self, username: &str) -> Result<LocalProfile> {
        if let Some(existing) = self.load() {
            return Ok(existing);
        }
        let profile = LocalProfile::create(username);
        self.save(&profile)?;
        Ok(profile)
    }
}

impl IdentityProvider for LocalProfileStore {
    fn current_participant(&self) -> Option<Participant> {
        self.load().map(Participant::from)
    }
}
