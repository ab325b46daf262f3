//! Users
//!
//! Users are created on first login and otherwise only change through profile
//! refresh on later logins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connections::ProviderProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory user directory keyed by id and provider subject
#[derive(Default)]
pub struct UserStore {
    users: DashMap<Uuid, User>,
    by_subject: DashMap<String, Uuid>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<User> {
        self.users.get(&id).map(|u| u.clone())
    }

    /// Find the user for a provider identity, creating or refreshing it
    pub fn upsert_from_profile(&self, profile: &ProviderProfile) -> User {
        let now = Utc::now();
        let id = *self
            .by_subject
            .entry(profile.subject.clone())
            .or_insert_with(Uuid::new_v4);

        let mut entry = self.users.entry(id).or_insert_with(|| User {
            id,
            email: profile.email.clone(),
            display_name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
            created_at: now,
            updated_at: now,
        });

        let user = entry.value_mut();
        if user.email != profile.email
            || user.display_name != profile.name
            || user.avatar_url != profile.avatar_url
        {
            user.email = profile.email.clone();
            user.display_name = profile.name.clone();
            user.avatar_url = profile.avatar_url.clone();
            user.updated_at = now;
        }
        user.clone()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
