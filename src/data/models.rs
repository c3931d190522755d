//! Data models
//!
//! Rust structs representing database rows. Federation entities are keyed
//! by their global ActivityPub id (`ap_id`); host content uses integer ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Host content model
// =============================================================================

/// A forum user. Remote actors are mirrored as staged users.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: Option<String>,
    /// true for users created on behalf of a remote actor
    pub staged: bool,
    pub created_at: DateTime<Utc>,
}

/// A forum category; federated through a local Group actor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    /// Whether whole conversations (not only first posts) are federated
    pub full_topic: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub category_id: Option<i64>,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub topic_id: i64,
    pub user_id: i64,
    /// 1 for the first post of a topic
    pub post_number: i64,
    pub reply_to_post_number: Option<i64>,
    pub content: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn is_first_post(&self) -> bool {
        self.post_number == 1
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// =============================================================================
// Federation graph
// =============================================================================

/// Host model an actor is linked to.
pub const MODEL_USER: &str = "user";
pub const MODEL_CATEGORY: &str = "category";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActorRecord {
    pub id: i64,
    pub ap_id: String,
    pub ap_type: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub domain: String,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub public_key_pem: Option<String>,
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub local: bool,
    /// false while the actor's domain is quarantined
    pub available: bool,
    pub model_type: Option<String>,
    pub model_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActorRecord {
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.ap_id)
    }

    pub fn user_id(&self) -> Option<i64> {
        match self.model_type.as_deref() {
            Some(MODEL_USER) => self.model_id,
            _ => None,
        }
    }

    pub fn category_id(&self) -> Option<i64> {
        match self.model_type.as_deref() {
            Some(MODEL_CATEGORY) => self.model_id,
            _ => None,
        }
    }
}

/// Insert-or-update payload for an actor.
#[derive(Debug, Clone, Default)]
pub struct NewActor {
    pub ap_id: String,
    pub ap_type: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub domain: String,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub local: bool,
    pub model_type: Option<String>,
    pub model_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionRecord {
    pub id: i64,
    pub ap_id: String,
    pub ap_type: String,
    pub name: Option<String>,
    pub audience: Option<String>,
    pub local: bool,
    pub topic_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCollection {
    pub ap_id: String,
    pub ap_type: String,
    pub name: Option<String>,
    pub audience: Option<String>,
    pub local: bool,
    pub topic_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub id: i64,
    pub ap_id: String,
    pub ap_type: String,
    pub content: Option<String>,
    pub name: Option<String>,
    pub attributed_to: Option<String>,
    pub in_reply_to: Option<String>,
    /// Collection (topic-equivalent) the object belongs to
    pub context: Option<String>,
    pub audience: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub local: bool,
    pub post_id: Option<i64>,
    pub document: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ap_type == "Tombstone"
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewObject {
    pub ap_id: String,
    pub ap_type: String,
    pub content: Option<String>,
    pub name: Option<String>,
    pub attributed_to: Option<String>,
    pub in_reply_to: Option<String>,
    pub context: Option<String>,
    pub audience: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub local: bool,
    pub document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub id: i64,
    pub ap_id: String,
    pub ap_type: String,
    pub actor: String,
    pub object: Option<String>,
    pub object_type: Option<String>,
    pub target: Option<String>,
    pub public: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub local: bool,
    pub document: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub ap_id: String,
    pub ap_type: String,
    pub actor: String,
    pub object: Option<String>,
    pub object_type: Option<String>,
    pub target: Option<String>,
    pub public: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub local: bool,
    pub document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRecord {
    pub follower: String,
    pub followed: String,
    pub created_at: DateTime<Utc>,
}
