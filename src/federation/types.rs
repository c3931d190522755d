//! Type factory
//!
//! Maps a document's `type` tag to a typed in-memory value. Construction is
//! purely data-driven: a static table pairs each known tag with its
//! constructor, and unknown tags fall back to [`ApEntity::Generic`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::envelope::{AS_PUBLIC, EnvelopeError};

/// Known protocol types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApType {
    // Activities
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    // Objects
    Note,
    Article,
    Tombstone,
    // Actors
    Person,
    Group,
    Service,
    Application,
    Organization,
    // Collections
    Collection,
    OrderedCollection,
    CollectionPage,
    OrderedCollectionPage,
}

/// Broad family a type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApCategory {
    Activity,
    Object,
    Actor,
    Collection,
}

type Constructor = fn(ApType, &Value) -> Result<ApEntity, EnvelopeError>;

const TYPE_TABLE: &[(&str, ApType, Constructor)] = &[
    ("Create", ApType::Create, Activity::build),
    ("Update", ApType::Update, Activity::build),
    ("Delete", ApType::Delete, Activity::build),
    ("Follow", ApType::Follow, Activity::build),
    ("Accept", ApType::Accept, Activity::build),
    ("Reject", ApType::Reject, Activity::build),
    ("Undo", ApType::Undo, Activity::build),
    ("Like", ApType::Like, Activity::build),
    ("Announce", ApType::Announce, Activity::build),
    ("Note", ApType::Note, Object::build),
    ("Article", ApType::Article, Object::build),
    ("Tombstone", ApType::Tombstone, Object::build),
    ("Person", ApType::Person, Actor::build),
    ("Group", ApType::Group, Actor::build),
    ("Service", ApType::Service, Actor::build),
    ("Application", ApType::Application, Actor::build),
    ("Organization", ApType::Organization, Actor::build),
    ("Collection", ApType::Collection, Collection::build),
    ("OrderedCollection", ApType::OrderedCollection, Collection::build),
    ("CollectionPage", ApType::CollectionPage, Collection::build),
    (
        "OrderedCollectionPage",
        ApType::OrderedCollectionPage,
        Collection::build,
    ),
];

impl ApType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        TYPE_TABLE
            .iter()
            .find(|(name, _, _)| *name == tag)
            .map(|(_, kind, _)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        TYPE_TABLE
            .iter()
            .find(|(_, kind, _)| kind == self)
            .map(|(name, _, _)| *name)
            .unwrap_or("Object")
    }

    pub fn category(&self) -> ApCategory {
        use ApType::*;
        match self {
            Create | Update | Delete | Follow | Accept | Reject | Undo | Like | Announce => {
                ApCategory::Activity
            }
            Note | Article | Tombstone => ApCategory::Object,
            Person | Group | Service | Application | Organization => ApCategory::Actor,
            Collection | OrderedCollection | CollectionPage | OrderedCollectionPage => {
                ApCategory::Collection
            }
        }
    }

    /// Object types that become host posts.
    pub fn is_post_like(&self) -> bool {
        matches!(self, ApType::Note | ApType::Article)
    }
}

impl std::fmt::Display for ApType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed protocol document.
#[derive(Debug, Clone)]
pub enum ApEntity {
    Activity(Activity),
    Object(Object),
    Actor(Actor),
    Collection(Collection),
    /// Unrecognized type; kept so forward-compatible extensions still ingest.
    Generic(Generic),
}

impl ApEntity {
    pub fn id(&self) -> &str {
        match self {
            ApEntity::Activity(a) => &a.id,
            ApEntity::Object(o) => &o.id,
            ApEntity::Actor(a) => &a.id,
            ApEntity::Collection(c) => &c.id,
            ApEntity::Generic(g) => &g.id,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            ApEntity::Activity(a) => a.kind.as_str(),
            ApEntity::Object(o) => o.kind.as_str(),
            ApEntity::Actor(a) => a.kind.as_str(),
            ApEntity::Collection(c) => c.kind.as_str(),
            ApEntity::Generic(g) => &g.type_name,
        }
    }

    pub fn document(&self) -> &Value {
        match self {
            ApEntity::Activity(a) => &a.document,
            ApEntity::Object(o) => &o.document,
            ApEntity::Actor(a) => &a.document,
            ApEntity::Collection(c) => &c.document,
            ApEntity::Generic(g) => &g.document,
        }
    }
}

/// Build the typed value for a document.
pub fn build_entity(document: &Value) -> Result<ApEntity, EnvelopeError> {
    let tag = type_tag(document).ok_or(EnvelopeError::MissingType)?;
    match TYPE_TABLE.iter().find(|(name, _, _)| *name == tag) {
        Some((_, kind, constructor)) => constructor(*kind, document),
        None => Generic::build(tag, document),
    }
}

/// First string of the `type` field, which may be a string or an array.
pub fn type_tag(document: &Value) -> Option<&str> {
    match document.get("type")? {
        Value::String(tag) => Some(tag.as_str()),
        Value::Array(tags) => tags.iter().find_map(Value::as_str),
        _ => None,
    }
}

/// Id of a reference that is either a bare URI or an embedded document.
pub fn reference_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => items.first().and_then(reference_id),
        _ => None,
    }
}

/// Addressing field (`to`, `cc`) normalized to a list of ids.
pub fn id_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(reference_id).collect(),
        Some(other) => reference_id(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn string_field(document: &Value, key: &str) -> Option<String> {
    document
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn timestamp_field(document: &Value, key: &str) -> Option<DateTime<Utc>> {
    document
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn required_id(document: &Value) -> Result<String, EnvelopeError> {
    string_field(document, "id").ok_or(EnvelopeError::MissingId)
}

fn is_public_address(address: &str) -> bool {
    address == AS_PUBLIC || address == "as:Public" || address == "Public"
}

/// Reference to an entity, with the embedded document when one was inlined.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub id: String,
    pub embedded: Option<Value>,
}

impl Reference {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = reference_id(value)?;
        let embedded = value.is_object().then(|| value.clone());
        Some(Self { id, embedded })
    }

    /// Type tag of the embedded document, if any.
    pub fn embedded_type(&self) -> Option<&str> {
        self.embedded.as_ref().and_then(type_tag)
    }
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub kind: ApType,
    pub actor: String,
    pub object: Option<Reference>,
    pub target: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub audience: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub document: Value,
}

impl Activity {
    fn build(kind: ApType, document: &Value) -> Result<ApEntity, EnvelopeError> {
        Ok(ApEntity::Activity(Self::parse(kind, document)?))
    }

    pub fn parse(kind: ApType, document: &Value) -> Result<Self, EnvelopeError> {
        let actor = document
            .get("actor")
            .and_then(reference_id)
            .ok_or(EnvelopeError::MissingField("actor"))?;
        Ok(Self {
            id: required_id(document)?,
            kind,
            actor,
            object: document.get("object").and_then(Reference::from_value),
            target: document.get("target").and_then(reference_id),
            to: id_list(document.get("to")),
            cc: id_list(document.get("cc")),
            audience: document.get("audience").and_then(reference_id),
            published: timestamp_field(document, "published"),
            document: document.clone(),
        })
    }

    /// Addressed to the public collection.
    pub fn is_public(&self) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|a| is_public_address(a))
    }

    pub fn addresses(&self, id: &str) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|a| a == id) || self.audience.as_deref() == Some(id)
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref().map(|o| o.id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub id: String,
    pub kind: ApType,
    pub content: Option<String>,
    pub name: Option<String>,
    pub attributed_to: Option<String>,
    pub in_reply_to: Option<String>,
    /// Collection (topic-equivalent) the object belongs to
    pub context: Option<String>,
    pub audience: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub document: Value,
}

impl Object {
    fn build(kind: ApType, document: &Value) -> Result<ApEntity, EnvelopeError> {
        Ok(ApEntity::Object(Self::parse(kind, document)?))
    }

    pub fn parse(kind: ApType, document: &Value) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: required_id(document)?,
            kind,
            content: string_field(document, "content"),
            name: string_field(document, "name"),
            attributed_to: document.get("attributedTo").and_then(reference_id),
            in_reply_to: document.get("inReplyTo").and_then(reference_id),
            context: document.get("context").and_then(reference_id),
            audience: document.get("audience").and_then(reference_id),
            to: id_list(document.get("to")),
            cc: id_list(document.get("cc")),
            published: timestamp_field(document, "published"),
            updated: timestamp_field(document, "updated"),
            document: document.clone(),
        })
    }

    pub fn is_public(&self) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|a| is_public_address(a))
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub kind: ApType,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub document: Value,
}

impl Actor {
    fn build(kind: ApType, document: &Value) -> Result<ApEntity, EnvelopeError> {
        Ok(ApEntity::Actor(Self::parse(kind, document)?))
    }

    pub fn parse(kind: ApType, document: &Value) -> Result<Self, EnvelopeError> {
        let public_key = document.get("publicKey");
        Ok(Self {
            id: required_id(document)?,
            kind,
            preferred_username: string_field(document, "preferredUsername"),
            name: string_field(document, "name"),
            inbox: string_field(document, "inbox"),
            shared_inbox: document
                .get("endpoints")
                .and_then(|e| e.get("sharedInbox"))
                .and_then(Value::as_str)
                .map(str::to_string),
            outbox: string_field(document, "outbox"),
            followers: string_field(document, "followers"),
            public_key_id: public_key.and_then(|k| string_field(k, "id")),
            public_key_pem: public_key.and_then(|k| string_field(k, "publicKeyPem")),
            document: document.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub kind: ApType,
    pub name: Option<String>,
    pub audience: Option<String>,
    pub total_items: Option<u64>,
    /// `items` or `orderedItems`, as given
    pub items: Vec<Value>,
    /// First page, either a link or an embedded page
    pub first: Option<Value>,
    pub next: Option<String>,
    pub document: Value,
}

impl Collection {
    fn build(kind: ApType, document: &Value) -> Result<ApEntity, EnvelopeError> {
        Ok(ApEntity::Collection(Self::parse(kind, document)?))
    }

    pub fn parse(kind: ApType, document: &Value) -> Result<Self, EnvelopeError> {
        let items = document
            .get("orderedItems")
            .or_else(|| document.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            id: required_id(document)?,
            kind,
            name: string_field(document, "name"),
            audience: document.get("audience").and_then(reference_id),
            total_items: document.get("totalItems").and_then(Value::as_u64),
            items,
            first: document.get("first").cloned(),
            next: document.get("next").and_then(reference_id),
            document: document.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Generic {
    pub id: String,
    pub type_name: String,
    pub document: Value,
}

impl Generic {
    fn build(tag: &str, document: &Value) -> Result<ApEntity, EnvelopeError> {
        Ok(ApEntity::Generic(Self {
            id: required_id(document)?,
            type_name: tag.to_string(),
            document: document.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_activity_with_embedded_object() {
        let document = json!({
            "id": "https://remote.example/activities/1",
            "type": "Create",
            "actor": { "id": "https://remote.example/users/alice", "type": "Person" },
            "object": {
                "id": "https://remote.example/notes/1",
                "type": "Note",
                "content": "<p>hi</p>"
            },
            "to": AS_PUBLIC,
            "cc": ["https://remote.example/users/alice/followers"]
        });

        let ApEntity::Activity(activity) = build_entity(&document).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(activity.kind, ApType::Create);
        assert_eq!(activity.actor, "https://remote.example/users/alice");
        assert_eq!(activity.object_id(), Some("https://remote.example/notes/1"));
        assert_eq!(
            activity.object.as_ref().unwrap().embedded_type(),
            Some("Note")
        );
        assert!(activity.is_public());
    }

    #[test]
    fn unknown_type_falls_back_to_generic() {
        let document = json!({
            "id": "https://remote.example/q/1",
            "type": "Question",
        });
        let entity = build_entity(&document).unwrap();
        assert!(matches!(entity, ApEntity::Generic(_)));
        assert_eq!(entity.type_name(), "Question");
    }

    #[test]
    fn type_array_uses_first_string() {
        let document = json!({
            "id": "https://remote.example/groups/1",
            "type": ["Group", "Hashtag"],
            "preferredUsername": "rust",
            "inbox": "https://remote.example/groups/1/inbox",
            "publicKey": { "id": "https://remote.example/groups/1#main-key", "publicKeyPem": "PEM" }
        });
        let ApEntity::Actor(actor) = build_entity(&document).unwrap() else {
            panic!("expected actor");
        };
        assert_eq!(actor.kind, ApType::Group);
        assert_eq!(actor.public_key_pem.as_deref(), Some("PEM"));
    }

    #[test]
    fn collection_reads_ordered_items() {
        let document = json!({
            "id": "https://remote.example/users/alice/outbox",
            "type": "OrderedCollection",
            "totalItems": 2,
            "orderedItems": [{ "id": "a" }, { "id": "b" }],
        });
        let ApEntity::Collection(collection) = build_entity(&document).unwrap() else {
            panic!("expected collection");
        };
        assert_eq!(collection.items.len(), 2);
        assert_eq!(collection.total_items, Some(2));
    }

    #[test]
    fn tag_table_round_trips_names() {
        for (name, kind, _) in TYPE_TABLE {
            assert_eq!(ApType::from_tag(name), Some(*kind));
            assert_eq!(kind.as_str(), *name);
        }
    }
}
