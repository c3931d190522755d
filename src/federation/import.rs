//! Bulk outbox import
//!
//! After a remote actor accepts a Group's Follow, its outbox is imported
//! into the Group's category. Activities are flattened, classified and
//! merged first, so only the final state of each object is persisted.
//! Each conversation tree is one unit of work with its own transaction;
//! a failed unit is rolled back and the import moves on to the next one.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::data::{ActorRecord, NewCollection, content, store};
use crate::error::AppError;
use crate::metrics::IMPORTS_TOTAL;
use crate::notify::ContentEvent;

use super::engine::Federation;
use super::handlers::{
    activity_record, ensure_user, object_record, remote_actor_record, sanitize_content, topic_title,
};
use super::types::{self, Activity, Actor, ApEntity, ApType, Object};

/// Outbox pages followed before giving up.
pub const MAX_OUTBOX_PAGES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Activities read from the outbox after unwrapping Announces.
    pub activities: usize,
    /// Creates dropped because their object was deleted.
    pub skipped_deleted: usize,
    /// Replies dropped because the category imports first posts only.
    pub skipped_replies: usize,
    pub units: usize,
    pub failed_units: usize,
    /// Objects with no resolvable post.
    pub orphans: usize,
    pub objects_created: usize,
    pub posts_created: usize,
}

/// A Create whose object has been merged with its Updates.
#[derive(Debug, Clone)]
struct Entry {
    activity: Activity,
    object: Object,
}

/// One conversation tree.
#[derive(Debug)]
struct Unit {
    /// Stored object the root replies to, for trees continuing a known topic.
    anchor: Option<String>,
    /// Object ids, parents before children.
    order: Vec<String>,
}

#[derive(Default)]
struct Buckets {
    creates: Vec<Activity>,
    updates: Vec<Activity>,
    deletes: HashSet<String>,
}

/// Import the outbox of `actor_id` into the category federated by `group_id`.
pub async fn import_outbox(
    federation: &Federation,
    actor_id: &str,
    group_id: &str,
) -> Result<ImportReport, AppError> {
    let mut conn = federation.db().acquire().await?;
    let group = store::find_actor(&mut conn, group_id)
        .await?
        .filter(|group| group.local)
        .ok_or(AppError::NotFound)?;
    let category_id = group
        .category_id()
        .ok_or_else(|| AppError::Validation(format!("{} federates no category", group_id)))?;
    let category = content::find_category(&mut conn, category_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let stored_actor = store::find_actor(&mut conn, actor_id).await?;
    drop(conn);

    let outbox = match stored_actor.and_then(|actor| actor.outbox) {
        Some(outbox) => outbox,
        None => federation
            .fetcher()
            .fetch_actor(actor_id)
            .await?
            .and_then(|actor| actor.outbox)
            .ok_or_else(|| AppError::Federation(format!("{} has no outbox", actor_id)))?,
    };

    let items = collect_outbox(federation, &outbox).await?;
    let activities = flatten(federation, items).await;

    let mut report = ImportReport {
        activities: activities.len(),
        ..Default::default()
    };

    let mut buckets = classify(activities);
    embed_objects(federation, &mut buckets).await?;
    let entries = merge(buckets, &mut report);
    let (units, orphans) = plan_units(federation, &entries, category.full_topic, &mut report).await?;

    remove_orphans(federation, &orphans).await?;
    report.orphans = orphans.len();

    let mut actors: HashMap<String, Option<Actor>> = HashMap::new();
    for unit in units {
        report.units += 1;
        match import_unit(federation, &entries, &unit, &group, &category, &mut actors).await {
            Ok((objects, posts)) => {
                IMPORTS_TOTAL.with_label_values(&["outbox", "success"]).inc();
                report.objects_created += objects;
                report.posts_created += posts;
            }
            Err(error) => {
                IMPORTS_TOTAL.with_label_values(&["outbox", "failure"]).inc();
                report.failed_units += 1;
                tracing::warn!(
                    actor = %actor_id,
                    root = unit.order.first().map(String::as_str).unwrap_or_default(),
                    %error,
                    "Outbox unit rolled back"
                );
            }
        }
    }

    tracing::info!(
        actor = %actor_id,
        group = %group_id,
        activities = report.activities,
        units = report.units,
        failed_units = report.failed_units,
        posts_created = report.posts_created,
        "Outbox imported"
    );
    Ok(report)
}

// =============================================================================
// Collection walking
// =============================================================================

/// Every item of the outbox, following `first` and `next` page links.
async fn collect_outbox(federation: &Federation, outbox: &str) -> Result<Vec<Value>, AppError> {
    let document = federation
        .fetcher()
        .fetch_document(outbox)
        .await?
        .ok_or_else(|| AppError::Federation(format!("outbox {} not found", outbox)))?;
    let collection = as_collection(&document)?;

    let mut items = collection.items;
    let mut visited: HashSet<String> = HashSet::from([collection.id]);
    let mut next_page = match collection.first {
        Some(Value::String(url)) => Some(url),
        Some(page @ Value::Object(_)) => {
            let page = as_collection(&page)?;
            visited.insert(page.id);
            items.extend(page.items);
            page.next
        }
        _ => collection.next,
    };

    let mut pages = 0;
    while let Some(url) = next_page.take() {
        if !visited.insert(url.clone()) {
            break;
        }
        pages += 1;
        if pages > MAX_OUTBOX_PAGES {
            tracing::warn!(outbox = %outbox, "Outbox page limit reached");
            break;
        }

        let Some(document) = federation.fetcher().fetch_document(&url).await? else {
            break;
        };
        let page = as_collection(&document)?;
        items.extend(page.items);
        next_page = page.next;
    }

    Ok(items)
}

fn as_collection(document: &Value) -> Result<types::Collection, AppError> {
    match types::build_entity(document)? {
        ApEntity::Collection(collection) => Ok(collection),
        other => Err(AppError::Federation(format!(
            "{} is a {}, not a collection",
            other.id(),
            other.type_name()
        ))),
    }
}

/// Outbox items as activities, with `Announce(activity)` replaced by the
/// announced activity.
async fn flatten(federation: &Federation, items: Vec<Value>) -> Vec<Activity> {
    let mut activities = Vec::with_capacity(items.len());

    for item in items {
        let Some(activity) = dereference_activity(federation, item).await else {
            continue;
        };
        if activity.kind != ApType::Announce {
            activities.push(activity);
            continue;
        }

        let Some(inner) = activity.object.as_ref() else {
            continue;
        };
        let inner = inner
            .embedded
            .clone()
            .unwrap_or_else(|| Value::String(inner.id.clone()));
        if let Some(inner) = dereference_activity(federation, inner).await {
            if inner.kind != ApType::Announce {
                activities.push(inner);
            }
        }
    }

    activities
}

async fn dereference_activity(federation: &Federation, item: Value) -> Option<Activity> {
    let document = match item {
        Value::String(url) => match federation.fetcher().fetch_document(&url).await {
            Ok(Some(document)) => document,
            Ok(None) => return None,
            Err(error) => {
                tracing::debug!(url = %url, %error, "Outbox item could not be fetched");
                return None;
            }
        },
        document => document,
    };

    match types::build_entity(&document) {
        Ok(ApEntity::Activity(activity)) => Some(activity),
        _ => None,
    }
}

// =============================================================================
// Classification and merging
// =============================================================================

fn classify(activities: Vec<Activity>) -> Buckets {
    let mut buckets = Buckets::default();
    for activity in activities {
        match activity.kind {
            ApType::Create => buckets.creates.push(activity),
            ApType::Update => buckets.updates.push(activity),
            ApType::Delete => {
                if let Some(object_id) = activity.object_id() {
                    buckets.deletes.insert(object_id.to_string());
                }
            }
            _ => {}
        }
    }
    buckets
}

/// Give every Create and Update that carries only an object id the object
/// itself. Known objects come from the store, others are dereferenced.
async fn embed_objects(federation: &Federation, buckets: &mut Buckets) -> Result<(), AppError> {
    let mut documents: HashMap<String, Option<Value>> = HashMap::new();

    for activity in buckets.creates.iter_mut().chain(buckets.updates.iter_mut()) {
        let Some(reference) = activity.object.as_mut() else {
            continue;
        };
        if reference.embedded.is_some() || buckets.deletes.contains(&reference.id) {
            continue;
        }

        if !documents.contains_key(&reference.id) {
            let document = object_document(federation, &reference.id).await?;
            documents.insert(reference.id.clone(), document);
        }
        reference.embedded = documents.get(&reference.id).cloned().flatten();
    }

    Ok(())
}

async fn object_document(federation: &Federation, object_id: &str) -> Result<Option<Value>, AppError> {
    let mut conn = federation.db().acquire().await?;
    let known = store::find_object(&mut conn, object_id).await?;
    drop(conn);

    let document = match known {
        Some(record) => serde_json::from_str::<Value>(&record.document).ok(),
        None => match federation.fetcher().fetch_document(object_id).await {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(object = %object_id, %error, "Outbox object could not be fetched");
                None
            }
        },
    };

    Ok(document.filter(|document| types::reference_id(document).as_deref() == Some(object_id)))
}

/// Final state of every surviving Create, keyed by object id.
fn merge(buckets: Buckets, report: &mut ImportReport) -> HashMap<String, Entry> {
    let Buckets {
        creates,
        mut updates,
        deletes,
    } = buckets;

    // Oldest first so the newest Update is applied last.
    updates.sort_by_key(|update| update.published);
    let mut patches: HashMap<String, Vec<(String, Value)>> = HashMap::new();
    for update in updates {
        let Some(reference) = update.object else {
            continue;
        };
        if let Some(patch) = reference.embedded {
            patches
                .entry(reference.id)
                .or_default()
                .push((update.actor, patch));
        }
    }

    let mut entries = HashMap::new();
    for create in creates {
        let Some(reference) = create.object.clone() else {
            continue;
        };
        if deletes.contains(&reference.id) {
            report.skipped_deleted += 1;
            continue;
        }
        if entries.contains_key(&reference.id) {
            continue;
        }
        let Some(mut document) = reference.embedded else {
            continue;
        };

        for (editor, patch) in patches.get(&reference.id).into_iter().flatten() {
            if *editor == create.actor {
                merge_object(&mut document, patch);
            }
        }

        let object = match types::build_entity(&document) {
            Ok(ApEntity::Object(object)) if object.kind.is_post_like() => object,
            _ => continue,
        };

        let mut activity = create;
        if let Some(slot) = activity.document.get_mut("object") {
            *slot = document;
        }
        entries.insert(reference.id, Entry { activity, object });
    }

    entries
}

/// Shallow merge of an updated object into the created one.
fn merge_object(target: &mut Value, patch: &Value) {
    let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (key, value) in patch {
        if key == "id" || key == "type" {
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Split entries into conversation trees. Returns the units and the ids of
/// orphaned objects.
async fn plan_units(
    federation: &Federation,
    entries: &HashMap<String, Entry>,
    full_topic: bool,
    report: &mut ImportReport,
) -> Result<(Vec<Unit>, Vec<String>), AppError> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<(&str, Option<String>)> = Vec::new();
    let mut orphans = Vec::new();

    let mut ids: Vec<&String> = entries.keys().collect();
    ids.sort_by(|a, b| {
        (entries[*a].object.published, a).cmp(&(entries[*b].object.published, b))
    });

    let mut conn = federation.db().acquire().await?;
    for id in ids {
        let object = &entries[id].object;
        match object.in_reply_to.as_deref() {
            None => roots.push((id.as_str(), None)),
            Some(_) if !full_topic => report.skipped_replies += 1,
            Some(parent) if entries.contains_key(parent) => {
                children.entry(parent).or_default().push(id.as_str());
            }
            Some(parent) => {
                let anchored = store::find_object(&mut conn, parent)
                    .await?
                    .is_some_and(|stored| stored.post_id.is_some() && !stored.is_tombstone());
                if anchored {
                    roots.push((id.as_str(), Some(parent.to_string())));
                } else {
                    orphans.push(id.clone());
                }
            }
        }
    }

    let mut placed: HashSet<&str> = HashSet::new();
    let mut units = Vec::with_capacity(roots.len());
    for (root, anchor) in roots {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !placed.insert(id) {
                continue;
            }
            order.push(id.to_string());
            queue.extend(children.get(id).into_iter().flatten().copied());
        }
        units.push(Unit { anchor, order });
    }

    // Replies whose chain never reaches a root.
    if full_topic {
        for id in entries.keys() {
            if entries[id].object.in_reply_to.is_some()
                && !placed.contains(id.as_str())
                && !orphans.contains(id)
            {
                orphans.push(id.clone());
            }
        }
    }

    Ok((units, orphans))
}

/// Drop previously persisted orphans that never got a post.
async fn remove_orphans(federation: &Federation, orphans: &[String]) -> Result<(), AppError> {
    if orphans.is_empty() {
        return Ok(());
    }

    let mut tx = federation.db().begin().await?;
    for id in orphans {
        let Some(stored) = store::find_object(&mut tx, id).await? else {
            continue;
        };
        if stored.post_id.is_none() {
            store::delete_activities_for_object(&mut tx, id).await?;
            store::delete_object(&mut tx, id).await?;
            tracing::debug!(object = %id, "Removed orphaned object");
        }
    }
    tx.commit().await?;
    Ok(())
}

// =============================================================================
// Persistence
// =============================================================================

fn author_of(entry: &Entry) -> &str {
    entry
        .object
        .attributed_to
        .as_deref()
        .unwrap_or(entry.activity.actor.as_str())
}

/// Dereference the authors of a unit that are neither stored nor cached.
async fn resolve_authors(
    federation: &Federation,
    entries: &HashMap<String, Entry>,
    unit: &Unit,
    cache: &mut HashMap<String, Option<Actor>>,
) -> Result<(), AppError> {
    for id in &unit.order {
        let author = author_of(&entries[id]);
        if cache.contains_key(author) {
            continue;
        }

        let mut conn = federation.db().acquire().await?;
        if store::find_actor(&mut conn, author).await?.is_some() {
            cache.insert(author.to_string(), None);
            continue;
        }
        drop(conn);

        let actor = federation
            .fetcher()
            .fetch_actor(author)
            .await?
            .ok_or_else(|| AppError::Federation(format!("author {} not found", author)))?;
        cache.insert(author.to_string(), Some(actor));
    }
    Ok(())
}

/// Persist one conversation tree. Returns (objects created, posts created).
async fn import_unit(
    federation: &Federation,
    entries: &HashMap<String, Entry>,
    unit: &Unit,
    group: &ActorRecord,
    category: &crate::data::Category,
    cache: &mut HashMap<String, Option<Actor>>,
) -> Result<(usize, usize), AppError> {
    resolve_authors(federation, entries, unit, cache).await?;

    let root_id = unit
        .order
        .first()
        .ok_or_else(|| AppError::Validation("empty import unit".to_string()))?;
    let root = &entries[root_id];

    let mut tx = federation.db().begin().await?;
    let root_post = store::find_object(&mut tx, root_id)
        .await?
        .and_then(|stored| stored.post_id);

    // Actors
    let mut actors: HashMap<String, ActorRecord> = HashMap::new();
    for id in &unit.order {
        let author = author_of(&entries[id]);
        if actors.contains_key(author) {
            continue;
        }
        if let Some(Some(actor)) = cache.get(author) {
            store::upsert_actor(&mut tx, &remote_actor_record(actor)).await?;
        }
        let record = store::find_actor(&mut tx, author)
            .await?
            .ok_or_else(|| AppError::Federation(format!("author {} is unknown", author)))?;
        actors.insert(author.to_string(), record);
    }

    // Collection
    let collection = if category.full_topic && unit.anchor.is_none() && root_post.is_none() {
        let ap_id = root
            .object
            .context
            .clone()
            .unwrap_or_else(|| federation.mint_id("OrderedCollection"));
        store::upsert_collection(
            &mut tx,
            &NewCollection {
                ap_id: ap_id.clone(),
                ap_type: "OrderedCollection".to_string(),
                name: root.object.name.clone(),
                audience: Some(group.ap_id.clone()),
                local: false,
                topic_id: None,
            },
        )
        .await?;
        Some(ap_id)
    } else {
        None
    };

    // Objects
    let mut objects_created = 0;
    let mut rows: HashMap<&str, i64> = HashMap::new();
    for id in &unit.order {
        let entry = &entries[id];
        let mut record = object_record(&entry.object, false);
        if record.context.is_none() {
            record.context = collection.clone();
        }
        let (row, inserted) = store::upsert_object(&mut tx, &record).await?;
        if inserted {
            objects_created += 1;
        }
        rows.insert(id.as_str(), row);
    }

    // Users
    let mut users: HashMap<String, i64> = HashMap::new();
    for (author, actor) in actors.iter_mut() {
        let user_id = ensure_user(&mut tx, actor).await?;
        users.insert(author.clone(), user_id);
    }

    // Posts, parents first
    let mut events = Vec::new();
    let mut numbers: HashMap<&str, (i64, i64)> = HashMap::new();
    for id in &unit.order {
        let entry = &entries[id];
        let user_id = users[author_of(entry)];

        let existing = match store::find_object(&mut tx, id).await?.and_then(|o| o.post_id) {
            Some(post_id) => content::find_post(&mut tx, post_id).await?,
            None => None,
        };
        let post = match existing {
            Some(post) => post,
            None => {
                let body = sanitize_content(entry.object.content.as_deref().unwrap_or_default());
                let parent = match entry.object.in_reply_to.as_deref() {
                    Some(parent) => Some(match numbers.get(parent) {
                        Some(found) => *found,
                        None => anchor_position(&mut tx, parent).await?.ok_or_else(|| {
                            AppError::Validation(format!("parent {} has no live post", parent))
                        })?,
                    }),
                    None => None,
                };

                let post = match parent {
                    Some((topic_id, number)) => {
                        content::create_post(&mut tx, topic_id, user_id, &body, Some(number)).await?
                    }
                    None => {
                        let title = topic_title(
                            entry.object.name.as_deref(),
                            entry.object.content.as_deref(),
                        );
                        let topic =
                            content::create_topic(&mut tx, Some(category.id), user_id, &title)
                                .await?;
                        if let Some(collection) = &collection {
                            store::upsert_collection(
                                &mut tx,
                                &NewCollection {
                                    ap_id: collection.clone(),
                                    ap_type: "OrderedCollection".to_string(),
                                    topic_id: Some(topic.id),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        }
                        content::create_post(&mut tx, topic.id, user_id, &body, None).await?
                    }
                };
                store::link_object_post(&mut tx, rows[id.as_str()], post.id).await?;
                events.push(ContentEvent::PostCreated {
                    post_id: post.id,
                    topic_id: post.topic_id,
                });
                post
            }
        };
        numbers.insert(id.as_str(), (post.topic_id, post.post_number));
    }

    // Activities
    for id in &unit.order {
        let entry = &entries[id];
        let record = activity_record(
            &entry.activity,
            Some(entry.object.kind.as_str().to_string()),
            false,
        );
        store::upsert_activity(&mut tx, &record).await?;
    }

    tx.commit().await?;

    let posts_created = events.len();
    for event in events {
        federation.notifications().publish(event);
    }
    Ok((objects_created, posts_created))
}

/// Topic and post number of a stored, live parent outside the unit.
async fn anchor_position(
    conn: &mut sqlx::SqliteConnection,
    parent: &str,
) -> Result<Option<(i64, i64)>, AppError> {
    let Some(post_id) = store::find_object(conn, parent).await?.and_then(|o| o.post_id) else {
        return Ok(None);
    };
    Ok(content::find_post(conn, post_id)
        .await?
        .filter(|post| !post.is_deleted())
        .map(|post| (post.topic_id, post.post_number)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity(document: Value) -> Activity {
        match types::build_entity(&document).unwrap() {
            ApEntity::Activity(activity) => activity,
            other => panic!("not an activity: {:?}", other),
        }
    }

    fn note(id: &str, content: &str) -> Value {
        json!({
            "id": id,
            "type": "Note",
            "content": content,
            "attributedTo": "https://remote.example/users/alice"
        })
    }

    fn wrap(kind: &str, id: &str, object: Value) -> Activity {
        activity(json!({
            "id": id,
            "type": kind,
            "actor": "https://remote.example/users/alice",
            "object": object
        }))
    }

    #[test]
    fn updates_merge_and_deletes_drop() {
        let x = "https://remote.example/notes/x";
        let y = "https://remote.example/notes/y";
        let buckets = classify(vec![
            wrap("Create", "https://remote.example/c/x", note(x, "first")),
            wrap("Create", "https://remote.example/c/y", note(y, "gone")),
            wrap("Update", "https://remote.example/u/x", json!({ "id": x, "type": "Note", "content": "final" })),
            wrap("Delete", "https://remote.example/d/y", json!(y)),
        ]);
        assert_eq!(buckets.creates.len(), 2);
        assert_eq!(buckets.updates.len(), 1);

        let mut report = ImportReport::default();
        let entries = merge(buckets, &mut report);
        assert_eq!(entries.len(), 1);
        assert_eq!(report.skipped_deleted, 1);

        let entry = &entries[x];
        assert_eq!(entry.object.content.as_deref(), Some("final"));
        assert_eq!(entry.activity.document["object"]["content"], "final");
    }

    #[test]
    fn merge_keeps_identity_fields() {
        let mut target = note("https://remote.example/notes/1", "a");
        merge_object(
            &mut target,
            &json!({ "id": "https://evil.example/1", "type": "Article", "name": "T" }),
        );
        assert_eq!(target["id"], "https://remote.example/notes/1");
        assert_eq!(target["type"], "Note");
        assert_eq!(target["name"], "T");
    }

    #[test]
    fn duplicate_creates_keep_the_first() {
        let x = "https://remote.example/notes/x";
        let buckets = classify(vec![
            wrap("Create", "https://remote.example/c/1", note(x, "one")),
            wrap("Create", "https://remote.example/c/2", note(x, "two")),
        ]);
        let entries = merge(buckets, &mut ImportReport::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[x].activity.id, "https://remote.example/c/1");
    }
}
