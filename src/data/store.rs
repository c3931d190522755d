//! Federation graph persistence
//!
//! Every entity kind has an idempotent upsert keyed by its global id that
//! reports whether the row was newly inserted.
//!
//! Writes with `RETURNING` are read with `fetch_all` so sqlite steps the
//! statement to completion and the write is visible to other connections.

use chrono::{NaiveDate, Utc};
use sqlx::SqliteConnection;

use super::models::*;
use crate::error::AppError;

/// Row id plus whether the upsert inserted a new row.
pub type Upserted = (i64, bool);

// =============================================================================
// Actors
// =============================================================================

pub async fn upsert_actor(
    conn: &mut SqliteConnection,
    actor: &NewActor,
) -> Result<Upserted, AppError> {
    let now = Utc::now();
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ap_actors (
            ap_id, ap_type, username, name, domain, inbox, outbox,
            public_key_pem, private_key_pem, local, available,
            model_type, model_id, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
        ON CONFLICT(ap_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&actor.ap_id)
    .bind(&actor.ap_type)
    .bind(&actor.username)
    .bind(&actor.name)
    .bind(&actor.domain)
    .bind(&actor.inbox)
    .bind(&actor.outbox)
    .bind(&actor.public_key_pem)
    .bind(&actor.private_key_pem)
    .bind(actor.local)
    .bind(&actor.model_type)
    .bind(actor.model_id)
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next();

    if let Some((id,)) = inserted {
        return Ok((id, true));
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        UPDATE ap_actors SET
            ap_type = ?,
            username = COALESCE(?, username),
            name = COALESCE(?, name),
            inbox = COALESCE(?, inbox),
            outbox = COALESCE(?, outbox),
            public_key_pem = COALESCE(?, public_key_pem),
            private_key_pem = COALESCE(?, private_key_pem),
            model_type = COALESCE(?, model_type),
            model_id = COALESCE(?, model_id),
            updated_at = ?
        WHERE ap_id = ?
        RETURNING id
        "#,
    )
    .bind(&actor.ap_type)
    .bind(&actor.username)
    .bind(&actor.name)
    .bind(&actor.inbox)
    .bind(&actor.outbox)
    .bind(&actor.public_key_pem)
    .bind(&actor.private_key_pem)
    .bind(&actor.model_type)
    .bind(actor.model_id)
    .bind(now)
    .bind(&actor.ap_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?;

    Ok((id, false))
}

pub async fn find_actor(
    conn: &mut SqliteConnection,
    ap_id: &str,
) -> Result<Option<ActorRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, ActorRecord>("SELECT * FROM ap_actors WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn find_actor_by_model(
    conn: &mut SqliteConnection,
    model_type: &str,
    model_id: i64,
) -> Result<Option<ActorRecord>, AppError> {
    Ok(sqlx::query_as::<_, ActorRecord>(
        "SELECT * FROM ap_actors WHERE model_type = ? AND model_id = ? ORDER BY local DESC LIMIT 1",
    )
    .bind(model_type)
    .bind(model_id)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn find_local_actor_by_username(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<ActorRecord>, AppError> {
    Ok(sqlx::query_as::<_, ActorRecord>(
        "SELECT * FROM ap_actors WHERE local = 1 AND username = ? COLLATE NOCASE",
    )
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn link_actor_model(
    conn: &mut SqliteConnection,
    actor_id: i64,
    model_type: &str,
    model_id: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE ap_actors SET model_type = ?, model_id = ?, updated_at = ? WHERE id = ?")
        .bind(model_type)
        .bind(model_id)
        .bind(Utc::now())
        .bind(actor_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// =============================================================================
// Collections
// =============================================================================

pub async fn upsert_collection(
    conn: &mut SqliteConnection,
    collection: &NewCollection,
) -> Result<Upserted, AppError> {
    let now = Utc::now();
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ap_collections (ap_id, ap_type, name, audience, local, topic_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ap_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&collection.ap_id)
    .bind(&collection.ap_type)
    .bind(&collection.name)
    .bind(&collection.audience)
    .bind(collection.local)
    .bind(collection.topic_id)
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next();

    if let Some((id,)) = inserted {
        return Ok((id, true));
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        UPDATE ap_collections SET
            name = COALESCE(?, name),
            audience = COALESCE(?, audience),
            topic_id = COALESCE(?, topic_id),
            updated_at = ?
        WHERE ap_id = ?
        RETURNING id
        "#,
    )
    .bind(&collection.name)
    .bind(&collection.audience)
    .bind(collection.topic_id)
    .bind(now)
    .bind(&collection.ap_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?;

    Ok((id, false))
}

pub async fn find_collection(
    conn: &mut SqliteConnection,
    ap_id: &str,
) -> Result<Option<CollectionRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, CollectionRecord>("SELECT * FROM ap_collections WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn find_collection_by_topic(
    conn: &mut SqliteConnection,
    topic_id: i64,
) -> Result<Option<CollectionRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, CollectionRecord>("SELECT * FROM ap_collections WHERE topic_id = ?")
            .bind(topic_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

/// Object ids that belong to a collection, in publication order.
pub async fn collection_items(
    conn: &mut SqliteConnection,
    collection_ap_id: &str,
) -> Result<Vec<String>, AppError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT ap_id FROM ap_objects WHERE context = ? ORDER BY published_at, id",
    )
    .bind(collection_ap_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(ap_id,)| ap_id).collect())
}

// =============================================================================
// Objects
// =============================================================================

pub async fn upsert_object(
    conn: &mut SqliteConnection,
    object: &NewObject,
) -> Result<Upserted, AppError> {
    let now = Utc::now();
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ap_objects (
            ap_id, ap_type, content, name, attributed_to, in_reply_to, context,
            audience, published_at, local, document, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ap_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&object.ap_id)
    .bind(&object.ap_type)
    .bind(&object.content)
    .bind(&object.name)
    .bind(&object.attributed_to)
    .bind(&object.in_reply_to)
    .bind(&object.context)
    .bind(&object.audience)
    .bind(object.published_at)
    .bind(object.local)
    .bind(&object.document)
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next();

    if let Some((id,)) = inserted {
        return Ok((id, true));
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        UPDATE ap_objects SET
            ap_type = ?,
            content = ?,
            name = COALESCE(?, name),
            attributed_to = COALESCE(?, attributed_to),
            in_reply_to = COALESCE(?, in_reply_to),
            context = COALESCE(?, context),
            audience = COALESCE(?, audience),
            published_at = COALESCE(?, published_at),
            document = ?,
            updated_at = ?
        WHERE ap_id = ?
        RETURNING id
        "#,
    )
    .bind(&object.ap_type)
    .bind(&object.content)
    .bind(&object.name)
    .bind(&object.attributed_to)
    .bind(&object.in_reply_to)
    .bind(&object.context)
    .bind(&object.audience)
    .bind(object.published_at)
    .bind(&object.document)
    .bind(now)
    .bind(&object.ap_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?;

    Ok((id, false))
}

pub async fn find_object(
    conn: &mut SqliteConnection,
    ap_id: &str,
) -> Result<Option<ObjectRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, ObjectRecord>("SELECT * FROM ap_objects WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn find_object_by_post(
    conn: &mut SqliteConnection,
    post_id: i64,
) -> Result<Option<ObjectRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, ObjectRecord>("SELECT * FROM ap_objects WHERE post_id = ?")
            .bind(post_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn link_object_post(
    conn: &mut SqliteConnection,
    object_id: i64,
    post_id: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE ap_objects SET post_id = ?, updated_at = ? WHERE id = ?")
        .bind(post_id)
        .bind(Utc::now())
        .bind(object_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Replace an object with a Tombstone, keeping its id reserved.
pub async fn tombstone_object(conn: &mut SqliteConnection, ap_id: &str) -> Result<bool, AppError> {
    let document = serde_json::json!({ "id": ap_id, "type": "Tombstone" }).to_string();
    let result = sqlx::query(
        "UPDATE ap_objects SET ap_type = 'Tombstone', content = NULL, document = ?, updated_at = ? WHERE ap_id = ?",
    )
    .bind(document)
    .bind(Utc::now())
    .bind(ap_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_object(conn: &mut SqliteConnection, ap_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM ap_objects WHERE ap_id = ?")
        .bind(ap_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// =============================================================================
// Activities
// =============================================================================

/// Activities are immutable once stored; a conflicting insert is a no-op.
pub async fn upsert_activity(
    conn: &mut SqliteConnection,
    activity: &NewActivity,
) -> Result<Upserted, AppError> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO ap_activities (
            ap_id, ap_type, actor, object, object_type, target, public,
            published_at, local, document, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ap_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&activity.ap_id)
    .bind(&activity.ap_type)
    .bind(&activity.actor)
    .bind(&activity.object)
    .bind(&activity.object_type)
    .bind(&activity.target)
    .bind(activity.public)
    .bind(activity.published_at)
    .bind(activity.local)
    .bind(&activity.document)
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next();

    if let Some((id,)) = inserted {
        return Ok((id, true));
    }

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM ap_activities WHERE ap_id = ?")
        .bind(&activity.ap_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok((id, false))
}

pub async fn find_activity(
    conn: &mut SqliteConnection,
    ap_id: &str,
) -> Result<Option<ActivityRecord>, AppError> {
    Ok(
        sqlx::query_as::<_, ActivityRecord>("SELECT * FROM ap_activities WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn activity_exists(conn: &mut SqliteConnection, ap_id: &str) -> Result<bool, AppError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM ap_activities WHERE ap_id = ?")
        .bind(ap_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Most recent activity of `ap_type` by `actor` on `object`.
pub async fn find_activity_by(
    conn: &mut SqliteConnection,
    ap_type: &str,
    actor: &str,
    object: &str,
) -> Result<Option<ActivityRecord>, AppError> {
    Ok(sqlx::query_as::<_, ActivityRecord>(
        "SELECT * FROM ap_activities WHERE ap_type = ? AND actor = ? AND object = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(ap_type)
    .bind(actor)
    .bind(object)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn delete_activities_for_object(
    conn: &mut SqliteConnection,
    object_ap_id: &str,
) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM ap_activities WHERE object = ?")
        .bind(object_ap_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Public Create activities published by `actor`, newest first.
pub async fn outbox_activities(
    conn: &mut SqliteConnection,
    actor: &str,
    limit: i64,
) -> Result<Vec<ActivityRecord>, AppError> {
    Ok(sqlx::query_as::<_, ActivityRecord>(
        r#"
        SELECT * FROM ap_activities
        WHERE actor = ? AND public = 1 AND ap_type IN ('Create', 'Announce')
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(actor)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?)
}

// =============================================================================
// Follows
// =============================================================================

pub async fn add_follow(
    conn: &mut SqliteConnection,
    follower: &str,
    followed: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "INSERT INTO ap_follows (follower, followed, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(follower)
    .bind(followed)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_follow(
    conn: &mut SqliteConnection,
    follower: &str,
    followed: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM ap_follows WHERE follower = ? AND followed = ?")
        .bind(follower)
        .bind(followed)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn is_following(
    conn: &mut SqliteConnection,
    follower: &str,
    followed: &str,
) -> Result<bool, AppError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT follower FROM ap_follows WHERE follower = ? AND followed = ?")
            .bind(follower)
            .bind(followed)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.is_some())
}

/// Followers of `followed` whose domain is not quarantined.
pub async fn available_followers(
    conn: &mut SqliteConnection,
    followed: &str,
) -> Result<Vec<ActorRecord>, AppError> {
    Ok(sqlx::query_as::<_, ActorRecord>(
        r#"
        SELECT a.* FROM ap_actors a
        JOIN ap_follows f ON f.follower = a.ap_id
        WHERE f.followed = ? AND a.available = 1
        ORDER BY f.created_at
        "#,
    )
    .bind(followed)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn count_followers(conn: &mut SqliteConnection, followed: &str) -> Result<i64, AppError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ap_follows WHERE followed = ?")
        .bind(followed)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

// =============================================================================
// Domain delivery health
// =============================================================================

/// Record a failure day; repeated calls for the same day are collapsed.
pub async fn add_failure_day(
    conn: &mut SqliteConnection,
    domain: &str,
    day: NaiveDate,
) -> Result<(), AppError> {
    sqlx::query("INSERT INTO ap_domain_failures (domain, day) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(domain)
        .bind(day.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn count_failure_days(conn: &mut SqliteConnection, domain: &str) -> Result<i64, AppError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(DISTINCT day) FROM ap_domain_failures WHERE domain = ?")
            .bind(domain)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

pub async fn clear_failure_days(conn: &mut SqliteConnection, domain: &str) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM ap_domain_failures WHERE domain = ?")
        .bind(domain)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Flip availability of every actor at `domain`; returns the number of actors changed.
pub async fn set_domain_available(
    conn: &mut SqliteConnection,
    domain: &str,
    available: bool,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "UPDATE ap_actors SET available = ?, updated_at = ? WHERE domain = ? AND local = 0 AND available != ?",
    )
    .bind(available)
    .bind(Utc::now())
    .bind(domain)
    .bind(available)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn domain_available(conn: &mut SqliteConnection, domain: &str) -> Result<bool, AppError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT COUNT(*) FROM ap_actors WHERE domain = ? AND local = 0 AND available = 0",
    )
    .bind(domain)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(count,)| count == 0).unwrap_or(true))
}

/// Number of remote domains with at least one actor marked unavailable.
pub async fn count_quarantined_domains(conn: &mut SqliteConnection) -> Result<i64, AppError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT domain) FROM ap_actors WHERE local = 0 AND available = 0",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}
