//! Host content model
//!
//! The forum side of the bridge: users, categories, topics, posts and likes.
//! The federation engine only creates, edits and trashes content through
//! these functions.

use chrono::Utc;
use sqlx::SqliteConnection;

use super::models::*;
use crate::error::AppError;

// =============================================================================
// Users
// =============================================================================

pub async fn create_user(
    conn: &mut SqliteConnection,
    username: &str,
    name: Option<&str>,
    staged: bool,
) -> Result<User, AppError> {
    let username = available_username(conn, username).await?;
    Ok(sqlx::query_as::<_, User>(
        "INSERT INTO users (username, name, staged, created_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(&username)
    .bind(name)
    .bind(staged)
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?)
}

pub async fn find_user(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>, AppError> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Normalize `wanted` and append a counter until it is unused.
async fn available_username(
    conn: &mut SqliteConnection,
    wanted: &str,
) -> Result<String, AppError> {
    let base: String = wanted
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let base = if base.is_empty() { "user".to_string() } else { base };

    let mut candidate = base.clone();
    let mut suffix = 1;
    loop {
        let taken: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM users WHERE username = ? COLLATE NOCASE")
                .bind(&candidate)
                .fetch_optional(&mut *conn)
                .await?;
        if taken.is_none() {
            return Ok(candidate);
        }
        suffix += 1;
        candidate = format!("{}{}", base, suffix);
    }
}

// =============================================================================
// Categories
// =============================================================================

pub async fn create_category(
    conn: &mut SqliteConnection,
    name: &str,
    slug: &str,
    full_topic: bool,
) -> Result<Category, AppError> {
    Ok(sqlx::query_as::<_, Category>(
        "INSERT INTO categories (name, slug, full_topic, created_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(name)
    .bind(slug)
    .bind(full_topic)
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?)
}

pub async fn find_category(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Category>, AppError> {
    Ok(
        sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

// =============================================================================
// Topics & posts
// =============================================================================

pub async fn create_topic(
    conn: &mut SqliteConnection,
    category_id: Option<i64>,
    user_id: i64,
    title: &str,
) -> Result<Topic, AppError> {
    Ok(sqlx::query_as::<_, Topic>(
        "INSERT INTO topics (category_id, user_id, title, created_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(category_id)
    .bind(user_id)
    .bind(title)
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?)
}

pub async fn find_topic(conn: &mut SqliteConnection, id: i64) -> Result<Option<Topic>, AppError> {
    Ok(sqlx::query_as::<_, Topic>("SELECT * FROM topics WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Append a post to a topic; the first post of a topic gets number 1.
pub async fn create_post(
    conn: &mut SqliteConnection,
    topic_id: i64,
    user_id: i64,
    content: &str,
    reply_to_post_number: Option<i64>,
) -> Result<Post, AppError> {
    let now = Utc::now();
    Ok(sqlx::query_as::<_, Post>(
        r#"
        INSERT INTO posts (topic_id, user_id, post_number, reply_to_post_number, content, created_at, updated_at)
        VALUES (?, ?, (SELECT COALESCE(MAX(post_number), 0) + 1 FROM posts WHERE topic_id = ?), ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(topic_id)
    .bind(user_id)
    .bind(topic_id)
    .bind(reply_to_post_number)
    .bind(content)
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?)
}

pub async fn find_post(conn: &mut SqliteConnection, id: i64) -> Result<Option<Post>, AppError> {
    Ok(sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn find_post_by_number(
    conn: &mut SqliteConnection,
    topic_id: i64,
    post_number: i64,
) -> Result<Option<Post>, AppError> {
    Ok(
        sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE topic_id = ? AND post_number = ?")
            .bind(topic_id)
            .bind(post_number)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn topic_posts(conn: &mut SqliteConnection, topic_id: i64) -> Result<Vec<Post>, AppError> {
    Ok(
        sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE topic_id = ? ORDER BY post_number")
            .bind(topic_id)
            .fetch_all(&mut *conn)
            .await?,
    )
}

pub async fn update_post_content(
    conn: &mut SqliteConnection,
    post_id: i64,
    content: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE posts SET content = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(content)
    .bind(Utc::now())
    .bind(post_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Soft-delete a post. Returns false when it was already trashed.
pub async fn trash_post(conn: &mut SqliteConnection, post_id: i64) -> Result<bool, AppError> {
    let result =
        sqlx::query("UPDATE posts SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now())
            .bind(post_id)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Likes
// =============================================================================

pub async fn add_like(
    conn: &mut SqliteConnection,
    post_id: i64,
    user_id: i64,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "INSERT INTO post_likes (post_id, user_id, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(post_id)
    .bind(user_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_like(
    conn: &mut SqliteConnection,
    post_id: i64,
    user_id: i64,
) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM post_likes WHERE post_id = ? AND user_id = ?")
        .bind(post_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_likes(conn: &mut SqliteConnection, post_id: i64) -> Result<i64, AppError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM post_likes WHERE post_id = ?")
        .bind(post_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}
