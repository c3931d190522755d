//! Database tests

use super::*;
use chrono::NaiveDate;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn remote_actor(ap_id: &str, domain: &str) -> NewActor {
    NewActor {
        ap_id: ap_id.to_string(),
        ap_type: "Person".to_string(),
        username: Some("alice".to_string()),
        domain: domain.to_string(),
        inbox: Some(format!("{}/inbox", ap_id)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_actor_upsert_reports_insert_once() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let actor = remote_actor("https://remote.example/users/alice", "remote.example");
    let (first_id, inserted) = store::upsert_actor(&mut conn, &actor).await.unwrap();
    assert!(inserted);

    let mut renamed = actor.clone();
    renamed.name = Some("Alice".to_string());
    renamed.public_key_pem = None;
    let (second_id, inserted) = store::upsert_actor(&mut conn, &renamed).await.unwrap();
    assert!(!inserted);
    assert_eq!(first_id, second_id);

    let stored = store::find_actor(&mut conn, &actor.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.name.as_deref(), Some("Alice"));
    assert!(stored.available);
    assert_eq!(stored.key_id(), "https://remote.example/users/alice#main-key");
}

#[tokio::test]
async fn test_object_upsert_keeps_post_link() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let user = content::create_user(&mut conn, "alice", None, true)
        .await
        .unwrap();
    let topic = content::create_topic(&mut conn, None, user.id, "Hello")
        .await
        .unwrap();
    let post = content::create_post(&mut conn, topic.id, user.id, "<p>hi</p>", None)
        .await
        .unwrap();

    let object = NewObject {
        ap_id: "https://remote.example/notes/1".to_string(),
        ap_type: "Note".to_string(),
        content: Some("<p>hi</p>".to_string()),
        document: "{}".to_string(),
        ..Default::default()
    };
    let (object_id, inserted) = store::upsert_object(&mut conn, &object).await.unwrap();
    assert!(inserted);
    store::link_object_post(&mut conn, object_id, post.id)
        .await
        .unwrap();

    let mut edited = object.clone();
    edited.content = Some("<p>edited</p>".to_string());
    let (_, inserted) = store::upsert_object(&mut conn, &edited).await.unwrap();
    assert!(!inserted);

    let stored = store::find_object_by_post(&mut conn, post.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.content.as_deref(), Some("<p>edited</p>"));

    assert!(store::tombstone_object(&mut conn, &object.ap_id).await.unwrap());
    let stored = store::find_object(&mut conn, &object.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_tombstone());
}

#[tokio::test]
async fn test_activity_upsert_is_immutable() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let activity = NewActivity {
        ap_id: "https://remote.example/activities/1".to_string(),
        ap_type: "Like".to_string(),
        actor: "https://remote.example/users/alice".to_string(),
        object: Some("https://local.example/ap/note/abc".to_string()),
        document: "{}".to_string(),
        ..Default::default()
    };
    let (id, inserted) = store::upsert_activity(&mut conn, &activity).await.unwrap();
    assert!(inserted);
    assert!(store::activity_exists(&mut conn, &activity.ap_id).await.unwrap());

    let mut changed = activity.clone();
    changed.ap_type = "Announce".to_string();
    let (same_id, inserted) = store::upsert_activity(&mut conn, &changed).await.unwrap();
    assert!(!inserted);
    assert_eq!(id, same_id);

    let stored = store::find_activity(&mut conn, &activity.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.ap_type, "Like");
}

#[tokio::test]
async fn test_follow_operations() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let group = "https://local.example/ap/group/abc";
    let alice = remote_actor("https://remote.example/users/alice", "remote.example");
    let bob = remote_actor("https://down.example/users/bob", "down.example");
    store::upsert_actor(&mut conn, &alice).await.unwrap();
    store::upsert_actor(&mut conn, &bob).await.unwrap();

    assert!(store::add_follow(&mut conn, &alice.ap_id, group).await.unwrap());
    assert!(!store::add_follow(&mut conn, &alice.ap_id, group).await.unwrap());
    store::add_follow(&mut conn, &bob.ap_id, group).await.unwrap();
    assert_eq!(store::count_followers(&mut conn, group).await.unwrap(), 2);

    store::set_domain_available(&mut conn, "down.example", false)
        .await
        .unwrap();
    let followers = store::available_followers(&mut conn, group).await.unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].ap_id, alice.ap_id);

    assert!(store::remove_follow(&mut conn, &alice.ap_id, group).await.unwrap());
    assert!(!store::is_following(&mut conn, &alice.ap_id, group).await.unwrap());
}

#[tokio::test]
async fn test_failure_days_collapse_per_day() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    store::add_failure_day(&mut conn, "remote.example", day)
        .await
        .unwrap();
    store::add_failure_day(&mut conn, "remote.example", day)
        .await
        .unwrap();
    store::add_failure_day(&mut conn, "remote.example", day.succ_opt().unwrap())
        .await
        .unwrap();

    assert_eq!(
        store::count_failure_days(&mut conn, "remote.example")
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        store::clear_failure_days(&mut conn, "remote.example")
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        store::count_failure_days(&mut conn, "remote.example")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_post_numbers_and_trash() {
    let (db, _temp_dir) = create_test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let user = content::create_user(&mut conn, "Alice Smith", None, false)
        .await
        .unwrap();
    assert_eq!(user.username, "alice_smith");
    let duplicate = content::create_user(&mut conn, "alice_smith", None, true)
        .await
        .unwrap();
    assert_eq!(duplicate.username, "alice_smith2");

    let topic = content::create_topic(&mut conn, None, user.id, "Topic")
        .await
        .unwrap();
    let first = content::create_post(&mut conn, topic.id, user.id, "first", None)
        .await
        .unwrap();
    let reply = content::create_post(&mut conn, topic.id, user.id, "reply", Some(1))
        .await
        .unwrap();
    assert!(first.is_first_post());
    assert_eq!(reply.post_number, 2);
    assert_eq!(reply.reply_to_post_number, Some(1));

    assert!(content::trash_post(&mut conn, reply.id).await.unwrap());
    assert!(!content::trash_post(&mut conn, reply.id).await.unwrap());
    assert!(
        !content::update_post_content(&mut conn, reply.id, "edit")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_transaction_rolls_back_on_drop() {
    let (db, _temp_dir) = create_test_db().await;

    {
        let mut tx = db.begin().await.unwrap();
        store::upsert_actor(
            &mut tx,
            &remote_actor("https://remote.example/users/carol", "remote.example"),
        )
        .await
        .unwrap();
    }

    let mut conn = db.acquire().await.unwrap();
    assert!(
        store::find_actor(&mut conn, "https://remote.example/users/carol")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_writes_are_visible_on_other_connections() {
    let (db, _temp_dir) = create_test_db().await;

    let mut writer = db.acquire().await.unwrap();
    let category = content::create_category(&mut writer, "General", "general", true)
        .await
        .unwrap();
    let user = content::create_user(&mut writer, "alice", None, false)
        .await
        .unwrap();
    let actor = remote_actor("https://remote.example/users/alice", "remote.example");
    let (actor_id, _) = store::upsert_actor(&mut writer, &actor).await.unwrap();
    // The writer stays checked out while the reader queries.
    let mut reader = db.acquire().await.unwrap();

    let found = content::find_category(&mut reader, category.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.slug, "general");
    assert!(content::find_user(&mut reader, user.id).await.unwrap().is_some());
    let stored = store::find_actor(&mut reader, &actor.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, actor_id);

    // The update path of an upsert is read the same way.
    let mut renamed = actor.clone();
    renamed.name = Some("Alice".to_string());
    store::upsert_actor(&mut writer, &renamed).await.unwrap();
    let stored = store::find_actor(&mut reader, &actor.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.name.as_deref(), Some("Alice"));
}
