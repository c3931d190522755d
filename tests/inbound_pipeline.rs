//! Inbound activities through the staged pipeline

mod common;

use common::{TestFederation, activity, note, test_config};
use serde_json::json;
use topicfed::config::{FederationConfig, ForwardingPolicy};
use topicfed::data::{content, store};
use topicfed::federation::{Job, Origin, delivery_key};
use topicfed::notify::ContentEvent;

const ALICE: &str = "https://remote.example/users/alice";
const BOB: &str = "https://other.example/users/bob";
const MALLORY: &str = "https://evil.example/users/mallory";

/// Group of a full-topic category that follows Alice and is followed by Bob.
async fn setup() -> (TestFederation, String) {
    setup_with(test_config()).await
}

async fn setup_with(config: FederationConfig) -> (TestFederation, String) {
    let t = TestFederation::with_config(config).await;
    let (_category, group) = t.federated_category("general", true).await;
    t.store_remote_actor(ALICE).await;
    t.store_remote_actor(BOB).await;
    t.store_remote_actor(MALLORY).await;
    t.follow(&group.ap_id, ALICE).await;
    t.follow(BOB, &group.ap_id).await;
    (t, group.ap_id)
}

fn create_topic(group: &str) -> serde_json::Value {
    activity(
        "Create",
        "https://remote.example/activities/1",
        ALICE,
        note(
            "https://remote.example/notes/1",
            ALICE,
            "<p>Hello <script>alert(1)</script>world</p>",
            None,
        ),
        &[group],
    )
}

#[tokio::test]
async fn create_is_ingested_exactly_once() {
    let (t, group) = setup().await;
    let create = create_topic(&group);
    let mut events = t.federation.notifications().subscribe();

    let outcome = t
        .federation
        .process_document(create.clone(), Origin::default())
        .await
        .unwrap();
    assert!(outcome.stored);
    assert!(matches!(
        events.try_recv(),
        Ok(ContentEvent::PostCreated { .. })
    ));

    let replay = t
        .federation
        .process_document(create, Origin::default())
        .await
        .unwrap_err();
    assert!(replay.is_replay());

    assert_eq!(t.count("topics").await, 1);
    assert_eq!(t.count("posts").await, 1);
    assert_eq!(t.count("ap_objects").await, 1);

    let mut conn = t.db().acquire().await.unwrap();
    let object = store::find_object(&mut conn, "https://remote.example/notes/1")
        .await
        .unwrap()
        .unwrap();
    let post = content::find_post(&mut conn, object.post_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(!post.content.contains("script"));
    assert!(post.content.contains("world"));

    // The remote author is mirrored as a staged user.
    let alice = store::find_actor(&mut conn, ALICE).await.unwrap().unwrap();
    let user = content::find_user(&mut conn, alice.user_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(user.staged);
    assert_eq!(post.user_id, user.id);
}

#[tokio::test]
async fn new_topics_are_announced_to_group_followers() {
    let (t, group) = setup().await;
    t.federation
        .process_document(create_topic(&group), Origin::default())
        .await
        .unwrap();

    let key = delivery_key("https://remote.example/notes/1", &group, BOB);
    let Some(Job::Deliver { activity, .. }) = t.scheduler.job(&key) else {
        panic!("no forward scheduled for Bob");
    };
    assert_eq!(activity["type"], "Announce");
    assert_eq!(activity["actor"], group.as_str());
    assert_eq!(activity["object"]["id"], "https://remote.example/activities/1");

    // The sender never gets its own activity back.
    assert!(
        t.scheduler
            .deliveries()
            .iter()
            .all(|(to, _)| to.as_str() != ALICE)
    );
}

#[tokio::test]
async fn addressed_only_policy_forwards_what_names_the_followers() {
    let (t, group) = setup_with(FederationConfig {
        forwarding_policy: ForwardingPolicy::AddressedOnly,
        ..test_config()
    })
    .await;

    // Public, but only the Group itself is addressed.
    t.federation
        .process_document(create_topic(&group), Origin::default())
        .await
        .unwrap();
    assert_eq!(t.count("posts").await, 1);
    assert!(t.scheduler.deliveries().is_empty());

    let followers = format!("{}/followers", group);
    let addressed = activity(
        "Create",
        "https://remote.example/activities/2",
        ALICE,
        note(
            "https://remote.example/notes/2",
            ALICE,
            "<p>For the followers</p>",
            None,
        ),
        &[&group, &followers],
    );
    t.federation
        .process_document(addressed, Origin::default())
        .await
        .unwrap();

    let key = delivery_key("https://remote.example/notes/2", &group, BOB);
    let Some(Job::Deliver { activity, .. }) = t.scheduler.job(&key) else {
        panic!("addressed activity was not forwarded");
    };
    assert_eq!(activity["object"]["id"], "https://remote.example/activities/2");
    assert_eq!(t.scheduler.deliveries().len(), 1);
}

#[tokio::test]
async fn create_not_addressed_to_a_following_group_is_rejected() {
    let (t, group) = setup().await;
    let create = activity(
        "Create",
        "https://evil.example/activities/1",
        MALLORY,
        note("https://evil.example/notes/1", MALLORY, "spam", None),
        &[&group],
    );

    let error = t
        .federation
        .process_document(create, Origin::default())
        .await
        .unwrap_err();
    assert!(!error.is_replay());
    assert_eq!(error.stage_label(), "validate");
    assert_eq!(t.count("posts").await, 0);
    assert_eq!(t.count("ap_activities").await, 0);
}

#[tokio::test]
async fn announced_create_is_accepted_through_the_announcer() {
    let (t, group) = setup().await;
    let carol = "https://remote.example/users/carol";
    t.store_remote_actor(carol).await;

    let inner = activity(
        "Create",
        "https://remote.example/activities/carol-1",
        carol,
        note("https://remote.example/notes/carol-1", carol, "From Carol", None),
        &[&group],
    );
    let announce = activity(
        "Announce",
        "https://remote.example/activities/announce-1",
        ALICE,
        inner,
        &[],
    );

    let outcome = t
        .federation
        .process_document(announce, Origin::default())
        .await
        .unwrap();
    assert_eq!(outcome.activity_id, "https://remote.example/activities/carol-1");
    assert_eq!(t.count("posts").await, 1);
}

#[tokio::test]
async fn updates_and_deletes_follow_ownership() {
    let (t, group) = setup().await;
    t.federation
        .process_document(create_topic(&group), Origin::default())
        .await
        .unwrap();

    let forged = activity(
        "Update",
        "https://evil.example/activities/2",
        MALLORY,
        note("https://remote.example/notes/1", ALICE, "defaced", None),
        &[],
    );
    assert!(
        t.federation
            .process_document(forged, Origin::default())
            .await
            .is_err()
    );

    let update = activity(
        "Update",
        "https://remote.example/activities/2",
        ALICE,
        note("https://remote.example/notes/1", ALICE, "<p>Edited</p>", None),
        &[],
    );
    t.federation
        .process_document(update, Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    let object = store::find_object(&mut conn, "https://remote.example/notes/1")
        .await
        .unwrap()
        .unwrap();
    let post_id = object.post_id.unwrap();
    let post = content::find_post(&mut conn, post_id).await.unwrap().unwrap();
    assert_eq!(post.content, "<p>Edited</p>");
    drop(conn);

    let delete = activity(
        "Delete",
        "https://remote.example/activities/3",
        ALICE,
        json!("https://remote.example/notes/1"),
        &[],
    );
    t.federation
        .process_document(delete, Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    let object = store::find_object(&mut conn, "https://remote.example/notes/1")
        .await
        .unwrap()
        .unwrap();
    assert!(object.is_tombstone());
    let post = content::find_post(&mut conn, post_id).await.unwrap().unwrap();
    assert!(post.is_deleted());
}

#[tokio::test]
async fn follow_is_recorded_and_answered() {
    let (t, group) = setup().await;
    let dave = "https://remote.example/users/dave";
    t.store_remote_actor(dave).await;

    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Follow",
        "id": "https://remote.example/activities/follow-1",
        "actor": dave,
        "object": group,
    });
    t.federation
        .process_document(follow.clone(), Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    assert!(store::is_following(&mut conn, dave, &group).await.unwrap());
    drop(conn);

    let key = delivery_key("https://remote.example/activities/follow-1", &group, dave);
    let Some(Job::Deliver { activity, .. }) = t.scheduler.job(&key) else {
        panic!("Follow was not answered");
    };
    assert_eq!(activity["type"], "Accept");
    assert_eq!(activity["object"]["id"], "https://remote.example/activities/follow-1");

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Undo",
        "id": "https://remote.example/activities/undo-1",
        "actor": dave,
        "object": follow,
    });
    t.federation
        .process_document(undo, Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    assert!(!store::is_following(&mut conn, dave, &group).await.unwrap());
}

#[tokio::test]
async fn likes_count_once_per_actor_and_can_be_undone() {
    let (t, group) = setup().await;
    t.federation
        .process_document(create_topic(&group), Origin::default())
        .await
        .unwrap();

    let like = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Like",
        "id": "https://other.example/activities/like-1",
        "actor": BOB,
        "object": "https://remote.example/notes/1",
    });
    t.federation
        .process_document(like.clone(), Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    let post_id = store::find_object(&mut conn, "https://remote.example/notes/1")
        .await
        .unwrap()
        .unwrap()
        .post_id
        .unwrap();
    assert_eq!(content::count_likes(&mut conn, post_id).await.unwrap(), 1);
    drop(conn);

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Undo",
        "id": "https://other.example/activities/undo-like-1",
        "actor": BOB,
        "object": like,
    });
    t.federation
        .process_document(undo, Origin::default())
        .await
        .unwrap();

    let mut conn = t.db().acquire().await.unwrap();
    assert_eq!(content::count_likes(&mut conn, post_id).await.unwrap(), 0);
}

#[tokio::test]
async fn unsupported_types_are_rejected_before_any_stage() {
    let (t, _group) = setup().await;
    let block = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Block",
        "id": "https://remote.example/activities/block-1",
        "actor": ALICE,
        "object": BOB,
    });

    let error = t
        .federation
        .process_document(block, Origin::default())
        .await
        .unwrap_err();
    assert_eq!(error.stage_label(), "validate");
    assert_eq!(t.count("ap_activities").await, 0);
}
