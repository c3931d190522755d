//! Bulk import of a followed actor's outbox

mod common;

use common::{RemoteServer, TestFederation, activity, note};
use serde_json::{Value, json};
use topicfed::data::{content, store};
use topicfed::federation::{Job, import_outbox, jobs};

struct Outbox {
    t: TestFederation,
    remote: RemoteServer,
    group: String,
    community: String,
    carol: String,
    dave: String,
}

/// A remote community followed by the local `general` Group, with two
/// authors served by the remote server.
async fn outbox(full_topic: bool) -> Outbox {
    let t = TestFederation::new().await;
    let (_category, group) = t.federated_category("general", full_topic).await;
    let remote = RemoteServer::start().await;
    let (community, _key) = remote.put_actor("/c/rust");
    t.store_remote_actor(&community).await;
    t.follow(&group.ap_id, &community).await;
    let (carol, _key) = remote.put_actor("/users/carol");
    let (dave, _key) = remote.put_actor("/users/dave");

    Outbox {
        t,
        remote,
        group: group.ap_id,
        community,
        carol,
        dave,
    }
}

impl Outbox {
    fn url(&self, path: &str) -> String {
        self.remote.url(path)
    }

    fn announce(&self, n: usize, inner: Value) -> Value {
        activity(
            "Announce",
            &self.url(&format!("/activities/announce-{}", n)),
            &self.community,
            inner,
            &[],
        )
    }

    fn serve(&self, items: Vec<Value>) {
        self.remote.put(
            "/c/rust/outbox",
            json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "OrderedCollection",
                "id": self.url("/c/rust/outbox"),
                "totalItems": items.len(),
                "orderedItems": items,
            }),
        );
    }

    /// Topic A by Carol, edited once, with a reply B by Dave.
    fn thread(&self) -> Vec<Value> {
        let a = self.url("/notes/a");
        let b = self.url("/notes/b");
        vec![
            self.announce(
                1,
                activity(
                    "Create",
                    &self.url("/activities/create-a"),
                    &self.carol,
                    note(&a, &self.carol, "<p>Original topic</p>", None),
                    &[],
                ),
            ),
            self.announce(
                2,
                activity(
                    "Create",
                    &self.url("/activities/create-b"),
                    &self.dave,
                    note(&b, &self.dave, "<p>A reply</p>", Some(&a)),
                    &[],
                ),
            ),
            self.announce(
                3,
                activity(
                    "Update",
                    &self.url("/activities/update-a"),
                    &self.carol,
                    note(&a, &self.carol, "<p>Edited topic</p>", None),
                    &[],
                ),
            ),
        ]
    }
}

#[tokio::test]
async fn announced_thread_is_imported_in_its_final_state() {
    let o = outbox(true).await;
    o.serve(o.thread());

    let report = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();

    assert_eq!(report.activities, 3);
    assert_eq!(report.units, 1);
    assert_eq!(report.failed_units, 0);
    assert_eq!(report.objects_created, 2);
    assert_eq!(report.posts_created, 2);

    assert_eq!(o.t.count("topics").await, 1);
    assert_eq!(o.t.count("posts").await, 2);
    assert_eq!(o.t.count("ap_objects").await, 2);
    assert_eq!(o.t.count("ap_collections").await, 1);

    let mut conn = o.t.db().acquire().await.unwrap();
    let a = store::find_object(&mut conn, &o.url("/notes/a"))
        .await
        .unwrap()
        .unwrap();
    let topic_post = content::find_post(&mut conn, a.post_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic_post.content, "<p>Edited topic</p>");

    let b = store::find_object(&mut conn, &o.url("/notes/b"))
        .await
        .unwrap()
        .unwrap();
    let reply = content::find_post(&mut conn, b.post_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.topic_id, topic_post.topic_id);
    assert_eq!(reply.reply_to_post_number, Some(topic_post.post_number));

    // Both authors were fetched; the Creates are recorded, the Announces are not.
    assert!(store::find_actor(&mut conn, &o.carol).await.unwrap().is_some());
    assert!(store::find_actor(&mut conn, &o.dave).await.unwrap().is_some());
    assert!(
        store::find_activity(&mut conn, &o.url("/activities/create-b"))
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store::find_activity(&mut conn, &o.url("/activities/announce-1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn deleted_objects_are_skipped() {
    let o = outbox(true).await;
    let gone = o.url("/notes/gone");
    let mut items = o.thread();
    items.push(activity(
        "Create",
        &o.url("/activities/create-gone"),
        &o.carol,
        note(&gone, &o.carol, "<p>Regrettable</p>", None),
        &[],
    ));
    items.push(activity(
        "Delete",
        &o.url("/activities/delete-gone"),
        &o.carol,
        json!(gone),
        &[],
    ));
    o.serve(items);

    let report = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();

    assert_eq!(report.skipped_deleted, 1);
    assert_eq!(o.t.count("topics").await, 1);
    let mut conn = o.t.db().acquire().await.unwrap();
    assert!(store::find_object(&mut conn, &gone).await.unwrap().is_none());
}

#[tokio::test]
async fn objects_referenced_by_id_are_dereferenced() {
    let o = outbox(true).await;
    let topic = o.url("/notes/byref");
    let reply = o.url("/notes/byref-reply");
    o.remote.put(
        "/notes/byref",
        note(&topic, &o.carol, "<p>Served on its own</p>", None),
    );
    o.remote.put(
        "/notes/byref-reply",
        note(&reply, &o.dave, "<p>Also by reference</p>", Some(&topic)),
    );
    o.serve(vec![
        activity(
            "Create",
            &o.url("/activities/create-byref"),
            &o.carol,
            json!(topic),
            &[],
        ),
        o.announce(
            1,
            activity(
                "Create",
                &o.url("/activities/create-byref-reply"),
                &o.dave,
                json!(reply),
                &[],
            ),
        ),
    ]);

    let report = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();

    assert_eq!(report.units, 1);
    assert_eq!(report.objects_created, 2);
    assert_eq!(report.posts_created, 2);

    let mut conn = o.t.db().acquire().await.unwrap();
    let stored = store::find_object(&mut conn, &topic).await.unwrap().unwrap();
    let post = content::find_post(&mut conn, stored.post_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(post.content, "<p>Served on its own</p>");
}

#[tokio::test]
async fn reimporting_creates_only_what_is_new() {
    let o = outbox(true).await;
    o.serve(o.thread());

    let first = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();
    assert_eq!(first.posts_created, 2);

    let second = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();
    assert_eq!(second.failed_units, 0);
    assert_eq!(second.objects_created, 0);
    assert_eq!(second.posts_created, 0);
    assert_eq!(o.t.count("topics").await, 1);
    assert_eq!(o.t.count("posts").await, 2);
    assert_eq!(o.t.count("ap_objects").await, 2);
    assert_eq!(o.t.count("ap_collections").await, 1);

    // A later reply in the same outbox is the only delta.
    let mut items = o.thread();
    items.push(o.announce(
        4,
        activity(
            "Create",
            &o.url("/activities/create-c"),
            &o.carol,
            note(&o.url("/notes/c"), &o.carol, "<p>Another reply</p>", Some(&o.url("/notes/a"))),
            &[],
        ),
    ));
    o.serve(items);

    let third = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();
    assert_eq!(third.objects_created, 1);
    assert_eq!(third.posts_created, 1);
    assert_eq!(o.t.count("topics").await, 1);
    assert_eq!(o.t.count("posts").await, 3);
}

#[tokio::test]
async fn first_post_categories_import_topics_only() {
    let o = outbox(false).await;
    o.serve(o.thread());

    let report = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();

    assert_eq!(report.skipped_replies, 1);
    assert_eq!(o.t.count("posts").await, 1);
    assert_eq!(o.t.count("ap_collections").await, 0);
}

#[tokio::test]
async fn a_failing_unit_does_not_stop_the_others() {
    let o = outbox(true).await;
    let mut items = o.thread();
    // Author that cannot be dereferenced.
    let ghost = o.url("/users/ghost");
    items.push(activity(
        "Create",
        &o.url("/activities/create-ghost"),
        &ghost,
        note(&o.url("/notes/ghost"), &ghost, "<p>Boo</p>", None),
        &[],
    ));
    o.serve(items);

    let report = import_outbox(&o.t.federation, &o.community, &o.group)
        .await
        .unwrap();

    assert_eq!(report.units, 2);
    assert_eq!(report.failed_units, 1);
    assert_eq!(o.t.count("posts").await, 2);
    assert_eq!(o.t.count("ap_objects").await, 2);
}

#[tokio::test]
async fn import_job_runs_the_import() {
    let o = outbox(true).await;
    o.serve(o.thread());

    jobs::execute(
        &o.t.federation,
        Job::ImportOutbox {
            actor_id: o.community.clone(),
            group_id: o.group.clone(),
        },
    )
    .await;

    assert_eq!(o.t.count("posts").await, 2);
}
