//! Stage handlers for every supported activity and object type.

mod common;
mod content;
mod follow;
mod forward;
mod reaction;

use futures::future::BoxFuture;

use super::engine::Federation;
use super::pipeline::ActivityRun;
use super::registry::{HandlerFn, HandlerRegistry, Stage};
use super::types::ApType;
use crate::error::StageError;

pub(crate) use common::{
    activity_record, ensure_user, group_for_topic, object_record, remote_actor_record,
    sanitize_content, topic_title,
};

/// Box an `async fn(&Federation, &mut ActivityRun)` into a [`HandlerFn`].
macro_rules! boxed {
    ($handler:path) => {{
        fn handler<'a>(
            federation: &'a Federation,
            run: &'a mut ActivityRun,
        ) -> BoxFuture<'a, Result<(), StageError>> {
            Box::pin($handler(federation, run))
        }
        handler as HandlerFn
    }};
}

/// Registry with the handlers for Create, Update, Delete, Follow, Accept,
/// Reject, Undo, Like, Announce, Note and Article.
pub fn default_registry() -> HandlerRegistry {
    use ApType::*;
    use Stage::*;

    let mut registry = HandlerRegistry::new();

    registry
        .register(Create, Resolve, boxed!(common::resolve_sender))
        .register(Create, Resolve, boxed!(content::resolve_create))
        .register(Create, Validate, boxed!(common::reject_duplicate))
        .register(Create, Validate, boxed!(content::validate_create))
        .register(Create, Store, boxed!(common::store_sender))
        .register(Create, Store, boxed!(content::store_created_object))
        .register(Create, Store, boxed!(common::store_activity))
        .register(Create, Perform, boxed!(content::perform_create))
        .register(Create, Forward, boxed!(forward::forward_to_group_followers));

    for kind in [Note, Article] {
        registry.register(kind, Store, boxed!(content::store_post_object));
    }

    registry
        .register(Update, Resolve, boxed!(common::resolve_sender))
        .register(Update, Resolve, boxed!(content::resolve_update))
        .register(Update, Validate, boxed!(common::reject_duplicate))
        .register(Update, Validate, boxed!(content::validate_update))
        .register(Update, Store, boxed!(common::store_sender))
        .register(Update, Store, boxed!(content::store_updated_object))
        .register(Update, Store, boxed!(common::store_activity))
        .register(Update, Perform, boxed!(content::perform_update))
        .register(Update, Forward, boxed!(forward::forward_to_group_followers));

    registry
        .register(Delete, Resolve, boxed!(common::resolve_sender))
        .register(Delete, Resolve, boxed!(common::resolve_stored_object))
        .register(Delete, Validate, boxed!(common::reject_duplicate))
        .register(Delete, Validate, boxed!(content::validate_delete))
        .register(Delete, Store, boxed!(common::store_sender))
        .register(Delete, Store, boxed!(common::store_activity))
        .register(Delete, Perform, boxed!(content::perform_delete))
        .register(Delete, Forward, boxed!(forward::forward_to_group_followers));

    registry
        .register(Follow, Resolve, boxed!(common::resolve_sender))
        .register(Follow, Resolve, boxed!(follow::resolve_follow_target))
        .register(Follow, Validate, boxed!(common::reject_duplicate))
        .register(Follow, Validate, boxed!(follow::validate_follow))
        .register(Follow, Store, boxed!(common::store_sender))
        .register(Follow, Store, boxed!(common::store_activity))
        .register(Follow, Perform, boxed!(follow::perform_follow))
        .register(Follow, RespondTo, boxed!(follow::respond_to_follow));

    registry
        .register(Accept, Resolve, boxed!(common::resolve_sender))
        .register(Accept, Resolve, boxed!(common::resolve_stored_activity))
        .register(Accept, Validate, boxed!(common::reject_duplicate))
        .register(Accept, Validate, boxed!(follow::validate_follow_response))
        .register(Accept, Store, boxed!(common::store_sender))
        .register(Accept, Store, boxed!(common::store_activity))
        .register(Accept, Perform, boxed!(follow::perform_accept));

    registry
        .register(Reject, Resolve, boxed!(common::resolve_sender))
        .register(Reject, Resolve, boxed!(common::resolve_stored_activity))
        .register(Reject, Validate, boxed!(common::reject_duplicate))
        .register(Reject, Validate, boxed!(follow::validate_follow_response))
        .register(Reject, Store, boxed!(common::store_sender))
        .register(Reject, Store, boxed!(common::store_activity))
        .register(Reject, Perform, boxed!(follow::perform_reject));

    registry
        .register(Undo, Resolve, boxed!(common::resolve_sender))
        .register(Undo, Resolve, boxed!(common::resolve_stored_activity))
        .register(Undo, Validate, boxed!(common::reject_duplicate))
        .register(Undo, Validate, boxed!(follow::validate_undo))
        .register(Undo, Store, boxed!(common::store_sender))
        .register(Undo, Store, boxed!(common::store_activity))
        .register(Undo, Perform, boxed!(follow::perform_undo));

    registry
        .register(Like, Resolve, boxed!(common::resolve_sender))
        .register(Like, Resolve, boxed!(common::resolve_stored_object))
        .register(Like, Validate, boxed!(common::reject_duplicate))
        .register(Like, Validate, boxed!(reaction::validate_like))
        .register(Like, Store, boxed!(common::store_sender))
        .register(Like, Store, boxed!(common::store_activity))
        .register(Like, Perform, boxed!(reaction::perform_like));

    registry
        .register(Announce, Resolve, boxed!(common::resolve_sender))
        .register(Announce, Resolve, boxed!(common::resolve_stored_object))
        .register(Announce, Validate, boxed!(common::reject_duplicate))
        .register(Announce, Validate, boxed!(reaction::validate_announce))
        .register(Announce, Store, boxed!(common::store_sender))
        .register(Announce, Store, boxed!(common::store_activity));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_supported_types() {
        let registry = default_registry();
        for kind in [
            ApType::Create,
            ApType::Update,
            ApType::Delete,
            ApType::Follow,
            ApType::Accept,
            ApType::Reject,
            ApType::Undo,
            ApType::Like,
            ApType::Announce,
            ApType::Note,
            ApType::Article,
        ] {
            assert!(registry.supports(kind), "{} has no handlers", kind);
        }
        assert!(!registry.supports(ApType::Person));
        assert!(!registry.supports(ApType::Tombstone));
    }

    #[test]
    fn create_stages_run_in_a_fixed_order() {
        let registry = default_registry();
        assert_eq!(registry.handlers(ApType::Create, Stage::Resolve).len(), 2);
        assert_eq!(registry.handlers(ApType::Create, Stage::Store).len(), 3);
        assert_eq!(registry.handlers(ApType::Create, Stage::RespondTo).len(), 0);
        assert_eq!(registry.handlers(ApType::Follow, Stage::RespondTo).len(), 1);
        assert_eq!(registry.handlers(ApType::Note, Stage::Store).len(), 1);
    }
}
