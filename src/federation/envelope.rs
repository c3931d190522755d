//! Inbound envelope validation
//!
//! Checks the declared media type and the minimal shape every protocol
//! document must have before it is handed to the type factory.

use serde_json::Value;
use thiserror::Error;

/// ActivityStreams JSON-LD context.
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Public addressing collection.
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Media type used for outbound requests and documents.
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Media type with the ActivityStreams profile, used in `Accept` headers.
pub const LD_JSON_PROFILE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACCEPTED_MEDIA_TYPES: [&str; 2] = ["application/ld+json", ACTIVITY_JSON];

/// Typed rejection of an inbound document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unsupported content type: {0}")]
    UnsupportedMediaType(String),
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("document must be an object or an array of objects")]
    NotAnObject,
    #[error("document is missing the ActivityStreams @context")]
    MissingContext,
    #[error("document is missing an id")]
    MissingId,
    #[error("document is missing a type")]
    MissingType,
    #[error("document is missing {0}")]
    MissingField(&'static str),
}

/// Whether a `Content-Type` header value names one of the protocol media types.
///
/// Parameters such as `profile` or `charset` are ignored.
pub fn is_protocol_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ACCEPTED_MEDIA_TYPES.contains(&essence.as_str())
}

/// Validate raw bytes plus declared content type and return the documents.
///
/// An array body yields one document per element; every element must pass
/// the same checks as a single object body.
pub fn parse_envelope(body: &[u8], content_type: Option<&str>) -> Result<Vec<Value>, EnvelopeError> {
    let content_type = content_type.unwrap_or_default();
    if !is_protocol_media_type(content_type) {
        return Err(EnvelopeError::UnsupportedMediaType(content_type.to_string()));
    }

    let parsed: Value =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    let documents = match parsed {
        Value::Object(_) => vec![parsed],
        Value::Array(items) if !items.is_empty() => items,
        _ => return Err(EnvelopeError::NotAnObject),
    };

    for document in &documents {
        validate_document(document)?;
    }

    Ok(documents)
}

/// Check the required `@context`, `id` and `type` fields of one document.
pub fn validate_document(document: &Value) -> Result<(), EnvelopeError> {
    let object = document.as_object().ok_or(EnvelopeError::NotAnObject)?;

    if !object.get("@context").is_some_and(context_includes_activitystreams) {
        return Err(EnvelopeError::MissingContext);
    }

    match object.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => {}
        _ => return Err(EnvelopeError::MissingId),
    }

    match object.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => {}
        Some(Value::Array(kinds)) if kinds.iter().any(Value::is_string) => {}
        _ => return Err(EnvelopeError::MissingType),
    }

    Ok(())
}

fn context_includes_activitystreams(context: &Value) -> bool {
    match context {
        Value::String(uri) => is_activitystreams_uri(uri),
        Value::Array(entries) => entries.iter().any(context_includes_activitystreams),
        _ => false,
    }
}

fn is_activitystreams_uri(uri: &str) -> bool {
    let trimmed = uri.trim_end_matches('/').trim_end_matches(".jsonld");
    trimmed == AS_CONTEXT || trimmed == "http://www.w3.org/ns/activitystreams"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_create() -> Value {
        json!({
            "@context": AS_CONTEXT,
            "id": "https://remote.example/activities/1",
            "type": "Create",
            "actor": "https://remote.example/users/alice",
            "object": "https://remote.example/notes/1"
        })
    }

    #[test]
    fn accepts_both_media_types_with_parameters() {
        assert!(is_protocol_media_type("application/activity+json"));
        assert!(is_protocol_media_type(LD_JSON_PROFILE));
        assert!(is_protocol_media_type("Application/Activity+JSON; charset=utf-8"));
        assert!(!is_protocol_media_type("application/json"));
        assert!(!is_protocol_media_type("text/html"));
    }

    #[test]
    fn rejects_wrong_content_type() {
        let body = serde_json::to_vec(&note_create()).unwrap();
        assert!(matches!(
            parse_envelope(&body, Some("application/json")),
            Err(EnvelopeError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            parse_envelope(&body, None),
            Err(EnvelopeError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn accepts_context_inside_array() {
        let mut document = note_create();
        document["@context"] = json!([
            "https://www.w3.org/ns/activitystreams",
            { "toot": "http://joinmastodon.org/ns#" }
        ]);
        let body = serde_json::to_vec(&document).unwrap();
        let documents = parse_envelope(&body, Some(ACTIVITY_JSON)).unwrap();
        assert_eq!(documents.len(), 1);
    }

    #[test]
    fn rejects_missing_fields() {
        let mut missing_context = note_create();
        missing_context.as_object_mut().unwrap().remove("@context");
        assert_eq!(
            validate_document(&missing_context),
            Err(EnvelopeError::MissingContext)
        );

        let mut missing_id = note_create();
        missing_id.as_object_mut().unwrap().remove("id");
        assert_eq!(validate_document(&missing_id), Err(EnvelopeError::MissingId));

        let mut missing_type = note_create();
        missing_type["type"] = json!(null);
        assert_eq!(
            validate_document(&missing_type),
            Err(EnvelopeError::MissingType)
        );
    }

    #[test]
    fn rejects_scalars_and_garbage() {
        assert_eq!(
            parse_envelope(b"42", Some(ACTIVITY_JSON)),
            Err(EnvelopeError::NotAnObject)
        );
        assert!(matches!(
            parse_envelope(b"{not json", Some(ACTIVITY_JSON)),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn array_body_validates_every_element() {
        let mut broken = note_create();
        broken.as_object_mut().unwrap().remove("id");
        let body = serde_json::to_vec(&json!([note_create(), broken])).unwrap();
        assert_eq!(
            parse_envelope(&body, Some(ACTIVITY_JSON)),
            Err(EnvelopeError::MissingId)
        );
    }
}
