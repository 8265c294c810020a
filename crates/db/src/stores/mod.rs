//! Durable [`ContextStore`] backends.
//!
//! Both backends keep the serialized context next to its blake3 digest and refuse to
//! hand back a payload whose digest no longer matches.

use loanflow_core::context::StoreError;
use loanflow_core::domain::conversation::{ConversationContext, SessionId};

pub mod file;
pub mod sql;

pub use file::FileContextStore;
pub use sql::SqlContextStore;

pub(crate) struct EncodedContext {
    pub payload: String,
    pub digest: String,
}

pub(crate) fn encode(context: &ConversationContext) -> Result<EncodedContext, StoreError> {
    let payload =
        serde_json::to_string(context).map_err(|error| StoreError::Codec(error.to_string()))?;
    let digest = digest(&payload);
    Ok(EncodedContext { payload, digest })
}

pub(crate) fn decode(
    session_id: &SessionId,
    payload: &str,
    expected_digest: &str,
) -> Result<ConversationContext, StoreError> {
    if payload.trim().is_empty() {
        return Err(corrupt(session_id, "stored payload is empty"));
    }
    if digest(payload) != expected_digest {
        return Err(corrupt(session_id, "payload digest mismatch"));
    }

    let context: ConversationContext = serde_json::from_str(payload)
        .map_err(|error| corrupt(session_id, &format!("payload does not decode: {error}")))?;
    if &context.session_id != session_id {
        return Err(corrupt(
            session_id,
            &format!("payload belongs to session `{}`", context.session_id),
        ));
    }
    Ok(context)
}

pub(crate) fn digest(payload: &str) -> String {
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

pub(crate) fn corrupt(session_id: &SessionId, reason: &str) -> StoreError {
    StoreError::Corrupt { session_id: session_id.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use loanflow_core::context::StoreError;
    use loanflow_core::domain::conversation::{ConversationContext, SessionId};
    use serde_json::json;

    use super::{decode, encode};

    #[test]
    fn encoded_context_decodes_back() {
        let mut context = ConversationContext::new(SessionId::from("session_aaaaaaaaaaaa"), None);
        context.add_collected_data("monthly_salary", json!(85000));
        let encoded = encode(&context).expect("encode");

        let decoded =
            decode(&context.session_id, &encoded.payload, &encoded.digest).expect("decode");
        assert_eq!(decoded, context);
    }

    #[test]
    fn tampered_or_empty_payloads_are_corrupt() {
        let context = ConversationContext::new(SessionId::from("session_bbbbbbbbbbbb"), None);
        let encoded = encode(&context).expect("encode");
        let tampered = encoded.payload.replace("initiation", "completion");

        assert!(matches!(
            decode(&context.session_id, &tampered, &encoded.digest),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(matches!(
            decode(&context.session_id, "  ", &encoded.digest),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn payload_for_another_session_is_rejected() {
        let context = ConversationContext::new(SessionId::from("session_cccccccccccc"), None);
        let encoded = encode(&context).expect("encode");

        let result = decode(&SessionId::from("session_dddddddddddd"), &encoded.payload, &encoded.digest);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
