//! Continuity markers carried in an assistant message's side-channel state.
//!
//! These keys are a private contract between turns. The caller stores the
//! state blob and hands it back unchanged on the next turn.

use relay_common::{Message, Role, StateMap};
use serde_json::Value;

/// Marks a state blob holding a UMS conversation id.
pub const UMS_CONVERSATION_ID: &str = "ums_conversation_id";

/// Flags a state blob as produced by the general-purpose agent.
pub const IS_GPA: &str = "is_gpa";

/// Snapshot of the general-purpose agent's own state for that reply.
pub const GPA_MESSAGES: &str = "gpa_messages";

/// First UMS conversation id found scanning the messages in order.
pub fn find_ums_conversation_id(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(Message::state)
        .find_map(|state| state.get(UMS_CONVERSATION_ID)?.as_str().map(str::to_string))
}

pub fn ums_state(conversation_id: &str) -> StateMap {
    let mut state = StateMap::new();
    state.insert(
        UMS_CONVERSATION_ID.to_string(),
        Value::String(conversation_id.to_string()),
    );
    state
}

/// Wrap a GPA snapshot so a later turn can recognise it.
pub fn gpa_state(snapshot: StateMap) -> StateMap {
    let mut state = StateMap::new();
    state.insert(IS_GPA.to_string(), Value::Bool(true));
    state.insert(GPA_MESSAGES.to_string(), Value::Object(snapshot));
    state
}

/// Whether this message is an assistant reply produced by the GPA gateway.
pub fn is_gpa_reply(message: &Message) -> bool {
    message.role == Role::Assistant
        && message
            .state()
            .and_then(|s| s.get(IS_GPA))
            .and_then(Value::as_bool)
            == Some(true)
}

/// The GPA snapshot stored under the marker, if it is a mapping.
pub fn gpa_snapshot(state: &StateMap) -> Option<&StateMap> {
    state.get(GPA_MESSAGES)?.as_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::CustomContent;
    use serde_json::json;

    fn assistant_with(state: Value) -> Message {
        Message::assistant("reply").with_custom_content(CustomContent::with_state(
            state.as_object().cloned().unwrap_or_default(),
        ))
    }

    #[test]
    fn finds_first_ums_id_in_forward_order() {
        let messages = vec![
            Message::user("a"),
            assistant_with(json!({"ums_conversation_id": "first"})),
            Message::user("b"),
            assistant_with(json!({"ums_conversation_id": "second"})),
            Message::user("c"),
        ];
        assert_eq!(find_ums_conversation_id(&messages).as_deref(), Some("first"));
    }

    #[test]
    fn ignores_user_messages_and_non_string_ids() {
        let user = Message::user("x").with_custom_content(CustomContent::with_state(ums_state("u")));
        let messages = vec![user, assistant_with(json!({"ums_conversation_id": 42}))];
        assert_eq!(find_ums_conversation_id(&messages), None);
    }

    #[test]
    fn gpa_marker_round_trips() {
        let snapshot = json!({"k": 2}).as_object().cloned().unwrap();
        let state = gpa_state(snapshot.clone());
        let message = Message::assistant("x").with_custom_content(CustomContent::with_state(state));

        assert!(is_gpa_reply(&message));
        assert_eq!(gpa_snapshot(message.state().unwrap()), Some(&snapshot));
    }

    #[test]
    fn ums_state_is_not_gpa() {
        let message =
            Message::assistant("x").with_custom_content(CustomContent::with_state(ums_state("c")));
        assert!(!is_gpa_reply(&message));
    }
}
