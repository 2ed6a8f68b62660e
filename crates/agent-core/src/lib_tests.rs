use super::*;

#[test]
fn conversation_stamps_its_id_on_added_messages() {
    let mut conversation = Conversation::new("conv-1");
    let id = conversation.add_message(Message::user("Hello"));

    let message = conversation.message(&id).expect("message");
    assert_eq!(message.conversation_id, "conv-1");
    assert_eq!(message.role, Role::User);
    assert_eq!(message.state, MessageState::Complete);
}

#[test]
fn branch_stamps_its_own_id_on_messages() {
    let mut branch = Branch::new(BranchKind::Subagent);
    branch.push_message(Message::user("task").with_conversation_id("conv-1"));

    assert_eq!(branch.messages[0].conversation_id, branch.id);
}

#[test]
fn preceding_user_message_skips_other_roles() {
    let mut conversation = Conversation::new("conv-1");
    conversation.add_message(Message::user("first"));
    conversation.add_message(Message::assistant("answer", None));
    conversation.add_message(Message::tool_result("call_1", "output"));
    let index = conversation.messages.len();

    let user = conversation.preceding_user_message(index).expect("user turn");
    assert_eq!(user.content, "first");
    assert!(conversation.preceding_user_message(0).is_none());
}

#[test]
fn assistant_draft_starts_loading() {
    let draft = Message::assistant_draft();

    assert!(draft.is_loading);
    assert_eq!(draft.state, MessageState::Draft);
    assert!(!draft.has_content());
}

#[test]
fn message_serializes_without_empty_optionals() {
    let message = Message::assistant("plain", None);
    let json = serde_json::to_value(&message).unwrap();

    assert!(json.get("tool_calls").is_none());
    assert!(json.get("branches").is_none());
    assert_eq!(json["state"], "complete");
}

#[test]
fn branch_metadata_keeps_free_form_fields() {
    let metadata = BranchMetadata::for_task("summarize")
        .with_extra("source_message_id", "msg-1");
    let mut branch = Branch::new(BranchKind::HumanRetry).with_metadata(metadata);
    branch.set_state(SubagentState::MaxIterations);

    let json = serde_json::to_string(&branch).unwrap();
    let restored: Branch = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.metadata.task.as_deref(), Some("summarize"));
    assert_eq!(restored.metadata.extra["source_message_id"], "msg-1");
    assert_eq!(restored.state(), Some(SubagentState::MaxIterations));
    assert!(json.contains("\"max_iterations\""));
}

#[test]
fn agent_error_classifies_cancellation() {
    assert!(AgentError::Cancelled.is_cancellation());
    assert!(!AgentError::LLM("boom".to_string()).is_cancellation());
}

#[test]
fn tool_call_apply_result_completes_call() {
    let mut call = ToolCall::new("call_1", "search", "{}");
    assert!(!is_tool_call_completed(&call));

    call.apply_result(&ToolResult::ok("hits"));

    assert!(is_tool_call_completed(&call));
    assert_eq!(call.success, Some(true));
}

#[test]
fn snapshots_carry_increasing_revisions() {
    let mut conversation = Conversation::new("conv-1");
    let first = conversation.snapshot();
    let second = conversation.snapshot();

    assert!(second.revision > first.revision);
    assert_eq!(conversation.revision, second.revision);

    let legacy: Conversation = serde_json::from_value(serde_json::json!({
        "id": "conv-2",
        "messages": [],
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    }))
    .unwrap();
    assert_eq!(legacy.revision, 0);
}
