//! Completed vs. in-flight tool calls.
//!
//! A call is completed once it carries a `result` or a `success` flag.
//! Anything else was still executing when its stream stopped, and must not be
//! kept on a message that is being finalized after an abort.

use crate::tools::ToolCall;

pub fn is_tool_call_completed(call: &ToolCall) -> bool {
    call.result.is_some() || call.success.is_some()
}

/// Keeps completed calls only. Returns `None` instead of an empty list so the
/// message serializes without a `tool_calls` field.
pub fn filter_completed_tool_calls(calls: Option<&[ToolCall]>) -> Option<Vec<ToolCall>> {
    let completed: Vec<ToolCall> = calls?
        .iter()
        .filter(|call| is_tool_call_completed(call))
        .cloned()
        .collect();

    if completed.is_empty() {
        None
    } else {
        Some(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> ToolCall {
        ToolCall::new(id, "read_file", "{}")
    }

    fn with_result(id: &str) -> ToolCall {
        let mut call = pending(id);
        call.result = Some("contents".to_string());
        call
    }

    fn with_success_flag(id: &str) -> ToolCall {
        let mut call = pending(id);
        call.success = Some(false);
        call
    }

    #[test]
    fn result_or_success_marks_call_completed() {
        assert!(is_tool_call_completed(&with_result("a")));
        assert!(is_tool_call_completed(&with_success_flag("b")));
        assert!(!is_tool_call_completed(&pending("c")));
    }

    #[test]
    fn mixed_list_keeps_only_completed_calls() {
        let calls = vec![with_result("a"), pending("b"), with_success_flag("c")];

        let filtered = filter_completed_tool_calls(Some(calls.as_slice())).expect("completed calls");

        let ids: Vec<&str> = filtered.iter().map(|call| call.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn all_incomplete_list_yields_none() {
        let calls = vec![pending("a"), pending("b")];
        assert!(filter_completed_tool_calls(Some(calls.as_slice())).is_none());
    }

    #[test]
    fn empty_or_missing_input_yields_none() {
        assert!(filter_completed_tool_calls(Some(&[][..])).is_none());
        assert!(filter_completed_tool_calls(None).is_none());
    }
}
