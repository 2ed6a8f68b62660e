use uuid::Uuid;

use crate::tools::ToolCall;

/// Fragment of a tool call as it arrives from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialToolCall {
    pub id: String,
    /// The stream sent no id; `id` was generated when the call first appeared.
    pub generated_id: bool,
    pub tool_type: String,
    pub name: String,
    pub arguments: String,
}

impl PartialToolCall {
    fn new(id: String, tool_type: String, name: String, arguments: String) -> Self {
        let generated_id = id.is_empty();
        let id = if generated_id {
            format!("call_{}", Uuid::new_v4())
        } else {
            id
        };
        Self {
            id,
            generated_id,
            tool_type,
            name,
            arguments,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    parts: Vec<PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, call: ToolCall) {
        update_partial_tool_call(&mut self.parts, call);
    }

    pub fn extend<I>(&mut self, calls: I)
    where
        I: IntoIterator<Item = ToolCall>,
    {
        for call in calls {
            self.update(call);
        }
    }

    /// Current view of the calls without consuming the accumulator. Ids match
    /// those of earlier snapshots and of [`ToolCallAccumulator::finalize`].
    pub fn snapshot(&self) -> Vec<ToolCall> {
        finalize_tool_calls(self.parts.clone())
    }

    pub fn finalize(self) -> Vec<ToolCall> {
        finalize_tool_calls(self.parts)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

pub fn update_partial_tool_call(parts: &mut Vec<PartialToolCall>, call: ToolCall) {
    let ToolCall {
        id,
        tool_type,
        function,
        ..
    } = call;

    if id.is_empty() && function.name.is_empty() {
        if function.arguments.is_empty() {
            return;
        }
        match parts.last_mut() {
            Some(last) => last.arguments.push_str(&function.arguments),
            None => parts.push(PartialToolCall::new(
                id,
                tool_type,
                String::new(),
                function.arguments,
            )),
        }
        return;
    }

    let existing = if !id.is_empty() {
        parts.iter_mut().find(|part| part.id == id)
    } else {
        parts
            .iter_mut()
            .find(|part| part.generated_id && (part.name == function.name || part.name.is_empty()))
    };

    match existing {
        Some(existing) => {
            existing.arguments.push_str(&function.arguments);
            if !function.name.is_empty() {
                existing.name = function.name;
            }
            if !tool_type.is_empty() {
                existing.tool_type = tool_type;
            }
        }
        None => parts.push(PartialToolCall::new(
            id,
            tool_type,
            function.name,
            function.arguments,
        )),
    }
}

pub fn finalize_tool_calls(parts: Vec<PartialToolCall>) -> Vec<ToolCall> {
    parts
        .into_iter()
        .filter(|part| !part.name.trim().is_empty())
        .map(|part| {
            let mut call = ToolCall::new(part.id, part.name, part.arguments);
            if !part.tool_type.is_empty() {
                call.tool_type = part.tool_type;
            }
            call
        })
        .collect()
}
