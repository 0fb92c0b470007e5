use crate::models::ResponseItem;

/// Committed transcript of a session. Every turn's items are appended once
/// the turn reaches a terminal state, so each `tool_call` is followed by its
/// `tool_result`.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConversationHistory {
    /// The oldest items are at the beginning of the vector.
    items: Vec<ResponseItem>,
}

impl ConversationHistory {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Returns a clone of the contents in the transcript.
    pub(crate) fn contents(&self) -> Vec<ResponseItem> {
        self.items.clone()
    }

    /// `items` is ordered from oldest to newest.
    pub(crate) fn record_items<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = ResponseItem>,
    {
        for item in items {
            if is_api_message(&item) {
                self.items.push(item);
            }
        }
    }
}

/// System messages are supplied through the prompt instructions and never
/// kept in the transcript.
fn is_api_message(message: &ResponseItem) -> bool {
    match message {
        ResponseItem::Message { role, .. } => role.as_str() != "system",
        ResponseItem::ToolCall { .. } | ResponseItem::ToolResult { .. } => true,
    }
}
