use std::collections::HashSet;

use crate::types::{Message, Role};

/// A scoring unit: one message, or a tool chain that must move atomically.
/// Indices point into the candidate slice the group was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageGroup {
    pub indices: Vec<usize>,
}

impl MessageGroup {
    fn single(index: usize) -> Self {
        Self {
            indices: vec![index],
        }
    }
}

/// Fold adjacent messages with matching tool-use / tool-result ids into
/// atomic groups. A chain is complete when every pending id is resolved; a
/// following assistant message that emits no new tool use belongs to the
/// chain (it is the model's reading of the results).
pub fn group_tool_chains(messages: &[Message]) -> Vec<MessageGroup> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let uses = messages[i].tool_use_ids();
        if uses.is_empty() {
            groups.push(MessageGroup::single(i));
            i += 1;
            continue;
        }

        let mut pending: HashSet<String> = uses.into_iter().map(str::to_string).collect();
        let mut indices = vec![i];
        let mut j = i + 1;
        while j < messages.len() && !pending.is_empty() {
            for resolved in messages[j].tool_result_ids() {
                pending.remove(resolved);
            }
            for new_use in messages[j].tool_use_ids() {
                pending.insert(new_use.to_string());
            }
            indices.push(j);
            j += 1;
        }

        // Closing assistant commentary rides with its chain.
        if pending.is_empty()
            && j < messages.len()
            && messages[j].role == Role::Assistant
            && messages[j].tool_use_ids().is_empty()
        {
            indices.push(j);
            j += 1;
        }

        groups.push(MessageGroup { indices });
        i = j;
    }
    groups
}

/// One group per message; used when tool-chain grouping is disabled.
pub fn singleton_groups(len: usize) -> Vec<MessageGroup> {
    (0..len).map(MessageGroup::single).collect()
}
