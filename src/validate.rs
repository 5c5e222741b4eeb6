use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::ValidationError;
use crate::types::{ContentBlock, Message, MessageContent};

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"))
}

fn block_is_valid(block: &ContentBlock) -> Result<(), ValidationError> {
    match block {
        ContentBlock::Text { .. } => Ok(()),
        ContentBlock::ToolUse { id, name, .. } => {
            if name.is_empty() || !id_pattern().is_match(id) {
                Err(ValidationError::InvalidToolUseId(id.clone()))
            } else {
                Ok(())
            }
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => {
            if !id_pattern().is_match(tool_use_id) || content.is_null() {
                Err(ValidationError::InvalidToolResultBlock(tool_use_id.clone()))
            } else {
                Ok(())
            }
        }
    }
}

/// Strict validation: the first malformed block fails the whole batch.
pub fn validate(messages: &[Message]) -> Result<(), ValidationError> {
    for msg in messages {
        if let MessageContent::Blocks(blocks) = &msg.content {
            for block in blocks {
                block_is_valid(block)?;
            }
        }
    }
    Ok(())
}

/// Lenient validation: drop malformed blocks, then drop messages whose
/// content became empty. Well-formed input comes back unchanged.
pub fn sanitize(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match &msg.content {
            MessageContent::Text(t) => {
                if !t.is_empty() {
                    out.push(msg.clone());
                }
            }
            MessageContent::Blocks(blocks) => {
                let kept: Vec<ContentBlock> = blocks
                    .iter()
                    .filter(|b| match block_is_valid(b) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(error = %e, "dropping malformed content block");
                            false
                        }
                    })
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    if kept.len() == blocks.len() {
                        out.push(msg.clone());
                    } else {
                        out.push(Message {
                            id: msg.id.clone(),
                            role: msg.role,
                            content: MessageContent::Blocks(kept),
                        });
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::{json, Value};

    fn use_block(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.into(),
            name: "exec".into(),
            input: json!({}),
        }
    }

    #[test]
    fn well_formed_messages_unaltered() {
        let messages = vec![
            Message::user("hello"),
            Message::blocks(
                Role::Assistant,
                vec![use_block("call_1")],
            ),
            Message::blocks(
                Role::Tool,
                vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: json!("ok"),
                }],
            ),
        ];
        assert!(validate(&messages).is_ok());
        assert_eq!(sanitize(&messages), messages);
    }

    #[test]
    fn bad_tool_use_id_fails_strict() {
        let messages = vec![Message::blocks(Role::Assistant, vec![use_block("bad id!")])];
        assert!(matches!(
            validate(&messages),
            Err(ValidationError::InvalidToolUseId(_))
        ));
    }

    #[test]
    fn empty_tool_name_fails_strict() {
        let messages = vec![Message::blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: String::new(),
                input: json!({}),
            }],
        )];
        assert!(validate(&messages).is_err());
    }

    #[test]
    fn null_tool_result_content_fails_strict() {
        let messages = vec![Message::blocks(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: Value::Null,
            }],
        )];
        assert!(matches!(
            validate(&messages),
            Err(ValidationError::InvalidToolResultBlock(_))
        ));
    }

    #[test]
    fn sanitize_drops_bad_blocks_and_empty_messages() {
        let messages = vec![
            Message::blocks(Role::Assistant, vec![use_block("bad id!")]),
            Message::blocks(
                Role::Assistant,
                vec![
                    use_block("ok_1"),
                    use_block("also bad!"),
                ],
            ),
            Message::user("keep me"),
        ];
        let clean = sanitize(&messages);
        assert_eq!(clean.len(), 2);
        assert_eq!(clean[0].tool_use_ids(), vec!["ok_1"]);
        assert_eq!(clean[1].flat_text(), "keep me");
    }

    #[test]
    fn sanitize_drops_empty_text_messages() {
        let messages = vec![Message::user(""), Message::user("real")];
        let clean = sanitize(&messages);
        assert_eq!(clean.len(), 1);
    }
}
