//! Assembly of one batch's log push.
//!
//! Tags are staged, then consumed by the next message appended. The txs
//! stream extraction appends several raw messages under one tag set, so raw
//! appends can opt into reusing the previous message's tags.

use vellum_core::messages::{encode_mutation, TaggedMessage};
use vellum_core::types::{Mutation, Tag};

#[derive(Debug, Default)]
pub struct LogPushData {
    next_tags: Vec<Tag>,
    messages: Vec<TaggedMessage>,
}

impl LogPushData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.next_tags.contains(&tag) {
            self.next_tags.push(tag);
        }
    }

    pub fn add_tags(&mut self, tags: &[Tag]) {
        for tag in tags {
            self.add_tag(*tag);
        }
    }

    /// Append a mutation message consuming the staged tags.
    pub fn add_typed_message(&mut self, mutation: &Mutation) {
        let tags = std::mem::take(&mut self.next_tags);
        debug_assert!(!tags.is_empty(), "pushing a mutation with no destinations");
        self.messages.push(TaggedMessage {
            tags,
            message: encode_mutation(mutation),
        });
    }

    /// Append a raw message; `use_previous_tags` reuses the tag set of the
    /// message before it instead of the staged tags.
    pub fn add_message(&mut self, message: Vec<u8>, use_previous_tags: bool) {
        let tags = if use_previous_tags {
            self.messages
                .last()
                .map(|m| m.tags.clone())
                .unwrap_or_default()
        } else {
            std::mem::take(&mut self.next_tags)
        };
        self.messages.push(TaggedMessage { tags, message });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<TaggedMessage> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_tags_attach_to_next_message_only() {
        let mut push = LogPushData::new();
        push.add_tag(Tag::new(0, 1));
        push.add_tag(Tag::new(0, 1));
        push.add_typed_message(&Mutation::Set { key: b"k".to_vec(), value: b"v".to_vec() });

        push.add_tag(Tag::new(0, 2));
        push.add_typed_message(&Mutation::Set { key: b"k2".to_vec(), value: b"v".to_vec() });

        let messages = push.into_messages();
        assert_eq!(messages[0].tags, vec![Tag::new(0, 1)]);
        assert_eq!(messages[1].tags, vec![Tag::new(0, 2)]);
    }

    #[test]
    fn raw_messages_can_reuse_previous_tags() {
        let mut push = LogPushData::new();
        push.add_tag(Tag::txs());
        push.add_message(b"one".to_vec(), false);
        push.add_message(b"two".to_vec(), true);

        let messages = push.into_messages();
        assert_eq!(messages[0].tags, vec![Tag::txs()]);
        assert_eq!(messages[1].tags, vec![Tag::txs()]);
    }
}
