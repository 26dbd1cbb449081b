//! Immutable, ordered message streams.
//!
//! A [`MessageStream`] is built incrementally while a call tree executes.
//! Concatenation is O(1): it allocates a pair node that points at both sides
//! instead of copying either. Enumeration flattens the pairs left-then-right.

use std::fmt;
use std::sync::Arc;

use crate::core::{Message, MessageEnvelope};

#[derive(Clone)]
enum Node {
    Empty,
    Leaf(Arc<[MessageEnvelope]>),
    Pair(Arc<(MessageStream, MessageStream)>),
}

/// Ordered, immutable collection of messages produced by handler invocations.
#[derive(Clone)]
pub struct MessageStream {
    node: Node,
    len: usize,
}

impl MessageStream {
    /// The empty stream. Identity element of [`concat`](Self::concat).
    pub fn empty() -> Self {
        Self {
            node: Node::Empty,
            len: 0,
        }
    }

    /// A stream holding exactly one message.
    pub fn single(message: MessageEnvelope) -> Self {
        Self::from_envelopes(vec![message])
    }

    pub fn from_envelopes(messages: Vec<MessageEnvelope>) -> Self {
        if messages.is_empty() {
            return Self::empty();
        }
        Self {
            len: messages.len(),
            node: Node::Leaf(messages.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `other` after `self`. Neither stream is copied.
    pub fn concat(&self, other: &MessageStream) -> MessageStream {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        Self {
            len: self.len + other.len,
            node: Node::Pair(Arc::new((self.clone(), other.clone()))),
        }
    }

    /// Append a single message.
    pub fn append(&self, message: MessageEnvelope) -> MessageStream {
        self.concat(&MessageStream::single(message))
    }

    /// Enumerate messages in order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            pending: vec![self],
            leaf: [].iter(),
        }
    }

    /// Messages whose payload is of type `M`, in order.
    pub fn of_type<M: Message>(&self) -> impl Iterator<Item = &M> {
        self.iter().filter_map(|envelope| envelope.downcast_ref::<M>())
    }

    /// Short type names of every message, in order. Handy in assertions and logs.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.iter().map(|envelope| envelope.short_type_name()).collect()
    }

    pub fn to_vec(&self) -> Vec<MessageEnvelope> {
        self.iter().cloned().collect()
    }
}

impl Default for MessageStream {
    fn default() -> Self {
        Self::empty()
    }
}

// Pair chains built by repeated appends are as deep as the number of appends.
// Unlink them iteratively so dropping a large stream does not recurse.
impl Drop for MessageStream {
    fn drop(&mut self) {
        let Node::Pair(pair) = std::mem::replace(&mut self.node, Node::Empty) else {
            return;
        };
        let mut pending = vec![pair];
        while let Some(pair) = pending.pop() {
            if let Ok((mut left, mut right)) = Arc::try_unwrap(pair) {
                for side in [&mut left, &mut right] {
                    if let Node::Pair(inner) = std::mem::replace(&mut side.node, Node::Empty) {
                        pending.push(inner);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a MessageStream {
    type Item = &'a MessageEnvelope;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<MessageEnvelope> for MessageStream {
    fn from_iter<I: IntoIterator<Item = MessageEnvelope>>(iter: I) -> Self {
        Self::from_envelopes(iter.into_iter().collect())
    }
}

/// Depth-first iterator over a [`MessageStream`].
///
/// Uses an explicit stack so that long concatenation chains never recurse.
pub struct Iter<'a> {
    pending: Vec<&'a MessageStream>,
    leaf: std::slice::Iter<'a, MessageEnvelope>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MessageEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.leaf.next() {
                return Some(message);
            }
            let stream = self.pending.pop()?;
            match &stream.node {
                Node::Empty => {}
                Node::Leaf(messages) => self.leaf = messages.iter(),
                Node::Pair(pair) => {
                    self.pending.push(&pair.1);
                    self.pending.push(&pair.0);
                }
            }
        }
    }
}

/// Outcome of dispatching a command or event.
#[derive(Debug, Clone, Default)]
pub struct MessageHandlerResult {
    /// Every event published by the call tree, in execution order.
    pub output: MessageStream,
    /// Total number of handler invocations across the whole call tree.
    ///
    /// Handlers reached through `MessageHandlerContext::execute_command` or
    /// `handle_event` are not included: those nested calls return their own
    /// result to the handler that made them.
    pub handler_count: usize,
}

impl MessageHandlerResult {
    pub fn new(output: MessageStream, handler_count: usize) -> Self {
        Self {
            output,
            handler_count,
        }
    }

    /// Combine two results: streams concatenate, counts add.
    pub fn merge(self, other: MessageHandlerResult) -> MessageHandlerResult {
        Self {
            output: self.output.concat(&other.output),
            handler_count: self.handler_count + other.handler_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Numbered(u32);

    fn stream(numbers: &[u32]) -> MessageStream {
        numbers
            .iter()
            .map(|n| MessageEnvelope::event(Numbered(*n)))
            .collect()
    }

    fn numbers(stream: &MessageStream) -> Vec<u32> {
        stream.of_type::<Numbered>().map(|n| n.0).collect()
    }

    #[test]
    fn test_concat_is_left_then_right() {
        let left = stream(&[1, 2, 3]);
        let right = stream(&[4, 5]);

        let joined = left.concat(&right);

        assert_eq!(joined.len(), 5);
        assert_eq!(numbers(&joined), vec![1, 2, 3, 4, 5]);
        // Operands are untouched.
        assert_eq!(numbers(&left), vec![1, 2, 3]);
        assert_eq!(numbers(&right), vec![4, 5]);
    }

    #[test]
    fn test_concat_with_empty_is_identity() {
        let s = stream(&[1, 2]);

        assert_eq!(numbers(&s.concat(&MessageStream::empty())), vec![1, 2]);
        assert_eq!(numbers(&MessageStream::empty().concat(&s)), vec![1, 2]);
        assert!(MessageStream::empty()
            .concat(&MessageStream::empty())
            .is_empty());
    }

    #[test]
    fn test_concat_is_associative() {
        let (a, b, c) = (stream(&[1]), stream(&[2, 3]), stream(&[4]));

        let left = a.concat(&b).concat(&c);
        let right = a.concat(&b.concat(&c));

        assert_eq!(numbers(&left), numbers(&right));
        assert_eq!(left.len(), right.len());
    }

    #[test]
    fn test_append_builds_in_order() {
        let mut s = MessageStream::empty();
        for n in 0..5 {
            s = s.append(MessageEnvelope::event(Numbered(n)));
        }
        assert_eq!(numbers(&s), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_long_chain_iterates_without_recursion() {
        let mut s = MessageStream::empty();
        for n in 0..50_000 {
            s = s.append(MessageEnvelope::event(Numbered(n)));
        }
        assert_eq!(s.len(), 50_000);
        assert_eq!(s.iter().count(), 50_000);
        assert_eq!(s.of_type::<Numbered>().last(), Some(&Numbered(49_999)));
    }

    #[test]
    fn test_result_merge_adds_counts() {
        let a = MessageHandlerResult::new(stream(&[1]), 2);
        let b = MessageHandlerResult::new(stream(&[2]), 3);

        let merged = a.merge(b);
        assert_eq!(merged.handler_count, 5);
        assert_eq!(numbers(&merged.output), vec![1, 2]);
    }
}
