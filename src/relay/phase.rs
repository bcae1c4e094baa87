use crate::relay::event::RelayEvent;

/// Splits the retrieval agent's single content stream into a reasoning
/// preamble and the final answer.
///
/// The agent emits both phases as plain text separated by a fixed in-band
/// delimiter. The classifier starts in the thinking phase and flips to the
/// result phase the first time the delimiter shows up in the incoming
/// fragment or in the accumulation of everything seen so far; the flip is
/// permanent for the session.
#[derive(Debug)]
pub struct PhaseClassifier {
    delimiter: String,
    accumulated: String,
    thinking: bool,
}

impl PhaseClassifier {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            accumulated: String::new(),
            thinking: true,
        }
    }

    /// Classify one incoming content fragment.
    ///
    /// The delimiter check runs on the union of prior accumulated text and
    /// the new fragment, so a delimiter crossing a chunk boundary is still
    /// caught. When the delimiter sits inside the fragment itself, only the
    /// non-empty text strictly after it is emitted (as `result`); the text
    /// before it is discarded.
    pub fn classify(&mut self, fragment: &str) -> Option<RelayEvent> {
        if fragment.is_empty() {
            return None;
        }
        self.accumulated.push_str(fragment);

        let in_fragment = fragment.contains(&self.delimiter);
        let has_delimiter = in_fragment || self.accumulated.contains(&self.delimiter);

        if has_delimiter {
            self.thinking = false;
            if in_fragment {
                let after = fragment
                    .split_once(&self.delimiter)
                    .map(|(_, after)| after)
                    .unwrap_or("");
                if after.trim().is_empty() {
                    return None;
                }
                return Some(RelayEvent::result(after));
            }
            return Some(RelayEvent::result(fragment));
        }

        if self.thinking {
            Some(RelayEvent::thinking(fragment))
        } else {
            Some(RelayEvent::result(fragment))
        }
    }

    /// Everything seen so far, both phases, in arrival order.
    pub fn full_content(&self) -> &str {
        &self.accumulated
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking
    }
}
