//! Text extractors.

use arbor_common::config::IndexConfig;
use arbor_common::types::QName;

/// A node event emitted while a document is being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// An element starts.
    StartElement(QName),
    /// An element ends.
    EndElement(QName),
    /// Character content.
    Characters(String),
}

impl NodeEvent {
    /// Start of an unqualified element.
    pub fn start(local_name: &str) -> Self {
        NodeEvent::StartElement(QName::local(local_name))
    }

    /// End of an unqualified element.
    pub fn end(local_name: &str) -> Self {
        NodeEvent::EndElement(QName::local(local_name))
    }

    /// Character content.
    pub fn text(text: &str) -> Self {
        NodeEvent::Characters(text.to_string())
    }
}

/// Accumulates indexable text from node events.
///
/// Each callback returns the number of characters it appended to the buffer.
pub trait TextExtractor {
    /// Handles an element start.
    fn start_element(&mut self, name: &QName) -> usize;

    /// Handles an element end.
    fn end_element(&mut self, name: &QName) -> usize;

    /// Handles character content.
    fn characters(&mut self, text: &str) -> usize;

    /// Returns the accumulated text.
    fn text(&self) -> &str;

    /// Takes the accumulated text and resets the extractor for the next
    /// document.
    fn take_text(&mut self) -> String;
}

/// Feeds `events` through `extractor` and returns the accumulated text.
pub fn extract_text<E: TextExtractor + ?Sized>(extractor: &mut E, events: &[NodeEvent]) -> String {
    for event in events {
        match event {
            NodeEvent::StartElement(name) => extractor.start_element(name),
            NodeEvent::EndElement(name) => extractor.end_element(name),
            NodeEvent::Characters(text) => extractor.characters(text),
        };
    }
    extractor.take_text()
}

/// The standard extractor.
///
/// Consults the database-wide configuration and, if set, the configuration
/// of the specific index being populated; a node ignored or inline in either
/// is treated that way.
#[derive(Debug, Clone)]
pub struct DefaultTextExtractor {
    config: IndexConfig,
    index_config: Option<IndexConfig>,
    buffer: String,
    /// Depth inside ignored elements.
    ignore_depth: usize,
    space_before_next: bool,
}

impl DefaultTextExtractor {
    /// Creates an extractor using the database-wide configuration.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            index_config: None,
            buffer: String::new(),
            ignore_depth: 0,
            space_before_next: false,
        }
    }

    /// Adds an index-specific configuration.
    #[must_use]
    pub fn with_index_config(mut self, index_config: IndexConfig) -> Self {
        self.index_config = Some(index_config);
        self
    }

    fn is_ignored(&self, name: &QName) -> bool {
        self.config.is_ignored_node(name)
            || self
                .index_config
                .as_ref()
                .is_some_and(|c| c.is_ignored_node(name))
    }

    fn is_inline(&self, name: &QName) -> bool {
        self.config.is_inline_node(name)
            || self
                .index_config
                .as_ref()
                .is_some_and(|c| c.is_inline_node(name))
    }
}

impl TextExtractor for DefaultTextExtractor {
    fn start_element(&mut self, name: &QName) -> usize {
        if self.is_ignored(name) {
            self.ignore_depth += 1;
        } else if !self.is_inline(name) {
            self.buffer.push(' ');
            return 1;
        }
        0
    }

    fn end_element(&mut self, name: &QName) -> usize {
        if self.is_ignored(name) {
            self.ignore_depth = self.ignore_depth.saturating_sub(1);
        } else if !self.is_inline(name) {
            self.space_before_next = true;
            return 1;
        }
        0
    }

    fn characters(&mut self, text: &str) -> usize {
        if self.space_before_next {
            self.buffer.push(' ');
            self.space_before_next = false;
        }
        if self.ignore_depth == 0 {
            self.buffer.push_str(text);
            return text.chars().count();
        }
        0
    }

    fn text(&self) -> &str {
        &self.buffer
    }

    fn take_text(&mut self) -> String {
        if self.ignore_depth != 0 {
            tracing::debug!(
                depth = self.ignore_depth,
                "unbalanced ignored elements at end of document"
            );
        }
        self.ignore_depth = 0;
        self.space_before_next = false;
        std::mem::take(&mut self.buffer)
    }
}
