//! # arbor-index
//!
//! Text extraction for the full-text index.
//!
//! The extractor consumes the node events produced while a document is
//! stored and accumulates the text the tokenizer will see. Two per-element
//! settings shape the output:
//!
//! - **ignored** elements contribute no text, including nested content
//! - **inline** elements do not separate words (`<b>bo</b>ld` yields `bold`)
//!
//! Every other element starts and ends a word boundary.
//!
//! ## Example
//!
//! ```rust
//! use arbor_common::config::IndexConfig;
//! use arbor_common::types::QName;
//! use arbor_index::{extract_text, DefaultTextExtractor, NodeEvent};
//!
//! let mut config = IndexConfig::default();
//! config.inline_nodes.push(QName::local("b"));
//!
//! let events = vec![
//!     NodeEvent::start("p"),
//!     NodeEvent::text("bo"),
//!     NodeEvent::start("b"),
//!     NodeEvent::text("ld"),
//!     NodeEvent::end("b"),
//!     NodeEvent::end("p"),
//! ];
//!
//! let mut extractor = DefaultTextExtractor::new(config);
//! assert_eq!(extract_text(&mut extractor, &events).trim(), "bold");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod extractor;

pub use extractor::{extract_text, DefaultTextExtractor, NodeEvent, TextExtractor};
