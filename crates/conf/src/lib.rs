//! Configuration tree model for the nginx directive language.
//!
//! The model covers the whole round trip: tokenize ([`lex`]), parse into a
//! multi-file tree with resolved includes ([`parse`]), traverse and mutate
//! it ([`visitor`], [`directive`]), and write it back out under a new
//! directory ([`dump`]).
//!
//! The grammar is the nginx one: `name arg...;` simple directives,
//! `name arg... { ... }` blocks, `include target;` with glob expansion,
//! `#` comments, and single- or double-quoted literals with backslash
//! escapes. The parser does not validate directive semantics; it preserves
//! tokens faithfully so a dumped tree parses back to the same structure.

pub mod directive;
pub mod dump;
pub mod error;
pub mod lex;
pub mod parse;
pub mod visitor;

pub use directive::{Block, ConfigFile, ConfigId, Include, Node, NodeId, Parent, Simple, Tree, TreeData};
pub use dump::escape;
pub use error::ConfError;
pub use parse::parse;
pub use visitor::{walk, Flow, Visitor};
