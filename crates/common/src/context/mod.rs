//! Query understanding
//!
//! The stages that run before retrieval:
//! - Conversation state tracking
//! - Query cleaning and nickname canonicalisation
//! - Rewriting and entity extraction
//! - Multi-entity query splitting

mod conversation_state;
mod enhancer;
mod normalize;
mod splitter;

pub use conversation_state::{ConversationState, EntityKind, ExtractedEntities};
pub use enhancer::{Enhancement, QueryEnhancer};
pub use normalize::{clean_query, mentions, Language, NicknameMap};
pub use splitter::{QuerySplitter, SubQuery};
