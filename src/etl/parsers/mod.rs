/// Parsers Module
///
/// Contains operation parsers for the ledger operations the harvester cares about.
/// Each parser lifts specific fields out of an operation payload.
pub mod account;
pub mod vote;

// Re-export commonly used parsers
pub use account::parse_account_creation;
pub use vote::{parse_vote_fields, VoteFields};
