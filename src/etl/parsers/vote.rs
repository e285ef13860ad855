/// Vote Field Parser
///
/// Lifts the voter/author/permlink/weight fields out of vote-like and comment-like
/// operation payloads so history entries can be queried without reparsing JSON.

/// Fields shared by vote and comment operations. All optional: most operations carry none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteFields {
    pub voter: Option<String>,
    pub author: Option<String>,
    pub permlink: Option<String>,
    pub weight: Option<i64>,
}

/// Parse vote-related fields from an operation payload
///
/// `weight` is accepted both as a number and as a numeric string, since nodes emit either.
pub fn parse_vote_fields(payload: &serde_json::Value) -> VoteFields {
    let text = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());

    let weight = payload.get("weight").and_then(|w| match w {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    });

    VoteFields { voter: text("voter"), author: text("author"), permlink: text("permlink"), weight }
}
