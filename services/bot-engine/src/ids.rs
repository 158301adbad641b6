//! Deterministic identifiers for order intents and reconcile snapshots
//!
//! Everything here is pure: the same inputs always produce the same ids, which
//! is what lets a restarted worker resubmit an intent without duplicating it.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Prefix carried by every client order id this engine generates.
///
/// Orders and trades whose client order id lacks it were placed by someone
/// else (manually, another tool) and are ignored by reconcile.
pub const CLIENT_ORDER_MARKER: &str = "gbot-";

/// Number of hex characters of the bot id embedded in a client order id.
/// Keeps ids within the 32 character limit most venues enforce.
const BOT_TAG_LEN: usize = 16;

/// Build the client order id for a bot's `intent_seq`-th order intent
pub fn client_order_id(bot_id: Uuid, intent_seq: i64) -> String {
    format!("{}{}-{}", CLIENT_ORDER_MARKER, bot_tag(bot_id), intent_seq)
}

/// True if the id was generated by this engine (any bot)
pub fn is_ours(client_order_id: &str) -> bool {
    client_order_id.starts_with(CLIENT_ORDER_MARKER)
}

/// Split a client order id into its bot tag and intent sequence.
///
/// Returns `None` for foreign or malformed ids.
pub fn parse_client_order_id(client_order_id: &str) -> Option<(&str, i64)> {
    let rest = client_order_id.strip_prefix(CLIENT_ORDER_MARKER)?;
    let (tag, seq) = rest.split_once('-')?;
    if tag.len() != BOT_TAG_LEN {
        return None;
    }
    let seq = seq.parse::<i64>().ok()?;
    Some((tag, seq))
}

/// True if the id was generated by this engine for `bot_id`
pub fn belongs_to(client_order_id: &str, bot_id: Uuid) -> bool {
    parse_client_order_id(client_order_id)
        .map(|(tag, _)| tag == bot_tag(bot_id))
        .unwrap_or(false)
}

/// Hash of the reconciled state: sorted open order ids and sorted trade ids.
///
/// Input order does not matter; duplicates are collapsed.
pub fn state_hash(open_order_ids: &[String], trade_ids: &[String]) -> String {
    let mut open: Vec<&str> = open_order_ids.iter().map(String::as_str).collect();
    open.sort_unstable();
    open.dedup();
    let mut trades: Vec<&str> = trade_ids.iter().map(String::as_str).collect();
    trades.sort_unstable();
    trades.dedup();

    let mut hasher = Sha256::new();
    hasher.update(b"open:");
    for id in &open {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"trades:");
    for id in &trades {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Fresh run token, issued each time a bot enters an active run
pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}

fn bot_tag(bot_id: Uuid) -> String {
    let simple = bot_id.simple().to_string();
    simple[..BOT_TAG_LEN].to_string()
}
