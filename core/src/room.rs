//! Room identity — deterministic naming for battles and peers
//!
//! Every client voting on the same item pair must land in the same room
//! without any coordination, so the room id is a pure function of the two
//! item names. The room id doubles as the battle id: ledger records and
//! wire envelopes key off the same string on every peer.

use rand::Rng;

/// Separator between the two slugged item names.
pub const ROOM_SEPARATOR: &str = "-vs-";

/// Peer-id suffixes are drawn from `1..=PEER_SUFFIX_MAX`. Keeping the space
/// small is what makes discovery-by-probing workable.
pub const PEER_SUFFIX_MAX: u16 = 100;

/// Lowercase an item name and collapse every non-alphanumeric run to a
/// single `-`, so "Star Wars!" and "star  wars" name the same room.
fn slug(item: &str) -> String {
    let mut out = String::with_capacity(item.len());
    let mut pending_dash = false;
    for ch in item.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Derive the deterministic room id for a pair of items.
///
/// Order-insensitive: the slugged names are sorted before joining, so
/// `room_id(a, b) == room_id(b, a)` for every pair.
pub fn room_id(item_a: &str, item_b: &str) -> String {
    let a = slug(item_a);
    let b = slug(item_b);
    if a <= b {
        format!("{a}{ROOM_SEPARATOR}{b}")
    } else {
        format!("{b}{ROOM_SEPARATOR}{a}")
    }
}

/// Draw a peer id in the room's namespace: `{room_id}-{n}`, n in
/// `1..=suffix_max`. Must match the range discovery probes, or the peer is
/// unreachable. Collisions are possible and surface as "endpoint taken"
/// when the transport endpoint is opened.
pub fn peer_id(room_id: &str, suffix_max: u16) -> String {
    let n = rand::thread_rng().gen_range(1..=suffix_max.max(1));
    format!("{room_id}-{n}")
}

/// Peer id for a specific suffix. Discovery enumerates these.
pub fn peer_id_for(room_id: &str, suffix: u16) -> String {
    format!("{room_id}-{suffix}")
}

/// Admission predicate: does this peer id belong to the room?
///
/// True iff the id is the room id followed by `-<digits>`. This is the only
/// admission control there is; peers are assumed non-malicious.
pub fn same_room(room_id: &str, peer_id: &str) -> bool {
    match peer_id.strip_prefix(room_id) {
        Some(rest) => {
            let rest = match rest.strip_prefix('-') {
                Some(r) => r,
                None => return false,
            };
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
