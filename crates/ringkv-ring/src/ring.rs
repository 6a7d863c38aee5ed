//! Consistent hash ring.
//!
//! Members sit at the hash of their `address:port` form. Responsibility
//! follows the "preceding" rule: a member owns every position after its
//! predecessor's position up to and including its own, walking clockwise.
//! A single member owns the whole space.

use crate::hashing::{parse_hex, to_hex, HashAlgorithm, Md5Hash};
use crate::range::RingRange;
use ringkv_core::{Error, NodeId, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, trace};

/// Separates members in serialized metadata
const MEMBER_SEPARATOR: char = ';';
/// Separates the fields of one member
const FIELD_SEPARATOR: char = ',';

/// Ordered mapping of ring positions to members.
#[derive(Clone)]
pub struct HashRing<H: HashAlgorithm = Md5Hash> {
    hasher: H,
    members: BTreeMap<u128, NodeId>,
}

impl HashRing<Md5Hash> {
    /// Create an empty ring using MD5 placement
    pub fn new() -> Self {
        Self::with_hasher(Md5Hash)
    }
}

impl Default for HashRing<Md5Hash> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HashAlgorithm> HashRing<H> {
    /// Create an empty ring with a custom placement algorithm
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            hasher,
            members: BTreeMap::new(),
        }
    }

    /// The placement algorithm
    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members with their positions, in ring order
    pub fn iter(&self) -> impl Iterator<Item = (u128, &NodeId)> {
        self.members.iter().map(|(hash, node)| (*hash, node))
    }

    /// Members in ring order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.members.values()
    }

    /// Add a member at the hash of its identity.
    ///
    /// Fails with [`Error::RingCollision`] if that position is occupied.
    pub fn add_node(&mut self, node: NodeId) -> Result<u128> {
        let hash = self.hasher.hash_node(&node);
        self.add_node_at(hash, node)?;
        Ok(hash)
    }

    /// Add a member at an explicit position.
    ///
    /// Used when rebuilding a ring from metadata received over the wire.
    pub fn add_node_at(&mut self, hash: u128, node: NodeId) -> Result<()> {
        if hash > self.hasher.max() {
            return Err(Error::InvalidOperation(format!(
                "Position {:x} is outside the hash space",
                hash
            )));
        }
        if let Some(existing) = self.members.get(&hash) {
            return Err(Error::RingCollision {
                hash,
                existing: existing.clone(),
            });
        }
        debug!(node = %node, position = %to_hex(hash), "Adding ring member");
        self.members.insert(hash, node);
        Ok(())
    }

    /// Remove a member. Fails with [`Error::NotInRing`] if it is absent.
    pub fn remove_node(&mut self, node: &NodeId) -> Result<()> {
        let hash = self
            .position_of(node)
            .ok_or_else(|| Error::NotInRing(node.clone()))?;
        debug!(node = %node, position = %to_hex(hash), "Removing ring member");
        self.members.remove(&hash);
        Ok(())
    }

    /// Whether `node` is a member
    pub fn contains(&self, node: &NodeId) -> bool {
        self.position_of(node).is_some()
    }

    /// Position of a member, if present
    pub fn position_of(&self, node: &NodeId) -> Option<u128> {
        let hash = self.hasher.hash_node(node);
        if self.members.get(&hash) == Some(node) {
            return Some(hash);
        }
        // Members rebuilt from metadata may sit at an explicit position.
        self.members
            .iter()
            .find(|(_, member)| *member == node)
            .map(|(hash, _)| *hash)
    }

    /// Member owning the position `hash`
    pub fn responsible_for_hash(&self, hash: u128) -> Option<&NodeId> {
        self.members
            .range(hash..)
            .next()
            .or_else(|| self.members.iter().next())
            .map(|(_, node)| node)
    }

    /// Member owning `key`. `None` only for an empty ring.
    pub fn responsible_node(&self, key: &str) -> Option<&NodeId> {
        let hash = self.hasher.hash_key(key);
        let node = self.responsible_for_hash(hash);
        trace!(key, hash = %to_hex(hash), owner = ?node, "Resolved key owner");
        node
    }

    /// Whether `node` owns `key`
    pub fn is_responsible(&self, node: &NodeId, key: &str) -> bool {
        self.responsible_node(key) == Some(node)
    }

    /// Member immediately counter-clockwise of `node`.
    ///
    /// `node` need not be a member. Returns `None` for an empty ring or a
    /// ring whose only member is `node`.
    pub fn preceding_node(&self, node: &NodeId) -> Option<&NodeId> {
        let hash = self.anchor(node);
        self.members
            .range(..hash)
            .next_back()
            .or_else(|| self.members.iter().next_back())
            .map(|(_, member)| member)
            .filter(|member| *member != node)
    }

    /// Member immediately clockwise of `node`.
    ///
    /// `node` need not be a member. Returns `None` for an empty ring or a
    /// ring whose only member is `node`.
    pub fn succeeding_node(&self, node: &NodeId) -> Option<&NodeId> {
        let hash = self.anchor(node);
        self.members
            .range((Excluded(hash), Unbounded))
            .next()
            .or_else(|| self.members.iter().next())
            .map(|(_, member)| member)
            .filter(|member| *member != node)
    }

    /// The arc a member owns, or `None` if it is not a member
    pub fn range_of(&self, node: &NodeId) -> Option<RingRange> {
        let hash = self.position_of(node)?;
        Some(self.range_ending_at(hash))
    }

    /// Every member with the arc it owns, in ring order
    pub fn ranges(&self) -> Vec<(NodeId, RingRange)> {
        self.members
            .iter()
            .map(|(hash, node)| (node.clone(), self.range_ending_at(*hash)))
            .collect()
    }

    /// Arcs `node` owns in `self` but no longer owns in `updated`.
    ///
    /// These are the positions `node` must hand off when the ring moves from
    /// `self` to `updated`. If `node` is absent from `updated` its whole arc
    /// is returned.
    pub fn ceded_ranges(&self, updated: &HashRing<H>, node: &NodeId) -> Vec<RingRange> {
        let Some(before) = self.range_of(node) else {
            return Vec::new();
        };
        match updated.range_of(node) {
            Some(after) => before.difference(&after),
            None => vec![before],
        }
    }

    /// Whether the ring has enough members to keep `replicas` extra copies
    /// of every key on distinct servers
    pub fn is_replicated(&self, replicas: usize) -> bool {
        replicas > 0 && self.len() > replicas
    }

    /// Up to `count` members clockwise of `node`, nearest first.
    ///
    /// `node` itself is never part of the result.
    pub fn successors(&self, node: &NodeId, count: usize) -> Vec<&NodeId> {
        let hash = self.anchor(node);
        self.members
            .range((Excluded(hash), Unbounded))
            .chain(self.members.range(..=hash))
            .map(|(_, member)| member)
            .filter(|member| *member != node)
            .take(count)
            .collect()
    }

    /// Members holding `key`: its owner followed by the owner's replicas
    pub fn read_responsible(&self, key: &str, replicas: usize) -> Vec<&NodeId> {
        let Some(owner) = self.responsible_node(key) else {
            return Vec::new();
        };
        let mut holders = vec![owner];
        if self.is_replicated(replicas) {
            holders.extend(self.successors(owner, replicas));
        }
        holders
    }

    /// Whether `node` holds `key`, as owner or as replica
    pub fn is_read_responsible(&self, node: &NodeId, key: &str, replicas: usize) -> bool {
        self.read_responsible(key, replicas).contains(&node)
    }

    /// The arc `node` serves reads for.
    ///
    /// That is its own arc extended counter-clockwise over the arcs of the
    /// `replicas` members before it, or just its own arc while the ring is
    /// too small to replicate.
    pub fn read_range_of(&self, node: &NodeId, replicas: usize) -> Option<RingRange> {
        let own = self.range_of(node)?;
        if !self.is_replicated(replicas) {
            return Some(own);
        }
        let mut first: &NodeId = node;
        for _ in 0..replicas {
            first = self.preceding_node(first)?;
        }
        let start = self.range_of(first)?.start();
        Some(RingRange::new(start, own.end(), own.max()))
    }

    /// Encode as `<endHex>,<startHex>,<address>:<port>;` per member in ring order
    pub fn serialize(&self) -> String {
        self.ranges()
            .into_iter()
            .map(|(node, range)| encode_member(&node, &range))
            .collect()
    }

    /// Encode read arcs in the [`HashRing::serialize`] layout
    pub fn serialize_read(&self, replicas: usize) -> String {
        self.nodes()
            .filter_map(|node| {
                self.read_range_of(node, replicas)
                    .map(|range| encode_member(node, &range))
            })
            .collect()
    }

    /// Rebuild a ring from [`HashRing::serialize`] output.
    ///
    /// Every member is placed at its range end. Start bounds are checked
    /// against the rebuilt ring so inconsistent metadata is rejected.
    pub fn parse(text: &str, hasher: H) -> Result<Self> {
        let mut ring = Self::with_hasher(hasher);
        let mut declared = Vec::new();

        for entry in text.trim().split(MEMBER_SEPARATOR) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut fields = entry.splitn(3, FIELD_SEPARATOR);
            let (Some(end), Some(start), Some(node)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::MalformedMetadata(format!(
                    "Expected end,start,address:port in '{}'",
                    entry
                )));
            };
            let end = parse_hex(end)?;
            let start = parse_hex(start)?;
            let node: NodeId = node
                .parse()
                .map_err(|e| Error::MalformedMetadata(format!("{}", e)))?;

            ring.add_node_at(end, node.clone()).map_err(|e| match e {
                Error::RingCollision { .. } => {
                    Error::MalformedMetadata(format!("Duplicate position in '{}'", entry))
                }
                other => Error::MalformedMetadata(other.to_string()),
            })?;
            declared.push((node, start));
        }

        for (node, start) in declared {
            let actual = ring.range_of(&node).map(|range| range.start());
            if actual != Some(start) {
                return Err(Error::MalformedMetadata(format!(
                    "Range start {:x} of {} does not match its predecessor",
                    start, node
                )));
            }
        }

        Ok(ring)
    }

    fn range_ending_at(&self, hash: u128) -> RingRange {
        let max = self.hasher.max();
        let pred = self
            .members
            .range(..hash)
            .next_back()
            .or_else(|| self.members.iter().next_back())
            .map(|(pred, _)| *pred)
            .unwrap_or(hash);
        let start = if pred == max { 0 } else { pred + 1 };
        RingRange::new(start, hash, max)
    }

    fn anchor(&self, node: &NodeId) -> u128 {
        self.position_of(node)
            .unwrap_or_else(|| self.hasher.hash_node(node))
    }
}

fn encode_member(node: &NodeId, range: &RingRange) -> String {
    format!(
        "{}{}{}{}{}{}",
        to_hex(range.end()),
        FIELD_SEPARATOR,
        to_hex(range.start()),
        FIELD_SEPARATOR,
        node,
        MEMBER_SEPARATOR
    )
}

impl<H: HashAlgorithm> PartialEq for HashRing<H> {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
    }
}

impl<H: HashAlgorithm> Eq for HashRing<H> {}

impl<H: HashAlgorithm> fmt::Debug for HashRing<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.members.iter().map(|(hash, node)| (to_hex(*hash), node)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::DebugHash;

    fn node(port: u16) -> NodeId {
        NodeId::new("127.0.0.1", port)
    }

    /// Ring over `[0, 99]` with members pinned at the given positions.
    fn pinned_ring(positions: &[u128]) -> HashRing<DebugHash> {
        let mut hasher = DebugHash::new(99);
        for (i, pos) in positions.iter().enumerate() {
            hasher = hasher.with_node(&node(5000 + i as u16), *pos);
        }
        let mut ring = HashRing::with_hasher(hasher);
        for i in 0..positions.len() {
            ring.add_node(node(5000 + i as u16)).unwrap();
        }
        ring
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new();
        assert!(ring.responsible_node("key").is_none());
        assert!(ring.preceding_node(&node(1)).is_none());
        assert!(ring.succeeding_node(&node(1)).is_none());
    }

    #[test]
    fn test_single_member_owns_everything() {
        let mut ring = HashRing::new();
        ring.add_node(node(1)).unwrap();
        for key in ["a", "b", "zzz", ""] {
            assert_eq!(ring.responsible_node(key), Some(&node(1)));
        }
        assert_eq!(ring.range_of(&node(1)).unwrap().len(), u128::MAX);
        assert!(ring.preceding_node(&node(1)).is_none());
        assert!(ring.succeeding_node(&node(1)).is_none());
    }

    #[test]
    fn test_responsible_wraps_to_first_member() {
        let ring = pinned_ring(&[10, 40, 90]);
        assert_eq!(ring.responsible_for_hash(95), Some(&node(5000)));
        assert_eq!(ring.responsible_for_hash(10), Some(&node(5000)));
        assert_eq!(ring.responsible_for_hash(11), Some(&node(5001)));
        assert_eq!(ring.responsible_for_hash(90), Some(&node(5002)));
        assert_eq!(ring.responsible_node("95"), Some(&node(5000)));
    }

    #[test]
    fn test_collision_rejected() {
        let mut ring = pinned_ring(&[10]);
        let err = ring.add_node_at(10, node(7000)).unwrap_err();
        assert!(matches!(err, Error::RingCollision { hash: 10, .. }));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_remove_absent_fails() {
        let mut ring = pinned_ring(&[10, 40]);
        assert!(matches!(
            ring.remove_node(&node(9999)),
            Err(Error::NotInRing(_))
        ));
        ring.remove_node(&node(5000)).unwrap();
        assert_eq!(ring.len(), 1);
        assert!(!ring.contains(&node(5000)));
    }

    #[test]
    fn test_neighbours_of_member_and_non_member() {
        let ring = pinned_ring(&[10, 40, 90]);
        assert_eq!(ring.preceding_node(&node(5000)), Some(&node(5002)));
        assert_eq!(ring.succeeding_node(&node(5002)), Some(&node(5000)));
        assert_eq!(ring.preceding_node(&node(5001)), Some(&node(5000)));

        // A joining node at position 60 sits between 40 and 90.
        let mut hasher = ring.hasher().clone();
        hasher = hasher.with_node(&node(6000), 60);
        let mut lookup = HashRing::with_hasher(hasher);
        for (hash, member) in ring.iter() {
            lookup.add_node_at(hash, member.clone()).unwrap();
        }
        assert_eq!(lookup.preceding_node(&node(6000)), Some(&node(5001)));
        assert_eq!(lookup.succeeding_node(&node(6000)), Some(&node(5002)));
    }

    #[test]
    fn test_ranges_follow_preceding_rule() {
        let ring = pinned_ring(&[10, 40, 90]);
        assert_eq!(
            ring.range_of(&node(5000)),
            Some(RingRange::new(91, 10, 99))
        );
        assert_eq!(
            ring.range_of(&node(5001)),
            Some(RingRange::new(11, 40, 99))
        );
        assert_eq!(
            ring.range_of(&node(5002)),
            Some(RingRange::new(41, 90, 99))
        );
    }

    #[test]
    fn test_member_at_max_position() {
        let ring = pinned_ring(&[99, 30]);
        assert_eq!(ring.range_of(&node(5001)), Some(RingRange::new(0, 30, 99)));
        assert_eq!(ring.range_of(&node(5000)), Some(RingRange::new(31, 99, 99)));
    }

    #[test]
    fn test_ceded_ranges_on_join_and_leave() {
        let before = pinned_ring(&[50]);
        let mut hasher = before.hasher().clone().with_node(&node(6000), 70);
        hasher = hasher.with_node(&node(5000), 50);
        let mut after = HashRing::with_hasher(hasher);
        after.add_node(node(5000)).unwrap();
        after.add_node(node(6000)).unwrap();

        // The old sole owner gives up (50, 70] to the newcomer.
        assert_eq!(
            before.ceded_ranges(&after, &node(5000)),
            vec![RingRange::new(51, 70, 99)]
        );
        // Leaving cedes the whole arc.
        assert_eq!(
            after.ceded_ranges(&before, &node(6000)),
            vec![RingRange::new(51, 70, 99)]
        );
    }

    #[test]
    fn test_replicas_follow_the_owner() {
        let ring = pinned_ring(&[10, 40, 70, 90]);
        assert!(ring.is_replicated(2));
        assert!(!ring.is_replicated(0));
        assert!(!pinned_ring(&[10, 40]).is_replicated(2));

        assert_eq!(ring.successors(&node(5003), 2), vec![&node(5000), &node(5001)]);
        assert_eq!(ring.successors(&node(5000), 10).len(), 3);
        assert_eq!(
            ring.read_responsible("50", 2),
            vec![&node(5002), &node(5003), &node(5000)]
        );
        assert!(ring.is_read_responsible(&node(5000), "50", 2));
        assert!(!ring.is_read_responsible(&node(5001), "50", 2));
    }

    #[test]
    fn test_read_ranges_cover_predecessor_arcs() {
        let ring = pinned_ring(&[10, 40, 70, 90]);
        assert_eq!(
            ring.read_range_of(&node(5001), 2),
            Some(RingRange::new(71, 40, 99))
        );
        // Too few members to replicate: reads stay on the owner.
        let small = pinned_ring(&[10, 40]);
        assert_eq!(small.read_range_of(&node(5001), 2), small.range_of(&node(5001)));
        assert_eq!(ring.read_range_of(&node(9999), 2), None);

        assert_eq!(
            ring.serialize_read(2),
            "a,29,127.0.0.1:5000;28,47,127.0.0.1:5001;46,5b,127.0.0.1:5002;5a,b,127.0.0.1:5003;"
        );
        assert_eq!(small.serialize_read(2), small.serialize());
    }

    #[test]
    fn test_serialize_format() {
        let ring = pinned_ring(&[10, 40]);
        assert_eq!(
            ring.serialize(),
            "a,29,127.0.0.1:5000;28,b,127.0.0.1:5001;"
        );
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut ring = HashRing::new();
        for port in 5000..5010 {
            ring.add_node(node(port)).unwrap();
        }
        let parsed = HashRing::parse(&ring.serialize(), Md5Hash).unwrap();
        assert_eq!(parsed, ring);
        assert_eq!(parsed.serialize(), ring.serialize());
    }

    #[test]
    fn test_parse_rejects_bad_metadata() {
        assert!(HashRing::parse("zz,1,a:1;", Md5Hash).is_err());
        assert!(HashRing::parse("1,2;", Md5Hash).is_err());
        assert!(HashRing::parse("10,5,a:1;", DebugHash::new(99)).is_err());
        assert!(HashRing::parse("", Md5Hash).unwrap().is_empty());
    }

    #[test]
    fn test_random_membership_keeps_unique_positions() {
        use rand::seq::SliceRandom;
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut ring = HashRing::new();
        let mut present: Vec<NodeId> = Vec::new();

        for _ in 0..200 {
            if present.is_empty() || rng.gen_bool(0.6) {
                let candidate = node(rng.gen_range(1000..1100));
                match ring.add_node(candidate.clone()) {
                    Ok(_) => present.push(candidate),
                    Err(Error::RingCollision { existing, .. }) => assert_eq!(existing, candidate),
                    Err(e) => panic!("unexpected error {}", e),
                }
            } else {
                present.shuffle(&mut rng);
                let leaving = present.pop().unwrap();
                ring.remove_node(&leaving).unwrap();
            }
            assert_eq!(ring.len(), present.len());

            // Each key is owned by the clockwise-nearest member.
            let key: String = format!("k{}", rng.gen::<u32>());
            let hash = ring.hasher().hash_key(&key);
            let expected = ring
                .iter()
                .find(|(pos, _)| *pos >= hash)
                .or_else(|| ring.iter().next())
                .map(|(_, n)| n.clone());
            assert_eq!(ring.responsible_node(&key).cloned(), expected);
        }
    }
}
