use std::collections::BTreeMap;

use crate::error::CollectError;

/// Card id ↔ logical index table for the GPUs installed in every node.
///
/// The table reflects physical wiring and is fixed at construction. Card ids
/// are sparse and not evenly spaced, so nothing here is computed from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareMap {
    by_card: BTreeMap<u32, u32>,
    by_index: BTreeMap<u32, u32>,
}

pub const DEFAULT_CARD_IDS: [u32; 8] = [1, 9, 17, 25, 33, 41, 49, 57];

impl HardwareMap {
    /// Build from explicit `(card_id, logical_index)` pairs. Fails if either
    /// side repeats, since the mapping must be a bijection.
    pub fn new(pairs: impl IntoIterator<Item = (u32, u32)>) -> Result<Self, String> {
        let mut by_card = BTreeMap::new();
        let mut by_index = BTreeMap::new();
        for (card_id, index) in pairs {
            if by_card.insert(card_id, index).is_some() {
                return Err(format!("duplicate card id {card_id}"));
            }
            if by_index.insert(index, card_id).is_some() {
                return Err(format!("duplicate logical index {index}"));
            }
        }
        Ok(Self { by_card, by_index })
    }

    /// The position of each card id in `card_ids` is its logical index.
    pub fn from_ordered_cards(card_ids: &[u32]) -> Result<Self, String> {
        Self::new(card_ids.iter().enumerate().map(|(i, &c)| (c, i as u32)))
    }

    pub fn resolve(&self, card_id: u32) -> Result<u32, CollectError> {
        self.by_card
            .get(&card_id)
            .copied()
            .ok_or(CollectError::UnknownCardId(card_id))
    }

    pub fn resolve_inverse(&self, logical_index: u32) -> Result<u32, CollectError> {
        self.by_index
            .get(&logical_index)
            .copied()
            .ok_or(CollectError::UnknownIndex(logical_index))
    }

    /// Card ids in ascending logical-index order.
    pub fn all_card_ids(&self) -> Vec<u32> {
        self.by_index.values().copied().collect()
    }

    pub fn all_logical_indices(&self) -> Vec<u32> {
        self.by_index.keys().copied().collect()
    }

    /// `(logical_index, card_id)` in ascending index order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_index.iter().map(|(&i, &c)| (i, c))
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

impl Default for HardwareMap {
    fn default() -> Self {
        let mut by_card = BTreeMap::new();
        let mut by_index = BTreeMap::new();
        for (i, &c) in DEFAULT_CARD_IDS.iter().enumerate() {
            by_card.insert(c, i as u32);
            by_index.insert(i as u32, c);
        }
        Self { by_card, by_index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let map = HardwareMap::default();
        assert_eq!(map.resolve(9).unwrap(), 1);
        assert_eq!(map.resolve_inverse(1).unwrap(), 9);
        assert_eq!(map.resolve(57).unwrap(), 7);
        assert_eq!(map.all_card_ids(), DEFAULT_CARD_IDS.to_vec());
        assert_eq!(map.all_logical_indices(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_round_trip() {
        let map = HardwareMap::default();
        for card in map.all_card_ids() {
            let idx = map.resolve(card).unwrap();
            let back = map.resolve_inverse(idx).unwrap();
            assert_eq!(map.resolve(back).unwrap(), idx);
        }
    }

    #[test]
    fn test_misses_are_errors() {
        let map = HardwareMap::default();
        assert!(matches!(map.resolve(2), Err(CollectError::UnknownCardId(2))));
        assert!(matches!(map.resolve_inverse(8), Err(CollectError::UnknownIndex(8))));
    }

    #[test]
    fn test_rejects_non_bijection() {
        assert!(HardwareMap::new([(1, 0), (1, 1)]).is_err());
        assert!(HardwareMap::new([(1, 0), (9, 0)]).is_err());
        assert!(HardwareMap::from_ordered_cards(&[1, 9, 1]).is_err());
    }

    #[test]
    fn test_entries_follow_index_order() {
        let map = HardwareMap::new([(57, 1), (3, 0)]).unwrap();
        assert_eq!(map.entries().collect::<Vec<_>>(), vec![(0, 3), (1, 57)]);
        assert_eq!(map.all_card_ids(), vec![3, 57]);
    }
}
