//! Scan result list kept by the caller of the state machine

use log::debug;

use crate::core::serial::types::{DiscoveryRecord, Peripheral, PeripheralId};

/// Peripherals found during one scan session, unique by id.
///
/// The first sighting of an id wins: later reports of the same peripheral are
/// ignored, so its recorded strength stays at the first reading unless
/// `refresh_rssi` is enabled.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryList {
    records: Vec<DiscoveryRecord>,
    refresh_rssi: bool,
}

impl DiscoveryList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list where repeated sightings update the recorded strength
    pub fn with_rssi_refresh(refresh_rssi: bool) -> Self {
        Self {
            records: Vec::new(),
            refresh_rssi,
        }
    }

    /// Records a sighting. Returns true if the peripheral was not known yet.
    pub fn insert(&mut self, peripheral: Peripheral, rssi: Option<i16>) -> bool {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|record| record.peripheral.id == peripheral.id)
        {
            if self.refresh_rssi && rssi.is_some() {
                existing.rssi = rssi;
            }
            debug!("Ignoring repeated sighting of {}", peripheral.id);
            return false;
        }

        self.records.push(DiscoveryRecord { peripheral, rssi });
        true
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&DiscoveryRecord> {
        self.records.iter().find(|record| &record.peripheral.id == id)
    }

    /// Records in the order they were first seen
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryRecord> {
        self.records.iter()
    }

    /// Records ordered by ascending signal strength, weakest first.
    /// Entries without a reading sort as 0 dBm.
    pub fn sorted(&self) -> Vec<&DiscoveryRecord> {
        let mut sorted: Vec<_> = self.records.iter().collect();
        sorted.sort_by_key(|record| record.strength());
        sorted
    }

    /// The best candidate to connect to. Measured sightings win over
    /// snapshot entries, which carry no reading.
    pub fn strongest(&self) -> Option<&DiscoveryRecord> {
        self.records
            .iter()
            .filter(|record| record.rssi.is_some())
            .max_by_key(|record| record.strength())
            .or_else(|| self.records.first())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forgets every record, ready for a new scan session
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peripheral(id: &str) -> Peripheral {
        Peripheral::new(id, Some(format!("HM-{}", id)))
    }

    #[test]
    fn duplicate_identifier_keeps_first_sighting() {
        let mut list = DiscoveryList::new();
        assert!(list.insert(peripheral("P1"), Some(-40)));
        assert!(list.insert(peripheral("P2"), Some(-70)));
        assert!(!list.insert(peripheral("P1"), Some(-30)));

        let order: Vec<_> = list
            .iter()
            .map(|record| (record.peripheral.id.as_str(), record.rssi))
            .collect();
        assert_eq!(order, vec![("P1", Some(-40)), ("P2", Some(-70))]);
        assert_eq!(list.get(&PeripheralId::new("P1")).unwrap().rssi, Some(-40));
    }

    #[test]
    fn each_identifier_appears_once_for_any_sequence() {
        let mut list = DiscoveryList::new();
        let sightings = ["A", "B", "A", "C", "B", "B", "D", "A"];
        for (i, id) in sightings.iter().enumerate() {
            list.insert(peripheral(id), Some(-(i as i16) * 5));
        }

        let ids: Vec<_> = list.iter().map(|record| record.peripheral.id.to_string()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
        // First occurrences were at positions 0, 1, 3 and 6
        let strengths: Vec<_> = list.iter().map(|record| record.rssi).collect();
        assert_eq!(strengths, vec![Some(0), Some(-5), Some(-15), Some(-30)]);
    }

    #[test]
    fn refresh_mode_updates_strength() {
        let mut list = DiscoveryList::with_rssi_refresh(true);
        list.insert(peripheral("P1"), Some(-40));
        assert!(!list.insert(peripheral("P1"), Some(-30)));
        assert!(!list.insert(peripheral("P1"), None));

        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&PeripheralId::new("P1")).unwrap().rssi, Some(-30));
    }

    #[test]
    fn sorted_is_weakest_first_and_missing_counts_as_zero() {
        let mut list = DiscoveryList::new();
        list.insert(peripheral("P1"), Some(-40));
        list.insert(peripheral("P2"), Some(-70));
        list.insert(peripheral("P3"), None);

        let ids: Vec<_> = list
            .sorted()
            .into_iter()
            .map(|record| record.peripheral.id.to_string())
            .collect();
        assert_eq!(ids, vec!["P2", "P1", "P3"]);
    }

    #[test]
    fn strongest_prefers_measured_sightings() {
        let mut list = DiscoveryList::new();
        assert!(list.strongest().is_none());

        list.insert(peripheral("bonded"), None);
        assert_eq!(list.strongest().unwrap().peripheral.id.as_str(), "bonded");

        list.insert(peripheral("P1"), Some(-70));
        list.insert(peripheral("P2"), Some(-45));
        assert_eq!(list.strongest().unwrap().peripheral.id.as_str(), "P2");
    }

    #[test]
    fn clear_starts_a_new_session() {
        let mut list = DiscoveryList::new();
        list.insert(peripheral("P1"), Some(-40));
        list.clear();
        assert!(list.is_empty());
        assert!(list.insert(peripheral("P1"), Some(-20)));
    }
}
