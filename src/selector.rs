use crate::directory::SharedDirectory;
use crate::peer::types::{PeerId, PeerRecord, PeerStatus};
use crate::presence::PEERS_NODE;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Picks a random available peer from one presence snapshot.
pub struct PeerSelector {
    directory: Arc<dyn SharedDirectory>,
    stale_after: Duration,
    rng: Mutex<StdRng>,
}

impl PeerSelector {
    pub fn new(directory: Arc<dyn SharedDirectory>, stale_after: Duration) -> Self {
        Self::with_rng(directory, stale_after, StdRng::from_os_rng())
    }

    pub fn with_seed(directory: Arc<dyn SharedDirectory>, stale_after: Duration, seed: u64) -> Self {
        Self::with_rng(directory, stale_after, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(directory: Arc<dyn SharedDirectory>, stale_after: Duration, rng: StdRng) -> Self {
        Self {
            directory,
            stale_after,
            rng: Mutex::new(rng),
        }
    }

    pub async fn find_candidate(&self, self_id: &PeerId) -> Option<PeerId> {
        self.find_candidate_excluding(self_id, &HashSet::new()).await
    }

    /// Like [`find_candidate`](Self::find_candidate) but skips peers in `excluded`.
    pub async fn find_candidate_excluding(
        &self,
        self_id: &PeerId,
        excluded: &HashSet<PeerId>,
    ) -> Option<PeerId> {
        let records: Vec<PeerRecord> = self
            .directory
            .scan(PEERS_NODE)
            .await
            .into_iter()
            .filter_map(|(key, value)| keyed_record(&key, value))
            .collect();

        let mut candidates = eligible_candidates(&records, self_id, Utc::now(), self.stale_after);
        candidates.retain(|id| !excluded.contains(id));
        debug!(
            "{} of {} presence records eligible for {self_id}",
            candidates.len(),
            records.len()
        );

        if candidates.is_empty() {
            return None;
        }
        let pick = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            rng.random_range(0..candidates.len())
        };
        Some(candidates.swap_remove(pick))
    }
}

/// Decodes a presence entry, dropping it unless its `id` names the key it is stored under.
fn keyed_record(key: &str, value: serde_json::Value) -> Option<PeerRecord> {
    let record: PeerRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => {
            trace!("skipping unreadable presence {key}: {e}");
            return None;
        }
    };
    if key.strip_prefix(PEERS_NODE) != Some(record.id.as_str()) {
        debug!("presence {key} claims id {}, skipping", record.id);
        return None;
    }
    Some(record)
}

/// Records that may be called: available, not `self_id`, seen less than `stale_after` ago.
/// Output order follows `records`.
pub fn eligible_candidates(
    records: &[PeerRecord],
    self_id: &PeerId,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<PeerId> {
    let max_age = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);
    records
        .iter()
        .filter(|r| r.status == PeerStatus::Available)
        .filter(|r| &r.id != self_id)
        .filter(|r| now.signed_duration_since(r.last_seen) < max_age)
        .map(|r| r.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::presence::presence_key;
    use serde_json::json;

    const STALE: Duration = Duration::from_secs(30);

    fn record(id: &str, status: PeerStatus, age_secs: i64, now: DateTime<Utc>) -> PeerRecord {
        PeerRecord {
            id: id.into(),
            status,
            last_seen: now - TimeDelta::seconds(age_secs),
        }
    }

    #[test]
    fn filters_self_busy_and_stale() {
        let now = Utc::now();
        let records = vec![
            record("peer-self", PeerStatus::Available, 1, now),
            record("peer-busy", PeerStatus::InCall, 1, now),
            record("peer-old", PeerStatus::Available, 30, now),
            record("peer-edge", PeerStatus::Available, 29, now),
            record("peer-ok", PeerStatus::Available, 5, now),
        ];
        let eligible = eligible_candidates(&records, &"peer-self".into(), now, STALE);
        assert_eq!(eligible, vec![PeerId::from("peer-edge"), PeerId::from("peer-ok")]);
    }

    #[test]
    fn never_returns_self_or_stale_for_any_age() {
        let now = Utc::now();
        for age in 0..90 {
            let records = vec![
                record("peer-self", PeerStatus::Available, age, now),
                record("peer-other", PeerStatus::Available, age, now),
            ];
            let eligible = eligible_candidates(&records, &"peer-self".into(), now, STALE);
            assert!(!eligible.contains(&"peer-self".into()));
            assert_eq!(eligible.is_empty(), age >= 30, "age {age}");
        }
    }

    async fn directory_with(records: &[PeerRecord]) -> Arc<MemoryDirectory> {
        let dir = Arc::new(MemoryDirectory::new());
        for r in records {
            dir.put(&presence_key(&r.id), Some(serde_json::to_value(r).unwrap()))
                .await;
        }
        dir
    }

    #[tokio::test]
    async fn single_candidate_is_always_selected() {
        let now = Utc::now();
        let dir = directory_with(&[
            record("peer-aaa", PeerStatus::Available, 0, now),
            record("peer-bbb", PeerStatus::Available, 5, now),
        ])
        .await;
        for seed in 0..16 {
            let selector = PeerSelector::with_seed(dir.clone(), STALE, seed);
            assert_eq!(
                selector.find_candidate(&"peer-aaa".into()).await,
                Some("peer-bbb".into())
            );
        }
    }

    #[tokio::test]
    async fn same_seed_same_choice() {
        let now = Utc::now();
        let dir = directory_with(&[
            record("peer-b", PeerStatus::Available, 1, now),
            record("peer-c", PeerStatus::Available, 1, now),
            record("peer-d", PeerStatus::Available, 1, now),
        ])
        .await;
        let a = PeerSelector::with_seed(dir.clone(), STALE, 42);
        let b = PeerSelector::with_seed(dir.clone(), STALE, 42);
        let me = PeerId::from("peer-a");
        for _ in 0..5 {
            assert_eq!(a.find_candidate(&me).await, b.find_candidate(&me).await);
        }
    }

    #[tokio::test]
    async fn none_when_only_self_or_excluded() {
        let now = Utc::now();
        let dir = directory_with(&[
            record("peer-a", PeerStatus::Available, 0, now),
            record("peer-b", PeerStatus::Available, 0, now),
        ])
        .await;
        dir.put("peers/garbage", Some(json!("not a record"))).await;

        let selector = PeerSelector::with_seed(dir, STALE, 7);
        let excluded: HashSet<PeerId> = [PeerId::from("peer-b")].into();
        assert_eq!(
            selector
                .find_candidate_excluding(&"peer-a".into(), &excluded)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn record_under_foreign_key_is_ignored() {
        let now = Utc::now();
        let dir = Arc::new(MemoryDirectory::new());
        let impostor = record("peer-victim", PeerStatus::Available, 0, now);
        dir.put("peers/peer-x", Some(serde_json::to_value(&impostor).unwrap()))
            .await;

        let selector = PeerSelector::with_seed(dir.clone(), STALE, 3);
        assert_eq!(selector.find_candidate(&"peer-a".into()).await, None);

        let honest = record("peer-x", PeerStatus::Available, 0, now);
        dir.put("peers/peer-x", Some(serde_json::to_value(&honest).unwrap()))
            .await;
        assert_eq!(
            selector.find_candidate(&"peer-a".into()).await,
            Some("peer-x".into())
        );
    }
}
