use async_trait::async_trait;
use chrono::NaiveDate;
use protocol::equipment::{BucketSlot, DeviceStatus, EquipmentState, IntakeRecord, PointRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const BUCKET_RESET_ACTION: &str = "bucket_reset";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no equipment state recorded for {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UserStats {
    pub today_kg: f64,
    pub today_count: usize,
    pub total_points: u64,
}

#[async_trait]
pub trait EquipmentStore: Send + Sync {
    /// Most recent snapshot for the unit, `None` when nothing was ever recorded.
    async fn latest_status(&self, robot_code: &str) -> Result<Option<EquipmentState>, StoreError>;

    async fn save_status(&self, state: &EquipmentState) -> Result<(), StoreError>;

    /// Records the unit as emptied: every bucket at zero, bucket1 active, status normal.
    async fn reset_buckets(&self, robot_code: &str) -> Result<EquipmentState, StoreError> {
        let current = self
            .latest_status(robot_code)
            .await?
            .ok_or_else(|| StoreError::NotFound(robot_code.to_string()))?;
        let reset = emptied(&current);
        self.save_status(&reset).await?;
        Ok(reset)
    }
}

#[async_trait]
pub trait IntakeStore: Send + Sync {
    /// Recorded kilograms for the user on `date`, eligible or not.
    async fn sum_intake(&self, user_id: &str, date: NaiveDate) -> Result<f64, StoreError>;

    /// Stores the record and returns its id.
    async fn insert_intake(&self, record: &IntakeRecord) -> Result<String, StoreError>;

    async fn insert_points(&self, record: &PointRecord) -> Result<(), StoreError>;

    async fn user_stats(&self, user_id: &str, date: NaiveDate) -> Result<UserStats, StoreError>;
}

/// Snapshot of `current` after the operator emptied every bucket.
pub fn emptied(current: &EquipmentState) -> EquipmentState {
    let mut reset = current.next_snapshot(BUCKET_RESET_ACTION, "all buckets emptied");
    for slot in BucketSlot::PHYSICAL {
        reset.set_weight(slot, 0.0);
    }
    reset.active_bucket = BucketSlot::Bucket1;
    reset.device_status = DeviceStatus::Normal;
    reset
}

#[derive(Debug, Default)]
pub struct MemoryEquipmentStore {
    history: Mutex<Vec<EquipmentState>>,
}

impl MemoryEquipmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: EquipmentState) -> Self {
        Self {
            history: Mutex::new(vec![state]),
        }
    }

    /// Every snapshot recorded for the unit, oldest first.
    pub fn history(&self, robot_code: &str) -> Vec<EquipmentState> {
        self.history
            .lock()
            .map(|history| {
                history
                    .iter()
                    .filter(|state| state.robot_code == robot_code)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EquipmentStore for MemoryEquipmentStore {
    async fn latest_status(&self, robot_code: &str) -> Result<Option<EquipmentState>, StoreError> {
        let history = self
            .history
            .lock()
            .map_err(|_| StoreError::Unavailable("equipment history lock poisoned".to_string()))?;
        Ok(history
            .iter()
            .rev()
            .find(|state| state.robot_code == robot_code)
            .cloned())
    }

    async fn save_status(&self, state: &EquipmentState) -> Result<(), StoreError> {
        self.history
            .lock()
            .map_err(|_| StoreError::Unavailable("equipment history lock poisoned".to_string()))?
            .push(state.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledgers {
    intake: Vec<(String, IntakeRecord)>,
    points: Vec<PointRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryIntakeStore {
    ledgers: Mutex<Ledgers>,
    reject_points: AtomicBool,
}

impl MemoryIntakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `insert_points` call fail.
    pub fn reject_points(&self, reject: bool) {
        self.reject_points.store(reject, Ordering::SeqCst);
    }

    pub fn intake_records(&self) -> Vec<IntakeRecord> {
        self.ledgers
            .lock()
            .map(|ledgers| ledgers.intake.iter().map(|(_, record)| record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn point_records(&self) -> Vec<PointRecord> {
        self.ledgers
            .lock()
            .map(|ledgers| ledgers.points.clone())
            .unwrap_or_default()
    }

    fn ledgers(&self) -> Result<std::sync::MutexGuard<'_, Ledgers>, StoreError> {
        self.ledgers
            .lock()
            .map_err(|_| StoreError::Unavailable("intake ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl IntakeStore for MemoryIntakeStore {
    async fn sum_intake(&self, user_id: &str, date: NaiveDate) -> Result<f64, StoreError> {
        Ok(self
            .ledgers()?
            .intake
            .iter()
            .filter(|(_, record)| record.user_id == user_id && record.date == date)
            .map(|(_, record)| record.amount_kg)
            .sum())
    }

    async fn insert_intake(&self, record: &IntakeRecord) -> Result<String, StoreError> {
        if record.amount_kg.is_nan() || record.amount_kg <= 0.0 {
            return Err(StoreError::Rejected(format!(
                "intake amount must be positive, got {}",
                record.amount_kg
            )));
        }
        let id = Uuid::new_v4().to_string();
        self.ledgers()?.intake.push((id.clone(), record.clone()));
        Ok(id)
    }

    async fn insert_points(&self, record: &PointRecord) -> Result<(), StoreError> {
        if self.reject_points.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("point ledger offline".to_string()));
        }
        self.ledgers()?.points.push(record.clone());
        Ok(())
    }

    async fn user_stats(&self, user_id: &str, date: NaiveDate) -> Result<UserStats, StoreError> {
        let ledgers = self.ledgers()?;
        let today: Vec<f64> = ledgers
            .intake
            .iter()
            .filter(|(_, record)| record.user_id == user_id && record.date == date)
            .map(|(_, record)| record.amount_kg)
            .collect();
        Ok(UserStats {
            today_kg: today.iter().sum(),
            today_count: today.len(),
            total_points: ledgers
                .points
                .iter()
                .filter(|record| record.user_id == user_id)
                .map(|record| u64::from(record.points_earned))
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_status_is_most_recent_snapshot() {
        let store = MemoryEquipmentStore::new();
        assert!(store.latest_status("R1").await.expect("read").is_none());

        let first = EquipmentState::empty("R1", 20.0, DeviceStatus::Normal);
        let mut second = first.next_snapshot("weight_update", "1000 g");
        second.bucket1 = 1.0;
        store.save_status(&first).await.expect("save");
        store
            .save_status(&EquipmentState::empty("R2", 5.0, DeviceStatus::Fault))
            .await
            .expect("save");
        store.save_status(&second).await.expect("save");

        let latest = store.latest_status("R1").await.expect("read").expect("state");
        assert_eq!(latest.bucket1, 1.0);
        assert_eq!(store.history("R1").len(), 2);
    }

    #[tokio::test]
    async fn reset_appends_an_emptied_snapshot() {
        let mut full = EquipmentState::empty("R1", 4.0, DeviceStatus::NeedsCollection);
        full.bucket1 = 14.0;
        full.bucket4 = 13.5;
        full.active_bucket = BucketSlot::Bucket5;
        let store = MemoryEquipmentStore::with_state(full);

        let reset = store.reset_buckets("R1").await.expect("reset");
        assert_eq!(reset.total_kg(), 0.0);
        assert_eq!(reset.active_bucket, BucketSlot::Bucket1);
        assert_eq!(reset.device_status, DeviceStatus::Normal);
        assert_eq!(reset.temperature, 4.0);
        assert_eq!(store.history("R1").len(), 2);

        let err = store.reset_buckets("R9").await.expect_err("unknown unit");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_cover_today_and_lifetime_points() {
        let store = MemoryIntakeStore::new();
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let yesterday = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        for (date, kg) in [(yesterday, 1.5), (today, 0.4), (today, 0.3)] {
            store
                .insert_intake(&IntakeRecord {
                    user_id: "u1".to_string(),
                    amount_kg: kg,
                    input_type: "coffee_bean".to_string(),
                    date,
                    robot_code: "R1".to_string(),
                    transaction_id: None,
                })
                .await
                .expect("insert");
        }
        for (date, points) in [(yesterday, 15), (today, 4)] {
            store
                .insert_points(&PointRecord {
                    user_id: "u1".to_string(),
                    points_earned: points,
                    source_reference_id: "x".to_string(),
                    earned_date: date,
                })
                .await
                .expect("points");
        }
        let stats = store.user_stats("u1", today).await.expect("stats");
        assert!((stats.today_kg - 0.7).abs() < 1e-9);
        assert_eq!(stats.today_count, 2);
        assert_eq!(stats.total_points, 19);
    }
}
