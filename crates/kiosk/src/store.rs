use async_trait::async_trait;
use chrono::NaiveDate;
use intake_engine::store::{EquipmentStore, IntakeStore, StoreError, UserStats};
use protocol::equipment::{EquipmentState, IntakeRecord, PointRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

const EQUIPMENT_FILE: &str = "equipment.jsonl";
const INTAKE_FILE: &str = "intake.jsonl";
const POINTS_FILE: &str = "points.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct StoredIntake {
    id: String,
    #[serde(flatten)]
    record: IntakeRecord,
}

/// Append-only JSON-lines ledgers under one data directory.
pub(crate) struct JsonlStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub(crate) async fn open(dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir).await.map_err(|err| {
            StoreError::Unavailable(format!("failed to create {}: {err}", dir.display()))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)
            .map_err(|err| StoreError::Rejected(format!("failed to encode record: {err}")))?;
        line.push('\n');
        let path = self.dir.join(file);
        let _guard = self.write_lock.lock().await;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| unavailable(&path, err))?;
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|err| unavailable(&path, err))?;
        handle.flush().await.map_err(|err| unavailable(&path, err))?;
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(file);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(&path, err)),
        };
        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %err,
                        "skipping malformed ledger line"
                    );
                }
            }
        }
        Ok(records)
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl EquipmentStore for JsonlStore {
    async fn latest_status(&self, robot_code: &str) -> Result<Option<EquipmentState>, StoreError> {
        let history: Vec<EquipmentState> = self.load(EQUIPMENT_FILE).await?;
        Ok(history
            .into_iter()
            .rev()
            .find(|state| state.robot_code == robot_code))
    }

    async fn save_status(&self, state: &EquipmentState) -> Result<(), StoreError> {
        self.append(EQUIPMENT_FILE, state).await
    }
}

#[async_trait]
impl IntakeStore for JsonlStore {
    async fn sum_intake(&self, user_id: &str, date: NaiveDate) -> Result<f64, StoreError> {
        Ok(self.user_stats(user_id, date).await?.today_kg)
    }

    async fn insert_intake(&self, record: &IntakeRecord) -> Result<String, StoreError> {
        if record.amount_kg.is_nan() || record.amount_kg <= 0.0 {
            return Err(StoreError::Rejected(format!(
                "intake amount must be positive, got {}",
                record.amount_kg
            )));
        }
        let stored = StoredIntake {
            id: Uuid::new_v4().to_string(),
            record: record.clone(),
        };
        self.append(INTAKE_FILE, &stored).await?;
        Ok(stored.id)
    }

    async fn insert_points(&self, record: &PointRecord) -> Result<(), StoreError> {
        self.append(POINTS_FILE, record).await
    }

    async fn user_stats(&self, user_id: &str, date: NaiveDate) -> Result<UserStats, StoreError> {
        let intake: Vec<StoredIntake> = self.load(INTAKE_FILE).await?;
        let points: Vec<PointRecord> = self.load(POINTS_FILE).await?;
        let mut stats = UserStats::default();
        for stored in intake
            .iter()
            .filter(|stored| stored.record.user_id == user_id && stored.record.date == date)
        {
            stats.today_kg += stored.record.amount_kg;
            stats.today_count += 1;
        }
        stats.total_points = points
            .iter()
            .filter(|record| record.user_id == user_id)
            .map(|record| u64::from(record.points_earned))
            .sum();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::equipment::{BucketSlot, DeviceStatus};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{nanos}"))
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 14).expect("date")
    }

    fn intake(user_id: &str, amount_kg: f64) -> IntakeRecord {
        IntakeRecord {
            user_id: user_id.to_string(),
            amount_kg,
            input_type: "coffee_bean".to_string(),
            date: date(),
            robot_code: "R1".to_string(),
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn latest_status_survives_reopen() {
        let dir = temp_dir("kiosk-equipment");
        let store = JsonlStore::open(&dir).await.expect("open");
        assert!(store.latest_status("R1").await.expect("read").is_none());

        let mut state = EquipmentState::empty("R1", 21.0, DeviceStatus::Normal);
        store.save_status(&state).await.expect("save");
        state = state.next_snapshot("bucket_switch", "15000 g");
        state.bucket1 = 15.0;
        state.active_bucket = BucketSlot::Bucket2;
        store.save_status(&state).await.expect("save");

        let reopened = JsonlStore::open(&dir).await.expect("reopen");
        let latest = reopened.latest_status("R1").await.expect("read").expect("state");
        assert_eq!(latest.active_bucket, BucketSlot::Bucket2);
        assert_eq!(latest.bucket1, 15.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stats_sum_intake_and_points() {
        let dir = temp_dir("kiosk-intake");
        let store = JsonlStore::open(&dir).await.expect("open");
        let id = store.insert_intake(&intake("u1", 0.5)).await.expect("insert");
        store.insert_intake(&intake("u1", 0.25)).await.expect("insert");
        store.insert_intake(&intake("u2", 1.0)).await.expect("insert");
        store
            .insert_points(&PointRecord {
                user_id: "u1".to_string(),
                points_earned: 5,
                source_reference_id: id,
                earned_date: date(),
            })
            .await
            .expect("points");

        let stats = store.user_stats("u1", date()).await.expect("stats");
        assert_eq!(stats.today_count, 2);
        assert_eq!(stats.today_kg, 0.75);
        assert_eq!(stats.total_points, 5);
        assert_eq!(store.sum_intake("u2", date()).await.expect("sum"), 1.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = temp_dir("kiosk-malformed");
        let store = JsonlStore::open(&dir).await.expect("open");
        store.insert_intake(&intake("u1", 0.4)).await.expect("insert");
        let path = dir.join(INTAKE_FILE);
        let mut raw = std::fs::read_to_string(&path).expect("read");
        raw.push_str("{not json\n");
        std::fs::write(&path, raw).expect("write");
        store.insert_intake(&intake("u1", 0.1)).await.expect("insert");

        let total = store.sum_intake("u1", date()).await.expect("sum");
        assert!((total - 0.5).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let dir = temp_dir("kiosk-reject");
        let store = JsonlStore::open(&dir).await.expect("open");
        let err = store.insert_intake(&intake("u1", 0.0)).await.expect_err("reject");
        assert!(matches!(err, StoreError::Rejected(_)));
        let _ = std::fs::remove_dir_all(dir);
    }
}
