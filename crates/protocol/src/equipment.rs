use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of physical buckets in one collection unit.
pub const PHYSICAL_BUCKETS: usize = 4;

/// Which bucket receives the next feed. `Bucket5` is the sentinel for "every bucket is full".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BucketSlot {
    #[default]
    Bucket1,
    Bucket2,
    Bucket3,
    Bucket4,
    Bucket5,
}

impl BucketSlot {
    pub const PHYSICAL: [BucketSlot; PHYSICAL_BUCKETS] = [
        BucketSlot::Bucket1,
        BucketSlot::Bucket2,
        BucketSlot::Bucket3,
        BucketSlot::Bucket4,
    ];

    /// Zero-based index into the physical buckets, `None` for the sentinel.
    pub fn index(self) -> Option<usize> {
        match self {
            BucketSlot::Bucket1 => Some(0),
            BucketSlot::Bucket2 => Some(1),
            BucketSlot::Bucket3 => Some(2),
            BucketSlot::Bucket4 => Some(3),
            BucketSlot::Bucket5 => None,
        }
    }

    pub fn next(self) -> BucketSlot {
        match self {
            BucketSlot::Bucket1 => BucketSlot::Bucket2,
            BucketSlot::Bucket2 => BucketSlot::Bucket3,
            BucketSlot::Bucket3 => BucketSlot::Bucket4,
            BucketSlot::Bucket4 | BucketSlot::Bucket5 => BucketSlot::Bucket5,
        }
    }

    pub fn is_full_sentinel(self) -> bool {
        self == BucketSlot::Bucket5
    }

    /// Device command that physically rotates the unit onto this bucket.
    pub fn move_command(self) -> Option<&'static str> {
        match self {
            BucketSlot::Bucket2 => Some("(SB2P)"),
            BucketSlot::Bucket3 => Some("(SB3P)"),
            BucketSlot::Bucket4 => Some("(SB4P)"),
            BucketSlot::Bucket1 | BucketSlot::Bucket5 => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BucketSlot::Bucket1 => "bucket1",
            BucketSlot::Bucket2 => "bucket2",
            BucketSlot::Bucket3 => "bucket3",
            BucketSlot::Bucket4 => "bucket4",
            BucketSlot::Bucket5 => "bucket5",
        }
    }
}

impl std::fmt::Display for BucketSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Normal,
    NeedsCollection,
    Fault,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Normal => "normal",
            DeviceStatus::NeedsCollection => "needs_collection",
            DeviceStatus::Fault => "fault",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable snapshot of a collection unit. The current state is the most recent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquipmentState {
    pub robot_code: String,
    pub bucket1: f64,
    pub bucket2: f64,
    pub bucket3: f64,
    pub bucket4: f64,
    pub active_bucket: BucketSlot,
    pub temperature: f64,
    pub device_status: DeviceStatus,
    #[serde(default)]
    pub last_action_name: Option<String>,
    #[serde(default)]
    pub last_action_response: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EquipmentState {
    /// Empty unit: every bucket at zero, bucket1 active.
    pub fn empty(robot_code: impl Into<String>, temperature: f64, device_status: DeviceStatus) -> Self {
        Self {
            robot_code: robot_code.into(),
            bucket1: 0.0,
            bucket2: 0.0,
            bucket3: 0.0,
            bucket4: 0.0,
            active_bucket: BucketSlot::Bucket1,
            temperature,
            device_status,
            last_action_name: None,
            last_action_response: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn weights(&self) -> [f64; PHYSICAL_BUCKETS] {
        [self.bucket1, self.bucket2, self.bucket3, self.bucket4]
    }

    /// Weight of a bucket in kilograms; the sentinel holds nothing.
    pub fn weight(&self, slot: BucketSlot) -> f64 {
        slot.index().map_or(0.0, |index| self.weights()[index])
    }

    pub fn set_weight(&mut self, slot: BucketSlot, kg: f64) {
        match slot {
            BucketSlot::Bucket1 => self.bucket1 = kg,
            BucketSlot::Bucket2 => self.bucket2 = kg,
            BucketSlot::Bucket3 => self.bucket3 = kg,
            BucketSlot::Bucket4 => self.bucket4 = kg,
            BucketSlot::Bucket5 => {}
        }
    }

    pub fn total_kg(&self) -> f64 {
        self.weights().iter().sum()
    }

    /// Copy of this snapshot stamped as a new action.
    pub fn next_snapshot(&self, action_name: &str, action_response: impl Into<String>) -> Self {
        Self {
            last_action_name: Some(action_name.to_string()),
            last_action_response: Some(action_response.into()),
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntakeRecord {
    pub user_id: String,
    pub amount_kg: f64,
    pub input_type: String,
    pub date: NaiveDate,
    pub robot_code: String,
    #[serde(default)]
    pub transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointRecord {
    pub user_id: String,
    pub points_earned: u32,
    pub source_reference_id: String,
    pub earned_date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_order_ends_in_sentinel() {
        let mut slot = BucketSlot::Bucket1;
        let mut seen = vec![slot];
        while !slot.is_full_sentinel() {
            slot = slot.next();
            seen.push(slot);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(BucketSlot::Bucket5.next(), BucketSlot::Bucket5);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn move_commands_exist_only_for_buckets_two_to_four() {
        assert_eq!(BucketSlot::Bucket1.move_command(), None);
        assert_eq!(BucketSlot::Bucket2.move_command(), Some("(SB2P)"));
        assert_eq!(BucketSlot::Bucket3.move_command(), Some("(SB3P)"));
        assert_eq!(BucketSlot::Bucket4.move_command(), Some("(SB4P)"));
        assert_eq!(BucketSlot::Bucket5.move_command(), None);
    }

    #[test]
    fn sentinel_weight_is_zero_and_not_writable() {
        let mut state = EquipmentState::empty("R1", 20.0, DeviceStatus::Normal);
        state.set_weight(BucketSlot::Bucket5, 3.0);
        state.set_weight(BucketSlot::Bucket3, 2.5);
        assert_eq!(state.weight(BucketSlot::Bucket5), 0.0);
        assert_eq!(state.total_kg(), 2.5);
    }

    #[test]
    fn slot_serializes_as_bucket_name() {
        let json = serde_json::to_string(&BucketSlot::Bucket5).expect("serialize");
        assert_eq!(json, "\"bucket5\"");
    }
}
