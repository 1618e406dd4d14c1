use crate::IntakeError;
use protocol::equipment::{BucketSlot, DeviceStatus, EquipmentState};

pub const WEIGHT_UPDATE_ACTION: &str = "weight_update";
pub const BUCKET_SWITCH_ACTION: &str = "bucket_switch";
pub const BUCKET_FULL_ACTION: &str = "bucket_full";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketThresholds {
    /// A bucket whose weight ends strictly above this hands over to the next one.
    pub switch_threshold_kg: f64,
}

impl Default for BucketThresholds {
    fn default() -> Self {
        Self {
            switch_threshold_kg: 13.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketTransition {
    pub state: EquipmentState,
    /// Bucket that received the weight.
    pub filled: BucketSlot,
    /// Command that rotates the unit onto the new active bucket, if it moved.
    pub move_command: Option<&'static str>,
}

impl BucketTransition {
    pub fn switched(&self) -> bool {
        self.state.active_bucket != self.filled
    }

    pub fn unit_full(&self) -> bool {
        self.state.active_bucket.is_full_sentinel()
    }
}

fn to_grams(kg: f64) -> u64 {
    (kg.max(0.0) * 1000.0).round() as u64
}

fn to_kg(grams: u64) -> f64 {
    grams as f64 / 1000.0
}

/// Adds `grams` to the active bucket of `state` and decides whether the unit moves on.
///
/// The whole reading lands in the active bucket even when it pushes it past the threshold;
/// only the next feed goes to the new bucket. Arithmetic runs in whole grams.
pub fn apply_weight(
    state: &EquipmentState,
    grams: u32,
    thresholds: BucketThresholds,
) -> Result<BucketTransition, IntakeError> {
    let filled = state.active_bucket;
    if filled.is_full_sentinel() {
        return Err(IntakeError::AllBucketsFull);
    }
    let new_grams = to_grams(state.weight(filled)) + u64::from(grams);
    let new_kg = to_kg(new_grams);

    let mut next = state.clone();
    next.set_weight(filled, new_kg);

    if new_grams <= to_grams(thresholds.switch_threshold_kg) {
        let next = next.next_snapshot(
            WEIGHT_UPDATE_ACTION,
            format!("{grams} g into {filled}, now {new_kg:.3} kg"),
        );
        return Ok(BucketTransition {
            state: next,
            filled,
            move_command: None,
        });
    }

    let advanced = filled.next();
    next.active_bucket = advanced;
    if advanced.is_full_sentinel() {
        next.device_status = DeviceStatus::NeedsCollection;
        let total = next.total_kg();
        let next = next.next_snapshot(
            BUCKET_FULL_ACTION,
            format!("all buckets are full, {total:.3} kg collected"),
        );
        tracing::warn!(event = "bucket.unit_full", robot_code = %next.robot_code, total_kg = total);
        return Ok(BucketTransition {
            state: next,
            filled,
            move_command: None,
        });
    }

    let next = next.next_snapshot(
        BUCKET_SWITCH_ACTION,
        format!("{filled} closed at {new_kg:.3} kg, {advanced} active"),
    );
    tracing::info!(
        event = "bucket.switched",
        robot_code = %next.robot_code,
        from = %filled,
        to = %advanced,
        kg = new_kg,
    );
    Ok(BucketTransition {
        state: next,
        filled,
        move_command: advanced.move_command(),
    })
}
