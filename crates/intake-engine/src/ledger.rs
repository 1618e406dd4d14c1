use crate::store::{IntakeStore, StoreError, UserStats};
use chrono::NaiveDate;
use protocol::config::IntakeConfig;
use protocol::equipment::{IntakeRecord, PointRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    pub daily_cap_kg: f64,
    /// Eligible kilograms per reward point.
    pub kg_per_point: f64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from(&IntakeConfig::default())
    }
}

impl From<&IntakeConfig> for QuotaPolicy {
    fn from(config: &IntakeConfig) -> Self {
        Self {
            daily_cap_kg: config.daily_cap_kg,
            kg_per_point: config.kg_per_point,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eligibility {
    pub eligible_kg: f64,
    pub new_total_kg: f64,
}

/// Whole grams, rounded down; the epsilon absorbs binary noise such as `0.57 * 1000.0`.
fn to_grams(kg: f64) -> i64 {
    (kg * 1000.0 + 1e-9).floor() as i64
}

fn to_kg(grams: i64) -> f64 {
    grams as f64 / 1000.0
}

impl QuotaPolicy {
    /// Splits a requested amount into the part that still earns credit today.
    pub fn eligibility(&self, today_total_kg: f64, requested_kg: f64) -> Eligibility {
        let cap = to_grams(self.daily_cap_kg).max(0);
        let today = to_grams(today_total_kg).max(0);
        let requested = to_grams(requested_kg).max(0);
        let eligible = if today >= cap {
            0
        } else {
            requested.min(cap - today)
        };
        Eligibility {
            eligible_kg: to_kg(eligible),
            new_total_kg: to_kg(today + requested),
        }
    }

    /// Whole points for an eligible amount, rounded down.
    pub fn points_for(&self, eligible_kg: f64) -> u32 {
        let per_point = to_grams(self.kg_per_point);
        if per_point <= 0 {
            return 0;
        }
        let eligible = to_grams(eligible_kg).max(0);
        u32::try_from(eligible / per_point).unwrap_or(u32::MAX)
    }

    pub fn cap_reached(&self, today_total_kg: f64) -> bool {
        to_grams(today_total_kg) >= to_grams(self.daily_cap_kg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    pub user_id: String,
    pub date: NaiveDate,
    pub amount_kg: f64,
    pub input_type: String,
    pub robot_code: String,
    pub transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedReceipt {
    pub intake_id: String,
    pub recorded_kg: f64,
    pub eligible_kg: f64,
    pub points: u32,
    pub today_total_kg: f64,
    /// Set when the intake was stored but the points could not be.
    pub points_error: Option<String>,
}

type KeyLocks = Mutex<HashMap<(String, NaiveDate), Arc<tokio::sync::Mutex<()>>>>;

/// Records feeds and their points. Feeds for the same user and day run one at a time so the
/// read-then-insert against the daily total cannot interleave.
pub struct IntakeLedger {
    store: Arc<dyn IntakeStore>,
    policy: QuotaPolicy,
    locks: KeyLocks,
}

impl IntakeLedger {
    pub fn new(store: Arc<dyn IntakeStore>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: QuotaPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    pub async fn today_total(&self, user_id: &str, date: NaiveDate) -> Result<f64, StoreError> {
        self.store.sum_intake(user_id, date).await
    }

    pub async fn stats(&self, user_id: &str, date: NaiveDate) -> Result<UserStats, StoreError> {
        self.store.user_stats(user_id, date).await
    }

    pub async fn record_feed(&self, request: &FeedRequest) -> Result<FeedReceipt, StoreError> {
        let key = (request.user_id.clone(), request.date);
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;
        let result = self.record_locked(request).await;
        drop(guard);
        self.release_key(&key, lock);
        result
    }

    async fn record_locked(&self, request: &FeedRequest) -> Result<FeedReceipt, StoreError> {
        let today = self.store.sum_intake(&request.user_id, request.date).await?;
        let eligibility = self.policy.eligibility(today, request.amount_kg);
        let intake_id = self
            .store
            .insert_intake(&IntakeRecord {
                user_id: request.user_id.clone(),
                amount_kg: request.amount_kg,
                input_type: request.input_type.clone(),
                date: request.date,
                robot_code: request.robot_code.clone(),
                transaction_id: request.transaction_id,
            })
            .await?;

        let points = self.policy.points_for(eligibility.eligible_kg);
        let mut points_error = None;
        if eligibility.eligible_kg > 0.0 {
            let record = PointRecord {
                user_id: request.user_id.clone(),
                points_earned: points,
                source_reference_id: intake_id.clone(),
                earned_date: request.date,
            };
            if let Err(err) = self.store.insert_points(&record).await {
                tracing::warn!(
                    event = "ledger.points_failed",
                    user_id = %request.user_id,
                    intake_id = %intake_id,
                    points,
                    error = %err,
                );
                points_error = Some(err.to_string());
            }
        }

        tracing::info!(
            event = "ledger.feed_recorded",
            user_id = %request.user_id,
            intake_id = %intake_id,
            recorded_kg = request.amount_kg,
            eligible_kg = eligibility.eligible_kg,
            points,
        );
        Ok(FeedReceipt {
            intake_id,
            recorded_kg: request.amount_kg,
            eligible_kg: eligibility.eligible_kg,
            points,
            today_total_kg: eligibility.new_total_kg,
            points_error,
        })
    }

    fn key_lock(&self, key: &(String, NaiveDate)) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_key(&self, key: &(String, NaiveDate), lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map holds one reference and `lock` the other: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
