use crate::bucket::{apply_weight, BucketThresholds};
use crate::executor::{ProgressTx, SequenceExecutor, SequenceReport};
use crate::health::{HealthProbe, HealthReport};
use crate::ledger::{FeedReceipt, FeedRequest, IntakeLedger, QuotaPolicy};
use crate::store::{emptied, EquipmentStore, IntakeStore, StoreError, UserStats};
use crate::IntakeError;
use chrono::{NaiveDate, Utc};
use protocol::config::{HealthConfig, IntakeConfig, KioskConfig, MissingStateConfig};
use protocol::equipment::EquipmentState;
use protocol::proxy::PortInfo;
use protocol::{CommandStep, Trigger};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Name the bucket-move follow-up runs under.
pub const BUCKET_MOVE_TRIGGER: &str = "bucket_move";
const BUCKET_MOVE_WINDOW_SECS: f64 = 3.0;

/// The user a trigger feeds for, and the calendar day the quota is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedContext {
    pub user_id: String,
    pub date: NaiveDate,
}

impl FeedContext {
    pub fn today(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            date: Utc::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerReport {
    pub trigger: String,
    pub transaction_id: Uuid,
    pub sequence: SequenceReport,
    /// Equipment state after every weight reading was applied.
    pub state: EquipmentState,
    pub receipts: Vec<FeedReceipt>,
    /// The silent bucket-move sequence, when the unit switched buckets.
    pub follow_up: Option<SequenceReport>,
    /// Readings that were matched but not fed, such as zero grams.
    pub ignored_weights: usize,
    /// Snapshot or ledger writes that failed after the device already acted.
    pub accounting_errors: Vec<String>,
}

impl TriggerReport {
    pub fn succeeded(&self) -> bool {
        self.sequence.is_completed()
    }
}

pub struct DeviceSession {
    robot_code: String,
    executor: Mutex<SequenceExecutor>,
    equipment: Arc<dyn EquipmentStore>,
    ledger: IntakeLedger,
    thresholds: BucketThresholds,
    health: HealthProbe,
    missing: MissingStateConfig,
    input_type: String,
}

impl DeviceSession {
    pub fn new(
        robot_code: impl Into<String>,
        executor: SequenceExecutor,
        equipment: Arc<dyn EquipmentStore>,
        intake: Arc<dyn IntakeStore>,
    ) -> Self {
        let intake_config = IntakeConfig::default();
        Self {
            robot_code: robot_code.into(),
            executor: Mutex::new(executor),
            equipment,
            ledger: IntakeLedger::new(intake, QuotaPolicy::from(&intake_config)),
            thresholds: BucketThresholds {
                switch_threshold_kg: intake_config.switch_threshold_kg,
            },
            health: HealthProbe::new(
                &HealthConfig::default(),
                intake_config.collection_threshold_kg,
            ),
            missing: MissingStateConfig::default(),
            input_type: intake_config.input_type,
        }
    }

    pub fn from_config(
        config: &KioskConfig,
        executor: SequenceExecutor,
        equipment: Arc<dyn EquipmentStore>,
        intake: Arc<dyn IntakeStore>,
    ) -> Self {
        Self::new(config.robot_code.clone(), executor, equipment, intake)
            .with_intake_config(&config.intake)
            .with_health_config(&config.health, config.intake.collection_threshold_kg)
            .with_missing_state(config.missing_state.clone())
    }

    pub fn with_intake_config(mut self, config: &IntakeConfig) -> Self {
        self.ledger = self.ledger.with_policy(QuotaPolicy::from(config));
        self.thresholds = BucketThresholds {
            switch_threshold_kg: config.switch_threshold_kg,
        };
        self.input_type = config.input_type.clone();
        self
    }

    pub fn with_health_config(mut self, config: &HealthConfig, collection_threshold_kg: f64) -> Self {
        self.health = HealthProbe::new(config, collection_threshold_kg);
        self
    }

    pub fn with_missing_state(mut self, missing: MissingStateConfig) -> Self {
        self.missing = missing;
        self
    }

    pub fn robot_code(&self) -> &str {
        &self.robot_code
    }

    fn claim(&self) -> Result<tokio::sync::MutexGuard<'_, SequenceExecutor>, IntakeError> {
        self.executor
            .try_lock()
            .map_err(|_| IntakeError::Busy(self.robot_code.clone()))
    }

    /// Latest snapshot, or the configured placeholder when the unit has none yet.
    pub async fn current_state(&self) -> Result<EquipmentState, IntakeError> {
        Ok(self
            .equipment
            .latest_status(&self.robot_code)
            .await?
            .unwrap_or_else(|| self.placeholder_state()))
    }

    fn placeholder_state(&self) -> EquipmentState {
        EquipmentState::empty(
            self.robot_code.clone(),
            self.missing.temperature,
            self.missing.device_status,
        )
    }

    /// Runs a configured trigger. Weight readings update the buckets and, when `feed` names a
    /// user, the ledger; a bucket switch sends the move command once the sequence completed.
    pub async fn run_trigger(
        &self,
        trigger: &Trigger,
        feed: Option<&FeedContext>,
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
    ) -> Result<TriggerReport, IntakeError> {
        let mut executor = self.claim()?;
        let mut state = self.current_state().await?;
        if state.active_bucket.is_full_sentinel() {
            return Err(IntakeError::AllBucketsFull);
        }
        if let Some(feed) = feed {
            let today = self.ledger.today_total(&feed.user_id, feed.date).await?;
            let policy = self.ledger.policy();
            if policy.cap_reached(today) {
                return Err(IntakeError::DailyCapReached {
                    cap_kg: policy.daily_cap_kg,
                });
            }
        }

        let transaction_id = Uuid::new_v4();
        tracing::info!(
            event = "trigger.started",
            robot_code = %self.robot_code,
            trigger = %trigger.name,
            transaction_id = %transaction_id,
            user_id = feed.map(|feed| feed.user_id.as_str()).unwrap_or("-"),
        );
        let sequence = executor
            .run(&trigger.name, &trigger.steps, progress, cancel)
            .await;

        let mut receipts = Vec::new();
        let mut accounting_errors = Vec::new();
        let mut ignored_weights = 0;
        let mut move_command = None;
        for reading in &sequence.weights {
            if reading.grams == 0 {
                tracing::warn!(event = "trigger.zero_weight", robot_code = %self.robot_code, step = reading.step);
                ignored_weights += 1;
                continue;
            }
            let transition = match apply_weight(&state, reading.grams, self.thresholds) {
                Ok(transition) => transition,
                Err(err) => {
                    tracing::warn!(event = "trigger.weight_rejected", robot_code = %self.robot_code, error = %err);
                    accounting_errors.push(err.to_string());
                    ignored_weights += 1;
                    continue;
                }
            };
            if let Err(err) = self.equipment.save_status(&transition.state).await {
                tracing::error!(event = "trigger.snapshot_failed", robot_code = %self.robot_code, error = %err);
                accounting_errors.push(err.to_string());
            }
            if transition.move_command.is_some() {
                move_command = transition.move_command;
            }
            state = transition.state;

            let Some(feed) = feed else {
                continue;
            };
            let request = FeedRequest {
                user_id: feed.user_id.clone(),
                date: feed.date,
                amount_kg: f64::from(reading.grams) / 1000.0,
                input_type: self.input_type.clone(),
                robot_code: self.robot_code.clone(),
                transaction_id: Some(transaction_id),
            };
            match self.ledger.record_feed(&request).await {
                Ok(receipt) => {
                    if let Some(err) = &receipt.points_error {
                        accounting_errors.push(err.clone());
                    }
                    receipts.push(receipt);
                }
                Err(err) => {
                    tracing::error!(event = "trigger.intake_failed", user_id = %feed.user_id, error = %err);
                    accounting_errors.push(err.to_string());
                }
            }
        }

        let follow_up = match move_command {
            Some(command) if sequence.is_completed() => {
                let step = CommandStep::new(command, None, BUCKET_MOVE_WINDOW_SECS);
                let report = executor
                    .run(BUCKET_MOVE_TRIGGER, std::slice::from_ref(&step), None, cancel)
                    .await;
                if !report.is_completed() {
                    tracing::warn!(
                        event = "trigger.bucket_move_failed",
                        robot_code = %self.robot_code,
                        command = %command,
                        status = ?report.status,
                        error = report.error().unwrap_or_default(),
                    );
                }
                Some(report)
            }
            _ => None,
        };

        tracing::info!(
            event = "trigger.finished",
            robot_code = %self.robot_code,
            trigger = %trigger.name,
            transaction_id = %transaction_id,
            status = ?sequence.status,
            active_bucket = %state.active_bucket,
        );
        Ok(TriggerReport {
            trigger: trigger.name.clone(),
            transaction_id,
            sequence,
            state,
            receipts,
            follow_up,
            ignored_weights,
            accounting_errors,
        })
    }

    /// Probes the unit and records the classification as a new snapshot.
    pub async fn check_health(&self, cancel: &CancellationToken) -> Result<HealthReport, IntakeError> {
        let mut executor = self.claim()?;
        let result = self
            .health
            .probe(&mut executor, cancel)
            .await
            .map_err(|err| {
                if err.is_cancelled() {
                    IntakeError::Cancelled
                } else {
                    IntakeError::Transport(err)
                }
            })?;
        let current = self.current_state().await?;
        let report = self.health.classify(&result, &current);
        self.equipment.save_status(&report.snapshot).await?;
        tracing::info!(
            event = "health.classified",
            robot_code = %self.robot_code,
            status = %report.status,
            temperature = report.temperature,
            reason = report.reason.as_deref().unwrap_or("-"),
        );
        Ok(report)
    }

    /// Records that an operator emptied the unit.
    pub async fn reset_buckets(&self) -> Result<EquipmentState, IntakeError> {
        let _executor = self.claim()?;
        let state = match self.equipment.reset_buckets(&self.robot_code).await {
            Ok(state) => state,
            Err(StoreError::NotFound(_)) => {
                let state = emptied(&self.placeholder_state());
                self.equipment.save_status(&state).await?;
                state
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(event = "buckets.reset", robot_code = %self.robot_code);
        Ok(state)
    }

    pub async fn user_stats(&self, user_id: &str, date: NaiveDate) -> Result<UserStats, IntakeError> {
        Ok(self.ledger.stats(user_id, date).await?)
    }

    pub async fn ports(&self) -> Result<Vec<PortInfo>, IntakeError> {
        let mut executor = self.claim()?;
        Ok(executor.ports().await?)
    }

    pub async fn disconnect(&self) {
        self.executor.lock().await.disconnect().await;
    }
}
