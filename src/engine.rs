//! `AdherenceEngine`: the entry point for request handlers and the
//! background scanner.
//!
//! State is partitioned per user. Each partition owns one SQLite connection
//! behind a `Mutex`, so calls for different users never contend. Every
//! write runs in an immediate transaction and is retried on transient
//! SQLite errors per the configured [`RetryPolicy`](crate::db::retry::RetryPolicy).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::adherence;
use crate::clock::{Clock, SystemClock};
use crate::compartments::{self, load_medication, load_pillbox, CompartmentResolution};
use crate::config::{EngineConfig, StorageLocation};
use crate::db::retry::with_retry;
use crate::db::sqlite::{open_database, open_memory_database};
use crate::db::{normalize_ts, repository};
use crate::detection::{self, ScanReport};
use crate::error::EngineError;
use crate::ledger::{self, CancelToken};
use crate::models::*;
use crate::notify::{Dispatcher, NotificationRequest};
use crate::schedule::TimeWindow;

/// File name of a partition's ledger inside its directory.
const LEDGER_FILE: &str = "ledger.db";

struct Partition {
    user: Mutex<UserContext>,
    conn: Mutex<Connection>,
}

// ═══════════════════════════════════════════════════════════
// AdherenceEngine
// ═══════════════════════════════════════════════════════════

pub struct AdherenceEngine {
    config: EngineConfig,
    partitions: RwLock<HashMap<Uuid, Arc<Partition>>>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl AdherenceEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::build(config, None, Arc::new(SystemClock))
    }

    /// Engine whose caregiver notifications are also pushed to `sink`.
    pub fn with_notification_sink(
        config: EngineConfig,
        sink: UnboundedSender<NotificationRequest>,
    ) -> Result<Self, EngineError> {
        Self::build(config, Some(sink), Arc::new(SystemClock))
    }

    pub fn build(
        config: EngineConfig,
        sink: Option<UnboundedSender<NotificationRequest>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(config.dedup_window, sink),
            config,
            partitions: RwLock::new(HashMap::new()),
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        normalize_ts(self.clock.now())
    }

    // ── Partitions ─────────────────────────────────────────

    fn open_connection(&self, user: &UserContext) -> Result<Connection, EngineError> {
        match &self.config.storage {
            StorageLocation::Memory => Ok(open_memory_database()?),
            StorageLocation::Directory(root) => {
                let dir = root.join(user.user_id.to_string());
                std::fs::create_dir_all(&dir)?;
                Ok(open_database(&dir.join(LEDGER_FILE))?)
            }
        }
    }

    fn partition(&self, user: &UserContext) -> Result<Arc<Partition>, EngineError> {
        let existing = self
            .partitions
            .read()
            .map_err(|_| EngineError::LockPoisoned)?
            .get(&user.user_id)
            .cloned();
        if let Some(partition) = existing {
            let mut known = partition.user.lock().map_err(|_| EngineError::LockPoisoned)?;
            if known.time_zone != user.time_zone {
                tracing::info!(
                    user_id = %user.user_id,
                    from = %known.time_zone,
                    to = %user.time_zone,
                    "user time zone changed"
                );
                self.rezone(&partition, user)?;
                *known = *user;
            }
            drop(known);
            return Ok(partition);
        }

        let mut partitions = self.partitions.write().map_err(|_| EngineError::LockPoisoned)?;
        if let Some(partition) = partitions.get(&user.user_id) {
            return Ok(partition.clone());
        }
        let partition = Arc::new(Partition {
            user: Mutex::new(*user),
            conn: Mutex::new(self.open_connection(user)?),
        });
        partitions.insert(user.user_id, partition.clone());
        tracing::info!(user_id = %user.user_id, "partition opened");
        Ok(partition)
    }

    /// Drop pending occurrences laid out in the old zone so they are
    /// rebuilt in the new one. Caller holds the partition's user lock.
    fn rezone(&self, partition: &Partition, user: &UserContext) -> Result<(), EngineError> {
        let now = self.now();
        with_retry(&self.config.retry, || {
            let mut conn = partition.conn.lock().map_err(|_| EngineError::LockPoisoned)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ledger::rezone_pending(&tx, user, now)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Run `op` in an immediate transaction on the user's partition.
    fn write<T>(
        &self,
        user: &UserContext,
        mut op: impl FnMut(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let partition = self.partition(user)?;
        with_retry(&self.config.retry, || {
            let mut conn = partition.conn.lock().map_err(|_| EngineError::LockPoisoned)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn read<T>(
        &self,
        user: &UserContext,
        mut op: impl FnMut(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let partition = self.partition(user)?;
        with_retry(&self.config.retry, || {
            let conn = partition.conn.lock().map_err(|_| EngineError::LockPoisoned)?;
            op(&conn)
        })
    }

    /// Open (creating if needed) the user's partition.
    pub fn open_user(&self, user: &UserContext) -> Result<(), EngineError> {
        self.partition(user).map(|_| ())
    }

    /// Users with an open partition.
    pub fn open_users(&self) -> Result<Vec<UserContext>, EngineError> {
        let partitions = self.partitions.read().map_err(|_| EngineError::LockPoisoned)?;
        let mut users = Vec::with_capacity(partitions.len());
        for partition in partitions.values() {
            users.push(*partition.user.lock().map_err(|_| EngineError::LockPoisoned)?);
        }
        users.sort_by_key(|u| u.user_id);
        Ok(users)
    }

    // ── Pillbox & compartments ─────────────────────────────

    /// Create the user's pillbox. `compartments` defaults to the configured count.
    pub fn create_pillbox(&self, user: &UserContext, compartments: Option<u8>) -> Result<Pillbox, EngineError> {
        let count = compartments.unwrap_or(self.config.default_compartments);
        let now = self.now();
        self.write(user, |conn| {
            if repository::get_pillbox(conn, &user.user_id)?.is_some() {
                return Err(EngineError::Validation(format!(
                    "user {} already has a pillbox",
                    user.user_id
                )));
            }
            let pillbox = Pillbox::new(user.user_id, count, now)?;
            repository::insert_pillbox(conn, &pillbox)?;
            Ok(pillbox)
        })
    }

    pub fn pillbox(&self, user: &UserContext) -> Result<Pillbox, EngineError> {
        self.read(user, |conn| load_pillbox(conn, user))
    }

    pub fn assign_compartment(
        &self,
        user: &UserContext,
        index: u8,
        medication_id: &Uuid,
    ) -> Result<Pillbox, EngineError> {
        let now = self.now();
        self.write(user, |conn| compartments::assign(conn, user, index, medication_id, now))
    }

    pub fn unassign_compartment(&self, user: &UserContext, index: u8) -> Result<Pillbox, EngineError> {
        self.write(user, |conn| compartments::unassign(conn, user, index))
    }

    pub fn resolve_compartment(
        &self,
        user: &UserContext,
        schedule_entry_id: &Uuid,
    ) -> Result<CompartmentResolution, EngineError> {
        self.read(user, |conn| {
            let entry = repository::get_schedule_entry(conn, schedule_entry_id)?
                .ok_or_else(|| EngineError::not_found("schedule entry", schedule_entry_id))?;
            let resolution = match repository::get_pillbox(conn, &user.user_id)? {
                Some(pillbox) => compartments::resolve_compartment(&pillbox, &entry),
                None => CompartmentResolution::Unbound,
            };
            if resolution == CompartmentResolution::Unbound {
                tracing::warn!(
                    user_id = %user.user_id,
                    schedule_entry_id = %entry.id,
                    compartment = entry.compartment,
                    "schedule entry is unbound"
                );
            }
            Ok(resolution)
        })
    }

    // ── Medications ────────────────────────────────────────

    pub fn add_medication(&self, user: &UserContext, input: NewMedication) -> Result<Medication, EngineError> {
        let medication = Medication::new(user.user_id, input, self.now())?;
        self.write(user, |conn| {
            repository::insert_medication(conn, &medication)?;
            Ok(medication.clone())
        })
    }

    pub fn get_medication(&self, user: &UserContext, id: &Uuid) -> Result<Medication, EngineError> {
        self.read(user, |conn| load_medication(conn, id))
    }

    pub fn list_medications(&self, user: &UserContext) -> Result<Vec<Medication>, EngineError> {
        self.read(user, |conn| Ok(repository::list_medications(conn)?))
    }

    /// Rename a medication. Existing history keeps the old name.
    pub fn rename_medication(&self, user: &UserContext, id: &Uuid, name: &str) -> Result<Medication, EngineError> {
        let name = validate_name(name)?;
        self.write(user, |conn| {
            repository::rename_medication(conn, id, &name)?;
            load_medication(conn, id)
        })
    }

    // ── Schedule entries ───────────────────────────────────

    /// Add a schedule entry. An empty target compartment is bound to the
    /// entry's medication; an occupied one is left alone.
    pub fn add_schedule_entry(
        &self,
        user: &UserContext,
        input: NewScheduleEntry,
    ) -> Result<ScheduleEntry, EngineError> {
        if let Some(rule) = &input.rule {
            rule.validate()?;
        }
        let now = self.now();
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            medication_id: input.medication_id,
            compartment: input.compartment,
            rule: input.rule,
            starts_at: normalize_ts(input.starts_at.unwrap_or(now)),
            retired_at: None,
            created_at: now,
        };

        self.write(user, |conn| {
            let pillbox = load_pillbox(conn, user)?;
            let occupant = match pillbox.compartment(entry.compartment) {
                Some(slot) => slot.medication_id,
                None => {
                    return Err(EngineError::Validation(format!(
                        "compartment {} outside 1..={}",
                        entry.compartment,
                        pillbox.compartment_count()
                    )))
                }
            };
            let medication = load_medication(conn, &entry.medication_id)?;
            entry.effective_rule(&medication)?.validate()?;
            compartments::check_schedule_claim(conn, user.time_zone, &entry, &medication)?;

            repository::insert_schedule_entry(conn, &entry)?;
            match occupant {
                None => repository::set_compartment(conn, &pillbox.id, entry.compartment, Some(&medication.id))?,
                Some(held) if held != medication.id => tracing::warn!(
                    user_id = %user.user_id,
                    schedule_entry_id = %entry.id,
                    compartment = entry.compartment,
                    held_by = %held,
                    "schedule entry targets a compartment holding another medication"
                ),
                Some(_) => {}
            }
            Ok(entry.clone())
        })
    }

    /// Stop an entry from producing occurrences from now on. Pending
    /// occurrences at or after now are dropped; history is untouched.
    pub fn retire_schedule_entry(&self, user: &UserContext, id: &Uuid) -> Result<ScheduleEntry, EngineError> {
        let now = self.now();
        self.write(user, |conn| {
            if repository::retire_schedule_entry(conn, id, now)? {
                let dropped = repository::delete_pending_from(conn, id, now)?;
                tracing::info!(schedule_entry_id = %id, dropped, "schedule entry retired");
            }
            repository::get_schedule_entry(conn, id)?
                .ok_or_else(|| EngineError::not_found("schedule entry", id))
        })
    }

    pub fn list_schedule_entries(
        &self,
        user: &UserContext,
        include_retired: bool,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        self.read(user, |conn| Ok(repository::list_schedule_entries(conn, include_retired)?))
    }

    // ── Evaluation ─────────────────────────────────────────

    /// Occurrences due in `[from, to)` across all schedule entries, with
    /// their ledger state.
    pub fn evaluate_window(
        &self,
        user: &UserContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerOccurrence>, EngineError> {
        let window = TimeWindow::new(normalize_ts(from), normalize_ts(to))?;
        self.write(user, |conn| ledger::evaluate_window(conn, user, window, None))
    }

    /// As [`evaluate_window`](Self::evaluate_window), abandoning the work
    /// (and every row it wrote) once `cancel` fires.
    pub fn evaluate_window_cancellable(
        &self,
        user: &UserContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<Vec<LedgerOccurrence>, EngineError> {
        let window = TimeWindow::new(normalize_ts(from), normalize_ts(to))?;
        self.write(user, |conn| ledger::evaluate_window(conn, user, window, Some(cancel)))
    }

    // ── Reports ────────────────────────────────────────────

    pub fn record_taken(
        &self,
        user: &UserContext,
        medication_ids: &[Uuid],
        actual: DateTime<Utc>,
    ) -> Result<HistoryRecord, EngineError> {
        let now = self.now();
        let grace = self.config.grace;
        self.write(user, |conn| adherence::record_taken(conn, user, &grace, medication_ids, actual, now))
    }

    pub fn record_skipped(
        &self,
        user: &UserContext,
        key: OccurrenceKey,
        at: DateTime<Utc>,
    ) -> Result<HistoryRecord, EngineError> {
        let now = self.now();
        self.write(user, |conn| adherence::record_skipped(conn, user, key, at, now))
    }

    /// Sensor report: compartment `index` was opened at `at`. Reconciled as
    /// a taken report for whatever the compartment holds.
    pub fn record_compartment_opened(
        &self,
        user: &UserContext,
        index: u8,
        at: DateTime<Utc>,
    ) -> Result<HistoryRecord, EngineError> {
        let now = self.now();
        let grace = self.config.grace;
        self.write(user, |conn| {
            let held = repository::get_pillbox(conn, &user.user_id)?.and_then(|p| p.occupant(index));
            if held.is_none() {
                tracing::warn!(user_id = %user.user_id, compartment = index, "opened compartment is empty");
            }
            let medications: Vec<Uuid> = held.into_iter().collect();
            adherence::record_taken(conn, user, &grace, &medications, at, now)
        })
    }

    // ── Detection & dispatch ───────────────────────────────

    /// Run the missed-dose scan for one user and raise caregiver
    /// notifications for what it found. Both commit together, so a missed
    /// dose is never left without its notifications.
    pub fn scan_missed(&self, user: &UserContext) -> Result<ScanReport, EngineError> {
        let now = self.now();
        let grace = self.config.grace;
        let report = self.write(user, |conn| {
            let mut report = detection::scan_missed(conn, user, &grace, now, None)?;
            report.notifications = self.dispatcher.raise(conn, &report.missed, now)?;
            Ok(report)
        })?;
        self.dispatcher.deliver(&report.notifications)?;
        Ok(report)
    }

    /// Scan every open partition. Failures are reported per user.
    pub fn scan_all(&self) -> Result<Vec<(Uuid, Result<ScanReport, EngineError>)>, EngineError> {
        Ok(self
            .open_users()?
            .into_iter()
            .map(|user| (user.user_id, self.scan_missed(&user)))
            .collect())
    }

    /// Raise caregiver notifications for `events`. Redelivered events
    /// raise nothing new.
    pub fn dispatch(&self, user: &UserContext, events: &[EngineEvent]) -> Result<Vec<EngineEvent>, EngineError> {
        let now = self.now();
        let raised = self.write(user, |conn| self.dispatcher.raise(conn, events, now))?;
        self.dispatcher.deliver(&raised)?;
        Ok(raised)
    }

    // ── Queries ────────────────────────────────────────────

    pub fn list_history(
        &self,
        user: &UserContext,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRecord>, EngineError> {
        self.read(user, |conn| Ok(repository::list_history(conn, from, to)?))
    }

    /// Pending occurrences due in `[from, to)`.
    pub fn list_pending_occurrences(
        &self,
        user: &UserContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerOccurrence>, EngineError> {
        Ok(self
            .evaluate_window(user, from, to)?
            .into_iter()
            .filter(|o| !o.state.is_terminal())
            .collect())
    }

    pub fn list_events(
        &self,
        user: &UserContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        self.read(user, |conn| Ok(repository::list_events(conn, since)?))
    }

    /// Counts of outcomes recorded in `[from, to)`.
    pub fn adherence_summary(
        &self,
        user: &UserContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AdherenceSummary, EngineError> {
        let records = self.list_history(user, Some(from), Some(to))?;
        let mut summary = AdherenceSummary::default();
        for record in &records {
            summary.tally(record);
        }
        Ok(summary)
    }

    // ── Caregivers ─────────────────────────────────────────

    /// Mirror a caregiver relationship owned by account management.
    pub fn upsert_cares_for(
        &self,
        user: &UserContext,
        caregiver_id: Uuid,
        preferences: NotificationPreferences,
        active: bool,
    ) -> Result<CaresFor, EngineError> {
        let link = CaresFor {
            caregiver_id,
            cared_for_id: user.user_id,
            preferences,
            active,
        };
        self.write(user, |conn| {
            repository::upsert_cares_for(conn, &link)?;
            Ok(link.clone())
        })
    }

    pub fn list_caregivers(&self, user: &UserContext) -> Result<Vec<CaresFor>, EngineError> {
        self.read(user, |conn| Ok(repository::list_cares_for(conn, &user.user_id)?))
    }
}
