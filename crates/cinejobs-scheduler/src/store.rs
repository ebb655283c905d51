//! Trigger, lease and node tables shared by every node of one scheduler
//! cluster. All cross-node coordination happens here through single
//! conditional writes; the first writer wins and everyone else sees zero
//! changed rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{fmt_ts, lock, now, parse_opt_ts, parse_ts, SharedConnection};
use crate::error::{Result, SchedulerError};
use crate::job::JobDefinition;
use crate::types::{FireInstanceId, JobKey, TriggerDescriptor, TriggerFilter, TriggerId, TriggerState};

const TRIGGER_COLUMNS: &str = "id, job_name, job_group, job_type, next_fire_at, previous_fire_at,
     state, retry_count, max_retries, claimed_by";

/// A trigger to persist.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub key: JobKey,
    pub job_type: String,
    pub job_data: String,
    pub fire_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// A trigger this node has claimed and must now fire.
#[derive(Debug, Clone)]
pub struct ClaimedTrigger {
    pub id: TriggerId,
    pub key: JobKey,
    pub job_type: String,
    pub job_data: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_instance_id: FireInstanceId,
    pub claimed_at: DateTime<Utc>,
    /// Claimed by misfire recovery rather than the regular poll.
    pub misfired: bool,
}

/// The exclusive right, held by one node, to run one job identity now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: String,
    pub key: JobKey,
    pub node_id: String,
    pub fire_instance_id: FireInstanceId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    Granted(Lease),
    Busy { holder: Option<String> },
}

/// What one pass of dead-node recovery cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub dead_nodes: Vec<String>,
    pub leases_reclaimed: usize,
    pub triggers_reset: usize,
    pub triggers_unblocked: usize,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.dead_nodes.is_empty()
            && self.leases_reclaimed == 0
            && self.triggers_reset == 0
            && self.triggers_unblocked == 0
    }
}

pub struct TriggerStore {
    conn: SharedConnection,
    scheduler_name: String,
}

impl TriggerStore {
    pub fn new(conn: SharedConnection, scheduler_name: impl Into<String>) -> Self {
        Self {
            conn,
            scheduler_name: scheduler_name.into(),
        }
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    // --- job definitions ---------------------------------------------------

    /// Insert or refresh a durable job definition. Safe on every startup.
    pub fn upsert_definition(&self, def: &JobDefinition) -> Result<()> {
        let conn = lock(&self.conn)?;
        let now = fmt_ts(now());
        conn.execute(
            "INSERT INTO job_definitions
             (scheduler_name, job_name, job_group, job_type, max_retries,
              disallow_concurrent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(scheduler_name, job_name, job_group) DO UPDATE SET
                job_type = excluded.job_type,
                max_retries = excluded.max_retries,
                disallow_concurrent = excluded.disallow_concurrent,
                updated_at = excluded.updated_at",
            params![
                self.scheduler_name,
                def.key.name,
                def.key.group,
                def.job_type,
                def.max_retries,
                def.disallow_concurrent,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn definition(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        let conn = lock(&self.conn)?;
        let def = conn
            .query_row(
                "SELECT job_type, max_retries, disallow_concurrent FROM job_definitions
                 WHERE scheduler_name = ?1 AND job_name = ?2 AND job_group = ?3",
                params![self.scheduler_name, key.name, key.group],
                |row| {
                    Ok(JobDefinition {
                        key: key.clone(),
                        job_type: row.get(0)?,
                        max_retries: row.get(1)?,
                        disallow_concurrent: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(def)
    }

    // --- triggers ----------------------------------------------------------

    pub fn insert_trigger(&self, trigger: &NewTrigger) -> Result<TriggerId> {
        let conn = lock(&self.conn)?;
        let id = TriggerId::new();
        let now = fmt_ts(now());
        conn.execute(
            "INSERT INTO job_triggers
             (id, scheduler_name, job_name, job_group, job_type, job_data, retry_count,
              max_retries, next_fire_at, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'waiting', ?10, ?10)",
            params![
                id.as_str(),
                self.scheduler_name,
                trigger.key.name,
                trigger.key.group,
                trigger.job_type,
                trigger.job_data,
                trigger.retry_count,
                trigger.max_retries,
                fmt_ts(trigger.fire_at),
                now,
            ],
        )?;
        debug!(trigger_id = %id, job = %trigger.key, "trigger stored");
        Ok(id)
    }

    /// Claim waiting triggers due in `[not_before, now]`, earliest first.
    pub fn claim_due(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedTrigger>> {
        self.claim(node_id, Some(not_before), now, limit, false)
    }

    /// Claim waiting triggers overdue by more than the misfire threshold,
    /// i.e. due before `cutoff`. Policy: fire now, once.
    pub fn claim_misfired(
        &self,
        node_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedTrigger>> {
        // `next_fire_at < cutoff` is expressed as an inclusive upper bound one
        // millisecond earlier; stored times have millisecond precision.
        let upper = cutoff - chrono::Duration::milliseconds(1);
        self.claim(node_id, None, upper, limit, true)
    }

    fn claim(
        &self,
        node_id: &str,
        not_before: Option<DateTime<Utc>>,
        not_after: DateTime<Utc>,
        limit: usize,
        misfired: bool,
    ) -> Result<Vec<ClaimedTrigger>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(String, String, String, String, String, u32, u32, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, job_name, job_group, job_type, job_data, retry_count, max_retries,
                        next_fire_at
                 FROM job_triggers
                 WHERE scheduler_name = ?1 AND state = 'waiting'
                   AND next_fire_at IS NOT NULL AND next_fire_at <= ?2
                   AND (?3 IS NULL OR next_fire_at >= ?3)
                 ORDER BY next_fire_at, id
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        self.scheduler_name,
                        fmt_ts(not_after),
                        not_before.map(fmt_ts),
                        limit as i64,
                    ],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let claimed_at = now();
        let claimed_str = fmt_ts(claimed_at);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, name, group, job_type, job_data, retry_count, max_retries, fire_at) in candidates {
            let fire_instance_id = FireInstanceId::new();
            let changed = tx.execute(
                "UPDATE job_triggers
                 SET state = 'acquired', claimed_by = ?1, claimed_at = ?2,
                     fire_instance_id = ?3, updated_at = ?2
                 WHERE id = ?4 AND state = 'waiting'",
                params![node_id, claimed_str, fire_instance_id.as_str(), id],
            )?;
            if changed != 1 {
                continue;
            }
            claimed.push(ClaimedTrigger {
                id: TriggerId(id),
                key: JobKey::new(name, group),
                job_type,
                job_data,
                retry_count,
                max_retries,
                scheduled_fire_time: parse_ts(&fire_at)?,
                fire_instance_id,
                claimed_at,
                misfired,
            });
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// The identity's lease was busy: park the trigger until it is released.
    pub fn block_trigger(&self, id: &TriggerId) -> Result<()> {
        self.set_state(id, TriggerState::Acquired, TriggerState::Blocked)
    }

    /// Give a claimed trigger back without firing it.
    pub fn release_trigger(&self, id: &TriggerId) -> Result<()> {
        self.set_state(id, TriggerState::Acquired, TriggerState::Waiting)
    }

    pub fn mark_error(&self, id: &TriggerId) -> Result<()> {
        self.set_state(id, TriggerState::Acquired, TriggerState::Error)
    }

    /// A one-shot trigger has fired.
    pub fn complete_trigger(&self, id: &TriggerId, fired_at: DateTime<Utc>) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE job_triggers
             SET state = 'complete', previous_fire_at = ?1, next_fire_at = NULL,
                 claimed_by = NULL, claimed_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![fmt_ts(fired_at), fmt_ts(now()), id.as_str()],
        )?;
        Ok(())
    }

    /// Blocked triggers of `key` become claimable again, earliest first on
    /// the next poll.
    pub fn unblock(&self, key: &JobKey) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE job_triggers
             SET state = 'waiting', claimed_by = NULL, claimed_at = NULL, updated_at = ?1
             WHERE scheduler_name = ?2 AND job_name = ?3 AND job_group = ?4
               AND state = 'blocked'",
            params![fmt_ts(now()), self.scheduler_name, key.name, key.group],
        )?;
        Ok(n)
    }

    /// Delete a trigger that has not fired yet. Returns false if it does
    /// not exist or is already running/complete.
    pub fn cancel_trigger(&self, id: &TriggerId) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "DELETE FROM job_triggers
             WHERE id = ?1 AND scheduler_name = ?2
               AND state IN ('waiting', 'blocked', 'paused', 'error')",
            params![id.as_str(), self.scheduler_name],
        )?;
        Ok(n == 1)
    }

    pub fn pause_trigger(&self, id: &TriggerId) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE job_triggers SET state = 'paused', updated_at = ?1
             WHERE id = ?2 AND scheduler_name = ?3 AND state IN ('waiting', 'blocked')",
            params![fmt_ts(now()), id.as_str(), self.scheduler_name],
        )?;
        Ok(n == 1)
    }

    pub fn resume_trigger(&self, id: &TriggerId) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE job_triggers SET state = 'waiting', claimed_by = NULL, updated_at = ?1
             WHERE id = ?2 AND scheduler_name = ?3 AND state IN ('paused', 'error')",
            params![fmt_ts(now()), id.as_str(), self.scheduler_name],
        )?;
        Ok(n == 1)
    }

    pub fn get_trigger(&self, id: &TriggerId) -> Result<Option<TriggerDescriptor>> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {TRIGGER_COLUMNS} FROM job_triggers
                     WHERE id = ?1 AND scheduler_name = ?2"
                ),
                params![id.as_str(), self.scheduler_name],
                RawTrigger::from_row,
            )
            .optional()?;
        raw.map(RawTrigger::into_descriptor).transpose()
    }

    /// Live triggers, earliest next fire time first (fired ones last).
    pub fn list_triggers(&self, filter: &TriggerFilter) -> Result<Vec<TriggerDescriptor>> {
        let mut sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM job_triggers WHERE scheduler_name = ?"
        );
        let mut args: Vec<String> = vec![self.scheduler_name.clone()];
        if let Some(ref name) = filter.job_name {
            sql.push_str(" AND job_name = ?");
            args.push(name.clone());
        }
        if let Some(ref group) = filter.job_group {
            sql.push_str(" AND job_group = ?");
            args.push(group.clone());
        }
        if let Some(state) = filter.state {
            sql.push_str(" AND state = ?");
            args.push(state.as_str().to_string());
        }
        sql.push_str(" ORDER BY next_fire_at IS NULL, next_fire_at, created_at");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), RawTrigger::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawTrigger::into_descriptor).collect()
    }

    fn set_state(&self, id: &TriggerId, from: TriggerState, to: TriggerState) -> Result<()> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE job_triggers
             SET state = ?1, claimed_by = NULL, claimed_at = NULL, updated_at = ?2
             WHERE id = ?3 AND state = ?4",
            params![to.as_str(), fmt_ts(now()), id.as_str(), from.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::TriggerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    // --- leases ------------------------------------------------------------

    /// Try to take the lease on `key` for `node_id`.
    ///
    /// One conditional upsert decides: it inserts when no lease exists, or
    /// takes over a lease whose holder has not checked in since
    /// `stale_cutoff`. Two nodes racing here get exactly one winner because
    /// the store serializes the writes.
    pub fn acquire_lease(
        &self,
        key: &JobKey,
        node_id: &str,
        fire_instance_id: &FireInstanceId,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<LeaseAttempt> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let acquired_at = now();
        let acquired_str = fmt_ts(acquired_at);

        // The caller is alive by definition.
        touch_node(&tx, &self.scheduler_name, node_id, &acquired_str)?;

        let lease_id = Uuid::now_v7().to_string();
        let changed = tx.execute(
            "INSERT INTO job_leases
             (scheduler_name, job_name, job_group, lease_id, node_id, fire_instance_id, acquired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(scheduler_name, job_name, job_group) DO UPDATE SET
                lease_id = excluded.lease_id,
                node_id = excluded.node_id,
                fire_instance_id = excluded.fire_instance_id,
                acquired_at = excluded.acquired_at
             WHERE job_leases.node_id NOT IN (
                SELECT node_id FROM scheduler_nodes
                WHERE scheduler_name = ?1 AND last_checkin_at >= ?8
             )",
            params![
                self.scheduler_name,
                key.name,
                key.group,
                lease_id,
                node_id,
                fire_instance_id.as_str(),
                acquired_str,
                fmt_ts(stale_cutoff),
            ],
        )?;

        let attempt = if changed == 1 {
            LeaseAttempt::Granted(Lease {
                lease_id,
                key: key.clone(),
                node_id: node_id.to_string(),
                fire_instance_id: fire_instance_id.clone(),
                acquired_at,
            })
        } else {
            LeaseAttempt::Busy {
                holder: lease_holder(&tx, &self.scheduler_name, key)?,
            }
        };
        tx.commit()?;
        Ok(attempt)
    }

    /// Drop a lease. Returns false if it was already gone or taken over.
    pub fn release_lease(&self, lease: &Lease) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let n = conn.execute(
            "DELETE FROM job_leases
             WHERE scheduler_name = ?1 AND job_name = ?2 AND job_group = ?3 AND lease_id = ?4",
            params![
                self.scheduler_name,
                lease.key.name,
                lease.key.group,
                lease.lease_id,
            ],
        )?;
        Ok(n == 1)
    }

    // --- nodes -------------------------------------------------------------

    pub fn check_in(&self, node_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        touch_node(&conn, &self.scheduler_name, node_id, &fmt_ts(now()))?;
        Ok(())
    }

    /// Nodes that have not checked in since `cutoff`.
    pub fn silent_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT node_id FROM scheduler_nodes
             WHERE scheduler_name = ?1 AND last_checkin_at < ?2
             ORDER BY node_id",
        )?;
        let nodes = stmt
            .query_map(params![self.scheduler_name, fmt_ts(cutoff)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(nodes)
    }

    /// Reclaim what nodes silent since `stale_cutoff` left behind: their
    /// leases, and the triggers they had claimed. Blocked triggers whose
    /// identity is no longer leased become waiting again.
    pub fn recover_dead_nodes(&self, stale_cutoff: DateTime<Utc>) -> Result<Recovery> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = fmt_ts(stale_cutoff);
        let now = fmt_ts(now());

        let dead_nodes: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT node_id FROM scheduler_nodes
                 WHERE scheduler_name = ?1 AND last_checkin_at < ?2",
            )?;
            let rows = stmt
                .query_map(params![self.scheduler_name, stale], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };

        // Holders without a live check-in row: dead nodes and nodes that never registered.
        let alive = "SELECT node_id FROM scheduler_nodes
                     WHERE scheduler_name = ?1 AND last_checkin_at >= ?2";

        let leases_reclaimed = tx.execute(
            &format!(
                "DELETE FROM job_leases WHERE scheduler_name = ?1 AND node_id NOT IN ({alive})"
            ),
            params![self.scheduler_name, stale],
        )?;
        let triggers_reset = tx.execute(
            &format!(
                "UPDATE job_triggers
                 SET state = 'waiting', claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE scheduler_name = ?1 AND state = 'acquired'
                   AND claimed_by NOT IN ({alive})"
            ),
            params![self.scheduler_name, stale, now],
        )?;
        let triggers_unblocked = tx.execute(
            "UPDATE job_triggers
             SET state = 'waiting', updated_at = ?2
             WHERE scheduler_name = ?1 AND state = 'blocked'
               AND NOT EXISTS (
                   SELECT 1 FROM job_leases l
                   WHERE l.scheduler_name = job_triggers.scheduler_name
                     AND l.job_name = job_triggers.job_name
                     AND l.job_group = job_triggers.job_group
               )",
            params![self.scheduler_name, now],
        )?;
        tx.execute(
            "DELETE FROM scheduler_nodes WHERE scheduler_name = ?1 AND last_checkin_at < ?2",
            params![self.scheduler_name, stale],
        )?;
        tx.commit()?;

        Ok(Recovery {
            dead_nodes,
            leases_reclaimed,
            triggers_reset,
            triggers_unblocked,
        })
    }

    /// Startup self-recovery: a node that restarts under a fixed id must not
    /// wait for its own previous incarnation's leases to go stale.
    pub fn recover_node(&self, node_id: &str) -> Result<(usize, usize)> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let leases = tx.execute(
            "DELETE FROM job_leases WHERE scheduler_name = ?1 AND node_id = ?2",
            params![self.scheduler_name, node_id],
        )?;
        let triggers = tx.execute(
            "UPDATE job_triggers
             SET state = 'waiting', claimed_by = NULL, claimed_at = NULL, updated_at = ?3
             WHERE scheduler_name = ?1 AND state = 'acquired' AND claimed_by = ?2",
            params![self.scheduler_name, node_id, fmt_ts(now())],
        )?;
        tx.commit()?;
        if leases > 0 || triggers > 0 {
            info!(node_id, leases, triggers, "recovered state left by previous run of this node");
        }
        Ok((leases, triggers))
    }

    /// Remove this node's check-in row on clean shutdown.
    pub fn sign_off(&self, node_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM scheduler_nodes WHERE scheduler_name = ?1 AND node_id = ?2",
            params![self.scheduler_name, node_id],
        )?;
        Ok(())
    }
}

fn touch_node(
    conn: &rusqlite::Connection,
    scheduler_name: &str,
    node_id: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduler_nodes (scheduler_name, node_id, started_at, last_checkin_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(scheduler_name, node_id) DO UPDATE SET
            last_checkin_at = excluded.last_checkin_at",
        params![scheduler_name, node_id, now],
    )?;
    Ok(())
}

fn lease_holder(
    conn: &rusqlite::Connection,
    scheduler_name: &str,
    key: &JobKey,
) -> Result<Option<String>> {
    let holder = conn
        .query_row(
            "SELECT node_id FROM job_leases
             WHERE scheduler_name = ?1 AND job_name = ?2 AND job_group = ?3",
            params![scheduler_name, key.name, key.group],
            |row| row.get(0),
        )
        .optional()?;
    Ok(holder)
}

struct RawTrigger {
    id: String,
    job_name: String,
    job_group: String,
    job_type: String,
    next_fire_at: Option<String>,
    previous_fire_at: Option<String>,
    state: String,
    retry_count: u32,
    max_retries: u32,
    claimed_by: Option<String>,
}

impl RawTrigger {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            job_group: row.get(2)?,
            job_type: row.get(3)?,
            next_fire_at: row.get(4)?,
            previous_fire_at: row.get(5)?,
            state: row.get(6)?,
            retry_count: row.get(7)?,
            max_retries: row.get(8)?,
            claimed_by: row.get(9)?,
        })
    }

    fn into_descriptor(self) -> Result<TriggerDescriptor> {
        Ok(TriggerDescriptor {
            trigger_id: TriggerId(self.id),
            job_name: self.job_name,
            job_group: self.job_group,
            job_type: self.job_type,
            next_fire_time: parse_opt_ts(self.next_fire_at)?,
            previous_fire_time: parse_opt_ts(self.previous_fire_at)?,
            state: self
                .state
                .parse::<TriggerState>()
                .map_err(SchedulerError::CorruptRow)?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            claimed_by: self.claimed_by,
        })
    }
}
