use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::models::*;
use crate::errors::StoreError;
use crate::plan::{Complexity, Plan};

type Result<T> = std::result::Result<T, StoreError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COLUMNS: &str = "id, state, plan_hash, plan_name, token_cap, max_phases, tokens_used, \
     doctor_invocations, disabled_providers, stop_reason, created_at, updated_at";

const PHASE_COLUMNS: &str = "run_id, phase_id, tier_index, phase_index, name, description, \
     deliverables, scope, category, complexity, state, retry_attempt, last_failure_reason, \
     token_budget, doctor_invocations, doctor_guidance, updated_at";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::CorruptValue {
        column: column.to_string(),
        value: value.to_string(),
    }
}

fn encode_list(column: &str, items: &[String]) -> Result<String> {
    serde_json::to_string(items).map_err(|e| corrupt(column, &e.to_string()))
}

fn decode_list(column: &str, raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|_| corrupt(column, raw))
}

/// Durable phase state machine over SQLite.
///
/// Every transition that touches more than one column runs in a single
/// transaction; claims use `BEGIN IMMEDIATE` so concurrent processes
/// serialize on the write lock instead of racing.
pub struct PhaseStore {
    conn: Connection,
}

impl PhaseStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "store opened");
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'QUEUED',
                plan_hash TEXT NOT NULL,
                plan_name TEXT,
                token_cap INTEGER,
                max_phases INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                doctor_invocations INTEGER NOT NULL DEFAULT 0,
                disabled_providers TEXT NOT NULL DEFAULT '[]',
                stop_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tiers (
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                tier_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (run_id, tier_index)
            );

            CREATE TABLE IF NOT EXISTS phases (
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                phase_id TEXT NOT NULL,
                tier_index INTEGER NOT NULL,
                phase_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                deliverables TEXT NOT NULL DEFAULT '[]',
                scope TEXT NOT NULL DEFAULT '[]',
                category TEXT NOT NULL,
                complexity TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'QUEUED',
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                last_failure_reason TEXT,
                token_budget INTEGER,
                doctor_invocations INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, phase_id),
                FOREIGN KEY (run_id, tier_index) REFERENCES tiers(run_id, tier_index)
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                budget INTEGER NOT NULL,
                predicted INTEGER NOT NULL,
                actual_tokens INTEGER NOT NULL DEFAULT 0,
                stop_reason TEXT,
                escalations INTEGER NOT NULL DEFAULT 0,
                patch_path TEXT,
                failure_kind TEXT,
                feedback TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (run_id, phase_id) REFERENCES phases(run_id, phase_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS token_estimations (
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                predicted INTEGER NOT NULL,
                actual INTEGER NOT NULL,
                budget INTEGER NOT NULL,
                category TEXT NOT NULL,
                complexity TEXT NOT NULL,
                deliverable_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, phase_id, outcome)
            );

            CREATE INDEX IF NOT EXISTS idx_phases_order ON phases(run_id, tier_index, phase_index);
            CREATE INDEX IF NOT EXISTS idx_runs_plan_hash ON runs(plan_hash);
            CREATE INDEX IF NOT EXISTS idx_attempts_phase ON attempts(run_id, phase_id);
            ",
        )?;

        // Additive migrations; only "duplicate column" is tolerated.
        match self
            .conn
            .execute("ALTER TABLE phases ADD COLUMN doctor_guidance TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Create a run with its tiers and phases in one transaction.
    pub fn ingest_plan(
        &mut self,
        plan: &Plan,
        max_phases: u32,
        token_cap: Option<u64>,
        protected: &[String],
    ) -> Result<String> {
        let problems = plan.problems(max_phases, protected);
        if !problems.is_empty() {
            return Err(StoreError::InvalidPlan(problems.join("; ")));
        }
        let plan_hash = plan
            .hash()
            .map_err(|e| StoreError::InvalidPlan(e.to_string()))?;
        let run_id = new_run_id();
        let ts = now();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (id, state, plan_hash, plan_name, token_cap, max_phases, created_at, updated_at)
             VALUES (?1, 'QUEUED', ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                run_id,
                plan_hash,
                plan.name,
                token_cap.map(|c| c as i64),
                max_phases,
                ts
            ],
        )?;
        for (tier_index, tier) in plan.tiers.iter().enumerate() {
            tx.execute(
                "INSERT INTO tiers (run_id, tier_index, name) VALUES (?1, ?2, ?3)",
                params![run_id, tier_index as u32, tier.name],
            )?;
            for (phase_index, phase) in tier.phases.iter().enumerate() {
                tx.execute(
                    "INSERT INTO phases (run_id, phase_id, tier_index, phase_index, name, description,
                         deliverables, scope, category, complexity, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        run_id,
                        phase.id,
                        tier_index as u32,
                        phase_index as u32,
                        phase.name,
                        phase.description,
                        encode_list("deliverables", &phase.deliverables)?,
                        encode_list("scope", &phase.scope)?,
                        phase.category,
                        phase.complexity.as_str(),
                        ts
                    ],
                )?;
            }
        }
        tx.commit()?;

        tracing::info!(run_id = %run_id, phases = plan.phase_count(), "plan ingested");
        Ok(run_id)
    }

    /// Remove a run and everything recorded under it.
    pub fn delete_run(&mut self, run_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        for table in ["attempts", "token_estimations", "phases", "tiers"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE run_id = ?1", table),
                params![run_id],
            )?;
        }
        let deleted = tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        if deleted == 0 {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        tx.commit()?;
        tracing::info!(run_id, "run deleted");
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![run_id], run_row)
            .optional()?;
        match row {
            Some(row) => row.into_run(),
            None => Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>> {
        Ok(self.list_runs()?.into_iter().next())
    }

    /// Most recent non-terminal run created from the same plan.
    pub fn find_resumable_run(&self, plan_hash: &str) -> Result<Option<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM runs
             WHERE plan_hash = ?1 AND state NOT IN ('DONE_SUCCESS', 'DONE_NEEDS_REVIEW')
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![plan_hash], run_row)
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Move a non-terminal run to RUNNING.
    pub fn mark_running(&self, run_id: &str) -> Result<()> {
        self.get_run(run_id)?;
        self.conn.execute(
            "UPDATE runs SET state = 'RUNNING', stop_reason = NULL, updated_at = ?2
             WHERE id = ?1 AND state NOT IN ('DONE_SUCCESS', 'DONE_NEEDS_REVIEW')",
            params![run_id, now()],
        )?;
        Ok(())
    }

    /// Early stop: leave the run resumable.
    pub fn pause_run(&self, run_id: &str, reason: &str) -> Result<()> {
        self.get_run(run_id)?;
        self.conn.execute(
            "UPDATE runs SET state = 'PAUSED', stop_reason = ?2, updated_at = ?3
             WHERE id = ?1 AND state NOT IN ('DONE_SUCCESS', 'DONE_NEEDS_REVIEW')",
            params![run_id, reason, now()],
        )?;
        tracing::info!(run_id, reason, "run paused");
        Ok(())
    }

    /// Derive and write the run's terminal state.
    ///
    /// Returns `None` while any phase is still non-terminal. The guarded
    /// update means a terminal state is written at most once; later calls
    /// return the stored state unchanged.
    pub fn finalize_run(&mut self, run_id: &str) -> Result<Option<RunState>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT state FROM runs WHERE id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        };
        let current = RunState::from_str(&raw).map_err(|_| corrupt("runs.state", &raw))?;
        if current.is_terminal() {
            return Ok(Some(current));
        }

        let states: Vec<String> = {
            let mut stmt = tx.prepare("SELECT state FROM phases WHERE run_id = ?1")?;
            stmt.query_map(params![run_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let states = states
            .iter()
            .map(|s| PhaseState::from_str(s).map_err(|_| corrupt("phases.state", s)))
            .collect::<Result<Vec<_>>>()?;

        if states.iter().any(|s| !s.is_terminal()) {
            return Ok(None);
        }

        let complete = states
            .iter()
            .filter(|s| **s == PhaseState::Complete)
            .count();
        let target = if complete == states.len() {
            RunState::DoneSuccess
        } else {
            RunState::DoneNeedsReview
        };
        let reason = format!("{} of {} phases complete", complete, states.len());
        tx.execute(
            "UPDATE runs SET state = ?2, stop_reason = ?3, updated_at = ?4
             WHERE id = ?1 AND state NOT IN ('DONE_SUCCESS', 'DONE_NEEDS_REVIEW')",
            params![run_id, target.as_str(), reason, now()],
        )?;
        tx.commit()?;

        tracing::info!(run_id, state = %target, %reason, "run finished");
        Ok(Some(target))
    }

    pub fn add_tokens_used(&self, run_id: &str, tokens: u64) -> Result<u64> {
        let changed = self.conn.execute(
            "UPDATE runs SET tokens_used = tokens_used + ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, tokens as i64, now()],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let total: i64 = self.conn.query_row(
            "SELECT tokens_used FROM runs WHERE id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// Disable a provider for the rest of the run. Returns the full list.
    pub fn disable_provider(&mut self, run_id: &str, provider: &str) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT disabled_providers FROM runs WHERE id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        };
        let mut providers = decode_list("disabled_providers", &raw)?;
        if !providers.iter().any(|p| p == provider) {
            providers.push(provider.to_string());
            tx.execute(
                "UPDATE runs SET disabled_providers = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    run_id,
                    encode_list("disabled_providers", &providers)?,
                    now()
                ],
            )?;
        }
        tx.commit()?;
        Ok(providers)
    }

    // ── Phases ────────────────────────────────────────────────────────

    pub fn list_tiers(&self, run_id: &str) -> Result<Vec<TierRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, tier_index, name FROM tiers WHERE run_id = ?1 ORDER BY tier_index",
        )?;
        let tiers = stmt
            .query_map(params![run_id], |r| {
                Ok(TierRecord {
                    run_id: r.get(0)?,
                    tier_index: r.get(1)?,
                    name: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tiers)
    }

    pub fn list_phases(&self, run_id: &str) -> Result<Vec<PhaseRecord>> {
        let sql = format!(
            "SELECT {} FROM phases WHERE run_id = ?1 ORDER BY tier_index, phase_index",
            PHASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], phase_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PhaseRow::into_phase).collect()
    }

    pub fn get_phase(&self, run_id: &str, phase_id: &str) -> Result<PhaseRecord> {
        let sql = format!(
            "SELECT {} FROM phases WHERE run_id = ?1 AND phase_id = ?2",
            PHASE_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![run_id, phase_id], phase_row)
            .optional()?;
        match row {
            Some(row) => row.into_phase(),
            None => Err(phase_not_found(run_id, phase_id)),
        }
    }

    /// Atomically select the next runnable phase and mark it EXECUTING.
    ///
    /// A phase is runnable when it is QUEUED and no phase of an earlier tier
    /// is QUEUED, EXECUTING or FAILED.
    pub fn claim_next_phase(&mut self, run_id: &str) -> Result<Option<PhaseRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT p.phase_id FROM phases p
                 WHERE p.run_id = ?1 AND p.state = 'QUEUED'
                   AND NOT EXISTS (
                       SELECT 1 FROM phases e
                       WHERE e.run_id = p.run_id
                         AND e.tier_index < p.tier_index
                         AND e.state IN ('QUEUED', 'EXECUTING', 'FAILED')
                   )
                 ORDER BY p.tier_index, p.phase_index
                 LIMIT 1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(phase_id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE phases SET state = 'EXECUTING', updated_at = ?3
             WHERE run_id = ?1 AND phase_id = ?2 AND state = 'QUEUED'",
            params![run_id, phase_id, now()],
        )?;
        tx.commit()?;

        tracing::debug!(run_id, phase_id = %phase_id, "phase claimed");
        self.get_phase(run_id, &phase_id).map(Some)
    }

    /// EXECUTING → COMPLETE, charging the attempt's tokens to the run.
    pub fn record_success(&mut self, run_id: &str, phase_id: &str, tokens: u64) -> Result<()> {
        let ts = now();
        let tx = self.conn.transaction()?;
        expect_state(&tx, run_id, phase_id, &[PhaseState::Executing], PhaseState::Complete)?;
        tx.execute(
            "UPDATE phases SET state = 'COMPLETE', last_failure_reason = NULL, updated_at = ?3
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, ts],
        )?;
        tx.execute(
            "UPDATE runs SET tokens_used = tokens_used + ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, tokens as i64, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// EXECUTING → FAILED with `retry_attempt + 1`. Returns the new count.
    pub fn record_failure(
        &mut self,
        run_id: &str,
        phase_id: &str,
        kind: FailureKind,
        reason: &str,
    ) -> Result<u32> {
        let tx = self.conn.transaction()?;
        expect_state(&tx, run_id, phase_id, &[PhaseState::Executing], PhaseState::Failed)?;
        tx.execute(
            "UPDATE phases
             SET state = 'FAILED', retry_attempt = retry_attempt + 1,
                 last_failure_reason = ?3, updated_at = ?4
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, format!("{}: {}", kind, reason), now()],
        )?;
        let retry: u32 = tx.query_row(
            "SELECT retry_attempt FROM phases WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id],
            |r| r.get(0),
        )?;
        tx.commit()?;

        tracing::warn!(run_id, phase_id, %kind, retry_attempt = retry, "phase failed");
        Ok(retry)
    }

    /// EXECUTING → QUEUED without touching the retry counter.
    pub fn requeue_interrupted(&mut self, run_id: &str, phase_id: &str, reason: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        expect_state(&tx, run_id, phase_id, &[PhaseState::Executing], PhaseState::Queued)?;
        tx.execute(
            "UPDATE phases SET state = 'QUEUED', updated_at = ?3 WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, now()],
        )?;
        tx.commit()?;
        tracing::info!(run_id, phase_id, reason, "phase requeued");
        Ok(())
    }

    pub fn mark_blocked(&mut self, run_id: &str, phase_id: &str, reason: &str) -> Result<()> {
        self.mark_terminal(run_id, phase_id, PhaseState::Blocked, reason)
    }

    pub fn mark_needs_review(&mut self, run_id: &str, phase_id: &str, reason: &str) -> Result<()> {
        self.mark_terminal(run_id, phase_id, PhaseState::NeedsReview, reason)
    }

    fn mark_terminal(
        &mut self,
        run_id: &str,
        phase_id: &str,
        target: PhaseState,
        reason: &str,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        expect_state(
            &tx,
            run_id,
            phase_id,
            &[PhaseState::Executing, PhaseState::Failed],
            target,
        )?;
        tx.execute(
            "UPDATE phases SET state = ?3, last_failure_reason = ?4, updated_at = ?5
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, target.as_str(), reason, now()],
        )?;
        tx.commit()?;
        tracing::warn!(run_id, phase_id, state = %target, reason, "phase stopped");
        Ok(())
    }

    /// Sweep FAILED phases: requeue those with retries left, park the rest
    /// in NEEDS_REVIEW.
    pub fn auto_reset_failed(&mut self, run_id: &str, max_retry_attempts: u32) -> Result<ResetSummary> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let failed: Vec<(String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT phase_id, retry_attempt FROM phases
                 WHERE run_id = ?1 AND state = 'FAILED'
                 ORDER BY tier_index, phase_index",
            )?;
            stmt.query_map(params![run_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut summary = ResetSummary::default();
        for (phase_id, retry) in failed {
            if retry < max_retry_attempts {
                tx.execute(
                    "UPDATE phases SET state = 'QUEUED', updated_at = ?3
                     WHERE run_id = ?1 AND phase_id = ?2",
                    params![run_id, phase_id, ts],
                )?;
                summary.requeued.push(phase_id);
            } else {
                tx.execute(
                    "UPDATE phases
                     SET state = 'NEEDS_REVIEW',
                         last_failure_reason = 'retries exhausted after ' || retry_attempt
                             || ' attempts; last: ' || COALESCE(last_failure_reason, 'unknown'),
                         updated_at = ?3
                     WHERE run_id = ?1 AND phase_id = ?2",
                    params![run_id, phase_id, ts],
                )?;
                summary.needs_review.push(phase_id);
            }
        }
        tx.commit()?;

        if !summary.needs_review.is_empty() {
            tracing::warn!(run_id, phases = ?summary.needs_review, "retries exhausted");
        }
        Ok(summary)
    }

    /// Requeue phases left EXECUTING by a crashed process.
    pub fn recover_orphaned(&mut self, run_id: &str) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT phase_id FROM phases WHERE run_id = ?1 AND state = 'EXECUTING'
                 ORDER BY tier_index, phase_index",
            )?;
            stmt.query_map(params![run_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE phases SET state = 'QUEUED', updated_at = ?2
             WHERE run_id = ?1 AND state = 'EXECUTING'",
            params![run_id, now()],
        )?;
        tx.commit()?;

        if !orphaned.is_empty() {
            tracing::info!(run_id, phases = ?orphaned, "recovered orphaned phases");
        }
        Ok(orphaned)
    }

    /// Raise the stored budget. Returns the effective value, which is never
    /// lower than what was stored before.
    pub fn update_budget(&self, run_id: &str, phase_id: &str, budget: u32) -> Result<u32> {
        let changed = self.conn.execute(
            "UPDATE phases SET token_budget = MAX(COALESCE(token_budget, 0), ?3), updated_at = ?4
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, budget, now()],
        )?;
        if changed == 0 {
            return Err(phase_not_found(run_id, phase_id));
        }
        let effective: u32 = self.conn.query_row(
            "SELECT token_budget FROM phases WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id],
            |r| r.get(0),
        )?;
        Ok(effective)
    }

    /// Operator reset. Reopens a finished run so it can be resumed.
    pub fn reset_phase(&mut self, run_id: &str, phase_id: &str) -> Result<()> {
        let ts = now();
        let tx = self.conn.transaction()?;
        expect_state(
            &tx,
            run_id,
            phase_id,
            &[
                PhaseState::Queued,
                PhaseState::Complete,
                PhaseState::Failed,
                PhaseState::Blocked,
                PhaseState::NeedsReview,
            ],
            PhaseState::Queued,
        )?;
        tx.execute(
            "UPDATE phases
             SET state = 'QUEUED', retry_attempt = 0, last_failure_reason = NULL,
                 doctor_invocations = 0, doctor_guidance = NULL, updated_at = ?3
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, ts],
        )?;
        tx.execute(
            "UPDATE runs SET state = 'PAUSED', stop_reason = ?2, updated_at = ?3
             WHERE id = ?1 AND state IN ('DONE_SUCCESS', 'DONE_NEEDS_REVIEW')",
            params![run_id, format!("phase {} reset by operator", phase_id), ts],
        )?;
        tx.commit()?;
        tracing::info!(run_id, phase_id, "phase reset");
        Ok(())
    }

    /// Count one Doctor consultation. Returns `(run_total, phase_total)`.
    pub fn bump_doctor_invocations(&mut self, run_id: &str, phase_id: &str) -> Result<(u32, u32)> {
        let ts = now();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE phases SET doctor_invocations = doctor_invocations + 1, updated_at = ?3
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, ts],
        )?;
        if changed == 0 {
            return Err(phase_not_found(run_id, phase_id));
        }
        tx.execute(
            "UPDATE runs SET doctor_invocations = doctor_invocations + 1, updated_at = ?2
             WHERE id = ?1",
            params![run_id, ts],
        )?;
        let run_total: u32 = tx.query_row(
            "SELECT doctor_invocations FROM runs WHERE id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        let phase_total: u32 = tx.query_row(
            "SELECT doctor_invocations FROM phases WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok((run_total, phase_total))
    }

    pub fn set_doctor_guidance(&self, run_id: &str, phase_id: &str, guidance: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE phases SET doctor_guidance = ?3, updated_at = ?4
             WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id, guidance, now()],
        )?;
        if changed == 0 {
            return Err(phase_not_found(run_id, phase_id));
        }
        Ok(())
    }

    // ── Attempts and estimations ──────────────────────────────────────

    pub fn record_attempt(&self, attempt: &AttemptRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO attempts (run_id, phase_id, attempt, budget, predicted, actual_tokens,
                 stop_reason, escalations, patch_path, failure_kind, feedback, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                attempt.run_id,
                attempt.phase_id,
                attempt.attempt,
                attempt.budget,
                attempt.predicted,
                attempt.actual_tokens as i64,
                attempt.stop_reason,
                attempt.escalations,
                attempt.patch_path,
                attempt.failure_kind.map(|k| k.as_str()),
                attempt.feedback,
                now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_attempts(&self, run_id: &str, phase_id: &str) -> Result<Vec<AttemptRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, phase_id, attempt, budget, predicted, actual_tokens, stop_reason,
                    escalations, patch_path, failure_kind, feedback
             FROM attempts WHERE run_id = ?1 AND phase_id = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id, phase_id], |r| {
                Ok((
                    AttemptRecord {
                        run_id: r.get(0)?,
                        phase_id: r.get(1)?,
                        attempt: r.get(2)?,
                        budget: r.get(3)?,
                        predicted: r.get(4)?,
                        actual_tokens: r.get::<_, i64>(5)?.max(0) as u64,
                        stop_reason: r.get(6)?,
                        escalations: r.get(7)?,
                        patch_path: r.get(8)?,
                        failure_kind: None,
                        feedback: r.get(10)?,
                    },
                    r.get::<_, Option<String>>(9)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(mut attempt, kind)| {
                attempt.failure_kind = kind
                    .map(|k| FailureKind::from_str(&k).map_err(|_| corrupt("failure_kind", &k)))
                    .transpose()?;
                Ok(attempt)
            })
            .collect()
    }

    /// Insert once per (run, phase, outcome). Returns whether a row was written.
    pub fn record_token_estimation(&self, est: &TokenEstimation) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO token_estimations
                 (run_id, phase_id, outcome, predicted, actual, budget, category, complexity,
                  deliverable_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                est.run_id,
                est.phase_id,
                est.outcome,
                est.predicted,
                est.actual as i64,
                est.budget,
                est.category,
                est.complexity.as_str(),
                est.deliverable_count,
                now()
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn list_token_estimations(&self, run_id: &str) -> Result<Vec<TokenEstimation>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, phase_id, outcome, predicted, actual, budget, category, complexity,
                    deliverable_count
             FROM token_estimations WHERE run_id = ?1 ORDER BY created_at, phase_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, u32>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, u32>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, u32>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(run_id, phase_id, outcome, predicted, actual, budget, category, complexity, count)| {
                    Ok(TokenEstimation {
                        complexity: Complexity::from_str(&complexity)
                            .map_err(|_| corrupt("complexity", &complexity))?,
                        run_id,
                        phase_id,
                        outcome,
                        predicted,
                        actual: actual.max(0) as u64,
                        budget,
                        category,
                        deliverable_count: count,
                    })
                },
            )
            .collect()
    }

    pub fn run_summary(&self, run_id: &str) -> Result<RunSummary> {
        Ok(RunSummary {
            run: self.get_run(run_id)?,
            tiers: self.list_tiers(run_id)?,
            phases: self.list_phases(run_id)?,
        })
    }
}

fn phase_not_found(run_id: &str, phase_id: &str) -> StoreError {
    StoreError::PhaseNotFound {
        run_id: run_id.to_string(),
        phase_id: phase_id.to_string(),
    }
}

/// Fail with `InvalidTransition` unless the phase is in one of `allowed`.
fn expect_state(
    conn: &Connection,
    run_id: &str,
    phase_id: &str,
    allowed: &[PhaseState],
    to: PhaseState,
) -> Result<PhaseState> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM phases WHERE run_id = ?1 AND phase_id = ?2",
            params![run_id, phase_id],
            |r| r.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| phase_not_found(run_id, phase_id))?;
    let current = PhaseState::from_str(&raw).map_err(|_| corrupt("phases.state", &raw))?;
    if !allowed.contains(&current) {
        return Err(StoreError::InvalidTransition {
            phase_id: phase_id.to_string(),
            from: current.to_string(),
            to: to.to_string(),
        });
    }
    Ok(current)
}

struct RunRow {
    id: String,
    state: String,
    plan_hash: String,
    plan_name: Option<String>,
    token_cap: Option<i64>,
    max_phases: u32,
    tokens_used: i64,
    doctor_invocations: u32,
    disabled_providers: String,
    stop_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        state: row.get(1)?,
        plan_hash: row.get(2)?,
        plan_name: row.get(3)?,
        token_cap: row.get(4)?,
        max_phases: row.get(5)?,
        tokens_used: row.get(6)?,
        doctor_invocations: row.get(7)?,
        disabled_providers: row.get(8)?,
        stop_reason: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<RunRecord> {
        Ok(RunRecord {
            state: RunState::from_str(&self.state).map_err(|_| corrupt("runs.state", &self.state))?,
            disabled_providers: decode_list("disabled_providers", &self.disabled_providers)?,
            id: self.id,
            plan_hash: self.plan_hash,
            plan_name: self.plan_name,
            token_cap: self.token_cap.map(|c| c.max(0) as u64),
            max_phases: self.max_phases,
            tokens_used: self.tokens_used.max(0) as u64,
            doctor_invocations: self.doctor_invocations,
            stop_reason: self.stop_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct PhaseRow {
    run_id: String,
    phase_id: String,
    tier_index: u32,
    phase_index: u32,
    name: String,
    description: String,
    deliverables: String,
    scope: String,
    category: String,
    complexity: String,
    state: String,
    retry_attempt: u32,
    last_failure_reason: Option<String>,
    token_budget: Option<u32>,
    doctor_invocations: u32,
    doctor_guidance: Option<String>,
    updated_at: String,
}

fn phase_row(row: &Row<'_>) -> rusqlite::Result<PhaseRow> {
    Ok(PhaseRow {
        run_id: row.get(0)?,
        phase_id: row.get(1)?,
        tier_index: row.get(2)?,
        phase_index: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        deliverables: row.get(6)?,
        scope: row.get(7)?,
        category: row.get(8)?,
        complexity: row.get(9)?,
        state: row.get(10)?,
        retry_attempt: row.get(11)?,
        last_failure_reason: row.get(12)?,
        token_budget: row.get(13)?,
        doctor_invocations: row.get(14)?,
        doctor_guidance: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

impl PhaseRow {
    fn into_phase(self) -> Result<PhaseRecord> {
        Ok(PhaseRecord {
            deliverables: decode_list("deliverables", &self.deliverables)?,
            scope: decode_list("scope", &self.scope)?,
            complexity: Complexity::from_str(&self.complexity)
                .map_err(|_| corrupt("complexity", &self.complexity))?,
            state: PhaseState::from_str(&self.state)
                .map_err(|_| corrupt("phases.state", &self.state))?,
            run_id: self.run_id,
            phase_id: self.phase_id,
            tier_index: self.tier_index,
            phase_index: self.phase_index,
            name: self.name,
            description: self.description,
            category: self.category,
            retry_attempt: self.retry_attempt,
            last_failure_reason: self.last_failure_reason,
            token_budget: self.token_budget,
            doctor_invocations: self.doctor_invocations,
            doctor_guidance: self.doctor_guidance,
            updated_at: self.updated_at,
        })
    }
}
