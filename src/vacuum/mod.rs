//! Background vacuum
//!
//! Reclaims what finished transactions leave behind: versions expired by a
//! transaction that is no longer active, and transient tables whose owner
//! is gone. Writes and transaction ends only set a flag; the periodic task
//! sweeps when the flag is up.
//!
//! Every removal happens in its own atomic section after re-reading the
//! record, so the sweep can interleave freely with statements.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::table::{transient_owner, DEFAULT_BATCH_SIZE};
use crate::storage::{Storage, Store, Table, TABLE_PREFIX};
use crate::transaction::TransactionManager;

/// Keys examined per store scan call
const SCAN_COUNT: usize = 64;

/// Totals reclaimed since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub rows_reclaimed: u64,
    pub tables_reclaimed: u64,
}

#[derive(Debug)]
pub struct Vacuum {
    store: Store,
    transactions: Arc<TransactionManager>,
    needs_running: AtomicBool,
    stay_alive: AtomicBool,
    shutdown: Notify,
    rows_reclaimed: AtomicU64,
    tables_reclaimed: AtomicU64,
    batch_size: usize,
}

impl Vacuum {
    pub fn new(store: Store, transactions: Arc<TransactionManager>) -> Self {
        Self {
            store,
            transactions,
            needs_running: AtomicBool::new(false),
            stay_alive: AtomicBool::new(true),
            shutdown: Notify::new(),
            rows_reclaimed: AtomicU64::new(0),
            tables_reclaimed: AtomicU64::new(0),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Ask for a sweep on the next tick
    pub fn request(&self) {
        self.needs_running.store(true, Ordering::Release);
    }

    pub fn needs_running(&self) -> bool {
        self.needs_running.load(Ordering::Acquire)
    }

    /// Make the background task exit
    pub fn stop(&self) {
        self.stay_alive.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }

    pub fn stats(&self) -> VacuumStats {
        VacuumStats {
            rows_reclaimed: self.rows_reclaimed.load(Ordering::Relaxed),
            tables_reclaimed: self.tables_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Run one full sweep now. Returns what this sweep reclaimed.
    pub fn sweep(&self) -> Result<VacuumStats> {
        let tables = self.sweep_transient_tables()?;
        let rows = self.sweep_expired_records()?;
        self.tables_reclaimed.fetch_add(tables, Ordering::Relaxed);
        self.rows_reclaimed.fetch_add(rows, Ordering::Relaxed);
        if tables > 0 || rows > 0 {
            info!(rows, tables, "vacuum reclaimed storage");
        }
        Ok(VacuumStats {
            rows_reclaimed: rows,
            tables_reclaimed: tables,
        })
    }

    /// Start the periodic task on the current tokio runtime. Sweeps run on
    /// the blocking pool since they wait on the store lock.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let vacuum = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "vacuum task started");

            loop {
                tokio::select! {
                    _ = vacuum.shutdown.notified() => {}
                    _ = ticker.tick() => {}
                }
                if !vacuum.stay_alive.load(Ordering::Acquire) {
                    break;
                }
                if vacuum.needs_running.swap(false, Ordering::AcqRel) {
                    let sweeper = Arc::clone(&vacuum);
                    match task::spawn_blocking(move || sweeper.sweep()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!(error = %e, "vacuum sweep failed");
                            vacuum.request();
                        }
                        Err(e) => {
                            warn!(error = %e, "vacuum sweep panicked");
                            vacuum.request();
                        }
                    }
                }
            }
            info!("vacuum task stopped");
        })
    }

    fn sweep_transient_tables(&self) -> Result<u64> {
        let pattern = format!("{}~*", TABLE_PREFIX);
        let mut reclaimed = 0;
        for key in self.scan_keys(&pattern)? {
            let Some(name) = key.strip_prefix(TABLE_PREFIX) else {
                continue;
            };
            let Some(owner) = transient_owner(name) else {
                continue;
            };
            if self.transactions.is_active(owner) {
                continue;
            }
            let table = Table::new(name);
            if self.store.atomic(|s| table.drop_storage(s))? {
                debug!(table = name, owner, "reclaimed transient table");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn sweep_expired_records(&self) -> Result<u64> {
        let pattern = format!("{}*", TABLE_PREFIX);
        let mut reclaimed = 0;
        for key in self.scan_keys(&pattern)? {
            let Some(name) = key.strip_prefix(TABLE_PREFIX) else {
                continue;
            };
            if name.starts_with('~') {
                continue;
            }
            reclaimed += self.sweep_table(&Table::new(name))?;
        }
        Ok(reclaimed)
    }

    fn sweep_table(&self, table: &Table) -> Result<u64> {
        let mut reclaimed = 0;
        let mut after = 0;
        loop {
            let batch = self
                .store
                .atomic(|s| table.read_batch(s, after, self.batch_size))?;
            let Some(last) = batch.last() else {
                break;
            };
            after = last.id;

            for record in batch {
                if !record.is_expired() || self.transactions.is_active(record.xex) {
                    continue;
                }
                if self.store.atomic(|s| self.purge_if_dead(s, table, record.id, record.xex))? {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            debug!(table = %table.name(), reclaimed, "purged expired versions");
        }
        Ok(reclaimed)
    }

    /// Purge a version only if it is still expired by the same, finished
    /// transaction
    fn purge_if_dead(&self, s: &mut dyn Storage, table: &Table, id: i64, xex: i64) -> Result<bool> {
        match table.get_record(s, id)? {
            Some(current) if current.xex == xex && !self.transactions.is_active(xex) => {
                table.purge(s, id)
            }
            _ => Ok(false),
        }
    }

    /// Every key matching `pattern`, read through the store's cursor scan
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (next, found) = self
                .store
                .atomic(|s| s.scan(pattern, cursor.as_deref(), SCAN_COUNT))?;
            keys.extend(found);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}
