//! Ledger store
//!
//! Holds the four logical tables (accounts, tasks, transactions, settings)
//! and provides the atomic-update discipline every financial operation
//! relies on.
//!
//! # Discipline
//!
//! - Committed rows live in `DashMap`s and are read by cloning, so readers
//!   never wait on writers.
//! - A writer takes the per-key row lock (bounded wait, `Conflict` on timeout)
//!   for every row it will change, computes the new rows on copies, and
//!   publishes them with a single synchronous [`LedgerStore::commit`].
//! - Lock order is account, then task, then transaction. A unit that cannot
//!   get a lock in time drops everything and retries through
//!   [`LedgerStore::retrying`], which surfaces `RetryExhausted` at the bound.
//! - `commit` holds the commit gate for reading; snapshots hold it for
//!   writing, so a snapshot never observes half of a commit.
//!
//! # Durability
//!
//! With a snapshot path configured, every commit is appended to a JSON-lines
//! journal next to the snapshot (`<name>.journal`) and synced before it is
//! published. `open` loads the snapshot and replays the journal on top;
//! `save` writes a fresh snapshot and drops the journal it covers.

use backoff::{future::retry, ExponentialBackoff};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::hash::Hash;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

use super::types::{Account, Settings, Task, TaskId, Transaction, TransactionId, UserId};

/// Held row lock; the row may be changed by `commit` while this is alive
pub type RowLock = OwnedMutexGuard<()>;

/// Per-key async mutexes
struct KeyLocks<K: Eq + Hash> {
    table: &'static str,
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Display> KeyLocks<K> {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            locks: DashMap::new(),
        }
    }

    async fn acquire(&self, key: &K, timeout: Duration) -> Result<RowLock> {
        // Clone the Arc out so no shard guard is held across the await
        let cell = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(timeout, cell.lock_owned())
            .await
            .map_err(|_| Error::Conflict(format!("{}:{}", self.table, key)))
    }
}

/// Set of row changes published together; also the journal line format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    accounts: Vec<Account>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    transactions: Vec<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settings: Option<Settings>,
}

impl Commit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(mut self, account: Account) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append a new transaction, or replace an existing one's status row
    pub fn transaction(mut self, transaction: Transaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.tasks.is_empty()
            && self.transactions.is_empty()
            && self.settings.is_none()
    }
}

/// Append-only commit log beside the snapshot
struct Journal {
    path: PathBuf,
    /// Journal already covered by a snapshot being written
    rotated_path: PathBuf,
    file: StdMutex<Option<File>>,
}

impl Journal {
    fn for_snapshot(snapshot_path: &str) -> Self {
        let snapshot = Path::new(snapshot_path);
        Self {
            path: snapshot.with_extension("journal"),
            rotated_path: snapshot.with_extension("journal.old"),
            file: StdMutex::new(None),
        }
    }

    /// Append one commit and sync it to disk
    fn append(&self, batch: &Commit) -> Result<()> {
        let mut line = serde_json::to_string(batch)
            .map_err(|e| Error::Persistence(format!("Failed to encode commit: {}", e)))?;
        line.push('\n');

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    Error::Persistence(format!("Failed to open {}: {}", self.path.display(), e))
                })?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes())
                .and_then(|_| file.sync_data())
                .map_err(|e| {
                    Error::Persistence(format!("Failed to append to {}: {}", self.path.display(), e))
                })?;
        }
        Ok(())
    }

    /// Move the live journal aside so later commits start a new one
    ///
    /// Returns whether a rotated journal now exists. Callers hold the commit
    /// gate, so whatever it holds is covered by a snapshot taken alongside.
    /// An older rotated journal left by a failed save is kept as is and the
    /// live one stays in place.
    fn rotate(&self) -> Result<bool> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if self.rotated_path.exists() {
            return Ok(true);
        }
        if !self.path.exists() {
            return Ok(false);
        }
        *guard = None;
        std::fs::rename(&self.path, &self.rotated_path).map_err(|e| {
            Error::Persistence(format!("Failed to rotate {}: {}", self.path.display(), e))
        })?;
        Ok(true)
    }

    fn exists(&self) -> bool {
        self.path.exists() || self.rotated_path.exists()
    }

    fn drop_rotated(&self) -> Result<()> {
        std::fs::remove_file(&self.rotated_path).map_err(|e| {
            Error::Persistence(format!(
                "Failed to remove {}: {}",
                self.rotated_path.display(),
                e
            ))
        })
    }

    /// Commits recorded since the last save, oldest first
    fn read_all(&self) -> Result<Vec<Commit>> {
        let mut commits = Vec::new();
        for path in [&self.rotated_path, &self.path] {
            if !path.exists() {
                continue;
            }
            let file = File::open(path)
                .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", path.display(), e)))?;
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| {
                    Error::Persistence(format!("Failed to read {}: {}", path.display(), e))
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Commit>(&line) {
                    Ok(batch) => commits.push(batch),
                    Err(e) => {
                        // A torn final line is a commit that never returned
                        warn!(
                            journal = %path.display(),
                            line = n + 1,
                            error = %e,
                            "Stopping journal replay at unreadable line"
                        );
                        break;
                    }
                }
            }
        }
        Ok(commits)
    }
}

/// On-disk snapshot layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: String,
    pub settings: Settings,
    pub accounts: Vec<Account>,
    /// Creation order
    pub tasks: Vec<Task>,
    /// Append order
    pub transactions: Vec<Transaction>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Durable keyed storage for the ledger
pub struct LedgerStore {
    config: StoreConfig,

    accounts: DashMap<UserId, Account>,
    tasks: DashMap<TaskId, Task>,
    transactions: DashMap<TransactionId, Transaction>,
    settings: RwLock<Settings>,
    /// Serializes settings read-modify-write
    settings_writer: StdMutex<()>,

    /// referral code -> owner
    referral_codes: DashMap<String, UserId>,
    task_order: RwLock<Vec<TaskId>>,
    transaction_log: RwLock<Vec<TransactionId>>,

    account_locks: KeyLocks<UserId>,
    task_locks: KeyLocks<TaskId>,
    transaction_locks: KeyLocks<TransactionId>,

    commit_gate: RwLock<()>,
    journal: Option<Journal>,
    save_lock: Mutex<()>,
}

impl LedgerStore {
    /// Create an empty store seeded with `settings`
    pub fn new(config: StoreConfig, settings: Settings) -> Self {
        let journal = config.snapshot_path.as_deref().map(Journal::for_snapshot);
        Self {
            config,
            accounts: DashMap::new(),
            tasks: DashMap::new(),
            transactions: DashMap::new(),
            settings: RwLock::new(settings),
            settings_writer: StdMutex::new(()),
            referral_codes: DashMap::new(),
            task_order: RwLock::new(Vec::new()),
            transaction_log: RwLock::new(Vec::new()),
            account_locks: KeyLocks::new("account"),
            task_locks: KeyLocks::new("task"),
            transaction_locks: KeyLocks::new("transaction"),
            commit_gate: RwLock::new(()),
            journal,
            save_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }

    // === Reads ===

    pub fn read_account(&self, user_id: UserId) -> Option<Account> {
        self.accounts.get(&user_id).map(|a| a.value().clone())
    }

    pub fn read_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    pub fn read_transaction(&self, transaction_id: &str) -> Option<Transaction> {
        self.transactions.get(transaction_id).map(|t| t.value().clone())
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve a referral code to its owner
    pub fn resolve_referral_code(&self, code: &str) -> Option<UserId> {
        self.referral_codes.get(code.trim()).map(|id| *id)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// All accounts (unordered)
    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|a| a.value().clone()).collect()
    }

    /// Tasks in creation order matching `filter`
    pub fn tasks_where(&self, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let order = self.task_order.read().unwrap_or_else(|e| e.into_inner());
        order
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.value().clone()))
            .filter(|t| filter(t))
            .collect()
    }

    /// Transactions newest first matching `filter`, at most `limit`
    pub fn transactions_where(
        &self,
        limit: usize,
        filter: impl Fn(&Transaction) -> bool,
    ) -> Vec<Transaction> {
        let log = self
            .transaction_log
            .read()
            .unwrap_or_else(|e| e.into_inner());
        log.iter()
            .rev()
            .filter_map(|id| self.transactions.get(id).map(|t| t.value().clone()))
            .filter(|t| filter(t))
            .take(limit)
            .collect()
    }

    // === Row locks ===

    pub async fn lock_account(&self, user_id: UserId) -> Result<RowLock> {
        self.account_locks.acquire(&user_id, self.lock_timeout()).await
    }

    pub async fn lock_task(&self, task_id: &str) -> Result<RowLock> {
        self.task_locks
            .acquire(&task_id.to_string(), self.lock_timeout())
            .await
    }

    pub async fn lock_transaction(&self, transaction_id: &str) -> Result<RowLock> {
        self.transaction_locks
            .acquire(&transaction_id.to_string(), self.lock_timeout())
            .await
    }

    // === Writes ===

    /// Record and publish a set of row changes as one unit
    ///
    /// Callers must hold the row lock of every existing account, task and
    /// transaction in `batch`. Brand-new rows with fresh ids need no lock.
    /// Nothing is published if the journal write fails.
    pub fn commit(&self, batch: Commit) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _gate = self.commit_gate.read().unwrap_or_else(|e| e.into_inner());
        if let Some(journal) = &self.journal {
            journal.append(&batch)?;
        }
        self.publish(batch);
        Ok(())
    }

    /// Apply rows to the in-memory tables
    fn publish(&self, batch: Commit) {
        if let Some(settings) = batch.settings {
            *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        }

        for account in batch.accounts {
            self.referral_codes
                .entry(account.referral_code.clone())
                .or_insert(account.user_id);
            self.accounts.insert(account.user_id, account);
        }

        for task in batch.tasks {
            if self.tasks.insert(task.id.clone(), task.clone()).is_none() {
                self.task_order
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(task.id);
            }
        }

        for transaction in batch.transactions {
            let id = transaction.id.clone();
            if self.transactions.insert(id.clone(), transaction).is_none() {
                self.transaction_log
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(id);
            }
        }
    }

    /// Serializable read-modify-write of one account
    ///
    /// `transform` runs on a copy under the account lock and may stage extra
    /// rows (typically the audit transaction) into the commit. Returns the
    /// committed account. Fails with `AccountNotFound` for unknown users.
    pub async fn atomic_update<T, F>(&self, user_id: UserId, transform: F) -> Result<(Account, T)>
    where
        F: Fn(&mut Account, Commit) -> Result<(Commit, T)>,
    {
        self.retrying(&format!("account:{}", user_id), || {
            let transform = &transform;
            async move {
                let _lock = self.lock_account(user_id).await?;
                let mut account = self
                    .read_account(user_id)
                    .ok_or(Error::AccountNotFound(user_id))?;

                let (batch, value) = transform(&mut account, Commit::new())?;
                self.commit(batch.account(account.clone()))?;
                Ok((account, value))
            }
        })
        .await
    }

    /// Insert an account unless one already exists; returns the stored row
    pub async fn insert_account_if_absent(&self, account: Account) -> Result<(Account, bool)> {
        let user_id = account.user_id;
        self.retrying(&format!("account:{}", user_id), || {
            let account = account.clone();
            async move {
                let _lock = self.lock_account(user_id).await?;
                if let Some(existing) = self.read_account(user_id) {
                    return Ok((existing, false));
                }
                self.commit(Commit::new().account(account.clone()))?;
                Ok((account, true))
            }
        })
        .await
    }

    /// Replace settings through `transform`
    pub fn update_settings<F>(&self, transform: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) -> Result<()>,
    {
        let _writer = self.settings_writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = self.settings();
        transform(&mut next)?;
        self.commit(Commit {
            settings: Some(next.clone()),
            ..Commit::default()
        })?;
        Ok(next)
    }

    /// Run `op` retrying on `Conflict` with exponential backoff
    ///
    /// Other errors are returned immediately. After `max_retries` conflicting
    /// attempts the result is `RetryExhausted`.
    pub async fn retrying<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.config.max_retries;
        let attempts = AtomicU32::new(0);

        let backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            initial_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_base_delay_ms * 8),
            max_elapsed_time: None,
            ..Default::default()
        };

        retry(backoff, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        debug!(key, attempt, "Retrying after storage conflict");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(key, attempts = attempt, "Storage retries exhausted");
                        Err(backoff::Error::permanent(Error::RetryExhausted {
                            key: key.to_string(),
                            attempts: attempt,
                        }))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }

    // === Persistence ===

    /// Consistent copy of every table
    pub fn snapshot(&self) -> Snapshot {
        let _gate = self.commit_gate.write().unwrap_or_else(|e| e.into_inner());
        self.copy_tables()
    }

    /// Callers hold the commit gate for writing
    fn copy_tables(&self) -> Snapshot {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by_key(|a| a.user_id);

        let tasks = {
            let order = self.task_order.read().unwrap_or_else(|e| e.into_inner());
            order
                .iter()
                .filter_map(|id| self.tasks.get(id).map(|t| t.value().clone()))
                .collect()
        };

        let transactions = {
            let log = self
                .transaction_log
                .read()
                .unwrap_or_else(|e| e.into_inner());
            log.iter()
                .filter_map(|id| self.transactions.get(id).map(|t| t.value().clone()))
                .collect()
        };

        Snapshot {
            version: default_version(),
            settings: self.settings(),
            accounts,
            tasks,
            transactions,
        }
    }

    /// Rebuild a store from a snapshot
    pub fn from_snapshot(config: StoreConfig, snapshot: Snapshot) -> Self {
        let store = Self::new(config, snapshot.settings);
        let mut batch = Commit::new();
        for account in snapshot.accounts {
            batch = batch.account(account);
        }
        for task in snapshot.tasks {
            batch = batch.task(task);
        }
        for transaction in snapshot.transactions {
            batch = batch.transaction(transaction);
        }
        store.publish(batch);
        store
    }

    /// Write a snapshot to `path` (temp file + rename)
    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.snapshot();
        write_snapshot(path.as_ref(), &snapshot).await
    }

    /// Save to the configured snapshot path, if any, and drop the journal
    /// the new snapshot covers
    pub async fn save(&self) -> Result<()> {
        let (path, journal) = match (&self.config.snapshot_path, &self.journal) {
            (Some(path), Some(journal)) => (path, journal),
            _ => return Ok(()),
        };
        let _saving = self.save_lock.lock().await;

        let (snapshot, covers_rotated) = {
            let _gate = self.commit_gate.write().unwrap_or_else(|e| e.into_inner());
            (self.copy_tables(), journal.rotate()?)
        };
        write_snapshot(Path::new(path), &snapshot).await?;
        if covers_rotated {
            journal.drop_rotated()?;
        }
        Ok(())
    }

    /// Load the configured snapshot and replay the journal, or start fresh
    /// with `settings`
    pub async fn open(config: StoreConfig, settings: Settings) -> Result<Self> {
        let path = match &config.snapshot_path {
            Some(path) => path.clone(),
            None => return Ok(Self::new(config, settings)),
        };

        let store = if Path::new(&path).exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", path, e)))?;
            let snapshot: Snapshot = serde_json::from_str(&data)
                .map_err(|e| Error::Persistence(format!("Failed to parse {}: {}", path, e)))?;

            info!(
                accounts = snapshot.accounts.len(),
                tasks = snapshot.tasks.len(),
                transactions = snapshot.transactions.len(),
                "Loaded ledger snapshot from {}",
                path
            );
            Self::from_snapshot(config, snapshot)
        } else {
            Self::new(config, settings)
        };

        let replay = match &store.journal {
            Some(journal) if journal.exists() => journal.read_all()?,
            _ => return Ok(store),
        };
        info!(commits = replay.len(), "Replaying ledger journal");
        for batch in replay {
            store.publish(batch);
        }
        // Fold the journal into a fresh snapshot so a torn tail is never appended to
        store.save().await?;
        Ok(store)
    }
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let data = serde_json::to_string_pretty(snapshot)
        .map_err(|e| Error::Persistence(format!("Failed to serialize snapshot: {}", e)))?;

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to create {}: {}", tmp.display(), e)))?;
    file.write_all(data.as_bytes())
        .await
        .map_err(|e| Error::Persistence(format!("Failed to write {}: {}", tmp.display(), e)))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Persistence(format!("Failed to sync {}: {}", tmp.display(), e)))?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to replace {}: {}", path.display(), e)))?;

    debug!(
        accounts = snapshot.accounts.len(),
        transactions = snapshot.transactions.len(),
        "Saved ledger snapshot to {}",
        path.display()
    );
    Ok(())
}
