//! Flat-file persistence: the account file and the append-only message log.
//!
//! Account file: one `username password` pair per line.
//! Message log: one `timestamp|sender|recipient|type|content|delivered|pinned`
//! record per line. In-place updates rewrite the whole log into a scratch file
//! and rename it over the live one; the rename is the only commit point.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chatd::constants::RecordKind;

/// Timestamp format used in the message log and in rendered history.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const RECORD_FIELDS: usize = 7;

/// One line of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub timestamp: String,
    pub sender: String,
    /// Username for direct messages; the receiving member for group copies.
    pub recipient: String,
    pub kind: RecordKind,
    pub content: String,
    pub delivered: bool,
    pub pinned: bool,
}

impl MessageRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.timestamp,
            self.sender,
            self.recipient,
            u32::from(self.kind),
            self.content,
            u8::from(self.delivered),
            u8::from(self.pinned)
        )
    }

    /// Parse a log line. Lines without exactly seven fields are not records.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != RECORD_FIELDS {
            return None;
        }

        let kind = fields[3].trim().parse::<u32>().ok()?;
        Some(Self {
            timestamp: fields[0].to_string(),
            sender: fields[1].to_string(),
            recipient: fields[2].to_string(),
            kind: RecordKind::try_from(kind).ok()?,
            content: fields[4].to_string(),
            delivered: fields[5].trim() == "1",
            pinned: fields[6].trim() == "1",
        })
    }

    /// True for a direct message exchanged between `a` and `b`, either way.
    pub fn is_direct_between(&self, a: &str, b: &str) -> bool {
        self.kind == RecordKind::Direct
            && ((self.sender == a && self.recipient == b)
                || (self.sender == b && self.recipient == a))
    }

    pub fn pin_key(&self) -> PinKey {
        PinKey {
            timestamp: self.timestamp.clone(),
            sender: self.sender.clone(),
            content: self.content.clone(),
        }
    }
}

/// Match key for pin updates. Records sharing all three fields are
/// indistinguishable; the first one in file order wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinKey {
    pub timestamp: String,
    pub sender: String,
    pub content: String,
}

impl PinKey {
    fn matches(&self, record: &MessageRecord) -> bool {
        record.timestamp == self.timestamp
            && record.sender == self.sender
            && record.content == self.content
    }
}

/// Durable storage used by the command handlers.
pub trait Store: Send + Sync {
    /// Every stored `(username, password)` pair, in file order.
    fn load_accounts(&self) -> Result<Vec<(String, String)>>;

    fn append_account(&self, username: &str, password: &str) -> Result<()>;

    fn append_message(&self, record: &MessageRecord) -> Result<()>;

    /// Visit records in file order until `visit` returns false.
    fn scan_messages(&self, visit: &mut dyn FnMut(&MessageRecord) -> bool) -> Result<()>;

    /// Set the pinned flag of the first record matching `key`.
    /// Returns false when nothing matched; the log is then left untouched.
    fn update_pin(&self, key: &PinKey, pinned: bool) -> Result<bool>;

    /// Offer every undelivered record addressed to `username` to `deliver`,
    /// in file order, and mark the accepted ones delivered. Returns the number
    /// of records marked.
    fn sweep_undelivered(
        &self,
        username: &str,
        deliver: &mut dyn FnMut(&MessageRecord) -> bool,
    ) -> Result<usize>;

    /// Collect the records accepted by `filter`.
    fn find_messages(&self, filter: &mut dyn FnMut(&MessageRecord) -> bool) -> Result<Vec<MessageRecord>> {
        let mut found = Vec::new();
        self.scan_messages(&mut |record| {
            if filter(record) {
                found.push(record.clone());
            }
            true
        })?;
        Ok(found)
    }
}

/// [`Store`] backed by two text files.
#[derive(Debug)]
pub struct FileStore {
    account_path: PathBuf,
    message_path: PathBuf,
    scratch_path: PathBuf,
    account_lock: Mutex<()>,
    message_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, creating the data directories and an empty account
    /// file on first run.
    pub fn open(account_path: impl Into<PathBuf>, message_path: impl Into<PathBuf>) -> Result<Self> {
        let account_path = account_path.into();
        let message_path = message_path.into();

        for path in [&account_path, &message_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating data directory {}", parent.display()))?;
            }
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&account_path)
            .with_context(|| format!("creating account file {}", account_path.display()))?;

        let scratch_path = message_path.with_extension("tmp");
        Ok(Self {
            account_path,
            message_path,
            scratch_path,
            account_lock: Mutex::new(()),
            message_lock: Mutex::new(()),
        })
    }

    pub fn message_path(&self) -> &Path {
        &self.message_path
    }

    fn lock_messages(&self) -> MutexGuard<'_, ()> {
        self.message_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_accounts(&self) -> MutexGuard<'_, ()> {
        self.account_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whole log as lines; a missing log reads as empty.
    fn read_log(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.message_path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e)
                .with_context(|| format!("reading message log {}", self.message_path.display())),
        }
    }

    /// Write `lines` to the scratch file, then rename it over the log.
    fn rewrite_log(&self, lines: &[String]) -> Result<()> {
        let written = (|| -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(&self.scratch_path)?);
            for line in lines {
                writeln!(out, "{line}")?;
            }
            out.into_inner().map_err(|e| e.into_error())?.sync_all()
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&self.scratch_path);
            return Err(e).with_context(|| {
                format!("writing scratch log {}", self.scratch_path.display())
            });
        }

        fs::rename(&self.scratch_path, &self.message_path)
            .with_context(|| format!("replacing message log {}", self.message_path.display()))
    }
}

impl Store for FileStore {
    fn load_accounts(&self) -> Result<Vec<(String, String)>> {
        let _guard = self.lock_accounts();
        let content = match fs::read_to_string(&self.account_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                File::create(&self.account_path)?;
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading account file {}", self.account_path.display())
                });
            }
        };

        let mut accounts = Vec::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(username), Some(password)) = (parts.next(), parts.next()) {
                accounts.push((username.to_string(), password.to_string()));
            }
        }
        Ok(accounts)
    }

    fn append_account(&self, username: &str, password: &str) -> Result<()> {
        let _guard = self.lock_accounts();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.account_path)
            .with_context(|| format!("opening account file {}", self.account_path.display()))?;
        writeln!(file, "{username} {password}")?;
        file.flush()?;
        Ok(())
    }

    fn append_message(&self, record: &MessageRecord) -> Result<()> {
        let _guard = self.lock_messages();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.message_path)
            .with_context(|| format!("opening message log {}", self.message_path.display()))?;
        writeln!(file, "{}", record.to_line())?;
        Ok(())
    }

    fn scan_messages(&self, visit: &mut dyn FnMut(&MessageRecord) -> bool) -> Result<()> {
        let lines = {
            let _guard = self.lock_messages();
            self.read_log()?
        };

        for record in lines.iter().filter_map(|line| MessageRecord::parse(line)) {
            if !visit(&record) {
                break;
            }
        }
        Ok(())
    }

    fn update_pin(&self, key: &PinKey, pinned: bool) -> Result<bool> {
        let _guard = self.lock_messages();
        let mut lines = self.read_log()?;

        let position = lines.iter().position(|line| {
            MessageRecord::parse(line).is_some_and(|record| key.matches(&record))
        });
        let Some(index) = position else {
            return Ok(false);
        };

        if let Some(mut record) = MessageRecord::parse(&lines[index]) {
            record.pinned = pinned;
            lines[index] = record.to_line();
        }
        self.rewrite_log(&lines)?;
        Ok(true)
    }

    fn sweep_undelivered(
        &self,
        username: &str,
        deliver: &mut dyn FnMut(&MessageRecord) -> bool,
    ) -> Result<usize> {
        let _guard = self.lock_messages();
        let mut lines = self.read_log()?;
        let mut marked = 0;

        for line in lines.iter_mut() {
            let Some(mut record) = MessageRecord::parse(line) else {
                continue;
            };
            if record.recipient != username || record.delivered {
                continue;
            }
            if deliver(&record) {
                record.delivered = true;
                *line = record.to_line();
                marked += 1;
            }
        }

        if marked > 0 {
            self.rewrite_log(&lines)?;
        }
        Ok(marked)
    }
}
