//! Collaborators the engine calls out to: clock, group directory, mailer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use pipewright_sla::SlaService;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Resolves executor groups to member logins.
pub trait GroupDirectory: Send + Sync {
    fn members(&self, group_id: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticGroupDirectory {
    groups: HashMap<String, Vec<String>>,
}

impl StaticGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, id: &str, members: &[&str]) -> Self {
        self.groups
            .insert(id.to_string(), members.iter().map(|m| m.to_string()).collect());
        self
    }
}

impl GroupDirectory for StaticGroupDirectory {
    fn members(&self, group_id: &str) -> Vec<String> {
        self.groups.get(group_id).cloned().unwrap_or_default()
    }
}

/// An outgoing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Delivers mail. Called only after the advancing transaction committed.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<()>;
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<()> {
        tracing::info!(to = ?mail.to, subject = %mail.subject, "mail");
        Ok(())
    }
}

/// Keeps every mail in memory.
#[derive(Debug, Default)]
pub struct RecordingMailer(Mutex<Vec<Mail>>);

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Mail> {
        self.0.lock().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &Mail) -> Result<()> {
        self.0.lock().push(mail.clone());
        Ok(())
    }
}

/// Service handles shared by every advancement.
#[derive(Clone)]
pub struct Services {
    pub sla: Arc<SlaService>,
    pub groups: Arc<dyn GroupDirectory>,
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<dyn Mailer>,
}

impl Services {
    /// Plain calendar, no groups, system clock, log-only mail.
    pub fn basic() -> Self {
        Self {
            sla: Arc::new(SlaService::new(None)),
            groups: Arc::new(StaticGroupDirectory::new()),
            clock: Arc::new(SystemClock),
            mailer: Arc::new(LogMailer),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_sla(mut self, sla: Arc<SlaService>) -> Self {
        self.sla = sla;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
