// 📬 Notification Dispatcher - one message per owner per run
//
// Records are grouped by owner; the "needs notification" flag is cleared only
// after the owner's message was confirmed sent. A failed send leaves the flag
// set so a later sweep retries. Failures here never fail an import.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn, Span};

use crate::db::{self, Database};
use crate::error::{RepositoryError, SendError};
use crate::record::EmployeeRecord;
use crate::repository::EmployeeRepository;

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Outbound message transport
pub trait MessageSender: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &serde_json::Value) -> Result<(), SendError>;
}

/// Resolves an owner id to a contact address
pub trait OwnerDirectory: Send + Sync {
    fn contact(&self, owner_id: i64) -> Result<Option<String>, RepositoryError>;
}

/// Owner contacts read from the `owners` table
pub struct SqliteOwnerDirectory {
    db: Database,
}

impl SqliteOwnerDirectory {
    pub fn new(db: Database) -> Self {
        SqliteOwnerDirectory { db }
    }
}

impl OwnerDirectory for SqliteOwnerDirectory {
    fn contact(&self, owner_id: i64) -> Result<Option<String>, RepositoryError> {
        let conn = db::lock(&self.db)?;
        Ok(db::get_owner(&conn, owner_id)?.map(|owner| owner.email))
    }
}

// ============================================================================
// TRANSPORTS
// ============================================================================

/// Writes each message as a structured log event
pub struct LogSender {
    span: Span,
}

impl LogSender {
    pub fn new() -> Self {
        LogSender {
            span: tracing::info_span!("log_sender"),
        }
    }
}

impl Default for LogSender {
    fn default() -> Self {
        LogSender::new()
    }
}

impl MessageSender for LogSender {
    fn send(&self, to: &str, subject: &str, body: &serde_json::Value) -> Result<(), SendError> {
        info!(parent: &self.span, to, subject, body = %body, "notification delivered to log");
        Ok(())
    }
}

/// Appends one JSON line per message to an outbox file
pub struct OutboxSender {
    path: PathBuf,
    from: Option<String>,
    guard: Mutex<()>,
}

impl OutboxSender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        OutboxSender {
            path: path.into(),
            from: None,
            guard: Mutex::new(()),
        }
    }

    /// Sender address written on every message
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

impl MessageSender for OutboxSender {
    fn send(&self, to: &str, subject: &str, body: &serde_json::Value) -> Result<(), SendError> {
        let _lock = self
            .guard
            .lock()
            .map_err(|_| SendError("outbox lock poisoned".to_string()))?;

        let line = serde_json::json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "body": body,
            "sent_at": crate::record::format_timestamp(chrono::Utc::now()),
        });

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SendError(format!("open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line).map_err(|e| SendError(e.to_string()))?;

        Ok(())
    }
}

// ============================================================================
// MESSAGE COMPOSITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub owner_id: i64,
    pub subject: String,
    pub body: serde_json::Value,
    pub record_ids: Vec<i64>,
}

/// "created" when the row was never updated after insertion
fn action(record: &EmployeeRecord) -> &'static str {
    if record.created_at == record.updated_at {
        "created"
    } else {
        "updated"
    }
}

/// Compose the single message for one owner's changed records
pub fn compose(owner_id: i64, records: &[&EmployeeRecord]) -> Notification {
    let created = records.iter().filter(|r| action(r) == "created").count();
    let updated = records.len() - created;

    let subject = format!(
        "{} employee record{} created, {} updated",
        created,
        if created == 1 { "" } else { "s" },
        updated
    );

    let employees: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let mut summary = record.summary();
            summary["action"] = serde_json::json!(action(record));
            summary
        })
        .collect();

    Notification {
        owner_id,
        subject,
        body: serde_json::json!({
            "owner_id": owner_id,
            "employee_count": records.len(),
            "created": created,
            "updated": updated,
            "employees": employees,
        }),
        record_ids: records.iter().filter_map(|r| r.id).collect(),
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Messages confirmed sent (one per owner)
    pub notifications_sent: usize,
    /// Records whose flag was cleared
    pub records_cleared: usize,
    /// Records left dirty for a later sweep
    pub records_pending: usize,
    pub failed_owners: Vec<i64>,
}

pub struct NotificationDispatcher {
    repo: Arc<dyn EmployeeRepository>,
    owners: Arc<dyn OwnerDirectory>,
    sender: Arc<dyn MessageSender>,
    span: Span,
}

impl NotificationDispatcher {
    pub fn new(
        repo: Arc<dyn EmployeeRepository>,
        owners: Arc<dyn OwnerDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        NotificationDispatcher {
            repo,
            owners,
            sender,
            span: tracing::info_span!("notification_dispatcher"),
        }
    }

    /// Use the caller's span as parent of every event this dispatcher logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Send one message per owner and clear flags of delivered records
    pub fn dispatch(&self, records: &[EmployeeRecord]) -> DispatchReport {
        let mut report = DispatchReport::default();

        let mut by_owner: BTreeMap<i64, Vec<&EmployeeRecord>> = BTreeMap::new();
        for record in records.iter().filter(|r| r.id.is_some()) {
            by_owner.entry(record.owner_id).or_default().push(record);
        }

        for (owner_id, group) in by_owner {
            let notification = compose(owner_id, &group);

            let contact = match self.owners.contact(owner_id) {
                Ok(Some(contact)) => contact,
                Ok(None) => {
                    warn!(parent: &self.span, owner_id, records = group.len(), "owner has no contact, leaving records dirty");
                    report.records_pending += group.len();
                    report.failed_owners.push(owner_id);
                    continue;
                }
                Err(e) => {
                    error!(parent: &self.span, owner_id, error = %e, "owner lookup failed");
                    report.records_pending += group.len();
                    report.failed_owners.push(owner_id);
                    continue;
                }
            };

            if let Err(e) = self.sender.send(&contact, &notification.subject, &notification.body) {
                warn!(parent: &self.span, owner_id, error = %e, records = group.len(), "notification send failed, will retry on next sweep");
                report.records_pending += group.len();
                report.failed_owners.push(owner_id);
                continue;
            }

            report.notifications_sent += 1;

            // Only the versions that went out are cleared
            match self.repo.clear_delivered(&group) {
                Ok(cleared) => {
                    let moved = group.len().saturating_sub(cleared);
                    report.records_cleared += cleared;
                    report.records_pending += moved;
                    if moved > 0 {
                        info!(parent: &self.span, owner_id, records = moved, "records changed while notifying, left dirty");
                    }
                    info!(parent: &self.span, owner_id, records = cleared, "owner notified");
                }
                Err(e) => {
                    // Sent but still flagged: the next sweep sends again
                    error!(parent: &self.span, owner_id, error = %e, "failed to clear notification flags");
                    report.records_pending += group.len();
                }
            }
        }

        report
    }

    /// Routine sweep: nothing dirty is a successful, empty run
    pub fn sweep(&self, owner_id: Option<i64>, window: Duration) -> Result<DispatchReport, RepositoryError> {
        let records = self.repo.find_dirty(owner_id, window)?;
        info!(parent: &self.span, owner_id, dirty = records.len(), "notification sweep");
        Ok(self.dispatch(&records))
    }

    /// Administrative sweep: nothing dirty is reported as `NotFound`
    pub fn sweep_strict(&self, owner_id: Option<i64>, window: Duration) -> Result<DispatchReport, RepositoryError> {
        let records = self.repo.find_dirty_strict(owner_id, window)?;
        info!(parent: &self.span, owner_id, dirty = records.len(), "notification sweep");
        Ok(self.dispatch(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Owner;
    use crate::repository::SqliteEmployeeRepository;
    use crate::states::BrazilianState;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSender {
        sent: Mutex<Vec<(String, String, serde_json::Value)>>,
        fail: AtomicBool,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSender {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, to: &str, subject: &str, body: &serde_json::Value) -> Result<(), SendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SendError("smtp unavailable".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body.clone()));
            Ok(())
        }
    }

    fn setup() -> (Arc<SqliteEmployeeRepository>, Database) {
        let db = db::open_in_memory().unwrap();
        {
            let conn = db::lock(&db).unwrap();
            for (id, email) in [(1, "one@example.com"), (2, "two@example.com")] {
                db::upsert_owner(
                    &conn,
                    &Owner {
                        id,
                        name: format!("Owner {}", id),
                        email: email.to_string(),
                    },
                )
                .unwrap();
            }
        }
        (Arc::new(SqliteEmployeeRepository::new(db.clone())), db)
    }

    fn record(key: &str, owner_id: i64) -> EmployeeRecord {
        EmployeeRecord {
            id: None,
            natural_key: key.to_string(),
            name: "John Doe".to_string(),
            email: "john@x.com".to_string(),
            city: "São Paulo".to_string(),
            state: BrazilianState::SaoPaulo,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            owner_id,
            needs_notification: true,
            created_at: None,
            updated_at: None,
        }
    }

    fn dispatcher(repo: Arc<SqliteEmployeeRepository>, db: Database, sender: Arc<RecordingSender>) -> NotificationDispatcher {
        NotificationDispatcher::new(repo, Arc::new(SqliteOwnerDirectory::new(db)), sender)
    }

    #[test]
    fn test_one_message_per_owner() {
        let (repo, db) = setup();
        let saved = repo
            .upsert_batch(&[
                record("11144477735", 1),
                record("12345678909", 1),
                record("98765432100", 2),
            ])
            .unwrap();

        let sender = RecordingSender::new();
        let report = dispatcher(repo.clone(), db, sender.clone()).dispatch(&saved);

        assert_eq!(report.notifications_sent, 2);
        assert_eq!(report.records_cleared, 3);
        assert_eq!(report.records_pending, 0);

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "one@example.com");
        assert_eq!(sent[0].2["employee_count"], 2);
        assert_eq!(sent[0].1, "2 employee records created, 0 updated");

        assert!(repo.find_dirty(None, Duration::hours(24)).unwrap().is_empty());
    }

    #[test]
    fn test_failed_send_keeps_flags() {
        let (repo, db) = setup();
        let saved = repo.upsert_batch(&[record("11144477735", 1)]).unwrap();

        let sender = RecordingSender::new();
        sender.fail.store(true, Ordering::SeqCst);
        let dispatcher = dispatcher(repo.clone(), db, sender.clone());

        let report = dispatcher.dispatch(&saved);
        assert_eq!(report.notifications_sent, 0);
        assert_eq!(report.records_pending, 1);
        assert_eq!(report.failed_owners, vec![1]);
        assert_eq!(repo.find_dirty(None, Duration::hours(24)).unwrap().len(), 1);

        // Transport recovers: the sweep picks the record up again
        sender.fail.store(false, Ordering::SeqCst);
        let report = dispatcher.sweep(None, Duration::hours(24)).unwrap();
        assert_eq!(report.notifications_sent, 1);
        assert!(repo.find_dirty(None, Duration::hours(24)).unwrap().is_empty());
    }

    #[test]
    fn test_owner_without_contact_stays_dirty() {
        let (repo, db) = setup();
        let saved = repo.upsert_batch(&[record("11144477735", 99)]).unwrap();

        let sender = RecordingSender::new();
        let report = dispatcher(repo.clone(), db, sender.clone()).dispatch(&saved);

        assert_eq!(report.failed_owners, vec![99]);
        assert!(sender.sent.lock().unwrap().is_empty());
        assert_eq!(repo.find_dirty(Some(99), Duration::hours(24)).unwrap().len(), 1);
    }

    /// Rewrites the record through the repository while the message is in flight
    struct RewritingSender {
        repo: Arc<SqliteEmployeeRepository>,
        key: String,
    }

    impl MessageSender for RewritingSender {
        fn send(&self, _to: &str, _subject: &str, _body: &serde_json::Value) -> Result<(), SendError> {
            let mut current = self.repo.find_by_key(&self.key).unwrap().unwrap();
            current.city = "Campinas".to_string();
            current.needs_notification = true;
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.repo.upsert_batch(&[current]).unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_update_during_send_stays_dirty() {
        let (repo, db) = setup();
        let saved = repo.upsert_batch(&[record("11144477735", 1)]).unwrap();

        let rewriting = Arc::new(RewritingSender {
            repo: repo.clone(),
            key: "11144477735".to_string(),
        });
        let report = NotificationDispatcher::new(repo.clone(), Arc::new(SqliteOwnerDirectory::new(db.clone())), rewriting)
            .dispatch(&saved);

        assert_eq!(report.notifications_sent, 1);
        assert_eq!(report.records_cleared, 0);
        assert_eq!(report.records_pending, 1);

        let stored = repo.find_by_key("11144477735").unwrap().unwrap();
        assert_eq!(stored.city, "Campinas");
        assert!(stored.needs_notification);

        // The newer values go out on the next sweep
        let sender = RecordingSender::new();
        let report = dispatcher(repo.clone(), db, sender.clone()).sweep(None, Duration::hours(24)).unwrap();
        assert_eq!(report.notifications_sent, 1);
        assert_eq!(report.records_cleared, 1);
        assert_eq!(sender.sent.lock().unwrap()[0].2["employees"][0]["city"], "Campinas");
    }

    #[test]
    fn test_sweep_empty_vs_strict() {
        let (repo, db) = setup();
        let dispatcher = dispatcher(repo, db, RecordingSender::new());

        let report = dispatcher.sweep(None, Duration::hours(24)).unwrap();
        assert_eq!(report, DispatchReport::default());

        let err = dispatcher.sweep_strict(None, Duration::hours(24)).unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[test]
    fn test_compose_marks_updates() {
        let (repo, _db) = setup();
        let first = repo.upsert_batch(&[record("11144477735", 1)]).unwrap();

        let mut changed = first[0].clone();
        changed.city = "Campinas".to_string();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let updated = repo.upsert_batch(&[changed]).unwrap();

        let notification = compose(1, &[&updated[0]]);
        assert_eq!(notification.subject, "0 employee records created, 1 updated");
        assert_eq!(notification.body["employees"][0]["action"], "updated");
        assert_eq!(notification.body["employees"][0]["document"], "111.444.777-35");
    }

    #[test]
    fn test_outbox_sender_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = OutboxSender::new(&path).with_from("noreply@example.com");

        sender.send("a@example.com", "s1", &serde_json::json!({"n": 1})).unwrap();
        sender.send("b@example.com", "s2", &serde_json::json!({"n": 2})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["to"], "b@example.com");
        assert_eq!(second["from"], "noreply@example.com");
    }
}
