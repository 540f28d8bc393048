use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};
use crate::renderer::RenderFormat;
use crate::results::{ReportResult, ResultStore};
use crate::storage::{StorageError, StorageFacade};

pub const MAIL_SUBJECT: &str = "New report is available";

/// A delivery subscription for the results of one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub job_id: Uuid,
    pub recipient: String,
    pub format: RenderFormat,
    pub report_name: String,
}

#[derive(Debug)]
pub enum NotificationError {
    InvalidRecipient { recipient: String },
    Storage(StorageError),
    Spool { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRecipient { recipient } => {
                write!(f, "'{recipient}' is not a valid mail recipient")
            }
            Self::Storage(source) => write!(f, "notification storage failed: {source}"),
            Self::Spool { path, source } => write!(
                f,
                "failed to write mail to spool '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for NotificationError {}

// Header and quoted parameter text: no line breaks, quotes or escapes.
fn header_text(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            '"' | '\\' => '\'',
            ch if ch.is_control() => ' ',
            ch => ch,
        })
        .collect()
}

fn validate_recipient(recipient: &str) -> Result<(), NotificationError> {
    let valid = recipient
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
        && !recipient.chars().any(|ch| ch.is_whitespace() || ch.is_control());
    if valid {
        Ok(())
    } else {
        Err(NotificationError::InvalidRecipient {
            recipient: recipient.to_owned(),
        })
    }
}

pub struct NotificationStore {
    storage: Arc<StorageFacade>,
    logger: Arc<Logger>,
}

impl NotificationStore {
    pub fn new(storage: Arc<StorageFacade>, logger: Arc<Logger>) -> Self {
        Self { storage, logger }
    }

    /// Stores every subscription or none of them.
    pub fn create_batch(
        &self,
        job_id: Uuid,
        recipients: &[(String, RenderFormat)],
        report_name: &str,
    ) -> Result<Vec<Notification>, NotificationError> {
        for (recipient, _) in recipients {
            validate_recipient(recipient)?;
        }

        let notifications: Vec<Notification> = recipients
            .iter()
            .map(|(recipient, format)| Notification {
                id: Uuid::new_v4(),
                job_id,
                recipient: recipient.clone(),
                format: *format,
                report_name: report_name.to_owned(),
            })
            .collect();
        self.storage
            .insert_notifications(&notifications)
            .map_err(NotificationError::Storage)?;

        self.logger.log(
            LogLevel::Info,
            Some("notifications::create"),
            "Report notifications registered",
            Some(json!({
                "job_id": job_id.to_string(),
                "recipients": notifications.len(),
                "report_name": report_name,
            })),
        );
        Ok(notifications)
    }

    pub fn load(&self, job_id: Uuid) -> Result<Vec<Notification>, NotificationError> {
        self.storage
            .load_notifications(job_id)
            .map_err(NotificationError::Storage)
    }

    /// Removes every subscription of the job.
    pub fn delete(&self, job_id: Uuid) -> Result<usize, NotificationError> {
        let removed = self
            .storage
            .remove_notifications(job_id)
            .map_err(NotificationError::Storage)?;
        if removed > 0 {
            self.logger.log(
                LogLevel::Info,
                Some("notifications::delete"),
                "Report notifications deleted",
                Some(json!({ "job_id": job_id.to_string(), "removed": removed })),
            );
        }
        Ok(removed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

pub trait MailSender: Send + Sync {
    fn send(&self, mail: &OutgoingMail) -> Result<(), NotificationError>;
}

/// Writes each message as an `.eml` file for an external relay to pick up.
pub struct SpoolMailSender {
    directory: PathBuf,
    sender_address: String,
}

impl SpoolMailSender {
    pub fn new(
        directory: PathBuf,
        sender_address: impl Into<String>,
    ) -> Result<Self, NotificationError> {
        fs::create_dir_all(&directory).map_err(|source| NotificationError::Spool {
            path: directory.clone(),
            source,
        })?;
        Ok(Self {
            directory,
            sender_address: sender_address.into(),
        })
    }

    fn compose(&self, mail: &OutgoingMail, boundary: &str) -> String {
        let subject = header_text(&mail.subject);
        let mut message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\n",
            self.sender_address,
            mail.to,
            subject,
            Utc::now().to_rfc2822()
        );

        let Some(attachment) = &mail.attachment else {
            message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
            message.push_str(&mail.body);
            message.push_str("\r\n");
            return message;
        };

        let file_name = header_text(&attachment.file_name);
        message.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n\
             --{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n\
             --{boundary}\r\nContent-Type: {}; name=\"{}\"\r\n\
             Content-Disposition: attachment; filename=\"{}\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\n",
            mail.body,
            attachment.content_type,
            file_name,
            file_name
        ));
        let encoded = BASE64.encode(&attachment.data);
        for chunk in encoded.as_bytes().chunks(76) {
            message.push_str(&String::from_utf8_lossy(chunk));
            message.push_str("\r\n");
        }
        message.push_str(&format!("--{boundary}--\r\n"));
        message
    }
}

impl MailSender for SpoolMailSender {
    fn send(&self, mail: &OutgoingMail) -> Result<(), NotificationError> {
        validate_recipient(&mail.to)?;
        let id = Uuid::new_v4();
        let message = self.compose(mail, &format!("reportd-{}", id.simple()));

        let staging = self.directory.join(format!("{id}.eml.tmp"));
        let target = self.directory.join(format!("{id}.eml"));
        fs::write(&staging, message).map_err(|source| NotificationError::Spool {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &target).map_err(|source| NotificationError::Spool {
            path: target.clone(),
            source,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

pub fn mail_body(report_name: &str, executed_at: DateTime<Utc>) -> String {
    format!(
        "Report \"{report_name}\" successfully generated on {} and can be accessed using management console.",
        executed_at.format("%d-%m-%Y %H:%M:%S UTC")
    )
}

pub fn attachment_file_name(
    report_name: &str,
    executed_at: DateTime<Utc>,
    format: RenderFormat,
) -> Option<String> {
    format
        .extension()
        .map(|extension| format!("{report_name} {}.{extension}", executed_at.format("%d-%m-%Y")))
}

/// Delivers a freshly recorded result to every subscriber of its job.
pub struct FanOut {
    store: Arc<NotificationStore>,
    results: Arc<ResultStore>,
    sender: Arc<dyn MailSender>,
    logger: Arc<Logger>,
}

impl FanOut {
    pub fn new(
        store: Arc<NotificationStore>,
        results: Arc<ResultStore>,
        sender: Arc<dyn MailSender>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            store,
            results,
            sender,
            logger,
        }
    }

    // Every recipient is attempted; failures are logged and counted only.
    pub fn deliver(&self, result: &ReportResult) -> DeliveryReport {
        let context = json!({
            "report_id": result.report_id.to_string(),
            "job_id": result.job_id.to_string(),
        });
        let notifications = match self.store.load(result.job_id) {
            Ok(notifications) => notifications,
            Err(error) => {
                self.log_failure("Failed to load report notifications", &context, None, &error.to_string());
                return DeliveryReport::default();
            }
        };
        if notifications.is_empty() {
            self.logger.log(
                LogLevel::Debug,
                Some("notifications::fanout"),
                "No notifications registered for job",
                Some(context),
            );
            return DeliveryReport::default();
        }

        let mut rendered: HashMap<RenderFormat, Result<Option<Vec<u8>>, String>> = HashMap::new();
        let mut report = DeliveryReport::default();
        for notification in &notifications {
            match self.deliver_one(result, notification, &mut rendered) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    report.failed += 1;
                    self.log_failure(
                        "Report notification delivery failed",
                        &context,
                        Some(&notification.recipient),
                        &reason,
                    );
                }
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some("notifications::fanout"),
            "Report notifications processed",
            Some(json!({
                "report_id": result.report_id.to_string(),
                "job_id": result.job_id.to_string(),
                "delivered": report.delivered,
                "failed": report.failed,
            })),
        );
        report
    }

    fn deliver_one(
        &self,
        result: &ReportResult,
        notification: &Notification,
        rendered: &mut HashMap<RenderFormat, Result<Option<Vec<u8>>, String>>,
    ) -> Result<(), String> {
        let attachment = match attachment_file_name(
            &notification.report_name,
            result.execution_time,
            notification.format,
        ) {
            None => None,
            Some(file_name) => {
                let data = rendered
                    .entry(notification.format)
                    .or_insert_with(|| {
                        self.results
                            .render_result(result.report_id, result.job_id, notification.format)
                            .map_err(|error| error.to_string())
                    })
                    .clone()?
                    .ok_or_else(|| "result is no longer available".to_owned())?;
                Some(Attachment {
                    file_name,
                    content_type: notification.format.content_type(),
                    data,
                })
            }
        };

        self.sender
            .send(&OutgoingMail {
                to: notification.recipient.clone(),
                subject: MAIL_SUBJECT.to_owned(),
                body: mail_body(&notification.report_name, result.execution_time),
                attachment,
            })
            .map_err(|error| error.to_string())
    }

    fn log_failure(
        &self,
        message: &str,
        context: &serde_json::Value,
        recipient: Option<&str>,
        reason: &str,
    ) {
        let mut payload = context.clone();
        payload["error"] = json!(reason);
        if let Some(recipient) = recipient {
            payload["recipient"] = json!(recipient);
        }
        self.logger.log(
            LogLevel::Error,
            Some("notifications::fanout"),
            message,
            Some(payload),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use crate::logging::quiet_logger;
    use crate::renderer::{FillRequest, RenderFormat, Renderer};
    use crate::results::tests::test_renderer;
    use crate::results::{ReportResult, ResultStore};
    use crate::storage::TempStorage;

    use super::{
        attachment_file_name, mail_body, FanOut, MailSender, NotificationError,
        NotificationStore, OutgoingMail, SpoolMailSender, MAIL_SUBJECT,
    };

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    impl MailSender for RecordingSender {
        fn send(&self, mail: &OutgoingMail) -> Result<(), NotificationError> {
            if mail.to.starts_with("unreachable") {
                return Err(NotificationError::Spool {
                    path: PathBuf::from("relay"),
                    source: io::Error::other("relay refused connection"),
                });
            }
            self.sent
                .lock()
                .expect("sent lock should work")
                .push(mail.clone());
            Ok(())
        }
    }

    fn executed_at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0)
            .single()
            .expect("timestamp should be valid")
    }

    #[test]
    fn create_load_and_delete_all_for_job() {
        let temp = TempStorage::new("notifications-crud");
        let store = NotificationStore::new(temp.open(), quiet_logger());
        let job_id = Uuid::new_v4();
        let other_job = Uuid::new_v4();

        store
            .create_batch(
                job_id,
                &[
                    ("ops@example.com".to_owned(), RenderFormat::Pdf),
                    ("audit@example.com".to_owned(), RenderFormat::Xls),
                ],
                "Alarm history",
            )
            .expect("batch should be stored");
        store
            .create_batch(
                other_job,
                &[("ops@example.com".to_owned(), RenderFormat::None)],
                "Uptime",
            )
            .expect("single notification should be stored");

        assert_eq!(store.load(job_id).expect("load should work").len(), 2);
        assert_eq!(store.delete(job_id).expect("delete should work"), 2);
        assert!(store.load(job_id).expect("load should work").is_empty());
        assert_eq!(store.delete(job_id).expect("repeated delete should work"), 0);
        assert_eq!(store.load(other_job).expect("load should work").len(), 1);
    }

    #[test]
    fn invalid_recipient_rejects_whole_batch() {
        let temp = TempStorage::new("notifications-invalid");
        let store = NotificationStore::new(temp.open(), quiet_logger());
        let job_id = Uuid::new_v4();

        let outcome = store.create_batch(
            job_id,
            &[
                ("ops@example.com".to_owned(), RenderFormat::Pdf),
                ("not an address".to_owned(), RenderFormat::Pdf),
            ],
            "Alarm history",
        );
        assert!(matches!(
            outcome,
            Err(NotificationError::InvalidRecipient { .. })
        ));
        assert!(store.load(job_id).expect("load should work").is_empty());
    }

    #[test]
    fn fan_out_continues_past_failing_recipient() {
        let temp = TempStorage::new("notifications-fanout");
        let storage = temp.open();
        let renderer = test_renderer();
        let results = Arc::new(ResultStore::new(
            Arc::clone(&storage),
            renderer.clone(),
            quiet_logger(),
        ));
        let store = Arc::new(NotificationStore::new(Arc::clone(&storage), quiet_logger()));
        let sender = Arc::new(RecordingSender::default());
        let fanout = FanOut::new(
            Arc::clone(&store),
            Arc::clone(&results),
            sender.clone(),
            quiet_logger(),
        );

        let result = ReportResult {
            report_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            user_id: 1,
            execution_time: executed_at(),
            success: true,
        };
        let source = renderer
            .fill(&FillRequest {
                report_id: result.report_id,
                job_id: result.job_id,
                user_id: 1,
                report_name: "Alarm history",
                parameters: &BTreeMap::new(),
                executed_at: result.execution_time,
            })
            .expect("fill should work");
        results.record(&result, &source).expect("record should work");
        store
            .create_batch(
                result.job_id,
                &[
                    ("unreachable@example.com".to_owned(), RenderFormat::Pdf),
                    ("ops@example.com".to_owned(), RenderFormat::Pdf),
                    ("audit@example.com".to_owned(), RenderFormat::None),
                ],
                "Alarm history",
            )
            .expect("batch should be stored");

        let report = fanout.deliver(&result);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        let sent = sender.sent.lock().expect("sent lock should work");
        let ops = sent
            .iter()
            .find(|mail| mail.to == "ops@example.com")
            .expect("ops mail should be sent");
        assert_eq!(ops.subject, MAIL_SUBJECT);
        let attachment = ops.attachment.as_ref().expect("pdf should be attached");
        assert_eq!(attachment.file_name, "Alarm history 01-03-2024.pdf");
        assert_eq!(
            Some(attachment.data.clone()),
            results
                .render_result(result.report_id, result.job_id, RenderFormat::Pdf)
                .expect("render should work")
        );
        let audit = sent
            .iter()
            .find(|mail| mail.to == "audit@example.com")
            .expect("audit mail should be sent");
        assert!(audit.attachment.is_none());
    }

    #[test]
    fn job_without_notifications_is_skipped() {
        let temp = TempStorage::new("notifications-empty");
        let storage = temp.open();
        let results = Arc::new(ResultStore::new(
            Arc::clone(&storage),
            test_renderer(),
            quiet_logger(),
        ));
        let sender = Arc::new(RecordingSender::default());
        let fanout = FanOut::new(
            Arc::new(NotificationStore::new(storage, quiet_logger())),
            results,
            sender.clone(),
            quiet_logger(),
        );

        let report = fanout.deliver(&ReportResult {
            report_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            user_id: 1,
            execution_time: executed_at(),
            success: true,
        });
        assert_eq!(report.delivered + report.failed, 0);
        assert!(sender.sent.lock().expect("sent lock should work").is_empty());
    }

    #[test]
    fn composes_body_and_attachment_names() {
        assert_eq!(
            mail_body("Alarm history", executed_at()),
            "Report \"Alarm history\" successfully generated on 01-03-2024 09:30:00 UTC and can be accessed using management console."
        );
        assert_eq!(
            attachment_file_name("Uptime", executed_at(), RenderFormat::Xls).as_deref(),
            Some("Uptime 01-03-2024.xls")
        );
        assert_eq!(attachment_file_name("Uptime", executed_at(), RenderFormat::None), None);
    }

    fn spool_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "reportd-spool-{label}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    fn spooled_messages(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("spool dir should be readable")
            .filter_map(Result::ok)
            .map(|entry| fs::read_to_string(entry.path()).expect("eml should be readable"))
            .collect()
    }

    #[test]
    fn hostile_attachment_names_stay_inside_their_header() {
        let dir = spool_dir("hostile");
        let sender =
            SpoolMailSender::new(dir.clone(), "reportd@example.com").expect("spool should open");

        sender
            .send(&OutgoingMail {
                to: "ops@example.com".to_owned(),
                subject: MAIL_SUBJECT.to_owned(),
                body: "hello".to_owned(),
                attachment: Some(super::Attachment {
                    file_name: "x\"\r\nBcc: victim@example.com\r\n\r\n.pdf".to_owned(),
                    content_type: "application/pdf",
                    data: b"%PDF-1.4".to_vec(),
                }),
            })
            .expect("spool write should work");

        let messages = spooled_messages(&dir);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].contains("\r\nBcc:"));
        assert!(messages[0].contains("filename=\"x'  Bcc: victim@example.com    .pdf\"\r\n"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn spool_sender_writes_mime_message() {
        let dir = spool_dir("mime");
        let sender =
            SpoolMailSender::new(dir.clone(), "reportd@example.com").expect("spool should open");

        sender
            .send(&OutgoingMail {
                to: "ops@example.com".to_owned(),
                subject: MAIL_SUBJECT.to_owned(),
                body: "hello".to_owned(),
                attachment: Some(super::Attachment {
                    file_name: "Uptime 01-03-2024.pdf".to_owned(),
                    content_type: "application/pdf",
                    data: b"%PDF-1.4".to_vec(),
                }),
            })
            .expect("spool write should work");
        assert!(matches!(
            sender.send(&OutgoingMail {
                to: "nobody".to_owned(),
                subject: MAIL_SUBJECT.to_owned(),
                body: String::new(),
                attachment: None,
            }),
            Err(NotificationError::InvalidRecipient { .. })
        ));

        let files: Vec<_> = fs::read_dir(&dir)
            .expect("spool dir should be readable")
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].extension().and_then(|ext| ext.to_str()),
            Some("eml")
        );
        let message = fs::read_to_string(&files[0]).expect("eml should be readable");
        assert!(message.contains("To: ops@example.com\r\n"));
        assert!(message.contains("filename=\"Uptime 01-03-2024.pdf\""));
        assert!(message.contains("JVBERi0xLjQ="));

        let _ = fs::remove_dir_all(dir);
    }
}
