mod handlers;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::catalog::ReportCatalog;
use crate::connector::{Broadcaster, ConnectorError, SessionHandler};
use crate::logging::{LogLevel, Logger};
use crate::notifications::NotificationStore;
use crate::results::ResultStore;
use crate::scheduler::Scheduler;
use crate::wire::message::{FieldValue, Message};
use crate::wire::protocol::{
    command_name, CMD_GET_NXCP_CAPS, CMD_KEEPALIVE, CMD_NXCP_CAPS, CMD_REQUEST_COMPLETED,
    CMD_RS_ADD_REPORT_NOTIFY, CMD_RS_DELETE_RESULT, CMD_RS_DELETE_SCHEDULE,
    CMD_RS_GET_REPORT_DEFINITION, CMD_RS_LIST_REPORTS, CMD_RS_LIST_RESULTS,
    CMD_RS_LIST_SCHEDULES, CMD_RS_RENDER_RESULT, CMD_RS_SCHEDULE_EXECUTION, PROTOCOL_VERSION,
    RCC_INTERNAL_ERROR, RCC_INVALID_ARGUMENT, RCC_INVALID_OBJECT_ID, RCC_NOT_IMPLEMENTED,
    RCC_SUCCESS, VID_RCC,
};
use crate::wire::records::{ListLayout, ListReader};

/// Why a request could not be served. Every variant maps onto a reply
/// result code; none of them closes the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    MissingField {
        field_id: u32,
        name: &'static str,
    },
    InvalidField {
        field_id: u32,
        name: &'static str,
        reason: String,
    },
    UnknownObject {
        kind: &'static str,
        id: Uuid,
    },
    Internal {
        operation: &'static str,
        message: String,
    },
}

impl RequestError {
    pub fn result_code(&self) -> u32 {
        match self {
            Self::MissingField { .. } | Self::InvalidField { .. } => RCC_INVALID_ARGUMENT,
            Self::UnknownObject { .. } => RCC_INVALID_OBJECT_ID,
            Self::Internal { .. } => RCC_INTERNAL_ERROR,
        }
    }

    pub(crate) fn internal(operation: &'static str, error: impl fmt::Display) -> Self {
        Self::Internal {
            operation,
            message: error.to_string(),
        }
    }

    fn log_level(&self) -> LogLevel {
        match self {
            Self::Internal { .. } => LogLevel::Error,
            _ => LogLevel::Debug,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field_id, name } => {
                write!(f, "required field {name} ({field_id}) is missing")
            }
            Self::InvalidField {
                field_id,
                name,
                reason,
            } => write!(f, "field {name} ({field_id}) is invalid: {reason}"),
            Self::UnknownObject { kind, id } => write!(f, "{kind} '{id}' does not exist"),
            Self::Internal { operation, message } => write!(f, "{operation} failed: {message}"),
        }
    }
}

impl std::error::Error for RequestError {}

type Handler = fn(&SessionDispatcher, &Message, &mut Message) -> Result<(), RequestError>;

fn command_table() -> HashMap<u16, Handler> {
    let mut table: HashMap<u16, Handler> = HashMap::new();
    table.insert(CMD_KEEPALIVE, handlers::keepalive);
    table.insert(CMD_RS_LIST_REPORTS, handlers::list_reports);
    table.insert(CMD_RS_GET_REPORT_DEFINITION, handlers::get_report_definition);
    table.insert(CMD_RS_SCHEDULE_EXECUTION, handlers::schedule_execution);
    table.insert(CMD_RS_LIST_SCHEDULES, handlers::list_schedules);
    table.insert(CMD_RS_DELETE_SCHEDULE, handlers::delete_schedule);
    table.insert(CMD_RS_LIST_RESULTS, handlers::list_results);
    table.insert(CMD_RS_RENDER_RESULT, handlers::render_result);
    table.insert(CMD_RS_DELETE_RESULT, handlers::delete_result);
    table.insert(CMD_RS_ADD_REPORT_NOTIFY, handlers::add_report_notify);
    table
}

/// Turns requests into replies. Shared by every connection; holds no
/// per-session state.
pub struct SessionDispatcher {
    catalog: Arc<dyn ReportCatalog>,
    scheduler: Arc<Scheduler>,
    results: Arc<ResultStore>,
    notifications: Arc<NotificationStore>,
    broadcaster: Arc<dyn Broadcaster>,
    logger: Arc<Logger>,
    default_locale: String,
    handlers: HashMap<u16, Handler>,
}

impl SessionDispatcher {
    pub fn new(
        catalog: Arc<dyn ReportCatalog>,
        scheduler: Arc<Scheduler>,
        results: Arc<ResultStore>,
        notifications: Arc<NotificationStore>,
        broadcaster: Arc<dyn Broadcaster>,
        logger: Arc<Logger>,
        default_locale: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            scheduler,
            results,
            notifications,
            broadcaster,
            logger,
            default_locale: default_locale.into(),
            handlers: command_table(),
        }
    }

    pub fn dispatch(&self, request: &Message) -> Message {
        if request.code == CMD_GET_NXCP_CAPS {
            return Message::control(CMD_NXCP_CAPS, request.id, PROTOCOL_VERSION);
        }

        let handler = if request.is_control() {
            None
        } else {
            self.handlers.get(&request.code)
        };
        let Some(handler) = handler else {
            self.logger.log(
                LogLevel::Debug,
                Some("dispatcher::dispatch"),
                "Unsupported command",
                Some(json!({
                    "code": request.code,
                    "request_id": request.id,
                    "control": request.is_control(),
                })),
            );
            return Message::new(CMD_REQUEST_COMPLETED, request.id)
                .with(VID_RCC, RCC_NOT_IMPLEMENTED);
        };

        let started = Instant::now();
        let mut reply = Message::new(CMD_REQUEST_COMPLETED, request.id);
        let rcc = match handler(self, request, &mut reply) {
            Ok(()) => RCC_SUCCESS,
            Err(error) => {
                self.logger.log(
                    error.log_level(),
                    Some("dispatcher::dispatch"),
                    "Request failed",
                    Some(json!({
                        "command": command_name(request.code),
                        "request_id": request.id,
                        "rcc": error.result_code(),
                        "error": error.to_string(),
                    })),
                );
                // Partial reply fields never leak out with a failure code.
                reply = Message::new(CMD_REQUEST_COMPLETED, request.id);
                error.result_code()
            }
        };
        reply.set(VID_RCC, rcc);

        if self.logger.enabled(LogLevel::Verbose) {
            self.logger.log(
                LogLevel::Verbose,
                Some("dispatcher::dispatch"),
                "Request served",
                Some(json!({
                    "command": command_name(request.code),
                    "request_id": request.id,
                    "rcc": rcc,
                    "duration_us": started.elapsed().as_micros() as u64,
                })),
            );
        }
        reply
    }
}

impl SessionHandler for SessionDispatcher {
    fn dispatch(&self, request: &Message) -> Message {
        SessionDispatcher::dispatch(self, request)
    }

    fn transport_error(&self, connection_id: u64, error: &ConnectorError) {
        self.logger.log(
            LogLevel::Warn,
            Some("dispatcher::transport"),
            "Transport error on connection",
            Some(json!({
                "connection_id": connection_id,
                "error": error.to_string(),
            })),
        );
    }
}

fn invalid(field_id: u32, name: &'static str, value: &FieldValue, expected: &str) -> RequestError {
    RequestError::InvalidField {
        field_id,
        name,
        reason: format!("expected {expected}, got {}", value.type_name()),
    }
}

pub(crate) fn optional_uuid(
    request: &Message,
    field_id: u32,
    name: &'static str,
) -> Result<Option<Uuid>, RequestError> {
    request
        .get(field_id)
        .map(|value| {
            value
                .as_uuid()
                .ok_or_else(|| invalid(field_id, name, value, "uuid"))
        })
        .transpose()
}

pub(crate) fn required_uuid(
    request: &Message,
    field_id: u32,
    name: &'static str,
) -> Result<Uuid, RequestError> {
    optional_uuid(request, field_id, name)?.ok_or(RequestError::MissingField { field_id, name })
}

pub(crate) fn optional_u32(
    request: &Message,
    field_id: u32,
    name: &'static str,
) -> Result<Option<u32>, RequestError> {
    request
        .get(field_id)
        .map(|value| {
            value
                .as_u32()
                .ok_or_else(|| invalid(field_id, name, value, "unsigned 32-bit integer"))
        })
        .transpose()
}

pub(crate) fn required_u32(
    request: &Message,
    field_id: u32,
    name: &'static str,
) -> Result<u32, RequestError> {
    optional_u32(request, field_id, name)?.ok_or(RequestError::MissingField { field_id, name })
}

pub(crate) fn optional_str<'a>(
    request: &'a Message,
    field_id: u32,
    name: &'static str,
) -> Result<Option<&'a str>, RequestError> {
    request
        .get(field_id)
        .map(|value| {
            value
                .as_str()
                .ok_or_else(|| invalid(field_id, name, value, "string"))
        })
        .transpose()
}

/// Opens a list carried by a request; a count the fields cannot back is
/// rejected before anything is read or allocated.
pub(crate) fn request_list<'a>(
    request: &'a Message,
    layout: ListLayout,
    name: &'static str,
) -> Result<ListReader<'a>, RequestError> {
    ListReader::checked(request, layout).map_err(|error| RequestError::InvalidField {
        field_id: layout.count_field,
        name,
        reason: error.to_string(),
    })
}

/// Reads `name, value` string records; a record without a name is rejected.
pub(crate) fn read_string_pairs(
    request: &Message,
    layout: ListLayout,
    name: &'static str,
) -> Result<BTreeMap<String, String>, RequestError> {
    let mut pairs = BTreeMap::new();
    for (index, mut record) in request_list(request, layout, name)?.records().enumerate() {
        let key = record.next_str().ok_or_else(|| RequestError::InvalidField {
            field_id: layout.base,
            name,
            reason: format!("entry {index} has no name"),
        })?;
        let value = record.next_str().unwrap_or_default();
        pairs.insert(key.to_owned(), value.to_owned());
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use crate::catalog::{sample_definition, DirectoryCatalog, ReportCatalog};
    use crate::config::SchedulerConfig;
    use crate::connector::Broadcaster;
    use crate::logging::quiet_logger;
    use crate::notifications::{
        FanOut, MailSender, NotificationError, NotificationStore, OutgoingMail,
    };
    use crate::renderer::RenderFormat;
    use crate::results::tests::test_renderer;
    use crate::results::ResultStore;
    use crate::scheduler::{JobType, ReportExecutor, Scheduler};
    use crate::storage::TempStorage;
    use crate::wire::codec::{DecodeStatus, WireCodec};
    use crate::wire::message::Message;
    use crate::wire::protocol::{
        CMD_GET_NXCP_CAPS, CMD_KEEPALIVE, CMD_NXCP_CAPS, CMD_REQUEST_COMPLETED,
        CMD_RS_ADD_REPORT_NOTIFY, CMD_RS_DELETE_RESULT, CMD_RS_DELETE_SCHEDULE,
        CMD_RS_GET_REPORT_DEFINITION, CMD_RS_LIST_REPORTS, CMD_RS_LIST_RESULTS,
        CMD_RS_LIST_SCHEDULES, CMD_RS_NOTIFY, CMD_RS_RENDER_RESULT, CMD_RS_SCHEDULE_EXECUTION,
        PROTOCOL_VERSION, RCC_INVALID_ARGUMENT, RCC_INVALID_OBJECT_ID, RCC_NOT_IMPLEMENTED,
        RCC_SUCCESS, RS_RESULTS_MODIFIED, RS_SCHEDULES_MODIFIED, VID_COMMENTS, VID_DAY_OF_MONTH,
        VID_DAY_OF_WEEK, VID_FILE_DATA, VID_FILE_SIZE, VID_JOB_ID, VID_LOCALE, VID_NAME,
        VID_NOTIFICATION_CODE, VID_NUM_COLUMNS, VID_NUM_ITEMS, VID_RCC, VID_RENDER_FORMAT,
        VID_REPORT_DEFINITION, VID_RS_JOB_TYPE, VID_RS_REPORT_NAME, VID_TIMESTAMP, VID_USER_ID,
    };
    use crate::wire::records::{write_list, ListReader, PARAMETER_LIST, ROW_LIST, UUID_LIST};

    use super::SessionDispatcher;

    #[derive(Default)]
    struct CapturingBroadcaster {
        codes: Mutex<Vec<u32>>,
    }

    impl Broadcaster for CapturingBroadcaster {
        fn send_broadcast(&self, message: &Message) {
            assert_eq!(message.code, CMD_RS_NOTIFY);
            if let Some(code) = message.get_u32(VID_NOTIFICATION_CODE) {
                self.codes
                    .lock()
                    .expect("codes lock should work")
                    .push(code);
            }
        }
    }

    impl CapturingBroadcaster {
        fn codes(&self) -> Vec<u32> {
            self.codes.lock().expect("codes lock should work").clone()
        }
    }

    struct NullSender;

    impl MailSender for NullSender {
        fn send(&self, _mail: &OutgoingMail) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: SessionDispatcher,
        scheduler: Arc<Scheduler>,
        notifications: Arc<NotificationStore>,
        broadcaster: Arc<CapturingBroadcaster>,
        report_id: Uuid,
        next_id: u32,
        _temp: TempStorage,
    }

    impl Fixture {
        fn new(label: &str) -> Self {
            let temp = TempStorage::new(label);
            let storage = temp.open();
            let mut definition = sample_definition("Alarm history");
            definition.translations.insert(
                "de".to_owned(),
                BTreeMap::from([
                    ("Alarm history".to_owned(), "Alarmverlauf".to_owned()),
                    ("Start date".to_owned(), "Startdatum".to_owned()),
                ]),
            );
            let report_id = definition.id;
            let catalog: Arc<dyn ReportCatalog> =
                Arc::new(DirectoryCatalog::from_definitions(vec![definition]));
            let renderer = test_renderer();
            let results = Arc::new(ResultStore::new(
                Arc::clone(&storage),
                renderer.clone(),
                quiet_logger(),
            ));
            let notifications = Arc::new(NotificationStore::new(storage.clone(), quiet_logger()));
            let fanout = Arc::new(FanOut::new(
                Arc::clone(&notifications),
                Arc::clone(&results),
                Arc::new(NullSender),
                quiet_logger(),
            ));
            let broadcaster = Arc::new(CapturingBroadcaster::default());
            let executor = ReportExecutor::new(
                Arc::clone(&catalog),
                renderer,
                Arc::clone(&results),
                fanout,
                broadcaster.clone(),
                quiet_logger(),
                "en",
            );
            let scheduler = Arc::new(
                Scheduler::new(
                    SchedulerConfig {
                        execution_threads: 2,
                        queue_capacity: 16,
                        max_idle_wait_ms: 50,
                        utc_offset_minutes: 0,
                    },
                    storage,
                    Arc::new(executor),
                    quiet_logger(),
                )
                .expect("scheduler should build"),
            );
            scheduler.start().expect("scheduler should start");

            let dispatcher = SessionDispatcher::new(
                catalog,
                Arc::clone(&scheduler),
                results,
                Arc::clone(&notifications),
                broadcaster.clone(),
                quiet_logger(),
                "en",
            );
            Self {
                dispatcher,
                scheduler,
                notifications,
                broadcaster,
                report_id,
                next_id: 1,
                _temp: temp,
            }
        }

        fn request(&mut self, code: u16) -> Message {
            self.next_id += 1;
            Message::new(code, self.next_id)
        }

        fn call(&self, request: &Message) -> Message {
            let reply = self.dispatcher.dispatch(request);
            assert_eq!(reply.id, request.id, "reply must reuse the request id");
            reply
        }

        fn weekly_request(&mut self, job_id: Uuid, user_id: u32, comments: &str) -> Message {
            self.request(CMD_RS_SCHEDULE_EXECUTION)
                .with(VID_REPORT_DEFINITION, self.report_id)
                .with(VID_JOB_ID, job_id)
                .with(VID_RS_JOB_TYPE, JobType::Weekly.as_wire())
                .with(
                    VID_TIMESTAMP,
                    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
                        .single()
                        .expect("valid start time"),
                )
                .with(VID_DAY_OF_WEEK, 0b0010101_u32)
                .with(VID_DAY_OF_MONTH, 0_u32)
                .with(VID_USER_ID, user_id)
                .with(VID_COMMENTS, comments)
        }

        fn listed_result_jobs(&mut self) -> Vec<Uuid> {
            let request = self
                .request(CMD_RS_LIST_RESULTS)
                .with(VID_REPORT_DEFINITION, self.report_id);
            let reply = self.call(&request);
            assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
            ListReader::new(&reply, ROW_LIST)
                .records()
                .filter_map(|mut record| record.next_uuid())
                .collect()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.scheduler.stop();
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn capability_negotiation_is_a_control_exchange() {
        let mut fixture = Fixture::new("dispatch-caps");
        let request = Message::control(CMD_GET_NXCP_CAPS, 41, 0);
        let reply = fixture.call(&request);
        assert!(reply.is_control());
        assert_eq!(reply.code, CMD_NXCP_CAPS);
        assert_eq!(reply.control_value(), Some(PROTOCOL_VERSION));

        let keepalive = fixture.request(CMD_KEEPALIVE);
        let reply = fixture.call(&keepalive);
        assert_eq!(reply.code, CMD_REQUEST_COMPLETED);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
    }

    #[test]
    fn unknown_commands_are_not_implemented() {
        let fixture = Fixture::new("dispatch-unknown");
        let reply = fixture.call(&Message::new(0x7777, 5));
        assert_eq!(reply.code, CMD_REQUEST_COMPLETED);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_NOT_IMPLEMENTED));

        let reply = fixture.call(&Message::control(CMD_RS_LIST_REPORTS, 6, 0));
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_NOT_IMPLEMENTED));
    }

    #[test]
    fn lists_reports_and_localizes_definitions() {
        let mut fixture = Fixture::new("dispatch-definitions");
        let request = fixture.request(CMD_RS_LIST_REPORTS);
        let reply = fixture.call(&request);
        let ids: Vec<Uuid> = ListReader::new(&reply, UUID_LIST)
            .records()
            .filter_map(|mut record| record.next_uuid())
            .collect();
        assert_eq!(ids, vec![fixture.report_id]);

        let request = fixture
            .request(CMD_RS_GET_REPORT_DEFINITION)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_LOCALE, "de_AT");
        let reply = fixture.call(&request);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
        assert_eq!(reply.get_str(VID_NAME), Some("Alarmverlauf"));
        assert_eq!(reply.get_u32(VID_NUM_COLUMNS), Some(2));
        let parameters = ListReader::new(&reply, PARAMETER_LIST);
        assert_eq!(parameters.len(), 1);
        let mut parameter = parameters
            .records()
            .next()
            .expect("one parameter should be listed");
        assert_eq!(parameter.next_str(), Some("from"));
        assert_eq!(parameter.next_str(), Some("timestamp"));
        assert_eq!(parameter.next_i64(), Some(0));
        assert_eq!(parameter.next_str(), Some("Startdatum"));

        let request = fixture
            .request(CMD_RS_GET_REPORT_DEFINITION)
            .with(VID_REPORT_DEFINITION, Uuid::new_v4());
        assert_eq!(
            fixture.call(&request).get_u32(VID_RCC),
            Some(RCC_INVALID_OBJECT_ID)
        );
    }

    #[test]
    fn invalid_requests_have_no_side_effects() {
        let mut fixture = Fixture::new("dispatch-invalid");
        let missing_report = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_RS_JOB_TYPE, JobType::Daily.as_wire());
        assert_eq!(
            fixture.call(&missing_report).get_u32(VID_RCC),
            Some(RCC_INVALID_ARGUMENT)
        );

        let job_id = Uuid::new_v4();
        let mut bad_mask = fixture.weekly_request(job_id, 3, "");
        bad_mask.set(VID_DAY_OF_WEEK, 0_u32);
        let reply = fixture.call(&bad_mask);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_INVALID_ARGUMENT));
        assert!(!reply.contains(VID_JOB_ID));

        let wrong_type = fixture
            .request(CMD_RS_LIST_RESULTS)
            .with(VID_REPORT_DEFINITION, "not-a-uuid");
        assert_eq!(
            fixture.call(&wrong_type).get_u32(VID_RCC),
            Some(RCC_INVALID_ARGUMENT)
        );

        let unknown_report = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_REPORT_DEFINITION, Uuid::new_v4());
        assert_eq!(
            fixture.call(&unknown_report).get_u32(VID_RCC),
            Some(RCC_INVALID_OBJECT_ID)
        );

        let bad_recipient = fixture
            .request(CMD_RS_ADD_REPORT_NOTIFY)
            .with(VID_JOB_ID, job_id)
            .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire())
            .with(VID_NUM_ITEMS, 2_u32)
            .with(ROW_LIST.base, "ops@example.com")
            .with(ROW_LIST.base + 1, "not an address");
        assert_eq!(
            fixture.call(&bad_recipient).get_u32(VID_RCC),
            Some(RCC_INVALID_ARGUMENT)
        );

        assert!(fixture
            .scheduler
            .list_schedules(fixture.report_id, 0)
            .is_empty());
        assert!(fixture
            .notifications
            .load(job_id)
            .expect("load should work")
            .is_empty());
        assert!(fixture.broadcaster.codes().is_empty());
    }

    #[test]
    fn list_counts_and_names_from_peers_are_validated() {
        let mut fixture = Fixture::new("dispatch-hostile-lists");
        let job_id = Uuid::new_v4();

        let huge_recipients = fixture
            .request(CMD_RS_ADD_REPORT_NOTIFY)
            .with(VID_JOB_ID, job_id)
            .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire())
            .with(VID_NUM_ITEMS, u32::MAX)
            .with(ROW_LIST.base, "ops@example.com");
        assert_eq!(
            fixture.call(&huge_recipients).get_u32(VID_RCC),
            Some(RCC_INVALID_ARGUMENT)
        );

        let huge_parameters = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(PARAMETER_LIST.count_field, u32::MAX)
            .with(PARAMETER_LIST.base, "from");
        let reply = fixture.call(&huge_parameters);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_INVALID_ARGUMENT));
        assert!(!reply.contains(VID_JOB_ID));

        let header_injection = fixture
            .request(CMD_RS_ADD_REPORT_NOTIFY)
            .with(VID_JOB_ID, job_id)
            .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire())
            .with(VID_RS_REPORT_NAME, "x\"\r\nBcc: victim@example.com")
            .with(VID_NUM_ITEMS, 1_u32)
            .with(ROW_LIST.base, "ops@example.com");
        assert_eq!(
            fixture.call(&header_injection).get_u32(VID_RCC),
            Some(RCC_INVALID_ARGUMENT)
        );

        assert!(fixture
            .notifications
            .load(job_id)
            .expect("load should work")
            .is_empty());
    }

    #[test]
    fn maximum_cardinality_schedule_listing_round_trips_over_the_codec() {
        let mut fixture = Fixture::new("dispatch-list-max");
        let codec = WireCodec::default();
        let mut expected = BTreeMap::new();
        for index in 0..64_u32 {
            let job_id = Uuid::new_v4();
            let comments = format!("weekly digest #{index} {}", "x".repeat(index as usize));
            let request = fixture.weekly_request(job_id, 100 + index, &comments);
            let reply = fixture.call(&request);
            assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
            assert_eq!(reply.get_uuid(VID_JOB_ID), Some(job_id));
            expected.insert(job_id, (100 + index, comments));
        }

        let request = fixture
            .request(CMD_RS_LIST_SCHEDULES)
            .with(VID_REPORT_DEFINITION, fixture.report_id);
        let reply = fixture.call(&request);
        let frame = codec.encode(&reply).expect("reply should encode");
        let DecodeStatus::Complete(decoded) = codec.decode(&frame).expect("reply should decode")
        else {
            panic!("whole frame should decode");
        };
        assert!(decoded.field_errors.is_empty());

        let listing = ListReader::new(&decoded.message, ROW_LIST);
        assert_eq!(listing.len(), expected.len());
        let mut seen = 0;
        for mut record in listing.records() {
            let job_id = record.next_uuid().expect("job id should be listed");
            let (user_id, comments) = expected.get(&job_id).expect("listed job should exist");
            assert_eq!(record.next_uuid(), Some(fixture.report_id));
            assert_eq!(record.next_u32(), Some(*user_id));
            assert_eq!(record.next_u32(), Some(JobType::Weekly.as_wire()));
            assert!(record.next_timestamp().is_some());
            assert_eq!(record.next_u32(), Some(0b0010101));
            assert_eq!(record.next_u32(), Some(0));
            assert_eq!(record.next_str(), Some(comments.as_str()));
            assert!(record.next_timestamp().is_some());
            seen += 1;
        }
        assert_eq!(seen, expected.len());

        let own = fixture
            .request(CMD_RS_LIST_SCHEDULES)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_USER_ID, 100_u32);
        assert_eq!(ListReader::new(&fixture.call(&own), ROW_LIST).len(), 1);
    }

    #[test]
    fn delete_schedule_cascades_notifications_and_broadcasts() {
        let mut fixture = Fixture::new("dispatch-delete-schedule");
        let job_id = Uuid::new_v4();
        let request = fixture.weekly_request(job_id, 4, "weekly");
        assert_eq!(fixture.call(&request).get_u32(VID_RCC), Some(RCC_SUCCESS));

        let mut notify = fixture
            .request(CMD_RS_ADD_REPORT_NOTIFY)
            .with(VID_JOB_ID, job_id)
            .with(VID_RENDER_FORMAT, RenderFormat::Xls.as_wire())
            .with(VID_RS_REPORT_NAME, "Alarm history");
        write_list(
            &mut notify,
            ROW_LIST,
            &["ops@example.com".to_owned(), "noc@example.com".to_owned()],
            |recipient, record| {
                record.push(recipient.as_str());
            },
        )
        .expect("recipient list should fit");
        let reply = fixture.call(&notify);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
        assert_eq!(reply.get_u32(VID_NUM_ITEMS), Some(2));
        assert_eq!(
            fixture.notifications.load(job_id).expect("load should work").len(),
            2
        );

        let delete = fixture
            .request(CMD_RS_DELETE_SCHEDULE)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_JOB_ID, job_id);
        assert_eq!(fixture.call(&delete).get_u32(VID_RCC), Some(RCC_SUCCESS));
        assert!(fixture
            .notifications
            .load(job_id)
            .expect("load should work")
            .is_empty());
        assert!(fixture.scheduler.list_schedules(fixture.report_id, 0).is_empty());

        let again = fixture
            .request(CMD_RS_DELETE_SCHEDULE)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_JOB_ID, job_id);
        assert_eq!(fixture.call(&again).get_u32(VID_RCC), Some(RCC_SUCCESS));
        assert_eq!(
            fixture.broadcaster.codes(),
            vec![RS_SCHEDULES_MODIFIED, RS_SCHEDULES_MODIFIED]
        );
    }

    #[test]
    fn immediate_execution_lifecycle() {
        let mut fixture = Fixture::new("dispatch-lifecycle");
        let schedule = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_TIMESTAMP, 0_i64)
            .with(VID_USER_ID, 7_u32);
        let reply = fixture.call(&schedule);
        assert_eq!(reply.get_u32(VID_RCC), Some(RCC_SUCCESS));
        let job_id = reply.get_uuid(VID_JOB_ID).expect("job id should be returned");
        assert!(fixture
            .scheduler
            .list_schedules(fixture.report_id, 0)
            .is_empty());

        assert!(wait_until(|| fixture.listed_result_jobs().contains(&job_id)));

        let render = |fixture: &mut Fixture| {
            let request = fixture
                .request(CMD_RS_RENDER_RESULT)
                .with(VID_REPORT_DEFINITION, fixture.report_id)
                .with(VID_JOB_ID, job_id)
                .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire());
            fixture.call(&request)
        };
        let first = render(&mut fixture);
        let second = render(&mut fixture);
        assert_eq!(first.get_u32(VID_RCC), Some(RCC_SUCCESS));
        let bytes = first.get_bytes(VID_FILE_DATA).expect("rendered bytes");
        assert!(!bytes.is_empty());
        assert_eq!(first.get_i64(VID_FILE_SIZE), Some(bytes.len() as i64));
        assert_eq!(second.get_bytes(VID_FILE_DATA), Some(bytes));

        let delete = fixture
            .request(CMD_RS_DELETE_RESULT)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_JOB_ID, job_id);
        assert_eq!(fixture.call(&delete).get_u32(VID_RCC), Some(RCC_SUCCESS));
        assert!(!fixture.listed_result_jobs().contains(&job_id));
        let delete_again = fixture
            .request(CMD_RS_DELETE_RESULT)
            .with(VID_REPORT_DEFINITION, fixture.report_id)
            .with(VID_JOB_ID, job_id);
        assert_eq!(
            fixture.call(&delete_again).get_u32(VID_RCC),
            Some(RCC_SUCCESS)
        );

        assert_eq!(
            render(&mut fixture).get_u32(VID_RCC),
            Some(RCC_INVALID_OBJECT_ID)
        );
        assert_eq!(
            fixture.broadcaster.codes(),
            vec![RS_RESULTS_MODIFIED, RS_RESULTS_MODIFIED]
        );
    }

    #[test]
    fn concurrent_immediate_executions_get_distinct_jobs_and_results() {
        let mut fixture = Fixture::new("dispatch-concurrent");
        let first = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_REPORT_DEFINITION, fixture.report_id);
        let second = fixture
            .request(CMD_RS_SCHEDULE_EXECUTION)
            .with(VID_REPORT_DEFINITION, fixture.report_id);

        let (a, b) = std::thread::scope(|scope| {
            let a = scope.spawn(|| fixture.dispatcher.dispatch(&first));
            let b = scope.spawn(|| fixture.dispatcher.dispatch(&second));
            (
                a.join().expect("first dispatch should finish"),
                b.join().expect("second dispatch should finish"),
            )
        });
        let a = a.get_uuid(VID_JOB_ID).expect("first job id");
        let b = b.get_uuid(VID_JOB_ID).expect("second job id");
        assert_ne!(a, b);

        assert!(wait_until(|| {
            let listed = fixture.listed_result_jobs();
            listed.contains(&a) && listed.contains(&b)
        }));
    }
}
