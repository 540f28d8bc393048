use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::renderer::RenderFormat;
use crate::scheduler::JobType;
use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};
use crate::wire::message::{Body, FieldValue, Message};
use crate::wire::protocol::{
    command_name, CMD_GET_NXCP_CAPS, CMD_KEEPALIVE, CMD_NXCP_CAPS, CMD_RS_ADD_REPORT_NOTIFY,
    CMD_RS_DELETE_RESULT, CMD_RS_DELETE_SCHEDULE, CMD_RS_GET_REPORT_DEFINITION,
    CMD_RS_LIST_REPORTS, CMD_RS_LIST_RESULTS, CMD_RS_LIST_SCHEDULES, CMD_RS_NOTIFY,
    CMD_RS_RENDER_RESULT, CMD_RS_SCHEDULE_EXECUTION, PUSH_CORRELATION_ID, RCC_NOT_IMPLEMENTED,
    RCC_SUCCESS, VID_COMMENTS, VID_DAY_OF_WEEK, VID_FILE_DATA, VID_JOB_ID, VID_LOCALE,
    VID_RCC, VID_RENDER_FORMAT, VID_REPORT_DEFINITION, VID_RS_JOB_TYPE, VID_RS_REPORT_NAME,
    VID_TIMESTAMP, VID_USER_ID,
};
use crate::wire::records::{write_list, ListReader, PARAMETER_LIST, ROW_LIST, UUID_LIST};

const COLOR_HEADER: &str = "\x1b[38;5;214m";
const COLOR_OUT: &str = "\x1b[38;5;81m";
const COLOR_IN: &str = "\x1b[38;5;120m";
const COLOR_ERROR: &str = "\x1b[38;5;196m";
const COLOR_DIM: &str = "\x1b[2;90m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const RESULT_WAIT: Duration = Duration::from_secs(10);
const SCENARIO_REPORT_ID: &str = "8f0c7c9e-41b4-4a6f-9a55-5e4b3f4a0d11";
const SCENARIO_DEFINITION: &str = r#"id = "8f0c7c9e-41b4-4a6f-9a55-5e4b3f4a0d11"
name = "Self-debug availability"
number_of_columns = 2

[[parameters]]
name = "from"
type = "timestamp"
index = 0
description = "Start date"

[[parameters]]
name = "node"
type = "object"
index = 1
description = "Node"
depends_on = "from"

[translations.de]
"Self-debug availability" = "Selbsttest Verfuegbarkeit"
"Start date" = "Startdatum"
"#;

#[derive(Debug)]
pub enum SelfDebugError {
    Io(std::io::Error),
    Encode(CodecError),
    Decode(CodecError),
    Timeout { request_id: u32 },
    UnexpectedReply {
        command: &'static str,
        expected: u32,
        actual: Option<u32>,
    },
    MissingField(&'static str),
    Scenario(String),
}

impl fmt::Display for SelfDebugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "io error: {source}"),
            Self::Encode(source) => write!(f, "encode error: {source}"),
            Self::Decode(source) => write!(f, "decode error: {source}"),
            Self::Timeout { request_id } => {
                write!(f, "no reply for request {request_id} within {REPLY_TIMEOUT:?}")
            }
            Self::UnexpectedReply {
                command,
                expected,
                actual,
            } => write!(
                f,
                "{command} replied with result code {actual:?}, expected {expected}"
            ),
            Self::MissingField(field) => write!(f, "reply is missing expected field '{field}'"),
            Self::Scenario(message) => write!(f, "scenario check failed: {message}"),
        }
    }
}

impl std::error::Error for SelfDebugError {}

impl From<std::io::Error> for SelfDebugError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeFlags {
    pub enabled: bool,
    pub keep_artifacts: bool,
}

pub fn extract_runtime_flags(args: Vec<String>) -> (RuntimeFlags, Vec<String>) {
    let mut flags = RuntimeFlags::default();
    let mut config_args = Vec::new();

    for arg in args {
        if arg == "--self-debug" {
            flags.enabled = true;
        } else if arg == "--self-debug-keep-artifacts" {
            flags.keep_artifacts = true;
        } else {
            config_args.push(arg);
        }
    }

    (flags, config_args)
}

pub fn resolve_storage_path(config: &AppConfig) -> String {
    match config.storage.self_debug_path.as_deref() {
        Some(path) if !path.trim().is_empty() => path.to_owned(),
        _ => format!("{}-self-debug", config.storage.path),
    }
}

/// Points storage, definitions and the mail spool at a scratch area below
/// `root` and deploys the scenario report there.
pub fn prepare_config(config: &mut AppConfig, root: &Path) -> Result<(), SelfDebugError> {
    let definitions = root.join("definitions");
    fs::create_dir_all(&definitions)?;
    fs::write(definitions.join("self-debug.toml"), SCENARIO_DEFINITION)?;

    config.storage.path = root.join("data").to_string_lossy().to_string();
    config.reports.definitions_path = definitions.to_string_lossy().to_string();
    config.notifications.spool_path = root.join("outbox").to_string_lossy().to_string();
    Ok(())
}

pub fn cleanup_artifacts(path: &Path) -> Result<(), SelfDebugError> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

pub fn spawn_runner(addr: SocketAddr, codec: WireCodec) -> Receiver<Result<(), SelfDebugError>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = run_self_debug(addr, codec);
        if let Err(error) = &result {
            println!("{COLOR_ERROR}self-debug failed: {error}{RESET}");
        }
        let _ = tx.send(result);
    });
    rx
}

/// Request/reply client that matches replies by correlation id and skips
/// server pushes.
pub struct SelfDebugClient {
    stream: TcpStream,
    codec: WireCodec,
    frames: FrameBuffer,
    next_id: u32,
    pushes: Vec<Message>,
    verbose: bool,
}

impl SelfDebugClient {
    pub fn connect(addr: SocketAddr, codec: WireCodec, verbose: bool) -> Result<Self, SelfDebugError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_millis(200)))?;
        stream.set_write_timeout(Some(REPLY_TIMEOUT))?;
        Ok(Self {
            stream,
            codec,
            frames: FrameBuffer::new(),
            next_id: 0,
            pushes: Vec::new(),
            verbose,
        })
    }

    pub fn request(&mut self, code: u16) -> Message {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        Message::new(code, self.next_id)
    }

    pub fn pushes(&self) -> &[Message] {
        &self.pushes
    }

    pub fn call(&mut self, request: &Message) -> Result<Message, SelfDebugError> {
        self.print("OUT", request, COLOR_OUT);
        let frame = self.codec.encode(request).map_err(SelfDebugError::Encode)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            while let Some(decoded) = self
                .frames
                .next_message(&self.codec)
                .map_err(SelfDebugError::Decode)?
            {
                let message = decoded.message;
                if message.code == CMD_RS_NOTIFY && message.id == PUSH_CORRELATION_ID {
                    self.print("PSH", &message, COLOR_DIM);
                    self.pushes.push(message);
                    continue;
                }
                self.print("IN ", &message, COLOR_IN);
                if message.id == request.id {
                    return Ok(message);
                }
            }

            if Instant::now() >= deadline {
                return Err(SelfDebugError::Timeout {
                    request_id: request.id,
                });
            }
            let mut chunk = [0_u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(SelfDebugError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )))
                }
                Ok(read) => self.frames.extend(&chunk[..read]),
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Sends the request and insists on the given result code.
    pub fn expect(&mut self, request: &Message, rcc: u32) -> Result<Message, SelfDebugError> {
        let reply = self.call(request)?;
        let actual = reply.get_u32(VID_RCC);
        if actual != Some(rcc) {
            return Err(SelfDebugError::UnexpectedReply {
                command: command_name(request.code),
                expected: rcc,
                actual,
            });
        }
        Ok(reply)
    }

    fn print(&self, label: &str, message: &Message, color: &str) {
        if self.verbose {
            println!(
                "{color}[{label}] {BOLD}{}{RESET}{color} {}{RESET}",
                command_name(message.code),
                message_to_json(message)
            );
        }
    }
}

pub fn run_self_debug(addr: SocketAddr, codec: WireCodec) -> Result<(), SelfDebugError> {
    println!("{COLOR_HEADER}========== SELF DEBUG MODE =========={RESET}");
    println!("{COLOR_DIM}connecting to local reportd server at {addr}{RESET}");
    let mut client = SelfDebugClient::connect(addr, codec, true)?;
    run_scenario(&mut client)?;
    println!("{COLOR_HEADER}====== SELF DEBUG MODE COMPLETE ======{RESET}");
    Ok(())
}

pub fn run_scenario(client: &mut SelfDebugClient) -> Result<(), SelfDebugError> {
    let caps = Message::control(CMD_GET_NXCP_CAPS, client.request(CMD_GET_NXCP_CAPS).id, 0);
    let reply = client.call(&caps)?;
    if reply.code != CMD_NXCP_CAPS || reply.control_value().is_none() {
        return Err(SelfDebugError::Scenario(
            "capability negotiation did not return a control reply".to_owned(),
        ));
    }

    let keepalive = client.request(CMD_KEEPALIVE);
    client.expect(&keepalive, RCC_SUCCESS)?;
    let unknown = client.request(0x7FFF);
    client.expect(&unknown, RCC_NOT_IMPLEMENTED)?;

    let list_reports = client.request(CMD_RS_LIST_REPORTS);
    let reply = client.expect(&list_reports, RCC_SUCCESS)?;
    let report_id = scenario_report_id()?;
    let listed = ListReader::new(&reply, UUID_LIST)
        .records()
        .filter_map(|mut record| record.next_uuid())
        .any(|id| id == report_id);
    if !listed {
        return Err(SelfDebugError::Scenario(format!(
            "report {report_id} is not deployed"
        )));
    }

    let definition = client
        .request(CMD_RS_GET_REPORT_DEFINITION)
        .with(VID_REPORT_DEFINITION, report_id)
        .with(VID_LOCALE, "de");
    let reply = client.expect(&definition, RCC_SUCCESS)?;
    if ListReader::new(&reply, PARAMETER_LIST).len() != 2 {
        return Err(SelfDebugError::Scenario(
            "definition should list two parameters".to_owned(),
        ));
    }

    let scheduled_job = Uuid::new_v4();
    let mut weekly = client
        .request(CMD_RS_SCHEDULE_EXECUTION)
        .with(VID_REPORT_DEFINITION, report_id)
        .with(VID_JOB_ID, scheduled_job)
        .with(VID_RS_JOB_TYPE, JobType::Weekly.as_wire())
        .with(VID_TIMESTAMP, chrono::Utc::now())
        .with(VID_DAY_OF_WEEK, 0b0010101_u32)
        .with(VID_USER_ID, 1_u32)
        .with(VID_COMMENTS, "self-debug weekly");
    write_parameters(&mut weekly)?;
    client.expect(&weekly, RCC_SUCCESS)?;

    let mut notify = client
        .request(CMD_RS_ADD_REPORT_NOTIFY)
        .with(VID_JOB_ID, scheduled_job)
        .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire())
        .with(VID_RS_REPORT_NAME, "Self-debug availability");
    write_list(
        &mut notify,
        ROW_LIST,
        &["ops@example.invalid".to_owned()],
        |recipient, record| {
            record.push(recipient.as_str());
        },
    )
    .map_err(|error| SelfDebugError::Scenario(error.to_string()))?;
    client.expect(&notify, RCC_SUCCESS)?;

    let schedules = client
        .request(CMD_RS_LIST_SCHEDULES)
        .with(VID_REPORT_DEFINITION, report_id);
    let reply = client.expect(&schedules, RCC_SUCCESS)?;
    if !listed_ids(&reply).contains(&scheduled_job) {
        return Err(SelfDebugError::Scenario(
            "weekly schedule is not listed".to_owned(),
        ));
    }

    let delete_schedule = client
        .request(CMD_RS_DELETE_SCHEDULE)
        .with(VID_REPORT_DEFINITION, report_id)
        .with(VID_JOB_ID, scheduled_job);
    client.expect(&delete_schedule, RCC_SUCCESS)?;

    let mut execute = client
        .request(CMD_RS_SCHEDULE_EXECUTION)
        .with(VID_REPORT_DEFINITION, report_id)
        .with(VID_USER_ID, 1_u32);
    write_parameters(&mut execute)?;
    let reply = client.expect(&execute, RCC_SUCCESS)?;
    let job_id = reply
        .get_uuid(VID_JOB_ID)
        .ok_or(SelfDebugError::MissingField("JOB_ID"))?;

    let deadline = Instant::now() + RESULT_WAIT;
    loop {
        let results = client
            .request(CMD_RS_LIST_RESULTS)
            .with(VID_REPORT_DEFINITION, report_id);
        let reply = client.expect(&results, RCC_SUCCESS)?;
        if listed_ids(&reply).contains(&job_id) {
            break;
        }
        if Instant::now() >= deadline {
            return Err(SelfDebugError::Scenario(format!(
                "result of job {job_id} did not appear"
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let mut rendered = Vec::new();
    for _ in 0..2 {
        let render = client
            .request(CMD_RS_RENDER_RESULT)
            .with(VID_REPORT_DEFINITION, report_id)
            .with(VID_JOB_ID, job_id)
            .with(VID_RENDER_FORMAT, RenderFormat::Pdf.as_wire());
        let reply = client.expect(&render, RCC_SUCCESS)?;
        let bytes = reply
            .get_bytes(VID_FILE_DATA)
            .ok_or(SelfDebugError::MissingField("FILE_DATA"))?;
        rendered.push(bytes.to_vec());
    }
    if rendered[0].is_empty() || rendered[0] != rendered[1] {
        return Err(SelfDebugError::Scenario(
            "repeated renders differ".to_owned(),
        ));
    }

    for _ in 0..2 {
        let delete = client
            .request(CMD_RS_DELETE_RESULT)
            .with(VID_REPORT_DEFINITION, report_id)
            .with(VID_JOB_ID, job_id);
        client.expect(&delete, RCC_SUCCESS)?;
    }

    let results = client
        .request(CMD_RS_LIST_RESULTS)
        .with(VID_REPORT_DEFINITION, report_id);
    let reply = client.expect(&results, RCC_SUCCESS)?;
    if listed_ids(&reply).contains(&job_id) {
        return Err(SelfDebugError::Scenario(format!(
            "result of job {job_id} is still listed after delete"
        )));
    }

    println!(
        "{COLOR_DIM}pushes observed during scenario: {}{RESET}",
        client.pushes().len()
    );
    Ok(())
}

fn scenario_report_id() -> Result<Uuid, SelfDebugError> {
    Uuid::parse_str(SCENARIO_REPORT_ID).map_err(|error| SelfDebugError::Scenario(error.to_string()))
}

fn write_parameters(message: &mut Message) -> Result<(), SelfDebugError> {
    let parameters = [
        ("from".to_owned(), chrono::Utc::now().format("%Y-%m-%d").to_string()),
        ("node".to_owned(), "self-debug".to_owned()),
    ];
    write_list(message, PARAMETER_LIST, &parameters, |(name, value), record| {
        record.push(name.as_str()).push(value.as_str());
    })
    .map_err(|error| SelfDebugError::Scenario(error.to_string()))?;
    Ok(())
}

fn listed_ids(reply: &Message) -> Vec<Uuid> {
    ListReader::new(reply, ROW_LIST)
        .records()
        .filter_map(|mut record| record.next_uuid())
        .collect()
}

fn message_to_json(message: &Message) -> Value {
    let body = match &message.body {
        Body::Control(value) => json!({ "control": value }),
        Body::Fields(_) => {
            let mut fields = Map::new();
            for (field_id, value) in message.fields() {
                fields.insert(field_id.to_string(), field_to_json(value));
            }
            Value::Object(fields)
        }
    };
    json!({ "id": message.id, "body": body })
}

fn field_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Int16(v) => json!(v),
        FieldValue::UInt16(v) => json!(v),
        FieldValue::Int32(v) => json!(v),
        FieldValue::UInt32(v) => json!(v),
        FieldValue::Int64(v) => json!(v),
        FieldValue::UInt64(v) => json!(v),
        FieldValue::Float(v) => json!(v),
        FieldValue::String(v) => json!(v),
        FieldValue::Binary(v) => json!({ "binary_bytes": v.len() }),
        FieldValue::Uuid(v) => json!(v.to_string()),
        FieldValue::Timestamp(v) => json!(v.to_rfc3339()),
    }
}
