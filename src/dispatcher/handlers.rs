use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::logging::LogLevel;
use crate::notifications::NotificationError;
use crate::renderer::RenderFormat;
use crate::scheduler::{JobType, RecurringSchedule, SchedulerError};
use crate::wire::message::Message;
use crate::wire::protocol::{
    RS_RESULTS_MODIFIED, RS_SCHEDULES_MODIFIED, VID_COMMENTS, VID_DAY_OF_MONTH, VID_DAY_OF_WEEK,
    VID_FILE_DATA, VID_FILE_SIZE, VID_JOB_ID, VID_LOCALE, VID_NAME, VID_NUM_COLUMNS,
    VID_NUM_ITEMS, VID_RENDER_FORMAT, VID_REPORT_DEFINITION, VID_RS_JOB_TYPE, VID_RS_REPORT_NAME,
    VID_TIMESTAMP, VID_USER_ID,
};
use crate::wire::records::{write_list, PARAMETER_LIST, ROW_LIST, UUID_LIST};

use super::{
    optional_str, optional_u32, optional_uuid, read_string_pairs, request_list, required_u32,
    required_uuid, RequestError, SessionDispatcher,
};

type HandlerResult = Result<(), RequestError>;

fn report_id(request: &Message) -> Result<Uuid, RequestError> {
    required_uuid(request, VID_REPORT_DEFINITION, "REPORT_DEFINITION")
}

fn job_id(request: &Message) -> Result<Uuid, RequestError> {
    required_uuid(request, VID_JOB_ID, "JOB_ID")
}

fn user_id(request: &Message) -> Result<u32, RequestError> {
    Ok(optional_u32(request, VID_USER_ID, "USER_ID")?.unwrap_or(0))
}

fn render_format(request: &Message) -> Result<RenderFormat, RequestError> {
    let raw = required_u32(request, VID_RENDER_FORMAT, "RENDER_FORMAT")?;
    RenderFormat::from_wire(raw).ok_or_else(|| RequestError::InvalidField {
        field_id: VID_RENDER_FORMAT,
        name: "RENDER_FORMAT",
        reason: format!("unknown render format {raw}"),
    })
}

fn list_overflow(error: impl std::fmt::Display) -> RequestError {
    RequestError::internal("list encoding", error)
}

pub(super) fn keepalive(_: &SessionDispatcher, _: &Message, _: &mut Message) -> HandlerResult {
    Ok(())
}

pub(super) fn list_reports(
    dispatcher: &SessionDispatcher,
    _: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let ids = dispatcher.catalog.list_report_ids();
    write_list(reply, UUID_LIST, &ids, |id, record| {
        record.push(*id);
    })
    .map_err(list_overflow)?;
    Ok(())
}

pub(super) fn get_report_definition(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let locale = optional_str(request, VID_LOCALE, "LOCALE")?
        .filter(|locale| !locale.is_empty())
        .unwrap_or(dispatcher.default_locale.as_str());
    let definition = dispatcher
        .catalog
        .get_definition(report_id, locale)
        .ok_or(RequestError::UnknownObject {
            kind: "report",
            id: report_id,
        })?;

    reply.set(VID_REPORT_DEFINITION, definition.id);
    reply.set(VID_NAME, definition.name.as_str());
    reply.set(VID_NUM_COLUMNS, definition.number_of_columns);
    write_list(reply, PARAMETER_LIST, &definition.parameters, |parameter, record| {
        record
            .push(parameter.name.as_str())
            .push(parameter.kind.as_str())
            .push(parameter.index)
            .push(parameter.description.as_str())
            .push(parameter.default_value.clone().unwrap_or_default())
            .push(parameter.depends_on.clone().unwrap_or_default())
            .push(parameter.span);
    })
    .map_err(list_overflow)?;
    Ok(())
}

// Without a trigger type and start time the report runs now under a fresh
// job id; anything else becomes a persisted schedule.
pub(super) fn schedule_execution(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let user_id = user_id(request)?;
    let job_type = match optional_u32(request, VID_RS_JOB_TYPE, "RS_JOB_TYPE")? {
        None => JobType::Execute,
        Some(raw) => JobType::from_wire(raw).ok_or_else(|| RequestError::InvalidField {
            field_id: VID_RS_JOB_TYPE,
            name: "RS_JOB_TYPE",
            reason: format!("unknown job type {raw}"),
        })?,
    };
    let start_time: Option<DateTime<Utc>> = request
        .get(VID_TIMESTAMP)
        .map(|value| {
            value
                .as_timestamp()
                .ok_or_else(|| RequestError::InvalidField {
                    field_id: VID_TIMESTAMP,
                    name: "TIMESTAMP",
                    reason: format!("expected timestamp, got {}", value.type_name()),
                })
        })
        .transpose()?
        .filter(|at| at.timestamp_millis() != 0);
    let parameters = read_string_pairs(request, PARAMETER_LIST, "PARAMETERS")?;

    if dispatcher
        .catalog
        .get_definition(report_id, &dispatcher.default_locale)
        .is_none()
    {
        return Err(RequestError::UnknownObject {
            kind: "report",
            id: report_id,
        });
    }

    if job_type == JobType::Execute && start_time.is_none() {
        let job_id = dispatcher
            .scheduler
            .schedule_once(report_id, user_id, parameters)
            .map_err(|error| RequestError::internal("immediate execution", error))?;
        reply.set(VID_JOB_ID, job_id);
        return Ok(());
    }

    let job_type = if job_type == JobType::Execute {
        JobType::Once
    } else {
        job_type
    };
    let schedule = RecurringSchedule {
        report_id,
        job_id: optional_uuid(request, VID_JOB_ID, "JOB_ID")?.unwrap_or_else(Uuid::new_v4),
        job_type,
        days_of_week: optional_u32(request, VID_DAY_OF_WEEK, "DAY_OF_WEEK")?.unwrap_or(0),
        days_of_month: optional_u32(request, VID_DAY_OF_MONTH, "DAY_OF_MONTH")?.unwrap_or(0),
        start_time,
        parameters,
        user_id,
        comments: optional_str(request, VID_COMMENTS, "COMMENTS")?
            .unwrap_or_default()
            .to_owned(),
    };
    let job = dispatcher
        .scheduler
        .schedule_recurring(schedule)
        .map_err(|error| match error {
            SchedulerError::InvalidTrigger(source) => RequestError::InvalidField {
                field_id: VID_RS_JOB_TYPE,
                name: "RS_JOB_TYPE",
                reason: source.to_string(),
            },
            other => RequestError::internal("schedule persistence", other),
        })?;

    dispatcher.broadcaster.notify(RS_SCHEDULES_MODIFIED);
    reply.set(VID_JOB_ID, job.job_id);
    Ok(())
}

pub(super) fn list_schedules(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let user_id = user_id(request)?;
    let schedules = dispatcher.scheduler.list_schedules(report_id, user_id);

    write_list(reply, ROW_LIST, &schedules, |job, record| {
        record
            .push(job.job_id)
            .push(job.report_id)
            .push(job.user_id)
            .push(job.job_type().as_wire())
            .push(job.trigger.start_time())
            .push(job.trigger.days_of_week())
            .push(job.trigger.days_of_month())
            .push(job.comments.as_str())
            .push(dispatcher.scheduler.next_due(job.job_id).unwrap_or_default());
    })
    .map_err(list_overflow)?;
    Ok(())
}

pub(super) fn delete_schedule(
    dispatcher: &SessionDispatcher,
    request: &Message,
    _: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let job_id = job_id(request)?;

    let removed = dispatcher
        .scheduler
        .delete_schedule(report_id, job_id)
        .map_err(|error| RequestError::internal("schedule delete", error))?;
    dispatcher
        .notifications
        .delete(job_id)
        .map_err(|error| RequestError::internal("notification delete", error))?;

    if removed {
        dispatcher.broadcaster.notify(RS_SCHEDULES_MODIFIED);
    }
    Ok(())
}

pub(super) fn list_results(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let user_id = user_id(request)?;
    let results = dispatcher
        .results
        .list_results(report_id, user_id)
        .map_err(|error| RequestError::internal("result listing", error))?;

    write_list(reply, ROW_LIST, &results, |result, record| {
        record
            .push(result.job_id)
            .push(result.report_id)
            .push(result.user_id)
            .push(result.execution_time)
            .push(result.success);
    })
    .map_err(list_overflow)?;
    Ok(())
}

pub(super) fn render_result(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let job_id = job_id(request)?;
    let format = render_format(request)?;
    if format == RenderFormat::None {
        return Err(RequestError::InvalidField {
            field_id: VID_RENDER_FORMAT,
            name: "RENDER_FORMAT",
            reason: "a result cannot be rendered without a format".to_owned(),
        });
    }

    let rendered = dispatcher
        .results
        .render_result(report_id, job_id, format)
        .map_err(|error| RequestError::internal("result render", error))?
        .ok_or(RequestError::UnknownObject {
            kind: "result",
            id: job_id,
        })?;

    reply.set(VID_JOB_ID, job_id);
    reply.set(VID_RENDER_FORMAT, format.as_wire());
    reply.set(VID_FILE_SIZE, rendered.len() as u64);
    reply.set(VID_FILE_DATA, rendered);
    Ok(())
}

pub(super) fn delete_result(
    dispatcher: &SessionDispatcher,
    request: &Message,
    _: &mut Message,
) -> HandlerResult {
    let report_id = report_id(request)?;
    let job_id = job_id(request)?;

    let removed = dispatcher
        .results
        .delete_result(report_id, job_id)
        .map_err(|error| RequestError::internal("result delete", error))?;
    dispatcher
        .notifications
        .delete(job_id)
        .map_err(|error| RequestError::internal("notification delete", error))?;

    if removed > 0 {
        dispatcher.broadcaster.notify(RS_RESULTS_MODIFIED);
    }
    Ok(())
}

pub(super) fn add_report_notify(
    dispatcher: &SessionDispatcher,
    request: &Message,
    reply: &mut Message,
) -> HandlerResult {
    let job_id = job_id(request)?;
    let format = render_format(request)?;
    let report_name =
        optional_str(request, VID_RS_REPORT_NAME, "RS_REPORT_NAME")?.unwrap_or_default();
    // The name ends up in mail headers.
    if report_name.chars().any(char::is_control) {
        return Err(RequestError::InvalidField {
            field_id: VID_RS_REPORT_NAME,
            name: "RS_REPORT_NAME",
            reason: "control characters are not allowed".to_owned(),
        });
    }

    let listing = request_list(request, ROW_LIST, "NUM_ITEMS")?;
    if listing.is_empty() {
        return Err(RequestError::MissingField {
            field_id: VID_NUM_ITEMS,
            name: "NUM_ITEMS",
        });
    }
    let recipients = listing
        .records()
        .enumerate()
        .map(|(index, mut record)| {
            record
                .next_str()
                .map(|recipient| (recipient.to_owned(), format))
                .ok_or_else(|| RequestError::InvalidField {
                    field_id: ROW_LIST.base,
                    name: "RECIPIENTS",
                    reason: format!("entry {index} is not an address"),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let created = dispatcher
        .notifications
        .create_batch(job_id, &recipients, report_name)
        .map_err(|error| match error {
            NotificationError::InvalidRecipient { recipient } => RequestError::InvalidField {
                field_id: ROW_LIST.base,
                name: "RECIPIENTS",
                reason: format!("'{recipient}' is not a mail address"),
            },
            other => RequestError::internal("notification create", other),
        })?;

    dispatcher.logger.log(
        LogLevel::Debug,
        Some("dispatcher::notify"),
        "Notification subscriptions added",
        Some(json!({
            "job_id": job_id.to_string(),
            "recipients": created.len(),
            "format": format.as_str(),
        })),
    );
    reply.set(VID_NUM_ITEMS, created.len() as u32);
    Ok(())
}
