// Command codes, field ids and completion codes shared by server and clients.

pub const PROTOCOL_VERSION: u32 = 5;

pub const CMD_KEEPALIVE: u16 = 0x0003;
pub const CMD_REQUEST_COMPLETED: u16 = 0x001D;
pub const CMD_GET_NXCP_CAPS: u16 = 0x00B6;
pub const CMD_NXCP_CAPS: u16 = 0x00B7;
pub const CMD_RS_LIST_REPORTS: u16 = 0x1100;
pub const CMD_RS_GET_REPORT_DEFINITION: u16 = 0x1101;
pub const CMD_RS_SCHEDULE_EXECUTION: u16 = 0x1102;
pub const CMD_RS_LIST_RESULTS: u16 = 0x1103;
pub const CMD_RS_RENDER_RESULT: u16 = 0x1104;
pub const CMD_RS_DELETE_RESULT: u16 = 0x1105;
pub const CMD_RS_LIST_SCHEDULES: u16 = 0x1106;
pub const CMD_RS_DELETE_SCHEDULE: u16 = 0x1107;
pub const CMD_RS_ADD_REPORT_NOTIFY: u16 = 0x1108;
pub const CMD_RS_NOTIFY: u16 = 0x1109;

pub const VID_NAME: u32 = 20;
pub const VID_NOTIFICATION_CODE: u32 = 23;
pub const VID_RCC: u32 = 28;
pub const VID_USER_ID: u32 = 35;
pub const VID_COMMENTS: u32 = 82;
pub const VID_TIMESTAMP: u32 = 94;
pub const VID_NUM_ITEMS: u32 = 111;
pub const VID_NUM_PARAMETERS: u32 = 137;
pub const VID_NUM_COLUMNS: u32 = 166;
pub const VID_JOB_ID: u32 = 331;
pub const VID_FILE_SIZE: u32 = 356;
pub const VID_REPORT_DEFINITION: u32 = 390;
pub const VID_RENDER_FORMAT: u32 = 400;
pub const VID_DAY_OF_WEEK: u32 = 448;
pub const VID_DAY_OF_MONTH: u32 = 449;
pub const VID_LOCALE: u32 = 450;
pub const VID_RS_JOB_TYPE: u32 = 451;
pub const VID_RS_REPORT_NAME: u32 = 452;
pub const VID_FILE_DATA: u32 = 453;
pub const VID_LIST_STRIDE: u32 = 454;
pub const VID_PARAM_STRIDE: u32 = 455;
pub const VID_PARAM_LIST_BASE: u32 = 0x1000_0000;
pub const VID_ROW_DATA_BASE: u32 = 0x3000_0000;
pub const VID_UUID_LIST_BASE: u32 = 0x4000_0000;

pub const RCC_SUCCESS: u32 = 0;
pub const RCC_INVALID_OBJECT_ID: u32 = 7;
pub const RCC_INVALID_ARGUMENT: u32 = 12;
pub const RCC_NOT_IMPLEMENTED: u32 = 28;
pub const RCC_INTERNAL_ERROR: u32 = 46;

pub const RS_SCHEDULES_MODIFIED: u32 = 1;
pub const RS_RESULTS_MODIFIED: u32 = 2;

/// Correlation id reserved for server-initiated pushes.
pub const PUSH_CORRELATION_ID: u32 = 0;

pub fn command_name(code: u16) -> &'static str {
    match code {
        CMD_KEEPALIVE => "KEEPALIVE",
        CMD_REQUEST_COMPLETED => "REQUEST_COMPLETED",
        CMD_GET_NXCP_CAPS => "GET_NXCP_CAPS",
        CMD_NXCP_CAPS => "NXCP_CAPS",
        CMD_RS_LIST_REPORTS => "RS_LIST_REPORTS",
        CMD_RS_GET_REPORT_DEFINITION => "RS_GET_REPORT_DEFINITION",
        CMD_RS_SCHEDULE_EXECUTION => "RS_SCHEDULE_EXECUTION",
        CMD_RS_LIST_RESULTS => "RS_LIST_RESULTS",
        CMD_RS_RENDER_RESULT => "RS_RENDER_RESULT",
        CMD_RS_DELETE_RESULT => "RS_DELETE_RESULT",
        CMD_RS_LIST_SCHEDULES => "RS_LIST_SCHEDULES",
        CMD_RS_DELETE_SCHEDULE => "RS_DELETE_SCHEDULE",
        CMD_RS_ADD_REPORT_NOTIFY => "RS_ADD_REPORT_NOTIFY",
        CMD_RS_NOTIFY => "RS_NOTIFY",
        _ => "UNKNOWN",
    }
}
