/// Line-protocol mnemonics.
///
/// Every command is prefixed with `~`, the device ignores lines without it.
/// Login:              ~M601 S1
/// Logout:             ~M602
/// Print status:       ~M27
/// Endstops / state:   ~M119
/// Device info:        ~M115
/// Location:           ~M114
/// Temperatures:       ~M105
/// List local files:   ~M661   (reply runs into the ~M662 thumbnail stream, no "ok")

pub const CMD_LOGIN: &str = "~M601 S1";
pub const CMD_LOGOUT: &str = "~M602";

pub const CMD_PRINT_STATUS: &str = "~M27";
pub const CMD_ENDSTOP_INFO: &str = "~M119";
pub const CMD_INFO_STATUS: &str = "~M115";
pub const CMD_INFO_XYZAB: &str = "~M114";
pub const CMD_TEMP: &str = "~M105";

pub const CMD_LED_ON: &str = "~M146 r255 g255 b255 F0";
pub const CMD_LED_OFF: &str = "~M146 r0 g0 b0 F0";

pub const CMD_RUNOUT_SENSOR_ON: &str = "~M405";
pub const CMD_RUNOUT_SENSOR_OFF: &str = "~M406";

pub const CMD_LIST_LOCAL_FILES: &str = "~M661";
pub const CMD_GET_THUMBNAIL: &str = "~M662";

pub const CMD_HOME_AXES: &str = "~G28";
pub const CMD_ABSOLUTE_POSITIONING: &str = "~G90";

/// Device reply when the login is refused.
pub const LOGIN_FAILED_PHRASE: &str = "Control failed.";
/// Echo prefix every accepted command carries.
pub const ACK_MARKER: &str = "Received.";
pub const OK_MARKER: &str = "ok";

pub const DEFAULT_EXTRUDE_FEEDRATE: u32 = 450;

/// How the end of a reply is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTerminator {
    /// Any `ok` in the accumulated text.
    Ok,
    /// A marker that only appears once the next logical stream has started.
    Sentinel(&'static str),
}

impl ReplyTerminator {
    pub fn for_command(line: &str) -> Self {
        if line.trim().starts_with(CMD_LIST_LOCAL_FILES) {
            ReplyTerminator::Sentinel(CMD_GET_THUMBNAIL)
        } else {
            ReplyTerminator::Ok
        }
    }

    pub fn is_complete(&self, text: &str) -> bool {
        match self {
            ReplyTerminator::Ok => text.contains(OK_MARKER),
            ReplyTerminator::Sentinel(marker) => text.contains(marker),
        }
    }
}

/// Parameterised commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GCodeCmd {
    SetExtruderTemp(i32),
    SetBedTemp(i32),
    /// Linear move of all three axes, mm and mm/min.
    Move { x: i32, y: i32, z: i32, feedrate: u32 },
    MoveExtruder { x: i32, y: i32, feedrate: u32 },
    Extrude { length: i32, feedrate: u32 },
}

impl GCodeCmd {
    pub fn to_line(&self) -> String {
        match self {
            GCodeCmd::SetExtruderTemp(t) => format!("~M104 S{}", t),
            GCodeCmd::SetBedTemp(t) => format!("~M140 S{}", t),
            GCodeCmd::Move { x, y, z, feedrate } => {
                format!("~G1 X{} Y{} Z{} F{}", x, y, z, feedrate)
            }
            GCodeCmd::MoveExtruder { x, y, feedrate } => format!("~G1 X{} Y{} F{}", x, y, feedrate),
            GCodeCmd::Extrude { length, feedrate } => format!("~G1 E{} F{}", length, feedrate),
        }
    }
}

/// A command was accepted: the device echoed it and finished with `ok`.
pub fn is_command_ack(reply: &str) -> bool {
    reply.contains(ACK_MARKER) && reply.contains(OK_MARKER)
}

pub fn is_login_accepted(reply: &str) -> bool {
    reply.contains(OK_MARKER) && !reply.contains(LOGIN_FAILED_PHRASE)
}
