use rmpv::Value;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Opcodes carried in `message[0]`. Values are fixed for interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    AuthenticateUser,
    RegisterFriend,
    UnregisterFriend,
    GetFriendIp,
    RegisterStatus,
    AcceptFriend,
    GetAllStatuses,
    PushClientStatus,
    PushFriendAccept,
    AuthenticateServer,
    ServerSendFriend,
    ServerSendUnfriend,
    ServerSendStatusChanged,
    ServerSendAccept,
    ServerGetStatus,
    Success,
    Authenticated,
    AuthFailed,
    AccessDenied,
    AllStatusResponse,
    ServerGetStatusResp,
}

impl Opcode {
    pub const fn code(self) -> i64 {
        match self {
            Opcode::AuthenticateUser => 1,
            Opcode::RegisterFriend => 2,
            Opcode::UnregisterFriend => 3,
            Opcode::GetFriendIp => 4,
            Opcode::RegisterStatus => 5,
            Opcode::AcceptFriend => 6,
            Opcode::GetAllStatuses => 7,
            Opcode::PushClientStatus => 20,
            Opcode::PushFriendAccept => 21,
            Opcode::AuthenticateServer => 30,
            Opcode::ServerSendFriend => 31,
            Opcode::ServerSendUnfriend => 32,
            Opcode::ServerSendStatusChanged => 33,
            Opcode::ServerSendAccept => 34,
            Opcode::ServerGetStatus => 35,
            Opcode::Success => 60,
            Opcode::Authenticated => 61,
            Opcode::AuthFailed => 62,
            Opcode::AccessDenied => 63,
            Opcode::AllStatusResponse => 65,
            Opcode::ServerGetStatusResp => 66,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Opcode::AuthenticateUser,
            2 => Opcode::RegisterFriend,
            3 => Opcode::UnregisterFriend,
            4 => Opcode::GetFriendIp,
            5 => Opcode::RegisterStatus,
            6 => Opcode::AcceptFriend,
            7 => Opcode::GetAllStatuses,
            20 => Opcode::PushClientStatus,
            21 => Opcode::PushFriendAccept,
            30 => Opcode::AuthenticateServer,
            31 => Opcode::ServerSendFriend,
            32 => Opcode::ServerSendUnfriend,
            33 => Opcode::ServerSendStatusChanged,
            34 => Opcode::ServerSendAccept,
            35 => Opcode::ServerGetStatus,
            60 => Opcode::Success,
            61 => Opcode::Authenticated,
            62 => Opcode::AuthFailed,
            63 => Opcode::AccessDenied,
            65 => Opcode::AllStatusResponse,
            66 => Opcode::ServerGetStatusResp,
            _ => return None,
        })
    }

    /// Server-initiated messages delivered outside request/response.
    pub fn is_push(self) -> bool {
        matches!(self, Opcode::PushClientStatus | Opcode::PushFriendAccept)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Protocol-level error codes. Always negative so they never collide with
/// request or reply opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MethodNotFound,
    MalformedRequest,
    SessionExpired,
    RemoteFederationError,
    InternalError,
    NotImplemented,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::MethodNotFound => -1,
            ErrorCode::MalformedRequest => -2,
            ErrorCode::SessionExpired => -3,
            ErrorCode::RemoteFederationError => -4,
            ErrorCode::InternalError => -5,
            ErrorCode::NotImplemented => -6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => ErrorCode::MethodNotFound,
            -2 => ErrorCode::MalformedRequest,
            -3 => ErrorCode::SessionExpired,
            -4 => ErrorCode::RemoteFederationError,
            -5 => ErrorCode::InternalError,
            -6 => ErrorCode::NotImplemented,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Presence status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Online,
    Away,
    Offline,
    Busy,
}

impl Status {
    pub const fn code(self) -> i64 {
        match self {
            Status::Online => 1,
            Status::Away => 2,
            Status::Offline => 3,
            Status::Busy => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Status::Online,
            2 => Status::Away,
            3 => Status::Offline,
            4 => Status::Busy,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Online => "online",
            Status::Away => "away",
            Status::Offline => "offline",
            Status::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// One `[user, status]` pair in a status list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub user: String,
    pub status: Status,
}

impl StatusEntry {
    pub fn new(user: impl Into<String>, status: Status) -> Self {
        Self {
            user: user.into(),
            status,
        }
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.user.as_str()),
            Value::from(self.status.code()),
        ])
    }

    fn from_value(value: &Value) -> Option<Self> {
        let pair = value.as_array()?;
        let user = pair.first()?.as_str()?;
        let status = Status::from_code(pair.get(1)?.as_i64()?)?;
        Some(Self::new(user, status))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An RPC message: an ordered array `[opcode, args...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message(Vec<Value>);

impl Message {
    pub fn new(opcode: Opcode) -> Self {
        Self(vec![Value::from(opcode.code())])
    }

    /// Append one argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Everything after the opcode.
    pub fn args(&self) -> &[Value] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Raw integer in position 0, if any.
    pub fn code(&self) -> Option<i64> {
        self.0.first().and_then(Value::as_i64)
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.code().and_then(Opcode::from_code)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.code().and_then(ErrorCode::from_code)
    }

    pub fn str_arg(&self, index: usize) -> Option<&str> {
        self.args().get(index).and_then(Value::as_str)
    }

    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.args().get(index).and_then(Value::as_i64)
    }

    pub fn is_push(&self) -> bool {
        self.opcode().is_some_and(Opcode::is_push)
    }

    // -- canned replies --

    pub fn success(text: &str, echo: impl Into<Value>) -> Self {
        Self::new(Opcode::Success).arg(text).arg(echo)
    }

    pub fn authenticated() -> Self {
        Self::new(Opcode::Authenticated).arg("Authentication Succeeded")
    }

    pub fn auth_failed() -> Self {
        Self::new(Opcode::AuthFailed).arg("Authentication Failed")
    }

    pub fn access_denied() -> Self {
        Self::new(Opcode::AccessDenied).arg("Access Denied")
    }

    pub fn error(code: ErrorCode, text: &str) -> Self {
        Self(vec![Value::from(code.code()), Value::from(text)])
    }

    pub fn status_list(opcode: Opcode, entries: &[StatusEntry]) -> Self {
        Self::new(opcode).arg(Value::Array(
            entries.iter().map(StatusEntry::to_value).collect(),
        ))
    }

    /// Decode the `[[user, status], ...]` payload of a status list reply.
    pub fn status_entries(&self) -> Option<Vec<StatusEntry>> {
        self.args()
            .first()?
            .as_array()?
            .iter()
            .map(StatusEntry::from_value)
            .collect()
    }

    pub fn push_client_status(user: &str, status: Status) -> Self {
        Self::new(Opcode::PushClientStatus)
            .arg(user)
            .arg(status.code())
    }

    pub fn push_friend_accept(acceptor: &str, status: Status) -> Self {
        Self::new(Opcode::PushFriendAccept)
            .arg(acceptor)
            .arg(status.code())
    }
}

impl From<Message> for Value {
    fn from(msg: Message) -> Self {
        Value::Array(msg.0)
    }
}

impl TryFrom<Value> for Message {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(values) => Ok(Self(values)),
            other => Err(ProtocolError::NotAnArray(other.to_string())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Array(self.0.clone()), f)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not an array: {0}")]
    NotAnArray(String),
    #[error("message is empty")]
    Empty,
    #[error("opcode is not an integer: {0}")]
    InvalidOpcode(String),
    #[error("opcode 0 is reserved")]
    ZeroOpcode,
    #[error("unknown opcode {0}")]
    UnknownOpcode(i64),
    #[error("{0} is not a request")]
    NotARequest(Opcode),
    #[error("{opcode}: missing argument {index}")]
    MissingArgument { opcode: Opcode, index: usize },
    #[error("{opcode}: argument {index} must be {expected}")]
    InvalidArgument {
        opcode: Opcode,
        index: usize,
        expected: &'static str,
    },
}

/// A decoded request. User requests carry only what the client supplies;
/// the acting user comes from the connection's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AuthenticateUser { username: String, password: String },
    RegisterFriend { friend: String },
    UnregisterFriend { friend: String },
    GetFriendIp { friend: String },
    RegisterStatus { status: Status },
    AcceptFriend { friend: String },
    GetAllStatuses,
    AuthenticateServer { domain: String },
    /// `remote` (on the calling domain) asked to befriend `local`.
    ServerSendFriend { local: String, remote: String },
    ServerSendUnfriend { local: String, remote: String },
    /// `user` (on the calling domain) changed status.
    ServerSendStatusChanged { user: String, status: Status },
    /// `acceptor` (on the calling domain) accepted `local`.
    ServerSendAccept {
        local: String,
        acceptor: String,
        status: Status,
    },
    /// Statuses of `users` (hosted here) as seen by `requester`.
    ServerGetStatus {
        requester: String,
        users: Vec<String>,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::AuthenticateUser { .. } => Opcode::AuthenticateUser,
            Request::RegisterFriend { .. } => Opcode::RegisterFriend,
            Request::UnregisterFriend { .. } => Opcode::UnregisterFriend,
            Request::GetFriendIp { .. } => Opcode::GetFriendIp,
            Request::RegisterStatus { .. } => Opcode::RegisterStatus,
            Request::AcceptFriend { .. } => Opcode::AcceptFriend,
            Request::GetAllStatuses => Opcode::GetAllStatuses,
            Request::AuthenticateServer { .. } => Opcode::AuthenticateServer,
            Request::ServerSendFriend { .. } => Opcode::ServerSendFriend,
            Request::ServerSendUnfriend { .. } => Opcode::ServerSendUnfriend,
            Request::ServerSendStatusChanged { .. } => Opcode::ServerSendStatusChanged,
            Request::ServerSendAccept { .. } => Opcode::ServerSendAccept,
            Request::ServerGetStatus { .. } => Opcode::ServerGetStatus,
        }
    }

    /// Validate the shape of a decoded value and extract a typed request.
    pub fn parse(value: Value) -> Result<Self, ProtocolError> {
        let message = Message::try_from(value)?;
        let first = message.values().first().ok_or(ProtocolError::Empty)?;
        let code = first
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidOpcode(first.to_string()))?;
        if code == 0 {
            return Err(ProtocolError::ZeroOpcode);
        }
        let opcode = Opcode::from_code(code).ok_or(ProtocolError::UnknownOpcode(code))?;
        let args = Args {
            opcode,
            values: message.args(),
        };

        Ok(match opcode {
            Opcode::AuthenticateUser => Request::AuthenticateUser {
                username: args.string(0)?,
                password: args.string(1)?,
            },
            Opcode::RegisterFriend => Request::RegisterFriend {
                friend: args.string(0)?,
            },
            Opcode::UnregisterFriend => Request::UnregisterFriend {
                friend: args.string(0)?,
            },
            Opcode::GetFriendIp => Request::GetFriendIp {
                friend: args.string(0)?,
            },
            Opcode::RegisterStatus => Request::RegisterStatus {
                status: args.status(0)?,
            },
            Opcode::AcceptFriend => Request::AcceptFriend {
                friend: args.string(0)?,
            },
            Opcode::GetAllStatuses => Request::GetAllStatuses,
            Opcode::AuthenticateServer => Request::AuthenticateServer {
                domain: args.string(0)?,
            },
            Opcode::ServerSendFriend => Request::ServerSendFriend {
                local: args.string(0)?,
                remote: args.string(1)?,
            },
            Opcode::ServerSendUnfriend => Request::ServerSendUnfriend {
                local: args.string(0)?,
                remote: args.string(1)?,
            },
            Opcode::ServerSendStatusChanged => Request::ServerSendStatusChanged {
                user: args.string(0)?,
                status: args.status(1)?,
            },
            Opcode::ServerSendAccept => Request::ServerSendAccept {
                local: args.string(0)?,
                acceptor: args.string(1)?,
                status: args.status(2)?,
            },
            Opcode::ServerGetStatus => Request::ServerGetStatus {
                requester: args.string(0)?,
                users: args.string_list(1)?,
            },
            other => return Err(ProtocolError::NotARequest(other)),
        })
    }

    pub fn to_message(&self) -> Message {
        let msg = Message::new(self.opcode());
        match self {
            Request::AuthenticateUser { username, password } => {
                msg.arg(username.as_str()).arg(password.as_str())
            }
            Request::RegisterFriend { friend }
            | Request::UnregisterFriend { friend }
            | Request::GetFriendIp { friend }
            | Request::AcceptFriend { friend } => msg.arg(friend.as_str()),
            Request::RegisterStatus { status } => msg.arg(status.code()),
            Request::GetAllStatuses => msg,
            Request::AuthenticateServer { domain } => msg.arg(domain.as_str()),
            Request::ServerSendFriend { local, remote }
            | Request::ServerSendUnfriend { local, remote } => {
                msg.arg(local.as_str()).arg(remote.as_str())
            }
            Request::ServerSendStatusChanged { user, status } => {
                msg.arg(user.as_str()).arg(status.code())
            }
            Request::ServerSendAccept {
                local,
                acceptor,
                status,
            } => msg
                .arg(local.as_str())
                .arg(acceptor.as_str())
                .arg(status.code()),
            Request::ServerGetStatus { requester, users } => msg.arg(requester.as_str()).arg(
                Value::Array(users.iter().map(|u| Value::from(u.as_str())).collect()),
            ),
        }
    }
}

struct Args<'a> {
    opcode: Opcode,
    values: &'a [Value],
}

impl Args<'_> {
    fn get(&self, index: usize) -> Result<&Value, ProtocolError> {
        self.values
            .get(index)
            .ok_or(ProtocolError::MissingArgument {
                opcode: self.opcode,
                index,
            })
    }

    fn invalid(&self, index: usize, expected: &'static str) -> ProtocolError {
        ProtocolError::InvalidArgument {
            opcode: self.opcode,
            index,
            expected,
        }
    }

    fn string(&self, index: usize) -> Result<String, ProtocolError> {
        self.get(index)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(index, "a string"))
    }

    fn status(&self, index: usize) -> Result<Status, ProtocolError> {
        self.get(index)?
            .as_i64()
            .and_then(Status::from_code)
            .ok_or_else(|| self.invalid(index, "a status code (1-4)"))
    }

    fn string_list(&self, index: usize) -> Result<Vec<String>, ProtocolError> {
        self.get(index)?
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| self.invalid(index, "an array of strings"))
    }
}
