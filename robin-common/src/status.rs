use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the server and the outbound client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    SystemStatus,
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSuccessful,
    Ok,
    ServerChallenge,
    StartMailInput,
    Unavailable,
    ActionAborted,
    InsufficientStorage,
    SyntaxError,
    ArgumentError,
    NotImplemented,
    InvalidCommandSequence,
    AuthRequired,
    AuthFailed,
    Error,
    UserNotLocal,
    ExceededStorage,
    TransactionFailed,
    Unknown(u16),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u16::from(self))
    }

    /// Checks if the status indicates success
    #[must_use]
    pub fn is_success(self) -> bool {
        (200..300).contains(&u16::from(self))
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            211 => Self::SystemStatus,
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            334 => Self::ServerChallenge,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionAborted,
            452 => Self::InsufficientStorage,
            500 => Self::SyntaxError,
            501 => Self::ArgumentError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            550 => Self::Error,
            551 => Self::UserNotLocal,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::SystemStatus => 211,
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::ServerChallenge => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionAborted => 451,
            Status::InsufficientStorage => 452,
            Status::SyntaxError => 500,
            Status::ArgumentError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::Error => 550,
            Status::UserNotLocal => 551,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}
