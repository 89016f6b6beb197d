use core::fmt::{self, Display, Formatter};

/// Protocol position of an inbound session.
///
/// TLS and authentication are orthogonal flags on the session context, which
/// is what lets RSET return to `Greeted` while preserving both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    /// Banner sent, no HELO/EHLO yet.
    #[default]
    Connected,
    /// HELO/EHLO accepted, or transaction state cleared by RSET.
    Greeted,
    /// MAIL FROM accepted, collecting recipients.
    Mail,
    /// At least one RCPT accepted.
    Rcpt,
    /// Message content is being received (DATA or BDAT).
    Reading,
    /// QUIT received.
    Quit,
    /// Server-initiated close (reject, error budget, shutdown).
    Close,
}

impl State {
    /// Whether a MAIL command may start a transaction from here.
    #[must_use]
    pub const fn can_mail(self) -> bool {
        matches!(self, Self::Greeted)
    }

    /// Whether a mail transaction is open (between MAIL and end of data).
    #[must_use]
    pub const fn in_transaction(self) -> bool {
        matches!(self, Self::Mail | Self::Rcpt | Self::Reading)
    }

    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::Quit | Self::Close)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connected => "connected",
            Self::Greeted => "greeted",
            Self::Mail => "mail",
            Self::Rcpt => "rcpt",
            Self::Reading => "reading",
            Self::Quit => "quit",
            Self::Close => "close",
        })
    }
}

#[cfg(test)]
mod test {
    use super::State;

    #[test]
    fn transaction_windows() {
        assert!(State::Greeted.can_mail());
        assert!(!State::Mail.can_mail());

        assert!(State::Mail.in_transaction());
        assert!(State::Rcpt.in_transaction());
        assert!(State::Reading.in_transaction());
        assert!(!State::Greeted.in_transaction());

        assert!(State::Quit.is_closing());
        assert!(!State::Connected.is_closing());
    }
}
