use core::fmt::{self, Display, Formatter};

use robin_common::address::Address;

/// A parsed client command.
///
/// `Unknown` carries a syntactically well-formed verb the registry has no
/// handler for (`500 5.3.3`); parse failures surface as the `Invalid` error
/// variant and count against the session's error budget.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `None` is the null reverse-path from RFC 5321.
    MailFrom {
        sender: Option<Address>,
        size: Option<usize>,
    },
    RcptTo(Address),
    Data,
    Bdat {
        size: usize,
        last: bool,
    },
    Rset,
    Help,
    Quit,
    Unknown(String),
    Invalid(String),
}

impl Command {
    /// Registry key for this command: the uppercase verb word.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Helo(_) => "HELO".to_string(),
            Self::Ehlo(_) => "EHLO".to_string(),
            Self::StartTls => "STARTTLS".to_string(),
            Self::Auth { .. } => "AUTH".to_string(),
            Self::MailFrom { .. } => "MAIL".to_string(),
            Self::RcptTo(_) => "RCPT".to_string(),
            Self::Data => "DATA".to_string(),
            Self::Bdat { .. } => "BDAT".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Help => "HELP".to_string(),
            Self::Quit => "QUIT".to_string(),
            Self::Unknown(verb) => verb.to_ascii_uppercase(),
            Self::Invalid(_) => "INVALID".to_string(),
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(fmt, "HELO {host}"),
            Self::Ehlo(host) => write!(fmt, "EHLO {host}"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom { sender, size } => {
                let addr = sender
                    .as_ref()
                    .and_then(Address::email)
                    .unwrap_or_default();
                match size {
                    Some(size) => write!(fmt, "MAIL FROM:<{addr}> SIZE={size}"),
                    None => write!(fmt, "MAIL FROM:<{addr}>"),
                }
            }
            Self::RcptTo(rcpt) => {
                write!(fmt, "RCPT TO:<{}>", rcpt.email().unwrap_or_default())
            }
            Self::Data => fmt.write_str("DATA"),
            Self::Bdat { size, last } => {
                if *last {
                    write!(fmt, "BDAT {size} LAST")
                } else {
                    write!(fmt, "BDAT {size}")
                }
            }
            Self::Rset => fmt.write_str("RSET"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Unknown(verb) => fmt.write_str(verb),
            Self::Invalid(reason) => fmt.write_str(reason),
        }
    }
}

fn parse_path(input: &str) -> Result<Option<Address>, Command> {
    let trimmed = input.trim();

    // The null reverse-path; mailparse does not accept it.
    if trimmed == "<>" {
        return Ok(None);
    }

    mailparse::addrparse(trimmed).map_or_else(
        |err| Err(Command::Invalid(err.to_string())),
        |parsed| {
            if parsed.is_empty() {
                Err(Command::Invalid(format!("no address in '{trimmed}'")))
            } else {
                Ok(Some(Address(parsed[0].clone())))
            }
        },
    )
}

/// Parses the ESMTP parameter tail of MAIL FROM. Only SIZE is interpreted;
/// a duplicate SIZE is rejected, anything else is carried silently.
fn parse_mail_params(params: &str) -> Result<Option<usize>, Command> {
    let mut size = None;

    for param in params.split_whitespace() {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };

        if name.eq_ignore_ascii_case("SIZE") {
            if size.is_some() {
                return Err(Command::Invalid(
                    "duplicate SIZE parameter not allowed".to_string(),
                ));
            }
            size = value.parse::<usize>().ok().filter(|v| *v > 0);
        }
    }

    Ok(size)
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let upper = command.to_ascii_uppercase();
        let upper = upper.trim();

        if let Some(rest) = upper.strip_prefix("MAIL FROM:") {
            if rest.trim().is_empty() {
                return Err(Self::Invalid(command.to_owned()));
            }

            let rest = command.trim()[10..].trim();
            let (addr, params) = match rest.split_once(char::is_whitespace) {
                Some((addr, params)) => (addr, params),
                None => (rest, ""),
            };

            let sender = parse_path(addr)?;
            let size = parse_mail_params(params)?;
            return Ok(Self::MailFrom { sender, size });
        }

        if let Some(rest) = upper.strip_prefix("RCPT TO:") {
            if rest.trim().is_empty() {
                return Err(Self::Invalid(command.to_owned()));
            }

            let rest = command.trim()[8..].trim();
            return match parse_path(rest)? {
                Some(address) => Ok(Self::RcptTo(address)),
                None => Err(Self::Invalid("empty forward-path".to_string())),
            };
        }

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            return match command.trim().split_once(' ') {
                None => Err(Self::Invalid(format!("expected hostname in {upper}"))),
                Some((verb, host)) if verb.eq_ignore_ascii_case("HELO") => {
                    Ok(Self::Helo(host.trim().to_string()))
                }
                Some((_, host)) => Ok(Self::Ehlo(host.trim().to_string())),
            };
        }

        if upper.starts_with("AUTH") {
            let mut words = command.trim().split_whitespace();
            words.next();
            let Some(mechanism) = words.next() else {
                return Err(Self::Invalid("AUTH requires a mechanism".to_string()));
            };
            return Ok(Self::Auth {
                mechanism: mechanism.to_ascii_uppercase(),
                initial: words.next().map(str::to_string),
            });
        }

        if upper.starts_with("BDAT") {
            let mut words = upper.split_whitespace();
            words.next();
            let Some(size) = words.next().and_then(|w| w.parse::<usize>().ok()) else {
                return Err(Self::Invalid("BDAT requires a chunk size".to_string()));
            };
            let last = match words.next() {
                Some("LAST") => true,
                Some(other) => {
                    return Err(Self::Invalid(format!("unexpected BDAT argument {other}")))
                }
                None => false,
            };
            return Ok(Self::Bdat { size, last });
        }

        match upper {
            "STARTTLS" => Ok(Self::StartTls),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "HELP" => Ok(Self::Help),
            "QUIT" => Ok(Self::Quit),
            _ => {
                let verb = upper.split_whitespace().next().unwrap_or_default();
                if verb.len() >= 3 && verb.chars().all(|c| c.is_ascii_alphabetic()) {
                    Ok(Self::Unknown(verb.to_string()))
                } else {
                    Err(Self::Invalid(command.to_owned()))
                }
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::Command;

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    #[test]
    fn mail_from() {
        assert!(matches!(
            Command::try_from("MAIL FROM:<test@example.com>"),
            Ok(Command::MailFrom {
                sender: Some(_),
                size: None
            })
        ));

        assert_eq!(
            Command::try_from("MAIL FROM:<>"),
            Ok(Command::MailFrom {
                sender: None,
                size: None
            })
        );

        assert!(Command::try_from("MAIL FROM:").is_err());

        for comm in string_casing("mail from") {
            assert!(matches!(
                Command::try_from(format!("{comm}: test@example.com").as_str()),
                Ok(Command::MailFrom { .. })
            ));
        }
    }

    #[test]
    fn mail_from_size_parameter() {
        assert!(matches!(
            Command::try_from("MAIL FROM:<test@example.com> SIZE=12345"),
            Ok(Command::MailFrom {
                size: Some(12345),
                ..
            })
        ));

        // SIZE=0 is semantically empty and ignored.
        assert!(matches!(
            Command::try_from("MAIL FROM:<test@example.com> SIZE=0"),
            Ok(Command::MailFrom { size: None, .. })
        ));

        // Duplicates are rejected.
        assert!(Command::try_from("MAIL FROM:<a@b.c> SIZE=1 SIZE=2").is_err());

        // Other parameters are carried silently.
        assert!(matches!(
            Command::try_from("MAIL FROM:<a@b.c> SIZE=10 BODY=8BITMIME"),
            Ok(Command::MailFrom { size: Some(10), .. })
        ));
    }

    #[test]
    fn rcpt_to() {
        let parsed = Command::try_from("RCPT TO:<user@example.com>").unwrap();
        let Command::RcptTo(address) = parsed else {
            panic!("expected RcptTo, got {parsed:?}");
        };
        assert_eq!(address.email(), Some("user@example.com"));

        assert!(Command::try_from("RCPT TO:").is_err());
        assert!(Command::try_from("RCPT TO:<>").is_err());
    }

    #[test]
    fn helo_and_ehlo() {
        assert_eq!(
            Command::try_from("EHLO client.example.com"),
            Ok(Command::Ehlo("client.example.com".to_string()))
        );
        assert_eq!(
            Command::try_from("helo box"),
            Ok(Command::Helo("box".to_string()))
        );
        assert!(Command::try_from("EHLO").is_err());
    }

    #[test]
    fn bdat() {
        assert_eq!(
            Command::try_from("BDAT 1000"),
            Ok(Command::Bdat {
                size: 1000,
                last: false
            })
        );
        assert_eq!(
            Command::try_from("BDAT 0 LAST"),
            Ok(Command::Bdat {
                size: 0,
                last: true
            })
        );
        assert!(Command::try_from("BDAT").is_err());
        assert!(Command::try_from("BDAT ten").is_err());
    }

    #[test]
    fn auth() {
        assert_eq!(
            Command::try_from("AUTH PLAIN dGVzdA=="),
            Ok(Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("dGVzdA==".to_string())
            })
        );
        assert_eq!(
            Command::try_from("auth login"),
            Ok(Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: None
            })
        );
        assert!(Command::try_from("AUTH").is_err());
    }

    #[test]
    fn bare_verbs() {
        for comm in string_casing("quit") {
            assert_eq!(Command::try_from(comm.as_str()), Ok(Command::Quit));
        }
        assert_eq!(Command::try_from("DATA"), Ok(Command::Data));
        assert_eq!(Command::try_from("RSET"), Ok(Command::Rset));
        assert_eq!(Command::try_from("STARTTLS"), Ok(Command::StartTls));
        assert_eq!(Command::try_from("HELP"), Ok(Command::Help));
    }

    #[test]
    fn unknown_verbs_are_distinguished_from_garbage() {
        assert_eq!(
            Command::try_from("XCLIENT ADDR=1.2.3.4"),
            Ok(Command::Unknown("XCLIENT".to_string()))
        );
        assert!(Command::try_from("@#!").is_err());
    }

    #[test]
    fn registry_keys() {
        assert_eq!(Command::Data.key(), "DATA");
        assert_eq!(Command::Unknown("xclient".to_string()).key(), "XCLIENT");
        assert_eq!(
            Command::try_from("MAIL FROM:<a@b.c>").unwrap().key(),
            "MAIL"
        );
    }
}
