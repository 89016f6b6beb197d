use core::fmt::{self, Display};

use robin_common::session::Mechanism;
use serde::Deserialize;

/// SMTP extensions advertised in the EHLO response.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    /// RFC 3207. Advertised only while the connection is still plaintext and
    /// the listener has TLS material.
    Starttls,
    /// RFC 1870. Zero advertises SIZE without a fixed maximum.
    Size(usize),
    /// RFC 2920.
    Pipelining,
    /// RFC 6152.
    EightBitMime,
    /// RFC 3030, the BDAT verb.
    Chunking,
    /// RFC 4954 with the offered mechanisms.
    Auth(Vec<Mechanism>),
    Help,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Starttls => fmt.write_str("STARTTLS"),
            Self::Size(0) => fmt.write_str("SIZE"),
            Self::Size(max) => write!(fmt, "SIZE {max}"),
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Chunking => fmt.write_str("CHUNKING"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    match mechanism {
                        Mechanism::Plain => fmt.write_str(" PLAIN")?,
                        Mechanism::Login => fmt.write_str(" LOGIN")?,
                    }
                }
                Ok(())
            }
            Self::Help => fmt.write_str("HELP"),
        }
    }
}

/// The default extension set for a listener with the given size limit and
/// TLS availability.
#[must_use]
pub fn default_set(size_limit: usize, tls_available: bool, auth_available: bool) -> Vec<Extension> {
    let mut extensions = vec![
        Extension::Size(size_limit),
        Extension::Pipelining,
        Extension::EightBitMime,
        Extension::Chunking,
        Extension::Help,
    ];

    if tls_available {
        extensions.insert(0, Extension::Starttls);
    }

    if auth_available {
        extensions.push(Extension::Auth(vec![Mechanism::Plain, Mechanism::Login]));
    }

    extensions
}
