//! SMTP reply parsing for the outbound client.

use crate::error::{ClientError, ClientResult};

/// One complete, possibly multiline, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply text joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// The first reply line with its code, as recorded in transaction logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} {}",
            self.code,
            self.lines.first().map(String::as_str).unwrap_or_default()
        )
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Whether the EHLO reply advertises the given capability keyword.
    #[must_use]
    pub fn advertises(&self, capability: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(capability))
        })
    }

    fn parse_line(line: &str) -> ClientResult<(u16, bool, &str)> {
        if line.len() < 3 {
            return Err(ClientError::Parse(format!("reply line too short: '{line}'")));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("invalid reply code in '{line}'")))?;

        let (is_last, text) = match line.as_bytes().get(3) {
            None => (true, ""),
            Some(b' ') => (true, line.get(4..).unwrap_or_default()),
            Some(b'-') => (false, line.get(4..).unwrap_or_default()),
            Some(other) => {
                return Err(ClientError::Parse(format!(
                    "invalid separator {:?} in '{line}'",
                    char::from(*other)
                )))
            }
        };

        Ok((code, is_last, text))
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the bytes consumed, or `None` when more input
    /// is needed.
    pub fn parse(buffer: &[u8]) -> ClientResult<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut code = None;

        loop {
            let rest = &buffer[consumed..];
            let Some(newline) = rest.iter().position(|byte| *byte == b'\n') else {
                return Ok(None);
            };

            let raw = &rest[..newline];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = std::str::from_utf8(raw)
                .map_err(|e| ClientError::Parse(e.to_string()))?;
            consumed += newline + 1;

            if line.is_empty() {
                continue;
            }

            let (line_code, is_last, text) = Self::parse_line(line)?;

            match code {
                None => code = Some(line_code),
                Some(expected) if expected != line_code => {
                    return Err(ClientError::Parse(format!(
                        "code mismatch in multiline reply: {expected} then {line_code}"
                    )));
                }
                Some(_) => {}
            }

            lines.push(text.to_string());

            if is_last {
                let Some(code) = code else {
                    return Ok(None);
                };
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }
}
