use std::path::PathBuf;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressList};

/// Header that renames the stored envelope file before further processing.
pub const HEADER_FILENAME: &str = "X-Robin-Filename";
/// Header that injects a one-shot relay session after the pipeline succeeds.
pub const HEADER_RELAY: &str = "X-Robin-Relay";
/// Test-only header that short-circuits a named storage processor.
pub const HEADER_CHAOS: &str = "X-Robin-Chaos";
/// Parsed From header captured at receipt time.
pub const HEADER_PARSED_FROM: &str = "X-Parsed-From";
/// Parsed Reply-To header captured at receipt time.
pub const HEADER_PARSED_REPLY_TO: &str = "X-Parsed-Reply-To";

/// The source of an envelope's DATA. Exactly one variant is ever attached to
/// an envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailData {
    /// Message stored on disk; later processors read this path.
    File(PathBuf),
    /// Message held in memory.
    Bytes(Vec<u8>),
    /// Synthesised message from a subject and body (bounces, test mail).
    Composed { subject: String, body: String },
}

/// Verdict recorded by a storage processor (AV, spam).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub scanner: String,
    pub verdict: String,
}

/// One mail transaction: MAIL FROM, the recipients, and the message source.
///
/// Recipients preserve insertion order and are deduped on insert. An envelope
/// whose recipient list becomes empty is terminal and may only be dropped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: AddressList,
    data: Option<MailData>,
    headers: AHashMap<String, String>,
    scan_results: Vec<ScanResult>,
    message_id: Option<String>,
    date: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: Option<Address>) -> Self {
        Self {
            sender,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: Option<Address>) {
        self.sender = sender;
    }

    #[must_use]
    pub const fn recipients(&self) -> &AddressList {
        &self.recipients
    }

    /// Adds a recipient; duplicates are dropped (set semantics).
    pub fn add_recipient(&mut self, recipient: Address) -> bool {
        self.recipients.insert(recipient)
    }

    /// Replaces the recipient list with the given subset, preserving the
    /// order of the current list.
    pub fn keep_recipients(&mut self, keep: &[String]) {
        self.recipients
            .retain(|addr| addr.email().is_some_and(|email| keep.contains(&email.to_string())));
    }

    /// An envelope with no recipients left is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.recipients.is_empty()
    }

    #[must_use]
    pub const fn data(&self) -> Option<&MailData> {
        self.data.as_ref()
    }

    /// Attaches the DATA source. The previous source, if any, is replaced;
    /// callers that stored a file are responsible for it until then.
    pub fn set_data(&mut self, data: MailData) {
        self.data = Some(data);
    }

    /// The on-disk path of the message, when the source is a stored file.
    #[must_use]
    pub fn file_path(&self) -> Option<&PathBuf> {
        match &self.data {
            Some(MailData::File(path)) => Some(path),
            _ => None,
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    #[must_use]
    pub const fn scan_results(&self) -> &Vec<ScanResult> {
        &self.scan_results
    }

    pub fn record_scan(&mut self, scanner: impl Into<String>, verdict: impl Into<String>) {
        self.scan_results.push(ScanResult {
            scanner: scanner.into(),
            verdict: verdict.into(),
        });
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.message_id = Some(id.into());
    }

    /// RFC 5322 origination date, set when the message is accepted.
    #[must_use]
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    pub fn set_date(&mut self, date: impl Into<String>) {
        self.date = Some(date.into());
    }
}
