//! Append-only log of the protocol exchange for one envelope attempt.
//!
//! Used both for inbound assertions and for outbound retry bookkeeping: the
//! retry scheduler derives the failed-recipient subset from the recorded
//! RCPT replies.

use serde::{Deserialize, Serialize};

/// A single command/reply pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The command as it was sent on the wire.
    pub command: String,
    /// The peer's reply line(s).
    pub reply: String,
    /// Whether the reply was a 4xx/5xx.
    pub error: bool,
}

impl Transaction {
    #[must_use]
    pub fn new(command: impl Into<String>, reply: impl Into<String>, error: bool) -> Self {
        Self {
            command: command.into(),
            reply: reply.into(),
            error,
        }
    }
}

/// The transaction log for one envelope: exactly one MAIL entry, RCPT entries
/// in the order they were sent, and at most one DATA entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransactionList {
    mail: Option<Transaction>,
    rcpt: Vec<(String, Transaction)>,
    data: Option<Transaction>,
}

impl TransactionList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mail: None,
            rcpt: Vec::new(),
            data: None,
        }
    }

    /// Records the MAIL exchange. A second call replaces the first so a
    /// retried attempt starts from a clean slate without reallocating.
    pub fn record_mail(&mut self, transaction: Transaction) {
        self.mail = Some(transaction);
    }

    /// Records a RCPT exchange for the given mailbox, in send order.
    pub fn record_rcpt(&mut self, recipient: impl Into<String>, transaction: Transaction) {
        self.rcpt.push((recipient.into(), transaction));
    }

    /// Records the DATA exchange.
    pub fn record_data(&mut self, transaction: Transaction) {
        self.data = Some(transaction);
    }

    #[must_use]
    pub const fn mail(&self) -> Option<&Transaction> {
        self.mail.as_ref()
    }

    #[must_use]
    pub fn rcpt(&self) -> &[(String, Transaction)] {
        &self.rcpt
    }

    #[must_use]
    pub const fn data(&self) -> Option<&Transaction> {
        self.data.as_ref()
    }

    /// Recipients whose RCPT (or per-recipient LMTP DATA) reply carried the
    /// error bit.
    #[must_use]
    pub fn failed_recipients(&self) -> Vec<String> {
        self.rcpt
            .iter()
            .filter(|(_, transaction)| transaction.error)
            .map(|(recipient, _)| recipient.clone())
            .collect()
    }

    /// Whether any exchange in this attempt failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.mail.as_ref().is_some_and(|t| t.error)
            || self.data.as_ref().is_some_and(|t| t.error)
            || self.rcpt.iter().any(|(_, t)| t.error)
    }

    /// The reply of the last errored exchange, for bounce diagnostics.
    #[must_use]
    pub fn last_error(&self) -> Option<&Transaction> {
        self.data
            .as_ref()
            .filter(|t| t.error)
            .or_else(|| self.rcpt.iter().rev().map(|(_, t)| t).find(|t| t.error))
            .or_else(|| self.mail.as_ref().filter(|t| t.error))
    }

    /// Clears all recorded exchanges ahead of a fresh delivery attempt.
    pub fn clear(&mut self) {
        self.mail = None;
        self.rcpt.clear();
        self.data = None;
    }
}

#[cfg(test)]
mod test {
    use super::{Transaction, TransactionList};

    #[test]
    fn failed_recipients_derived_from_error_bits() {
        let mut list = TransactionList::new();
        list.record_mail(Transaction::new("MAIL FROM:<a@ex.com>", "250 Ok", false));
        list.record_rcpt(
            "ok@ex.com",
            Transaction::new("RCPT TO:<ok@ex.com>", "250 Ok", false),
        );
        list.record_rcpt(
            "fail@ex.com",
            Transaction::new("RCPT TO:<fail@ex.com>", "550 No such user", true),
        );

        assert_eq!(list.failed_recipients(), vec!["fail@ex.com".to_string()]);
        assert!(list.has_errors());
    }

    #[test]
    fn rcpt_entries_keep_send_order() {
        let mut list = TransactionList::new();
        for rcpt in ["c@ex.com", "a@ex.com", "b@ex.com"] {
            list.record_rcpt(rcpt, Transaction::new(format!("RCPT TO:<{rcpt}>"), "250", false));
        }

        let order: Vec<_> = list.rcpt().iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(order, vec!["c@ex.com", "a@ex.com", "b@ex.com"]);
    }

    #[test]
    fn clear_resets_all_entries() {
        let mut list = TransactionList::new();
        list.record_mail(Transaction::new("MAIL FROM:<>", "250", false));
        list.record_data(Transaction::new("DATA", "554 rejected", true));
        assert!(list.last_error().is_some());

        list.clear();
        assert!(list.mail().is_none());
        assert!(list.data().is_none());
        assert!(!list.has_errors());
    }
}
