//! RFC 3464 delivery status notification (bounce) synthesis.
//!
//! A bounce is generated from a failed relay session once its retries are
//! exhausted (or immediately for permanent failures): a `multipart/report`
//! with a human-readable preamble, a `message/delivery-status` part and the
//! original message headers. The sender is `mailer-daemon@<hostname>`, the
//! recipient the original MAIL FROM. Null senders and mailer-daemon
//! originals are suppressed so a bounce never bounces again.

use chrono::Utc;

use robin_common::{
    address::parse_one,
    config::OutboundConfig,
    counter,
    envelope::{Envelope, MailData},
    session::{Route, Session},
    transaction::TransactionList,
};
use robin_queue::{QueueProtocol, RelaySession};

/// How much of the failing reply makes it into the report.
const REASON_LIMIT: usize = 200;

/// How much of the original message is quoted in the rfc822 part.
const HEADERS_LIMIT: usize = 4096;

/// Whether a failed envelope is eligible for a bounce at all.
#[must_use]
pub fn should_bounce(envelope: &Envelope) -> bool {
    let Some(sender) = envelope.sender() else {
        // Null reverse-path: the message is itself a notification.
        return false;
    };

    let Some(email) = sender.email() else {
        return false;
    };

    if email.is_empty() {
        return false;
    }

    // An explicit check so a mailer-daemon original never loops.
    !sender
        .local_part()
        .is_some_and(|local| local.eq_ignore_ascii_case("mailer-daemon"))
}

fn original_headers(envelope: &Envelope) -> String {
    let raw = match envelope.data() {
        Some(MailData::Bytes(bytes)) => bytes.clone(),
        Some(MailData::File(path)) => std::fs::read(path).unwrap_or_default(),
        Some(MailData::Composed { subject, .. }) => {
            return format!("Subject: {subject}\r\n");
        }
        None => return String::from("(original message unavailable)"),
    };

    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .unwrap_or_else(|| raw.len().min(HEADERS_LIMIT));

    String::from_utf8_lossy(&raw[..header_end.min(HEADERS_LIMIT)]).into_owned()
}

fn diagnostic(transactions: &TransactionList) -> String {
    let mut reason = transactions
        .last_error()
        .map_or_else(|| "delivery failed".to_string(), |t| t.reply.clone());
    reason.truncate(REASON_LIMIT);
    reason
}

/// Synthesises the bounce for one exhausted envelope.
///
/// Returns `None` when the original is ineligible (null or mailer-daemon
/// sender). The result is an ordinary queue entry; it is never bounced
/// again.
#[must_use]
pub fn generate(
    failed: &RelaySession,
    envelope: &Envelope,
    transactions: &TransactionList,
    hostname: &str,
    outbound: &OutboundConfig,
) -> Option<RelaySession> {
    if !should_bounce(envelope) {
        return None;
    }

    let original_sender = envelope.sender()?.email()?.to_string();
    let reason = diagnostic(transactions);
    let status = if reason.starts_with('5') { "5.0.0" } else { "4.0.0" };

    let recipients: Vec<String> = envelope
        .recipients()
        .iter()
        .filter_map(|rcpt| rcpt.email().map(str::to_string))
        .collect();
    let recipient_list = recipients.join(", ");

    let postmaster = format!("mailer-daemon@{hostname}");
    let boundary = format!(
        "----=_Report_{}_{}",
        failed.session.uid(),
        failed.last_attempt
    );
    let date = Utc::now().to_rfc2822();

    let mut delivery_status = format!(
        "Reporting-MTA: dns; {hostname}\r\nArrival-Date: {date}\r\n"
    );
    for recipient in &recipients {
        delivery_status.push_str(&format!(
            "\r\nOriginal-Recipient: rfc822; {recipient}\r\n\
             Final-Recipient: rfc822; {recipient}\r\n\
             Action: failed\r\n\
             Status: {status}\r\n\
             Diagnostic-Code: smtp; {reason}\r\n"
        ));
    }

    let body = format!(
        "From: Mail Delivery System <{postmaster}>\r\n\
         To: {original_sender}\r\n\
         Subject: Delivery Status Notification (Failure)\r\n\
         Date: {date}\r\n\
         Auto-Submitted: auto-replied\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
         \r\n\
         This is a multi-part message in MIME format.\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         This is the mail system at host {hostname}.\r\n\
         \r\n\
         Your message could not be delivered to one or more recipients.\r\n\
         \r\n\
         {recipient_list}: {reason}\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: message/delivery-status\r\n\
         \r\n\
         {delivery_status}\r\n\
         --{boundary}\r\n\
         Content-Type: message/rfc822\r\n\
         \r\n\
         {original_headers}\r\n\
         --{boundary}--\r\n",
        original_headers = original_headers(envelope),
    );

    let sender = parse_one(&postmaster).ok()?;
    let recipient = parse_one(&original_sender).ok()?;

    let mut bounce_envelope = Envelope::new(Some(sender));
    bounce_envelope.add_recipient(recipient);
    bounce_envelope.set_data(MailData::Bytes(body.into_bytes()));
    bounce_envelope.set_date(date);

    // Destination hosts are resolved from the sender's MX at delivery time.
    let mut session = Session::outbound(Route::via_mx(25).with_outbound(outbound));
    session.open_envelope(bounce_envelope);

    counter::increment(counter::BOUNCE_GENERATED);
    tracing::info!(
        original = %failed.session.uid(),
        bounce = %session.uid(),
        sender = %original_sender,
        "bounce generated"
    );

    Some(RelaySession::new(
        session,
        QueueProtocol::Esmtp,
        failed.max_retries,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{generate, should_bounce};
    use robin_common::{
        address::parse_one,
        config::OutboundConfig,
        envelope::{Envelope, MailData},
        session::{Route, Session},
        transaction::{Transaction, TransactionList},
    };
    use robin_queue::{QueueProtocol, RelaySession};

    fn failed_entry() -> (RelaySession, Envelope, TransactionList) {
        let mut envelope = Envelope::new(Some(parse_one("sender@ex.com").unwrap()));
        envelope.add_recipient(parse_one("fail@ex.com").unwrap());
        envelope.set_data(MailData::Bytes(
            b"From: sender@ex.com\r\nSubject: original\r\n\r\nbody".to_vec(),
        ));

        let mut transactions = TransactionList::new();
        transactions.record_rcpt(
            "fail@ex.com",
            Transaction::new("RCPT TO:<fail@ex.com>", "550 5.1.1 No such user", true),
        );

        let mut session = Session::outbound(Route::to_host("mx.ex.com", 25));
        session.open_envelope(envelope.clone());

        (
            RelaySession::new(session, QueueProtocol::Esmtp, 3),
            envelope,
            transactions,
        )
    }

    #[test]
    fn bounce_has_report_structure_and_addresses() {
        let (entry, envelope, transactions) = failed_entry();
        let outbound = OutboundConfig {
            retry: 3,
            delay: 7,
            ..OutboundConfig::default()
        };
        let bounce =
            generate(&entry, &envelope, &transactions, "mx.robin.test", &outbound).unwrap();

        // The bounce route carries the administrator's outbound settings.
        let route = bounce.session.route().unwrap();
        assert!(route.hosts.is_empty());
        assert_eq!(route.retry, 3);
        assert_eq!(route.delay_secs, 7);

        let bounce_envelope = &bounce.session.envelopes()[0];
        assert_eq!(
            bounce_envelope.sender().unwrap().email(),
            Some("mailer-daemon@mx.robin.test")
        );
        assert_eq!(
            bounce_envelope.recipients()[0].email(),
            Some("sender@ex.com")
        );

        let Some(MailData::Bytes(body)) = bounce_envelope.data() else {
            panic!("bounce body must be in memory");
        };
        let body = String::from_utf8_lossy(body);

        assert!(body.contains("multipart/report"));
        assert!(body.contains("Reporting-MTA: dns; mx.robin.test"));
        assert!(body.contains("Final-Recipient: rfc822; fail@ex.com"));
        assert!(body.contains("Action: failed"));
        assert!(body.contains("Status: 5.0.0"));
        assert!(body.contains("Diagnostic-Code: smtp; 550 5.1.1 No such user"));
        assert!(body.contains("Subject: original"));
    }

    #[test]
    fn null_sender_is_suppressed() {
        let envelope = Envelope::new(None);
        assert!(!should_bounce(&envelope));
    }

    #[test]
    fn mailer_daemon_original_is_suppressed() {
        let envelope = Envelope::new(Some(parse_one("MAILER-DAEMON@ex.com").unwrap()));
        assert!(!should_bounce(&envelope));

        let (entry, _, transactions) = failed_entry();
        assert!(generate(
            &entry,
            &envelope,
            &transactions,
            "mx.robin.test",
            &OutboundConfig::default()
        )
        .is_none());
    }

    #[test]
    fn temporary_reason_maps_to_4xx_status() {
        let (entry, envelope, _) = failed_entry();
        let mut transactions = TransactionList::new();
        transactions.record_rcpt(
            "fail@ex.com",
            Transaction::new("RCPT TO:<fail@ex.com>", "421 busy", true),
        );

        let bounce = generate(
            &entry,
            &envelope,
            &transactions,
            "mx.robin.test",
            &OutboundConfig::default(),
        )
        .unwrap();
        let Some(MailData::Bytes(body)) = bounce.session.envelopes()[0].data() else {
            panic!("bounce body must be in memory");
        };
        assert!(String::from_utf8_lossy(body).contains("Status: 4.0.0"));
    }
}
