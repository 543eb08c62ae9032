//! RFC-822/MIME decoding into [`FetchedMail`], shared by the IMAP and
//! drop-folder providers.

use crate::{FetchedMail, ProviderError, Result};
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde_json::{json, Map, Value};

/// Decode one raw message. `uid` is assigned by the caller (folder
/// semantics differ per provider).
pub fn parse_rfc822(uid: i64, raw: &[u8]) -> Result<FetchedMail> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ProviderError::MalformedMessage(format!("unparseable message, uid {uid}")))?;

    let subject = message.subject().unwrap_or_default().to_string();
    let message_id = message
        .message_id()
        .map(|id| format!("<{id}>"))
        .unwrap_or_default();
    let from_address = first_address(message.from());
    let to_addresses = all_addresses(message.to());
    let cc_addresses = all_addresses(message.cc());

    let date_header: Option<DateTime<Utc>> = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    let mut headers = Map::new();
    for (name, value) in message.headers_raw() {
        headers
            .entry(name.trim().to_string())
            .or_insert_with(|| json!(value.trim()));
    }

    let body_text = message
        .body_text(0)
        .map(|b| b.to_string())
        .unwrap_or_default();
    let body_html = message
        .body_html(0)
        .map(|b| b.to_string())
        .unwrap_or_default();

    // Calendar payloads ride along as text/calendar parts or .ics
    // attachments.
    let mut ics_content = None;
    let mut attachments = Vec::new();
    for part in message.attachments() {
        let name = part.attachment_name().unwrap_or("").to_string();
        let ctype = part
            .content_type()
            .map(|c| match c.subtype() {
                Some(sub) => format!("{}/{}", c.ctype(), sub),
                None => c.ctype().to_string(),
            })
            .unwrap_or_default();
        if ics_content.is_none() && (ctype.eq_ignore_ascii_case("text/calendar") || name.ends_with(".ics")) {
            ics_content = part.text_contents().map(|t| t.to_string());
        }
        attachments.push(json!({
            "filename": name,
            "content_type": ctype,
            "size": part.contents().len(),
        }));
    }
    if ics_content.is_none() {
        for part in &message.parts {
            let is_calendar = part
                .content_type()
                .is_some_and(|c| {
                    c.ctype().eq_ignore_ascii_case("text")
                        && c.subtype().is_some_and(|s| s.eq_ignore_ascii_case("calendar"))
                });
            if is_calendar {
                ics_content = part.text_contents().map(|t| t.to_string());
                break;
            }
        }
    }

    Ok(FetchedMail {
        uid,
        message_id,
        subject,
        from_address,
        to_addresses,
        cc_addresses,
        date_header,
        headers: Value::Object(headers),
        body_text,
        body_html,
        ics_content,
        attachments: json!(attachments),
    })
}

fn first_address(addr: Option<&mail_parser::Address>) -> String {
    addr.and_then(|a| a.first())
        .map(format_addr)
        .unwrap_or_default()
}

fn all_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    addr.map(|a| a.iter().map(format_addr).collect())
        .unwrap_or_default()
}

fn format_addr(addr: &mail_parser::Addr) -> String {
    let email = addr.address.as_deref().unwrap_or("");
    match addr.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{name} <{email}>"),
        _ => email.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <alert-1@mon.example.com>\r\n\
From: OP5 Monitor <op5@mon.example.com>\r\n\
To: noc@example.com\r\n\
Subject: ** PROBLEM ** Host: web-01 Service: http State: CRITICAL\r\n\
Date: Fri, 1 Mar 2024 12:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Service: http\r\nState: CRITICAL\r\nAdditional Info: timeout\r\n";

    #[test]
    fn parses_headers_and_body() {
        let mail = parse_rfc822(7, RAW).unwrap();
        assert_eq!(mail.uid, 7);
        assert_eq!(mail.message_id, "<alert-1@mon.example.com>");
        assert!(mail.subject.starts_with("** PROBLEM **"));
        assert!(mail.from_address.contains("op5@mon.example.com"));
        assert_eq!(mail.to_addresses, vec!["noc@example.com"]);
        assert!(mail.body_text.contains("Additional Info: timeout"));
        assert!(mail.date_header.is_some());
        assert!(mail.ics_content.is_none());
        // Case-insensitive header lookup happens downstream; the raw map
        // carries what was on the wire.
        assert!(mail.headers.get("Subject").is_some());
    }

    #[test]
    fn garbage_is_a_malformed_message() {
        // mail-parser is lenient; a completely empty input is the
        // reliable failure case.
        let result = parse_rfc822(1, b"");
        assert!(result.is_err() || result.unwrap().subject.is_empty());
    }

    #[test]
    fn calendar_part_is_extracted() {
        let raw = b"Message-ID: <mw@cal>\r\n\
From: netops@example.com\r\n\
Subject: Maintenance window\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
Maintenance tonight.\r\n\
--b1\r\n\
Content-Type: text/calendar; method=REQUEST\r\n\
\r\n\
BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:mw-1@cal\r\nDTSTART:20240301T220000Z\r\nDTEND:20240302T000000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n\
--b1--\r\n";
        let mail = parse_rfc822(2, raw).unwrap();
        let ics = mail.ics_content.expect("calendar part");
        assert!(ics.contains("BEGIN:VEVENT"));
        assert!(mail.body_text.contains("Maintenance tonight"));
    }
}
