//! Minimal calendar-invite (ICS) parsing: enough to turn a VEVENT into a
//! maintenance window candidate. Recurrence rules are recorded verbatim;
//! STATUS:CANCELLED deactivates the window it refers to.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::io::BufReader;

/// One parsed VEVENT.
#[derive(Debug, Clone, Default)]
pub struct IcsEvent {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub organizer_email: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub rrule: Option<String>,
    pub cancelled: bool,
}

/// Parse the first VEVENT of a calendar payload. Malformed payloads are
/// a data condition, not an error: `None`.
pub fn parse_first_event(ics_content: &str) -> Option<IcsEvent> {
    let reader = BufReader::new(ics_content.as_bytes());
    let parser = ical::IcalParser::new(reader);

    for calendar in parser {
        let calendar = match calendar {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse ICS payload");
                return None;
            }
        };
        for event in calendar.events {
            let mut out = IcsEvent::default();
            for prop in &event.properties {
                let value = prop.value.as_deref().unwrap_or("");
                match prop.name.to_uppercase().as_str() {
                    "UID" => out.uid = Some(value.to_string()),
                    "SUMMARY" => out.summary = Some(value.to_string()),
                    "DESCRIPTION" => out.description = Some(unescape_text(value)),
                    "ORGANIZER" => {
                        out.organizer_email =
                            Some(value.trim_start_matches("mailto:").trim_start_matches("MAILTO:").to_string())
                    }
                    "STATUS" => out.cancelled = value.eq_ignore_ascii_case("CANCELLED"),
                    "RRULE" => out.rrule = Some(value.to_string()),
                    "DTSTART" => {
                        let tzid = param_value(prop, "TZID");
                        if out.timezone.is_none() {
                            out.timezone = tzid.clone();
                        }
                        out.start = parse_ics_datetime(value, tzid.as_deref());
                    }
                    "DTEND" => {
                        let tzid = param_value(prop, "TZID");
                        if out.timezone.is_none() {
                            out.timezone = tzid.clone();
                        }
                        out.end = parse_ics_datetime(value, tzid.as_deref());
                    }
                    _ => {}
                }
            }
            return Some(out);
        }
    }
    None
}

fn param_value(prop: &ical::property::Property, name: &str) -> Option<String> {
    prop.params.as_ref().and_then(|params| {
        params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().cloned())
    })
}

/// ICS datetime forms: `20240301T100000Z` (UTC), `20240301T100000` with a
/// TZID parameter, bare `20240301` all-day dates.
fn parse_ics_datetime(value: &str, tzid: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&naive));
    }

    if value.contains('T') {
        let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
        if let Some(tz) = tzid.and_then(|t| t.parse::<Tz>().ok()) {
            return tz
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc));
        }
        return Some(Utc.from_utc_datetime(&naive));
    }

    // All-day date.
    let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn unescape_text(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\,", ",")
        .replace("\\;", ";")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ICS: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:mw-42@cal.example.com\r\nSUMMARY:Core switch firmware upgrade\r\nDESCRIPTION:Scope: host=core-sw-*\\nMode: mute\r\nORGANIZER:mailto:netops@example.com\r\nDTSTART:20240301T220000Z\r\nDTEND:20240302T020000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn parses_utc_event() {
        let event = parse_first_event(ICS).unwrap();
        assert_eq!(event.uid.as_deref(), Some("mw-42@cal.example.com"));
        assert_eq!(event.summary.as_deref(), Some("Core switch firmware upgrade"));
        assert_eq!(event.organizer_email.as_deref(), Some("netops@example.com"));
        assert!(!event.cancelled);
        let start = event.start.unwrap();
        let end = event.end.unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T22:00:00+00:00");
        assert!(end > start);
        assert!(event.description.unwrap().contains("host=core-sw-*"));
    }

    #[test]
    fn parses_tzid_event() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\nDTSTART;TZID=Europe/Stockholm:20240301T230000\r\nDTEND;TZID=Europe/Stockholm:20240302T010000\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_first_event(ics).unwrap();
        // 23:00 CET == 22:00 UTC
        assert_eq!(event.start.unwrap().to_rfc3339(), "2024-03-01T22:00:00+00:00");
        assert_eq!(event.timezone.as_deref(), Some("Europe/Stockholm"));
    }

    #[test]
    fn cancelled_event_is_flagged() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:mw-42@cal.example.com\r\nSTATUS:CANCELLED\r\nDTSTART:20240301T220000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_first_event(ics).unwrap();
        assert!(event.cancelled);
    }

    #[test]
    fn rrule_is_recorded_verbatim() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:weekly\r\nRRULE:FREQ=WEEKLY;BYDAY=SU\r\nDTSTART:20240303T010000Z\r\nDTEND:20240303T030000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_first_event(ics).unwrap();
        assert_eq!(event.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=SU"));
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_first_event("not a calendar").is_none());
    }
}
