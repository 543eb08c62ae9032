//! Maintenance-window detection from inbound mail: recognized subject
//! prefixes, a structured body grammar, and calendar-invite payloads.
//! Calendar start/end/recurrence override body values.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ngs_common::types::{SuppressMode, WindowSource};
use ngs_storage::{EmailRow, NewWindow};
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

use crate::ics;
use crate::scope::{parse_selector_list, Scope};

pub const DEFAULT_SUBJECT_PREFIXES: &[&str] =
    &["[MW]", "[Maintenance]", "Maintenance:", "MAINTENANCE:"];

const BODY_KEYWORDS: &[&str] = &["maintenance window", "scheduled maintenance", "planned outage"];

/// Outcome of looking at one email for maintenance content.
#[derive(Debug, Clone)]
pub enum WindowDetection {
    /// A window to create or update.
    Window(Box<NewWindow>),
    /// A calendar cancellation for a previously created window.
    Cancelled { external_event_id: String },
}

pub struct MaintenanceDetector {
    subject_prefixes: Vec<String>,
}

fn body_field_re(name: &str) -> Regex {
    RegexBuilder::new(&format!(r"{name}:\s*(.+?)\s*(?:\r?\n|$)"))
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .expect("static body grammar pattern")
}

fn mode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"Mode:\s*(mute|downgrade|digest)")
            .case_insensitive(true)
            .build()
            .unwrap()
    })
}

impl MaintenanceDetector {
    pub fn new(subject_prefixes: Vec<String>) -> Self {
        let subject_prefixes = if subject_prefixes.is_empty() {
            DEFAULT_SUBJECT_PREFIXES.iter().map(|p| p.to_string()).collect()
        } else {
            subject_prefixes
        };
        Self { subject_prefixes }
    }

    /// Cheap gate: does this email look like a maintenance notification?
    pub fn is_maintenance_email(&self, subject: &str, body: &str, has_ics: bool) -> bool {
        if has_ics {
            return true;
        }
        let subject_lower = subject.to_lowercase();
        if self
            .subject_prefixes
            .iter()
            .any(|p| subject_lower.contains(&p.to_lowercase()))
        {
            return true;
        }
        let body_lower = body.to_lowercase();
        BODY_KEYWORDS.iter().any(|k| body_lower.contains(k))
    }

    /// Extract a window candidate from an email previously gated by
    /// [`Self::is_maintenance_email`].
    pub fn detect(&self, email: &EmailRow) -> Option<WindowDetection> {
        let body = email.best_body().to_string();

        let ics_event = email.ics_content.as_deref().and_then(ics::parse_first_event);

        if let Some(ev) = &ics_event {
            if ev.cancelled {
                if let Some(uid) = &ev.uid {
                    return Some(WindowDetection::Cancelled {
                        external_event_id: uid.clone(),
                    });
                }
            }
        }

        // Body grammar.
        let title = capture(&body_field_re("Title"), &body);
        let scope_str = capture(&body_field_re("Scope"), &body);
        let mode = mode_re()
            .captures(&body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<SuppressMode>().ok());
        let tz_name = capture(&body_field_re("Timezone"), &body);
        let tz: Option<Tz> = tz_name.as_deref().and_then(|t| t.parse().ok());
        let body_start = capture(&body_field_re("Start"), &body)
            .and_then(|s| parse_timestamp(&s, tz));
        let body_end = capture(&body_field_re("End"), &body).and_then(|s| parse_timestamp(&s, tz));

        // Scope from the body grammar, falling back to the calendar
        // description.
        let mut scope = scope_str.map(|s| parse_selector_list(&s)).unwrap_or_default();
        if scope.is_empty() {
            if let Some(desc) = ics_event.as_ref().and_then(|e| e.description.as_deref()) {
                if let Some(line) = desc
                    .lines()
                    .find_map(|l| l.trim().strip_prefix("Scope:").map(|s| s.trim().to_string()))
                {
                    scope = parse_selector_list(&line);
                }
            }
        }

        // Calendar times override body values.
        let start = ics_event
            .as_ref()
            .and_then(|e| e.start)
            .or(body_start)
            .or(email.date_header)
            .unwrap_or(email.received_at);
        let end = ics_event
            .as_ref()
            .and_then(|e| e.end)
            .or(body_end)
            .unwrap_or(start + Duration::hours(2));

        let timezone = ics_event
            .as_ref()
            .and_then(|e| e.timezone.clone())
            .or(tz_name)
            .unwrap_or_else(|| "UTC".to_string());

        let title = title
            .or_else(|| ics_event.as_ref().and_then(|e| e.summary.clone()))
            .unwrap_or_else(|| email.subject.clone());

        let organizer = split_display_name(&email.from_address);

        Some(WindowDetection::Window(Box::new(NewWindow {
            source: WindowSource::Email,
            raw_email_id: Some(email.id.clone()),
            external_event_id: ics_event.as_ref().and_then(|e| e.uid.clone()),
            title: truncate(&title, 500),
            description: Some(truncate(&body, 500)).filter(|d| !d.is_empty()),
            organizer: Some(organizer).filter(|o| !o.is_empty()),
            organizer_email: Some(email.from_address.clone()).filter(|o| !o.is_empty()),
            start_ts: start,
            end_ts: end,
            timezone,
            scope: serde_json::to_value(&scope).unwrap_or_default(),
            suppress_mode: mode.unwrap_or(SuppressMode::Mute),
            is_recurring: ics_event.as_ref().map(|e| e.rrule.is_some()).unwrap_or(false),
            recurrence_rule: ics_event.and_then(|e| e.rrule),
        })))
    }
}

/// Parse the scope JSON stored on a window row.
pub fn scope_from_value(value: &serde_json::Value) -> Scope {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Accepted timestamp forms, naive ones interpreted in `tz` (UTC when
/// absent).
fn parse_timestamp(input: &str, tz: Option<Tz>) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return match tz {
                Some(tz) => tz
                    .from_local_datetime(&naive)
                    .single()
                    .map(|t| t.with_timezone(&Utc)),
                None => Some(Utc.from_utc_datetime(&naive)),
            };
        }
    }
    None
}

fn split_display_name(from_address: &str) -> String {
    match from_address.split_once('<') {
        Some((name, _)) => name.trim().trim_matches('"').to_string(),
        None => from_address.trim().to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email(subject: &str, body: &str, ics: Option<&str>) -> EmailRow {
        EmailRow {
            id: "e1".to_string(),
            folder: "MAINTENANCE".to_string(),
            uid: 1,
            message_id: "<m@x>".to_string(),
            subject: subject.to_string(),
            from_address: "NetOps <netops@example.com>".to_string(),
            to_addresses: vec![],
            cc_addresses: vec![],
            date_header: None,
            headers: json!({}),
            body_text: body.to_string(),
            body_html: String::new(),
            ics_content: ics.map(|s| s.to_string()),
            attachments: json!([]),
            received_at: Utc::now(),
            parse_status: "pending".to_string(),
            parse_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn subject_prefix_gates_detection() {
        let det = MaintenanceDetector::new(vec![]);
        assert!(det.is_maintenance_email("[MW] switch upgrade", "", false));
        assert!(det.is_maintenance_email("Maintenance: db failover", "", false));
        assert!(det.is_maintenance_email("fyi", "scheduled maintenance tonight", false));
        assert!(det.is_maintenance_email("invite", "", true));
        assert!(!det.is_maintenance_email("** PROBLEM ** disk", "disk full", false));
    }

    #[test]
    fn structured_body_parses_all_fields() {
        let det = MaintenanceDetector::new(vec![]);
        let body = "Title: Core DB failover\nScope: host=db-*;env=prod\nMode: downgrade\nStart: 2024-03-01 22:00\nEnd: 2024-03-02 02:00\nTimezone: Europe/Stockholm\n";
        let email = email("[MW] db work", body, None);
        let Some(WindowDetection::Window(w)) = det.detect(&email) else {
            panic!("expected window");
        };
        assert_eq!(w.title, "Core DB failover");
        assert_eq!(w.suppress_mode, SuppressMode::Downgrade);
        assert_eq!(w.timezone, "Europe/Stockholm");
        // 22:00 CET == 21:00 UTC
        assert_eq!(w.start_ts.to_rfc3339(), "2024-03-01T21:00:00+00:00");
        assert!(w.end_ts > w.start_ts);
        let scope = scope_from_value(&w.scope);
        assert_eq!(scope.hosts, vec!["db-*"]);
        assert_eq!(scope.environments, vec!["prod"]);
        assert_eq!(w.organizer.as_deref(), Some("NetOps"));
    }

    #[test]
    fn missing_times_default_to_two_hours() {
        let det = MaintenanceDetector::new(vec![]);
        let email = email("[MW] quick fix", "Scope: host=web-01\n", None);
        let Some(WindowDetection::Window(w)) = det.detect(&email) else {
            panic!("expected window");
        };
        assert_eq!(w.end_ts - w.start_ts, Duration::hours(2));
        assert_eq!(w.suppress_mode, SuppressMode::Mute);
    }

    #[test]
    fn ics_times_override_body() {
        let det = MaintenanceDetector::new(vec![]);
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:mw-9@cal\r\nSUMMARY:Switch upgrade\r\nDTSTART:20240310T220000Z\r\nDTEND:20240311T000000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let body = "Start: 2024-01-01 00:00\nEnd: 2024-01-01 01:00\nScope: host=core-*\n";
        let email = email("invite", body, Some(ics));
        let Some(WindowDetection::Window(w)) = det.detect(&email) else {
            panic!("expected window");
        };
        assert_eq!(w.start_ts.to_rfc3339(), "2024-03-10T22:00:00+00:00");
        assert_eq!(w.external_event_id.as_deref(), Some("mw-9@cal"));
    }

    #[test]
    fn cancellation_is_surfaced() {
        let det = MaintenanceDetector::new(vec![]);
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:mw-9@cal\r\nSTATUS:CANCELLED\r\nDTSTART:20240310T220000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let email = email("cancelled: switch upgrade", "", Some(ics));
        match det.detect(&email) {
            Some(WindowDetection::Cancelled { external_event_id }) => {
                assert_eq!(external_event_id, "mw-9@cal");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
