pub mod alert_event;
pub mod config_version;
pub mod dead_letter;
pub mod folder_cursor;
pub mod idempotency_key;
pub mod incident;
pub mod incident_event;
pub mod maintenance_match;
pub mod maintenance_window;
pub mod pattern_cache;
pub mod pattern_extraction_log;
pub mod quarantine_event;
pub mod raw_email;
