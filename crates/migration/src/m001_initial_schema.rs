use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(UP_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DOWN_SQL)
            .await?;
        Ok(())
    }
}

const UP_SQL: &str = "
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS raw_emails (
    id TEXT PRIMARY KEY NOT NULL,
    folder TEXT NOT NULL,
    uid INTEGER NOT NULL,
    message_id TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL DEFAULT '',
    from_address TEXT NOT NULL DEFAULT '',
    to_addresses TEXT NOT NULL DEFAULT '[]',
    cc_addresses TEXT NOT NULL DEFAULT '[]',
    date_header TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    body_text TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    ics_content TEXT,
    attachments TEXT NOT NULL DEFAULT '[]',
    received_at TEXT NOT NULL,
    parse_status TEXT NOT NULL DEFAULT 'pending',
    parse_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_raw_emails_folder_uid ON raw_emails(folder, uid);
CREATE INDEX IF NOT EXISTS idx_raw_emails_parse_status ON raw_emails(parse_status, received_at);

CREATE TABLE IF NOT EXISTS alert_events (
    id TEXT PRIMARY KEY NOT NULL,
    raw_email_id TEXT,
    source_tool TEXT NOT NULL,
    environment TEXT,
    region TEXT,
    host TEXT,
    check_name TEXT,
    service TEXT,
    severity TEXT NOT NULL DEFAULT 'medium',
    state TEXT NOT NULL DEFAULT 'firing',
    occurred_at TEXT NOT NULL,
    normalized_signature TEXT NOT NULL DEFAULT '',
    fingerprint_v2 TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    is_suppressed INTEGER NOT NULL DEFAULT 0,
    suppression_reason TEXT,
    content_hash TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alert_events_fingerprint ON alert_events(fingerprint_v2, occurred_at);
CREATE INDEX IF NOT EXISTS idx_alert_events_raw_email ON alert_events(raw_email_id);

CREATE TABLE IF NOT EXISTS incidents (
    id TEXT PRIMARY KEY NOT NULL,
    fingerprint_v2 TEXT NOT NULL,
    title TEXT NOT NULL,
    source_tool TEXT NOT NULL,
    environment TEXT,
    region TEXT,
    host TEXT,
    check_name TEXT,
    service TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    severity_current TEXT NOT NULL DEFAULT 'medium',
    severity_max TEXT NOT NULL DEFAULT 'medium',
    last_state TEXT NOT NULL DEFAULT 'firing',
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution_reason TEXT,
    event_count INTEGER NOT NULL DEFAULT 0,
    flap_count INTEGER NOT NULL DEFAULT 0,
    flap_window_started_at TEXT,
    flap_window_count INTEGER NOT NULL DEFAULT 0,
    is_flapping INTEGER NOT NULL DEFAULT 0,
    last_state_change_at TEXT,
    is_in_maintenance INTEGER NOT NULL DEFAULT 0,
    maintenance_window_id TEXT,
    ai_summary TEXT,
    ai_probable_cause TEXT,
    ai_enriched_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
-- One live incident per fingerprint, enforced by the store itself.
CREATE UNIQUE INDEX IF NOT EXISTS ux_incidents_live_fingerprint
    ON incidents(fingerprint_v2)
    WHERE status IN ('open', 'acknowledged', 'resolving');
CREATE INDEX IF NOT EXISTS idx_incidents_status_last_seen ON incidents(status, last_seen_at);
CREATE INDEX IF NOT EXISTS idx_incidents_maintenance ON incidents(is_in_maintenance);

CREATE TABLE IF NOT EXISTS incident_events (
    id TEXT PRIMARY KEY NOT NULL,
    incident_id TEXT NOT NULL,
    alert_event_id TEXT NOT NULL,
    is_deduplicated INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_incident_events_pair ON incident_events(incident_id, alert_event_id);
CREATE INDEX IF NOT EXISTS idx_incident_events_incident ON incident_events(incident_id);

CREATE TABLE IF NOT EXISTS maintenance_windows (
    id TEXT PRIMARY KEY NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    raw_email_id TEXT,
    external_event_id TEXT,
    title TEXT NOT NULL,
    description TEXT,
    organizer TEXT,
    organizer_email TEXT,
    start_ts TEXT NOT NULL,
    end_ts TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    scope TEXT NOT NULL DEFAULT '{}',
    suppress_mode TEXT NOT NULL DEFAULT 'mute',
    is_active INTEGER NOT NULL DEFAULT 1,
    is_recurring INTEGER NOT NULL DEFAULT 0,
    recurrence_rule TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_maintenance_windows_external
    ON maintenance_windows(source, external_event_id)
    WHERE external_event_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_maintenance_windows_active ON maintenance_windows(is_active, start_ts, end_ts);

CREATE TABLE IF NOT EXISTS maintenance_matches (
    id TEXT PRIMARY KEY NOT NULL,
    maintenance_window_id TEXT NOT NULL,
    incident_id TEXT,
    alert_event_id TEXT,
    match_reason TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_maintenance_matches_incident
    ON maintenance_matches(maintenance_window_id, incident_id)
    WHERE incident_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_maintenance_matches_event
    ON maintenance_matches(maintenance_window_id, alert_event_id)
    WHERE alert_event_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS pattern_cache (
    id TEXT PRIMARY KEY NOT NULL,
    signature_hash TEXT NOT NULL UNIQUE,
    from_domain TEXT,
    subject_prefix TEXT,
    body_markers TEXT NOT NULL DEFAULT '[]',
    source_name TEXT NOT NULL,
    source_tool TEXT NOT NULL,
    extraction_rules TEXT NOT NULL DEFAULT '{}',
    match_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 100.0,
    is_approved INTEGER NOT NULL DEFAULT 0,
    last_matched_at TEXT,
    analysis_duration_ms INTEGER,
    created_from_email_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pattern_extraction_log (
    id TEXT PRIMARY KEY NOT NULL,
    raw_email_id TEXT NOT NULL,
    pattern_cache_id TEXT,
    extraction_type TEXT NOT NULL,
    extracted_host TEXT,
    extracted_service TEXT,
    extracted_severity TEXT,
    extracted_state TEXT,
    extraction_confidence REAL,
    llm_response TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_extraction_log_email ON pattern_extraction_log(raw_email_id);

CREATE TABLE IF NOT EXISTS quarantine_events (
    id TEXT PRIMARY KEY NOT NULL,
    raw_email_id TEXT NOT NULL,
    extraction_data TEXT NOT NULL DEFAULT '{}',
    confidence REAL NOT NULL DEFAULT 0,
    quarantine_reason TEXT NOT NULL,
    reviewed_at TEXT,
    reviewed_by TEXT,
    action_taken TEXT,
    edited_data TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quarantine_pending ON quarantine_events(reviewed_at, created_at);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    error_message TEXT NOT NULL DEFAULT '',
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    next_retry_at TEXT,
    last_retry_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    resolved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dlq_due ON dead_letter_queue(status, next_retry_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL DEFAULT 'processing',
    result TEXT,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys(expires_at);

CREATE TABLE IF NOT EXISTS folder_cursors (
    folder TEXT PRIMARY KEY NOT NULL,
    last_uid INTEGER NOT NULL DEFAULT 0,
    last_poll_at TEXT,
    last_success_at TEXT,
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    emails_processed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_versions (
    id TEXT PRIMARY KEY NOT NULL,
    config_type TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    config_data TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT 'system',
    notes TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    activated_at TEXT,
    deactivated_at TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_config_versions_hash ON config_versions(config_type, config_hash);
CREATE INDEX IF NOT EXISTS idx_config_versions_active ON config_versions(config_type, is_active);
";

const DOWN_SQL: &str = "
DROP TABLE IF EXISTS config_versions;
DROP TABLE IF EXISTS folder_cursors;
DROP TABLE IF EXISTS idempotency_keys;
DROP TABLE IF EXISTS dead_letter_queue;
DROP TABLE IF EXISTS quarantine_events;
DROP TABLE IF EXISTS pattern_extraction_log;
DROP TABLE IF EXISTS pattern_cache;
DROP TABLE IF EXISTS maintenance_matches;
DROP TABLE IF EXISTS maintenance_windows;
DROP TABLE IF EXISTS incident_events;
DROP TABLE IF EXISTS incidents;
DROP TABLE IF EXISTS alert_events;
DROP TABLE IF EXISTS raw_emails;
";
