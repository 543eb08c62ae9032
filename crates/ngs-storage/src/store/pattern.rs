use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::pattern_cache::{self, Column, Entity};
use crate::entities::pattern_extraction_log;
use crate::MailStore;

/// EWMA weight applied per validation sample when updating success_rate.
const SUCCESS_RATE_WEIGHT: f64 = 0.05;

/// 学习到的提取规则缓存行（来自 pattern_cache 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRow {
    pub id: String,
    pub signature_hash: String,
    pub from_domain: Option<String>,
    pub subject_prefix: Option<String>,
    pub body_markers: Vec<String>,
    pub source_name: String,
    pub source_tool: String,
    pub extraction_rules: serde_json::Value,
    pub match_count: i64,
    pub success_rate: f64,
    pub is_approved: bool,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 新缓存模式插入请求（LLM 学习产物）。
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub signature_hash: String,
    pub from_domain: Option<String>,
    pub subject_prefix: Option<String>,
    pub body_markers: Vec<String>,
    pub source_name: String,
    pub source_tool: String,
    pub extraction_rules: serde_json::Value,
    pub analysis_duration_ms: Option<i64>,
    pub created_from_email_id: Option<String>,
}

fn to_row(m: pattern_cache::Model) -> PatternRow {
    PatternRow {
        id: m.id,
        signature_hash: m.signature_hash,
        from_domain: m.from_domain,
        subject_prefix: m.subject_prefix,
        body_markers: serde_json::from_str(&m.body_markers).unwrap_or_default(),
        source_name: m.source_name,
        source_tool: m.source_tool,
        extraction_rules: serde_json::from_str(&m.extraction_rules).unwrap_or_default(),
        match_count: m.match_count,
        success_rate: m.success_rate,
        is_approved: m.is_approved,
        last_matched_at: m.last_matched_at.map(|t| t.with_timezone(&Utc)),
        created_at: m.created_at.with_timezone(&Utc),
    }
}

/// Audit record describing one rule/cache/LLM extraction attempt.
#[derive(Debug, Clone)]
pub struct ExtractionLogEntry {
    pub raw_email_id: String,
    pub pattern_cache_id: Option<String>,
    pub extraction_type: String,
    pub extracted_host: Option<String>,
    pub extracted_service: Option<String>,
    pub extracted_severity: Option<String>,
    pub extracted_state: Option<String>,
    pub extraction_confidence: Option<f64>,
    pub llm_response: Option<serde_json::Value>,
    pub duration_ms: i64,
}

impl MailStore {
    pub async fn find_pattern_by_signature(&self, signature_hash: &str) -> Result<Option<PatternRow>> {
        let model = Entity::find()
            .filter(Column::SignatureHash.eq(signature_hash))
            .one(self.db())
            .await?;
        Ok(model.map(to_row))
    }

    /// Cache a freshly learned pattern. On signature collision the existing
    /// row wins and only its match statistics are touched; the LLM is
    /// consulted at most once per format.
    pub async fn insert_learned_pattern(&self, new: &NewPattern) -> Result<PatternRow> {
        if let Some(existing) = self.find_pattern_by_signature(&new.signature_hash).await? {
            self.record_pattern_match(&existing.id, true).await?;
            return Ok(existing);
        }

        let now = Utc::now().fixed_offset();
        let am = pattern_cache::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            signature_hash: Set(new.signature_hash.clone()),
            from_domain: Set(new.from_domain.clone()),
            subject_prefix: Set(new.subject_prefix.clone()),
            body_markers: Set(serde_json::to_string(&new.body_markers)?),
            source_name: Set(new.source_name.clone()),
            source_tool: Set(new.source_tool.clone()),
            extraction_rules: Set(new.extraction_rules.to_string()),
            match_count: Set(1),
            success_rate: Set(100.0),
            is_approved: Set(false),
            last_matched_at: Set(Some(now)),
            analysis_duration_ms: Set(new.analysis_duration_ms),
            created_from_email_id: Set(new.created_from_email_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let model = am.insert(self.db()).await?;
        tracing::info!(
            signature = %new.signature_hash,
            source = %new.source_name,
            "Cached new extraction pattern"
        );
        Ok(to_row(model))
    }

    /// Record a cache application. `success` is whether the extracted
    /// fields survived validation; success_rate moves toward 100 or 0 by
    /// an exponentially weighted step.
    pub async fn record_pattern_match(&self, pattern_id: &str, success: bool) -> Result<bool> {
        let model = Entity::find_by_id(pattern_id).one(self.db()).await?;
        if let Some(m) = model {
            let target = if success { 100.0 } else { 0.0 };
            let rate = m.success_rate * (1.0 - SUCCESS_RATE_WEIGHT) + target * SUCCESS_RATE_WEIGHT;
            let next_count = m.match_count + 1;
            let now = Utc::now().fixed_offset();
            let mut am: pattern_cache::ActiveModel = m.into();
            am.match_count = Set(next_count);
            am.success_rate = Set(rate);
            am.last_matched_at = Set(Some(now));
            am.updated_at = Set(now);
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn set_pattern_approved(&self, pattern_id: &str, approved: bool) -> Result<bool> {
        let model = Entity::find_by_id(pattern_id).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: pattern_cache::ActiveModel = m.into();
            am.is_approved = Set(approved);
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn list_patterns(&self, limit: usize, offset: usize) -> Result<Vec<PatternRow>> {
        let rows = Entity::find()
            .order_by(Column::MatchCount, Order::Desc)
            .limit(limit as u64)
            .offset(offset as u64)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    /// Append one extraction audit record.
    pub async fn log_extraction(&self, entry: &ExtractionLogEntry) -> Result<()> {
        let am = pattern_extraction_log::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            raw_email_id: Set(entry.raw_email_id.clone()),
            pattern_cache_id: Set(entry.pattern_cache_id.clone()),
            extraction_type: Set(entry.extraction_type.clone()),
            extracted_host: Set(entry.extracted_host.clone()),
            extracted_service: Set(entry.extracted_service.clone()),
            extracted_severity: Set(entry.extracted_severity.clone()),
            extracted_state: Set(entry.extracted_state.clone()),
            extraction_confidence: Set(entry.extraction_confidence),
            llm_response: Set(entry.llm_response.as_ref().map(|v| v.to_string())),
            duration_ms: Set(entry.duration_ms),
            created_at: Set(Utc::now().fixed_offset()),
        };
        am.insert(self.db()).await?;
        Ok(())
    }
}
