//! Event ingestion into the counter families

use chrono::Utc;
use serde_json::Value;
use std::net::Ipv4Addr;

use crate::engine::fields;
use crate::engine::StatsEngine;
use crate::error::{Error, Result};
use crate::models::Event;
use crate::scope::TimeScope;
use crate::storage::{
    escape_segment, Document, DocumentStore, FieldPath, Filter, StorageError, Update, UpdateOptions,
};

impl StatsEngine {
    /// Validate an event and apply it to the raw log and the counters
    ///
    /// Global target and action total counters are only touched once the raw
    /// target increment has affected a document.
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        event.validate()?;

        if self.keep_events {
            self.save_event(event).await?;
        }

        if self.count_events && self.count_raw_target(event).await? {
            self.count_target(event).await?;
            self.count_target_actions(event).await?;
        }

        Ok(())
    }

    async fn save_event(&self, event: &Event) -> Result<()> {
        let mut doc = Document::new();
        doc.insert(fields::CLIENT.into(), event.client_id.clone().into());
        doc.insert(fields::TARGET.into(), event.target.clone().into());
        doc.insert(fields::TARGET_TYPE.into(), event.target_type.clone().into());
        doc.insert(fields::ACTION.into(), event.action.clone().into());
        doc.insert(fields::DATE.into(), event.timestamp.timestamp_millis().into());

        if !event.metadata.is_empty() {
            let meta: Document = event
                .metadata
                .iter()
                .map(|(key, value)| (meta_segment(key), Value::from(meta_key_value(key, value))))
                .collect();
            doc.insert(fields::META.into(), Value::Object(meta));
        }

        let bucket = self.events_bucket().await?;
        self.store.insert(&bucket, doc).await?;
        tracing::debug!("Saved event {}/{}/{}", event.client_id, event.target, event.action);
        Ok(())
    }

    /// Increment the monthly raw target document, returning whether one was affected
    async fn count_raw_target(&self, event: &Event) -> Result<bool> {
        let calendar = event.calendar();
        let filter = Filter::new()
            .eq(FieldPath::field(fields::CLIENT), event.client_id.as_str())
            .eq(FieldPath::field(fields::TARGET), event.target.as_str())
            .eq(FieldPath::field(fields::TARGET_TYPE), event.target_type.as_str())
            .eq(FieldPath::field(fields::ACTION), event.action.as_str())
            .eq(FieldPath::field(fields::DATE), event.year_month_date().timestamp_millis())
            .eq(FieldPath::field(fields::YEAR), calendar.year)
            .eq(FieldPath::field(fields::MONTH), calendar.month);

        let mut update = Update::new().inc(FieldPath::field(fields::COUNT), 1);

        // Metadata counters live at the deepest recorded granularity
        let mut meta_base = FieldPath::new();
        if matches!(self.precision, TimeScope::Daily | TimeScope::Hourly) {
            let day = FieldPath::field(fields::DAYS).push(calendar.day);
            update = update.inc(day.clone().push(fields::COUNT), 1);
            meta_base = day;
            if self.precision == TimeScope::Hourly {
                let hour = meta_base.clone().push(fields::HOURS).push(calendar.hour);
                update = update.inc(hour.clone().push(fields::COUNT), 1);
                meta_base = hour;
            }
        }

        for (key, value) in &event.metadata {
            let path = meta_base
                .clone()
                .push(fields::META)
                .push(meta_segment(key))
                .push(meta_segment(&meta_key_value(key, value)));
            update = update.inc(path, 1);
        }

        update = add_owners_tags(update, event);

        let bucket = self.targets_bucket().await?;
        let outcome = match self
            .store
            .update(&bucket, &filter, &update, UpdateOptions::upsert_multi())
            .await
        {
            Ok(outcome) => outcome,
            Err(StorageError::Conflict { index }) => {
                tracing::warn!("Duplicate event on index {}: {:?}", index, event);
                return Err(Error::DuplicateEvent {
                    event: describe(event),
                });
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Raw target counter updated: {:?}", outcome);
        Ok(outcome.affected())
    }

    async fn count_target(&self, event: &Event) -> Result<()> {
        let filter = target_filter(event);
        let action = FieldPath::field(fields::ACTIONS).push(&event.action);
        let update = Update::new()
            .set(
                action.clone().push(fields::TOUCHED_AT),
                Utc::now().timestamp_millis(),
            )
            .inc(action.push(fields::COUNT), 1);
        let update = add_owners_tags(update, event);

        let bucket = self.counters_bucket().await?;
        self.store
            .update(&bucket, &filter, &update, UpdateOptions::upsert())
            .await?;
        Ok(())
    }

    async fn count_target_actions(&self, event: &Event) -> Result<()> {
        let filter = Filter::new()
            .eq(FieldPath::field(fields::CLIENT), event.client_id.as_str())
            .eq(FieldPath::field(fields::ACTION), event.action.as_str());
        let update = Update::new()
            .set(FieldPath::field(fields::TOUCHED_AT), Utc::now().timestamp_millis())
            .inc(FieldPath::field(fields::TOTAL), 1)
            .inc(
                FieldPath::field(fields::TARGETS)
                    .push(&event.target_type)
                    .push(fields::COUNT),
                1,
            );

        let bucket = self.actions_bucket().await?;
        self.store
            .update(&bucket, &filter, &update, UpdateOptions::upsert())
            .await?;
        Ok(())
    }
}

fn describe(event: &Event) -> String {
    format!(
        "{}/{}/{}/{} at {}",
        event.client_id,
        event.target_type,
        event.target,
        event.action,
        event.timestamp.to_rfc3339()
    )
}

fn target_filter(event: &Event) -> Filter {
    Filter::new()
        .eq(FieldPath::field(fields::CLIENT), event.client_id.as_str())
        .eq(FieldPath::field(fields::TARGET), event.target.as_str())
        .eq(FieldPath::field(fields::TARGET_TYPE), event.target_type.as_str())
}

fn add_owners_tags(mut update: Update, event: &Event) -> Update {
    if let Some(owners) = &event.target_owners {
        update = update.add_to_set(FieldPath::field(fields::OWNERS), owners.iter().map(String::as_str));
    }
    if let Some(tags) = &event.target_tags {
        update = update.add_to_set(FieldPath::field(fields::TAGS), tags.iter().map(String::as_str));
    }
    update
}

/// Escaped metadata key or value, [`fields::BLANK_SEGMENT`] when nothing survives escaping
///
/// Counter paths need a fixed `meta.<key>.<value>` depth.
fn meta_segment(raw: &str) -> String {
    escape_segment(raw).unwrap_or_else(|| fields::BLANK_SEGMENT.to_string())
}

/// Encode a metadata value for use as a counter key
///
/// Strings are kept verbatim, other values use their JSON text. Values of the
/// `ip` key that parse as dotted IPv4 are packed into their 32-bit integer.
pub fn meta_key_value(key: &str, value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if key != fields::META_IP {
        return text;
    }

    if text.split('.').count() == 4 {
        match text.parse::<Ipv4Addr>() {
            Ok(ip) => return u32::from(ip).to_string(),
            Err(e) => tracing::warn!("Invalid IPv4 metadata {}={}: {}", key, text, e),
        }
    } else {
        tracing::warn!("Unsupported IP metadata {}={}, keeping literal", key, text);
    }
    text
}
