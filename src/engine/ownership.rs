use crate::engine::fields;
use crate::engine::StatsEngine;
use crate::error::{Error, Result};
use crate::storage::{DocumentStore, FieldPath, Filter, Update, UpdateOptions};

/// One target or a list of targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    /// Add the target condition: equality for one, membership for several, none when empty
    fn apply(&self, filter: Filter) -> Filter {
        let path = FieldPath::field(fields::TARGET);
        match self {
            Targets::One(target) => filter.eq(path, target.as_str()),
            Targets::Many(targets) => match targets.as_slice() {
                [] => filter,
                [target] => filter.eq(path, target.as_str()),
                targets => filter.is_in(path, targets.iter().map(String::as_str)),
            },
        }
    }
}

impl From<&str> for Targets {
    fn from(target: &str) -> Self {
        Targets::One(target.to_string())
    }
}

impl From<String> for Targets {
    fn from(target: String) -> Self {
        Targets::One(target)
    }
}

impl From<Vec<String>> for Targets {
    fn from(targets: Vec<String>) -> Self {
        Targets::Many(targets)
    }
}

impl From<Vec<&str>> for Targets {
    fn from(targets: Vec<&str>) -> Self {
        Targets::Many(targets.into_iter().map(str::to_string).collect())
    }
}

impl StatsEngine {
    /// Replace the owners of the given targets on raw and global target counters
    pub async fn set_target_owners(
        &self,
        client_id: &str,
        target_type: &str,
        targets: impl Into<Targets>,
        owners: &[String],
    ) -> Result<()> {
        let targets = targets.into();
        tracing::info!(
            "setTargetOwners client={} target_type={} targets={:?} owners={:?}",
            client_id,
            target_type,
            targets,
            owners
        );
        let filter = targets.apply(owner_filter(client_id, target_type)?);
        self.replace_field(&filter, fields::OWNERS, owners).await
    }

    /// Replace the tags of one target on raw and global target counters
    pub async fn set_target_tags(
        &self,
        client_id: &str,
        target_type: &str,
        target: &str,
        tags: &[String],
    ) -> Result<()> {
        tracing::info!(
            "setTargetTags client={} target_type={} target={} tags={:?}",
            client_id,
            target_type,
            target,
            tags
        );
        let filter = Targets::from(target).apply(owner_filter(client_id, target_type)?);
        self.replace_field(&filter, fields::TAGS, tags).await
    }

    async fn replace_field(&self, filter: &Filter, field: &str, values: &[String]) -> Result<()> {
        let update = Update::new().set(FieldPath::field(field), values.to_vec());

        let targets = self.targets_bucket().await?;
        let raw = self
            .store
            .update(&targets, filter, &update, UpdateOptions::upsert_multi())
            .await?;

        let counters = self.counters_bucket().await?;
        let global = self
            .store
            .update(&counters, filter, &update, UpdateOptions::upsert_multi())
            .await?;

        tracing::debug!("Replaced {}: raw={:?} global={:?}", field, raw, global);
        Ok(())
    }
}

fn owner_filter(client_id: &str, target_type: &str) -> Result<Filter> {
    if client_id.trim().is_empty() {
        return Err(Error::Engine("empty client-id".to_string()));
    }
    if target_type.trim().is_empty() {
        return Err(Error::Engine("empty target type".to_string()));
    }
    Ok(Filter::new()
        .eq(FieldPath::field(fields::CLIENT), client_id)
        .eq(FieldPath::field(fields::TARGET_TYPE), target_type))
}
