//! Stored field and bucket names

pub const CLIENT: &str = "client";
pub const TARGET: &str = "target";
pub const TARGET_TYPE: &str = "target_type";
pub const ACTION: &str = "action";
pub const DATE: &str = "date";
pub const YEAR: &str = "year";
pub const MONTH: &str = "month";
pub const OWNERS: &str = "owners";
pub const TAGS: &str = "tags";
pub const META: &str = "meta";

pub const COUNT: &str = "count";
pub const UNIQUE: &str = "unique";
pub const DAYS: &str = "days";
pub const HOURS: &str = "hours";
pub const ACTIONS: &str = "actions";
pub const TOUCHED_AT: &str = "touched_at";
pub const TOTAL: &str = "total";
pub const TARGETS: &str = "targets";
pub const VALUE: &str = "value";

/// Metadata key whose values are packed IPv4 addresses and counted as uniques
pub const META_IP: &str = "ip";

/// Stand-in for metadata keys or values that are blank after escaping
pub const BLANK_SEGMENT: &str = "_";

pub const EVENTS_BUCKET: &str = "events";
pub const TARGETS_BUCKET: &str = "targets";
pub const COUNTERS_BUCKET: &str = "counters";
pub const ACTIONS_BUCKET: &str = "actions";
pub const STATS_PREFIX: &str = "rstats";
