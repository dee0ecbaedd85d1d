//! VFS options: environment-tuned defaults plus validated per-remote
//! overrides.
//!
//! Overrides are plain strings stored in the remote's config section; the
//! recognized names and their value syntax live in one static table so
//! validation is a lookup, not reflection. The write-back delay is owned by
//! the instance lifecycle and is never accepted from overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;

use super::{ConfigError, ConfigStore, section_for_remote};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Policy for buffering file content on local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheMode {
    /// No content cache; writable opens stream and cannot re-read.
    Off,
    /// Writes are buffered to disk, enabling simultaneous read/write.
    Writes,
}

impl CacheMode {
    fn parse(value: &str) -> Result<Self, String> {
        match value {
            "off" => Ok(CacheMode::Off),
            "writes" => Ok(CacheMode::Writes),
            _ => Err(format!("expected \"off\" or \"writes\", got {value:?}")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Off => "off",
            CacheMode::Writes => "writes",
        }
    }
}

/// Concrete options record a VFS instance is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsOptions {
    pub dir_cache_time: Duration,
    pub cache_mode: CacheMode,
    pub cache_max_age: Duration,
    pub cache_poll_interval: Duration,
    pub chunk_size: u64,
    pub chunk_size_limit: u64,
    pub write_back: Duration,
}

impl Default for VfsOptions {
    /// Defaults tuned for a host that sees out-of-band mutations and runs
    /// with little disk and network headroom: a short directory-cache TTL,
    /// write caching for mixed read/write access, aggressive cache expiry,
    /// and small read chunks.
    fn default() -> Self {
        Self {
            dir_cache_time: Duration::from_secs(5),
            cache_mode: CacheMode::Writes,
            cache_max_age: Duration::from_secs(15),
            cache_poll_interval: Duration::from_secs(20),
            chunk_size: 2 * MIB,
            chunk_size_limit: 8 * MIB,
            write_back: Duration::ZERO,
        }
    }
}

/// Override key for the write-back delay; recognized but never applied.
pub const WRITE_BACK_KEY: &str = "write_back";

#[derive(Clone, Copy)]
enum OptionKind {
    Duration,
    Size,
    Mode,
}

impl OptionKind {
    /// Whether an empty override value is meaningful for this kind. Only a
    /// string-typed option could accept one, and no current field is
    /// string-typed.
    fn allows_empty(self) -> bool {
        match self {
            OptionKind::Duration | OptionKind::Size | OptionKind::Mode => false,
        }
    }
}

struct OptionSpec {
    name: &'static str,
    kind: OptionKind,
    apply: fn(&mut VfsOptions, &str) -> Result<(), String>,
    render: fn(&VfsOptions) -> String,
}

static OPTION_TABLE: &[OptionSpec] = &[
    OptionSpec {
        name: "dir_cache_time",
        kind: OptionKind::Duration,
        apply: |opts, value| parse_duration(value).map(|d| opts.dir_cache_time = d),
        render: |opts| render_duration(opts.dir_cache_time),
    },
    OptionSpec {
        name: "cache_mode",
        kind: OptionKind::Mode,
        apply: |opts, value| CacheMode::parse(value).map(|m| opts.cache_mode = m),
        render: |opts| opts.cache_mode.as_str().to_string(),
    },
    OptionSpec {
        name: "cache_max_age",
        kind: OptionKind::Duration,
        apply: |opts, value| parse_duration(value).map(|d| opts.cache_max_age = d),
        render: |opts| render_duration(opts.cache_max_age),
    },
    OptionSpec {
        name: "cache_poll_interval",
        kind: OptionKind::Duration,
        apply: |opts, value| parse_duration(value).map(|d| opts.cache_poll_interval = d),
        render: |opts| render_duration(opts.cache_poll_interval),
    },
    OptionSpec {
        name: "chunk_size",
        kind: OptionKind::Size,
        apply: |opts, value| parse_size(value).map(|s| opts.chunk_size = s),
        render: |opts| render_size(opts.chunk_size),
    },
    OptionSpec {
        name: "chunk_size_limit",
        kind: OptionKind::Size,
        apply: |opts, value| parse_size(value).map(|s| opts.chunk_size_limit = s),
        render: |opts| render_size(opts.chunk_size_limit),
    },
    OptionSpec {
        name: WRITE_BACK_KEY,
        kind: OptionKind::Duration,
        // Never applied from overrides; kept in the table so describe()
        // renders the effective value.
        apply: |_, _| Ok(()),
        render: |opts| render_duration(opts.write_back),
    },
];

/// Apply the override map on top of the defaults.
///
/// Every key must name a known option; empty values are rejected for
/// non-string-typed options; a `write_back` key is silently dropped without
/// affecting the other keys.
pub fn resolve(overrides: &BTreeMap<String, String>) -> Result<VfsOptions, ConfigError> {
    let mut opts = VfsOptions::default();

    for (key, value) in overrides {
        let entry = OPTION_TABLE
            .iter()
            .find(|entry| entry.name == key)
            .ok_or_else(|| ConfigError::UnknownOption(key.clone()))?;

        if key == WRITE_BACK_KEY {
            debug!("ignoring write_back override; the value is instance-managed");
            continue;
        }

        if value.is_empty() && !entry.kind.allows_empty() {
            return Err(ConfigError::EmptyValue(key.clone()));
        }

        (entry.apply)(&mut opts, value).map_err(|reason| ConfigError::InvalidValue {
            key: key.clone(),
            value: value.clone(),
            reason,
        })?;
    }

    if opts.chunk_size_limit < opts.chunk_size {
        return Err(ConfigError::InvalidValue {
            key: "chunk_size_limit".to_string(),
            value: render_size(opts.chunk_size_limit),
            reason: "must be at least chunk_size".to_string(),
        });
    }

    Ok(opts)
}

/// Effective options for an override map, string-serialized for display.
/// Validation is the same path as [`resolve`].
pub fn describe(overrides: &BTreeMap<String, String>) -> Result<Vec<(String, String)>, ConfigError> {
    let opts = resolve(overrides)?;
    Ok(OPTION_TABLE
        .iter()
        .map(|entry| (entry.name.to_string(), (entry.render)(&opts)))
        .collect())
}

/// Resolve the options for a remote from its stored overrides.
pub fn resolve_for_remote(store: &ConfigStore, remote: &str) -> Result<VfsOptions, ConfigError> {
    let overrides = store.vfs_overrides(section_for_remote(remote));
    resolve(&overrides)
}

/// Parse `123`, `500ms`, `5s`, `2m` or `1h`; a bare number means seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("expected a duration, got {value:?}"))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(format!("unknown duration unit {unit:?}")),
    }
}

fn render_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }

    let secs = duration.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Parse `4096`, `64Ki`, `2Mi` or `1Gi`; a bare number means bytes.
fn parse_size(value: &str) -> Result<u64, String> {
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("expected a size, got {value:?}"))?;

    let multiplier = match unit {
        "" => 1,
        "Ki" => KIB,
        "Mi" => MIB,
        "Gi" => GIB,
        _ => return Err(format!("unknown size unit {unit:?}")),
    };

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {value:?} overflows"))
}

fn render_size(size: u64) -> String {
    if size > 0 && size % GIB == 0 {
        format!("{}Gi", size / GIB)
    } else if size > 0 && size % MIB == 0 {
        format!("{}Mi", size / MIB)
    } else if size > 0 && size % KIB == 0 {
        format!("{}Ki", size / KIB)
    } else {
        size.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_overrides() {
        let opts = resolve(&BTreeMap::new()).unwrap();
        assert_eq!(opts, VfsOptions::default());
        assert_eq!(opts.dir_cache_time, Duration::from_secs(5));
        assert_eq!(opts.cache_mode, CacheMode::Writes);
        assert_eq!(opts.chunk_size, 2 * MIB);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = resolve(&overrides(&[("unknown_key", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(key) if key == "unknown_key"));
    }

    #[test]
    fn empty_value_is_rejected_for_non_string_fields() {
        let err = resolve(&overrides(&[("chunk_size", "")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "chunk_size"));
    }

    #[test]
    fn cache_mode_override_applies() {
        let opts = resolve(&overrides(&[("cache_mode", "off")])).unwrap();
        assert_eq!(opts.cache_mode, CacheMode::Off);
    }

    #[test]
    fn write_back_override_is_dropped_without_error() {
        let opts = resolve(&overrides(&[
            ("write_back", "30s"),
            ("dir_cache_time", "1m"),
        ]))
        .unwrap();
        assert_eq!(opts.write_back, Duration::ZERO);
        assert_eq!(opts.dir_cache_time, Duration::from_secs(60));
    }

    #[test]
    fn chunk_limit_must_cover_chunk_size() {
        let err = resolve(&overrides(&[
            ("chunk_size", "4Mi"),
            ("chunk_size_limit", "1Mi"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "chunk_size_limit"));
    }

    #[test]
    fn bad_value_reports_key_and_reason() {
        let err = resolve(&overrides(&[("dir_cache_time", "soon")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "dir_cache_time");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn describe_serializes_effective_options() {
        let described = describe(&overrides(&[("cache_mode", "off")])).unwrap();
        let as_map: BTreeMap<_, _> = described.into_iter().collect();
        assert_eq!(as_map["cache_mode"], "off");
        assert_eq!(as_map["dir_cache_time"], "5s");
        assert_eq!(as_map["chunk_size"], "2Mi");
        assert_eq!(as_map["write_back"], "0s");
    }

    #[test]
    fn duration_and_size_syntax() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("5d").is_err());

        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64Ki").unwrap(), 64 * KIB);
        assert_eq!(parse_size("1Gi").unwrap(), GIB);
        assert!(parse_size("2MB").is_err());
    }
}
