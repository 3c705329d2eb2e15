use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const MAX_K8S_NAME_LENGTH: usize = 63;
const MIN_JOB_ID_LENGTH: usize = 5;
const RANDOM_SUFFIX_LENGTH: usize = 8;
const FALLBACK_PREFIX: &str = "job-";
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Reasons a job identifier is not usable as a Kubernetes object name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("job ID cannot be empty")]
    Empty,

    #[error("job ID '{id}' is too short (minimum {min} characters)")]
    TooShort { id: String, min: usize },

    #[error("job ID '{id}' is too long (maximum {max} characters)")]
    TooLong { id: String, max: usize },

    #[error("job ID '{id}' contains invalid character '{ch}' (allowed: a-z, 0-9, -)")]
    InvalidCharacter { id: String, ch: char },

    #[error("job ID '{id}' must start and end with an alphanumeric character")]
    InvalidBoundary { id: String },

    #[error("job ID '{id}' cannot contain consecutive hyphens")]
    ConsecutiveHyphens { id: String },
}

pub struct JobNaming;

impl JobNaming {
    /// Generate `{prefix}-{yyyyMMdd-HHmmss}-{8 random lowercase alphanumerics}`
    #[must_use]
    pub fn generate(prefix: &str, now: DateTime<Utc>) -> String {
        let suffix = Self::random_suffix().unwrap_or_else(|| Self::time_suffix(now));
        format!("{prefix}-{}-{suffix}", now.format("%Y%m%d-%H%M%S"))
    }

    /// Check that an identifier is a valid DNS-1123 label
    pub fn validate(id: &str) -> Result<(), NamingError> {
        if id.is_empty() {
            return Err(NamingError::Empty);
        }
        if id.len() < MIN_JOB_ID_LENGTH {
            return Err(NamingError::TooShort {
                id: id.to_string(),
                min: MIN_JOB_ID_LENGTH,
            });
        }
        if id.len() > MAX_K8S_NAME_LENGTH {
            return Err(NamingError::TooLong {
                id: id.to_string(),
                max: MAX_K8S_NAME_LENGTH,
            });
        }
        if let Some(ch) = id.chars().find(|c| !Self::is_name_char(*c)) {
            return Err(NamingError::InvalidCharacter {
                id: id.to_string(),
                ch,
            });
        }
        let starts_ok = id.chars().next().is_some_and(Self::is_alnum);
        let ends_ok = id.chars().last().is_some_and(Self::is_alnum);
        if !starts_ok || !ends_ok {
            return Err(NamingError::InvalidBoundary { id: id.to_string() });
        }
        if id.contains("--") {
            return Err(NamingError::ConsecutiveHyphens { id: id.to_string() });
        }
        Ok(())
    }

    /// Normalize arbitrary input into a name that always passes [`Self::validate`].
    ///
    /// Never fails: resource names are derived from user-controlled input.
    #[must_use]
    pub fn format_name(input: &str) -> String {
        let lowered = input.to_lowercase();
        let mapped: String = lowered
            .chars()
            .map(|c| if Self::is_alnum(c) { c } else { '-' })
            .collect();
        let starts_alnum = mapped.chars().next().is_some_and(Self::is_alnum);

        let core = Self::collapse_hyphens(&mapped);
        let core = core.trim_matches('-');

        let mut name = if core.is_empty() {
            format!("{FALLBACK_PREFIX}unnamed")
        } else if !starts_alnum || core.len() < MIN_JOB_ID_LENGTH {
            format!("{FALLBACK_PREFIX}{core}")
        } else {
            core.to_string()
        };

        // Every character is ASCII at this point, so byte truncation is safe
        name.truncate(MAX_K8S_NAME_LENGTH);
        name.trim_end_matches(|c: char| !Self::is_alnum(c)).to_string()
    }

    fn random_suffix() -> Option<String> {
        let mut bytes = [0u8; RANDOM_SUFFIX_LENGTH];
        OsRng.try_fill_bytes(&mut bytes).ok()?;
        Some(
            bytes
                .iter()
                .map(|b| ALPHABET[usize::from(*b) % ALPHABET.len()] as char)
                .collect(),
        )
    }

    fn time_suffix(now: DateTime<Utc>) -> String {
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros());
        let mut value = nanos.unsigned_abs();
        let mut suffix = String::with_capacity(RANDOM_SUFFIX_LENGTH);
        for _ in 0..RANDOM_SUFFIX_LENGTH {
            let idx = usize::try_from(value % ALPHABET.len() as u64).unwrap_or(0);
            suffix.push(ALPHABET[idx] as char);
            value /= ALPHABET.len() as u64;
        }
        suffix
    }

    fn collapse_hyphens(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut previous_hyphen = false;
        for c in input.chars() {
            if c == '-' {
                if !previous_hyphen {
                    out.push(c);
                }
                previous_hyphen = true;
            } else {
                out.push(c);
                previous_hyphen = false;
            }
        }
        out
    }

    fn is_alnum(c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    fn is_name_char(c: char) -> bool {
        Self::is_alnum(c) || c == '-'
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::Rng;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn test_generate_format() {
        let id = JobNaming::generate("sync", fixed_time());
        assert!(id.starts_with("sync-20250314-092653-"), "{id}");
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(JobNaming::validate(&id).is_ok());
    }

    #[test]
    fn test_generate_is_unique() {
        let a = JobNaming::generate("sync", fixed_time());
        let b = JobNaming::generate("sync", fixed_time());
        assert_ne!(a, b);
    }

    #[test]
    fn test_time_suffix_shape() {
        let suffix = JobNaming::time_suffix(fixed_time());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_validate_rejections() {
        assert_eq!(JobNaming::validate(""), Err(NamingError::Empty));
        assert!(matches!(
            JobNaming::validate("abcd"),
            Err(NamingError::TooShort { .. })
        ));
        assert!(matches!(
            JobNaming::validate(&"a".repeat(64)),
            Err(NamingError::TooLong { .. })
        ));
        assert!(matches!(
            JobNaming::validate("Sync-job"),
            Err(NamingError::InvalidCharacter { ch: 'S', .. })
        ));
        assert!(matches!(
            JobNaming::validate("sync_job"),
            Err(NamingError::InvalidCharacter { ch: '_', .. })
        ));
        assert!(matches!(
            JobNaming::validate("-syncjob"),
            Err(NamingError::InvalidBoundary { .. })
        ));
        assert!(matches!(
            JobNaming::validate("syncjob-"),
            Err(NamingError::InvalidBoundary { .. })
        ));
        assert!(matches!(
            JobNaming::validate("sync--job"),
            Err(NamingError::ConsecutiveHyphens { .. })
        ));
    }

    #[test]
    fn test_validate_accepts_boundaries() {
        assert!(JobNaming::validate("abcde").is_ok());
        assert!(JobNaming::validate(&"a".repeat(63)).is_ok());
        assert!(JobNaming::validate("sync-batch-1").is_ok());
    }

    #[test]
    fn test_format_name_examples() {
        assert_eq!(JobNaming::format_name("My_Sync.Job"), "my-sync-job");
        assert_eq!(JobNaming::format_name("PROJ-123"), "proj-123");
        assert_eq!(JobNaming::format_name("_hidden"), "job-hidden");
        assert_eq!(JobNaming::format_name(""), "job-unnamed");
        assert_eq!(JobNaming::format_name("---"), "job-unnamed");
        assert_eq!(JobNaming::format_name("a"), "job-a");
        assert_eq!(
            JobNaming::format_name("sync-20250314-092653-abcd1234"),
            "sync-20250314-092653-abcd1234"
        );

        let long = format!("{}-{}", "x".repeat(62), "tail");
        let formatted = JobNaming::format_name(&long);
        assert_eq!(formatted, "x".repeat(62));
    }

    #[test]
    fn test_format_name_is_identity_for_valid_ids() {
        for id in ["abcde", "sync-job-42", "batch-20250101-000000-zz99aa00"] {
            assert!(JobNaming::validate(id).is_ok());
            assert_eq!(JobNaming::format_name(id), id);
        }
    }

    #[test]
    fn test_format_name_always_valid() {
        let samples = [
            "", " ", "-", "--a--", "Ünïcödé", "a.b.c", "A__B", "日本語のジョブ",
            "job name with spaces", "...", "0", "9-", "x-y", "UPPER", "trailing...",
        ];
        for input in samples {
            let name = JobNaming::format_name(input);
            assert!(JobNaming::validate(&name).is_ok(), "{input:?} -> {name:?}");
        }

        let charset: Vec<char> = "aZ09-_. /é--".chars().collect();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(0..90);
            let input: String = (0..len)
                .map(|_| charset[rng.gen_range(0..charset.len())])
                .collect();
            let name = JobNaming::format_name(&input);
            assert!(JobNaming::validate(&name).is_ok(), "{input:?} -> {name:?}");
        }
    }
}
