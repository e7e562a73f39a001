//! Image eviction policy.
//!
//! Decides whether a single image may be removed during a prune pass.
//! The decision is pure: all inputs are passed in, nothing is cached.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

/// Seconds in one day.
const SECONDS_PER_DAY: i64 = 86_400;

/// One image in the store, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Image id (e.g. `sha256:...`).
    pub id: String,

    /// Creation time, if the runtime reported a parsable one.
    pub created_at: Option<DateTime<Utc>>,

    /// Repo tags and repo digests pointing at this image.
    pub references: Vec<String>,
}

impl ImageRecord {
    /// Create a record without alias references.
    pub fn new(id: impl Into<String>, created_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            created_at,
            references: Vec::new(),
        }
    }

    /// Attach repo tags / digests.
    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }
}

/// Image references used by at least one container, running or stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedImageSet(HashSet<String>);

impl UsedImageSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference as in use.
    pub fn insert(&mut self, reference: impl Into<String>) {
        self.0.insert(reference.into());
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.0.contains(reference)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a container references `image` by id or by any of its aliases.
    pub fn references(&self, image: &ImageRecord) -> bool {
        self.contains(&image.id) || image.references.iter().any(|r| self.contains(r))
    }
}

impl<S: Into<String>> FromIterator<S> for UsedImageSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Why an image is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// Creation time is missing or unparsable.
    UnknownAge,
    /// Younger than the threshold.
    TooYoung,
    /// Referenced by a container.
    InUse,
}

impl KeepReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeepReason::UnknownAge => "unknown_age",
            KeepReason::TooYoung => "too_young",
            KeepReason::InUse => "in_use",
        }
    }
}

impl std::fmt::Display for KeepReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the policy for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionDecision {
    Keep(KeepReason),
    Evict,
}

/// Decide whether `image` may be evicted.
///
/// Checked in order: unknown age, youth, usage. Any of them keeps the image.
pub fn decide(
    image: &ImageRecord,
    now: DateTime<Utc>,
    threshold_days: u32,
    used: &UsedImageSet,
) -> EvictionDecision {
    let Some(created_at) = image.created_at else {
        return EvictionDecision::Keep(KeepReason::UnknownAge);
    };

    let threshold = Duration::seconds(i64::from(threshold_days) * SECONDS_PER_DAY);
    if now.signed_duration_since(created_at) < threshold {
        return EvictionDecision::Keep(KeepReason::TooYoung);
    }

    if used.references(image) {
        return EvictionDecision::Keep(KeepReason::InUse);
    }

    EvictionDecision::Evict
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn image_aged(days: i64) -> ImageRecord {
        ImageRecord::new("sha256:aaa", Some(now() - Duration::days(days)))
    }

    #[rstest]
    #[case(0, false)]
    #[case(0, true)]
    #[case(365, false)]
    #[case(365, true)]
    fn test_unknown_age_is_always_kept(#[case] threshold: u32, #[case] used: bool) {
        let image = ImageRecord::new("sha256:aaa", None);
        let set: UsedImageSet = if used {
            ["sha256:aaa"].into_iter().collect()
        } else {
            UsedImageSet::new()
        };

        assert_eq!(
            decide(&image, now(), threshold, &set),
            EvictionDecision::Keep(KeepReason::UnknownAge)
        );
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_young_image_is_kept_regardless_of_usage(#[case] used: bool) {
        let image = image_aged(3);
        let set: UsedImageSet = if used {
            ["sha256:aaa"].into_iter().collect()
        } else {
            UsedImageSet::new()
        };

        assert_eq!(
            decide(&image, now(), 14, &set),
            EvictionDecision::Keep(KeepReason::TooYoung)
        );
    }

    #[rstest]
    #[case(14, 14)]
    #[case(14, 30)]
    #[case(0, 0)]
    fn test_old_unused_image_is_evicted(#[case] threshold: u32, #[case] age_days: i64) {
        let image = image_aged(age_days);
        assert_eq!(
            decide(&image, now(), threshold, &UsedImageSet::new()),
            EvictionDecision::Evict
        );
    }

    #[test]
    fn test_old_used_image_is_kept() {
        let image = image_aged(30);
        let used: UsedImageSet = ["sha256:aaa"].into_iter().collect();

        assert_eq!(
            decide(&image, now(), 14, &used),
            EvictionDecision::Keep(KeepReason::InUse)
        );
    }

    #[test]
    fn test_usage_by_alias_reference() {
        let image = image_aged(30)
            .with_references(vec!["docker.io/library/nginx@sha256:bbb".to_string()]);
        let used: UsedImageSet = ["docker.io/library/nginx@sha256:bbb"].into_iter().collect();

        assert_eq!(
            decide(&image, now(), 14, &used),
            EvictionDecision::Keep(KeepReason::InUse)
        );
    }

    #[test]
    fn test_boundary_is_inclusive() {
        // Exactly threshold old is old enough.
        let image = ImageRecord::new("sha256:aaa", Some(now() - Duration::days(14)));
        assert_eq!(
            decide(&image, now(), 14, &UsedImageSet::new()),
            EvictionDecision::Evict
        );

        let image = ImageRecord::new(
            "sha256:aaa",
            Some(now() - Duration::days(14) + Duration::seconds(1)),
        );
        assert_eq!(
            decide(&image, now(), 14, &UsedImageSet::new()),
            EvictionDecision::Keep(KeepReason::TooYoung)
        );
    }

    #[test]
    fn test_future_creation_time_is_young() {
        let image = ImageRecord::new("sha256:aaa", Some(now() + Duration::days(1)));
        assert_eq!(
            decide(&image, now(), 0, &UsedImageSet::new()),
            EvictionDecision::Keep(KeepReason::TooYoung)
        );
    }
}
