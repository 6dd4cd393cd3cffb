use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TscfError};

/// Content fingerprint of a series (SHA-256 over index, names and value bits).
pub type Fingerprint = [u8; 32];

/// One or more aligned numeric channels sharing a strictly increasing time index.
///
/// Construction validates every invariant, so any `Series` value in hand is
/// non-empty, rectangular, finite and time-ordered. Channel order is the
/// insertion order and is part of the series' identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSeries")]
pub struct Series {
    timestamps: Vec<DateTime<Utc>>,
    channels: IndexMap<String, Vec<f64>>,
}

/// Unvalidated wire form used for deserialization.
#[derive(Deserialize)]
struct RawSeries {
    timestamps: Vec<DateTime<Utc>>,
    channels: IndexMap<String, Vec<f64>>,
}

impl TryFrom<RawSeries> for Series {
    type Error = TscfError;

    fn try_from(raw: RawSeries) -> Result<Self> {
        Series::new(raw.timestamps, raw.channels)
    }
}

impl Series {
    /// Build a series, validating shape, ordering and finiteness.
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        channels: IndexMap<String, Vec<f64>>,
    ) -> Result<Self> {
        if timestamps.is_empty() {
            return Err(TscfError::InvalidInput("series has no timesteps".into()));
        }
        if channels.is_empty() {
            return Err(TscfError::InvalidInput("series has no channels".into()));
        }

        if let Some(pos) = timestamps.windows(2).position(|w| w[1] <= w[0]) {
            return Err(TscfError::InvalidInput(format!(
                "timestamps must be strictly increasing (index {} -> {})",
                pos,
                pos + 1
            )));
        }

        for (name, values) in &channels {
            if values.len() != timestamps.len() {
                return Err(TscfError::InvalidInput(format!(
                    "channel '{}' has {} values but the index has {} timestamps",
                    name,
                    values.len(),
                    timestamps.len()
                )));
            }
            if let Some(i) = values.iter().position(|v| !v.is_finite()) {
                return Err(TscfError::InvalidInput(format!(
                    "channel '{}' has a missing or non-finite value at index {}",
                    name, i
                )));
            }
        }

        Ok(Self {
            timestamps,
            channels,
        })
    }

    /// Single-channel convenience constructor.
    pub fn univariate(
        timestamps: Vec<DateTime<Utc>>,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let mut channels = IndexMap::with_capacity(1);
        channels.insert(name.into(), values);
        Self::new(timestamps, channels)
    }

    /// Build a regularly sampled series starting at `start` with spacing `step`.
    pub fn regular(
        start: DateTime<Utc>,
        step: Duration,
        channels: Vec<(String, Vec<f64>)>,
    ) -> Result<Self> {
        if step <= Duration::zero() {
            return Err(TscfError::InvalidInput(
                "sampling step must be positive".into(),
            ));
        }
        let len = channels.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut timestamps = Vec::with_capacity(len);
        let mut next = Some(start);
        for i in 0..len {
            let at = next.ok_or_else(|| {
                TscfError::InvalidInput(format!(
                    "timestep {} of a regular index falls outside the representable time range",
                    i
                ))
            })?;
            timestamps.push(at);
            next = at.checked_add_signed(step);
        }
        Self::new(timestamps, channels.into_iter().collect())
    }

    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Always false for a constructed series; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|k| k.as_str())
    }

    /// Values of a channel by name.
    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(|v| v.as_slice())
    }

    /// Values of a channel by position.
    pub fn channel_at(&self, index: usize) -> Option<&[f64]> {
        self.channels.get_index(index).map(|(_, v)| v.as_slice())
    }

    /// Name of the channel at `index`.
    pub fn channel_name(&self, index: usize) -> Option<&str> {
        self.channels.get_index(index).map(|(k, _)| k.as_str())
    }

    /// Iterate `(name, values)` pairs in channel order.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Copy of all channel values, in channel order.
    pub fn to_values(&self) -> Vec<Vec<f64>> {
        self.channels.values().cloned().collect()
    }

    /// New series on the same index and channel names with replaced values.
    pub fn with_values(&self, values: Vec<Vec<f64>>) -> Result<Series> {
        if values.len() != self.channels.len() {
            return Err(TscfError::ShapeMismatch(format!(
                "expected {} channels, got {}",
                self.channels.len(),
                values.len()
            )));
        }
        let channels = self
            .channels
            .keys()
            .cloned()
            .zip(values)
            .collect::<IndexMap<_, _>>();
        Series::new(self.timestamps.clone(), channels)
    }

    /// Check that `other` has this series' channels (same names, same order)
    /// and the identical time index.
    pub fn check_aligned(&self, other: &Series) -> Result<()> {
        if other.len() != self.len() {
            return Err(TscfError::ShapeMismatch(format!(
                "length {} does not match original length {}",
                other.len(),
                self.len()
            )));
        }
        if other.num_channels() != self.num_channels() {
            return Err(TscfError::ShapeMismatch(format!(
                "{} channels do not match original's {}",
                other.num_channels(),
                self.num_channels()
            )));
        }
        for (i, (mine, theirs)) in self.channels.keys().zip(other.channels.keys()).enumerate() {
            if mine != theirs {
                return Err(TscfError::ShapeMismatch(format!(
                    "channel {} is '{}', expected '{}'",
                    i, theirs, mine
                )));
            }
        }
        if other.timestamps != self.timestamps {
            return Err(TscfError::ShapeMismatch(
                "time index differs from the original".into(),
            ));
        }
        Ok(())
    }

    /// SHA-256 content fingerprint. Equal series always share a fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update((self.timestamps.len() as u64).to_le_bytes());
        for ts in &self.timestamps {
            hasher.update(ts.timestamp_nanos_opt().unwrap_or(ts.timestamp()).to_le_bytes());
        }
        for (name, values) in &self.channels {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            for v in values {
                hasher.update(v.to_bits().to_le_bytes());
            }
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: usize) -> Vec<DateTime<Utc>> {
        (0..n as i64)
            .map(|i| DateTime::from_timestamp(1_700_000_000 + i * 60, 0).unwrap())
            .collect()
    }

    #[test]
    fn univariate_roundtrip_accessors() {
        let s = Series::univariate(ts(3), "values", vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s.num_channels(), 1);
        assert_eq!(s.channel("values"), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(s.channel_name(0), Some("values"));
        assert!(s.channel("missing").is_none());
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            Series::univariate(vec![], "v", vec![]),
            Err(TscfError::InvalidInput(_))
        ));
        assert!(matches!(
            Series::new(ts(2), IndexMap::new()),
            Err(TscfError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = Series::univariate(ts(3), "v", vec![1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("channel 'v'"));
    }

    #[test]
    fn rejects_non_increasing_index() {
        let mut t = ts(3);
        t[2] = t[1];
        assert!(Series::univariate(t, "v", vec![1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn rejects_missing_values() {
        let err = Series::univariate(ts(3), "v", vec![1.0, f64::NAN, 3.0]).unwrap_err();
        assert!(err.to_string().contains("index 1"));
    }

    #[test]
    fn regular_builds_evenly_spaced_index() {
        let start = DateTime::from_timestamp(0, 0).unwrap();
        let s = Series::regular(
            start,
            Duration::seconds(10),
            vec![("a".into(), vec![0.0; 4]), ("b".into(), vec![1.0; 4])],
        )
        .unwrap();
        assert_eq!(s.len(), 4);
        assert_eq!(s.timestamps()[3].timestamp(), 30);
        assert_eq!(s.channel_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn regular_index_past_the_time_range_is_invalid_input() {
        let err = Series::regular(
            DateTime::<Utc>::MAX_UTC - Duration::seconds(5),
            Duration::seconds(2),
            vec![("a".into(), vec![0.0; 4])],
        )
        .unwrap_err();
        assert!(matches!(err, TscfError::InvalidInput(ref m) if m.contains("timestep 3")));

        let huge = Series::regular(
            DateTime::from_timestamp(0, 0).unwrap(),
            Duration::days(200_000 * 365),
            vec![("a".into(), vec![0.0; 2])],
        );
        assert!(matches!(huge, Err(TscfError::InvalidInput(_))));
    }

    #[test]
    fn alignment_checks() {
        let a = Series::univariate(ts(3), "v", vec![1.0, 2.0, 3.0]).unwrap();
        let b = a.with_values(vec![vec![0.0, 0.0, 0.0]]).unwrap();
        assert!(a.check_aligned(&b).is_ok());

        let shorter = Series::univariate(ts(2), "v", vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            a.check_aligned(&shorter),
            Err(TscfError::ShapeMismatch(_))
        ));

        let renamed = Series::univariate(ts(3), "w", vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            a.check_aligned(&renamed),
            Err(TscfError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn with_values_rejects_wrong_channel_count() {
        let a = Series::univariate(ts(2), "v", vec![1.0, 2.0]).unwrap();
        assert!(a.with_values(vec![]).is_err());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = Series::univariate(ts(3), "v", vec![1.0, 2.0, 3.0]).unwrap();
        let b = a.clone();
        let c = a.with_values(vec![vec![1.0, 2.0, 3.5]]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn deserialization_validates() {
        let ok = r#"{"timestamps":["2024-01-01T00:00:00Z","2024-01-01T00:01:00Z"],"channels":{"v":[1.0,2.0]}}"#;
        let s: Series = serde_json::from_str(ok).unwrap();
        assert_eq!(s.len(), 2);

        let bad = r#"{"timestamps":["2024-01-01T00:00:00Z"],"channels":{"v":[1.0,2.0]}}"#;
        assert!(serde_json::from_str::<Series>(bad).is_err());
    }
}
