//! Candidate generator: proposes perturbed series from a current point.
//!
//! Edit families (each on one channel, window `[start, end)`, magnitude in (0, 1]):
//! - clamp-toward-baseline: pull values toward the baseline band / median
//! - smoothing: centred moving average
//! - point mask: linear interpolation between the window's neighbours
//! - segment shift: offset the window so its mean moves toward the median
//! - revert: pull values back toward the original (only once a valid
//!   counterfactual exists, to shrink it)
//!
//! Windows come from an explicit explore/exploit policy. With probability
//! `exploration` a window is drawn uniformly at random; otherwise it is
//! centred on a position of interest: a timestep already edited by the best
//! counterfactual, or one of the current series' strongest deviations from
//! the baseline.

use std::ops::Range;

use rand::Rng;
use serde::Serialize;
use tscf_core::{Result, SearchConfig, Series, TscfError};

use crate::baseline::ChannelBaseline;
use crate::metric::{differs, DistanceMetric};

/// Families used while searching for (or improving) a counterfactual.
const SEARCH_FAMILIES: [EditKind; 4] = [
    EditKind::ClampTowardBaseline,
    EditKind::Smoothing,
    EditKind::PointMask,
    EditKind::SegmentShift,
];

/// Discrete magnitude grid. Including 1.0 lets a clamp land exactly on its target.
const MAGNITUDE_LEVELS: [f64; 4] = [0.25, 0.5, 0.75, 1.0];

/// Probability of drawing a revert edit once a valid counterfactual exists.
const REVERT_PROBABILITY: f64 = 0.5;

/// Probability that an exploit window anchors on the best's edits rather
/// than on the current series' deviations.
const ANCHOR_ON_BEST_PROBABILITY: f64 = 0.5;

/// Exploit windows pick uniformly among this many strongest deviations.
const EXPLOIT_TOP_K: usize = 3;

const MAX_SMOOTHING_RADIUS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    ClampTowardBaseline,
    Smoothing,
    PointMask,
    SegmentShift,
    Revert,
}

/// One local edit applied to a single channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edit {
    pub kind: EditKind,
    /// Channel position in the original series.
    pub channel: usize,
    pub start: usize,
    pub end: usize,
    pub magnitude: f64,
}

impl Edit {
    pub fn window(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Whether the edit stays inside a series of `len` timesteps and `channels` channels.
    pub fn is_within(&self, len: usize, channels: usize) -> bool {
        self.start < self.end && self.end <= len && self.channel < channels
    }
}

/// A series derived from the original, with the edits that produced it.
///
/// Immutable once built: every new edit yields a new candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    generation: u64,
    series: Series,
    provenance: Vec<Edit>,
    cost: f64,
}

impl Candidate {
    /// The unedited original as generation 0.
    pub fn original(series: Series) -> Self {
        Self {
            generation: 0,
            series,
            provenance: Vec::new(),
            cost: 0.0,
        }
    }

    pub(crate) fn new(generation: u64, series: Series, provenance: Vec<Edit>, cost: f64) -> Self {
        Self {
            generation,
            series,
            provenance,
            cost,
        }
    }

    /// Order in which the candidate was generated. Earlier wins ties.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn series(&self) -> &Series {
        &self.series
    }

    /// Edits applied to the original, oldest first.
    pub fn provenance(&self) -> &[Edit] {
        &self.provenance
    }

    /// Distance cost relative to the original.
    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// Read-only inputs for one round of proposals.
pub struct ProposalContext<'a> {
    pub original: &'a Series,
    /// Baseline per channel, in the original's channel order.
    pub baseline: &'a [ChannelBaseline],
    pub metric: &'a DistanceMetric,
    /// Best valid counterfactual so far.
    pub best: Option<&'a Candidate>,
    /// Probability of drawing an exploratory (uniform random) window.
    pub exploration: f64,
}

/// Pull-based producer of candidates. Each call to [`propose`](Self::propose)
/// yields one new candidate with the next generation index.
pub struct CandidateGenerator {
    next_generation: u64,
    max_window: usize,
    max_edits: usize,
}

impl CandidateGenerator {
    pub fn new(original: &Series, config: &SearchConfig) -> Self {
        Self {
            next_generation: 1,
            max_window: config.max_window_len(original.len()),
            max_edits: config.max_edits_per_candidate.max(1),
        }
    }

    /// Restart generation numbering.
    pub fn restart(&mut self) {
        self.next_generation = 1;
    }

    /// Number of generation indices handed out since the last restart.
    pub fn issued(&self) -> u64 {
        self.next_generation - 1
    }

    /// Reserve the next generation index.
    pub fn allocate_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    /// Derive one candidate from `current` by chaining one or more edits.
    pub fn propose<R: Rng + ?Sized>(
        &mut self,
        current: &Candidate,
        ctx: &ProposalContext<'_>,
        rng: &mut R,
    ) -> Result<Candidate> {
        let len = ctx.original.len();
        let channels = ctx.original.num_channels();
        if ctx.baseline.len() != channels {
            return Err(TscfError::InvalidInput(format!(
                "baseline covers {} channels, series has {}",
                ctx.baseline.len(),
                channels
            )));
        }

        let n_edits = if self.max_edits == 1 || rng.gen_bool(0.5) {
            1
        } else {
            rng.gen_range(2..=self.max_edits)
        };

        let mut values = current.series().to_values();
        let mut provenance = current.provenance().to_vec();
        for _ in 0..n_edits {
            let edit = self.draw_edit(&values, ctx, rng);
            if !edit.is_within(len, channels) {
                return Err(TscfError::InternalInvariant(format!(
                    "drew {:?} edit on channel {} over {}..{} for a series of {} x {}",
                    edit.kind, edit.channel, edit.start, edit.end, channels, len
                )));
            }
            apply_edit(&edit, &mut values, ctx);
            provenance.push(edit);
        }

        let series = current.series().with_values(values)?;
        let cost = ctx.metric.cost(ctx.original, &series)?;
        Ok(Candidate::new(self.allocate_generation(), series, provenance, cost))
    }

    /// Lazy, unbounded stream of proposals from `current`.
    pub fn proposals<'g, R: Rng + ?Sized>(
        &'g mut self,
        current: &'g Candidate,
        ctx: &'g ProposalContext<'g>,
        rng: &'g mut R,
    ) -> impl Iterator<Item = Result<Candidate>> + 'g {
        std::iter::from_fn(move || Some(self.propose(current, ctx, rng)))
    }

    fn draw_edit<R: Rng + ?Sized>(
        &self,
        values: &[Vec<f64>],
        ctx: &ProposalContext<'_>,
        rng: &mut R,
    ) -> Edit {
        let len = ctx.original.len();
        let width = rng.gen_range(1..=self.max_window.min(len));

        let kind = if ctx.best.is_some() && rng.gen_bool(REVERT_PROBABILITY) {
            EditKind::Revert
        } else {
            SEARCH_FAMILIES[rng.gen_range(0..SEARCH_FAMILIES.len())]
        };

        let explore = rng.gen_bool(ctx.exploration);
        let anchor = match kind {
            // Reverting untouched values is a no-op, so always aim at edits.
            EditKind::Revert => touched_anchor(values, ctx.original, rng),
            _ if explore => None,
            _ if ctx.best.is_some() && rng.gen_bool(ANCHOR_ON_BEST_PROBABILITY) => {
                touched_anchor(values, ctx.original, rng)
            }
            _ => deviation_anchor(values, ctx.baseline, rng),
        };

        let (channel, start) = match anchor {
            Some((channel, t)) => (channel, t.saturating_sub(width / 2).min(len - width)),
            None => (
                rng.gen_range(0..values.len()),
                rng.gen_range(0..=len - width),
            ),
        };

        Edit {
            kind,
            channel,
            start,
            end: start + width,
            magnitude: MAGNITUDE_LEVELS[rng.gen_range(0..MAGNITUDE_LEVELS.len())],
        }
    }
}

/// A random `(channel, timestep)` where `values` differs from the original.
fn touched_anchor<R: Rng + ?Sized>(
    values: &[Vec<f64>],
    original: &Series,
    rng: &mut R,
) -> Option<(usize, usize)> {
    let touched: Vec<(usize, usize)> = original
        .channels()
        .zip(values)
        .enumerate()
        .flat_map(|(c, ((_, o), v))| {
            o.iter()
                .zip(v)
                .enumerate()
                .filter(|(_, (a, b))| differs(**a, **b))
                .map(move |(t, _)| (c, t))
        })
        .collect();
    if touched.is_empty() {
        None
    } else {
        Some(touched[rng.gen_range(0..touched.len())])
    }
}

/// One of the strongest baseline deviations in `values`.
fn deviation_anchor<R: Rng + ?Sized>(
    values: &[Vec<f64>],
    baseline: &[ChannelBaseline],
    rng: &mut R,
) -> Option<(usize, usize)> {
    let mut ranked: Vec<(f64, usize, usize)> = values
        .iter()
        .zip(baseline)
        .enumerate()
        .flat_map(|(c, (v, b))| v.iter().enumerate().map(move |(t, x)| (b.deviation(*x), c, t)))
        .collect();
    // Highest deviation first; position breaks ties so the order is stable.
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    ranked.truncate(EXPLOIT_TOP_K);
    if ranked.is_empty() {
        None
    } else {
        let (_, c, t) = ranked[rng.gen_range(0..ranked.len())];
        Some((c, t))
    }
}

fn blend(from: f64, to: f64, magnitude: f64) -> f64 {
    if magnitude >= 1.0 {
        to
    } else {
        from + magnitude * (to - from)
    }
}

/// Apply `edit` in place. The edit must already be known to be in range.
fn apply_edit(edit: &Edit, values: &mut [Vec<f64>], ctx: &ProposalContext<'_>) {
    let m = edit.magnitude;
    let base = ctx.baseline[edit.channel];
    let channel = &mut values[edit.channel];
    let len = channel.len();

    match edit.kind {
        EditKind::ClampTowardBaseline => {
            for v in &mut channel[edit.window()] {
                *v = blend(*v, base.target(*v), m);
            }
        }
        EditKind::Smoothing => {
            let radius = 1 + (m * (MAX_SMOOTHING_RADIUS - 1) as f64).round() as usize;
            let source = channel.clone();
            for t in edit.window() {
                let lo = t.saturating_sub(radius);
                let hi = (t + radius + 1).min(len);
                channel[t] = source[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
            }
        }
        EditKind::PointMask => {
            let left = (edit.start > 0).then(|| (edit.start - 1, channel[edit.start - 1]));
            let right = (edit.end < len).then(|| (edit.end, channel[edit.end]));
            for t in edit.window() {
                let filled = match (left, right) {
                    (Some((i, a)), Some((j, b))) => a + (b - a) * (t - i) as f64 / (j - i) as f64,
                    (Some((_, a)), None) => a,
                    (None, Some((_, b))) => b,
                    (None, None) => base.median,
                };
                channel[t] = blend(channel[t], filled, m);
            }
        }
        EditKind::SegmentShift => {
            let window = &mut channel[edit.window()];
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let offset = m * (base.median - mean);
            for v in window {
                *v += offset;
            }
        }
        EditKind::Revert => {
            if let Some(original) = ctx.original.channel_at(edit.channel) {
                for t in edit.window() {
                    channel[t] = blend(channel[t], original[t], m);
                }
            }
        }
    }
}
