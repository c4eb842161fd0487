use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Running mean of a stream of values.
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            n_vals: 0,
            mean: 0.0,
        }
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;
        self.mean += (val - self.mean) / self.n_vals as f64;
    }

    /// Mean of the added values, `NaN` if there are none.
    pub fn mean(&self) -> f64 {
        if self.n_vals == 0 { f64::NAN } else { self.mean }
    }
}

pub struct TimeSeries {
    vals: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeSeriesReport {
    pub mean: f64,
    pub std_dev: f64,
    pub sem: f64,
    pub is_equil: bool,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self { vals: Vec::new() }
    }

    pub fn push(&mut self, val: f64) {
        self.vals.push(val);
    }

    pub fn report(&self) -> TimeSeriesReport {
        let i_equil = compute_opt_i_equil(&self.vals);
        let equil_time_series = &self.vals[i_equil..];
        TimeSeriesReport {
            mean: compute_mean(equil_time_series),
            std_dev: compute_var(equil_time_series).sqrt(),
            sem: compute_sem(equil_time_series),
            is_equil: i_equil != self.vals.len() / 2,
        }
    }
}

fn compute_mean(time_series: &[f64]) -> f64 {
    if time_series.is_empty() {
        return f64::NAN;
    }
    time_series.iter().sum::<f64>() / time_series.len() as f64
}

fn compute_var(time_series: &[f64]) -> f64 {
    let n_vals = time_series.len();
    if n_vals < 2 {
        return f64::NAN;
    }
    let mean = compute_mean(time_series);
    time_series
        .iter()
        .map(|&val| (val - mean).powi(2))
        .sum::<f64>()
        / (n_vals - 1) as f64
}

/// Compute the standard error of the mean (SEM) using the Flyvbjerg-Petersen blocking method
fn compute_sem(time_series: &[f64]) -> f64 {
    let mut blk_time_series = time_series.to_vec();
    let mut n_vals = blk_time_series.len();
    let mut sem2_ests = Vec::new();
    let mut sem2_errs = Vec::new();

    while n_vals >= 2 {
        let sem2_est = compute_var(&blk_time_series) / n_vals as f64;
        let sem2_err = sem2_est * (2.0 / (n_vals as f64 - 1.0)).sqrt();
        sem2_ests.push(sem2_est);
        sem2_errs.push(sem2_err);

        blk_time_series = blk_time_series
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect();
        n_vals = blk_time_series.len();
    }

    for (idx, &sem2_est) in sem2_ests.iter().enumerate() {
        let max_low = sem2_ests[idx..]
            .iter()
            .zip(sem2_errs[idx..].iter())
            .map(|(s, e)| s - e)
            .fold(f64::NEG_INFINITY, f64::max);

        if sem2_est > max_low {
            return sem2_est.sqrt();
        }
    }

    sem2_ests.last().copied().unwrap_or(f64::NAN).sqrt()
}

/// Compute the optimal equilibration index using the marginal standard error rule
fn compute_opt_i_equil(time_series: &[f64]) -> usize {
    let n_vals = time_series.len();
    if n_vals < 2 {
        return 0;
    }
    let mut min_mse = f64::INFINITY;
    let mut opt_i_equil = n_vals / 2;
    let n_idxs = n_vals.ilog2() + 1;
    let i_equils: Vec<_> = (0..n_idxs)
        .map(|idx| n_vals / 2_usize.pow(n_idxs - idx))
        .collect();

    for i_equil in i_equils {
        let aux_time_series = &time_series[i_equil..];
        let n_vals = aux_time_series.len();

        let var = compute_var(aux_time_series);
        let mse = var * (n_vals - 1) as f64 / n_vals.pow(2) as f64;

        if mse < min_mse {
            min_mse = mse;
            opt_i_equil = i_equil;
        }
    }

    opt_i_equil
}

/// Aggregate statistics of the population at one recording point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Total number of steps performed when recorded.
    pub step: u64,
    pub n_agents: usize,
    pub n_food: usize,
    pub mean_mass: f64,
    /// Food items eaten since the previous data point.
    pub eaten: u64,
    pub mean_iq: f64,
    pub mean_eq: f64,
    pub mean_breed_mass_div: f64,
    pub mean_breed_chance: f64,
    /// Agent contacts since the previous data point.
    pub interactions: u64,
    pub fights_per_capita: f64,
    pub helps_per_capita: f64,
    pub ignores_per_capita: f64,
    pub n_groups: usize,
    /// Mean over groups of duplicated family ids per member.
    pub close_family_ratio: f64,
}

/// Label sorted positions with group indices.
///
/// Consecutive positions closer than `threshold` share a group; the ring
/// wraparound is not considered.
pub fn group_labels(sorted_x: &[f64], threshold: f64) -> Vec<usize> {
    let mut labels = Vec::with_capacity(sorted_x.len());
    let mut label = 0;
    for (i, &x) in sorted_x.iter().enumerate() {
        if i > 0 && (x - sorted_x[i - 1]).abs() >= threshold {
            label += 1;
        }
        labels.push(label);
    }
    labels
}

/// Number of groups given the labels from [`group_labels`].
pub fn count_groups(labels: &[usize]) -> usize {
    labels.last().map_or(0, |&label| label + 1)
}

/// Kin clustering: for each group, the number of duplicated ids among
/// members' own and parent ids, divided by the group size; averaged over groups.
///
/// `members` holds `(id, parent_id)` pairs aligned with `labels`.
pub fn close_family_ratio(members: &[(u64, Option<u64>)], labels: &[usize]) -> f64 {
    let mut acc = Accumulator::new();
    let mut start = 0;
    while start < labels.len() {
        let label = labels[start];
        let end = labels[start..]
            .iter()
            .position(|&l| l != label)
            .map_or(labels.len(), |offset| start + offset);

        let group = &members[start..end];
        let ids: Vec<u64> = group
            .iter()
            .flat_map(|&(id, parent_id)| std::iter::once(id).chain(parent_id))
            .collect();
        let n_unique = ids.iter().collect::<HashSet<_>>().len();
        acc.add((ids.len() - n_unique) as f64 / group.len() as f64);

        start = end;
    }
    acc.mean()
}
