use crate::engine::Engine;
use crate::stats::{DataPoint, TimeSeries};
use anyhow::{Context, Result};
use rmp_serde::encode;
use serde::Serialize;
use serde_value::Value;
use std::{collections::BTreeMap, fs::File, io::BufWriter, path::Path};

/// Observable computed from the recorded data points of a run.
pub trait Obs {
    fn name(&self) -> &str;
    fn update(&mut self, point: &DataPoint);
    fn report(&self) -> Result<Value>;
}

/// Time series of one scalar extracted from every data point.
pub struct Series {
    name: &'static str,
    extract: fn(&DataPoint) -> f64,
    time_series: TimeSeries,
}

impl Series {
    pub fn new(name: &'static str, extract: fn(&DataPoint) -> f64) -> Self {
        Self {
            name,
            extract,
            time_series: TimeSeries::new(),
        }
    }
}

impl Obs for Series {
    fn name(&self) -> &str {
        self.name
    }

    fn update(&mut self, point: &DataPoint) {
        self.time_series.push((self.extract)(point));
    }

    fn report(&self) -> Result<Value> {
        to_value(self.time_series.report())
    }
}

/// Interval counters summed over all data points.
#[derive(Default, Serialize)]
pub struct EventTotals {
    n_points: usize,
    eaten: u64,
    interactions: u64,
}

impl Obs for EventTotals {
    fn name(&self) -> &str {
        "totals"
    }

    fn update(&mut self, point: &DataPoint) {
        self.n_points += 1;
        self.eaten += point.eaten;
        self.interactions += point.interactions;
    }

    fn report(&self) -> Result<Value> {
        to_value(self)
    }
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
    summary: Option<Value>,
}

impl Analyzer {
    pub fn new() -> Self {
        let series: [(&'static str, fn(&DataPoint) -> f64); 13] = [
            ("n_agents", |p| p.n_agents as f64),
            ("n_food", |p| p.n_food as f64),
            ("mean_mass", |p| p.mean_mass),
            ("eaten", |p| p.eaten as f64),
            ("mean_iq", |p| p.mean_iq),
            ("mean_eq", |p| p.mean_eq),
            ("mean_breed_mass_div", |p| p.mean_breed_mass_div),
            ("mean_breed_chance", |p| p.mean_breed_chance),
            ("fights_per_capita", |p| p.fights_per_capita),
            ("helps_per_capita", |p| p.helps_per_capita),
            ("ignores_per_capita", |p| p.ignores_per_capita),
            ("n_groups", |p| p.n_groups as f64),
            ("close_family_ratio", |p| p.close_family_ratio),
        ];

        let mut obs_ptr_vec: Vec<Box<dyn Obs>> = Vec::new();
        for (name, extract) in series {
            obs_ptr_vec.push(Box::new(Series::new(name, extract)));
        }
        obs_ptr_vec.push(Box::new(EventTotals::default()));

        Self {
            obs_ptr_vec,
            summary: None,
        }
    }

    /// Feed every data point recorded by `engine` and keep its summary.
    pub fn add_engine(&mut self, engine: &Engine) -> Result<()> {
        for point in &engine.state().data {
            for obs in &mut self.obs_ptr_vec {
                obs.update(point);
            }
        }
        self.summary = Some(to_value(engine.summary()).context("failed to convert summary")?);
        Ok(())
    }

    /// Reports of every observable keyed by name.
    pub fn report(&self) -> Result<Value> {
        let mut reports = BTreeMap::new();
        for obs in &self.obs_ptr_vec {
            let report = obs
                .report()
                .with_context(|| format!("failed to report {}", obs.name()))?;
            reports.insert(Value::String(obs.name().to_string()), report);
        }
        if let Some(summary) = &self.summary {
            reports.insert(Value::String("summary".to_string()), summary.clone());
        }
        Ok(Value::Map(reports))
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        let report = self.report()?;
        encode::write(&mut writer, &report).context("failed to serialize results")?;
        Ok(())
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_value::to_value(value).context("failed to convert report")
}
