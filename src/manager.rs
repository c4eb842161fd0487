use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use anyhow::{Context, Result, bail};
use glob::glob;
use rmp_serde::encode;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Owner of a simulation directory: a `config.toml` plus one `run-NNNN`
/// directory per run.
pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Start a new run from a random initial condition.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let mut engine = Engine::generate_initial_condition(self.cfg.clone())
            .context("failed to generate initial condition")?;

        self.run_engine(run_idx, &mut engine)
    }

    /// Continue a run from its checkpoint.
    pub fn resume_run(&self, run_idx: usize) -> Result<()> {
        let mut engine = self.load_engine(run_idx)?;
        self.run_engine(run_idx, &mut engine)
    }

    /// Continue a run one step per frame, writing every frame to a new frames file.
    pub fn animate_run(&self, run_idx: usize) -> Result<()> {
        let mut engine = self.load_engine(run_idx)?;

        let file_idx = self
            .count_frames_files(run_idx)
            .context("failed to count frames files")?;
        let frames_file = self.frames_file(run_idx, file_idx);
        let file = File::create(&frames_file)
            .with_context(|| format!("failed to create {frames_file:?}"))?;
        let mut writer = BufWriter::new(file);

        let mut n_frames = 0;
        for frame in engine.frames(self.cfg.run.steps) {
            let frame = frame?;
            encode::write(&mut writer, &frame).context("failed to serialize frame")?;
            n_frames += 1;
        }
        writer.flush().context("failed to flush writer stream")?;
        log::info!("wrote {n_frames} frames to {frames_file:?}");

        if n_frames < self.cfg.run.steps {
            log::warn!("population collapsed after {n_frames} frames");
        }

        self.save_engine(run_idx, &engine)
    }

    /// Analyze the recorded data points of every run.
    pub fn analyze_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let engine = self.load_engine(run_idx)?;

            let mut analyzer = Analyzer::new();
            analyzer
                .add_engine(&engine)
                .with_context(|| format!("failed to analyze run {run_idx}"))?;

            let results_file = self.results_file(run_idx);
            analyzer
                .save_results(&results_file)
                .context("failed to save results")?;
            log::info!("saved {results_file:?}");
        }

        Ok(())
    }

    /// Remove every run directory, keeping the config.
    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        Ok(())
    }

    fn run_engine(&self, run_idx: usize, engine: &mut Engine) -> Result<()> {
        let (success, n_failures) = engine
            .run(&self.cfg.run)
            .context("failed to run simulation")?;
        if success {
            log::info!("run {run_idx} completed after {n_failures} failed attempts");
        } else {
            log::warn!("run {run_idx} collapsed in all {n_failures} attempts");
        }
        log::info!("summary:\n{}", engine.summary());

        self.save_engine(run_idx, engine)
    }

    fn load_engine(&self, run_idx: usize) -> Result<Engine> {
        let checkpoint_file = self.checkpoint_file(run_idx);
        let engine = Engine::load_checkpoint(&checkpoint_file)
            .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
        if engine.cfg() != &self.cfg {
            bail!("checkpoint config differs from the current config");
        }
        log::info!("loaded {checkpoint_file:?}");

        Ok(engine)
    }

    fn save_engine(&self, run_idx: usize, engine: &Engine) -> Result<()> {
        let checkpoint_file = self.checkpoint_file(run_idx);
        engine
            .save_checkpoint(&checkpoint_file)
            .context("failed to save checkpoint")?;
        log::info!("saved {checkpoint_file:?}");

        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn count_frames_files(&self, run_idx: usize) -> Result<usize> {
        let pattern = self.run_dir(run_idx).join("frames-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob frames files")?
            .filter_map(Result::ok)
            .count();
        Ok(count)
    }

    fn checkpoint_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("checkpoint.msgpack")
    }

    fn frames_file(&self, run_idx: usize, file_idx: usize) -> PathBuf {
        self.run_dir(run_idx)
            .join(format!("frames-{file_idx:04}.msgpack"))
    }

    fn results_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("results.msgpack")
    }
}
