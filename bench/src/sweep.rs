//! Runs of several trials: one per network profile, or one per codec
//! under a shared profile.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use netsim::NetworkConditions;
use voip_bench_common::{CodecKind, MetricsContext};

use crate::report::TrialReport;
use crate::trial::{Trial, TrialConfig};

/// Network conditions with a label for reports and output file names.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedConditions {
    pub name: String,
    pub conditions: NetworkConditions,
}

impl NamedConditions {
    pub fn new(name: impl Into<String>, conditions: NetworkConditions) -> Self {
        Self {
            name: name.into(),
            conditions,
        }
    }

    /// The `perfect`, `good` and `poor` profiles, in that order.
    pub fn presets() -> Vec<Self> {
        // ---
        ["perfect", "good", "poor"]
            .into_iter()
            .filter_map(|name| NetworkConditions::preset(name).map(|c| Self::new(name, c)))
            .collect()
    }
}

/// Outcome of one trial in a sweep.
#[derive(Debug)]
pub struct SweepEntry {
    pub name: String,
    /// `Err` when the trial could not be set up; the sweep carries on
    pub outcome: Result<TrialReport>,
}

/// Results of a sweep, in the order the trials ran.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    // ---
    pub fn completed(&self) -> impl Iterator<Item = (&str, &TrialReport)> {
        self.entries
            .iter()
            .filter_map(|e| e.outcome.as_ref().ok().map(|r| (e.name.as_str(), r)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &anyhow::Error)> {
        self.entries
            .iter()
            .filter_map(|e| e.outcome.as_ref().err().map(|err| (e.name.as_str(), err)))
    }

    /// Completed entry with the highest MOS.
    pub fn best(&self) -> Option<(&str, &TrialReport)> {
        // ---
        self.completed()
            .max_by(|(_, a), (_, b)| a.quality.mos.total_cmp(&b.quality.mos))
    }

    pub fn get(&self, name: &str) -> Option<&SweepEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        writeln!(
            f,
            "{:<12} {:>6} {:<10} {:>8} {:>10} {:>9} {:>9}",
            "name", "MOS", "rating", "loss %", "latency", "jitter", "PSNR dB"
        )?;
        for entry in &self.entries {
            match &entry.outcome {
                Ok(r) => {
                    let psnr = r.psnr.map_or_else(|| "n/a".to_string(), |db| format!("{db:.1}"));
                    writeln!(
                        f,
                        "{:<12} {:>6.2} {:<10} {:>8.2} {:>8.1}ms {:>7.1}ms {:>9}",
                        entry.name,
                        r.quality.mos,
                        r.quality.rating.to_string(),
                        r.packet_loss * 100.0,
                        r.latency.mean,
                        r.jitter.mean,
                        psnr
                    )?;
                }
                Err(e) => writeln!(f, "{:<12} failed: {:#}", entry.name, e)?,
            }
        }
        if let Some((name, report)) = self.best() {
            writeln!(f, "Best: {} (MOS {:.2})", name, report.quality.mos)?;
        }
        Ok(())
    }
}

/// A set of trials sharing one base configuration.
///
/// Each trial overrides the base's conditions or codec. When an output
/// directory is set, every trial writes `<dir>/<name>.wav`.
pub struct Sweep {
    base: TrialConfig,
    output_dir: Option<PathBuf>,
    metrics: Option<MetricsContext>,
}

impl Sweep {
    // ---
    pub fn new(base: TrialConfig) -> Self {
        Self {
            base,
            output_dir: None,
            metrics: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the base configuration once under each of `conditions`.
    ///
    /// # Errors
    ///
    /// Returns error only if the output directory cannot be created. A
    /// trial that fails is recorded in its entry and the sweep moves on.
    pub async fn run(&self, conditions: &[NamedConditions]) -> Result<SweepReport> {
        // ---
        let mut trials = Vec::with_capacity(conditions.len());
        for named in conditions {
            trials.push((
                named.name.clone(),
                TrialConfig {
                    conditions: named.conditions,
                    ..self.base.clone()
                },
            ));
        }
        self.run_all(trials).await
    }

    /// Runs the base configuration once per codec, all under the base's
    /// network conditions.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn compare_codecs(&self, codecs: &[CodecKind]) -> Result<SweepReport> {
        // ---
        let trials = codecs
            .iter()
            .map(|&codec| {
                (
                    codec.to_string(),
                    TrialConfig {
                        codec,
                        ..self.base.clone()
                    },
                )
            })
            .collect();
        self.run_all(trials).await
    }

    async fn run_all(&self, trials: Vec<(String, TrialConfig)>) -> Result<SweepReport> {
        // ---
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        }

        let mut report = SweepReport::default();
        for (name, mut config) in trials {
            config.output = self.output_path(&name).or(config.output);
            info!("Sweep trial {}: {:?}", name, config.conditions);

            let mut trial = Trial::new(config);
            if let Some(m) = &self.metrics {
                trial = trial.with_metrics(m.clone());
            }

            let outcome = trial.run().await;
            match &outcome {
                Ok(r) => info!("Sweep trial {}: {}", name, r.summary_line()),
                Err(e) => error!("Sweep trial {} failed: {:#}", name, e),
            }
            report.entries.push(SweepEntry { name, outcome });
        }
        Ok(report)
    }

    fn output_path(&self, name: &str) -> Option<PathBuf> {
        self.output_dir.as_deref().map(|dir| wav_path(dir, name))
    }
}

fn wav_path(dir: &Path, name: &str) -> PathBuf {
    // ---
    let file: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{file}.wav"))
}

/// Runs `base` under each of `conditions`.
pub async fn run_sweep(base: TrialConfig, conditions: &[NamedConditions]) -> Result<SweepReport> {
    Sweep::new(base).run(conditions).await
}

/// Runs `base` once per codec under its own conditions.
pub async fn compare_codecs(base: TrialConfig, codecs: &[CodecKind]) -> Result<SweepReport> {
    Sweep::new(base).compare_codecs(codecs).await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_presets_in_order() {
        // ---
        let presets = NamedConditions::presets();
        let names: Vec<&str> = presets.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["perfect", "good", "poor"]);
        assert_eq!(presets[2].conditions.packet_loss(), 0.05);
    }

    #[test]
    fn test_wav_path_sanitizes_names() {
        // ---
        let dir = Path::new("/tmp/out");
        assert_eq!(wav_path(dir, "poor"), dir.join("poor.wav"));
        assert_eq!(wav_path(dir, "5% loss/30ms"), dir.join("5__loss_30ms.wav"));
    }

    #[test]
    fn test_empty_report() {
        // ---
        let report = SweepReport::default();
        assert!(report.best().is_none());
        assert_eq!(report.completed().count(), 0);
        assert!(report.to_string().starts_with("name"));
    }
}
