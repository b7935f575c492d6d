//! Multi-cycle loop for `evolver run`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cycle::CycleReport;
use crate::io::config::{CONFIG_RELATIVE_PATH, EvolverConfig, load_config};

/// Command-line overrides applied on top of each (re)loaded config.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    pub max_cycles: Option<u64>,
    pub interval: Option<Duration>,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles_run: u64,
    pub committed: u64,
    pub failed: u64,
    /// Cycles that ended in an internal fault.
    pub faults: u64,
}

/// Run cycles until `max_cycles` is reached (forever when unset).
///
/// The config is re-read before every cycle; an unreadable or invalid config
/// keeps the previous one. Cycle faults are logged and the loop continues.
/// `pause` is called between cycles with the configured interval.
pub fn run_loop<C, P>(
    root: &Path,
    options: &LoopOptions,
    mut run_one: C,
    mut pause: P,
) -> Result<LoopOutcome>
where
    C: FnMut(&EvolverConfig) -> Result<CycleReport>,
    P: FnMut(Duration),
{
    let config_path = root.join(CONFIG_RELATIVE_PATH);
    let mut cfg = load_config(&config_path)
        .with_context(|| format!("load {}", config_path.display()))?;
    let mut outcome = LoopOutcome::default();

    loop {
        if outcome.cycles_run > 0 {
            match load_config(&config_path) {
                Ok(fresh) => {
                    if fresh != cfg {
                        info!("config reloaded");
                    }
                    cfg = fresh;
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "config reload failed; keeping previous config");
                }
            }
        }

        let max_cycles = options.max_cycles.or(cfg.cycle.max_cycles);
        if max_cycles.is_some_and(|max| outcome.cycles_run >= max) {
            info!(cycles = outcome.cycles_run, "max cycles reached");
            return Ok(outcome);
        }

        match run_one(&cfg) {
            Ok(report) if report.committed() => outcome.committed += 1,
            Ok(_) => outcome.failed += 1,
            Err(err) => {
                error!(err = %format!("{err:#}"), "cycle fault; continuing");
                outcome.faults += 1;
            }
        }
        outcome.cycles_run += 1;

        if max_cycles.is_some_and(|max| outcome.cycles_run >= max) {
            info!(cycles = outcome.cycles_run, "max cycles reached");
            return Ok(outcome);
        }
        let interval = options.interval.unwrap_or_else(|| cfg.interval());
        info!(secs = interval.as_secs(), "sleeping until next cycle");
        pause(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::choose;
    use crate::core::types::{CycleRecord, FailureKind};
    use crate::io::config::write_config;
    use anyhow::anyhow;
    use std::fs;

    fn report(record: CycleRecord) -> CycleReport {
        CycleReport {
            decision: choose(&[], None),
            record,
        }
    }

    #[test]
    fn stops_at_max_cycles_and_tallies_outcomes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut seq = 0;
        let mut pauses = Vec::new();
        let outcome = run_loop(
            temp.path(),
            &LoopOptions {
                max_cycles: Some(3),
                interval: Some(Duration::from_secs(7)),
            },
            |_cfg| {
                seq += 1;
                match seq {
                    1 => Ok(report(CycleRecord::success(1, "add", "slime", None))),
                    2 => Err(anyhow!("disk full")),
                    _ => Ok(report(CycleRecord::failure(
                        3,
                        "add",
                        "bat",
                        FailureKind::Functional,
                        "boom",
                    ))),
                }
            },
            |d| pauses.push(d),
        )
        .expect("loop");
        assert_eq!(
            outcome,
            LoopOutcome {
                cycles_run: 3,
                committed: 1,
                failed: 1,
                faults: 1,
            }
        );
        assert_eq!(pauses, vec![Duration::from_secs(7); 2]);
    }

    #[test]
    fn reloads_config_between_cycles_and_keeps_last_good_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join(CONFIG_RELATIVE_PATH);
        let mut cfg = EvolverConfig::default();
        cfg.cycle.interval_secs = 1;
        cfg.cycle.max_cycles = Some(3);
        write_config(&config_path, &cfg).expect("write config");

        let mut seen = Vec::new();
        let outcome = run_loop(
            temp.path(),
            &LoopOptions::default(),
            |cfg| {
                seen.push(cfg.cycle.interval_secs);
                match seen.len() {
                    1 => {
                        let mut next = cfg.clone();
                        next.cycle.interval_secs = 2;
                        write_config(&config_path, &next)?;
                    }
                    2 => fs::write(&config_path, "not = [valid")?,
                    _ => {}
                }
                Ok(report(CycleRecord::success(seen.len() as u64, "add", "x", None)))
            },
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.cycles_run, 3);
        assert_eq!(seen, vec![1, 2, 2]);
    }

    #[test]
    fn zero_max_cycles_runs_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = run_loop(
            temp.path(),
            &LoopOptions {
                max_cycles: Some(0),
                interval: None,
            },
            |_| panic!("no cycle expected"),
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome, LoopOutcome::default());
    }
}
