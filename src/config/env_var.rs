use super::config::expand_tilde;
use crate::config::Config;
use crate::core::jobs::ManagerConfig;
use crate::err::Result;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Orchestrator {
    state_dir: PathBuf,
    scripts_dir: Option<PathBuf>,
    interpreter: Option<String>,
    cancel_grace_period: Duration,
    job_timeout: Option<Duration>,
    launch_queue_bound: usize,
}

#[derive(Debug, Clone)]
struct Logging {
    log_file: PathBuf,
}

/// Resolved runtime settings: paths expanded, zero values mapped to `None`,
/// and ranges checked.
#[derive(Debug, Clone)]
pub struct EnvVar {
    orchestrator: Orchestrator,
    logging: Logging,
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s) }
}

impl EnvVar {
    pub fn from_config(config: &Config) -> Result<Self> {
        let orch = &config.orchestrator;
        let state_dir = non_empty(&orch.state_dir)
            .ok_or("orchestrator.state_dir must not be empty")?;
        if orch.cancel_grace_period_secs == 0 {
            return Err("orchestrator.cancel_grace_period_secs must be at least 1".into());
        }

        Ok(Self {
            orchestrator: Orchestrator {
                state_dir: PathBuf::from(expand_tilde(state_dir)),
                scripts_dir: non_empty(&orch.scripts_dir).map(|d| PathBuf::from(expand_tilde(d))),
                interpreter: non_empty(&orch.interpreter).map(String::from),
                cancel_grace_period: Duration::from_secs(orch.cancel_grace_period_secs),
                job_timeout: match orch.job_timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                launch_queue_bound: orch.launch_queue_bound,
            },
            logging: Logging {
                log_file: PathBuf::from(expand_tilde(&config.logging.log_file)),
            },
        })
    }

    pub fn get_state_dir(&self) -> &PathBuf {
        &self.orchestrator.state_dir
    }
    pub fn get_scripts_dir(&self) -> Option<&PathBuf> {
        self.orchestrator.scripts_dir.as_ref()
    }
    pub fn get_interpreter(&self) -> Option<&str> {
        self.orchestrator.interpreter.as_deref()
    }
    pub fn get_log_file(&self) -> &PathBuf {
        &self.logging.log_file
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            state_dir: self.orchestrator.state_dir.clone(),
            cancel_grace_period: self.orchestrator.cancel_grace_period,
            job_timeout: self.orchestrator.job_timeout,
            launch_queue_bound: self.orchestrator.launch_queue_bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn from_config_expands_tilde_and_maps_zero_values() {
        let expected_home = env::var("HOME").unwrap();

        let mut cfg = Config::new();
        cfg.orchestrator.state_dir = "~/state".into();
        cfg.orchestrator.scripts_dir = "~/scripts".into();
        cfg.orchestrator.interpreter = " python3 ".into();
        cfg.orchestrator.job_timeout_secs = 0;
        cfg.orchestrator.cancel_grace_period_secs = 4;

        let ev = EnvVar::from_config(&cfg).expect("from_config should succeed");
        assert_eq!(ev.get_state_dir(), &PathBuf::from(format!("{}/state", expected_home)));
        assert_eq!(
            ev.get_scripts_dir(),
            Some(&PathBuf::from(format!("{}/scripts", expected_home)))
        );
        assert_eq!(ev.get_interpreter(), Some("python3"));
        assert!(ev.get_log_file().starts_with(&expected_home));

        let mc = ev.manager_config();
        assert_eq!(mc.job_timeout, None);
        assert_eq!(mc.cancel_grace_period, Duration::from_secs(4));
    }

    #[test]
    fn empty_optional_fields_become_none() {
        let cfg = Config::new();
        let ev = EnvVar::from_config(&cfg).unwrap();
        assert!(ev.get_scripts_dir().is_none());
        assert!(ev.get_interpreter().is_none());
    }

    #[test]
    fn rejects_zero_grace_period_and_empty_state_dir() {
        let mut cfg = Config::new();
        cfg.orchestrator.cancel_grace_period_secs = 0;
        assert!(EnvVar::from_config(&cfg).is_err());

        let mut cfg = Config::new();
        cfg.orchestrator.state_dir = "  ".into();
        assert!(EnvVar::from_config(&cfg).is_err());
    }

    #[test]
    fn timeout_is_set_when_non_zero() {
        let mut cfg = Config::new();
        cfg.orchestrator.job_timeout_secs = 90;
        let ev = EnvVar::from_config(&cfg).unwrap();
        assert_eq!(ev.manager_config().job_timeout, Some(Duration::from_secs(90)));
    }
}
