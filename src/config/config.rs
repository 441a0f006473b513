use crate::err::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "~/.jobvisor/config.toml";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OrchestratorSection {
    pub state_dir: String,
    pub scripts_dir: String,
    /// Interpreter prepended to every script, e.g. `python3`. Empty means the
    /// script itself must be executable.
    pub interpreter: String,
    pub cancel_grace_period_secs: u64,
    /// 0 disables the wall-clock timeout.
    pub job_timeout_secs: u64,
    pub launch_queue_bound: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            state_dir: String::from("~/.jobvisor/state"),
            scripts_dir: String::new(),
            interpreter: String::new(),
            cancel_grace_period_secs: 10,
            job_timeout_secs: 0,
            launch_queue_bound: 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingSection {
    pub log_file: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_file: String::from("~/.jobvisor/jobvisor.log"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorSection,
    pub logging: LoggingSection,
}

/// Replace a leading `~` with `$HOME`.
pub(crate) fn expand_tilde(p: &str) -> String {
    if p == "~" || p.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, &p[1..]);
        }
    }
    p.to_string()
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config_path: Option<&str>) -> Result<Self> {
        match config_path {
            Some(p) => {
                let content = fs::read_to_string(expand_tilde(p))?;
                match toml::from_str(&content) {
                    Ok(config) => Ok(config),
                    Err(e) => Err(e.into()),
                }
            }
            None => Err("No config file provided".into()),
        }
    }

    pub fn dump(&self, config_path: &str) -> Result<()> {
        let expanded = expand_tilde(config_path);
        let path = Path::new(&expanded);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let p = fs::File::create(path)?;
        let mut f_writer = std::io::BufWriter::new(p);
        f_writer.write_all(toml::to_string(&self)?.as_bytes())?;
        f_writer.flush()?;
        Ok(())
    }
}

/// Load the config at `config_path`, or write a default one there when the
/// file does not exist yet. A file that exists but fails to parse is an error.
pub fn get_or_create_config(config_path: Option<&str>) -> Result<Config> {
    let path = config_path
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_CONFIG_PATH);
    if Path::new(&expand_tilde(path)).exists() {
        return Config::from_config(Some(path));
    }
    let config = Config::new();
    config.dump(path)?;
    eprintln!("Wrote default configuration to {}", expand_tilde(path));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::TmpDirGuard;
    use serial_test::serial;
    use std::env;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [orchestrator]
            job_timeout_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.job_timeout_secs, 600);
        assert_eq!(cfg.orchestrator.cancel_grace_period_secs, 10);
        assert_eq!(cfg.orchestrator.launch_queue_bound, 1024);
        assert!(cfg.logging.log_file.ends_with("jobvisor.log"));
    }

    #[test]
    fn dump_creates_parent_dirs_and_round_trips() {
        let tmp = TmpDirGuard::new("cfg_dump");
        let path = tmp.join("nested/config.toml");

        let mut cfg = Config::new();
        cfg.orchestrator.interpreter = "python3".into();
        cfg.orchestrator.cancel_grace_period_secs = 3;
        cfg.dump(path.to_str().unwrap()).expect("dump should succeed");

        let loaded = Config::from_config(path.to_str()).unwrap();
        assert_eq!(loaded.orchestrator.interpreter, "python3");
        assert_eq!(loaded.orchestrator.cancel_grace_period_secs, 3);
    }

    #[test]
    fn get_or_create_writes_default_when_missing() {
        let tmp = TmpDirGuard::new("cfg_create");
        let path = tmp.join("config.toml");
        assert!(!path.exists());

        let cfg = get_or_create_config(path.to_str()).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.orchestrator.job_timeout_secs, 0);

        // A second call reads the file instead of overwriting it.
        fs::write(&path, "[orchestrator]\njob_timeout_secs = 42\n").unwrap();
        let cfg = get_or_create_config(path.to_str()).unwrap();
        assert_eq!(cfg.orchestrator.job_timeout_secs, 42);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = TmpDirGuard::new("cfg_bad");
        let path = tmp.join("config.toml");
        fs::write(&path, "[orchestrator\nnope").unwrap();
        assert!(get_or_create_config(path.to_str()).is_err());
    }

    #[test]
    #[serial]
    fn from_config_expands_tilde_with_home() {
        let tmp_home = TmpDirGuard::new("home_root");
        let prev_home = env::var_os("HOME");
        unsafe {
            env::set_var("HOME", tmp_home.as_path());
        }

        let mut cfg = Config::new();
        cfg.orchestrator.job_timeout_secs = 77;
        cfg.dump("~/jobvisor.toml").unwrap();
        let loaded = Config::from_config(Some("~/jobvisor.toml")).expect("should load via ~");
        assert_eq!(loaded.orchestrator.job_timeout_secs, 77);
        assert!(tmp_home.join("jobvisor.toml").exists());
        assert_eq!(expand_tilde("~"), tmp_home.to_string_lossy());
        assert_eq!(expand_tilde("/abs/~x"), "/abs/~x");

        match prev_home {
            Some(prev) => unsafe { env::set_var("HOME", prev) },
            None => unsafe { env::remove_var("HOME") },
        }
    }
}
