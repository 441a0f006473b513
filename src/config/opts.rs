use std::path::PathBuf;
use structopt::StructOpt;
use structopt::clap::ErrorKind;

/// Command-line options for the job supervisor.
///
/// Examples:
/// - Serve requests with a specific config file:
///   cargo run -- --config config.toml
/// - Show version:
///   cargo run -- --version
///
/// Requests are read from stdin, one JSON object per line; responses are
/// written to stdout the same way.
#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(short = "v", long = "version")]
    pub version: bool,

    #[structopt(short, long, help = "Enable debug mode (verbose logging)")]
    pub debug: bool,

    #[structopt(
        short = "c",
        long = "config",
        help = "Path to the configuration file. Created with defaults if missing."
    )]
    pub config: Option<PathBuf>,
}

impl Opts {
    /// Parse CLI arguments. If parsing fails, print the error and the full help, then exit.
    pub fn from_args() -> Self {
        let app = Opts::clap();
        match app.get_matches_safe() {
            Ok(m) => Opts::from_clap(&m),
            Err(e) => {
                let kind = e.kind;
                eprintln!("{}", e);
                let mut app = Opts::clap();
                eprintln!();
                let _ = app.print_long_help();
                eprintln!();
                std::process::exit(match kind {
                    ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => 0,
                    _ => 2,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use structopt::StructOpt;

    #[test]
    fn parse_version_flag() {
        let o = Opts::from_iter_safe(["jobvisor", "--version"]).expect("parse");
        assert!(o.version);
        assert!(!o.debug);
        assert!(o.config.is_none());
    }

    #[test]
    fn parse_config_and_debug_flags_short_and_long() {
        let o = Opts::from_iter_safe(["jobvisor", "--config", "/tmp/cfg.toml", "-d"]).expect("parse");
        assert!(!o.version);
        assert!(o.debug);
        assert_eq!(
            o.config.as_deref(),
            Some(std::path::Path::new("/tmp/cfg.toml"))
        );

        let o2 = Opts::from_iter_safe(["jobvisor", "-c", "file.toml"]).expect("parse");
        assert_eq!(o2.config.unwrap(), PathBuf::from("file.toml"));
    }

    #[test]
    fn config_is_optional() {
        let o = Opts::from_iter_safe(["jobvisor"]).expect("parse");
        assert!(o.config.is_none());
    }

    #[test]
    fn unknown_flag_errors() {
        assert!(Opts::from_iter_safe(["jobvisor", "--bogus"]).is_err());
    }
}
