use jobvisor::config::{EnvVar, Opts, get_or_create_config};
use jobvisor::core::collaborators::{JsonResultExtractor, ScriptResolver};
use jobvisor::core::jobs::JobManager;
use jobvisor::global_var::{ENV_VAR, LOGGER_CELL};
use jobvisor::interface::serve;
use jobvisor::utilities::init_file_logger;
use std::sync::Arc;
use tokio::io::BufReader;

fn print_version_and_exit() -> ! {
    // These are set by build.rs; fall back to unknown if missing
    let pkg_version = env!("CARGO_PKG_VERSION");
    let commit = option_env!("GIT_COMMIT").unwrap_or("unknown");
    let state = option_env!("GIT_STATE").unwrap_or("unknown");
    let built = option_env!("BUILD_TIME").unwrap_or("unknown time");
    println!(
        "jobvisor {} (commit: {}, state: {}, built: {})",
        pkg_version, commit, state, built
    );
    std::process::exit(0)
}

fn fail(msg: String) -> ! {
    eprintln!("{}", msg);
    std::process::exit(1)
}

fn main() {
    let opts = Opts::from_args();

    if opts.version {
        print_version_and_exit();
    }
    if opts.debug {
        // SAFETY: no other thread exists yet
        unsafe { std::env::set_var("DEBUG_MODE", "1") };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => fail(format!("Failed to start async runtime: {}", e)),
    };
    let code = runtime.block_on(run(opts));
    std::process::exit(code)
}

async fn run(opts: Opts) -> i32 {
    let cfg_path = opts.config.as_deref().and_then(|p| p.to_str());
    let config = match get_or_create_config(cfg_path) {
        Ok(config) => config,
        Err(e) => fail(format!("Failed to load or create configuration: {}", e)),
    };
    let env_var = match EnvVar::from_config(&config) {
        Ok(env_var) => env_var,
        Err(e) => fail(format!("Invalid configuration: {}", e)),
    };
    let env_var = ENV_VAR.get_or_init(|| env_var);

    let (logger, logger_task) = match init_file_logger(env_var.get_log_file()).await {
        Ok(pair) => pair,
        Err(e) => fail(format!("Failed to open log file {:?}: {}", env_var.get_log_file(), e)),
    };
    let _ = LOGGER_CELL.set(logger.clone());
    logger.info(format!(
        "jobvisor {} starting, state dir {:?}",
        env!("CARGO_PKG_VERSION"),
        env_var.get_state_dir()
    ));

    let manager = match JobManager::open(
        env_var.manager_config(),
        Arc::new(ScriptResolver::from_env(env_var)),
        Arc::new(JsonResultExtractor),
    )
    .await
    {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            logger.error(format!("Failed to open job manager: {}", e));
            logger.shutdown().await;
            let _ = logger_task.await;
            fail(format!("Failed to open job manager: {}", e));
        }
    };

    let served = tokio::select! {
        res = serve(manager.clone(), BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => res,
        _ = tokio::signal::ctrl_c() => {
            logger.info("Interrupted, shutting down");
            Ok(())
        }
    };
    let mut code = 0;
    if let Err(e) = served {
        logger.error(format!("Request loop failed: {}", e));
        code = 1;
    }
    if let Err(e) = manager.shutdown().await {
        logger.error(format!("Shutdown failed: {}", e));
        code = 1;
    }
    logger.shutdown().await;
    let _ = logger_task.await;
    code
}
