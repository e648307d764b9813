//! selfcontrol - block distracting websites through the hosts file
//!
//! Blocks run in this process while it is open. On exit they are handed off
//! to a headless copy of the binary, which keeps enforcing them until they
//! end. A startup service resumes them after a reboot.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tokio::io::BufReader;
use tokio::sync::mpsc;

use selfcontrol::cli::{Cli, Commands, Display, Menu, MenuExit, SiteCommand, Toggle};
use selfcontrol::daemon::background::REAP_POLL_INTERVAL;
use selfcontrol::daemon::{
    hand_off, reap_existing_instance, run_background_loop, BlockEngine, LaunchRole, LockFile,
    SystemProcessControl, TimerEvent,
};
use selfcontrol::timeutil::format_timestamp;
use selfcontrol::{service, BlockError, PasswordFile, Settings, SystemClock};

/// Main entry point
#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(cli.verbose);

    // Execute command
    if let Err(e) = execute(cli).await {
        Display::show_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Executes the CLI command.
async fn execute(cli: Cli) -> Result<()> {
    let settings = Settings::from_env().context("failed to load settings")?;
    settings.validate().context("invalid settings")?;

    match LaunchRole::from_env() {
        LaunchRole::Background => return run_headless(&settings, false).await,
        LaunchRole::Startup => return run_headless(&settings, true).await,
        LaunchRole::Interactive => {}
    }

    match cli.command {
        None | Some(Commands::Menu) => run_menu(&settings).await?,
        Some(Commands::Block(args)) => {
            let (engine, _events) = take_over(&settings).await?;
            let outcome = async {
                let expiry = engine.block_for_duration(args.duration, false).await?;
                if args.strict {
                    engine.enter_strict()?;
                }
                Ok::<_, BlockError>(expiry)
            }
            .await;
            // Blocks resumed by the takeover must survive a refused request.
            leave(&engine, &settings).await?;
            let expiry = outcome?;
            Display::show_block_started(&format_timestamp(&expiry));
        }
        Some(Commands::Schedule) => {
            let (engine, _events) = take_over(&settings).await?;
            let outcome = async {
                engine.check_menu_access()?;
                engine.block_by_schedule(false).await
            }
            .await;
            leave(&engine, &settings).await?;
            let expiry = outcome?;
            Display::show_block_started(&format_timestamp(&expiry));
        }
        Some(Commands::Unblock) => {
            let (engine, _events) = take_over(&settings).await?;
            let outcome = engine.unblock_all().await;
            leave(&engine, &settings).await?;
            outcome?;
            Display::show_unblocked();
        }
        Some(Commands::Status { json }) => {
            let engine = open_engine(&settings, None)?;
            let status = engine.recorded_status()?;
            if json {
                Display::show_status_json(&status)?;
            } else {
                Display::show_status(&status);
            }
        }
        Some(Commands::Strict { state, yes }) => {
            let engine = open_engine(&settings, None)?;
            match state {
                Toggle::On => {
                    if !yes {
                        anyhow::bail!(
                            "strict mode keeps blocks running until they end; \
                             pass --yes to confirm"
                        );
                    }
                    engine.enter_strict()?;
                    Display::show_success("Strict mode enabled");
                }
                Toggle::Off => {
                    if engine.recorded_status()?.is_blocking() && engine.mode()?.is_strict() {
                        anyhow::bail!(
                            "strict mode is active until {}",
                            engine.expiry_description()?
                        );
                    }
                    engine.leave_strict()?;
                    Display::show_success("Strict mode disabled");
                }
            }
        }
        Some(Commands::Site(command)) => {
            let (engine, _events) = take_over(&settings).await?;
            let outcome = match command {
                SiteCommand::Add { url } => {
                    engine.add_site(&url).map(|url| format!("Added {url}"))
                }
                SiteCommand::Remove { url } => {
                    engine.remove_site(&url).map(|url| format!("Deleted {url}"))
                }
            };
            leave(&engine, &settings).await?;
            Display::show_success(&outcome?);
        }
        Some(Commands::Background) => {
            let (engine, _events) = take_over(&settings).await?;
            if !leave(&engine, &settings).await? {
                println!("Nothing is blocked; no background process needed");
            }
        }
        Some(Commands::Install) => {
            let path = service::install(&settings).context("failed to install startup service")?;
            Display::show_install_success(&path);
        }
        Some(Commands::Uninstall) => {
            service::uninstall().context("failed to uninstall startup service")?;
            Display::show_uninstall_success();
        }
        Some(Commands::Completions { shell }) => {
            generate_completions(shell);
        }
    }

    Ok(())
}

/// Builds an engine over the configured files.
fn open_engine(
    settings: &Settings,
    events: Option<mpsc::UnboundedSender<TimerEvent>>,
) -> Result<BlockEngine> {
    let clock = Arc::new(SystemClock);
    let engine = match events {
        Some(tx) => BlockEngine::with_events(settings, clock, tx),
        None => BlockEngine::new(settings, clock),
    };
    engine
        .ensure_config()
        .with_context(|| format!("failed to create {}", settings.config_path().display()))?;
    Ok(engine)
}

/// Stops any background instance and resumes its blocks in this process.
async fn take_over(
    settings: &Settings,
) -> Result<(BlockEngine, mpsc::UnboundedReceiver<TimerEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = open_engine(settings, Some(tx))?;

    let lock = LockFile::new(settings.lock_path());
    let reaped = reap_existing_instance(
        &lock,
        &SystemProcessControl,
        settings.kill_timeout,
        REAP_POLL_INTERVAL,
    )
    .await
    .context("failed to stop the background instance")?;
    tracing::info!(?reaped, "checked for background instance");

    let outcome = engine.recover(false).await.context("failed to resume blocks")?;
    Display::show_recovery(&outcome);
    Ok((engine, rx))
}

/// Hands running blocks to a background instance. Returns false if nothing
/// was running.
async fn leave(engine: &BlockEngine, settings: &Settings) -> Result<bool> {
    if engine.registry().is_idle() {
        return Ok(false);
    }
    let pid = hand_off(engine, settings, &SystemProcessControl)
        .await
        .context("failed to hand blocks off to a background process")?;
    Display::show_background_started(pid);
    Ok(true)
}

/// Runs the interactive menu until the user leaves it or a signal arrives.
async fn run_menu(settings: &Settings) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let (engine, events) = take_over(settings).await?;
    let password = PasswordFile::new(settings.password_path());
    let mut menu = Menu::new(&engine, password, BufReader::new(tokio::io::stdin()), events);

    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let exit = tokio::select! {
        exit = menu.run() => exit,
        _ = tokio::signal::ctrl_c() => {
            println!("\nReceived interrupt");
            Ok(MenuExit::Exit)
        }
        _ = terminate.recv() => Ok(MenuExit::Exit),
    };
    drop(menu);

    // Running blocks are handed off even when the menu failed.
    leave(&engine, settings).await?;
    if exit? == MenuExit::Denied {
        println!("Access denied");
    }
    Ok(())
}

/// Body of the headless and startup roles.
///
/// A startup run only continues when the previous run left blocks to
/// resume.
async fn run_headless(settings: &Settings, startup: bool) -> Result<()> {
    let engine = open_engine(settings, None)?;
    if startup && !engine.config()?.current_status.block_on_restart {
        tracing::info!("nothing to resume at startup");
        return Ok(());
    }

    let lock = LockFile::new(settings.lock_path());
    if startup {
        reap_existing_instance(
            &lock,
            &SystemProcessControl,
            settings.kill_timeout,
            REAP_POLL_INTERVAL,
        )
        .await
        .context("failed to stop the previous instance")?;
    }

    let outcome = run_background_loop(&engine, &lock)
        .await
        .context("background instance failed")?;
    tracing::info!(?outcome, "background instance exiting");
    Ok(())
}

/// Generates shell completion scripts.
fn generate_completions(shell: clap_complete::Shell) {
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}

// ============================================================================
// Tests
// ============================================================================
