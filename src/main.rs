//! taskdeck CLI - an offline-capable Kanban board for a remote task server.

use std::path::Path;
use std::process;

use clap::Parser;
use taskdeck::cli::{CacheCommands, Cli, Commands, ConfigCommands, QueueCommands, TaskCommands};
use taskdeck::commands::{self, Output, Shell, config as config_cmd};
use taskdeck::config::{ConfigOverrides, Settings, resolve_config};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "TD_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let human_flag = cli.human_readable;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = cli.api_url {
        overrides = overrides.with_api_url(url.clone());
    }

    let settings = match resolve_config(&overrides) {
        Ok(settings) => settings,
        Err(e) => exit_with_error(&e, human_flag),
    };
    let human = commands::wants_human(human_flag, &settings);

    let log_dir = matches!(cli.command, Commands::Watch).then(|| settings.data_dir.join("logs"));
    let _guard = init_logging(cli.log_json, log_dir.as_deref());

    if let Err(e) = run_command(cli.command, &settings, cli.offline, human).await {
        exit_with_error(&e, human);
    }
}

fn exit_with_error(error: &taskdeck::Error, human: bool) -> ! {
    if human {
        eprintln!("Error: {}", error);
    } else {
        eprintln!("{}", serde_json::json!({ "error": error.to_string() }));
    }
    process::exit(1);
}

/// Install the tracing subscriber. `td watch` also logs to a daily file.
fn init_logging(log_json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "td.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
    guard
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

async fn run_command(
    command: Commands,
    settings: &Settings,
    offline: bool,
    human: bool,
) -> Result<(), taskdeck::Error> {
    // Commands that need no board.
    match command {
        Commands::Init => {
            output(&commands::init(settings)?, human);
            return Ok(());
        }
        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => output(&config_cmd::config_show(settings), human),
                ConfigCommands::Get { key } => {
                    output(&config_cmd::config_get(settings, &key)?, human)
                }
                ConfigCommands::Set { key, value } => {
                    output(&config_cmd::config_set(settings, &key, &value)?, human)
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let shell = Shell::open(settings, offline).await?;
    let result = run_board_command(command, &shell, human).await;
    let closed = shell.close().await;
    result.and(closed)
}

async fn run_board_command(
    command: Commands,
    shell: &Shell,
    human: bool,
) -> Result<(), taskdeck::Error> {
    match command {
        Commands::Auth => output(&commands::auth(shell).await?, human),

        Commands::Sync { full } => output(&commands::sync(shell, full).await?, human),

        Commands::Board => output(&commands::board(shell).await?, human),

        Commands::Task { command } => match command {
            TaskCommands::Create {
                title,
                description,
                priority,
                calendar,
                due,
            } => {
                let result =
                    commands::task_create(shell, title, description, priority, calendar, due)
                        .await?;
                output(&result, human);
            }
            TaskCommands::Show { id } => output(&commands::task_show(shell, id).await?, human),
            TaskCommands::Complete { id } => {
                output(&commands::task_complete(shell, id).await?, human)
            }
            TaskCommands::Progress { id, percent } => {
                output(&commands::task_progress(shell, id, percent).await?, human)
            }
        },

        Commands::Move { id, to, index } => {
            output(&commands::task_move(shell, id, to, index).await?, human)
        }

        Commands::Queue { command } => match command {
            QueueCommands::List => output(&commands::queue_list(shell).await?, human),
            QueueCommands::Drain => output(&commands::queue_drain(shell).await?, human),
            QueueCommands::Failed => output(&commands::queue_failed(shell).await?, human),
            QueueCommands::Retry { id } => {
                output(&commands::queue_retry(shell, id).await?, human)
            }
            QueueCommands::Discard { id } => {
                output(&commands::queue_discard(shell, id).await?, human)
            }
        },

        Commands::Watch => commands::watch(shell, human).await?,

        Commands::Cache { command } => match command {
            CacheCommands::Stats => output(&commands::cache_stats(shell).await?, human),
            CacheCommands::Clear => output(&commands::cache_clear(shell).await?, human),
        },

        Commands::Reset { yes } => output(&commands::reset(shell, yes).await?, human),

        Commands::Init | Commands::Config { .. } => {}
    }
    Ok(())
}
