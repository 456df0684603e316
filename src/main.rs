use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ai_ops::config::Config;
use ai_ops::persistence::{SessionDatabase, SessionStore};
use ai_ops::planning::{ExecReport, PlanEngine, PlanEvent, ResumeChoice};
use ai_ops::session::{deserialize, serialize, Session, SharedSession};

#[derive(Parser)]
#[command(name = "ai-ops")]
#[command(about = "AI-assisted pentest plan and execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new session
    New {
        name: String,
        /// System prompt that opens the history
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// List saved sessions
    Sessions,
    /// Export a session to a file
    Save { session: String, file: PathBuf },
    /// Import a session exported with `save`
    Load { file: PathBuf },
    /// Delete a session and its plans
    Delete { session: String },
    /// Rename a session
    Rename { session: String, name: String },
    /// Record an operator chat turn
    Say { session: String, text: String },
    /// Feed model output to the parser (reads stdin when no text is given)
    Propose { session: String, text: Option<String> },
    /// List plans with their status
    Plans { session: String },
    /// Manage a single plan
    Plan {
        session: String,
        #[command(subcommand)]
        action: PlanCommand,
    },
    /// Execute the active plan (Ctrl-C cancels the running action)
    Exec { session: String },
    /// Resume a halted plan
    Resume {
        session: String,
        /// Skip the failed action
        #[arg(long, conflicts_with = "retry")]
        skip: bool,
        /// Run the failed action again
        #[arg(long)]
        retry: bool,
    },
    /// Print the history as it would be sent to the model
    History { session: String },
    /// List registered tools
    Tools {
        /// Print JSON schemas instead of documentation
        #[arg(long)]
        schema: bool,
    },
    /// Show or write configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
        /// Write the current (or default) configuration to disk
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Make a plan the active one
    Activate { plan: String },
    /// Rename a plan
    Rename { plan: String, name: String },
    /// Delete a plan
    Delete { plan: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_ops=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    if let Commands::Config { show, init } = cli.command {
        return handle_config(&config, show, init);
    }

    let store: Arc<dyn SessionStore> = Arc::new(
        SessionDatabase::connect(&config.database_path()?)
            .await
            .context("Failed to open session database")?,
    );

    match cli.command {
        Commands::New {
            name,
            system_prompt,
        } => {
            let mut session = Session::new(name);
            if let Some(prompt) = system_prompt {
                session = session.with_system_prompt(prompt);
            }
            store.save(&session).await?;
            println!("✓ Created session {} ({})", session.name, session.id);
        }
        Commands::Sessions => {
            let sessions = store.list().await?;
            if sessions.is_empty() {
                println!("No saved sessions");
            }
            for stored in sessions {
                println!("{}", stored);
            }
        }
        Commands::Save { session, file } => {
            let session = store.open(&session).await?;
            let blob = serialize(&session)?;
            std::fs::write(&file, blob)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!("✓ Saved {} to {}", session.name, file.display());
        }
        Commands::Load { file } => {
            let blob = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let session = deserialize(&blob)?;
            store.save(&session).await?;
            println!("✓ Loaded session {} ({})", session.name, session.id);
        }
        Commands::Delete { session } => {
            store.delete(&session).await?;
            println!("✓ Deleted session {}", session);
        }
        Commands::Rename { session, name } => {
            let mut session = store.open(&session).await?;
            session.rename(name);
            store.save(&session).await?;
            println!("✓ Renamed session to {}", session.name);
        }
        Commands::Say { session, text } => {
            let mut session = store.open(&session).await?;
            session.record_user(text);
            store.save(&session).await?;
        }
        Commands::Propose { session, text } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let engine = PlanEngine::from_config(&config)?;
            let shared = store.open(&session).await?.into_shared();
            let report = engine.ingest(&shared, &text).await;
            let saved = store.save(&*shared.lock().await).await;

            let report = report?;
            saved?;
            for warning in &report.warnings {
                println!("⚠ {}", warning);
            }
            println!("✓ {} action(s) appended", report.appended);
        }
        Commands::Plans { session } => {
            let session = store.open(&session).await?;
            if session.plans.is_empty() {
                println!("No plans");
            }
            for summary in session.plan_summaries() {
                let marker = if session.active_plan.as_deref() == Some(summary.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, summary);
            }
        }
        Commands::Plan { session, action } => {
            let mut session = store.open(&session).await?;
            match action {
                PlanCommand::Activate { plan } => session.set_active_plan(&plan)?,
                PlanCommand::Rename { plan, name } => session.rename_plan(&plan, name)?,
                PlanCommand::Delete { plan } => {
                    session.delete_plan(&plan)?;
                }
            }
            store.save(&session).await?;
        }
        Commands::Exec { session } => {
            run_plan(&config, store, &session, None).await?;
        }
        Commands::Resume {
            session,
            skip,
            retry,
        } => {
            let choice = match (skip, retry) {
                (true, false) => ResumeChoice::Skip,
                (false, true) => ResumeChoice::Retry,
                _ => bail!("Choose one of --skip or --retry"),
            };
            run_plan(&config, store, &session, Some(choice)).await?;
        }
        Commands::History { session } => {
            let session = store.open(&session).await?;
            for (role, content) in session.render_prompt() {
                println!("[{}]\n{}\n", role, content);
            }
            println!("Tokens used: {}", session.token_length());
        }
        Commands::Tools { schema } => {
            let engine = PlanEngine::from_config(&config)?;
            if schema {
                let schemas = engine.registry().get_tools_schema();
                println!("{}", serde_json::to_string_pretty(&schemas)?);
            } else {
                print!("{}", engine.registry().render_documentation());
            }
        }
        // Handled before the database is opened
        Commands::Config { .. } => {}
    }

    Ok(())
}

/// Drive `exec` or `resume`, printing progress. The engine claims the stored
/// session when the run starts and checkpoints it after every action, so
/// another invocation cannot drive the same plan meanwhile.
async fn run_plan(
    config: &Config,
    store: Arc<dyn SessionStore>,
    session: &str,
    resume: Option<ResumeChoice>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let shared: SharedSession = store.open(session).await?.into_shared();
    let engine = PlanEngine::from_config(config)?
        .with_events(tx)
        .with_store(store);

    let run = async {
        match resume {
            Some(choice) => engine.resume(&shared, choice).await,
            None => engine.exec(&shared).await,
        }
    };
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = rx.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling running action...");
                engine.cancel_all().await;
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }

    let report: ExecReport = result?;
    print!("{}", report);
    Ok(())
}

fn print_event(event: &PlanEvent) {
    match event {
        PlanEvent::PlanStarted { name, pending, .. } => {
            println!("▶ Plan {} ({} pending)", name, pending)
        }
        PlanEvent::ActionStarted {
            index, description, ..
        } => println!("  ◐ #{} {}", index + 1, description),
        PlanEvent::ActionFinished {
            index,
            outcome,
            duration_ms,
            ..
        } => {
            let icon = if outcome.is_failure() { "✗" } else { "✓" };
            println!("  {} #{} {} ({} ms)", icon, index + 1, outcome, duration_ms)
        }
        PlanEvent::PlanHalted { index, .. } => {
            println!("⏸ Halted at #{}; use `resume --skip` or `resume --retry`", index + 1)
        }
        PlanEvent::PlanCompleted { .. } => println!("✓ Plan completed"),
    }
}

fn handle_config(config: &Config, show: bool, init: bool) -> Result<()> {
    if init {
        config.save()?;
        println!("Configuration saved to: {:?}", Config::config_path()?);
        return Ok(());
    }

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration file: {:?}", Config::config_path()?);
        println!("Use --show to view current configuration, --init to write it.");
    }
    Ok(())
}
