use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dictum::config::ConfigStore;
use dictum::confirm::Confirmer;
use dictum::orchestrator::{report, Action, Outcome, QueryOptions, QueryOrchestrator};
use dictum::progress::{ProgressRenderer, Spinner};
use dictum::providers::{Provider, ProviderRegistry};
use dictum::runtime::RuntimeProgress;
use std::io;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("dictum")
        .about("Turn plain-language requests into shell commands")
        .long_about(
            "dictum asks a language model for a single shell command, checks it for risk, \
             and prints it (or runs it with --exec).",
        )
        .version(env!("CARGO_PKG_VERSION"))
        .args_conflicts_with_subcommands(true)
        .arg(
            Arg::new("query")
                .help("What you want to do, in plain words")
                .num_args(1..),
        )
        .arg(
            Arg::new("provider")
                .short('p')
                .long("provider")
                .value_name("NAME")
                .help("Provider to use (local, openai, claude, deepseek, grok)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show debug logging and risk details")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("exec")
                .short('x')
                .long("exec")
                .help("Run the command after showing it")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("config")
                .about("Show or change configuration")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show the effective configuration"))
                .subcommand(
                    Command::new("get")
                        .about("Print one value")
                        .arg(Arg::new("key").required(true)),
                )
                .subcommand(
                    Command::new("set")
                        .about("Change one value in the config file")
                        .arg(Arg::new("key").required(true))
                        .arg(Arg::new("value").required(true)),
                )
                .subcommand(Command::new("path").about("Print the config file location"))
                .subcommand(Command::new("init").about("Write a default config file")),
        )
        .subcommand(Command::new("providers").about("List providers and whether they are ready"))
        .subcommand(Command::new("version").about("Print the version"))
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,dictum=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");
    init_tracing(verbose);

    let store = ConfigStore::default_location()?;

    match matches.subcommand() {
        Some(("config", sub)) => return handle_config(&store, sub),
        Some(("providers", _)) => return list_providers(store).await,
        Some(("version", _)) => {
            println!("dictum {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let query = matches
        .get_many::<String>("query")
        .unwrap_or_default()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    if query.trim().is_empty() {
        eprintln!("No query provided. Use 'dictum --help' for usage information.");
        return Ok(());
    }

    let options = QueryOptions {
        provider: matches.get_one::<String>("provider").cloned(),
        execute: matches.get_flag("exec"),
        verbose,
    };

    let code = run_query(store, &query, &options).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_query(store: ConfigStore, query: &str, options: &QueryOptions) -> Result<i32> {
    let config = store.load();
    let orchestrator = QueryOrchestrator::new(ProviderRegistry::new(config, store));

    let provider = orchestrator.provider(options)?;
    orchestrator.check_available(&provider).await?;

    if let Provider::Local(_) = provider {
        // Setup reports its own progress, outside the spinner.
        let mut renderer = ProgressRenderer::new();
        let mut on_progress = |update: RuntimeProgress| renderer.update(update);
        provider
            .prepare(&mut on_progress)
            .await
            .context("Failed to prepare the local runtime")?;
        renderer.finish();
    }

    let outcome = {
        let _spinner = Spinner::start("Thinking...");
        orchestrator.run(&provider, query, options).await?
    };

    report(&outcome, options.verbose, &mut io::stdout(), &mut io::stderr())?;

    let Outcome::Command { command, action, .. } = outcome else {
        return Ok(0);
    };

    match action {
        Action::Show | Action::Refuse => Ok(0),
        Action::Run => orchestrator.execute(&command),
        Action::Confirm => {
            if Confirmer::new().confirm(&command)? {
                orchestrator.execute(&command)
            } else {
                eprintln!("Cancelled.");
                Ok(0)
            }
        }
    }
}

fn handle_config(store: &ConfigStore, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => println!("{}", store.show()?),
        Some(("get", sub)) => {
            let key = required(sub, "key")?;
            println!("{}", store.get(key)?);
        }
        Some(("set", sub)) => {
            let key = required(sub, "key")?;
            let value = required(sub, "value")?;
            store.set(key, value)?;
            info!("Set {}", key);
            println!("✅ {} updated", key);
        }
        Some(("path", _)) => println!("{}", store.config_path().display()),
        Some(("init", _)) => {
            let path = store.config_path();
            if path.exists() {
                println!("Config file already exists: {}", path.display());
            } else {
                let path = store.init()?;
                println!("✅ Created {}", path.display());
            }
        }
        _ => {}
    }
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing argument: {}", name))
}

async fn list_providers(store: ConfigStore) -> Result<()> {
    let config = store.load();
    let default = config.provider.clone();
    let registry = ProviderRegistry::new(config, store);

    for name in ProviderRegistry::names() {
        let provider = registry.resolve(name)?;
        let status = if provider.is_available().await {
            "ready"
        } else if let Provider::Local(_) = provider {
            "not running (starts on first use)"
        } else {
            "no API key"
        };
        let marker = if *name == default { "*" } else { " " };
        let model = match provider.config().model.as_str() {
            "" => "(auto)",
            model => model,
        };
        println!("{} {:<10} {:<28} {}", marker, name, model, status);
    }
    Ok(())
}
