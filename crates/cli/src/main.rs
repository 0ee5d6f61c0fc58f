use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use emesh_api::{ApiError, ComponentRequest, InProcApi, MeshApi, TriggerRequest};
use emesh_core::{validate_name, BackoffPolicy, Category, DeliveryOptions, MeshConfig};
use emesh_runtime::DockerCli;
use emesh_schema::SchemaCache;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "emeshctl", version, about = "Local event mesh control")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Broker to act on (default: active broker)
    #[arg(long = "broker", global = true, env = "EMESH_CONTEXT")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kinds {
    Source,
    Target,
    Transformation,
}

impl From<Kinds> for Category {
    fn from(k: Kinds) -> Self {
        match k {
            Kinds::Source => Category::Source,
            Kinds::Target => Category::Target,
            Kinds::Transformation => Category::Transformation,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backoff {
    Linear,
    Exponential,
}

#[derive(Args, Debug, Default)]
struct DeliveryArgs {
    /// Delivery attempts before an event is dropped
    #[arg(long = "retries")]
    retries: Option<u32>,
    /// ISO-8601 delay between attempts, e.g. PT0.5S
    #[arg(long = "backoff-delay")]
    backoff_delay: Option<String>,
    #[arg(long = "backoff-policy", value_enum)]
    backoff_policy: Option<Backoff>,
}

impl From<DeliveryArgs> for DeliveryOptions {
    fn from(a: DeliveryArgs) -> Self {
        DeliveryOptions {
            retries: a.retries,
            backoff_delay: a.backoff_delay,
            backoff_policy: a.backoff_policy.map(|p| match p {
                Backoff::Linear => BackoffPolicy::Linear,
                Backoff::Exponential => BackoffPolicy::Exponential,
            }),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage brokers (one per operating context)
    Broker {
        #[command(subcommand)]
        command: BrokerCommands,
    },
    /// Create or update a component and start it
    Create {
        #[arg(value_enum)]
        category: Kinds,
        /// Kind, short (`http`) or full (`HTTPTarget`)
        kind: String,
        /// Component name (default: `<broker>-<kind>-<category>`)
        #[arg(long = "name")]
        name: Option<String>,
        /// Spec field, `path.to.field=value`; repeatable
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
        /// Secret spec field, stored in `<name>-secret`; repeatable
        #[arg(long = "secret", value_name = "PATH=VALUE")]
        secret: Vec<String>,
        /// Subscribe to every event type of this producer; repeatable
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Subscribe to this event type; repeatable
        #[arg(long = "event-type")]
        event_types: Vec<String>,
        #[command(flatten)]
        delivery: DeliveryArgs,
    },
    /// Start every stored component of the broker
    Start,
    /// Stop every running component of the broker
    Stop,
    /// Delete components with their routes and orphaned secrets
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Manage triggers directly
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Components of the broker and their runtime state
    Status,
    /// Stored records of the broker, as YAML
    Dump,
    /// Kinds available for a category
    Kinds {
        #[arg(value_enum)]
        category: Kinds,
    },
}

#[derive(Subcommand, Debug)]
enum BrokerCommands {
    Create { name: String },
    List,
    /// Make a broker the active one
    Use { name: String },
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum TriggerCommands {
    Create {
        name: String,
        /// Route only this event type (default: every event)
        #[arg(long = "event-type")]
        event_type: Option<String>,
        /// Running consumer to deliver to
        #[arg(long = "target")]
        target: Option<String>,
        #[command(flatten)]
        delivery: DeliveryArgs,
    },
    Delete {
        name: String,
    },
    Get {
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("EMESH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EMESH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EMESH_METRICS_ADDR; expected host:port");
        }
    }
}

/// `a.b=1` -> (`a.b`, 1). Values that parse as JSON keep their type; anything else is a string.
fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (path, value) = raw.split_once('=').with_context(|| format!("{:?}: expected PATH=VALUE", raw))?;
    if path.is_empty() {
        bail!("{:?}: empty field path", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((path.to_string(), value))
}

fn build_spec(sets: &[String]) -> Result<Value> {
    let mut spec = Value::Object(Default::default());
    for raw in sets {
        let (path, value) = parse_assignment(raw)?;
        emesh_core::set_path(&mut spec, &path, value).with_context(|| format!("setting {}", path))?;
    }
    Ok(spec)
}

fn build_secrets(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|r| {
            let (path, value) = r.split_once('=').with_context(|| format!("{:?}: expected PATH=VALUE", r))?;
            Ok((path.to_string(), value.to_string()))
        })
        .collect()
}

fn default_name(broker: &str, kind: &str, category: Category) -> String {
    let kind = kind.to_lowercase();
    let kind = kind.strip_suffix(category.as_str()).unwrap_or(&kind);
    format!("{}-{}-{}", broker, kind, category)
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for w in warnings {
        eprintln!("warning: {}", w);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut cfg = MeshConfig::from_env().context("loading configuration")?;
    if let Some(b) = &cli.broker {
        validate_name(b).context("--broker")?;
        cfg = cfg.with_context(b.clone());
    }
    let schema = SchemaCache::load(&cfg.crd_path(), cfg.version.clone()).context("loading schema cache")?;
    if schema.is_empty() {
        warn!(path = %cfg.crd_path().display(), "schema cache is empty; component kinds cannot be resolved");
    }
    let broker = cfg.context.clone();
    let runtime = DockerCli::default().with_timeout(cfg.runtime_timeout);
    let api = InProcApi::new(cfg, Arc::new(runtime), Arc::new(schema));

    match run(&api, cli.command, cli.output, &broker).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.downcast_ref::<ApiError>().map(ApiError::is_retryable).unwrap_or(false) {
                eprintln!("hint: the operation was partially applied; running it again converges");
            }
            Err(e)
        }
    }
}

async fn run(api: &dyn MeshApi, command: Commands, output: Output, broker: &str) -> Result<()> {
    match command {
        Commands::Broker { command } => match command {
            BrokerCommands::Create { name } => {
                let report = api.create_broker(&name).await.with_context(|| format!("creating broker {}", name))?;
                print(output, &report, |r| println!("broker {} {}", r.component, r.action))?;
            }
            BrokerCommands::List => {
                let brokers = api.list_brokers().await?;
                print(output, &brokers, |bs| {
                    for b in bs {
                        println!("{} {}", if b.active { "*" } else { " " }, b.name);
                    }
                })?;
            }
            BrokerCommands::Use { name } => {
                api.use_broker(&name).await?;
                println!("active broker: {}", name);
            }
            BrokerCommands::Delete { name } => {
                let report = api.delete_broker(&name).await.with_context(|| format!("deleting broker {}", name))?;
                print_warnings(&report.warnings);
                print(output, &report, |r| {
                    println!("broker {} deleted ({} components)", name, r.deleted().len());
                    if let Some(next) = &r.active_context {
                        println!("active broker: {}", next);
                    }
                })?;
            }
        },
        Commands::Create { category, kind, name, set, secret, sources, event_types, delivery } => {
            let category: Category = category.into();
            let name = name.unwrap_or_else(|| default_name(broker, &kind, category));
            let mut req = ComponentRequest::new(&name, &kind)
                .with_category(category)
                .with_spec(build_spec(&set)?)
                .with_delivery(delivery.into());
            req.secrets = build_secrets(&secret)?;
            req.consumes = sources;
            req.event_types = event_types;
            let report = api.reconcile(req).await.with_context(|| format!("reconciling {}", name))?;
            print_warnings(&report.warnings);
            print(output, &report, |r| {
                let port = r.instance.as_ref().map(|i| i.host_port.to_string()).unwrap_or_else(|| "-".into());
                println!("{} {} {} (port {})", r.kind, r.component, r.action, port);
                for t in &r.triggers {
                    println!("  trigger {}", t);
                }
            })?;
        }
        Commands::Start => {
            let batch = api.start().await?;
            print(output, &batch, |b| {
                for r in &b.reports {
                    println!("{:<32} {}", r.component, r.action);
                }
                for f in &b.failures {
                    println!("{:<32} failed: {}", f.component, f.error);
                }
            })?;
            for r in &batch.reports {
                print_warnings(&r.warnings);
            }
            batch.into_result().map_err(ApiError::from).context("some components did not start")?;
        }
        Commands::Stop => {
            let report = api.stop().await?;
            print_warnings(&report.warnings);
            print(output, &report, |r| {
                for o in &r.outcomes {
                    println!("{:<32} {}", o.component, o.action);
                }
            })?;
        }
        Commands::Delete { names } => {
            let report = api.delete(&names).await?;
            print_warnings(&report.warnings);
            print(output, &report, |r| {
                for o in &r.outcomes {
                    println!("{:<32} {}", o.component, o.action);
                }
            })?;
        }
        Commands::Trigger { command } => match command {
            TriggerCommands::Create { name, event_type, target, delivery } => {
                let req = TriggerRequest { name, event_type, target, delivery: delivery.into() };
                let trigger = api.upsert_trigger(req).await?;
                print(output, &trigger, |t| println!("trigger {} ({} targets)", t.name, t.targets.len()))?;
            }
            TriggerCommands::Delete { name } => {
                if !api.remove_trigger(&name).await? {
                    warn!(trigger = %name, "no such trigger");
                }
            }
            TriggerCommands::Get { name } => {
                let trigger = api.lookup_trigger(&name).await?;
                print(output, &trigger, |t| {
                    println!("name:   {}", t.name);
                    println!("filter: {}", t.event_type().unwrap_or("(all events)"));
                    for target in &t.targets {
                        println!("target: {} -> {}", target.component_ref, target.url);
                    }
                })?;
            }
        },
        Commands::Status => {
            let status = api.status().await?;
            print(output, &status, |rows| {
                println!("{:<32} {:<24} {:<10} PORT", "NAME", "KIND", "STATE");
                for s in rows {
                    let state = s.state.map(|st| format!("{:?}", st).to_lowercase()).unwrap_or_else(|| "-".into());
                    let port = s.instance.as_ref().map(|i| i.host_port.to_string()).unwrap_or_else(|| "-".into());
                    println!("{:<32} {:<24} {:<10} {}", s.name, s.kind, state, port);
                }
            })?;
        }
        Commands::Dump => {
            let objects = api.manifest().await?;
            match output {
                Output::Human => {
                    for o in &objects {
                        print!("---\n{}", serde_yaml::to_string(o)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
            }
        }
        Commands::Kinds { category } => {
            let kinds = api.list_kinds(category.into()).await?;
            print(output, &kinds, |ks| {
                for k in ks {
                    println!("{}", k);
                }
            })?;
        }
    }
    Ok(())
}
