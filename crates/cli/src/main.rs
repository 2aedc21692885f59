use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kform_core::tree::{root_block, str_field};
use kform_core::{Identity, Tree};
use kform_lifecycle::{
    load, migrate_record, plan, store, ControlApi, Controller, ControllerConfig, DeploymentKind, Existence,
    KubeControl, ResourceData, ResourceKind, RoleKind,
};
use kform_persist::{SqliteStore, StateStore};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kformctl", version, about = "Declarative lifecycle for Kubernetes Deployments and Roles")]
struct Cli {
    /// Resource kind
    #[arg(short = 'k', long = "kind", value_enum, global = true, default_value_t = Kind::Deployment)]
    kind: Kind,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind {
    Deployment,
    Role,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a resource from a YAML/JSON configuration tree
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Refresh the stored state from the cluster
    Read {
        /// Identity, e.g. "default/web"
        id: String,
    },
    /// Delete a resource (deployments are scaled to zero first)
    Delete { id: String },
    /// Check whether a resource exists
    Exists { id: String },
    /// Upgrade a stored record to the current schema version
    Migrate { id: String },
    /// Print the JSON patch an apply would submit, without contacting the cluster
    Plan {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// List stored records of the kind
    List,
}

fn init_tracing() {
    let env = std::env::var("KFORM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KFORM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KFORM_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_tree(path: &Path) -> Result<Tree> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tree: Tree = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", path.display()))?
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {} as YAML", path.display()))?
    };
    if !tree.is_object() {
        return Err(anyhow!("{}: configuration must be a mapping", path.display()));
    }
    Ok(tree)
}

/// Identity a desired tree is tracked under. A `generate_name`-only tree gets
/// a fresh server-side name on every create and cannot be tracked.
fn identity_of(tree: &Tree, cfg: &ControllerConfig) -> Result<Identity> {
    let meta = root_block(tree, "metadata").ok_or_else(|| anyhow!("metadata block is required"))?;
    let Some(name) = str_field(meta, "name") else {
        if let Some(prefix) = str_field(meta, "generate_name") {
            bail!("metadata.name is required: generate_name {:?} alone would create a new object on every apply", prefix);
        }
        bail!("metadata.name is required");
    };
    let namespace = str_field(meta, "namespace").unwrap_or(&cfg.default_namespace);
    Ok(Identity::new(namespace, name)?)
}

fn load_stored<K: ResourceKind>(db: &SqliteStore, id: &Identity) -> Result<Option<ResourceData>> {
    match db.get(K::KIND, &id.to_string())? {
        Some(stored) => Ok(Some(load::<K>(stored.record)?)),
        None => Ok(None),
    }
}

fn save<K: ResourceKind>(db: &SqliteStore, data: &ResourceData) -> Result<()> {
    if data.id.is_some() {
        db.put(K::KIND, &store::<K>(data))?;
    }
    Ok(())
}

fn print_tree(output: Output, verb: &str, data: &ResourceData) -> Result<()> {
    match output {
        Output::Human => {
            let id = data.id.as_ref().map(Identity::to_string).unwrap_or_else(|| "(none)".into());
            println!("{} {}", verb, id);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&data.config)?),
    }
    Ok(())
}

async fn connect<K>(cfg: ControllerConfig) -> Result<Controller<K, KubeControl>>
where
    K: ResourceKind,
    KubeControl: ControlApi<K>,
{
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    Ok(Controller::new(KubeControl::new(client), cfg))
}

async fn run<K>(cli: &Cli, db: &SqliteStore) -> Result<()>
where
    K: ResourceKind,
    KubeControl: ControlApi<K>,
{
    let cfg = ControllerConfig::from_env();
    match &cli.command {
        Commands::Apply { file } => {
            let desired = read_tree(file)?;
            let stored = load_stored::<K>(db, &identity_of(&desired, &cfg)?)?;
            let ctl = connect::<K>(cfg).await?;
            match stored {
                Some(mut data) => match ctl.probe(&data).await {
                    Existence::Present => {
                        let res = ctl.update(&mut data, &desired).await;
                        save::<K>(db, &data)?;
                        res?;
                        print_tree(cli.output, "updated", &data)?;
                    }
                    Existence::Absent => {
                        info!(kind = K::KIND, "stored resource no longer exists; recreating");
                        create::<K>(&ctl, db, cli.output, desired).await?;
                    }
                    Existence::Unknown(e) => return Err(e).context("checking whether the resource exists"),
                },
                None => create::<K>(&ctl, db, cli.output, desired).await?,
            }
        }
        Commands::Read { id } => {
            let id: Identity = id.parse()?;
            let mut data = load_stored::<K>(db, &id)?.unwrap_or(ResourceData { id: Some(id.clone()), config: Tree::Null });
            let ctl = connect::<K>(cfg).await?;
            match ctl.read(&mut data).await {
                Ok(()) => {
                    save::<K>(db, &data)?;
                    print_tree(cli.output, "read", &data)?;
                }
                Err(e) if e.is_not_found() => {
                    db.delete(K::KIND, &id.to_string())?;
                    println!("{} is gone; dropped stored state", id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Delete { id } => {
            let id: Identity = id.parse()?;
            let mut data = load_stored::<K>(db, &id)?.unwrap_or(ResourceData { id: Some(id.clone()), config: Tree::Null });
            let ctl = connect::<K>(cfg).await?;
            ctl.delete(&mut data).await?;
            db.delete(K::KIND, &id.to_string())?;
            println!("deleted {}", id);
        }
        Commands::Exists { id } => {
            let id: Identity = id.parse()?;
            let data = ResourceData { id: Some(id.clone()), config: Tree::Null };
            let ctl = connect::<K>(cfg).await?;
            match ctl.probe(&data).await {
                Existence::Present => println!("{} exists", id),
                Existence::Absent => println!("{} does not exist", id),
                Existence::Unknown(e) => return Err(e).context(format!("existence of {} is unknown", id)),
            }
        }
        Commands::Migrate { id } => {
            let stored = db.get(K::KIND, id)?.ok_or_else(|| anyhow!("no stored {} record for {}", K::KIND, id))?;
            let from = stored.record.schema_version;
            let record = migrate_record::<K>(stored.record)?;
            db.put(K::KIND, &record)?;
            println!("migrated {} from v{} to v{}", id, from, record.schema_version);
        }
        Commands::List => {
            let mut rows = Vec::new();
            for id in db.list(K::KIND)? {
                if let Some(stored) = db.get(K::KIND, &id)? {
                    rows.push(stored);
                }
            }
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        println!("{}\tv{}\t{}", r.record.id, r.record.schema_version, r.updated_at.to_rfc3339());
                    }
                }
                Output::Json => {
                    let items: Vec<serde_json::Value> = rows
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "id": r.record.id,
                                "schema_version": r.record.schema_version,
                                "updated_at": r.updated_at.to_rfc3339(),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Plan { file } => {
            let desired = read_tree(file)?;
            match load_stored::<K>(db, &identity_of(&desired, &cfg)?)? {
                Some(data) => {
                    let ops = plan::<K>(&data.config, &desired)?;
                    if ops.is_empty() {
                        println!("no changes");
                    } else {
                        println!("{}", String::from_utf8(ops.to_bytes()?)?);
                    }
                }
                None => println!("no stored state; apply would create the resource"),
            }
        }
    }
    Ok(())
}

async fn create<K>(ctl: &Controller<K, KubeControl>, db: &SqliteStore, output: Output, desired: Tree) -> Result<()>
where
    K: ResourceKind,
    KubeControl: ControlApi<K>,
{
    let mut data = ResourceData::new(desired);
    let res = ctl.create(&mut data).await;
    // Identity is kept even when convergence fails so a later read can recover.
    save::<K>(db, &data)?;
    res?;
    print_tree(output, "created", &data)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let db = SqliteStore::open_default()?;
    match cli.kind {
        Kind::Deployment => run::<DeploymentKind>(&cli, &db).await,
        Kind::Role => run::<RoleKind>(&cli, &db).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_defaults_namespace() {
        let cfg = ControllerConfig::default();
        let tree = json!({ "metadata": [{ "name": "web" }] });
        assert_eq!(identity_of(&tree, &cfg).unwrap().to_string(), format!("{}/web", cfg.default_namespace));
        let tree = json!({ "metadata": [{ "name": "web", "namespace": "prod" }] });
        assert_eq!(identity_of(&tree, &cfg).unwrap().to_string(), "prod/web");
    }

    #[test]
    fn generate_name_only_tree_is_rejected() {
        let cfg = ControllerConfig::default();
        let err = identity_of(&json!({ "metadata": [{ "generate_name": "web-" }] }), &cfg).unwrap_err();
        assert!(err.to_string().contains("generate_name \"web-\""), "{}", err);
        assert!(identity_of(&json!({ "spec": [{}] }), &cfg).is_err());
    }

    #[test]
    fn list_takes_no_arguments() {
        let cli = Cli::try_parse_from(["kformctl", "-k", "role", "list"]).unwrap();
        assert_eq!(cli.kind, Kind::Role);
        assert!(matches!(cli.command, Commands::List));
    }
}
