use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use nlq_router::backends::{JsonDocumentIndex, JsonKnowledgeBase, SqliteExecutor, SqliteIntrospector};
use nlq_router::catalog::{AliasManifest, Catalog, CatalogBuilder, CatalogHandle};
use nlq_router::{RouteContext, RouteRequest, Router, RouterConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq-router")]
#[command(about = "Route natural-language questions about a property portfolio to safe, read-only lookups")]
struct Args {
    /// Router configuration file (JSON); NLQ_ROUTER_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Alias manifest (default: the embedded one)
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question
    Ask {
        /// The question, e.g. "Combien de baux actifs ?"
        utterance: String,

        /// SQLite database to introspect and query (read-only)
        #[arg(long)]
        db: PathBuf,

        /// Serialized catalog to load instead of introspecting
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Current navigation path, e.g. /biens/3
        #[arg(long, default_value = "")]
        path: String,

        /// Navigation query parameter, repeatable: --param bien_id=3
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        #[arg(long)]
        session: Option<String>,

        /// Knowledge-base articles (default: embedded)
        #[arg(long)]
        kb: Option<PathBuf>,

        /// Document index (default: embedded)
        #[arg(long)]
        docs: Option<PathBuf>,
    },
    /// Build the catalog from a database and write it out
    Catalog {
        #[arg(long)]
        db: PathBuf,

        /// Where to write the serialized catalog
        #[arg(long)]
        out: Option<PathBuf>,

        /// Where to write the alias audit CSV
        #[arg(long)]
        audit: Option<PathBuf>,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn builder(manifest: Option<&Path>) -> Result<CatalogBuilder> {
    let manifest = match manifest {
        Some(path) => AliasManifest::from_file(path)
            .with_context(|| format!("failed to load manifest {}", path.display()))?,
        None => AliasManifest::embedded()?,
    };
    Ok(CatalogBuilder::new(manifest))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = RouterConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Ask {
            utterance,
            db,
            catalog,
            path,
            params,
            session,
            kb,
            docs,
        } => {
            let catalog = match catalog {
                Some(saved) => Catalog::load(&saved)?,
                None => builder(args.manifest.as_deref())?.build(&SqliteIntrospector::open(&db)?)?,
            };
            let knowledge = match kb {
                Some(p) => JsonKnowledgeBase::load(p)?,
                None => JsonKnowledgeBase::embedded()?,
            };
            let documents = match docs {
                Some(p) => JsonDocumentIndex::load(p)?,
                None => JsonDocumentIndex::embedded()?,
            };

            let router = Router::new(Arc::new(CatalogHandle::new(catalog)), config)?
                .with_executor(Arc::new(SqliteExecutor::open(&db)?))
                .with_knowledge_base(Arc::new(knowledge))
                .with_documents(Arc::new(documents));

            let mut context = RouteContext::new(path);
            for (key, value) in params {
                context = context.with_param(key, value);
            }
            let mut request = RouteRequest::new(utterance).with_context(context);
            if let Some(id) = session {
                request = request.in_session(id);
            }

            let result = router.route(request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Catalog { db, out, audit } => {
            if out.is_none() && audit.is_none() {
                return Err(anyhow!("nothing to write: pass --out and/or --audit"));
            }
            let catalog = builder(args.manifest.as_deref())?.build(&SqliteIntrospector::open(&db)?)?;
            if let Some(out) = out {
                catalog.save(&out)?;
            }
            if let Some(audit) = audit {
                let file = std::fs::File::create(&audit)
                    .with_context(|| format!("failed to create {}", audit.display()))?;
                catalog.write_alias_audit(file)?;
                info!("Alias audit written to {}", audit.display());
            }
        }
    }

    Ok(())
}
