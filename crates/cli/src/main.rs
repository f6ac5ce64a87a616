use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keel_core::Object;
use keel_render::{CertManagerCertificateProvider, CertificateProvider};
use keel_server::{CatalogStore, ServerConfig, DEFAULT_GZIP_MIN_SIZE};
use keel_source::{Catalog, ClientProtocol, ImageUnpacker, OciRegistry, PolicySource, Unpacker, UnpackerConfig};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: catalog unpacking and bundle rendering")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Args, Debug)]
struct CacheArgs {
    /// Root of the unpack cache
    #[arg(long = "cache-dir", env = "KEEL_CACHE_DIR", default_value = "/var/cache/keel")]
    cache_dir: PathBuf,

    /// containers-policy.json used to admit images
    #[arg(long = "signature-policy", env = "KEEL_SIGNATURE_POLICY")]
    signature_policy: Option<PathBuf>,

    /// Accept any image when no policy file is given
    #[arg(long = "allow-insecure-policy", env = "KEEL_ALLOW_INSECURE_POLICY", action = ArgAction::SetTrue)]
    allow_insecure_policy: bool,

    /// Talk to registries over plain HTTP
    #[arg(long = "plain-http", env = "KEEL_PLAIN_HTTP", action = ArgAction::SetTrue)]
    plain_http: bool,

    #[arg(long = "registry-username", env = "KEEL_REGISTRY_USERNAME", requires = "registry_password")]
    registry_username: Option<String>,

    #[arg(long = "registry-password", env = "KEEL_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,

    /// Deadline for each registry round trip
    #[arg(long = "pull-timeout-secs", env = "KEEL_PULL_TIMEOUT_SECS", default_value_t = 300)]
    pull_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct BundleArgs {
    /// Directory holding manifests/ and metadata/
    bundle_dir: PathBuf,

    /// Defaults to the suggested namespace, else <package>-system
    #[arg(long = "install-namespace", default_value = "")]
    install_namespace: String,

    /// Namespaces to watch; repeat for several. Empty means the bundle's default
    #[arg(long = "watch-namespace")]
    watch_namespaces: Vec<String>,

    /// Provision webhook certificates with cert-manager
    #[arg(long = "cert-manager", action = ArgAction::SetTrue)]
    cert_manager: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Unpack a catalog image once into the cache
    Unpack {
        #[command(flatten)]
        cache: CacheArgs,
        #[arg(long = "catalog")]
        catalog: String,
        /// Image reference, tag or digest
        #[arg(long = "image")]
        image: String,
    },
    /// Delete everything cached for a catalog
    Cleanup {
        #[command(flatten)]
        cache: CacheArgs,
        #[arg(long = "catalog")]
        catalog: String,
    },
    /// Keep catalogs unpacked and serve their content over HTTP
    Serve {
        #[command(flatten)]
        cache: CacheArgs,
        /// name=image-reference; repeat for several catalogs
        #[arg(long = "catalog", required = true, value_parser = parse_catalog)]
        catalogs: Vec<(String, String)>,
        #[arg(long = "listen-addr", env = "KEEL_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: SocketAddr,
        /// Minimum body size, in bytes, before responses are gzipped
        #[arg(long = "gzip-min-size", env = "KEEL_GZIP_MIN_SIZE", default_value_t = DEFAULT_GZIP_MIN_SIZE)]
        gzip_min_size: usize,
        /// Seconds between re-polls of every catalog
        #[arg(long = "poll-interval-secs", env = "KEEL_POLL_INTERVAL_SECS", default_value_t = 300)]
        poll_interval_secs: u64,
    },
    /// Render a registry+v1 bundle directory into installable objects
    Render {
        #[command(flatten)]
        bundle: BundleArgs,
    },
    /// Print the RBAC an installer needs to apply a rendered bundle
    Rbac {
        #[command(flatten)]
        bundle: BundleArgs,
        /// ClusterExtension whose finalizers the installer may update
        #[arg(long = "extension")]
        extension: Option<String>,
    },
}

fn parse_catalog(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, image)) if !name.is_empty() && !image.is_empty() => Ok((name.to_string(), image.to_string())),
        _ => Err(format!("expected name=image-reference, got {:?}", s)),
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn unpacker(cache: &CacheArgs) -> ImageUnpacker {
    let policy = match (&cache.signature_policy, cache.allow_insecure_policy) {
        (Some(path), _) => PolicySource::File(path.clone()),
        (None, true) => PolicySource::AllowInsecure,
        (None, false) => PolicySource::Unset,
    };
    let mut config = UnpackerConfig::new(&cache.cache_dir, policy);
    config.pull_timeout = Duration::from_secs(cache.pull_timeout_secs);

    let protocol = if cache.plain_http { ClientProtocol::Http } else { ClientProtocol::Https };
    let mut registry = OciRegistry::new(protocol);
    if let (Some(user), Some(pass)) = (&cache.registry_username, &cache.registry_password) {
        registry = registry.with_basic_auth(user, pass);
    }
    ImageUnpacker::new(config, Arc::new(registry))
}

fn print_structured<T: Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Human | Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// YAML streams are one document per item; JSON is a single array.
fn print_documents<T: Serialize>(output: Output, items: &[T]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
        Output::Human | Output::Yaml => {
            for item in items {
                println!("---");
                print!("{}", serde_yaml::to_string(item)?);
            }
        }
    }
    Ok(())
}

fn render_bundle(args: &BundleArgs) -> Result<Vec<Object>> {
    let bundle = keel_bundle::parse_fs(&args.bundle_dir)
        .with_context(|| format!("parsing bundle {}", args.bundle_dir.display()))?;
    let provider: Option<Arc<dyn CertificateProvider>> =
        if args.cert_manager { Some(Arc::new(CertManagerCertificateProvider)) } else { None };
    keel_render::convert(&bundle, &args.install_namespace, &args.watch_namespaces, provider)
        .with_context(|| format!("rendering bundle {}", bundle.csv.name()))
}

async fn unpack_once(unpacker: &ImageUnpacker, store: &CatalogStore, catalog: &Catalog) -> bool {
    match unpacker.unpack(catalog).await {
        Ok(res) => {
            info!(catalog = %catalog.name, reference = %res.resolved_source.image.reference, path = %res.path.display(), "catalog ready");
            if let Err(e) = store.publish(&catalog.name, res.path).await {
                warn!(catalog = %catalog.name, error = %e, "catalog content could not be indexed; will retry");
            }
            true
        }
        Err(e) if e.is_terminal() => {
            error!(catalog = %catalog.name, error = %e, "unpack failed permanently; no longer polling");
            false
        }
        Err(e) => {
            warn!(catalog = %catalog.name, error = %e, "unpack failed; will retry");
            true
        }
    }
}

async fn serve(cache: CacheArgs, catalogs: Vec<(String, String)>, server: ServerConfig, interval: Duration) -> Result<()> {
    let unpacker = unpacker(&cache);
    let store = CatalogStore::new();
    let mut polled: Vec<Catalog> = catalogs.iter().map(|(name, image)| Catalog::image(name, image)).collect();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn({
        let store = store.clone();
        async move {
            keel_server::serve(server, store, async {
                let _ = stop_rx.await;
            })
            .await
        }
    });

    let mut ticker = tokio::time::interval(interval);
    let mut server_handle = server_handle;
    loop {
        tokio::select! {
            _ = ticker.tick(), if !polled.is_empty() => {
                let results = futures::future::join_all(polled.iter().map(|c| unpack_once(&unpacker, &store, c))).await;
                let mut keep = results.into_iter();
                polled.retain(|_| keep.next().unwrap_or(false));
                if polled.is_empty() {
                    warn!("no catalogs left to poll; serving what is already unpacked");
                }
            }
            res = &mut server_handle => {
                return res.context("server task panicked")?.context("catalog server");
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                let _ = stop_tx.send(());
                return server_handle.await.context("server task panicked")?.context("catalog server");
            }
        }
    }
}

fn require_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Unpack { cache, catalog, image } => {
            info!(catalog = %catalog, image = %image, "unpack invoked");
            let res = unpacker(&cache)
                .unpack(&Catalog::image(&catalog, &image))
                .await
                .with_context(|| format!("unpacking catalog {catalog}"))?;
            match cli.output {
                Output::Human => println!("{} • {} • {}", catalog, res.resolved_source.image.reference, res.path.display()),
                out => print_structured(out, &res)?,
            }
        }
        Commands::Cleanup { cache, catalog } => {
            info!(catalog = %catalog, "cleanup invoked");
            unpacker(&cache)
                .cleanup(&Catalog::image(&catalog, ""))
                .await
                .with_context(|| format!("cleaning up catalog {catalog}"))?;
        }
        Commands::Serve { cache, catalogs, listen_addr, gzip_min_size, poll_interval_secs } => {
            if poll_interval_secs == 0 {
                return Err(anyhow!("--poll-interval-secs must be positive"));
            }
            let server = ServerConfig { listen_addr, gzip_min_size };
            serve(cache, catalogs, server, Duration::from_secs(poll_interval_secs)).await?;
        }
        Commands::Render { bundle } => {
            require_dir(&bundle.bundle_dir)?;
            let objs = render_bundle(&bundle)?;
            print_documents(cli.output, &objs)?;
        }
        Commands::Rbac { bundle, extension } => {
            require_dir(&bundle.bundle_dir)?;
            let objs = render_bundle(&bundle)?;

            #[derive(Serialize)]
            #[serde(rename_all = "camelCase")]
            struct InstallerRbac {
                #[serde(skip_serializing_if = "Option::is_none")]
                cluster_role: Option<keel_rbac::ClusterRole>,
                roles: Vec<keel_rbac::Role>,
                #[serde(skip_serializing_if = "Option::is_none")]
                finalizer_rule: Option<keel_rbac::PolicyRule>,
            }
            let rbac = InstallerRbac {
                cluster_role: keel_rbac::generate_resource_manager_cluster_role(&objs),
                roles: keel_rbac::generate_resource_manager_roles(&objs),
                finalizer_rule: extension.as_deref().map(keel_rbac::cluster_extension_finalizer_policy_rule),
            };
            print_structured(cli.output, &rbac)?;
        }
    }

    Ok(())
}
