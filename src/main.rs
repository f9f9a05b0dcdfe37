use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::serve::Listener;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use l8e_harbor::{
    adapters::{
        FileRouteStore, HttpClientAdapter, HttpHandler, MemoryRouteStore, SqliteRouteStore,
        StaticTokenAuth,
    },
    config::{RouteStoreKind, load_config, read_config},
    core::middleware::MiddlewareDeps,
    engine::ProxyEngine,
    metrics,
    ports::{auth::Identity, route_store::RouteStore},
    tracing_setup,
    utils::GracefulShutdown,
};

const EXIT_CONFIG_INVALID: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;
const EXIT_DEPENDENCY_FAILURE: i32 = 3;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "harbor.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "harbor.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        #[clap(short, long, default_value = "harbor.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "harbor.yaml")]
        config: String,
    },
}

/// TLS-terminating ingress feeding handshaken connections to axum.
///
/// A failed handshake is logged and the offending connection dropped so
/// one bad client never stalls the accept loop.
struct TlsIngress {
    handshakes: tls_listener::TlsListener<tokio::net::TcpListener, tokio_rustls::TlsAcceptor>,
    bound_addr: SocketAddr,
}

impl TlsIngress {
    fn new(
        acceptor: tokio_rustls::TlsAcceptor,
        tcp: tokio::net::TcpListener,
        bound_addr: SocketAddr,
    ) -> Self {
        Self {
            handshakes: tls_listener::TlsListener::new(acceptor, tcp),
            bound_addr,
        }
    }
}

impl Listener for TlsIngress {
    type Io = tokio_rustls::server::TlsStream<tokio::net::TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.handshakes.next().await {
                Some(Ok(conn)) => return conn,
                Some(Err(error)) => {
                    tracing::debug!(error = %error, "tls handshake failed; dropping connection");
                }
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.bound_addr)
    }
}

#[derive(Clone, Copy, Debug)]
struct TlsConnectInfo(SocketAddr);

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, TlsIngress>> for TlsConnectInfo {
    fn connect_info(stream: axum::serve::IncomingStream<'_, TlsIngress>) -> Self {
        TlsConnectInfo(*stream.remote_addr())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path).await,
        "init" => return init_config_command(&config_path).await,
        _ => {}
    }

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {config_path}: {e:#}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };

    tracing_setup::init_tracing(&config.logging.level, config.logging.json)
        .map_err(|e| eyre!("failed to initialize tracing: {e}"))?;
    metrics::init_metrics();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if rustls::crypto::CryptoProvider::install_default(provider).is_err() {
        tracing::debug!("crypto provider already installed");
    }

    // Route store driver selection.
    let mut flush_task: Option<tokio::task::JoinHandle<()>> = None;
    let store: Arc<dyn RouteStore> = match config.route_store.kind {
        RouteStoreKind::Memory => Arc::new(MemoryRouteStore::new()),
        RouteStoreKind::File => {
            let file_store = match FileRouteStore::open(&config.route_store.path).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open file route store");
                    std::process::exit(EXIT_DEPENDENCY_FAILURE);
                }
            };
            flush_task = Some(file_store.spawn_flush_task(Duration::from_secs(
                config.route_store.flush_interval_secs.max(1),
            )));
            Arc::new(file_store)
        }
        RouteStoreKind::Sqlite => match SqliteRouteStore::open(&config.route_store.path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "failed to open sqlite route store");
                std::process::exit(EXIT_DEPENDENCY_FAILURE);
            }
        },
    };

    let auth = Arc::new(StaticTokenAuth::new(
        config
            .auth_tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Identity {
                        subject: entry.subject.clone(),
                        role: entry.role.clone(),
                    },
                )
            })
            .collect(),
    ));

    let http_client = match HttpClientAdapter::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "failed to create HTTP client");
            std::process::exit(EXIT_DEPENDENCY_FAILURE);
        }
    };

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let engine = Arc::new(ProxyEngine::new(
        http_client,
        MiddlewareDeps { auth },
        config.proxy.clone(),
        graceful_shutdown.cancellation_token(),
    ));

    tokio::spawn(engine.clone().run_config_watcher(store.clone()));

    let signal_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!("signal handler error: {}", e);
        }
    });

    let tls_enabled = config.tls.is_some();
    let handler = Arc::new(HttpHandler::new(engine.clone(), tls_enabled));

    let app = {
        use std::convert::Infallible;

        use axum::{
            Router,
            body::Body,
            extract::{ConnectInfo, Request},
            response::Response,
            routing::any,
        };
        use tower_http::compression::CompressionLayer;

        let make_route = |handler: Arc<HttpHandler>| {
            any(
                move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                    let handler = handler.clone();
                    async move {
                        Ok::<Response<Body>, Infallible>(
                            handler.handle(req, Some(client_addr)).await,
                        )
                    }
                },
            )
        };

        Router::new()
            .route("/{*path}", make_route(handler.clone()))
            .route("/", make_route(handler.clone()))
            .layer(CompressionLayer::new())
    };

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("failed to parse listen address")?;

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind listener");
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };

    tracing::info!(
        addr = %addr,
        tls = tls_enabled,
        store = ?config.route_store.kind,
        "l8e-harbor listening"
    );

    let server_result = if let Some(tls) = &config.tls {
        let tls_config = match build_server_tls(tls) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load TLS material");
                std::process::exit(EXIT_DEPENDENCY_FAILURE);
            }
        };

        let bound_addr = listener.local_addr().context("failed to get local addr")?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));
        let ingress = TlsIngress::new(acceptor, listener, bound_addr);

        tokio::select! {
            result = axum::serve(
                ingress,
                app.into_make_service_with_connect_info::<TlsConnectInfo>(),
            ) => result.context("server error"),
            reason = graceful_shutdown.wait() => {
                tracing::info!(?reason, "shutdown signal received");
                Ok(())
            }
        }
    } else {
        tokio::select! {
            result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            ) => result.context("server error"),
            reason = graceful_shutdown.wait() => {
                tracing::info!(?reason, "shutdown signal received");
                Ok(())
            }
        }
    };

    engine.shutdown_background().await;
    if let Some(task) = flush_task {
        task.abort();
    }
    server_result?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Build the ingress rustls config: TLS 1.2 minimum, optional mutual TLS
/// when a client CA bundle is configured.
fn build_server_tls(tls: &l8e_harbor::config::TlsConfig) -> Result<rustls::ServerConfig> {
    use std::{fs::File, io::BufReader};

    use rustls_pemfile::{certs, pkcs8_private_keys};

    let cert_file =
        &mut BufReader::new(File::open(&tls.cert_path).context("failed to open cert file")?);
    let key_file =
        &mut BufReader::new(File::open(&tls.key_path).context("failed to open key file")?);

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in key file"))?;

    let versions: &[&rustls::SupportedProtocolVersion] =
        &[&rustls::version::TLS12, &rustls::version::TLS13];
    let builder = rustls::ServerConfig::builder_with_protocol_versions(versions);

    let config = match &tls.client_ca_path {
        Some(ca_path) => {
            let ca_file =
                &mut BufReader::new(File::open(ca_path).context("failed to open client CA")?);
            let mut roots = rustls::RootCertStore::empty();
            for cert in certs(ca_file) {
                roots.add(cert?)?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| eyre!("failed to build client verifier: {e}"))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key.into())?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key.into())?,
    };

    Ok(config)
}

/// Validate configuration file and exit.
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("error: configuration file '{config_path}' not found");
        std::process::exit(EXIT_CONFIG_INVALID);
    }

    let config = match read_config(config_path) {
        Ok(config) => {
            println!("configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("configuration parsing failed:\n   {e:#}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };

    match config.validate() {
        Ok(()) => {
            println!("configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   listen address: {}", config.listen_addr);
            println!("   route store:    {:?}", config.route_store.kind);
            println!("   tls enabled:    {}", config.tls.is_some());
            println!("   max in-flight:  {}", config.proxy.max_in_flight);
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration validation failed:\n{e}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    }
}

/// Initialize a new configuration file.
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("error: configuration file '{config_path}' already exists");
        std::process::exit(EXIT_CONFIG_INVALID);
    }

    let default_config = r#"# l8e-harbor configuration

# The address to listen on
listen_addr: "0.0.0.0:8443"

# Route store driver: memory | file | sqlite
route_store:
  kind: file
  path: /var/lib/l8e-harbor/routes.yaml
  flush_interval_secs: 30

logging:
  level: info
  json: true

# Data-plane tunables
proxy:
  session_cookie: l8e-session
  max_in_flight: 8192
  pool_per_authority: 256
  pool_wait_ms: 1000

# Tokens for the built-in static auth adapter
# auth_tokens:
#   - token: change-me
#     subject: admin
#     role: admin

# TLS (optional)
# tls:
#   cert_path: /etc/l8e-harbor/tls.crt
#   key_path: /etc/l8e-harbor/tls.key
#   client_ca_path: /etc/l8e-harbor/client-ca.crt
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("failed to write config file")?;
    println!("created default configuration at: {config_path}");
    println!("   run 'l8e-harbor serve --config {config_path}' to start the gateway");
    Ok(())
}
