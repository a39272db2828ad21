use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use motmot::principal::UserId;
use motmot_server::certs;
use motmot_server::config::ServerConfig;
use motmot_server::store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "motmot federated presence server")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, short, default_value = "motmot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve {
        /// Domain this server is authoritative for (overrides the config file).
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create or replace a user credential.
    AddUser {
        /// Full user name, `name@domain`.
        username: String,
        password: String,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Sign a PEM certificate request with this server's TLS key.
    SignCsr {
        csr: PathBuf,
        /// Where to write the certificate; stdout if omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "motmot_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;

    match args.command {
        Command::Serve {
            domain,
            listen,
            data_dir,
        } => {
            if let Some(domain) = domain {
                config.domain = domain;
            }
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            let config = config.validate()?;

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("shutting down...");
                signal.cancel();
            });

            motmot_server::server::run(config, shutdown).await
        }
        Command::AddUser {
            username,
            password,
            data_dir,
        } => {
            let user: UserId = username
                .parse()
                .with_context(|| format!("invalid user name {username}"))?;
            let data_dir = data_dir.or(config.data_dir);
            let Some(dir) = data_dir else {
                anyhow::bail!("add-user needs a data directory (--data-dir or data_dir in config)");
            };
            let store = Store::open(Some(&dir)).context("failed to open store")?;
            store.add_user(&user.to_string(), &password).await?;
            println!("added {user}");
            Ok(())
        }
        Command::SignCsr { csr, out } => {
            let config = config.validate()?;
            let Some(tls) = config.tls else {
                anyhow::bail!("sign-csr needs a [tls] section in the config");
            };
            certs::ensure_self_signed(&tls.cert_path, &tls.key_path, &config.domain)?;
            let request = std::fs::read_to_string(&csr)
                .with_context(|| format!("failed to read {}", csr.display()))?;
            let issued = certs::sign_csr(&request, &tls.cert_path, &tls.key_path)?;
            match out {
                Some(path) => std::fs::write(&path, issued)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => print!("{issued}"),
            }
            Ok(())
        }
    }
}
