mod cli {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use clap::{Parser, Subcommand};
    use tracing::{info, warn};
    use vaultlink_client::{
        bootstrap_request, read_creds, render_payload, ClientConfig, CredsFileSource, VaultClient,
    };

    #[derive(Parser, Debug)]
    #[command(name = "vaultlink", version, about = "Talk to a vault over Vaultlink")]
    struct Args {
        /// Server URL (repeatable, or comma-separated in VAULTLINK_SERVERS)
        #[arg(
            long = "server",
            env = "VAULTLINK_SERVERS",
            value_delimiter = ',',
            required = true
        )]
        servers: Vec<String>,
        /// Subject scope owned by this client
        #[arg(long, env = "VAULTLINK_SCOPE")]
        scope: String,
        /// Path to a .creds file; re-read whenever the credential needs replacing
        #[arg(long, env = "VAULTLINK_CREDS")]
        creds: Option<PathBuf>,
        #[arg(long, env = "VAULTLINK_NAME", default_value = "vaultlink-cli")]
        name: String,
        /// Request and connect timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        /// Debug logging and server acknowledgements
        #[arg(long, default_value_t = false)]
        verbose: bool,
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand, Debug)]
    enum Command {
        /// Send one request and print the result
        Request {
            operation: String,
            /// JSON payload
            #[arg(default_value = "{}")]
            payload: String,
            /// Encrypt the request under a session from a fresh bootstrap
            #[arg(long, default_value_t = false)]
            secure: bool,
        },
        /// Print messages until interrupted
        Listen {
            /// Pattern to subscribe to; defaults to everything addressed to this app
            pattern: Option<String>,
        },
        /// Register this device and print the issued credential metadata
        Bootstrap {
            #[arg(long, default_value = "cli")]
            device_type: String,
            #[arg(long)]
            device_id: Option<String>,
        },
    }

    pub async fn run() -> Result<()> {
        let args = Args::parse();
        if args.verbose {
            vaultlink_common::init_tracing_with_default("debug");
        } else {
            vaultlink_common::init_tracing();
        }

        let first = args
            .servers
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("at least one --server is required"))?;
        let mut config = ClientConfig::new(first, args.scope.clone());
        config.servers = args.servers.clone();
        config.name = Some(args.name.clone());
        config.verbose = args.verbose;
        config.handshake_timeout = Duration::from_millis(args.timeout_ms);

        let mut builder = VaultClient::builder(config.clone());
        if let Some(path) = &args.creds {
            builder = builder
                .credential(read_creds(path)?)
                .credential_source(Arc::new(CredsFileSource::new(path)));
        }
        let client = builder.build()?;
        client.start()?;
        client
            .wait_ready(config.handshake_timeout)
            .await
            .context("connecting to vault")?;

        let timeout = Duration::from_millis(args.timeout_ms);
        let outcome = match args.command {
            Command::Request {
                operation,
                payload,
                secure,
            } => request(&client, &operation, &payload, secure, timeout).await,
            Command::Listen { pattern } => listen(&client, pattern).await,
            Command::Bootstrap {
                device_type,
                device_id,
            } => {
                let request =
                    bootstrap_request(device_id, &device_type, env!("CARGO_PKG_VERSION"));
                let response = client.bootstrap(request, timeout).await?;
                println!("credential_id: {}", response.credential_id);
                println!("expires_at:    {}", response.expires_at);
                println!("topics:        {}", response.topics.join(", "));
                if let Some(session) = &response.session_info {
                    println!("session_id:    {}", session.session_id);
                }
                Ok(())
            }
        };

        client.close().await;
        outcome
    }

    async fn request(
        client: &VaultClient,
        operation: &str,
        payload: &str,
        secure: bool,
        timeout: Duration,
    ) -> Result<()> {
        let payload: serde_json::Value =
            serde_json::from_str(payload).context("payload must be JSON")?;

        let result = if secure {
            let request = bootstrap_request(None, "cli", env!("CARGO_PKG_VERSION"));
            client.bootstrap(request, timeout).await?;
            client
                .secure_request::<_, serde_json::Value>(operation, &payload, timeout)
                .await?
        } else {
            client.request(operation, payload, timeout).await?.result
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }

    async fn listen(client: &VaultClient, pattern: Option<String>) -> Result<()> {
        let pattern = pattern.unwrap_or_else(|| format!("{}.forApp.>", client.subjects().scope()));
        let mut subscription = client.subscribe(&pattern)?;
        info!("listening on {}", pattern);

        loop {
            tokio::select! {
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => {
                        println!("[{}] {}", delivery.subject, render_payload(&delivery.payload));
                    }
                    None => {
                        warn!("subscription ended");
                        return Ok(());
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
