//! CLI for the deployment controller API

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use deployctl::controller::ApiResponse;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "deployctl deployment controller CLI")]
#[command(version)]
struct Cli {
    /// Controller URL
    #[arg(long, default_value = "http://localhost:8080", env = "DEPLOYCTL_SERVER")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a batch of deployment changes (JSON array)
    Push {
        /// Read the batch from a file
        #[arg(long, conflicts_with = "json")]
        file: Option<PathBuf>,

        /// Inline JSON batch
        json: Option<String>,
    },

    /// Latest version of every app
    List,

    /// Show one deployment record
    Get {
        /// Deployment ID
        id: String,
    },

    /// Every version of one app
    History { domain: String, app_name: String },

    /// Set the status of a deployment
    Status {
        /// Deployment ID
        id: String,

        /// pending, deploying, deployed, failed or rolled_back
        status: String,
    },

    /// Aggregate counts over the latest versions
    Stats,

    /// Registry credentials
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Check server health
    Health,
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Store or replace a credential
    Set {
        registry: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },

    /// Show a credential
    Get { registry: String },
}

struct ApiClient {
    http: Client,
    base: String,
}

impl ApiClient {
    fn new(base: &str) -> Self {
        Self {
            http: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, ApiResponse)> {
        self.call_with_query(method, path, &[], body).await
    }

    async fn call_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, ApiResponse)> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.request(method, &url).query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = resp.status();
        let envelope: ApiResponse = resp
            .json()
            .await
            .with_context(|| format!("unexpected response from {} ({})", url, status))?;
        Ok((status, envelope))
    }
}

fn print_response(status: StatusCode, resp: &ApiResponse) -> anyhow::Result<()> {
    if let Some(message) = &resp.message {
        println!("{} ({})", message, status.as_u16());
    }
    if let Some(data) = &resp.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    if let Some(error) = &resp.error {
        bail!("{} ({})", error, status.as_u16());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server);

    let (status, resp) = match cli.command {
        Commands::Push { file, json } => {
            let raw = match (file, json) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(inline)) => inline,
                (None, None) => bail!("either --file or an inline JSON batch is required"),
            };
            let batch: Value = serde_json::from_str(&raw).context("batch is not valid JSON")?;
            if !batch.is_array() {
                bail!("batch must be a JSON array of deployments");
            }
            client.call(Method::POST, "/api/v1/push", Some(batch)).await?
        }

        Commands::List => client.call(Method::GET, "/api/v1/deployments", None).await?,

        Commands::Get { id } => {
            client
                .call(Method::GET, &format!("/api/v1/deployments/{}", id), None)
                .await?
        }

        Commands::History { domain, app_name } => {
            client
                .call(
                    Method::GET,
                    &format!("/api/v1/apps/{}/{}/versions", domain, app_name),
                    None,
                )
                .await?
        }

        Commands::Status { id, status } => {
            client
                .call(
                    Method::PATCH,
                    &format!("/api/v1/deployments/{}/status", id),
                    Some(json!({ "status": status })),
                )
                .await?
        }

        Commands::Stats => client.call(Method::GET, "/api/v1/stats", None).await?,

        Commands::Registry { command } => match command {
            RegistryCommands::Set {
                registry,
                username,
                password,
            } => {
                client
                    .call(
                        Method::POST,
                        "/api/v1/registry",
                        Some(json!({
                            "registry": registry,
                            "username": username,
                            "password": password,
                        })),
                    )
                    .await?
            }
            RegistryCommands::Get { registry } => {
                client
                    .call_with_query(
                        Method::GET,
                        "/api/v1/registry",
                        &[("registry", registry.as_str())],
                        None,
                    )
                    .await?
            }
        },

        Commands::Health => client.call(Method::GET, "/healthz", None).await?,
    };

    print_response(status, &resp)
}
