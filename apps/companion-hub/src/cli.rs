use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::handlers::CommandResponse;
use crate::protocol::ObserverEvent;
use crate::target::TargetInfo;

const DEFAULT_HTTP_URL: &str = "http://localhost:9220";
const DEFAULT_WS_URL: &str = "ws://localhost:9220";

#[derive(Parser, Debug)]
#[command(name = "companion-hub")]
#[command(about = "Companion device hub and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known run targets
    Targets {
        /// Hub URL
        #[arg(short, long, default_value = DEFAULT_HTTP_URL)]
        url: String,
    },

    /// Ask a run target to launch a built app
    Run {
        /// Hub URL
        #[arg(short, long, default_value = DEFAULT_HTTP_URL)]
        url: String,

        /// Target identity
        identity: String,

        /// Path of the app to launch
        app_path: String,
    },

    /// Ask a run target to stop whatever it is running
    Stop {
        /// Hub URL
        #[arg(short, long, default_value = DEFAULT_HTTP_URL)]
        url: String,

        /// Target identity
        identity: String,
    },

    /// Forget a run target
    Remove {
        /// Hub URL
        #[arg(short, long, default_value = DEFAULT_HTTP_URL)]
        url: String,

        /// Target identity
        identity: String,

        /// Keep the persisted record, drop only the in-memory entry
        #[arg(long)]
        memory_only: bool,
    },

    /// Tail status updates from the observer stream
    Watch {
        /// Hub WebSocket URL
        #[arg(short, long, default_value = DEFAULT_WS_URL)]
        url: String,
    },
}

pub async fn run_client(command: Commands) -> Result<()> {
    match command {
        Commands::Targets { url } => list_targets(&url).await,
        Commands::Run {
            url,
            identity,
            app_path,
        } => {
            post_command(
                &format!("{}/targets/{}/run", url, identity),
                Some(serde_json::json!({ "appPath": app_path })),
            )
            .await
        }
        Commands::Stop { url, identity } => {
            post_command(&format!("{}/targets/{}/stop", url, identity), None).await
        }
        Commands::Remove {
            url,
            identity,
            memory_only,
        } => {
            let client = reqwest::Client::new();
            let response = client
                .delete(format!(
                    "{}/targets/{}?memory_only={}",
                    url, identity, memory_only
                ))
                .send()
                .await?;
            report_command_response(response).await
        }
        Commands::Watch { url } => watch(&url).await,
    }
}

async fn list_targets(url: &str) -> Result<()> {
    let targets: Vec<TargetInfo> = reqwest::Client::new()
        .get(format!("{}/targets", url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if targets.is_empty() {
        println!("no run targets known");
        return Ok(());
    }
    println!("{:<40} {:<24} {}", "IDENTITY", "NAME", "STATUS");
    for target in targets {
        println!(
            "{:<40} {:<24} {}",
            target.identity.as_deref().unwrap_or("-"),
            target.display_name,
            target.status
        );
    }
    Ok(())
}

async fn post_command(url: &str, body: Option<serde_json::Value>) -> Result<()> {
    let client = reqwest::Client::new();
    let mut request = client.post(url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    report_command_response(request.send().await?).await
}

async fn report_command_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: CommandResponse = response.json().await?;
    if body.success {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!(
            "{} ({}): {}",
            body.error.unwrap_or_else(|| "error".to_string()),
            status,
            body.message.unwrap_or_default()
        )
    }
}

async fn watch(url: &str) -> Result<()> {
    let ws_url = format!("{}/ws/observer", url);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            return Err(anyhow::anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the companion hub running?"
            ));
        }
    };
    let (_write, mut read) = ws_stream.split();

    println!("watching run target updates (ctrl-c to exit)");
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<ObserverEvent>(&text) {
                Ok(ObserverEvent::TargetUpdated { target, is_new }) => {
                    println!(
                        "{} {:<40} {:<24} {}",
                        if is_new { "new      " } else { "updated  " },
                        target.identity.as_deref().unwrap_or("-"),
                        target.display_name,
                        target.status
                    );
                }
                Ok(ObserverEvent::TargetRemoved { identity }) => {
                    println!("removed   {}", identity);
                }
                Err(_) => println!("{}", text.as_str()),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
