use std::error::Error;
use std::sync::Arc;

use clap::Parser;

use courier::clog;
use courier::config::{Cli, Command, Config, DatabaseLocation};
use courier::identity;
use courier::push::{HttpPushGateway, LogPushGateway, PushGateway};
use courier::server::{self, ServerContext};
use courier::storage::{DeviceState, ProfileRow, Storage};

#[tokio::main]
async fn main() {
    courier::logging::init();
    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(&cli);
    let storage = open_storage(&config)?;

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(config, storage).await,
        Command::Seed {
            user_id,
            device_id,
            name,
            phone,
        } => {
            if config.database == DatabaseLocation::InMemory {
                return Err("seed needs a database file; drop --ephemeral".into());
            }
            storage.upsert_device(&user_id, &device_id, DeviceState::Verified)?;
            if name.is_some() || phone.is_some() {
                storage.upsert_profile(&ProfileRow {
                    user_id: user_id.clone(),
                    name,
                    phone_number: phone,
                })?;
            }
            let token = identity::issue_session(&storage, &user_id, &device_id)?;
            println!("{token}");
            Ok(())
        }
        Command::Revoke { token } => {
            if identity::revoke_session(&storage, &token)? {
                clog!("identity: session revoked");
                Ok(())
            } else {
                Err("no such session".into())
            }
        }
    }
}

fn open_storage(config: &Config) -> Result<Storage, Box<dyn Error>> {
    let storage = match &config.database {
        DatabaseLocation::File(path) => {
            clog!("storage: opening {}", path.display());
            Storage::open(path)?
        }
        DatabaseLocation::InMemory => {
            clog!("storage: in-memory database, nothing will persist");
            Storage::open_in_memory()?
        }
    };
    Ok(storage)
}

async fn serve(config: Config, storage: Storage) -> Result<(), Box<dyn Error>> {
    let push: Arc<dyn PushGateway> = match &config.push_url {
        Some(url) => {
            clog!("push: forwarding to {}", url);
            Arc::new(HttpPushGateway::new(url.clone()))
        }
        None => Arc::new(LogPushGateway),
    };
    let ctx = ServerContext::new(storage, push, config.fanout_policy());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| format!("failed to bind {}: {error}", config.bind_addr))?;

    server::run(listener, ctx, async {
        let _ = tokio::signal::ctrl_c().await;
        clog!("server: shutting down");
    })
    .await?;
    Ok(())
}
