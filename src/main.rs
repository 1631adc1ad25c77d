use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use proctor_mesh::config::Config;
use proctor_mesh::session::devices::GrantedDevices;
use proctor_mesh::session::room::Role;
use proctor_mesh::signaling::messages::DisconnectReason;
use proctor_mesh::signaling::relay;
use proctor_mesh::{Result, SessionClient, SessionIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliRole {
    Host,
    Attendee,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Host => Role::Host,
            CliRole::Attendee => Role::Attendee,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "proctor-mesh", about = "Peer-mesh client for monitored exam sessions")]
struct Args {
    /// Room to join
    #[arg(long)]
    room: String,

    /// Display name shown to other participants
    #[arg(long)]
    name: String,

    /// Join as the exam host or as an attendee
    #[arg(long, value_enum, default_value_t = CliRole::Attendee)]
    role: CliRole,

    /// Participant id; generated when omitted
    #[arg(long)]
    id: Option<String>,

    /// Override the relay URL from the environment
    #[arg(long)]
    relay_url: Option<String>,
}

fn generate_participant_id(role: Role) -> String {
    let prefix = match role {
        Role::Host => "host",
        Role::Attendee => "att",
    };
    let suffix: u32 = rand::thread_rng().gen_range(0..0xffffff);
    format!("{prefix}_{suffix:06x}")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(url) = args.relay_url {
        config.relay.url = url;
    }

    let role: Role = args.role.into();
    let identity = SessionIdentity {
        participant_id: args
            .id
            .unwrap_or_else(|| generate_participant_id(role)),
        display_name: args.name,
        role,
    };

    let (handle, events) = relay::connect(&config.relay.url).await?;
    let client = SessionClient::join(
        &config,
        identity,
        args.room,
        handle,
        Arc::new(GrantedDevices),
    )
    .await?;

    tokio::select! {
        _ = client.run(events) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, leaving session");
            match client.identity().role {
                Role::Host => client.end_session().await?,
                Role::Attendee => client.leave(DisconnectReason::NetworkLost).await,
            }
        }
    }

    Ok(())
}
