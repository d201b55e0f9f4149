// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use chefapi::{
    client::{Client, Config, DataBagItem},
    config::load_config,
    vault::VaultService,
};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "chefapi/client.toml";

/// A command-line client for the Chef server API.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the client's configuration file.
    ///
    /// If no path is provided, the configuration file at $CONFIGURATION_DIRECTORY/chefapi/client.toml
    /// is used, if it exists. If it does not exist, the configuration defaults are used. Note
    /// that the defaults include a server URL and are useful only as an example.
    ///
    /// To view the client configuration, run the `config` subcommand.
    #[arg(long, short, env = "CHEFAPI_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// The directory containing the client's private key.
    ///
    /// A relative `client_key` path in the configuration is resolved against this directory.
    ///
    /// # Example
    ///
    /// ```bash
    /// $ systemd-creds encrypt /secure/ramfs/client.pem \
    ///     "$HOME/.config/credstore.encrypted/chefapi.client_key"
    ///
    /// # Spawn a shell where systemd decrypts the key for you.
    /// $ systemd-run --user -S -p "ImportCredentials=chefapi.*"
    /// $ chefapi-client vault list
    /// ```
    #[arg(long, env = "CREDENTIALS_DIRECTORY", verbatim_doc_comment)]
    credentials_directory: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "CHEFAPI_CLIENT_LOG", default_value = "WARN,chefapi=INFO")]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// See the current configuration, or the defaults if no configuration file is supplied.
    Config,
    /// Send a signed GET request and print the JSON response.
    Get {
        /// The path relative to the configured server URL, for example "nodes".
        path: String,
    },
    /// Manage encrypted vault items.
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(clap::Subcommand, Debug)]
enum VaultCommand {
    /// List the data bags containing vault items.
    List,
    /// List the vault items in a vault.
    Items { vault: String },
    /// Create an empty vault item, readable only by you.
    Create { vault: String, item: String },
    /// Decrypt a vault item and print its values.
    Show { vault: String, item: String },
    /// Replace a vault item's values.
    Update {
        vault: String,
        item: String,
        /// The new values as a JSON object.
        values: String,
    },
    /// Give another client access to a vault item.
    Grant {
        vault: String,
        item: String,
        client: String,
        /// The path to the client's PEM-encoded RSA public key.
        public_key: PathBuf,
        /// Also make the client an administrator of the item.
        #[arg(long)]
        admin: bool,
    },
    /// Remove a client's access to a vault item.
    Revoke {
        vault: String,
        item: String,
        client: String,
    },
    /// Delete a vault item and its keys.
    Delete { vault: String, item: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "CHEFAPI_CLIENT_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .context("failed to install the global log subscriber")?;

    let mut config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    if let Command::Config = opts.command {
        println!(
            "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
        );

        if let Some(path) = opts.credentials_directory.as_ref() {
            if let Err(error) = config.credentials.with_credentials_dir(path) {
                eprintln!(
                    "The configuration format is valid, but the referenced credentials aren't valid: {error:?}"
                );
            }
        }
        return Ok(());
    }

    if let Some(path) = opts.credentials_directory.as_ref() {
        config.credentials.with_credentials_dir(path)?;
    }
    let client = Client::new(config)?;
    match opts.command {
        Command::Get { path } => {
            let response: Value = client.get(client.url(&path)?).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Vault(command) => {
            let identity = client.identity().clone();
            vault(VaultService::new(client, identity), command).await?;
        }
        Command::Config => unreachable!("Command handled prior to this match"),
    }

    Ok(())
}

async fn vault(service: VaultService<Client>, command: VaultCommand) -> anyhow::Result<()> {
    match command {
        VaultCommand::List => {
            println!("{}", service.list().await?.join("\n"));
        }
        VaultCommand::Items { vault } => {
            println!("{}", service.list_items(&vault).await?.join("\n"));
        }
        VaultCommand::Create { vault, item } => {
            service.create_item(&vault, &item).await?;
            println!("Created {vault}/{item}");
        }
        VaultCommand::Show { vault, item } => {
            let item = service.get_item(&vault, &item).await?;
            let values = service.decrypt(&item)?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        VaultCommand::Update {
            vault,
            item,
            values,
        } => {
            let values: DataBagItem =
                serde_json::from_str(&values).context("values must be a JSON object")?;
            let mut item = service.get_item(&vault, &item).await?;
            service.update_item(&mut item, &values).await?;
            println!("Updated {vault}/{}", item.name);
        }
        VaultCommand::Grant {
            vault,
            item,
            client,
            public_key,
            admin,
        } => {
            let public_key = std::fs::read(&public_key)
                .with_context(|| format!("failed to read public key from {public_key:?}"))?;
            let mut item = service.get_item(&vault, &item).await?;
            service.grant(&mut item, &client, &public_key, admin).await?;
            println!("Granted {client} access to {vault}/{}", item.name);
        }
        VaultCommand::Revoke {
            vault,
            item,
            client,
        } => {
            let mut item = service.get_item(&vault, &item).await?;
            service.revoke(&mut item, &client).await?;
            println!("Revoked {client}'s access to {vault}/{}", item.name);
        }
        VaultCommand::Delete { vault, item } => {
            service.delete_item(&vault, &item).await?;
            println!("Deleted {vault}/{item}");
        }
    }

    Ok(())
}
