//! CLI command definitions and handlers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use silo_common::{ByteSize, Fingerprint, InstanceName};
use silo_storage::migration::FramedChannel;
use silo_storage::{StoragePool, ToolRunner};

use crate::args::InstanceArgs;
use crate::catalog::FileCatalog;
use crate::config::DaemonConfig;
use crate::instance::Orchestrator;
use crate::runtime::NullRuntime;

/// Silo - storage lifecycle manager for system containers
#[derive(Parser)]
#[command(name = "silo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Var directory holding pools, catalog and images
    #[arg(long, global = true, env = "SILO_ROOT")]
    pub root: Option<PathBuf>,

    /// Configuration file (default: searched in the standard locations)
    #[arg(long, global = true, env = "SILO_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format of listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Tab-separated columns
    Table,
    /// Pretty-printed JSON
    Json,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the var directory layout
    Init,

    /// Manage storage pools
    Pool {
        /// Pool subcommand
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Create a container, empty or from an image
    Create {
        /// Container name
        name: InstanceName,

        /// Image fingerprint (or unique prefix)
        #[arg(short, long)]
        image: Option<Fingerprint>,

        /// Pool for the root disk
        #[arg(short, long)]
        pool: Option<String>,

        /// Root disk quota (e.g. 10GiB)
        #[arg(short, long)]
        size: Option<ByteSize>,

        /// Configuration key=value
        #[arg(short, long = "config", value_parser = parse_key_val)]
        config: Vec<(String, String)>,

        /// Profiles to apply
        #[arg(long = "profile")]
        profiles: Vec<String>,

        /// Remove the container when it stops
        #[arg(long)]
        ephemeral: bool,
    },

    /// Copy a container or snapshot
    Copy {
        /// Source container or snapshot (container/snapshot)
        source: InstanceName,

        /// New container name
        target: InstanceName,

        /// Leave the source's snapshots behind
        #[arg(long)]
        instance_only: bool,

        /// Pool for the copy (default: the source's pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Snapshot a container
    Snapshot {
        /// Container name
        name: InstanceName,

        /// Snapshot name
        snapshot: String,

        /// Checkpoint the running container into the snapshot
        #[arg(long)]
        stateful: bool,
    },

    /// Delete a container with its snapshots, or a single snapshot
    Delete {
        /// Container or snapshot (container/snapshot)
        name: InstanceName,
    },

    /// Rename a container or a snapshot
    Rename {
        /// Current name
        old: InstanceName,

        /// New name
        new: InstanceName,
    },

    /// Roll a container back to a snapshot
    Restore {
        /// Container name
        name: InstanceName,

        /// Snapshot name
        snapshot: String,
    },

    /// List containers and snapshots
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },

    /// Show the bytes used by a container or snapshot
    Usage {
        /// Container or snapshot
        name: InstanceName,
    },

    /// Manage custom storage volumes
    Volume {
        /// Volume subcommand
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Manage image volumes
    Image {
        /// Image subcommand
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Move containers between hosts
    Migrate {
        /// Migration subcommand
        #[command(subcommand)]
        command: MigrateCommands,
    },
}

/// Storage pool commands.
#[derive(Subcommand)]
pub enum PoolCommands {
    /// Create a pool
    Create {
        /// Pool name
        name: String,

        /// Storage technology (zfs, dir)
        #[arg(short, long, default_value = "zfs")]
        driver: String,

        /// Configuration key=value
        #[arg(short, long = "config", value_parser = parse_key_val)]
        config: Vec<(String, String)>,
    },

    /// Delete an unused pool
    Delete {
        /// Pool name
        name: String,
    },

    /// List pools
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },

    /// Change a pool configuration key
    Set {
        /// Pool name
        name: String,
        /// Key
        key: String,
        /// Value
        value: String,
    },
}

/// Custom volume commands. Every command takes the pool as `--pool`,
/// defaulting to the default pool.
#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Create an empty custom volume
    Create {
        /// Volume name
        name: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,

        /// Quota (e.g. 10GiB)
        #[arg(short, long)]
        size: Option<ByteSize>,
    },

    /// Copy a custom volume without its snapshots
    Copy {
        /// Source volume
        source: String,

        /// New volume name
        target: String,

        /// Pool of the source (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,

        /// Pool for the copy (default: the source's pool)
        #[arg(long)]
        target_pool: Option<String>,
    },

    /// Delete a custom volume and its snapshots
    Delete {
        /// Volume name
        name: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Rename a custom volume
    Rename {
        /// Current name
        old: String,

        /// New name
        new: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Snapshot a custom volume
    Snapshot {
        /// Volume name
        name: String,

        /// Snapshot name
        snapshot: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Delete a snapshot of a custom volume
    DeleteSnapshot {
        /// Volume name
        name: String,

        /// Snapshot name
        snapshot: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// List the custom volumes of a pool
    List {
        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// List the snapshots of a custom volume
    Snapshots {
        /// Volume name
        name: String,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },
}

/// Image volume commands.
#[derive(Subcommand)]
pub enum ImageCommands {
    /// Remove an image volume from a pool
    Delete {
        /// Image fingerprint
        fingerprint: Fingerprint,

        /// Pool (default: the default pool)
        #[arg(short, long)]
        pool: Option<String>,
    },
}

/// Migration commands.
#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Stream a container to a receiving peer
    Send {
        /// Container or snapshot
        name: InstanceName,

        /// Address of the receiving peer
        #[arg(short, long)]
        target: String,

        /// Checkpoint the running container and send its state
        #[arg(long)]
        live: bool,
    },

    /// Accept one container from a sending peer
    Receive {
        /// Name of the new container
        name: InstanceName,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8443")]
        listen: String,

        /// Pool for the new container
        #[arg(short, long)]
        pool: Option<String>,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

impl Cli {
    /// Load the configuration, honoring `--config-file` and `--root`.
    fn daemon_config(&self) -> Result<DaemonConfig> {
        let config = match &self.config_file {
            Some(path) => DaemonConfig::load(path),
            None => DaemonConfig::discover(),
        }
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
        Ok(match &self.root {
            Some(root) => config.with_root(root.clone()),
            None => config,
        })
    }

    async fn orchestrator(config: &DaemonConfig) -> Result<Orchestrator> {
        let paths = config.paths();
        paths
            .create_dirs()
            .map_err(|e| eyre!("Failed to create {}: {}", paths.root.display(), e))?;

        let catalog = Arc::new(FileCatalog::new(paths.catalog()));
        let orchestrator = Orchestrator::new(catalog, Arc::new(ToolRunner::new()), paths)
            .with_retry(config.retry_policy())
            .with_default_pool(config.default_pool.clone())
            .with_runtime(Arc::new(NullRuntime::new(config.checkpoint_tool.clone())));
        orchestrator
            .load_pools()
            .await
            .map_err(|e| eyre!("Failed to load storage pools: {}", e))?;
        Ok(orchestrator)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.daemon_config()?;

        if matches!(self.command, Commands::Init) {
            let paths = config.paths();
            paths
                .create_dirs()
                .map_err(|e| eyre!("Failed to create {}: {}", paths.root.display(), e))?;
            println!("Initialized {}", paths.root.display());
            return Ok(());
        }

        let silo = Self::orchestrator(&config).await?;

        match self.command {
            Commands::Init => Ok(()),

            Commands::Pool { command } => pool_command(&silo, command).await,

            Commands::Create {
                name,
                image,
                pool,
                size,
                config: keys,
                profiles,
                ephemeral,
            } => {
                let mut args = InstanceArgs::new(name).with_ephemeral(ephemeral);
                if !profiles.is_empty() {
                    args = args.with_profiles(profiles);
                }
                for (key, value) in keys {
                    args = args.with_config(key, value);
                }
                if pool.is_some() || size.is_some() {
                    let pool = pool.unwrap_or_else(|| config.default_pool.clone());
                    args = args.with_root_disk(&pool, size);
                }

                let record = match image {
                    Some(fingerprint) => silo.create_from_image(args.with_image(fingerprint)).await,
                    None => silo.create_empty(args).await,
                }
                .map_err(|e| eyre!("Failed to create instance: {}", e))?;

                println!("Instance {} created on pool {}", record.name, record.pool);
                Ok(())
            }

            Commands::Copy {
                source,
                target,
                instance_only,
                pool,
            } => {
                let record = silo
                    .copy(&source, target, pool.as_deref(), instance_only)
                    .await
                    .map_err(|e| eyre!("Failed to copy {}: {}", source, e))?;
                println!("Instance {} copied to {}", source, record.name);
                Ok(())
            }

            Commands::Snapshot {
                name,
                snapshot,
                stateful,
            } => {
                let snap = name.snapshot_of(&snapshot)?;
                silo.create_as_snapshot(snap.clone(), stateful)
                    .await
                    .map_err(|e| eyre!("Failed to snapshot {}: {}", name, e))?;
                println!("Snapshot {} created", snap);
                Ok(())
            }

            Commands::Delete { name } => {
                silo.delete(&name)
                    .await
                    .map_err(|e| eyre!("Failed to delete {}: {}", name, e))?;
                println!("{} deleted", name);
                Ok(())
            }

            Commands::Rename { old, new } => {
                silo.rename(&old, &new)
                    .await
                    .map_err(|e| eyre!("Failed to rename {}: {}", old, e))?;
                println!("{} renamed to {}", old, new);
                Ok(())
            }

            Commands::Restore { name, snapshot } => {
                silo.restore(&name, &snapshot)
                    .await
                    .map_err(|e| eyre!("Failed to restore {}: {}", name, e))?;
                println!("{} restored to {}", name, snapshot);
                Ok(())
            }

            Commands::List { format } => {
                let records = silo
                    .list()
                    .await
                    .map_err(|e| eyre!("Failed to list instances: {}", e))?;
                match format {
                    Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                    Format::Table => {
                        println!("NAME\tPOOL\tSTATEFUL\tCREATED");
                        for record in records {
                            println!(
                                "{}\t{}\t{}\t{}",
                                record.name,
                                record.pool,
                                record.stateful,
                                record.created_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                }
                Ok(())
            }

            Commands::Usage { name } => {
                let used = silo
                    .usage(&name)
                    .await
                    .map_err(|e| eyre!("Failed to measure {}: {}", name, e))?;
                println!("{}", ByteSize::bytes(used));
                Ok(())
            }

            Commands::Image {
                command: ImageCommands::Delete { fingerprint, pool },
            } => {
                let pool = pool.unwrap_or_else(|| config.default_pool.clone());
                silo.image_delete(&pool, &fingerprint)
                    .await
                    .map_err(|e| eyre!("Failed to delete image {}: {}", fingerprint, e))?;
                println!("Image {} removed from pool {}", fingerprint, pool);
                Ok(())
            }

            Commands::Volume { command } => {
                volume_command(&silo, &config.default_pool, command).await
            }

            Commands::Migrate { command } => migrate_command(&silo, command).await,
        }
    }
}

async fn pool_command(silo: &Orchestrator, command: PoolCommands) -> Result<()> {
    match command {
        PoolCommands::Create {
            name,
            driver,
            config,
        } => {
            let pool = config
                .into_iter()
                .fold(StoragePool::new(name, driver), |pool, (key, value)| {
                    pool.with_config(key, value)
                });
            let pool = silo
                .pool_create(pool)
                .await
                .map_err(|e| eyre!("Failed to create storage pool: {}", e))?;
            println!("Storage pool {} created ({})", pool.name, pool.driver);
            Ok(())
        }

        PoolCommands::Delete { name } => {
            silo.pool_delete(&name)
                .await
                .map_err(|e| eyre!("Failed to delete storage pool: {}", e))?;
            println!("Storage pool {} deleted", name);
            Ok(())
        }

        PoolCommands::List { format } => {
            let pools = silo.pools();
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&pools)?),
                Format::Table => {
                    println!("NAME\tDRIVER\tSOURCE");
                    for pool in pools {
                        println!(
                            "{}\t{}\t{}",
                            pool.name,
                            pool.driver,
                            pool.get("source").unwrap_or("-")
                        );
                    }
                }
            }
            Ok(())
        }

        PoolCommands::Set { name, key, value } => {
            let changes = BTreeMap::from([(key.clone(), value)]);
            silo.pool_update(&name, &changes)
                .await
                .map_err(|e| eyre!("Failed to update storage pool: {}", e))?;
            println!("Storage pool {} updated ({})", name, key);
            Ok(())
        }
    }
}

async fn volume_command(
    silo: &Orchestrator,
    default_pool: &str,
    command: VolumeCommands,
) -> Result<()> {
    let or_default = |pool: Option<String>| pool.unwrap_or_else(|| default_pool.to_string());
    match command {
        VolumeCommands::Create { name, pool, size } => {
            let vol = silo
                .custom_volume_create(&or_default(pool), &name, size)
                .await
                .map_err(|e| eyre!("Failed to create volume {}: {}", name, e))?;
            println!("Volume {} created on pool {}", vol.name, vol.pool);
            Ok(())
        }

        VolumeCommands::Copy {
            source,
            target,
            pool,
            target_pool,
        } => {
            let vol = silo
                .custom_volume_copy(&or_default(pool), &source, target_pool.as_deref(), &target)
                .await
                .map_err(|e| eyre!("Failed to copy volume {}: {}", source, e))?;
            println!("Volume {} copied to {} on pool {}", source, vol.name, vol.pool);
            Ok(())
        }

        VolumeCommands::Delete { name, pool } => {
            silo.custom_volume_delete(&or_default(pool), &name)
                .await
                .map_err(|e| eyre!("Failed to delete volume {}: {}", name, e))?;
            println!("Volume {} deleted", name);
            Ok(())
        }

        VolumeCommands::Rename { old, new, pool } => {
            silo.custom_volume_rename(&or_default(pool), &old, &new)
                .await
                .map_err(|e| eyre!("Failed to rename volume {}: {}", old, e))?;
            println!("Volume {} renamed to {}", old, new);
            Ok(())
        }

        VolumeCommands::Snapshot {
            name,
            snapshot,
            pool,
        } => {
            silo.custom_volume_snapshot(&or_default(pool), &name, &snapshot)
                .await
                .map_err(|e| eyre!("Failed to snapshot volume {}: {}", name, e))?;
            println!("Snapshot {}/{} created", name, snapshot);
            Ok(())
        }

        VolumeCommands::DeleteSnapshot {
            name,
            snapshot,
            pool,
        } => {
            silo.custom_volume_snapshot_delete(&or_default(pool), &name, &snapshot)
                .await
                .map_err(|e| eyre!("Failed to delete snapshot {}/{}: {}", name, snapshot, e))?;
            println!("Snapshot {}/{} deleted", name, snapshot);
            Ok(())
        }

        VolumeCommands::List { pool } => {
            let pool = or_default(pool);
            let volumes = silo
                .custom_volumes(&pool)
                .await
                .map_err(|e| eyre!("Failed to list volumes of {}: {}", pool, e))?;
            for volume in volumes {
                println!("{}", volume);
            }
            Ok(())
        }

        VolumeCommands::Snapshots { name, pool } => {
            let snapshots = silo
                .custom_volume_snapshots(&or_default(pool), &name)
                .await
                .map_err(|e| eyre!("Failed to list snapshots of {}: {}", name, e))?;
            for snapshot in snapshots {
                println!("{}/{}", name, snapshot);
            }
            Ok(())
        }
    }
}

async fn migrate_command(silo: &Orchestrator, command: MigrateCommands) -> Result<()> {
    match command {
        MigrateCommands::Send { name, target, live } => {
            let stream = tokio::net::TcpStream::connect(&target).await?;
            let mut channel = FramedChannel::new(stream);
            silo.migrate_send(&name, live, &mut channel)
                .await
                .map_err(|e| eyre!("Failed to send {}: {}", name, e))?;
            println!("Instance {} sent to {}", name, target);
            Ok(())
        }

        MigrateCommands::Receive { name, listen, pool } => {
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            tracing::info!(address = %listen, "Waiting for migration peer");
            let (stream, peer) = listener.accept().await?;
            tracing::info!(%peer, "Migration peer connected");

            let mut args = InstanceArgs::new(name.clone());
            if let Some(pool) = pool {
                args = args.with_root_disk(&pool, None);
            }
            let mut channel = FramedChannel::new(stream);
            let record = silo
                .migrate_receive(args, &mut channel)
                .await
                .map_err(|e| eyre!("Failed to receive {}: {}", name, e))?;
            println!("Instance {} received on pool {}", record.name, record.pool);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn key_value_pairs() {
        assert_eq!(
            parse_key_val("zfs.clone_copy=false").unwrap(),
            ("zfs.clone_copy".to_string(), "false".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn create_arguments() {
        let cli = Cli::try_parse_from([
            "silo", "create", "c1", "--pool", "fast", "--size", "2GiB", "-c", "user.note=hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                name, pool, size, config, ..
            } => {
                assert_eq!(name.as_str(), "c1");
                assert_eq!(pool.as_deref(), Some("fast"));
                assert_eq!(size, Some(ByteSize::gibibytes(2)));
                assert_eq!(config, vec![("user.note".to_string(), "hi".to_string())]);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn volume_copy_arguments() {
        let cli = Cli::try_parse_from([
            "silo", "volume", "copy", "data", "backup", "--target-pool", "fast",
        ])
        .unwrap();
        match cli.command {
            Commands::Volume {
                command:
                    VolumeCommands::Copy {
                        source,
                        target,
                        pool,
                        target_pool,
                    },
            } => {
                assert_eq!(source, "data");
                assert_eq!(target, "backup");
                assert_eq!(pool, None);
                assert_eq!(target_pool.as_deref(), Some("fast"));
            }
            _ => panic!("expected volume copy"),
        }
    }
}
