//! hpc-cluster CLI - Lifecycle management for HPC clusters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hpc_cluster::benchmarks::{check_thresholds, LscpuSummary, MetricDatum, ReferenceResults};
use hpc_cluster::validators::{has_errors, FailureLevel};
use hpc_cluster::{
    Aws, AwsApi, BucketSettings, Cluster, ClusterConfig, NodeType, PollConfig, StackTemplate,
};

/// hpc-cluster CLI - Lifecycle management for HPC clusters.
#[derive(Parser)]
#[command(name = "hpc-cluster")]
#[command(about = "Create, update and delete HPC clusters backed by CloudFormation stacks")]
struct Cli {
    /// AWS region (or set `AWS_REGION` env var). Defaults to the
    /// configuration's `Region`, then us-east-1.
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS access key ID (or set `AWS_ACCESS_KEY_ID` env var).
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    access_key_id: Option<String>,

    /// Override the service endpoint, e.g. a local emulator.
    #[arg(long, env = "HPC_CLUSTER_ENDPOINT")]
    endpoint: Option<String>,

    /// Bucket where templates are staged (or set `HPC_CLUSTER_BUCKET` env var).
    #[arg(long, env = "HPC_CLUSTER_BUCKET")]
    bucket: Option<String>,

    /// Seconds between two stack status checks.
    #[arg(long, env = "HPC_CLUSTER_POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Give up waiting after this many status checks.
    #[arg(long, env = "HPC_CLUSTER_MAX_POLLS")]
    max_polls: Option<u32>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster from a configuration and a stack template.
    Create {
        /// Cluster name.
        #[arg(long)]
        name: String,

        /// Cluster configuration file (YAML).
        #[arg(long)]
        config: PathBuf,

        /// Stack template file (JSON or YAML).
        #[arg(long)]
        template: PathBuf,

        /// Wait until the stack creation settles.
        #[arg(long, default_value = "false")]
        wait: bool,
    },

    /// Update the stack template of a cluster.
    Update {
        /// Cluster name.
        #[arg(long)]
        name: String,

        /// Stack template file (JSON or YAML).
        #[arg(long)]
        template: PathBuf,

        /// Cluster configuration file to validate before updating.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Delete a cluster.
    Delete {
        /// Cluster name.
        #[arg(long)]
        name: String,

        /// Retain log groups after deletion. Defaults to the configuration's
        /// log deletion policy, or true without a configuration.
        #[arg(long)]
        keep_logs: Option<bool>,

        /// Cluster configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Wait until the stack is gone.
        #[arg(long, default_value = "false")]
        wait: bool,
    },

    /// Show the state of a cluster.
    Describe {
        /// Cluster name.
        #[arg(long)]
        name: String,
    },

    /// List alive instances of a cluster.
    Instances {
        /// Cluster name.
        #[arg(long)]
        name: String,

        /// Node type (HeadNode or Compute).
        #[arg(long, default_value = "Compute")]
        node_type: NodeType,
    },

    /// Validate a cluster configuration file.
    Validate {
        /// Cluster configuration file (YAML).
        #[arg(long)]
        config: PathBuf,
    },

    /// Check OSU latency metrics against reference results.
    CheckOsu {
        /// Reference results (`;`-delimited CSV).
        #[arg(long)]
        reference: PathBuf,

        /// Metrics in CloudWatch `MetricData` JSON format.
        #[arg(long)]
        metrics: PathBuf,

        /// Number of standard deviations tolerated above the average.
        #[arg(long, default_value = "5")]
        variability_factor: f64,
    },

    /// Check `lscpu` output against the expected hyperthreading layout.
    Lscpu {
        /// File holding the `lscpu` output.
        #[arg(long)]
        input: PathBuf,

        /// Slots (vCPUs) of the instance type.
        #[arg(long)]
        slots: u32,

        /// Threads per core of the instance type.
        #[arg(long, default_value = "2")]
        threads_per_core: u32,

        /// Whether hyperthreading is disabled on the node.
        #[arg(long, default_value = "false")]
        hyperthreading_disabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let poll = PollConfig {
        interval: Duration::from_secs(cli.poll_interval),
        max_polls: cli.max_polls,
    };

    match &cli.command {
        Commands::Create {
            name,
            config,
            template,
            wait,
        } => {
            let config = ClusterConfig::load(config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            print_failures(&config)?;
            let template = load_template(template)?;

            let region = region(&cli, Some(&config));
            let api = build_api(&cli, &region)?;
            let settings = bucket_settings(&cli, &region)?;
            let mut cluster =
                Cluster::for_creation(name, config, api, &settings).with_poll_config(poll);

            let stack_id = cluster.create(&template).await?;
            println!("Cluster {} creation started: {stack_id}", name.bold());

            if *wait {
                let status = cluster.wait_for_stack_creation().await?;
                println!("Stack status: {status}");
            }
        }

        Commands::Update {
            name,
            template,
            config,
        } => {
            let template = load_template(template)?;
            let config = config
                .as_deref()
                .map(|path| {
                    ClusterConfig::load(path)
                        .with_context(|| format!("Failed to load {}", path.display()))
                })
                .transpose()?;
            if let Some(config) = &config {
                print_failures(config)?;
            }

            let region = region(&cli, config.as_ref());
            let mut cluster = load_cluster(&cli, &region, name)
                .await?
                .with_poll_config(poll);
            if let Some(config) = config {
                cluster = cluster.with_config(config);
            }

            cluster.update(&template).await?;
            println!(
                "Cluster {} updated, stack status: {}",
                name.bold(),
                cluster.stack().status()
            );
        }

        Commands::Delete {
            name,
            keep_logs,
            config,
            wait,
        } => {
            let config = config
                .as_deref()
                .map(ClusterConfig::load)
                .transpose()
                .context("Failed to load cluster configuration")?;
            let keep_logs = keep_logs.unwrap_or_else(|| {
                config
                    .as_ref()
                    .map_or(true, ClusterConfig::keep_logs_on_delete)
            });

            let region = region(&cli, config.as_ref());
            let mut cluster = load_cluster(&cli, &region, name)
                .await?
                .with_poll_config(poll);
            info!(cluster = %name, keep_logs, "Deleting cluster");
            cluster.delete(keep_logs).await?;
            println!("Cluster {} deletion started", name.bold());

            if *wait {
                let status = cluster.wait_for_stack_deletion().await?;
                println!("Stack status: {status}");
            }
        }

        Commands::Describe { name } => {
            let mut cluster = load_cluster(&cli, &region(&cli, None), name).await?;
            let description = cluster.describe().await?;

            println!("\nCluster Details:");
            println!("  Name:          {}", description.name);
            println!("  Stack:         {}", description.stack_name);
            println!("  Status:        {}", description.status);
            if let Some(reason) = &description.status_reason {
                println!("  Reason:        {reason}");
            }
            println!("  Settled:       {}", description.settled);
            println!(
                "  Version:       {}",
                description.version.as_deref().unwrap_or("-")
            );
            println!(
                "  Created:       {}",
                description.creation_time.as_deref().unwrap_or("-")
            );
            println!(
                "  Updated:       {}",
                description.last_updated_time.as_deref().unwrap_or("-")
            );
            match &description.head_node {
                Some(head) => println!(
                    "  Head node:     {} ({}, {})",
                    head.instance_id,
                    head.state.name,
                    head.public_ip_address
                        .as_deref()
                        .or(head.private_ip_address.as_deref())
                        .unwrap_or("-")
                ),
                None => println!("  Head node:     -"),
            }
            println!("  Compute nodes: {}", description.compute_node_count);
        }

        Commands::Instances { name, node_type } => {
            let cluster = load_cluster(&cli, &region(&cli, None), name).await?;
            let instances = cluster.describe_instances(*node_type).await?;

            println!(
                "\n{:<20} {:<14} {:<10} {:<16}",
                "ID", "TYPE", "STATE", "PRIVATE IP"
            );
            println!("{}", "-".repeat(64));
            for instance in instances {
                println!(
                    "{:<20} {:<14} {:<10} {:<16}",
                    instance.instance_id,
                    instance.instance_type,
                    instance.state.name,
                    instance.private_ip_address.unwrap_or_default()
                );
            }
        }

        Commands::Validate { config } => {
            let config = ClusterConfig::load(config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            print_failures(&config)?;
            println!("{} Configuration is valid", "✓".green());
        }

        Commands::CheckOsu {
            reference,
            metrics,
            variability_factor,
        } => {
            let reference = ReferenceResults::from_csv(&read(reference)?)?;
            let metrics: Vec<MetricDatum> =
                serde_json::from_str(&read(metrics)?).context("Failed to parse metrics")?;

            let failures = check_thresholds(&reference, &metrics, *variability_factor);
            if !failures.is_empty() {
                for message in failures.iter().flatten() {
                    println!("{} {message}", "✗".red());
                }
                bail!("{} benchmark(s) exceeded the tolerated latency", failures.len());
            }
            println!("{} All benchmarks within thresholds", "✓".green());
        }

        Commands::Lscpu {
            input,
            slots,
            threads_per_core,
            hyperthreading_disabled,
        } => {
            let summary = LscpuSummary::parse(&read(input)?)?;
            let mismatches = summary.mismatches(*slots, *threads_per_core, *hyperthreading_disabled);
            if !mismatches.is_empty() {
                for mismatch in &mismatches {
                    println!("{} {mismatch}", "✗".red());
                }
                bail!("lscpu output does not match the expected layout");
            }
            println!(
                "{} {} thread(s) per core, {} on-line CPU(s)",
                "✓".green(),
                summary.threads_per_core,
                summary.online_cpus
            );
        }
    }

    Ok(())
}

/// Region from `--region`, then the configuration, then the default.
fn region(cli: &Cli, config: Option<&ClusterConfig>) -> String {
    ClusterConfig::resolve_region(cli.region.as_deref(), config)
}

fn build_api(cli: &Cli, region: &str) -> Result<AwsApi> {
    let mut client = Aws::new(region).context("Failed to create AWS client")?;
    if let Some(key) = &cli.access_key_id {
        client = client.with_access_key(key);
    }
    if let Some(endpoint) = &cli.endpoint {
        client = client.with_endpoint(endpoint);
    }
    Ok(AwsApi::from_client(client))
}

fn bucket_settings(cli: &Cli, region: &str) -> Result<BucketSettings> {
    let name = cli
        .bucket
        .clone()
        .context("A staging bucket is required (--bucket or HPC_CLUSTER_BUCKET)")?;
    Ok(BucketSettings {
        name,
        region: region.to_string(),
    })
}

async fn load_cluster(cli: &Cli, region: &str, name: &str) -> Result<Cluster> {
    let api = build_api(cli, region)?;
    let settings = bucket_settings(cli, region)?;
    Cluster::load(name, api, &settings)
        .await
        .with_context(|| format!("Failed to load cluster {name}"))
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_template(path: &Path) -> Result<StackTemplate> {
    StackTemplate::parse(&read(path)?)
        .with_context(|| format!("Failed to parse template {}", path.display()))
}

/// Print validation failures; fail on any error.
fn print_failures(config: &ClusterConfig) -> Result<()> {
    let failures = config.validate();
    for failure in &failures {
        let level = match failure.level {
            FailureLevel::Error => failure.level.to_string().red(),
            FailureLevel::Warning => failure.level.to_string().yellow(),
            FailureLevel::Info => failure.level.to_string().normal(),
        };
        println!("{level} [{}] {}", failure.validator, failure.message);
    }
    if has_errors(&failures) {
        bail!("Configuration has validation errors");
    }
    Ok(())
}
