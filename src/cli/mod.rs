use clap::Parser;

/// Aligns pod placement with the CPU architectures supported by the
/// workload's container images.
#[derive(Parser, Debug)]
#[command(name = "noe", version)]
pub struct Cli {
    /// Preferred architecture when placing pods
    #[arg(long, default_value = "amd64")]
    pub preferred_arch: String,

    /// Comma separated list of architectures schedulable in the cluster
    #[arg(long, default_value = "")]
    pub cluster_schedulable_archs: String,

    /// Sole OS supported by the system
    #[arg(long, default_value = "linux")]
    pub system_os: String,

    /// The address the metric endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// The address the mutation webhook binds to
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub webhook_addr: String,

    /// Proxies to substitute in the registry URL in the form of
    /// docker.io=docker-proxy.company.corp,quay.io=quay-proxy.company.corp
    #[arg(long, default_value = "")]
    pub registry_proxies: String,

    /// A set of pod label keys to match against node labels in the form of
    /// key1,key2
    #[arg(long, default_value = "")]
    pub match_node_labels: String,

    /// Path to the kubelet credential provider config file
    #[arg(long, default_value = "")]
    pub credential_provider_config: String,

    /// Directory holding the kubelet credential provider binaries
    #[arg(long, default_value = "")]
    pub credential_provider_bin_dir: String,

    /// Comma separated registry patterns for which anonymous pulls must not
    /// be attempted
    #[arg(long, default_value = "")]
    pub private_registries: String,

    /// Directory walked for containerd hosts.toml files
    #[arg(long, default_value = "/etc/containerd")]
    pub containerd_config_dir: String,

    /// How long registry platform lookups are cached, in seconds
    #[arg(long, default_value_t = 3600)]
    pub registry_cache_seconds: u64,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}

/// Splits a comma separated flag into its non-empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
