#![allow(dead_code)]

pub mod mock_cluster;

use phloem_cluster::ClusterConfig;

/// Client settings pointing at the first node of `cluster`
pub fn config_for(cluster: &mock_cluster::MockCluster) -> ClusterConfig {
    let mut config = ClusterConfig::with_seeds(&cluster.seed()).expect("valid seed");
    config.command_timeout = Some(std::time::Duration::from_secs(5));
    config
}

/// Install a test subscriber once so `RUST_LOG=debug` shows client logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
