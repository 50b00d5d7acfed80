//! Configuration loading

mod config;

pub use config::{
    BuildConfiguration, Configuration, DockerConfiguration, ProviderConfiguration,
    QueueConfiguration, ReposConfiguration, RetentionConfiguration, StorageConfiguration,
    VaultConfiguration, WorkerConfiguration,
};
