//! Build container provisioning and teardown

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::runtime::path::WORKSPACE_ROOT;
use crate::runtime::{ContainerHandle, ProvisionSpec, RuntimeError, RuntimeResult};

use super::DockerRuntime;

/// Grace period handed to the engine when stopping a build container
const STOP_GRACE_SECS: i64 = 10;

/// Host engine socket target inside Docker-in-Docker builds
const HOST_ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// Create and start a container parked on a no-op process so exec calls
/// have a stable target
pub async fn provision(
    runtime: &DockerRuntime,
    spec: &ProvisionSpec,
) -> RuntimeResult<ContainerHandle> {
    let _slot = runtime.engine_slot().await;

    ensure_image_exists(runtime, &spec.image).await?;

    let env_vars: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    if spec.allow_host_engine {
        mounts.push(Mount {
            target: Some(HOST_ENGINE_SOCKET.to_string()),
            source: Some(HOST_ENGINE_SOCKET.to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        });
    }

    let mut labels = HashMap::new();
    labels.insert("Service".to_string(), "anvil-ci".to_string());
    labels.insert("ContainerType".to_string(), "build".to_string());

    let host_config = HostConfig {
        mounts: Some(mounts),
        // Builds never restart on their own
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container_config = Config {
        image: Some(spec.image.clone()),
        // Park the container on a no-op so it stays up between exec calls
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        env: Some(env_vars),
        labels: Some(labels),
        working_dir: Some(WORKSPACE_ROOT.to_string()),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.as_str(),
        platform: None,
    };

    let created = runtime
        .docker()
        .create_container(Some(options), container_config)
        .await
        .map_err(|e| RuntimeError::ProvisionFailed(e.to_string()))?;

    runtime
        .docker()
        .start_container::<String>(&spec.name, None)
        .await
        .map_err(|e| {
            error!("Failed to start container {}: {}", spec.name, e);
            RuntimeError::ProvisionFailed(e.to_string())
        })?;

    info!("Provisioned build container {}", spec.name);

    Ok(ContainerHandle {
        id: created.id,
        name: spec.name.clone(),
    })
}

/// Stop the container with the standard grace period. Missing containers
/// are success.
pub async fn stop(runtime: &DockerRuntime, handle: &ContainerHandle) -> RuntimeResult<()> {
    let _slot = runtime.engine_slot().await;

    let options = StopContainerOptions { t: STOP_GRACE_SECS };
    match runtime.docker().stop_container(&handle.name, Some(options)).await {
        Ok(_) => {
            debug!("Stopped container {}", handle.name);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()), // already stopped
        Err(e) => Err(RuntimeError::Docker(e)),
    }
}

/// Force-remove the container. Missing containers are success.
pub async fn remove(runtime: &DockerRuntime, handle: &ContainerHandle) -> RuntimeResult<()> {
    let _slot = runtime.engine_slot().await;

    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };

    match runtime
        .docker()
        .remove_container(&handle.name, Some(options))
        .await
    {
        Ok(_) => {
            debug!("Removed container {}", handle.name);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(RuntimeError::Docker(e)),
    }
}

/// Ensure the image exists locally, pulling if necessary
async fn ensure_image_exists(runtime: &DockerRuntime, image: &str) -> RuntimeResult<()> {
    match runtime.docker().inspect_image(image).await {
        Ok(_) => {
            debug!("Image {} already exists", image);
            return Ok(());
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            info!("Image {} not found, pulling...", image);
        }
        Err(e) => {
            warn!("Error inspecting image {}: {}", image, e);
            // Try to pull anyway
        }
    }

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = runtime.docker().create_image(Some(options), None, None);

    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(status) = info.status {
                    debug!("Pull {}: {}", image, status);
                }
            }
            Err(e) => {
                error!("Failed to pull image {}: {}", image, e);
                return Err(RuntimeError::ImagePull(e.to_string()));
            }
        }
    }

    info!("Successfully pulled image {}", image);
    Ok(())
}
