//! Diagnostics command - verifies the daemon's external dependencies

use anyhow::Result;

use anvil_ci::config::Configuration;
use anvil_ci::database::Database;
use anvil_ci::runtime::docker::DockerRuntime;

/// Run environment diagnostics and print a summary
pub async fn run(config_path: &str) -> Result<()> {
    println!("Anvil CI diagnostics");
    println!("====================");

    // Configuration
    let config = match Configuration::load(config_path) {
        Ok(config) => {
            println!("[ok] configuration: {}", config_path);
            config
        }
        Err(e) => {
            println!("[!!] configuration: {}", e);
            return Ok(());
        }
    };

    // Container engine
    match DockerRuntime::new(&config.docker) {
        Ok(runtime) => match runtime.ping().await {
            Ok(()) => println!("[ok] container engine: {}", config.docker.socket_path),
            Err(e) => println!("[!!] container engine unreachable: {}", e),
        },
        Err(e) => println!("[!!] container engine client: {}", e),
    }

    // Database
    match Database::open(&config.storage.database_path) {
        Ok(_) => println!(
            "[ok] database: {}",
            config.storage.database_path.display()
        ),
        Err(e) => println!("[!!] database: {}", e),
    }

    // git binary
    match tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            println!("[ok] git: {}", version.trim());
        }
        Ok(_) => println!("[!!] git: exited with failure"),
        Err(e) => println!("[!!] git: {}", e),
    }

    // Storage roots
    for (label, path) in [
        ("repos root", &config.repos.root),
        ("artifacts root", &config.storage.artifacts_root),
    ] {
        let probe = path.join(".diagnostics");
        match std::fs::write(&probe, b"probe") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                println!("[ok] {}: {}", label, path.display());
            }
            Err(e) => println!("[!!] {} not writable: {}", label, e),
        }
    }

    // Vault passphrase
    if std::env::var(&config.vault.passphrase_env).is_ok() {
        println!("[ok] vault passphrase: {} set", config.vault.passphrase_env);
    } else {
        println!(
            "[!!] vault passphrase: {} not set",
            config.vault.passphrase_env
        );
    }

    Ok(())
}
