use crate::commands::{CommandResult, FailureClass};
use parley_core::config::{AppConfig, LoadOptions};
use parley_db::{connect_from_config, migrations};

pub fn run(check_only: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                FailureClass::ConfigValidation,
                format!("configuration issue: {error}"),
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                FailureClass::RuntimeInit,
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| (FailureClass::DbConnectivity, error.to_string()))?;

        let message = if check_only {
            let status = migrations::status(&pool)
                .await
                .map_err(|error| (FailureClass::Migration, error.to_string()))?;
            format!(
                "{} migration(s) pending ({}/{} applied)",
                status.pending(),
                status.applied,
                status.total
            )
        } else {
            migrations::run_pending(&pool)
                .await
                .map_err(|error| (FailureClass::Migration, error.to_string()))?;
            "applied pending migrations".to_string()
        };

        pool.close().await;
        Ok::<String, (FailureClass, String)>(message)
    });

    match result {
        Ok(message) => CommandResult::success("migrate", message),
        Err((class, message)) => CommandResult::failure("migrate", class, message),
    }
}
