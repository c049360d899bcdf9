use crate::commands::{CommandResult, FailureClass};
use parley_core::config::{AppConfig, LoadOptions};
use parley_db::{connect_from_config, migrations, DemoCorpus};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                FailureClass::ConfigValidation,
                format!("configuration issue: {error}"),
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                FailureClass::RuntimeInit,
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| (FailureClass::DbConnectivity, error.to_string()))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| (FailureClass::Migration, error.to_string()))?;

        let seed_result = DemoCorpus::load(&pool)
            .await
            .map_err(|error| (FailureClass::SeedExecution, error.to_string()))?;

        let verification = DemoCorpus::verify(&pool)
            .await
            .map_err(|error| (FailureClass::SeedVerification, error.to_string()))?;

        let run_result: Result<SeedOutput, (FailureClass, String)> = if !verification.all_present {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
                .collect::<Vec<_>>();
            let message = if failed_checks.is_empty() {
                "Some seed data failed to load".to_string()
            } else {
                format!("Seed verification failed for checks: {}", failed_checks.join(", "))
            };
            Err((FailureClass::SeedVerification, message))
        } else {
            Ok(SeedOutput { records: seed_result.records_seeded })
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(output) => {
            let record_lines: Vec<String> = output
                .records
                .iter()
                .map(|record| format!("  - {}: {}", record.record_id, record.title))
                .collect();
            let message = format!(
                "Demo corpus loaded with {} record(s):\n{}",
                output.records.len(),
                record_lines.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((class, message)) => CommandResult::failure("seed", class, message),
    }
}

struct SeedOutput {
    records: Vec<parley_db::RecordSeedInfo>,
}

#[cfg(test)]
mod tests {
    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = [
            ("record-count".to_string(), true),
            ("rec-backups-tags".to_string(), false),
            ("rec-vpn-body".to_string(), false),
        ];

        let failed_checks = checks
            .iter()
            .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
            .collect::<Vec<_>>();

        let message = if failed_checks.is_empty() {
            "Some seed data failed to load".to_string()
        } else {
            format!("Seed verification failed for checks: {}", failed_checks.join(", "))
        };

        assert_eq!(message, "Seed verification failed for checks: rec-backups-tags, rec-vpn-body");
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = [("record-count".to_string(), true), ("rec-oncall-present".to_string(), true)];

        let failed_checks = checks
            .iter()
            .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
            .collect::<Vec<_>>();
        let message = if failed_checks.is_empty() {
            "Some seed data failed to load".to_string()
        } else {
            format!("Seed verification failed for checks: {}", failed_checks.join(", "))
        };

        assert_eq!(message, "Some seed data failed to load");
    }
}
