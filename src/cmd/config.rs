//! Configuration check command: `pr-preview check-config`.

use anyhow::Result;

use pr_preview::config::AppConfig;

pub fn cmd_check_config(config: &AppConfig) -> Result<()> {
    println!("Configuration OK\n");
    println!("{}", config.redacted_summary());

    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
