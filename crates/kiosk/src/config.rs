use anyhow::Context;
pub(crate) use protocol::config::KioskConfig;
use protocol::config::TransportBackend;
use std::collections::HashSet;
use std::path::Path;

fn validate_kiosk_config(config: &KioskConfig) -> anyhow::Result<()> {
    if config.robot_code.trim().is_empty() {
        anyhow::bail!("robot_code must not be empty");
    }
    if config.triggers.is_empty() {
        anyhow::bail!("config must include at least one trigger");
    }
    let mut names = HashSet::new();
    for (index, trigger) in config.triggers.iter().enumerate() {
        let name = trigger.name.trim();
        if name.is_empty() {
            anyhow::bail!("trigger[{}] must set a name", index);
        }
        if !names.insert(name) {
            anyhow::bail!("trigger {} is defined more than once", name);
        }
        if trigger.steps.is_empty() {
            anyhow::bail!("trigger {} must have at least one step", name);
        }
        for (step_index, step) in trigger.steps.iter().enumerate() {
            if step.send.trim().is_empty() {
                anyhow::bail!("trigger {} step {} must set send", name, step_index + 1);
            }
            if !step.duration_secs.is_finite() || step.duration_secs <= 0.0 {
                anyhow::bail!(
                    "trigger {} step {} duration must be a positive number of seconds",
                    name,
                    step_index + 1
                );
            }
        }
    }
    if config.executor.max_attempts == 0 {
        anyhow::bail!("executor.max_attempts must be at least 1");
    }
    let intake = &config.intake;
    if intake.switch_threshold_kg <= 0.0 || intake.collection_threshold_kg <= 0.0 {
        anyhow::bail!("intake thresholds must be positive");
    }
    if intake.daily_cap_kg < 0.0 {
        anyhow::bail!("intake.daily_cap_kg must not be negative");
    }
    if intake.kg_per_point <= 0.0 {
        anyhow::bail!("intake.kg_per_point must be positive");
    }
    if config.transport.backend == TransportBackend::Remote {
        let url = config.transport.proxy_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("transport.proxy_url must be an http(s) url");
        }
    }
    Ok(())
}

pub(crate) fn load_kiosk_config(path: &Path) -> anyhow::Result<KioskConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: KioskConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    validate_kiosk_config(&config)?;
    Ok(config)
}
