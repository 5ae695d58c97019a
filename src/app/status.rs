use crate::config::Config;
use crate::runtime::RuntimeStatus;
use std::fmt::Write;

pub fn render_status(config: &Config, status: Option<&RuntimeStatus>) -> String {
    let mut lines = vec![
        "◆ CIRIS status".to_string(),
        String::new(),
        format!("  Version      {}", env!("CARGO_PKG_VERSION")),
        format!("  Config       {}", config.config_path.display()),
        format!("  Database     {}", config.database_path().display()),
        format!("  Agent        {} ({})", config.agent.name, config.agent.agent_id),
        format!(
            "  Trusted WAs  {}",
            config.wise_authority.trusted_keys.len()
        ),
        String::new(),
    ];

    let Some(status) = status else {
        lines.push("  No runtime status recorded yet (start the agent with `ciris run`).".into());
        return lines.join("\n");
    };

    lines.push(format!("  State        {}", status.state));
    lines.push(format!("  Rounds       {}", status.rounds));
    lines.push(format!(
        "  Audit        {}",
        if status.audit_halted { "HALTED" } else { "ok" }
    ));
    lines.push(format!("  Written at   {}", status.written_at));
    lines.push(String::new());
    lines.push("  State      rounds  thoughts  errors  last ms  actions".into());
    for (state, metrics) in &status.metrics {
        let mut actions = String::new();
        for (action, count) in &metrics.actions {
            let _ = write!(actions, "{action}={count} ");
        }
        lines.push(format!(
            "  {:<10} {:>6}  {:>8}  {:>6}  {:>7}  {}",
            state.to_string(),
            metrics.rounds,
            metrics.thoughts_processed,
            metrics.errors,
            metrics.last_round_ms,
            actions.trim_end()
        ));
    }
    lines.join("\n")
}
