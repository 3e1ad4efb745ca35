use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use crate::config::BridgeConfig;

#[derive(Parser, Debug)]
#[command(
    name = "drover",
    about = "Interactive process bridge for supervised agent runs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Bind address override
        #[arg(long)]
        host: Option<String>,

        /// Port override
        #[arg(long)]
        port: Option<u16>,
    },

    /// Launch a single run in the foreground, answering prompts on this terminal
    Run {
        /// Job payload as inline JSON
        #[arg(long)]
        job: Option<String>,

        /// Path to a JSON file holding the job payload
        #[arg(long, conflicts_with = "job")]
        job_file: Option<PathBuf>,

        /// Run identifier (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Terminate child processes left behind by a crashed server
    Recover,

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable listing
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

/// Render the effective configuration as an aligned key/value listing.
pub fn render_config_human(config: &BridgeConfig, source: Option<&Path>) -> String {
    let mut out = String::new();
    match source {
        Some(path) => out.push_str(&format!("Configuration loaded from {}\n", path.display())),
        None => out.push_str("Configuration: built-in defaults (no .drover/config.toml found)\n"),
    }

    out.push_str("\n[server]\n");
    push_kv(&mut out, "host", &config.server.host);
    push_kv(&mut out, "port", config.server.port);

    out.push_str("\n[scheduler]\n");
    push_kv(&mut out, "max_concurrent", config.scheduler.max_concurrent);
    push_kv(
        &mut out,
        "wait_minutes_per_position",
        config.scheduler.wait_minutes_per_position,
    );
    push_kv(&mut out, "cancel_grace_secs", config.scheduler.cancel_grace_secs);

    out.push_str("\n[session]\n");
    push_kv(&mut out, "program", &config.session.program);
    push_kv(&mut out, "script", &config.session.script);
    push_kv(&mut out, "args", join(&config.session.args));
    push_kv(
        &mut out,
        "working_dir",
        display_path(config.session.working_dir.as_deref()),
    );
    push_kv(&mut out, "poll_interval_ms", config.session.poll_interval_ms);
    push_kv(&mut out, "env_passthrough", join(&config.session.env_passthrough));
    push_kv(&mut out, "failure_sentinels", join(&config.session.failure_sentinels));

    out.push_str("\n[classifier]\n");
    push_kv(&mut out, "idle_threshold_ms", config.classifier.idle_threshold_ms);
    push_kv(
        &mut out,
        "multiline_idle_threshold_ms",
        config.classifier.multiline_idle_threshold_ms,
    );
    push_kv(&mut out, "max_prompt_len", config.classifier.max_prompt_len);
    push_kv(&mut out, "history", config.classifier.history);
    push_kv(&mut out, "prompt_patterns", config.classifier.prompt_patterns.len());
    push_kv(&mut out, "restart_pattern", &config.classifier.restart_pattern);
    push_kv(&mut out, "multiline_markers", join(&config.classifier.multiline_markers));
    push_kv(&mut out, "multiline_prompt", &config.classifier.multiline_prompt);
    push_kv(&mut out, "banner_markers", config.classifier.banner_markers.len());

    out.push_str("\n[storage]\n");
    push_kv(
        &mut out,
        "state_dir",
        display_path(config.storage.state_dir.as_deref()),
    );

    out
}

/// Render the effective configuration as pretty-printed JSON.
pub fn render_config_json(config: &BridgeConfig, source: Option<&Path>) -> Result<String> {
    let value = json!({
        "source": source.map(|p| p.display().to_string()),
        "server": {
            "host": config.server.host,
            "port": config.server.port,
        },
        "scheduler": {
            "max_concurrent": config.scheduler.max_concurrent,
            "wait_minutes_per_position": config.scheduler.wait_minutes_per_position,
            "cancel_grace_secs": config.scheduler.cancel_grace_secs,
        },
        "session": {
            "program": config.session.program,
            "script": config.session.script,
            "args": config.session.args,
            "working_dir": config.session.working_dir.as_ref().map(|p| p.display().to_string()),
            "poll_interval_ms": config.session.poll_interval_ms,
            "env_passthrough": config.session.env_passthrough,
            "failure_sentinels": config.session.failure_sentinels,
        },
        "classifier": {
            "idle_threshold_ms": config.classifier.idle_threshold_ms,
            "multiline_idle_threshold_ms": config.classifier.multiline_idle_threshold_ms,
            "max_prompt_len": config.classifier.max_prompt_len,
            "history": config.classifier.history,
            "prompt_patterns": config.classifier.prompt_patterns,
            "restart_pattern": config.classifier.restart_pattern,
            "multiline_markers": config.classifier.multiline_markers,
            "multiline_prompt": config.classifier.multiline_prompt,
            "banner_markers": config.classifier.banner_markers,
        },
        "storage": {
            "state_dir": config.storage.state_dir.as_ref().map(|p| p.display().to_string()),
        },
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

fn push_kv(out: &mut String, key: &str, value: impl Display) {
    out.push_str(&format!("  {key:<28} {value}\n"));
}

fn join(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn display_path(path: Option<&Path>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => "(default)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_with_overrides() {
        let cli = Cli::parse_from(["drover", "serve", "--host", "0.0.0.0", "--port", "9000"]);
        match cli.command {
            Command::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verbose_flag_is_global_and_counted() {
        let cli = Cli::parse_from(["drover", "serve", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn run_rejects_inline_job_and_job_file_together() {
        let result =
            Cli::try_parse_from(["drover", "run", "--job", "{}", "--job-file", "job.json"]);
        assert!(result.is_err());
    }

    #[test]
    fn human_rendering_lists_every_section() {
        let rendered = render_config_human(&BridgeConfig::default(), None);
        for section in ["[server]", "[scheduler]", "[session]", "[classifier]", "[storage]"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("127.0.0.1"));
        assert!(rendered.contains("built-in defaults"));
    }

    #[test]
    fn human_rendering_names_the_source_file() {
        let rendered = render_config_human(
            &BridgeConfig::default(),
            Some(Path::new("/proj/.drover/config.toml")),
        );
        assert!(rendered.contains("/proj/.drover/config.toml"));
    }

    #[test]
    fn json_rendering_carries_all_sections() {
        let rendered =
            render_config_json(&BridgeConfig::default(), Some(Path::new("/tmp/config.toml")))
                .unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["source"], "/tmp/config.toml");
        assert_eq!(value["server"]["port"], 8100);
        assert_eq!(value["scheduler"]["max_concurrent"], 3);
        assert_eq!(value["session"]["program"], "python3");
        assert_eq!(value["classifier"]["history"], 10);
        assert!(value["storage"]["state_dir"].is_null());
    }
}
