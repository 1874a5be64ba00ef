mod run_cmd;
mod serve;

use anyhow::Result;
use console::style;

fn print_help() {
    println!("\n {}\n", style("crank — resumable maintenance script runner").bold());
    println!(" {}", style("Commands").bold());
    println!("   serve      Start the API service and scheduler");
    println!("   run        Run one script to completion from the terminal");
    println!("   scripts    List the registered scripts");
    println!();
    println!(" {}", style("Flags").bold());
    println!("   --config <path>      Config file (default: data dir crank.toml)");
    println!("   --api-host <host>    Bind host for serve");
    println!("   --api-port <port>    Bind port for serve");
    println!("   --script <id>        Script to run (run command)");
    println!("   --input <key=value>  Script input, repeatable (run command)");
    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("crank").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub script: String,
    pub input: Vec<(String, String)>,
    pub config: Option<String>,
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> RunCommandArgs {
    let mut script = String::new();
    let mut input = Vec::new();
    let mut config = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--script" | "-s" => {
                if i + 1 < args.len() {
                    script = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--input" | "-i" => {
                if i + 1 < args.len() {
                    if let Some((key, value)) = args[i + 1].split_once('=') {
                        input.push((key.to_string(), value.to_string()));
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    config = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    RunCommandArgs { script, input, config }
}

pub(crate) fn parse_serve_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16, Option<String>) {
    let mut config = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    config = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port, config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("serve") => serve::run(&args).await,
        Some("run") => run_cmd::run(&args).await,
        Some("scripts") => run_cmd::list(&args).await,
        _ => {
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_args_collect_script_and_inputs() {
        let args = to_args(&[
            "crank", "run", "--script", "prune-logs", "--input", "days=7", "--input", "dry=true",
        ]);
        let parsed = parse_run_command_args(&args, 2);
        assert_eq!(parsed.script, "prune-logs");
        assert_eq!(
            parsed.input,
            vec![
                ("days".to_string(), "7".to_string()),
                ("dry".to_string(), "true".to_string())
            ]
        );
    }

    #[test]
    fn serve_flags_override_defaults() {
        let args = to_args(&["crank", "serve", "--api-port", "9000", "--api-host", "0.0.0.0"]);
        let (host, port, config) =
            parse_serve_flags(&args, 2, "127.0.0.1".to_string(), 8712);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 9000);
        assert!(config.is_none());
    }

    #[test]
    fn bad_port_keeps_default() {
        let args = to_args(&["crank", "serve", "--api-port", "not-a-port"]);
        let (_, port, _) = parse_serve_flags(&args, 2, "127.0.0.1".to_string(), 8712);
        assert_eq!(port, 8712);
    }
}
