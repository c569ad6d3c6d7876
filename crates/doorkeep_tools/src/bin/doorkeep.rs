#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use clap::Parser;

use doorkeep_contracts::UnixTimeNs;
use doorkeep_node::cloud::cloud_from_config;
use doorkeep_node::config::{cloud_config_from_env_var_map, ENV_CLOUD_KEY, ENV_CLOUD_URL};
use doorkeep_tools::dashboard_cli::{execute_block_command, execute_logs_command, Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(format!("failed to load .env: {err}"));
        }
    }
    let cli = Cli::parse();

    let url = env::var(ENV_CLOUD_URL).ok().filter(|v| !v.trim().is_empty());
    let env_key = env::var(ENV_CLOUD_KEY).ok().filter(|v| !v.trim().is_empty());
    let Some(url) = url else {
        return Err(format!("{ENV_CLOUD_URL} must be set to reach the cloud"));
    };
    let key = match env_key {
        Some(key) => key,
        None => read_secret_value(ENV_CLOUD_KEY)?,
    };

    let config = cloud_config_from_env_var_map(|name: &str| match name {
        ENV_CLOUD_URL => Some(url.clone()),
        ENV_CLOUD_KEY => Some(key.clone()),
        other => env::var(other).ok(),
    })
    .map_err(|e| e.to_string())?;
    let cloud = cloud_from_config(&config).map_err(|e| e.to_string())?;

    let output = match &cli.command {
        Command::Block(args) => execute_block_command(cloud.as_ref(), args, UnixTimeNs::now())?,
        Command::Logs(args) => execute_logs_command(cloud.as_ref(), args)?,
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_secret_value(key_id: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        let prompt = format!("Enter value for {key_id}:");
        let value = rpassword::prompt_password(prompt).map_err(|e| e.to_string())?;
        if value.trim().is_empty() {
            return Err(format!("{key_id} must not be empty"));
        }
        Ok(value.trim().to_string())
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        let trimmed = input.trim().to_string();
        if trimmed.is_empty() {
            return Err(format!("{key_id} must not be empty"));
        }
        Ok(trimmed)
    }
}
