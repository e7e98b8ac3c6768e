//! keyward CLI — local access to the secrets vault.
//!
//! Subcommand layout follows `envvault`'s `cli/commands/*.rs` convention:
//! one function per subcommand, a shared password prompt, and a `run`
//! command that injects decrypted secrets into a child process's
//! environment and forwards its exit status (§6 "CLI surface").

use clap::{Parser, Subcommand};
use keyward::config::KernelConfig;
use keyward::lifecycle::Kernel;
use std::process::{Command, ExitCode};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "keyward", about = "A local, single-user secrets manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Vault directory (default: platform data dir / ~/.keyward)
    #[arg(long, global = true)]
    vault_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all projects and their secret counts
    List,
    /// Print one secret's value
    Get { project: String, key: String },
    /// Create or update a secret
    Set { project: String, key: String, value: String },
    /// Run a command with a project's secrets injected into its environment
    Run {
        #[arg(long)]
        project: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn prompt_password(prompt: &str) -> Zeroizing<String> {
    if let Ok(pw) = std::env::var("KEYWARD_PASSWORD") {
        if !pw.is_empty() {
            return Zeroizing::new(pw);
        }
    }
    let pw = dialoguer::Password::new().with_prompt(prompt).interact().unwrap_or_default();
    Zeroizing::new(pw)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let vault_dir = cli
        .vault_dir
        .map(std::path::PathBuf::from)
        .unwrap_or_else(KernelConfig::default_vault_dir);
    let kernel = Kernel::new(KernelConfig::new(vault_dir));

    let result = match &cli.command {
        Commands::List => run_list(&kernel),
        Commands::Get { project, key } => run_get(&kernel, project, key),
        Commands::Set { project, key, value } => run_set(&kernel, project, key, value),
        Commands::Run { project, command } => return run_child(&kernel, project, command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn unlock_or_setup(kernel: &Kernel) -> Result<(), String> {
    if kernel.vault.exists() {
        let password = prompt_password("Vault password");
        kernel.unlock(&password).map_err(|e| e.to_string())
    } else {
        let password = prompt_password("Choose a vault password");
        kernel.setup(&password).map_err(|e| e.to_string())
    }
}

fn run_list(kernel: &Kernel) -> Result<(), String> {
    unlock_or_setup(kernel)?;
    let projects = kernel.vault.get_projects().map_err(|e| e.to_string())?;
    for project in projects {
        println!("{}\t{} secrets", project.name, project.secret_count);
    }
    kernel.lock(true).map_err(|e| e.to_string())
}

fn run_get(kernel: &Kernel, project: &str, key: &str) -> Result<(), String> {
    unlock_or_setup(kernel)?;
    let secret = kernel.vault.get_secret(project, key).map_err(|e| e.to_string());
    kernel.lock(true).map_err(|e| e.to_string())?;
    println!("{}", secret?.value);
    Ok(())
}

fn run_set(kernel: &Kernel, project: &str, key: &str, value: &str) -> Result<(), String> {
    unlock_or_setup(kernel)?;
    if kernel.vault.get_projects().map_err(|e| e.to_string())?.iter().all(|p| p.name != project) {
        kernel.vault.create_project(project).map_err(|e| e.to_string())?;
    }
    let result = kernel.vault.set_secret(project, key, value, None).map_err(|e| e.to_string());
    kernel.lock(true).map_err(|e| e.to_string())?;
    result
}

fn run_child(kernel: &Kernel, project: &str, command: &[String]) -> ExitCode {
    let Some((program, args)) = command.split_first() else {
        eprintln!("error: no command specified after `--`");
        return ExitCode::FAILURE;
    };

    if let Err(e) = unlock_or_setup(kernel) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    let secrets = kernel.vault.get_secrets(project).map_err(|e| e.to_string());
    let _ = kernel.lock(true);

    let secrets = match secrets {
        Ok(secrets) => secrets,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut child = Command::new(program);
    child.args(args);
    for (key, view) in &secrets {
        child.env(key, &view.value);
    }

    match child.status() {
        Ok(status) => {
            let code = status.code().unwrap_or(1);
            ExitCode::from(code.clamp(0, 255) as u8)
        }
        Err(e) => {
            eprintln!("error: failed to launch child process: {e}");
            ExitCode::FAILURE
        }
    }
}
