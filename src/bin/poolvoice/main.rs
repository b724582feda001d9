use std::io::Write;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use poolvoice::config::{API_KEY_ENV_VARS, Config, DeviceRole};
use poolvoice::error::VoiceError;

#[derive(Parser)]
#[command(
    name = "poolvoice",
    about = "Talk to your pool advisor",
    long_about = "Poolvoice holds a live, hands-free voice conversation with an AI \
        savings advisor. Your microphone is streamed to the voice service as 16-bit \
        PCM and the advisor's spoken replies are played back as they arrive. Talking \
        over the advisor interrupts it, just like a phone call."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/poolvoice/config.yaml if not specified.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the poolvoice crate, showing session
    /// state changes, capture frames and playback scheduling.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice conversation (foreground)
    ///
    /// Opens the microphone and speakers, connects to the voice service and
    /// streams audio both ways. Runs until interrupted with Ctrl+C or until
    /// the service ends the session.
    Talk,

    /// List available audio devices
    ///
    /// Shows the input and output devices recognized by the system. Use
    /// --set-input or --set-output to save a device name to your config
    /// file, or --pick to choose interactively.
    Devices {
        /// Write this input device name to the config file
        #[arg(long, conflicts_with = "pick")]
        set_input: Option<String>,

        /// Write this output device name to the config file
        #[arg(long, conflicts_with = "pick")]
        set_output: Option<String>,

        /// Interactively pick input and output devices
        #[arg(long)]
        pick: bool,
    },

    /// Create a new configuration file
    ///
    /// Walks through picking audio devices, the advisor voice and an API
    /// key. With --defaults, writes every default without asking.
    Init {
        /// Write the default configuration without prompting
        #[arg(long)]
        defaults: bool,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.as_ref().map_or_else(Config::default_path, |path| {
        Config::expand_path(&path.to_string_lossy())
    })
}

fn load_config(cli: &Cli) -> Result<Config, VoiceError> {
    Config::load(&config_path(cli))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("poolvoice=debug,info")
    } else {
        EnvFilter::new("poolvoice=info,warn")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Auto-install shell completions for `$SHELL` if the completion file does not
/// already exist. Errors are ignored so that missing dirs or unsupported
/// shells never block normal operation.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("poolvoice"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_poolvoice"))
    } else if shell_env.ends_with("/fish") {
        (Shell::Fish, home.join(".config/fish/completions/poolvoice.fish"))
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "poolvoice", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: Cli) -> Result<(), VoiceError> {
    match cli.command {
        Command::Talk => {
            let config = load_config(&cli)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(poolvoice::live::run_live_session(config))
        }
        Command::Devices {
            ref set_input,
            ref set_output,
            pick,
        } => run_devices(&cli, set_input.as_deref(), set_output.as_deref(), pick),
        Command::Init { defaults } => run_init(&cli, defaults),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "poolvoice", &mut std::io::stdout());
            Ok(())
        }
    }
}

struct DeviceList {
    names: Vec<String>,
    default_name: Option<String>,
}

fn list_devices(role: DeviceRole) -> Result<DeviceList, VoiceError> {
    let (names, default_name) = match role {
        DeviceRole::Input => (
            poolvoice::audio::capture::list_input_devices()?,
            poolvoice::audio::capture::default_input_device_name(),
        ),
        DeviceRole::Output => (
            poolvoice::audio::playback::list_output_devices()?,
            poolvoice::audio::playback::default_output_device_name(),
        ),
    };
    Ok(DeviceList {
        names,
        default_name,
    })
}

const fn role_label(role: DeviceRole) -> &'static str {
    match role {
        DeviceRole::Input => "input",
        DeviceRole::Output => "output",
    }
}

fn print_device_list(devices: &DeviceList) {
    for (i, name) in devices.names.iter().enumerate() {
        let marker = if devices.default_name.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices(
    cli: &Cli,
    set_input: Option<&str>,
    set_output: Option<&str>,
    pick: bool,
) -> Result<(), VoiceError> {
    let path = config_path(cli);

    if set_input.is_some() || set_output.is_some() {
        for (role, name) in [(DeviceRole::Input, set_input), (DeviceRole::Output, set_output)] {
            if let Some(name) = name {
                Config::set_audio_device(&path, role, name)?;
                println!("Set audio {} device to: {name}", role_label(role));
            }
        }
        return Ok(());
    }

    for role in [DeviceRole::Input, DeviceRole::Output] {
        let devices = list_devices(role)?;
        if devices.names.is_empty() {
            println!("No audio {} devices found.", role_label(role));
            continue;
        }

        println!("Audio {} devices:", role_label(role));
        print_device_list(&devices);

        if pick && let Some(selected) = pick_device(&devices)? {
            Config::set_audio_device(&path, role, &selected)?;
            println!("Set audio {} device to: {selected}", role_label(role));
        }
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Prompt helpers
// ---------------------------------------------------------------------------

fn prompt(msg: &str) -> Result<String, VoiceError> {
    print!("{msg}");
    std::io::stdout()
        .flush()
        .map_err(|e| VoiceError::Other(format!("failed to flush stdout: {e}")))?;
    let mut buf = String::new();
    std::io::stdin()
        .read_line(&mut buf)
        .map_err(|e| VoiceError::Other(format!("failed to read input: {e}")))?;
    Ok(buf.trim().to_string())
}

fn prompt_default(msg: &str, default: &str) -> Result<String, VoiceError> {
    let input = prompt(&format!("{msg} [{default}]: "))?;
    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input)
    }
}

fn prompt_yes_no(msg: &str, default_yes: bool) -> Result<bool, VoiceError> {
    let hint = if default_yes { "Y/n" } else { "y/N" };
    let input = prompt(&format!("{msg} [{hint}]: "))?;
    if input.is_empty() {
        return Ok(default_yes);
    }
    match input.to_lowercase().as_str() {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        _ => Ok(default_yes),
    }
}

/// Returns `None` when the user presses Enter to skip.
fn pick_device(devices: &DeviceList) -> Result<Option<String>, VoiceError> {
    let input = prompt(&format!(
        "Select device [1-{}] (Enter to skip): ",
        devices.names.len()
    ))?;
    if input.is_empty() {
        return Ok(None);
    }

    let choice: usize = input
        .parse()
        .map_err(|_| VoiceError::Other("invalid selection: enter a number".to_string()))?;
    if choice < 1 || choice > devices.names.len() {
        return Err(VoiceError::Other(format!(
            "selection out of range: pick 1-{}",
            devices.names.len()
        )));
    }
    Ok(Some(devices.names[choice - 1].clone()))
}

// ---------------------------------------------------------------------------
// poolvoice init
// ---------------------------------------------------------------------------

fn run_init(cli: &Cli, defaults: bool) -> Result<(), VoiceError> {
    let path = config_path(cli);

    if path.exists() {
        let overwrite = prompt_yes_no(
            &format!("Config file already exists at {}. Overwrite?", path.display()),
            false,
        )?;
        if !overwrite {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut config = Config::default();

    if !defaults {
        for role in [DeviceRole::Input, DeviceRole::Output] {
            println!();
            if !prompt_yes_no(&format!("Pick an audio {} device?", role_label(role)), false)? {
                continue;
            }
            let devices = list_devices(role)?;
            if devices.names.is_empty() {
                println!("No audio {} devices found, skipping.", role_label(role));
                continue;
            }
            print_device_list(&devices);
            let selected = pick_device(&devices)?;
            match role {
                DeviceRole::Input => config.audio.input_device = selected,
                DeviceRole::Output => config.audio.output_device = selected,
            }
        }

        println!();
        config.service.voice = prompt_default("Advisor voice", &config.service.voice)?;

        println!();
        let api_key = prompt(&format!(
            "API key (Enter to read it from ${} instead): ",
            API_KEY_ENV_VARS.join(" or $")
        ))?;
        if !api_key.is_empty() {
            config.service.api_key = Some(api_key);
        }
    }

    config.write(&path)?;

    println!();
    println!("Config written to {}", path.display());
    println!("Run `poolvoice talk` to start a conversation.");

    Ok(())
}
