use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use llama2_inference::{InferenceConfigBuilder, MatmulKernel, TurnSource, run_inference};
use log::error;

/// Define the command line arguments.
fn inference_command() -> Command {
    Command::new("llama2")
        .about("Llama 2 inference in Rust")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Tokenizer file")
                .default_value("tokenizer.bin"),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], default 1.0")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.9")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, (default) = current time")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of steps to run for, 0 = max_seq_len")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat [default: generate]")
                .default_value("generate"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("system")
                .short('y')
                .long("system")
                .value_name("STRING")
                .help("System prompt in chat mode"),
        )
        .arg(
            Arg::new("kernel")
                .short('k')
                .long("kernel")
                .value_name("STRING")
                .help("Matmul kernel: scalar|lanes [default: lanes]")
                .default_value("lanes")
                .value_parser(clap::value_parser!(MatmulKernel)),
        )
}

/// Reads chat turns interactively from stdin.
struct StdinTurns {
    stdin: io::Stdin,
}

impl StdinTurns {
    fn read_line(&self, guide: &str) -> Option<String> {
        print!("{guide}");
        io::stdout().flush().ok()?;

        let mut input = String::new();
        match self.stdin.lock().read_line(&mut input) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(input.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

impl TurnSource for StdinTurns {
    fn system_prompt(&mut self) -> Option<String> {
        self.read_line("Enter system prompt (optional): ")
    }

    fn user_prompt(&mut self) -> Option<String> {
        self.read_line("User: ")
    }
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .system_prompt(matches.get_one::<String>("system"))
        .kernel(matches.get_one::<MatmulKernel>("kernel").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut turns = StdinTurns { stdin: io::stdin() };

    run_inference(config, &mut turns).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let matches = inference_command().get_matches();

    run_inference_command(&matches)
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
