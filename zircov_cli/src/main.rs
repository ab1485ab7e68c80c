use zircov_core::config::ExecutorConfig;
use zircov_core::report::{
    CALL_FLAG_BLOCKED, CALL_FLAG_EXECUTED, CALL_FLAG_FAULT_INJECTED, CALL_FLAG_FINISHED, Reply,
    ReplyReader,
};
use zircov_core::snapshot;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Log at debug level.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarise the kernel PC table.
    Pcs {
        /// Table to read instead of the configured one.
        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Print the records of a reply stream.
    Decode {
        input: PathBuf,
        /// One JSON object per record.
        #[clap(long)]
        json: bool,
        /// Also print the signal PCs.
        #[clap(long)]
        pcs: bool,
    },
    /// Enable coverage on this thread and report one empty call.
    Probe,
}

fn load_config(path: Option<PathBuf>) -> Result<ExecutorConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            ExecutorConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("zircov.toml");
            if default_config_path.exists() {
                log::info!("Loading default configuration: {default_config_path:?}");
                ExecutorConfig::load_from_file(&default_config_path)
            } else {
                log::debug!("No config file found, using built-in defaults.");
                Ok(ExecutorConfig::default())
            }
        }
    }
}

fn summarise_pcs(config: &ExecutorConfig, file: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let path = file.unwrap_or_else(|| config.coverage.pcs_file.clone());
    let mut table = vec![0u64; config.coverage.capacity];
    let n = snapshot::read_location_table(&path, &mut table)?;
    let instrumented: Vec<u64> = table[..n].iter().copied().filter(|&pc| pc != 0).collect();

    println!("{}: {} slots, {} instrumented", path.display(), n, instrumented.len());
    if let (Some(lo), Some(hi)) = (instrumented.iter().min(), instrumented.iter().max()) {
        println!("  pc range: {lo:#x}..={hi:#x}");
    }
    Ok(())
}

fn flag_names(flags: u32) -> Vec<&'static str> {
    [
        (CALL_FLAG_EXECUTED, "executed"),
        (CALL_FLAG_FINISHED, "finished"),
        (CALL_FLAG_BLOCKED, "blocked"),
        (CALL_FLAG_FAULT_INJECTED, "fault-injected"),
    ]
    .into_iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| name)
    .collect()
}

fn decode(input: PathBuf, json: bool, show_pcs: bool) -> Result<(), anyhow::Error> {
    let file = File::open(&input).with_context(|| format!("Failed to open {input:?}"))?;
    let mut count = 0usize;
    for reply in ReplyReader::new(BufReader::new(file)) {
        let reply = reply.with_context(|| format!("Bad record #{count} in {input:?}"))?;
        count += 1;
        if json {
            println!("{}", serde_json::to_string(&reply)?);
            continue;
        }
        match reply {
            Reply::Call {
                reply,
                signal,
                cover,
            } => {
                println!(
                    "call index={} num={} errno={} flags=[{}] signal={} cover={}",
                    reply.body.call_index,
                    reply.body.call_num,
                    reply.body.reserrno,
                    flag_names(reply.body.flags).join(","),
                    signal.len(),
                    cover.len()
                );
                if show_pcs {
                    for pc in &signal {
                        println!("  {pc:#010x}");
                    }
                }
            }
            Reply::Completed { status } => println!("done status={status}"),
        }
    }
    log::info!("{count} records decoded");
    Ok(())
}

#[cfg(target_os = "fuchsia")]
fn probe(config: &ExecutorConfig) -> Result<(), anyhow::Error> {
    use std::io::Write;
    use zircov_core::executor::{LastScheduled, Worker, shared_writer};
    use zircov_core::kernel::zircon::ZirconKernel;
    use zircov_core::report::ReplyWriter;

    let out: Box<dyn Write + Send> = match &config.output.path {
        Some(path) => Box::new(File::create(path).with_context(|| format!("{path:?}"))?),
        None => Box::new(std::io::stdout()),
    };
    let channel = shared_writer(ReplyWriter::new(out, config.coverage.report_flags()));
    let mut worker = Worker::from_settings(
        0,
        ZirconKernel::new(),
        &config.coverage,
        channel.clone(),
        LastScheduled::new(),
    )
    .unwrap_or_else(|e| zircov_core::fail(e));
    worker
        .execute_with(0, 0, false, || 0)
        .unwrap_or_else(|e| zircov_core::fail(e));
    if let Some(ctx) = worker.coverage() {
        log::info!(
            "probe: {} pc table entries, {} hits",
            ctx.total_locations(),
            ctx.result().size
        );
    }
    channel
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .write_completed(0)
        .unwrap_or_else(|e| zircov_core::fail(e));
    Ok(())
}

#[cfg(not(target_os = "fuchsia"))]
fn probe(_config: &ExecutorConfig) -> Result<(), anyhow::Error> {
    anyhow::bail!("the Zircon coverage backend is only available on Fuchsia")
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = load_config(cli.config_file)?;
    log::debug!("Effective configuration: {config:#?}");

    match cli.command {
        Command::Pcs { file } => summarise_pcs(&config, file),
        Command::Decode { input, json, pcs } => decode(input, json, pcs),
        Command::Probe => probe(&config),
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        zircov_core::fail(format!("{e:#}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names_follow_bit_order() {
        assert_eq!(
            flag_names(CALL_FLAG_EXECUTED | CALL_FLAG_FINISHED | CALL_FLAG_FAULT_INJECTED),
            vec!["executed", "finished", "fault-injected"]
        );
        assert!(flag_names(0).is_empty());
    }

    #[test]
    fn cli_parses_decode_arguments() {
        let cli = Cli::parse_from(["zircov", "-v", "decode", "replies.bin", "--json"]);
        assert!(cli.verbose);
        match cli.command {
            Command::Decode { input, json, pcs } => {
                assert_eq!(input, PathBuf::from("replies.bin"));
                assert!(json);
                assert!(!pcs);
            }
            other => panic!("Expected Decode, got {other:?}"),
        }
    }
}
