//! `rucow` - a Cowgol cross-compiler for the 8080/Z80.

use anyhow::{Context, bail};
use clap::Parser;
use rucow::Options;
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "rucow", version, about = "Cowgol compiler targeting 8080/Z80")]
struct Cli {
  /// Input .cow source file.
  input: PathBuf,

  /// Output .mac assembly file; defaults to the input with its suffix
  /// replaced.
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Add an include search path. May be repeated.
  #[arg(short = 'I', long = "include")]
  include: Vec<PathBuf>,

  /// Run the AST optimizer.
  #[arg(short = 'O', long)]
  optimize: bool,

  /// Log every optimizer rewrite to stderr.
  #[arg(short = 'd', long)]
  debug_opt: bool,

  /// Dump the token stream and exit.
  #[arg(long)]
  dump_tokens: bool,

  /// Dump the parsed AST and exit.
  #[arg(long)]
  dump_ast: bool,
}

fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  if cli.debug_opt {
    tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_writer(std::io::stderr)
      .init();
  }

  let options = Options {
    include_dirs: cli.include.clone(),
    optimize: cli.optimize,
    debug_opt: cli.debug_opt,
  };

  if cli.dump_tokens {
    let tokens = rucow::preprocessor::preprocess(&cli.input, &options.include_dirs)
      .map_err(|e| anyhow::anyhow!("{e}"))?;
    for token in tokens {
      println!("{}: {:?} {:?}", token.pos, token.kind, token.text);
    }
    return Ok(());
  }

  if cli.dump_ast {
    let tokens = rucow::preprocessor::preprocess(&cli.input, &options.include_dirs)
      .map_err(|e| anyhow::anyhow!("{e}"))?;
    let program = rucow::parser::parse(tokens).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{program:#?}");
    return Ok(());
  }

  let output = match &cli.output {
    Some(path) => path.clone(),
    None => cli.input.with_extension("mac"),
  };
  if output == cli.input {
    bail!("output path equals the input path");
  }

  match rucow::compile_file(&cli.input, &options) {
    Ok(asm) => {
      fs::write(&output, asm)
        .with_context(|| format!("failed to write {}", output.display()))?;
      eprintln!("wrote {}", output.display());
      Ok(())
    }
    Err(diagnostics) => {
      eprintln!("{diagnostics}");
      process::exit(1);
    }
  }
}
