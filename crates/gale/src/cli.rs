use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Set a custom config file
	#[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Log at debug level
	#[arg(short, long, action = ArgAction::SetTrue)]
	pub debug: bool,

	/// Show current version
	#[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
	pub version: bool,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Initialize a new default configuration file
	Init {
		/// Where to write the configuration
		#[arg(short, long, value_name = "FILE", default_value = "gale.json")]
		output: PathBuf,
	},

	/// Validate a configuration file without starting
	Check {
		#[arg(value_name = "FILE")]
		file: PathBuf,
	},
}
