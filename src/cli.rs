use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "placy")]
#[command(about = "Stamp placeholder values into built artifacts: text, class files and archives")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON object of placeholder pairs
    #[arg(long, value_name = "FILE", global = true)]
    pub placeholders: Option<PathBuf>,

    #[arg(long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Rewrite a file, or every file under a directory
    Stamp {
        input: PathBuf,

        /// Output file (or directory for directory input); defaults to rewriting in place
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Placeholder pair, appended after the placeholder file's pairs
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_pair)]
        set: Vec<(String, String)>,

        /// Name used for classification instead of the input file name
        #[arg(long, value_name = "HINT")]
        name: Option<String>,

        /// Charset label for text payloads (e.g. utf-16le, windows-1252)
        #[arg(long, value_name = "LABEL")]
        charset: Option<String>,

        /// Stream the input as text without loading it into memory
        #[arg(long)]
        stream: bool,

        /// Recurse into containers nested inside containers
        #[arg(long)]
        nested: bool,

        #[arg(long, value_name = "N")]
        max_depth: Option<usize>,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Print how each file would be handled
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Print the constant pool of a class file
    Inspect {
        class_file: PathBuf,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Check the resolved placeholder map
    Validate {
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_pair)]
        set: Vec<(String, String)>,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

/// Splits `KEY=VALUE` at the first `=`. The value may be empty; the key may not.
pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing key in '{raw}'")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_at_the_first_equals_sign() {
        assert_eq!(
            parse_pair("${URL}=http://x?a=b").unwrap(),
            ("${URL}".to_string(), "http://x?a=b".to_string())
        );
        assert_eq!(parse_pair("K=").unwrap().1, "");
        assert!(parse_pair("=v").is_err());
        assert!(parse_pair("novalue").is_err());
    }

    #[test]
    fn global_options_work_after_the_subcommand() {
        let cli = Cli::parse_from([
            "placy", "stamp", "app.jar", "--set", "A=1", "--set", "B=2", "--threads", "4", "-vv",
        ]);
        assert_eq!(cli.threads, Some(4));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Stamp { set, format, .. } => {
                assert_eq!(set.len(), 2);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
