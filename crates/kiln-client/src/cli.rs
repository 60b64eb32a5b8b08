//! Command-line interface of the `kiln` client.

use clap::{Parser, Subcommand};
use url::Url;

/// Client for the Kiln compile server.
#[derive(Parser, Debug)]
#[command(name = "kiln", disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum CliCommand {
    /// Compiles on the server, starting one when none is running.
    Compile {
        /// Id correlating this compile with the server log.
        #[arg(long, default_value = "kiln")]
        id: String,
        /// Source the compile must translate (repeatable).
        #[arg(long = "source", value_name = "URI")]
        sources: Vec<Url>,
        /// Restricts what the compile may see (repeatable).
        #[arg(long = "visible", value_name = "URI")]
        visible: Vec<Url>,
        /// Compiler arguments; place them after `--`.
        #[arg(
            value_name = "ARG",
            num_args = 0..,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        arguments: Vec<String>,
    },
    /// Prints the capacity of the server host.
    Sysinfo,
    /// Asks the running server to stop.
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn compile_collects_sources_and_trailing_arguments() {
        let cli = Cli::try_parse_from([
            "kiln",
            "compile",
            "--id",
            "build-7",
            "--source",
            "file:///w/A.java",
            "--",
            "-d",
            "out",
            "A.java",
        ])
        .expect("valid command line");
        let CliCommand::Compile {
            id,
            sources,
            visible,
            arguments,
        } = cli.command
        else {
            panic!("expected the compile command");
        };
        assert_eq!(id, "build-7");
        assert_eq!(sources, [Url::parse("file:///w/A.java").expect("uri")]);
        assert!(visible.is_empty());
        assert_eq!(arguments, ["-d", "out", "A.java"]);
    }

    #[rstest]
    fn invalid_source_uri_is_rejected() {
        let error = Cli::try_parse_from(["kiln", "compile", "--source", "not a uri"])
            .expect_err("uri must parse");
        assert_eq!(error.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[rstest]
    #[case("sysinfo", CliCommand::Sysinfo)]
    #[case("stop", CliCommand::Stop)]
    fn parses_lifecycle_commands(#[case] name: &str, #[case] expected: CliCommand) {
        let cli = Cli::try_parse_from(["kiln", name]).expect("valid command line");
        assert_eq!(cli.command, expected);
    }
}
