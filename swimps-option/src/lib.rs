//! Configuration shared between the swimps controller and the preload agent.
//!
//! The controller serialises an [`Options`] into the `SWIMPS_OPTIONS`
//! environment variable before exec'ing the target; the agent constructor
//! parses it back. The wire format is purely for that boundary: a sequence
//! of labelled fields, each terminated by `|`, in a fixed order.

use std::fmt::Write as _;

use swimps_log::LogLevel;
use thiserror::Error;

/// The environment variable the serialised options travel in.
pub const OPTIONS_ENVIRONMENT_VARIABLE: &str = "SWIMPS_OPTIONS";

const HELP_LABEL: &str = "help ";
const TUI_LABEL: &str = "tui ";
const PTRACE_LABEL: &str = "ptrace ";
const LOAD_LABEL: &str = "load ";
const LOG_LEVEL_LABEL: &str = "log-level ";
const SAMPLES_PER_SECOND_LABEL: &str = "samples-per-second ";
const TARGET_TRACE_FILE_LABEL: &str = "target-trace-file ";
const TARGET_PROGRAM_LABEL: &str = "target-program ";
const TARGET_PROGRAM_ARGS_LABEL: &str = "target-program-args ";

/// A complete configuration of swimps.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    pub help: bool,
    pub tui: bool,
    pub ptrace: bool,
    pub load: bool,
    pub log_level: LogLevel,
    pub samples_per_second: f64,
    pub target_trace_file: String,
    pub target_program: String,
    pub target_program_args: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            help: false,
            tui: true,
            ptrace: true,
            load: false,
            log_level: LogLevel::Info,
            samples_per_second: 1.0,
            target_trace_file: String::new(),
            target_program: String::new(),
            target_program_args: Vec::new(),
        }
    }
}

/// Why a serialised options string could not be parsed.
///
/// Any of these is fatal: a malformed `SWIMPS_OPTIONS` means the agent and
/// the controller disagree about the wire format.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OptionsParseError {
    #[error("expected the `{0}` field")]
    MissingField(&'static str),
    #[error("the `{0}` field has an invalid value")]
    InvalidValue(&'static str),
    #[error("the `{0}` field is not terminated")]
    UnterminatedField(&'static str),
}

impl Options {
    /// Renders the options in the wire format.
    pub fn serialise(&self) -> String {
        let mut out = String::new();

        serialise_flag(&mut out, HELP_LABEL, self.help);
        serialise_flag(&mut out, TUI_LABEL, self.tui);
        serialise_flag(&mut out, PTRACE_LABEL, self.ptrace);
        serialise_flag(&mut out, LOAD_LABEL, self.load);

        out.push_str(LOG_LEVEL_LABEL);
        out.push(match self.log_level {
            LogLevel::Debug => 'd',
            LogLevel::Info => 'i',
            LogLevel::Warning => 'w',
            LogLevel::Error => 'e',
            LogLevel::Fatal => 'f',
        });
        out.push('|');

        let _ = write!(
            out,
            "{}{}|",
            SAMPLES_PER_SECOND_LABEL, self.samples_per_second
        );
        let _ = write!(out, "{}{}|", TARGET_TRACE_FILE_LABEL, self.target_trace_file);
        let _ = write!(out, "{}{}|", TARGET_PROGRAM_LABEL, self.target_program);

        out.push_str(TARGET_PROGRAM_ARGS_LABEL);
        for argument in &self.target_program_args {
            out.push_str(argument);
            out.push('|');
        }

        out
    }

    /// Parses a wire format string produced by [`Options::serialise`].
    pub fn parse(mut input: &str) -> Result<Options, OptionsParseError> {
        let mut options = Options::default();

        options.help = parse_flag(&mut input, HELP_LABEL)?;
        options.tui = parse_flag(&mut input, TUI_LABEL)?;
        options.ptrace = parse_flag(&mut input, PTRACE_LABEL)?;
        options.load = parse_flag(&mut input, LOAD_LABEL)?;

        input = chomp_prefix(input, LOG_LEVEL_LABEL)?;
        let mut characters = input.chars();
        options.log_level = match characters.next() {
            Some('d') => LogLevel::Debug,
            Some('i') => LogLevel::Info,
            Some('w') => LogLevel::Warning,
            Some('e') => LogLevel::Error,
            Some('f') => LogLevel::Fatal,
            _ => return Err(OptionsParseError::InvalidValue("log-level")),
        };
        input = chomp_prefix(characters.as_str(), "|").map_err(|_| {
            OptionsParseError::UnterminatedField("log-level")
        })?;

        input = chomp_prefix(input, SAMPLES_PER_SECOND_LABEL)?;
        let (value, rest) = take_field(input, "samples-per-second")?;
        options.samples_per_second = value
            .parse()
            .map_err(|_| OptionsParseError::InvalidValue("samples-per-second"))?;
        input = rest;

        input = chomp_prefix(input, TARGET_TRACE_FILE_LABEL)?;
        let (value, rest) = take_field(input, "target-trace-file")?;
        options.target_trace_file = value.to_owned();
        input = rest;

        input = chomp_prefix(input, TARGET_PROGRAM_LABEL)?;
        let (value, rest) = take_field(input, "target-program")?;
        options.target_program = value.to_owned();
        input = rest;

        input = chomp_prefix(input, TARGET_PROGRAM_ARGS_LABEL)?;
        while !input.is_empty() {
            let (value, rest) = take_field(input, "target-program-args")?;
            if value.is_empty() {
                return Err(OptionsParseError::InvalidValue("target-program-args"));
            }

            options.target_program_args.push(value.to_owned());
            input = rest;
        }

        Ok(options)
    }
}

fn serialise_flag(out: &mut String, label: &str, value: bool) {
    out.push_str(label);
    out.push(if value { '1' } else { '0' });
    out.push('|');
}

fn parse_flag(input: &mut &str, label: &'static str) -> Result<bool, OptionsParseError> {
    let field_name = label.trim_end();

    let rest = chomp_prefix(*input, label)?;
    let mut characters = rest.chars();
    let value = match characters.next() {
        Some('1') => true,
        Some('0') => false,
        _ => return Err(OptionsParseError::InvalidValue(field_name)),
    };

    *input = chomp_prefix(characters.as_str(), "|")
        .map_err(|_| OptionsParseError::UnterminatedField(field_name))?;

    Ok(value)
}

fn chomp_prefix<'a>(input: &'a str, prefix: &'static str) -> Result<&'a str, OptionsParseError> {
    input
        .strip_prefix(prefix)
        .ok_or(OptionsParseError::MissingField(prefix.trim_end()))
}

fn take_field<'a>(
    input: &'a str,
    field_name: &'static str,
) -> Result<(&'a str, &'a str), OptionsParseError> {
    let end = input
        .find('|')
        .ok_or(OptionsParseError::UnterminatedField(field_name))?;

    Ok((&input[..end], &input[end + 1..]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_options_round_trip() {
        let original = Options::default();
        let converted = Options::parse(&original.serialise()).unwrap();

        assert_eq!(original, converted);
        assert!(!converted.help);
        assert!(converted.tui);
        assert!(converted.ptrace);
        assert!(!converted.load);
        assert_eq!(converted.log_level, LogLevel::Info);
        assert_eq!(converted.samples_per_second, 1.0);
        assert!(converted.target_trace_file.is_empty());
        assert!(converted.target_program.is_empty());
        assert!(converted.target_program_args.is_empty());
    }

    #[test]
    fn populated_options_round_trip() {
        let original = Options {
            help: true,
            tui: false,
            ptrace: false,
            load: false,
            log_level: LogLevel::Debug,
            samples_per_second: 42.0,
            target_trace_file: "amazing-swimps-trace-name".to_owned(),
            target_program: "programName".to_owned(),
            target_program_args: vec!["arg1".to_owned(), "arg2".to_owned(), "arg3".to_owned()],
        };

        let converted = Options::parse(&original.serialise()).unwrap();
        assert_eq!(original, converted);
    }

    #[test]
    fn fractional_sample_rates_round_trip() {
        let original = Options {
            samples_per_second: 0.5,
            ..Options::default()
        };

        let converted = Options::parse(&original.serialise()).unwrap();
        assert_eq!(original, converted);
    }

    #[test]
    fn unknown_fields_are_fatal() {
        let serialised = Options::default()
            .serialise()
            .replace("log-level", "log-kevel");

        assert_eq!(
            Options::parse(&serialised),
            Err(OptionsParseError::MissingField("log-level"))
        );
    }

    #[test]
    fn truncated_input_is_fatal() {
        let serialised = Options::default().serialise();
        let truncated = &serialised[..serialised.len() / 2];

        assert!(Options::parse(truncated).is_err());
    }

    #[test]
    fn empty_arguments_are_rejected() {
        let mut serialised = Options::default().serialise();
        serialised.push('|');

        assert_eq!(
            Options::parse(&serialised),
            Err(OptionsParseError::InvalidValue("target-program-args"))
        );
    }
}
