//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because we need to parse
//! arguments the same way as the other linkers on the platform we're
//! targeting. In particular, long arguments need to be accepted with a single
//! '-' in addition to the more common double-dash, and `-l`/`-L` accept their
//! value either attached or as the following argument.

use crate::arch::Architecture;
use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr as _;

pub struct Args {
    pub arch: Architecture,
    pub lib_search_path: Vec<Box<Path>>,
    pub inputs: Vec<Input>,
    pub output: PathBuf,
    pub output_kind: OutputKind,
    pub entry: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A statically linked executable with all relocations applied.
    Executable,

    /// A merged relocatable object (`-r`), suitable as input to a later link.
    Relocatable,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Input {
    /// A file named directly on the command line.
    File(PathBuf),

    /// `-l<name>`, to be searched for as `lib<name>.a` in the search path.
    Lib(String),
}

/// What the caller asked us to do.
pub enum Action {
    Link(Args),
    Version,
}

// These flags don't affect our behaviour. Like other modern linkers, we don't
// need groups in order to resolve cycles, and we only ever link statically.
const SILENTLY_IGNORED_FLAGS: &[&str] = &[
    "start-group",
    "end-group",
    "(",
    ")",
    "static",
    "Bstatic",
    "nostdlib",
    "no-pie",
    "gc-sections",
    "no-gc-sections",
];

impl Default for Args {
    fn default() -> Self {
        Args {
            arch: Architecture::X86_64,
            lib_search_path: Vec::new(),
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            output_kind: OutputKind::Executable,
            entry: "_start".to_owned(),
        }
    }
}

/// Parse the supplied input arguments, which should not include the program
/// name.
pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut args = Args::default();

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        fn strip_option(arg: &str) -> Option<&str> {
            arg.strip_prefix("--").or(arg.strip_prefix('-'))
        }
        let long_arg_eq = |option: &str| strip_option(arg) == Some(option);
        let long_arg_split_prefix = |option: &str| -> Option<&str> {
            debug_assert!(option.ends_with('='));
            strip_option(arg).and_then(|stripped_arg| stripped_arg.strip_prefix(option))
        };

        if let Some(rest) = arg.strip_prefix("-L") {
            if rest.is_empty() {
                let next = input.next().context("Missing argument to -L")?;
                args.lib_search_path.push(Box::from(Path::new(next.as_ref())));
            } else {
                args.lib_search_path.push(Box::from(Path::new(rest)));
            }
        } else if let Some(rest) = arg.strip_prefix("-l") {
            let name = if rest.is_empty() {
                input
                    .next()
                    .context("Missing argument to -l")?
                    .as_ref()
                    .to_owned()
            } else {
                rest.to_owned()
            };
            args.inputs.push(Input::Lib(name));
        } else if arg == "-o" {
            args.output = input
                .next()
                .map(|a| PathBuf::from(a.as_ref()))
                .context("Missing argument to -o")?;
        } else if let Some(rest) = long_arg_split_prefix("output=") {
            args.output = PathBuf::from(rest);
        } else if arg == "-r" || long_arg_eq("relocatable") {
            args.output_kind = OutputKind::Relocatable;
        } else if arg == "-m" {
            let arg_value = input.next().context("Missing argument to -m")?;
            args.arch = Architecture::from_str(arg_value.as_ref())?;
        } else if let Some(arg_value) = arg.strip_prefix("-m") {
            args.arch = Architecture::from_str(arg_value)?;
        } else if arg == "-e" || long_arg_eq("entry") {
            args.entry = input
                .next()
                .context("Missing argument to --entry")?
                .as_ref()
                .to_owned();
        } else if let Some(rest) = long_arg_split_prefix("entry=") {
            args.entry = rest.to_owned();
        } else if long_arg_eq("EB") {
            bail!("Big-endian target is not supported");
        } else if long_arg_eq("version") || arg == "-V" {
            return Ok(Action::Version);
        } else if strip_option(arg)
            .is_some_and(|stripped| SILENTLY_IGNORED_FLAGS.contains(&stripped))
        {
        } else if arg.starts_with('-') {
            bail!("Unrecognised argument `{arg}`");
        } else {
            args.inputs.push(Input::File(PathBuf::from(arg)));
        }
    }

    if args.inputs.is_empty() {
        bail!("no input files");
    }

    Ok(Action::Link(args))
}
