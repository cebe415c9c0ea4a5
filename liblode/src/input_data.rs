//! Opens and memory-maps the input files named on the command line, resolving
//! `-l` requests against the library search path.

use crate::args::Args;
use crate::args::Input;
use crate::bail;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::Context as _;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<Self> {
        let mut files = Vec::with_capacity(args.inputs.len());
        for input in &args.inputs {
            let path = match input {
                Input::File(path) => path.clone(),
                Input::Lib(name) => search_for_lib(&args.lib_search_path, name)?,
            };
            files.push(InputFile::new(path)?);
        }
        Ok(InputData { files })
    }
}

impl InputFile {
    fn new(filename: PathBuf) -> Result<Self> {
        let file = File::open(&filename)
            .with_context(|| format!("Failed to open input file `{}`", filename.display()))?;

        // Safety: The file could be modified while we're linking, giving us
        // torn reads. All linkers accept that risk for the mapping speedup.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map input file `{}`", filename.display()))?;

        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("Failed to parse input file `{}`", filename.display()))?;

        Ok(InputFile {
            filename,
            kind,
            bytes,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

fn search_for_lib(search_path: &[Box<Path>], name: &str) -> Result<PathBuf> {
    for dir in search_path {
        let candidate = dir.join(format!("lib{name}.a"));
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("Couldn't find library `lib{name}.a` on search path");
}
