pub(crate) use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints `error` the way a linker is expected to report failure, then exits
/// with a non-zero status.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("lode: error: {error:#}");
    std::process::exit(1);
}
