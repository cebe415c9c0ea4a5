#[cfg(feature = "mimalloc")]
#[global_allocator]
static MIMALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(error) = run() {
        liblode::error::report_error_and_exit(&error)
    }
}

fn run() -> liblode::error::Result {
    match liblode::args::parse(std::env::args().skip(1))? {
        liblode::args::Action::Link(args) => liblode::run(&args),
        liblode::args::Action::Version => {
            println!("lode {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
