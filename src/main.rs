fn main() {
    if let Err(err) = fpsim::run() {
        eprintln!("fpsimserver: {err:#}");
        std::process::exit(1);
    }
}
