fn main() {
    if let Err(e) = punch_recorder::run() {
        log::error!("Recorder failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
